//! Call signaling state machine.
//!
//! A session moves through `Registered -> Calling/Invited -> Negotiating ->
//! Active` and back to `Registered` on teardown. Everything mutable lives in
//! [`CallCoordinator`]; a call pair's media state is serialized through its
//! shared [`CallPipeline`].

use std::sync::Arc;

use dashmap::DashMap;
use metrics::{counter, gauge};
use tracing::{debug, error, info, warn};

use crate::candidates::CandidateBuffer;
use crate::error::{CallError, MediaError};
use crate::hub::ConnectionHub;
use crate::media::{CandidateObserver, MediaEndpoint, MediaPipeline, MediaServer};
use crate::pipeline::CallPipeline;
use crate::registry::{Session, SessionRegistry};
use crate::signaling::{
    CallDecision, ClientMessage, IceCandidate, Response, ServerMessage, SessionId,
};

const DECLINED: &str = "user declined";
const REMOTE_HANGUP: &str = "remote user hanged out";

pub struct CallCoordinator {
    registry: SessionRegistry,
    candidates: CandidateBuffer,
    pipelines: DashMap<SessionId, Arc<CallPipeline>>,
    media: Arc<dyn MediaServer>,
    hub: ConnectionHub,
}

impl CallCoordinator {
    pub fn new(media: Arc<dyn MediaServer>, hub: ConnectionHub) -> Self {
        Self {
            registry: SessionRegistry::new(),
            candidates: CandidateBuffer::new(),
            pipelines: DashMap::new(),
            media,
            hub,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn candidates(&self) -> &CandidateBuffer {
        &self.candidates
    }

    pub fn hub(&self) -> &ConnectionHub {
        &self.hub
    }

    pub fn pipeline_for(&self, session_id: &str) -> Option<Arc<CallPipeline>> {
        self.pipelines.get(session_id).map(|entry| entry.value().clone())
    }

    /// Whether `user_id` is registered on a connection that is still open.
    pub fn is_user_online(&self, user_id: &str) -> bool {
        self.registry
            .lookup_by_user(user_id)
            .map(|session| self.hub.is_connected(&session.id))
            .unwrap_or(false)
    }

    /// Route one inbound event. Errors have already been reported to the
    /// affected party when this returns; callers only need to log them.
    pub async fn handle(&self, session_id: &str, message: ClientMessage) -> Result<(), CallError> {
        match message {
            ClientMessage::Register {
                user_id,
                name,
                avatar,
            } => {
                let user_id = user_id
                    .filter(|id| !id.trim().is_empty())
                    .unwrap_or_else(|| name.clone());
                self.register(session_id, &user_id, &name, avatar)
            }
            ClientMessage::Call {
                to,
                from,
                sdp_offer,
            } => self.call(session_id, &to, from.as_deref(), sdp_offer),
            ClientMessage::IncomingCallResponse {
                from,
                call_response,
                sdp_offer,
            } => {
                self.incoming_call_response(session_id, from.as_deref(), call_response, sdp_offer)
                    .await
            }
            ClientMessage::Stop => {
                self.stop(session_id).await;
                Ok(())
            }
            ClientMessage::OnIceCandidate { candidate } => {
                self.on_ice_candidate(session_id, candidate).await;
                Ok(())
            }
            ClientMessage::OnCallerReject { callee_user_id } => {
                self.on_caller_reject(session_id, &callee_user_id)
            }
            ClientMessage::Leave => {
                self.disconnect(session_id).await;
                Ok(())
            }
            ClientMessage::Ping => {
                self.hub.touch(session_id);
                self.hub.send(session_id, ServerMessage::Pong)?;
                Ok(())
            }
            ClientMessage::Message { to, payload } => self.relay(session_id, &to, |sender| {
                ServerMessage::Message {
                    from: sender.user_id,
                    payload,
                }
            }),
            ClientMessage::Chat { to, text } => self.relay(session_id, &to, |sender| {
                ServerMessage::Chat {
                    from: sender.user_id,
                    text,
                }
            }),
            ClientMessage::StartClient { to, payload } => {
                self.relay(session_id, &to, |sender| ServerMessage::ReceiveCall {
                    from: sender.user_id,
                    name: sender.display_name,
                    payload,
                })
            }
            ClientMessage::AcceptCall { caller_id, payload } => {
                self.relay(session_id, &caller_id, |sender| ServerMessage::AcceptCall {
                    from: sender.user_id,
                    payload,
                })
            }
            ClientMessage::EjectCall { caller_id } => {
                self.relay(session_id, &caller_id, |sender| ServerMessage::EjectCall {
                    from: sender.user_id,
                })
            }
            ClientMessage::RemoveCall { caller_id } => {
                self.relay(session_id, &caller_id, |sender| ServerMessage::RemoveCall {
                    from: sender.user_id,
                })
            }
        }
    }

    /// Forward a direct event from a registered session to user `to`. These
    /// never touch call state; the sender is told when `to` cannot be reached.
    pub fn relay(
        &self,
        session_id: &str,
        to: &str,
        build: impl FnOnce(Session) -> ServerMessage,
    ) -> Result<(), CallError> {
        let sender = self.require_session(session_id)?;
        let outcome = match self.registry.lookup_by_user(to) {
            Some(target) => {
                let message = build(sender);
                let event = message.name();
                self.hub
                    .send(&target.id, message)
                    .map(|_| event)
                    .map_err(CallError::from)
            }
            None => Err(CallError::UnknownTarget(to.to_string())),
        };
        match outcome {
            Ok(event) => {
                debug!(session_id, to, event, "relayed direct event");
                counter!("beach_call_relayed_total", "event" => event).increment(1);
                Ok(())
            }
            Err(err) => {
                debug!(session_id, to, error = %err, "direct event not relayed");
                self.deliver(
                    session_id,
                    ServerMessage::Error {
                        message: err.to_string(),
                    },
                );
                Err(err)
            }
        }
    }

    pub fn register(
        &self,
        session_id: &str,
        user_id: &str,
        name: &str,
        avatar: Option<String>,
    ) -> Result<(), CallError> {
        match self.registry.register(session_id, user_id, name, avatar) {
            Ok(_) => {
                info!(session_id, user_id, "user registered");
                counter!("beach_call_registrations_total", "outcome" => "accepted").increment(1);
                gauge!("beach_call_sessions_registered").set(self.registry.len() as f64);
                self.deliver(
                    session_id,
                    ServerMessage::RegisterResponse {
                        response: Response::Accepted,
                        message: None,
                    },
                );
                Ok(())
            }
            Err(err) => {
                warn!(session_id, user_id, error = %err, "registration rejected");
                counter!("beach_call_registrations_total", "outcome" => "rejected").increment(1);
                self.deliver(
                    session_id,
                    ServerMessage::RegisterResponse {
                        response: Response::Rejected,
                        message: Some(err.to_string()),
                    },
                );
                Err(err.into())
            }
        }
    }

    /// Invite `to`. Peer pointers are set provisionally and are not rolled
    /// back if the invite cannot be delivered.
    pub fn call(
        &self,
        caller_id: &str,
        to: &str,
        from: Option<&str>,
        sdp_offer: String,
    ) -> Result<(), CallError> {
        self.candidates.clear(caller_id);
        let caller = self.require_session(caller_id)?;
        let from = from
            .filter(|from| !from.is_empty())
            .unwrap_or(&caller.user_id)
            .to_string();

        let Some(callee) = self.registry.lookup_by_user(to) else {
            let err = CallError::UnknownTarget(to.to_string());
            info!(session_id = caller_id, to, "call to unregistered user");
            counter!("beach_call_calls_total", "outcome" => "unknown_target").increment(1);
            self.deliver(caller_id, ServerMessage::call_rejected(err.to_string()));
            return Err(err);
        };

        self.registry.update(caller_id, |session| {
            session.pending_offer = Some(sdp_offer);
            session.peer = Some(to.to_string());
        });
        self.registry
            .update(&callee.id, |session| session.peer = Some(from.clone()));

        let invite = ServerMessage::IncomingCall {
            from: from.clone(),
            caller_name: caller.display_name.clone(),
            caller_avatar: caller.avatar.clone(),
        };
        if let Err(err) = self.hub.send(&callee.id, invite) {
            let err = CallError::from(err);
            warn!(session_id = caller_id, to, error = %err, "invite delivery failed");
            counter!("beach_call_calls_total", "outcome" => "undeliverable").increment(1);
            self.deliver(caller_id, ServerMessage::call_rejected(err.to_string()));
            return Err(err);
        }

        info!(session_id = caller_id, from = %from, to, "invite sent");
        Ok(())
    }

    pub async fn incoming_call_response(
        &self,
        callee_id: &str,
        from: Option<&str>,
        decision: CallDecision,
        callee_offer: Option<String>,
    ) -> Result<(), CallError> {
        self.candidates.clear(callee_id);
        let callee = self.require_session(callee_id)?;

        let from = from.unwrap_or_default();
        let caller = if from.is_empty() {
            None
        } else {
            self.registry.lookup_by_user(from)
        };
        let Some(caller) = caller else {
            // Nobody to tell on the calling side.
            let err = CallError::UnknownCaller(from.to_string());
            warn!(session_id = callee_id, from, "answer for unknown caller");
            self.deliver(callee_id, ServerMessage::stop_communication(err.to_string()));
            return Err(err);
        };

        match decision {
            CallDecision::Reject => {
                info!(caller = %caller.user_id, callee = %callee.user_id, "call declined");
                counter!("beach_call_calls_total", "outcome" => "declined").increment(1);
                self.deliver(&caller.id, ServerMessage::call_rejected(DECLINED));
                Ok(())
            }
            CallDecision::Accept => {
                self.accept(caller, callee, callee_offer.unwrap_or_default())
                    .await
            }
        }
    }

    async fn accept(
        &self,
        caller: Session,
        callee: Session,
        callee_offer: String,
    ) -> Result<(), CallError> {
        // Both entries exist before the first await so a concurrent stop from
        // either side finds the call and cancels it.
        let call = CallPipeline::new(&caller.id, &callee.id);
        let mut replaced: Vec<Arc<CallPipeline>> = Vec::new();
        for session_id in [&caller.id, &callee.id] {
            if let Some(previous) = self.pipelines.insert(session_id.clone(), call.clone()) {
                if !replaced.iter().any(|seen| Arc::ptr_eq(seen, &previous)) {
                    replaced.push(previous);
                }
            }
        }
        for previous in replaced {
            self.end_replaced(&previous, &call).await;
        }
        gauge!("beach_call_pipelines_active").set(self.active_calls() as f64);

        match self.negotiate(&call, &caller, &callee, &callee_offer).await {
            Ok(_) if call.is_released() => self.cancelled(&call, &caller, &callee).await,
            Ok((caller_answer, callee_answer)) => {
                self.deliver(
                    &callee.id,
                    ServerMessage::StartCommunication {
                        sdp_answer: callee_answer,
                    },
                );
                self.deliver(&caller.id, ServerMessage::call_accepted(caller_answer));
                info!(caller = %caller.user_id, callee = %callee.user_id, "call established");
                counter!("beach_call_calls_total", "outcome" => "accepted").increment(1);
                Ok(())
            }
            Err(CallError::Cancelled) => self.cancelled(&call, &caller, &callee).await,
            Err(_) if call.is_released() => self.cancelled(&call, &caller, &callee).await,
            Err(err) => {
                error!(
                    caller = %caller.user_id,
                    callee = %callee.user_id,
                    error = %err,
                    "call negotiation failed"
                );
                counter!("beach_call_calls_total", "outcome" => "media_failure").increment(1);
                call.release().await;
                self.forget(&call);
                let reason = err.to_string();
                self.deliver(&caller.id, ServerMessage::call_rejected(reason.clone()));
                self.deliver(&callee.id, ServerMessage::stop_communication(reason));
                Err(err)
            }
        }
    }

    /// Pipeline -> caller endpoint -> callee endpoint -> connect both ways ->
    /// caller answer -> callee answer. Stops at the first failure.
    async fn negotiate(
        &self,
        call: &Arc<CallPipeline>,
        caller: &Session,
        callee: &Session,
        callee_offer: &str,
    ) -> Result<(String, String), CallError> {
        let caller_offer = caller
            .pending_offer
            .clone()
            .ok_or(MediaError::MissingOffer)?;

        let pipeline = self.media.create_pipeline().await?;
        call.attach_pipeline(pipeline.clone()).await?;

        let caller_endpoint = self
            .open_endpoint(call, pipeline.as_ref(), &caller.id)
            .await?;
        let callee_endpoint = self
            .open_endpoint(call, pipeline.as_ref(), &callee.id)
            .await?;

        caller_endpoint.connect(callee_endpoint.as_ref()).await?;
        callee_endpoint.connect(caller_endpoint.as_ref()).await?;

        let caller_answer = generate_answer(caller_endpoint.as_ref(), &caller_offer).await?;
        let callee_answer = generate_answer(callee_endpoint.as_ref(), callee_offer).await?;
        Ok((caller_answer, callee_answer))
    }

    async fn open_endpoint(
        &self,
        call: &CallPipeline,
        pipeline: &dyn MediaPipeline,
        session_id: &str,
    ) -> Result<Arc<dyn MediaEndpoint>, CallError> {
        let endpoint = pipeline.create_endpoint().await?;
        call.install_endpoint(session_id, endpoint.clone(), &self.candidates)
            .await?;
        endpoint
            .on_candidate_discovered(self.candidate_relay(session_id))
            .await?;
        Ok(endpoint)
    }

    fn candidate_relay(&self, session_id: &str) -> CandidateObserver {
        let hub = self.hub.clone();
        let session_id = session_id.to_string();
        Arc::new(move |candidate| {
            if let Err(err) = hub.send(&session_id, ServerMessage::IceCandidate { candidate }) {
                debug!(session_id = %session_id, error = %err, "dropping discovered candidate");
            }
        })
    }

    async fn cancelled(
        &self,
        call: &Arc<CallPipeline>,
        caller: &Session,
        callee: &Session,
    ) -> Result<(), CallError> {
        call.release().await;
        self.forget(call);
        info!(caller = %caller.user_id, callee = %callee.user_id, "call stopped during negotiation");
        counter!("beach_call_calls_total", "outcome" => "cancelled").increment(1);
        Err(CallError::Cancelled)
    }

    /// A participant of `previous` answered a new call. Free the old call and
    /// hang up on whoever in it is not part of `current`.
    async fn end_replaced(&self, previous: &Arc<CallPipeline>, current: &CallPipeline) {
        warn!(
            caller = previous.caller(),
            callee = previous.callee(),
            "replacing an existing call pipeline"
        );
        previous.release().await;
        self.forget(previous);
        for session_id in [previous.caller(), previous.callee()] {
            if current.counterpart(session_id).is_some() {
                continue;
            }
            self.registry.update(session_id, |session| session.peer = None);
            self.deliver(session_id, ServerMessage::stop_communication(REMOTE_HANGUP));
        }
    }

    /// Hang up. No-op when the session has no call; the candidate buffer is
    /// cleared either way.
    ///
    /// The other party is the call handle's counterpart. Peer pointers may
    /// already name someone who rang in since, so they are not used here.
    pub async fn stop(&self, session_id: &str) {
        if let Some((_, call)) = self.pipelines.remove(session_id) {
            call.release().await;
            let own_user = self
                .registry
                .lookup_by_session(session_id)
                .map(|session| session.user_id);
            self.registry.take_peer(session_id);
            let peer_session = call.counterpart(session_id).map(str::to_string);
            if let Some(peer_id) = peer_session.as_deref() {
                self.pipelines
                    .remove_if(peer_id, |_, entry| Arc::ptr_eq(entry, &call));
                if let Some(own_user) = own_user.as_deref() {
                    self.registry.update(peer_id, |session| {
                        if session.peer.as_deref() == Some(own_user) {
                            session.peer = None;
                        }
                    });
                }
                self.deliver(peer_id, ServerMessage::stop_communication(REMOTE_HANGUP));
            }
            self.forget(&call);
            info!(session_id, peer_session = ?peer_session, "call stopped");
        } else {
            debug!(session_id, "stop without an active call");
        }
        self.candidates.clear(session_id);
    }

    /// Apply a client candidate now if the session has an endpoint, otherwise
    /// hold it until one exists.
    pub async fn on_ice_candidate(&self, session_id: &str, candidate: IceCandidate) {
        match self.pipeline_for(session_id) {
            Some(call) => {
                call.add_or_buffer(session_id, candidate, &self.candidates)
                    .await
            }
            None => {
                self.candidates.enqueue(session_id, candidate);
                // An endpoint may have been installed since the lookup above.
                if let Some(call) = self.pipeline_for(session_id) {
                    call.flush_buffered(session_id, &self.candidates).await;
                }
            }
        }
    }

    /// Tell `target_user_id` that the caller gave up ringing.
    pub fn on_caller_reject(&self, session_id: &str, target_user_id: &str) -> Result<(), CallError> {
        let sender = self.require_session(session_id)?;
        match self.registry.lookup_by_user(target_user_id) {
            Some(target) => {
                info!(from = %sender.user_id, to = target_user_id, "caller withdrew invite");
                self.deliver(
                    &target.id,
                    ServerMessage::OnCallerReject {
                        from: sender.user_id,
                    },
                );
            }
            None => debug!(session_id, target_user_id, "withdrawn invite for unknown user"),
        }
        Ok(())
    }

    /// Tear down whatever the session was doing and forget it.
    pub async fn disconnect(&self, session_id: &str) {
        self.stop(session_id).await;
        if let Some(session) = self.registry.unregister(session_id) {
            info!(session_id, user_id = %session.user_id, "user unregistered");
            gauge!("beach_call_sessions_registered").set(self.registry.len() as f64);
        }
        self.candidates.clear(session_id);
    }

    fn require_session(&self, session_id: &str) -> Result<Session, CallError> {
        self.registry.lookup_by_session(session_id).ok_or_else(|| {
            let err = CallError::UnregisteredSession(session_id.to_string());
            self.deliver(
                session_id,
                ServerMessage::Error {
                    message: err.to_string(),
                },
            );
            err
        })
    }

    /// Drop both map entries that still point at `call`.
    fn forget(&self, call: &Arc<CallPipeline>) {
        for session_id in [call.caller(), call.callee()] {
            self.pipelines
                .remove_if(session_id, |_, entry| Arc::ptr_eq(entry, call));
        }
        gauge!("beach_call_pipelines_active").set(self.active_calls() as f64);
    }

    fn active_calls(&self) -> usize {
        self.pipelines.len() / 2
    }

    fn deliver(&self, session_id: &str, message: ServerMessage) {
        let event = message.name();
        if let Err(err) = self.hub.send(session_id, message) {
            debug!(session_id, event, error = %err, "event not delivered");
        }
    }
}

async fn generate_answer(endpoint: &dyn MediaEndpoint, offer: &str) -> Result<String, MediaError> {
    let answer = endpoint.process_offer(offer).await?;
    endpoint.gather_candidates().await?;
    Ok(answer)
}
