#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use beach_call::error::MediaError;
use beach_call::media::{CandidateObserver, MediaEndpoint, MediaPipeline, MediaServer};
use beach_call::signaling::{ClientMessage, IceCandidate, ServerMessage, SessionId};
use beach_call::{CallCoordinator, ConnectionHub};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

/// Media operations the scripted server can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    CreatePipeline,
    CreateEndpoint,
    Subscribe,
    Connect,
    ProcessOffer,
    GatherCandidates,
}

pub const ALL_STAGES: [Stage; 6] = [
    Stage::CreatePipeline,
    Stage::CreateEndpoint,
    Stage::Subscribe,
    Stage::Connect,
    Stage::ProcessOffer,
    Stage::GatherCandidates,
];

#[derive(Default)]
struct Script {
    fail_at: Mutex<Option<Stage>>,
    hold: Mutex<Option<Gate>>,
    calls: Mutex<HashMap<Stage, usize>>,
    log: Mutex<Vec<String>>,
    endpoints: Mutex<Vec<Arc<FakeEndpoint>>>,
    pipelines_created: AtomicUsize,
    pipelines_released: AtomicUsize,
}

#[derive(Clone)]
struct Gate {
    entered: Arc<Notify>,
    open: Arc<Notify>,
}

/// Handle a test uses to pause pipeline creation and resume it later.
pub struct Held {
    gate: Gate,
}

impl Held {
    /// Wait until the coordinator is blocked inside `create_pipeline`.
    pub async fn entered(&self) {
        tokio::time::timeout(Duration::from_secs(2), self.gate.entered.notified())
            .await
            .expect("pipeline creation never started");
    }

    pub fn release(&self) {
        self.gate.open.notify_one();
    }
}

impl Script {
    fn step(&self, stage: Stage, entry: String) -> Result<(), MediaError> {
        *self.calls.lock().entry(stage).or_default() += 1;
        if *self.fail_at.lock() == Some(stage) {
            return Err(MediaError::Rpc {
                code: 500,
                message: format!("{stage:?} failed"),
            });
        }
        self.log.lock().push(entry);
        Ok(())
    }
}

/// In-memory media server with per-stage failure injection.
#[derive(Clone, Default)]
pub struct ScriptedMediaServer {
    script: Arc<Script>,
}

impl ScriptedMediaServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_at(stage: Stage) -> Self {
        let server = Self::default();
        *server.script.fail_at.lock() = Some(stage);
        server
    }

    /// Block the next `create_pipeline` until [`Held::release`].
    pub fn hold_pipeline_creation(&self) -> Held {
        let gate = Gate {
            entered: Arc::new(Notify::new()),
            open: Arc::new(Notify::new()),
        };
        *self.script.hold.lock() = Some(gate.clone());
        Held { gate }
    }

    pub fn log(&self) -> Vec<String> {
        self.script.log.lock().clone()
    }

    pub fn calls(&self, stage: Stage) -> usize {
        self.script.calls.lock().get(&stage).copied().unwrap_or(0)
    }

    pub fn endpoint(&self, index: usize) -> Arc<FakeEndpoint> {
        self.script.endpoints.lock()[index].clone()
    }

    pub fn pipelines_created(&self) -> usize {
        self.script.pipelines_created.load(Ordering::SeqCst)
    }

    pub fn pipelines_released(&self) -> usize {
        self.script.pipelines_released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaServer for ScriptedMediaServer {
    async fn create_pipeline(&self) -> Result<Arc<dyn MediaPipeline>, MediaError> {
        let gate = self.script.hold.lock().take();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.open.notified().await;
        }
        let n = self.script.pipelines_created.load(Ordering::SeqCst) + 1;
        let id = format!("pipeline-{n}");
        self.script.step(Stage::CreatePipeline, format!("create {id}"))?;
        self.script.pipelines_created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakePipeline {
            id,
            script: self.script.clone(),
            released: AtomicUsize::new(0),
        }))
    }
}

struct FakePipeline {
    id: String,
    script: Arc<Script>,
    released: AtomicUsize,
}

#[async_trait]
impl MediaPipeline for FakePipeline {
    fn id(&self) -> &str {
        &self.id
    }

    async fn create_endpoint(&self) -> Result<Arc<dyn MediaEndpoint>, MediaError> {
        let n = self.script.endpoints.lock().len() + 1;
        let id = format!("ep-{n}");
        self.script.step(Stage::CreateEndpoint, format!("endpoint {id}"))?;
        let endpoint = Arc::new(FakeEndpoint {
            id,
            script: self.script.clone(),
            added: Mutex::new(Vec::new()),
            observer: Mutex::new(None),
        });
        self.script.endpoints.lock().push(endpoint.clone());
        Ok(endpoint)
    }

    async fn release(&self) {
        if self.released.fetch_add(1, Ordering::SeqCst) == 0 {
            self.script.pipelines_released.fetch_add(1, Ordering::SeqCst);
            self.script.log.lock().push(format!("release {}", self.id));
        }
    }
}

pub struct FakeEndpoint {
    id: String,
    script: Arc<Script>,
    added: Mutex<Vec<String>>,
    observer: Mutex<Option<CandidateObserver>>,
}

impl FakeEndpoint {
    /// Candidates applied to this endpoint, in order.
    pub fn added(&self) -> Vec<String> {
        self.added.lock().clone()
    }

    /// Pretend the media server discovered a local candidate.
    pub fn discover(&self, candidate: IceCandidate) {
        let observer = self.observer.lock().clone();
        if let Some(observer) = observer {
            observer(candidate);
        }
    }
}

#[async_trait]
impl MediaEndpoint for FakeEndpoint {
    fn id(&self) -> &str {
        &self.id
    }

    async fn on_candidate_discovered(&self, observer: CandidateObserver) -> Result<(), MediaError> {
        self.script
            .step(Stage::Subscribe, format!("subscribe {}", self.id))?;
        *self.observer.lock() = Some(observer);
        Ok(())
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        self.added.lock().push(candidate.candidate);
        Ok(())
    }

    async fn connect(&self, sink: &dyn MediaEndpoint) -> Result<(), MediaError> {
        self.script
            .step(Stage::Connect, format!("connect {} -> {}", self.id, sink.id()))
    }

    async fn process_offer(&self, offer: &str) -> Result<String, MediaError> {
        self.script
            .step(Stage::ProcessOffer, format!("offer {}", self.id))?;
        Ok(format!("answer[{}]:{offer}", self.id))
    }

    async fn gather_candidates(&self) -> Result<(), MediaError> {
        self.script
            .step(Stage::GatherCandidates, format!("gather {}", self.id))
    }
}

pub fn candidate(label: &str) -> IceCandidate {
    IceCandidate {
        candidate: label.to_string(),
        sdp_mid: Some("0".into()),
        sdp_m_line_index: Some(0),
    }
}

/// A connected session as seen from the server side.
pub struct Peer {
    pub session_id: SessionId,
    rx: mpsc::UnboundedReceiver<ServerMessage>,
}

impl Peer {
    pub fn connect(hub: &ConnectionHub, session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            rx: hub.attach(session_id),
        }
    }

    pub async fn next(&mut self) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(2), self.rx.recv())
            .await
            .expect("timed out waiting for a server event")
            .expect("outbound channel closed")
    }

    /// Everything queued so far, without waiting.
    pub fn drain(&mut self) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(message) = self.rx.try_recv() {
            out.push(message);
        }
        out
    }
}

pub struct Harness {
    pub coordinator: Arc<CallCoordinator>,
    pub media: ScriptedMediaServer,
}

impl Harness {
    pub fn new(media: ScriptedMediaServer) -> Self {
        let coordinator = Arc::new(CallCoordinator::new(
            Arc::new(media.clone()),
            ConnectionHub::new(),
        ));
        Self { coordinator, media }
    }

    /// Connect and register `user`, consuming the registration reply.
    pub async fn join(&self, user: &str) -> Peer {
        let mut peer = Peer::connect(self.coordinator.hub(), &format!("session-{user}"));
        self.coordinator
            .handle(&peer.session_id, register(user))
            .await
            .expect("registration failed");
        peer.next().await;
        peer
    }

    /// `caller` invites `callee`; the invite is consumed from the callee.
    pub async fn invite(&self, caller: &Peer, callee: &mut Peer, callee_user: &str) {
        self.coordinator
            .handle(
                &caller.session_id,
                ClientMessage::Call {
                    to: callee_user.to_string(),
                    from: None,
                    sdp_offer: "caller-offer".into(),
                },
            )
            .await
            .expect("invite failed");
        assert!(matches!(callee.next().await, ServerMessage::IncomingCall { .. }));
    }
}

pub fn register(user: &str) -> ClientMessage {
    ClientMessage::Register {
        user_id: Some(user.to_string()),
        name: user.to_uppercase(),
        avatar: None,
    }
}

pub fn accept_from(caller_user: &str) -> ClientMessage {
    ClientMessage::IncomingCallResponse {
        from: Some(caller_user.to_string()),
        call_response: beach_call::signaling::CallDecision::Accept,
        sdp_offer: Some("callee-offer".into()),
    }
}
