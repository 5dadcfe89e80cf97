//! Kurento media server client (JSON-RPC 2.0 over WebSocket).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::{CandidateObserver, MediaEndpoint, MediaPipeline, MediaServer};
use crate::error::MediaError;
use crate::signaling::IceCandidate;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(240);
const CANDIDATE_EVENTS: [&str; 2] = ["IceCandidateFound", "OnIceCandidate"];

type PendingMap = DashMap<u64, oneshot::Sender<Result<Value, MediaError>>>;
type ObserverMap = DashMap<String, CandidateObserver>;

/// Lazily connected handle to a Kurento server. The underlying connection is
/// re-established on the next pipeline request after it drops.
pub struct KurentoMediaServer {
    url: String,
    rpc_timeout: Duration,
    client: Mutex<Option<Arc<KurentoClient>>>,
}

impl KurentoMediaServer {
    pub fn new(url: impl Into<String>, rpc_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            rpc_timeout,
            client: Mutex::new(None),
        }
    }

    async fn client(&self) -> Result<Arc<KurentoClient>, MediaError> {
        let mut guard = self.client.lock().await;
        if let Some(client) = guard.as_ref() {
            if !client.is_closed() {
                return Ok(client.clone());
            }
            info!(url = %self.url, "media server connection lost; reconnecting");
        }

        let client = KurentoClient::connect(&self.url, self.rpc_timeout).await?;
        *guard = Some(client.clone());
        Ok(client)
    }
}

#[async_trait]
impl MediaServer for KurentoMediaServer {
    async fn create_pipeline(&self) -> Result<Arc<dyn MediaPipeline>, MediaError> {
        let client = self.client().await?;
        let id = client.create("MediaPipeline", json!({})).await?;
        debug!(pipeline_id = %id, "media pipeline created");
        Ok(Arc::new(KurentoPipeline {
            id,
            client,
            endpoints: parking_lot::Mutex::new(Vec::new()),
            released: AtomicBool::new(false),
        }))
    }
}

/// One JSON-RPC connection to the media server.
pub struct KurentoClient {
    url: String,
    outbound: mpsc::UnboundedSender<Message>,
    pending: Arc<PendingMap>,
    observers: Arc<ObserverMap>,
    session_id: parking_lot::RwLock<Option<String>>,
    next_id: AtomicU64,
    rpc_timeout: Duration,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl KurentoClient {
    pub async fn connect(url: &str, rpc_timeout: Duration) -> Result<Arc<Self>, MediaError> {
        let unreachable = |reason: String| MediaError::Unreachable {
            url: url.to_string(),
            reason,
        };
        let (stream, _) = match timeout(rpc_timeout, connect_async(url)).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => return Err(unreachable(err.to_string())),
            Err(_) => return Err(unreachable("connection timed out".to_string())),
        };
        info!(url, "connected to media server");

        let (mut sink, mut source) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let pending: Arc<PendingMap> = Arc::new(DashMap::new());
        let observers: Arc<ObserverMap> = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));

        let writer_closed = closed.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
            writer_closed.store(true, Ordering::SeqCst);
            let _ = sink.close().await;
        });

        let reader_pending = pending.clone();
        let reader_observers = observers.clone();
        let reader_closed = closed.clone();
        let reader_url = url.to_string();
        let reader = tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        dispatch_frame(text.as_str(), &reader_pending, &reader_observers)
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(url = %reader_url, error = %err, "media server socket error");
                        break;
                    }
                }
            }
            reader_closed.store(true, Ordering::SeqCst);
            // Dropping the senders wakes every waiter with a closed error.
            reader_pending.clear();
            debug!(url = %reader_url, "media server reader stopped");
        });

        let client = Arc::new(Self {
            url: url.to_string(),
            outbound: tx,
            pending,
            observers,
            session_id: parking_lot::RwLock::new(None),
            next_id: AtomicU64::new(1),
            rpc_timeout,
            closed,
            reader,
        });
        spawn_keepalive(Arc::downgrade(&client));
        Ok(client)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn request(&self, method: &str, mut params: Value) -> Result<Value, MediaError> {
        if self.is_closed() {
            return Err(MediaError::Closed);
        }

        let session_id = self.session_id.read().clone();
        if let (Some(session_id), Some(map)) = (session_id, params.as_object_mut()) {
            map.insert("sessionId".to_string(), Value::String(session_id));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        if self
            .outbound
            .send(Message::Text(frame.to_string().into()))
            .is_err()
        {
            self.pending.remove(&id);
            return Err(MediaError::Closed);
        }

        let result = match timeout(self.rpc_timeout, rx).await {
            Ok(Ok(outcome)) => outcome?,
            Ok(Err(_)) => return Err(MediaError::Closed),
            Err(_) => {
                self.pending.remove(&id);
                return Err(MediaError::Timeout {
                    method: method.to_string(),
                    timeout_secs: self.rpc_timeout.as_secs(),
                });
            }
        };

        if let Some(session_id) = result.get("sessionId").and_then(Value::as_str) {
            let mut current = self.session_id.write();
            if current.as_deref() != Some(session_id) {
                *current = Some(session_id.to_string());
            }
        }
        Ok(result)
    }

    async fn create(&self, kind: &str, constructor_params: Value) -> Result<String, MediaError> {
        let result = self
            .request(
                "create",
                json!({
                    "type": kind,
                    "constructorParams": constructor_params,
                    "properties": {},
                }),
            )
            .await?;
        string_value(&result, "create")
    }

    async fn invoke(
        &self,
        object: &str,
        operation: &str,
        operation_params: Value,
    ) -> Result<Value, MediaError> {
        self.request(
            "invoke",
            json!({
                "object": object,
                "operation": operation,
                "operationParams": operation_params,
            }),
        )
        .await
    }
}

impl Drop for KurentoClient {
    fn drop(&mut self) {
        debug!(url = %self.url, "dropping media server client");
        self.reader.abort();
    }
}

fn spawn_keepalive(client: Weak<KurentoClient>) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(KEEPALIVE_INTERVAL).await;
            let Some(client) = client.upgrade() else {
                break;
            };
            if client.is_closed() {
                break;
            }
            let interval_ms = KEEPALIVE_INTERVAL.as_millis() as u64;
            if let Err(err) = client.request("ping", json!({ "interval": interval_ms })).await {
                warn!(error = %err, "media server keepalive failed");
            }
        }
    });
}

fn string_value(result: &Value, method: &str) -> Result<String, MediaError> {
    result
        .get("value")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| MediaError::Protocol(format!("{method} returned no value")))
}

#[derive(Debug, Deserialize)]
struct RpcFrame {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct EventParams {
    value: EventValue,
}

#[derive(Debug, Deserialize)]
struct EventValue {
    #[serde(rename = "type")]
    kind: String,
    object: String,
    #[serde(default)]
    data: Option<EventData>,
}

#[derive(Debug, Deserialize)]
struct EventData {
    #[serde(default)]
    candidate: Option<KurentoCandidate>,
}

/// Kurento's `IceCandidate` complex type.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct KurentoCandidate {
    candidate: String,
    #[serde(rename = "sdpMid", default)]
    sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    sdp_m_line_index: Option<u32>,
}

impl From<KurentoCandidate> for IceCandidate {
    fn from(candidate: KurentoCandidate) -> Self {
        IceCandidate {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_m_line_index: candidate.sdp_m_line_index,
        }
    }
}

fn candidate_param(candidate: &IceCandidate) -> Value {
    json!({
        "__module__": "kurento",
        "__type__": "IceCandidate",
        "candidate": candidate.candidate,
        "sdpMid": candidate.sdp_mid.clone().unwrap_or_default(),
        "sdpMLineIndex": candidate.sdp_m_line_index.unwrap_or_default(),
    })
}

fn dispatch_frame(text: &str, pending: &PendingMap, observers: &ObserverMap) {
    let frame: RpcFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(error = %err, "ignoring malformed media server frame");
            return;
        }
    };

    if let Some(id) = frame.id {
        if let Some((_, waiter)) = pending.remove(&id) {
            let outcome = match frame.error {
                Some(error) => Err(MediaError::Rpc {
                    code: error.code,
                    message: error.message,
                }),
                None => Ok(frame.result.unwrap_or(Value::Null)),
            };
            let _ = waiter.send(outcome);
        } else {
            debug!(id, "response for unknown media server request");
        }
        return;
    }

    if frame.method.as_deref() != Some("onEvent") {
        debug!(method = ?frame.method, "ignoring media server notification");
        return;
    }
    let Some(params) = frame.params else {
        return;
    };
    let event: EventParams = match serde_json::from_value(params) {
        Ok(event) => event,
        Err(err) => {
            warn!(error = %err, "ignoring malformed media server event");
            return;
        }
    };
    if !CANDIDATE_EVENTS.contains(&event.value.kind.as_str()) {
        debug!(kind = %event.value.kind, "ignoring media server event");
        return;
    }
    let Some(candidate) = event.value.data.and_then(|data| data.candidate) else {
        return;
    };
    // Clone the observer out so it does not run under the map guard.
    let observer = observers
        .get(&event.value.object)
        .map(|entry| entry.value().clone());
    match observer {
        Some(observer) => observer(candidate.into()),
        None => debug!(object = %event.value.object, "candidate for unobserved endpoint"),
    }
}

struct KurentoPipeline {
    id: String,
    client: Arc<KurentoClient>,
    endpoints: parking_lot::Mutex<Vec<String>>,
    released: AtomicBool,
}

#[async_trait]
impl MediaPipeline for KurentoPipeline {
    fn id(&self) -> &str {
        &self.id
    }

    async fn create_endpoint(&self) -> Result<Arc<dyn MediaEndpoint>, MediaError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(MediaError::Closed);
        }
        let id = self
            .client
            .create("WebRtcEndpoint", json!({ "mediaPipeline": self.id }))
            .await?;
        self.endpoints.lock().push(id.clone());
        debug!(pipeline_id = %self.id, endpoint_id = %id, "webrtc endpoint created");
        Ok(Arc::new(KurentoEndpoint {
            id,
            client: self.client.clone(),
        }))
    }

    async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let endpoints = std::mem::take(&mut *self.endpoints.lock());
        for endpoint in endpoints {
            self.client.observers.remove(&endpoint);
        }
        match self
            .client
            .request("release", json!({ "object": self.id }))
            .await
        {
            Ok(_) => debug!(pipeline_id = %self.id, "media pipeline released"),
            Err(err) => warn!(pipeline_id = %self.id, error = %err, "failed to release media pipeline"),
        }
    }
}

struct KurentoEndpoint {
    id: String,
    client: Arc<KurentoClient>,
}

#[async_trait]
impl MediaEndpoint for KurentoEndpoint {
    fn id(&self) -> &str {
        &self.id
    }

    async fn on_candidate_discovered(
        &self,
        observer: CandidateObserver,
    ) -> Result<(), MediaError> {
        self.client.observers.insert(self.id.clone(), observer);
        self.client
            .request(
                "subscribe",
                json!({ "type": CANDIDATE_EVENTS[0], "object": self.id }),
            )
            .await
            .map(|_| ())
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        self.client
            .invoke(
                &self.id,
                "addIceCandidate",
                json!({ "candidate": candidate_param(&candidate) }),
            )
            .await
            .map(|_| ())
    }

    async fn connect(&self, sink: &dyn MediaEndpoint) -> Result<(), MediaError> {
        self.client
            .invoke(&self.id, "connect", json!({ "sink": sink.id() }))
            .await
            .map(|_| ())
    }

    async fn process_offer(&self, offer: &str) -> Result<String, MediaError> {
        let result = self
            .client
            .invoke(&self.id, "processOffer", json!({ "offer": offer }))
            .await?;
        string_value(&result, "processOffer")
    }

    async fn gather_candidates(&self) -> Result<(), MediaError> {
        self.client
            .invoke(&self.id, "gatherCandidates", json!({}))
            .await
            .map(|_| ())
    }
}
