use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::candidates::CandidateBuffer;
use crate::error::CallError;
use crate::media::{MediaEndpoint, MediaPipeline};
use crate::signaling::{IceCandidate, SessionId};

/// Media resources of one two-party call.
///
/// The same `Arc` is stored under both participants' session ids. Every
/// mutation goes through the inner mutex, so the two sides never race each
/// other; `release` marks the call dead and later attach attempts free what
/// they bring instead of storing it.
pub struct CallPipeline {
    caller: SessionId,
    callee: SessionId,
    released: AtomicBool,
    state: Mutex<PipelineState>,
}

#[derive(Default)]
struct PipelineState {
    pipeline: Option<Arc<dyn MediaPipeline>>,
    endpoints: HashMap<SessionId, Arc<dyn MediaEndpoint>>,
}

impl CallPipeline {
    pub fn new(caller: &str, callee: &str) -> Arc<Self> {
        Arc::new(Self {
            caller: caller.to_string(),
            callee: callee.to_string(),
            released: AtomicBool::new(false),
            state: Mutex::new(PipelineState::default()),
        })
    }

    pub fn caller(&self) -> &str {
        &self.caller
    }

    pub fn callee(&self) -> &str {
        &self.callee
    }

    /// The other participant's session id.
    pub fn counterpart(&self, session_id: &str) -> Option<&str> {
        if session_id == self.caller {
            Some(&self.callee)
        } else if session_id == self.callee {
            Some(&self.caller)
        } else {
            None
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Adopt a freshly created media pipeline. If the call was stopped while
    /// it was being created, the pipeline is released on the spot.
    pub async fn attach_pipeline(&self, pipeline: Arc<dyn MediaPipeline>) -> Result<(), CallError> {
        let mut state = self.state.lock().await;
        if self.is_released() {
            drop(state);
            debug!(pipeline_id = pipeline.id(), "call stopped during pipeline creation");
            pipeline.release().await;
            return Err(CallError::Cancelled);
        }
        state.pipeline = Some(pipeline);
        Ok(())
    }

    /// Register `session_id`'s endpoint and flush its buffered candidates into
    /// it, oldest first. Holding the call lock keeps concurrent
    /// `add_or_buffer` calls for this session behind the flush.
    pub async fn install_endpoint(
        &self,
        session_id: &str,
        endpoint: Arc<dyn MediaEndpoint>,
        buffer: &CandidateBuffer,
    ) -> Result<(), CallError> {
        let mut state = self.state.lock().await;
        if self.is_released() {
            return Err(CallError::Cancelled);
        }
        state
            .endpoints
            .insert(session_id.to_string(), endpoint.clone());
        let applied = apply_buffered(session_id, endpoint.as_ref(), buffer).await;
        debug!(session_id, applied, "endpoint installed");
        Ok(())
    }

    #[cfg(test)]
    pub async fn endpoint(&self, session_id: &str) -> Option<Arc<dyn MediaEndpoint>> {
        self.state.lock().await.endpoints.get(session_id).cloned()
    }

    /// Apply the candidate when the session already has an endpoint, buffer it
    /// otherwise.
    pub async fn add_or_buffer(
        &self,
        session_id: &str,
        candidate: IceCandidate,
        buffer: &CandidateBuffer,
    ) {
        let state = self.state.lock().await;
        match state.endpoints.get(session_id) {
            Some(endpoint) if !self.is_released() => {
                apply_buffered(session_id, endpoint.as_ref(), buffer).await;
                apply_candidate(session_id, endpoint.as_ref(), candidate).await;
            }
            _ => buffer.enqueue(session_id, candidate),
        }
    }

    /// Push anything sitting in the buffer into the session's endpoint, if it
    /// has one yet.
    pub async fn flush_buffered(&self, session_id: &str, buffer: &CandidateBuffer) {
        let state = self.state.lock().await;
        if self.is_released() {
            return;
        }
        if let Some(endpoint) = state.endpoints.get(session_id) {
            apply_buffered(session_id, endpoint.as_ref(), buffer).await;
        }
    }

    /// Free the media pipeline. Only the first call does any work; returns
    /// whether this call was the one that released.
    pub async fn release(&self) -> bool {
        let mut state = self.state.lock().await;
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        state.endpoints.clear();
        let pipeline = state.pipeline.take();
        drop(state);

        if let Some(pipeline) = pipeline {
            pipeline.release().await;
        }
        true
    }
}

async fn apply_buffered(
    session_id: &str,
    endpoint: &dyn MediaEndpoint,
    buffer: &CandidateBuffer,
) -> usize {
    buffer
        .drain_in_order(session_id, |candidate| {
            apply_candidate(session_id, endpoint, candidate)
        })
        .await
}

async fn apply_candidate(session_id: &str, endpoint: &dyn MediaEndpoint, candidate: IceCandidate) {
    if let Err(err) = endpoint.add_candidate(candidate).await {
        warn!(session_id, endpoint_id = endpoint.id(), error = %err, "failed to add ICE candidate");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MediaError;
    use crate::media::CandidateObserver;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingPipeline {
        releases: AtomicUsize,
    }

    #[async_trait]
    impl MediaPipeline for CountingPipeline {
        fn id(&self) -> &str {
            "pipeline"
        }
        async fn create_endpoint(&self) -> Result<Arc<dyn MediaEndpoint>, MediaError> {
            Ok(Arc::new(RecordingEndpoint::default()))
        }
        async fn release(&self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct RecordingEndpoint {
        added: parking_lot::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MediaEndpoint for RecordingEndpoint {
        fn id(&self) -> &str {
            "endpoint"
        }
        async fn on_candidate_discovered(&self, _: CandidateObserver) -> Result<(), MediaError> {
            Ok(())
        }
        async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
            self.added.lock().push(candidate.candidate);
            Ok(())
        }
        async fn connect(&self, _: &dyn MediaEndpoint) -> Result<(), MediaError> {
            Ok(())
        }
        async fn process_offer(&self, offer: &str) -> Result<String, MediaError> {
            Ok(format!("answer:{offer}"))
        }
        async fn gather_candidates(&self) -> Result<(), MediaError> {
            Ok(())
        }
    }

    fn candidate(label: &str) -> IceCandidate {
        IceCandidate {
            candidate: label.to_string(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn release_runs_once() {
        let call = CallPipeline::new("a", "b");
        let media = Arc::new(CountingPipeline::default());
        call.attach_pipeline(media.clone()).await.unwrap();

        assert!(call.release().await);
        assert!(!call.release().await);
        assert_eq!(media.releases.load(Ordering::SeqCst), 1);
        assert!(call.is_released());
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn pipeline_arriving_after_stop_is_released() {
        let call = CallPipeline::new("a", "b");
        call.release().await;

        let media = Arc::new(CountingPipeline::default());
        let outcome = call.attach_pipeline(media.clone()).await;
        assert_eq!(outcome, Err(CallError::Cancelled));
        assert_eq!(media.releases.load(Ordering::SeqCst), 1);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn buffered_candidates_precede_live_ones() {
        let call = CallPipeline::new("a", "b");
        let buffer = CandidateBuffer::new();
        call.add_or_buffer("a", candidate("early-1"), &buffer).await;
        call.add_or_buffer("a", candidate("early-2"), &buffer).await;
        assert_eq!(buffer.len("a"), 2);

        let endpoint = Arc::new(RecordingEndpoint::default());
        call.install_endpoint("a", endpoint.clone(), &buffer)
            .await
            .unwrap();
        call.add_or_buffer("a", candidate("late"), &buffer).await;

        assert_eq!(*endpoint.added.lock(), vec!["early-1", "early-2", "late"]);
        assert_eq!(buffer.len("a"), 0);
        assert!(call.endpoint("a").await.is_some());
        assert!(call.endpoint("b").await.is_none());
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn flush_picks_up_stragglers() {
        let call = CallPipeline::new("a", "b");
        let buffer = CandidateBuffer::new();
        let endpoint = Arc::new(RecordingEndpoint::default());
        call.install_endpoint("a", endpoint.clone(), &buffer)
            .await
            .unwrap();

        buffer.enqueue("a", candidate("straggler"));
        call.flush_buffered("a", &buffer).await;
        assert_eq!(*endpoint.added.lock(), vec!["straggler"]);
    }

    #[test_timeout::timeout]
    fn counterpart_maps_both_ways() {
        let call = CallPipeline::new("a", "b");
        assert_eq!(call.counterpart("a"), Some("b"));
        assert_eq!(call.counterpart("b"), Some("a"));
        assert_eq!(call.counterpart("c"), None);
        assert_eq!(call.caller(), "a");
        assert_eq!(call.callee(), "b");
    }
}
