use std::collections::VecDeque;
use std::future::Future;

use dashmap::DashMap;

use crate::signaling::{IceCandidate, SessionId};

/// ICE candidates that arrived before their session had a media endpoint.
#[derive(Default)]
pub struct CandidateBuffer {
    queues: DashMap<SessionId, VecDeque<IceCandidate>>,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, session_id: &str, candidate: IceCandidate) {
        self.queues
            .entry(session_id.to_string())
            .or_default()
            .push_back(candidate);
    }

    /// Detach the session's queue and feed it to `apply` oldest first.
    ///
    /// The queue leaves the map before the first `apply` runs, so candidates
    /// enqueued while `apply` is suspended start a new queue instead of being
    /// interleaved with this batch. Returns how many candidates were applied.
    pub async fn drain_in_order<F, Fut>(&self, session_id: &str, mut apply: F) -> usize
    where
        F: FnMut(IceCandidate) -> Fut,
        Fut: Future<Output = ()>,
    {
        let Some((_, queue)) = self.queues.remove(session_id) else {
            return 0;
        };
        let drained = queue.len();
        for candidate in queue {
            apply(candidate).await;
        }
        drained
    }

    pub fn clear(&self, session_id: &str) {
        self.queues.remove(session_id);
    }

    pub fn len(&self, session_id: &str) -> usize {
        self.queues
            .get(session_id)
            .map(|queue| queue.len())
            .unwrap_or(0)
    }
}
