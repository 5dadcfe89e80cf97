//! Boundary to the media relay. The coordinator only sees these traits; the
//! production implementation talks to Kurento over JSON-RPC.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::MediaError;
use crate::signaling::IceCandidate;

pub mod kurento;

pub use kurento::KurentoMediaServer;

/// Called for every candidate the media server discovers on an endpoint.
pub type CandidateObserver = Arc<dyn Fn(IceCandidate) + Send + Sync>;

/// Factory for relay pipelines.
#[async_trait]
pub trait MediaServer: Send + Sync {
    async fn create_pipeline(&self) -> Result<Arc<dyn MediaPipeline>, MediaError>;
}

#[async_trait]
pub trait MediaPipeline: Send + Sync {
    fn id(&self) -> &str;

    async fn create_endpoint(&self) -> Result<Arc<dyn MediaEndpoint>, MediaError>;

    /// Free the pipeline and everything in it. Safe to call more than once.
    async fn release(&self);
}

/// One WebRTC leg of a pipeline.
#[async_trait]
pub trait MediaEndpoint: Send + Sync {
    fn id(&self) -> &str;

    async fn on_candidate_discovered(&self, observer: CandidateObserver)
        -> Result<(), MediaError>;

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError>;

    /// Route media from this endpoint into `sink`. One direction only.
    async fn connect(&self, sink: &dyn MediaEndpoint) -> Result<(), MediaError>;

    async fn process_offer(&self, offer: &str) -> Result<String, MediaError>;

    async fn gather_candidates(&self) -> Result<(), MediaError>;
}
