//! Streaming error types.

use thiserror::Error;

use crate::texture::TextureHandle;

/// Infrastructure failures of the streamer.
///
/// Budget pressure and pool exhaustion are not errors: they degrade quality
/// for a cycle and are reported through [`ApplyReport`](crate::ApplyReport).
#[derive(Debug, Error)]
pub enum StreamingError {
    /// The planning worker thread could not be started.
    #[error("failed to spawn planning worker: {0}")]
    WorkerSpawn(#[source] std::io::Error),

    /// The planning worker exited (panicked) before returning a plan.
    #[error("planning worker disconnected before delivering a plan")]
    WorkerDisconnected,

    /// A texture description cannot be streamed.
    #[error("invalid texture description: {0}")]
    InvalidDescription(&'static str),

    /// The handle does not refer to a live texture.
    #[error("unknown or destroyed texture handle {0:?}")]
    InvalidHandle(TextureHandle),
}
