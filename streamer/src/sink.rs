use async_trait::async_trait;
use framecast_common::frame::Frame;

/// Anything that accepts produced frames: the viewer broadcast server, the
/// encoder pipe, or a test double.
///
/// `push` is best effort. Implementations absorb their own failures (evicting
/// a viewer, marking an encoder failed) so one broken sink never stops the
/// producer loop, and must not hold on to producer state past the call.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn push(&self, frame: &Frame);

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}
