//! Acquiring the surface a host renders the chat into.
//!
//! Hosts often create that surface after the client is ready, so lookup is
//! retried with backoff before giving up.

use crate::chat::ChatError;
use crate::retry::RetryPolicy;

/// Finds an externally owned render target. `None` means "not there yet".
pub trait RenderTargetLocator {
    type Target;

    fn locate(&self) -> Option<Self::Target>;
}

/// Poll `locator` up to `policy.max_attempts` times, sleeping between misses.
pub async fn acquire_render_target<L: RenderTargetLocator>(
    locator: &L,
    policy: &RetryPolicy,
) -> Result<L::Target, ChatError> {
    let attempts = policy.max_attempts.max(1);
    for attempt in 0..attempts {
        if let Some(target) = locator.locate() {
            if attempt > 0 {
                tracing::debug!(attempt, "render target located");
            }
            return Ok(target);
        }
        if attempt + 1 < attempts {
            let delay = policy.delay_for(attempt);
            tracing::trace!(attempt, "render target not ready, retrying in {delay:?}");
            tokio::time::sleep(delay).await;
        }
    }
    tracing::warn!(attempts, "render target unavailable");
    Err(ChatError::RenderTargetUnavailable(attempts))
}
