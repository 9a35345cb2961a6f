//! Window store trait for abstracting in-memory and remote counter storage.

use async_trait::async_trait;

use super::counter::{Decision, RateLimitConfig};
use crate::error::Result;

/// Trait for window counter store implementations.
///
/// This trait abstracts over the process-local `MemoryStore` and the shared
/// `RemoteStore` so a `RateLimiter` can work with either. Implementations
/// never fail a check: a store that cannot answer must fail open.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Record one request for `identifier` at `now` (epoch ms) and decide
    /// whether it fits in the current window.
    async fn record_and_check(
        &self,
        identifier: &str,
        config: &RateLimitConfig,
        now: u64,
    ) -> Decision;

    /// Whether this store keeps records that a periodic sweep must reclaim.
    fn supports_sweep(&self) -> bool {
        false
    }

    /// Drop records whose window ended before `now`, returning how many
    /// were removed.
    fn sweep(&self, _now: u64) -> Result<usize> {
        Ok(0)
    }

    /// Short backend name used in logs and health output.
    fn kind(&self) -> &'static str;
}
