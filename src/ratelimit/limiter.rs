//! Core rate limiter implementation.

use std::sync::Arc;
use tracing::{debug, trace};

use super::backend::WindowStore;
use super::counter::{epoch_millis, Decision, RateLimitConfig};

/// A named limiter pairing one window configuration with a window store.
///
/// The limiter holds no records itself: every check is a read-modify-write
/// through the store. It is cheap to share behind an `Arc`.
pub struct RateLimiter {
    /// Name used in logs and key prefixes
    name: String,
    /// Window size and quota
    config: RateLimitConfig,
    /// Where the window records live
    store: Arc<dyn WindowStore>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("store", &self.store.kind())
            .finish()
    }
}

impl RateLimiter {
    /// Create a new rate limiter over the given store.
    pub fn new(name: impl Into<String>, config: RateLimitConfig, store: Arc<dyn WindowStore>) -> Self {
        Self {
            name: name.into(),
            config,
            store,
        }
    }

    /// Check whether a request from `identifier` is allowed right now.
    pub async fn is_allowed(&self, identifier: &str) -> Decision {
        self.is_allowed_at(identifier, epoch_millis()).await
    }

    /// Check whether a request from `identifier` is allowed at `now` (epoch ms).
    pub async fn is_allowed_at(&self, identifier: &str, now: u64) -> Decision {
        trace!(
            limiter = %self.name,
            identifier = %identifier,
            "Checking rate limit"
        );

        let decision = self.store.record_and_check(identifier, &self.config, now).await;

        if !decision.allowed {
            debug!(
                limiter = %self.name,
                identifier = %identifier,
                reset_time = decision.reset_time,
                "Rate limit exceeded"
            );
        }

        decision
    }

    /// Get the limiter's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the limiter's window configuration.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Get the backing store.
    pub fn store(&self) -> &Arc<dyn WindowStore> {
        &self.store
    }
}
