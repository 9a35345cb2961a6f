//! Named limiters, backend selection, and the background sweep.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::backend::WindowStore;
use super::counter::{epoch_millis, RateLimitConfig};
use super::limiter::RateLimiter;
use super::memory::MemoryStore;
use super::remote::{RedisCounter, RemoteStore};
use crate::config::RateLimitingConfig;
use crate::error::{Result, TurnstileError};

/// The limiters every deployment carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimiterKind {
    /// General API traffic
    Api,
    /// Authentication attempts
    Auth,
    /// Heavyweight processing endpoints
    Processing,
}

impl LimiterKind {
    pub const ALL: [LimiterKind; 3] = [LimiterKind::Api, LimiterKind::Auth, LimiterKind::Processing];

    pub fn name(&self) -> &'static str {
        match self {
            LimiterKind::Api => "api",
            LimiterKind::Auth => "auth",
            LimiterKind::Processing => "processing",
        }
    }

    /// The compiled-in window and quota for this limiter.
    pub fn config(&self) -> Result<RateLimitConfig> {
        match self {
            LimiterKind::Api => RateLimitConfig::new(Duration::from_secs(15 * 60), 100),
            LimiterKind::Auth => RateLimitConfig::new(Duration::from_secs(15 * 60), 5),
            LimiterKind::Processing => RateLimitConfig::new(Duration::from_secs(60 * 60), 50),
        }
    }
}

impl fmt::Display for LimiterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LimiterKind {
    type Err = TurnstileError;

    fn from_str(s: &str) -> Result<Self> {
        LimiterKind::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| TurnstileError::Config(format!("unknown limiter: {}", s)))
    }
}

/// Handle to the running sweep task.
struct Sweeper {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Owns the named limiters and the sweep task for their stores.
///
/// Built once by the application's startup routine; the backend chosen here
/// is never re-evaluated.
pub struct LimiterRegistry {
    limiters: HashMap<LimiterKind, Arc<RateLimiter>>,
    backend: &'static str,
    sweeper: Mutex<Option<Sweeper>>,
}

impl fmt::Debug for LimiterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LimiterRegistry")
            .field("backend", &self.backend)
            .field("limiters", &self.limiters.len())
            .finish()
    }
}

impl LimiterRegistry {
    /// Build the registry, choosing Redis when a remote URL is configured
    /// and process memory otherwise.
    ///
    /// Must be called from within a Tokio runtime when the memory backend is
    /// selected, since the sweep task is spawned here.
    pub fn from_config(config: &RateLimitingConfig) -> Result<Self> {
        let sweep_interval = Duration::from_secs(config.sweep_interval_secs);

        match config.remote_url.as_deref() {
            Some(url) => {
                if config.remote_timeout_ms == 0 {
                    return Err(TurnstileError::Config(
                        "remote timeout must be greater than zero".to_string(),
                    ));
                }

                info!("Remote store URL configured, using redis backend");
                let counter = RedisCounter::connect(url)?;
                let timeout = Duration::from_millis(config.remote_timeout_ms);
                Self::with_stores(
                    |kind| {
                        let prefix = format!("{}:{}:", config.key_prefix, kind.name());
                        Arc::new(RemoteStore::new(counter.clone(), prefix, timeout))
                    },
                    sweep_interval,
                )
            }
            None => {
                info!("No remote store URL configured, using in-memory backend");
                Self::with_stores(|_| Arc::new(MemoryStore::new()), sweep_interval)
            }
        }
    }

    /// Build the registry with one store per limiter from `make_store`.
    ///
    /// A sweep task is started when any store supports sweeping.
    pub fn with_stores<F>(mut make_store: F, sweep_interval: Duration) -> Result<Self>
    where
        F: FnMut(LimiterKind) -> Arc<dyn WindowStore>,
    {
        if sweep_interval.is_zero() {
            return Err(TurnstileError::Config(
                "sweep interval must be greater than zero".to_string(),
            ));
        }

        let mut limiters = HashMap::new();
        let mut backend = "memory";

        for kind in LimiterKind::ALL {
            let config = kind.config()?;
            let store = make_store(kind);
            backend = store.kind();

            info!(
                limiter = %kind,
                backend,
                window_ms = config.window_ms(),
                max_requests = config.max_requests(),
                "Rate limiter initialized"
            );
            limiters.insert(kind, Arc::new(RateLimiter::new(kind.name(), config, store)));
        }

        let sweepable: Vec<Arc<dyn WindowStore>> = limiters
            .values()
            .map(|limiter| limiter.store().clone())
            .filter(|store| store.supports_sweep())
            .collect();

        let sweeper = if sweepable.is_empty() {
            None
        } else {
            Some(spawn_sweeper(sweepable, sweep_interval))
        };

        Ok(Self {
            limiters,
            backend,
            sweeper: Mutex::new(sweeper),
        })
    }

    /// Get a limiter by kind.
    pub fn get(&self, kind: LimiterKind) -> Option<&Arc<RateLimiter>> {
        self.limiters.get(&kind)
    }

    /// Name of the backend the limiters were built on.
    pub fn backend(&self) -> &'static str {
        self.backend
    }

    /// Whether the background sweep is still scheduled.
    pub fn is_sweeping(&self) -> bool {
        self.sweeper
            .lock()
            .as_ref()
            .map(|s| !s.handle.is_finished())
            .unwrap_or(false)
    }

    /// Stop the background sweep and wait for it to finish.
    pub async fn shutdown(&self) {
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.shutdown.send(true);
            if let Err(e) = sweeper.handle.await {
                warn!(error = %e, "Sweep task ended abnormally");
            }
            info!("Rate limiter sweep stopped");
        }
    }
}

impl Drop for LimiterRegistry {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            sweeper.handle.abort();
        }
    }
}

fn spawn_sweeper(stores: Vec<Arc<dyn WindowStore>>, interval: Duration) -> Sweeper {
    let (shutdown, mut shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately; there is nothing to sweep yet.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => sweep_all(&stores, epoch_millis()),
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    });

    Sweeper { shutdown, handle }
}

fn sweep_all(stores: &[Arc<dyn WindowStore>], now: u64) {
    for store in stores {
        match store.sweep(now) {
            Ok(0) => {}
            Ok(removed) => debug!(backend = store.kind(), removed, "Swept expired rate limit windows"),
            Err(e) => warn!(backend = store.kind(), error = %e, "Rate limit sweep failed"),
        }
    }
}
