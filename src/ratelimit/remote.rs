//! Shared window store backed by a remote atomic-counter service.
//!
//! Every process pointing at the same Redis instance shares one counter per
//! identifier and window. Windows are aligned to multiples of the window
//! length, so the key itself names the window and key expiry is the reset.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::OnceCell;
use tracing::{debug, info, trace, warn};

use super::backend::WindowStore;
use super::counter::{Decision, RateLimitConfig};
use crate::error::{Result, TurnstileError};

/// Remaining lifetime of a counter key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// The key expires in this many seconds
    Expiring(u64),
    /// The key exists but has no expiry set
    NoExpiry,
    /// The key does not exist
    Missing,
}

impl KeyTtl {
    /// Interpret a Redis `TTL` reply.
    pub fn from_reply(reply: i64) -> Self {
        match reply {
            -1 => KeyTtl::NoExpiry,
            n if n < 0 => KeyTtl::Missing,
            n => KeyTtl::Expiring(n as u64),
        }
    }
}

/// The three primitives the remote store needs from a key-value service.
#[async_trait]
pub trait CounterClient: Send + Sync {
    /// Increment the key by one and return the new value.
    async fn incr(&self, key: &str) -> Result<u64>;

    /// Set the key to expire after `seconds`.
    async fn expire(&self, key: &str, seconds: u64) -> Result<()>;

    /// Read the key's remaining time to live.
    async fn ttl(&self, key: &str) -> Result<KeyTtl>;
}

/// Redis-backed `CounterClient` holding one shared connection per process.
pub struct RedisCounter {
    client: redis::Client,
    connection: OnceCell<ConnectionManager>,
}

impl std::fmt::Debug for RedisCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounter")
            .field("connected", &self.connection.initialized())
            .finish()
    }
}

impl RedisCounter {
    /// Create a client for `url` and start connecting in the background.
    ///
    /// Only a malformed URL is an error. An unreachable server is not: checks
    /// fail open until a later call manages to connect.
    pub fn connect(url: &str) -> Result<Arc<Self>> {
        let client = redis::Client::open(url)?;
        let counter = Arc::new(Self {
            client,
            connection: OnceCell::new(),
        });

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let warm = counter.clone();
            handle.spawn(async move {
                match warm.connection().await {
                    Ok(_) => info!("Connected to remote counter store"),
                    Err(e) => warn!(
                        error = %e,
                        "Remote counter store unavailable at startup, checks will fail open"
                    ),
                }
            });
        }

        Ok(counter)
    }

    /// Whether the shared connection has been established.
    pub fn is_connected(&self) -> bool {
        self.connection.initialized()
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let conn = self
            .connection
            .get_or_try_init(|| ConnectionManager::new(self.client.clone()))
            .await?;
        Ok(conn.clone())
    }
}

#[async_trait]
impl CounterClient for RedisCounter {
    async fn incr(&self, key: &str) -> Result<u64> {
        let mut conn = self.connection().await?;
        let count: u64 = conn.incr(key, 1u64).await?;
        Ok(count)
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<()> {
        let mut conn = self.connection().await?;
        let seconds = i64::try_from(seconds).unwrap_or(i64::MAX);
        let _: i64 = conn.expire(key, seconds).await?;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        let mut conn = self.connection().await?;
        let reply: i64 = conn.ttl(key).await?;
        Ok(KeyTtl::from_reply(reply))
    }
}

/// Window store that keeps counters in a remote key-value service.
pub struct RemoteStore {
    client: Arc<dyn CounterClient>,
    prefix: String,
    timeout: Duration,
}

impl RemoteStore {
    /// Create a store over `client`, namespacing keys with `prefix` and
    /// bounding each check by `timeout`.
    pub fn new(client: Arc<dyn CounterClient>, prefix: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            prefix: prefix.into(),
            timeout,
        }
    }

    /// Key holding the counter for `identifier` in the window containing `now`.
    pub fn window_key(&self, identifier: &str, config: &RateLimitConfig, now: u64) -> String {
        format!("{}{}:{}", self.prefix, identifier, now / config.window_ms())
    }

    async fn try_record(
        &self,
        identifier: &str,
        config: &RateLimitConfig,
        now: u64,
    ) -> Result<Decision> {
        let key = self.window_key(identifier, config, now);
        let expiry_secs = config.window_ms().div_ceil(1000);

        let count = self.client.incr(&key).await?;
        if count == 1 {
            self.client.expire(&key, expiry_secs).await?;
        }

        let reset_time = match self.client.ttl(&key).await? {
            KeyTtl::Expiring(secs) => now.saturating_add(secs.saturating_mul(1000)),
            KeyTtl::NoExpiry => {
                // The expiry after the first increment was lost; set it again
                // so the key cannot outlive its window.
                debug!(key = %key, "Counter key had no expiry, restoring it");
                self.client.expire(&key, expiry_secs).await?;
                now.saturating_add(config.window_ms())
            }
            KeyTtl::Missing => now.saturating_add(config.window_ms()),
        };

        let max = config.max_requests();
        trace!(key = %key, count, max, "Remote window counter updated");

        if count <= max {
            Ok(Decision::allow(max - count, reset_time))
        } else {
            Ok(Decision::deny(reset_time))
        }
    }
}

#[async_trait]
impl WindowStore for RemoteStore {
    async fn record_and_check(
        &self,
        identifier: &str,
        config: &RateLimitConfig,
        now: u64,
    ) -> Decision {
        let outcome = match tokio::time::timeout(
            self.timeout,
            self.try_record(identifier, config, now),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TurnstileError::StoreTimeout(self.timeout)),
        };

        match outcome {
            Ok(decision) => decision,
            Err(e) => {
                warn!(
                    identifier = %identifier,
                    error = %e,
                    "Remote counter store failed, allowing request"
                );
                Decision::fail_open(config, now)
            }
        }
    }

    fn kind(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// In-process stand-in for Redis. Keys hold absolute deadlines and are
    /// dropped once the clock set by [`FakeCounter::set_clock`] reaches them.
    #[derive(Default)]
    struct FakeCounter {
        clock: AtomicU64,
        keys: Mutex<HashMap<String, FakeKey>>,
        expire_calls: Mutex<Vec<(String, u64)>>,
    }

    struct FakeKey {
        count: u64,
        expires_at: Option<u64>,
    }

    impl FakeCounter {
        fn set_clock(&self, now: u64) {
            self.clock.store(now, Ordering::SeqCst);
        }

        fn now(&self) -> u64 {
            self.clock.load(Ordering::SeqCst)
        }

        fn insert_persistent(&self, key: &str, count: u64) {
            self.keys.lock().insert(
                key.to_string(),
                FakeKey {
                    count,
                    expires_at: None,
                },
            );
        }

        fn contains(&self, key: &str) -> bool {
            let mut keys = self.keys.lock();
            Self::evict_expired(&mut keys, key, self.now());
            keys.contains_key(key)
        }

        fn evict_expired(keys: &mut HashMap<String, FakeKey>, key: &str, now: u64) {
            if matches!(keys.get(key), Some(FakeKey { expires_at: Some(at), .. }) if *at <= now) {
                keys.remove(key);
            }
        }
    }

    #[async_trait]
    impl CounterClient for FakeCounter {
        async fn incr(&self, key: &str) -> Result<u64> {
            let mut keys = self.keys.lock();
            Self::evict_expired(&mut keys, key, self.now());
            let entry = keys.entry(key.to_string()).or_insert(FakeKey {
                count: 0,
                expires_at: None,
            });
            entry.count += 1;
            Ok(entry.count)
        }

        async fn expire(&self, key: &str, seconds: u64) -> Result<()> {
            self.expire_calls.lock().push((key.to_string(), seconds));
            let now = self.now();
            let mut keys = self.keys.lock();
            Self::evict_expired(&mut keys, key, now);
            if let Some(entry) = keys.get_mut(key) {
                entry.expires_at = Some(now + seconds * 1000);
            }
            Ok(())
        }

        async fn ttl(&self, key: &str) -> Result<KeyTtl> {
            let now = self.now();
            let mut keys = self.keys.lock();
            Self::evict_expired(&mut keys, key, now);
            // Redis rounds the remaining milliseconds to the nearest second.
            Ok(match keys.get(key) {
                Some(FakeKey {
                    expires_at: Some(at),
                    ..
                }) => KeyTtl::Expiring((at - now + 500) / 1000),
                Some(FakeKey {
                    expires_at: None, ..
                }) => KeyTtl::NoExpiry,
                None => KeyTtl::Missing,
            })
        }
    }

    struct FailingCounter;

    #[async_trait]
    impl CounterClient for FailingCounter {
        async fn incr(&self, _key: &str) -> Result<u64> {
            Err(redis::RedisError::from((redis::ErrorKind::IoError, "connection refused")).into())
        }

        async fn expire(&self, _key: &str, _seconds: u64) -> Result<()> {
            Err(redis::RedisError::from((redis::ErrorKind::IoError, "connection refused")).into())
        }

        async fn ttl(&self, _key: &str) -> Result<KeyTtl> {
            Err(redis::RedisError::from((redis::ErrorKind::IoError, "connection refused")).into())
        }
    }

    struct HangingCounter;

    #[async_trait]
    impl CounterClient for HangingCounter {
        async fn incr(&self, _key: &str) -> Result<u64> {
            std::future::pending().await
        }

        async fn expire(&self, _key: &str, _seconds: u64) -> Result<()> {
            std::future::pending().await
        }

        async fn ttl(&self, _key: &str) -> Result<KeyTtl> {
            std::future::pending().await
        }
    }

    fn config(window_ms: u64, max: u64) -> RateLimitConfig {
        RateLimitConfig::new(Duration::from_millis(window_ms), max).unwrap()
    }

    fn store(client: Arc<dyn CounterClient>) -> RemoteStore {
        RemoteStore::new(client, "", Duration::from_millis(200))
    }

    async fn check_at(
        store: &RemoteStore,
        counter: &FakeCounter,
        identifier: &str,
        config: &RateLimitConfig,
        now: u64,
    ) -> Decision {
        counter.set_clock(now);
        store.record_and_check(identifier, config, now).await
    }

    #[test]
    fn test_window_key_format() {
        let config = config(1000, 2);
        let plain = store(Arc::new(FakeCounter::default()));
        assert_eq!(plain.window_key("1.2.3.4", &config, 0), "1.2.3.4:0");
        assert_eq!(plain.window_key("1.2.3.4", &config, 999), "1.2.3.4:0");
        assert_eq!(plain.window_key("1.2.3.4", &config, 2500), "1.2.3.4:2");

        let prefixed = RemoteStore::new(
            Arc::new(FakeCounter::default()),
            "ratelimit:api:",
            Duration::from_millis(200),
        );
        assert_eq!(
            prefixed.window_key("1.2.3.4", &config, 1000),
            "ratelimit:api:1.2.3.4:1"
        );
    }

    #[test]
    fn test_ttl_reply_mapping() {
        assert_eq!(KeyTtl::from_reply(-2), KeyTtl::Missing);
        assert_eq!(KeyTtl::from_reply(-1), KeyTtl::NoExpiry);
        assert_eq!(KeyTtl::from_reply(0), KeyTtl::Expiring(0));
        assert_eq!(KeyTtl::from_reply(900), KeyTtl::Expiring(900));
    }

    #[tokio::test]
    async fn test_window_scenario() {
        let counter = Arc::new(FakeCounter::default());
        let store = store(counter.clone());
        let config = config(60_000, 2);

        assert_eq!(
            check_at(&store, &counter, "1.2.3.4", &config, 0).await,
            Decision::allow(1, 60_000)
        );
        assert_eq!(
            check_at(&store, &counter, "1.2.3.4", &config, 20_000).await,
            Decision::allow(0, 60_000)
        );
        assert_eq!(
            check_at(&store, &counter, "1.2.3.4", &config, 45_000).await,
            Decision::deny(60_000)
        );

        // The next window gets a fresh key and the old one has expired
        assert_eq!(
            check_at(&store, &counter, "1.2.3.4", &config, 60_000).await,
            Decision::allow(1, 120_000)
        );
        assert!(!counter.contains("1.2.3.4:0"));
        assert!(counter.contains("1.2.3.4:1"));
    }

    #[tokio::test]
    async fn test_reset_time_tracks_key_ttl() {
        let counter = Arc::new(FakeCounter::default());
        let store = store(counter.clone());
        let config = config(1000, 2);

        assert_eq!(
            check_at(&store, &counter, "1.2.3.4", &config, 0).await,
            Decision::allow(1, 1000)
        );

        // 990ms left on the key, reported by Redis as one whole second
        let second = check_at(&store, &counter, "1.2.3.4", &config, 10).await;
        assert!(second.allowed);
        assert_eq!(second.remaining, 0);
        assert!((1000..=1010).contains(&second.reset_time));

        let denied = check_at(&store, &counter, "1.2.3.4", &config, 20).await;
        assert!(!denied.allowed);
        assert!((1000..=1020).contains(&denied.reset_time));

        assert_eq!(
            check_at(&store, &counter, "1.2.3.4", &config, 1001).await,
            Decision::allow(1, 2001)
        );
    }

    #[tokio::test]
    async fn test_expiry_set_once_per_window() {
        let counter = Arc::new(FakeCounter::default());
        let store = store(counter.clone());
        let config = config(1500, 10);

        for t in 0..5 {
            store.record_and_check("client", &config, t).await;
        }

        let calls = counter.expire_calls.lock().clone();
        assert_eq!(calls, vec![("client:0".to_string(), 2)]);
    }

    #[tokio::test]
    async fn test_missing_expiry_is_restored() {
        let counter = Arc::new(FakeCounter::default());
        counter.insert_persistent("client:0", 3);
        let store = store(counter.clone());
        let config = config(60_000, 10);

        let decision = store.record_and_check("client", &config, 0).await;

        assert_eq!(decision, Decision::allow(6, 60_000));
        assert_eq!(
            counter.expire_calls.lock().clone(),
            vec![("client:0".to_string(), 60)]
        );
    }

    #[tokio::test]
    async fn test_identifiers_do_not_share_quota() {
        let store = store(Arc::new(FakeCounter::default()));
        let config = config(60_000, 1);

        assert!(store.record_and_check("a", &config, 0).await.allowed);
        assert!(!store.record_and_check("a", &config, 1).await.allowed);
        assert!(store.record_and_check("b", &config, 2).await.allowed);
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        let store = store(Arc::new(FailingCounter));
        let config = config(1000, 2);

        for t in 0..20 {
            let decision = store.record_and_check("1.2.3.4", &config, t).await;
            assert_eq!(decision, Decision::allow(1, t + 1000));
        }
    }

    #[tokio::test]
    async fn test_store_timeout_fails_open() {
        let store = RemoteStore::new(Arc::new(HangingCounter), "", Duration::from_millis(20));
        let config = config(1000, 2);

        let decision = store.record_and_check("1.2.3.4", &config, 0).await;
        assert_eq!(decision, Decision::fail_open(&config, 0));
    }

    #[tokio::test]
    async fn test_unreachable_redis_fails_open() {
        // Nothing listens on port 1, so connecting fails and every check is allowed.
        let counter = tokio_test::assert_ok!(RedisCounter::connect("redis://127.0.0.1:1/"));
        let store = RemoteStore::new(counter.clone(), "", Duration::from_millis(300));
        let config = config(1000, 1);

        for t in 0..3 {
            assert!(store.record_and_check("client", &config, t).await.allowed);
        }
        assert!(!counter.is_connected());
    }

    #[test]
    fn test_malformed_url_rejected() {
        let result = RedisCounter::connect("not a url");
        assert!(matches!(result, Err(TurnstileError::Store(_))));
    }
}
