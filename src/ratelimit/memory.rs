//! Process-local window store.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::trace;

use super::backend::WindowStore;
use super::counter::{Decision, RateLimitConfig, WindowRecord};
use crate::error::Result;

/// Window store that keeps one record per identifier in process memory.
///
/// Each check is a read-modify-write under the owning shard's lock with no
/// await point inside, so two tasks hitting the same identifier cannot lose
/// an update.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<String, WindowRecord>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one request and decide, synchronously.
    pub fn check(&self, identifier: &str, config: &RateLimitConfig, now: u64) -> Decision {
        let max = config.max_requests();

        match self.records.entry(identifier.to_owned()) {
            Entry::Vacant(vacant) => {
                let record = WindowRecord::open(now, config);
                vacant.insert(record);
                Decision::allow(max - 1, record.reset_time)
            }
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();

                if record.is_expired(now) {
                    *record = WindowRecord::open(now, config);
                    return Decision::allow(max - 1, record.reset_time);
                }

                if record.count >= max {
                    return Decision::deny(record.reset_time);
                }

                record.count += 1;
                Decision::allow(max - record.count, record.reset_time)
            }
        }
    }

    /// Get the stored record for an identifier, if any.
    pub fn record(&self, identifier: &str) -> Option<WindowRecord> {
        self.records.get(identifier).map(|r| *r)
    }

    /// Get the number of tracked identifiers.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl WindowStore for MemoryStore {
    async fn record_and_check(
        &self,
        identifier: &str,
        config: &RateLimitConfig,
        now: u64,
    ) -> Decision {
        self.check(identifier, config, now)
    }

    fn supports_sweep(&self) -> bool {
        true
    }

    fn sweep(&self, now: u64) -> Result<usize> {
        let before = self.records.len();
        self.records.retain(|_, record| record.reset_time >= now);
        let removed = before.saturating_sub(self.records.len());

        trace!(removed, remaining = self.records.len(), "Swept expired windows");
        Ok(removed)
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}
