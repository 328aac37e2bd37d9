//! In-process storage backend.
//!
//! Counters, claims and event logs live in sharded concurrent maps. Every
//! read-modify-write on a key happens while holding that key's shard lock, so
//! a window reset and the first increment of the new window cannot interleave
//! with another caller. Expiry is lazy on access and also enforced by
//! [`MemoryStore::sweep`], which a background task runs periodically.
//!
//! This store is consistent within one process only. Instances running side by
//! side each keep their own counts.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{BackendError, StorageBackend, WindowCount};
use crate::clock::{add_duration, duration_between, sub_duration, Clock, SystemClock};

/// A fixed-window counter with an absolute expiry.
#[derive(Debug)]
struct WindowCounter {
    count: u64,
    expires_at: DateTime<Utc>,
}

/// Ordered timestamps for one identifier.
#[derive(Debug)]
struct EventLog {
    events: VecDeque<DateTime<Utc>>,
    /// Retention requested by the most recent append.
    retention: Duration,
}

impl EventLog {
    fn new(retention: Duration) -> Self {
        Self {
            events: VecDeque::new(),
            retention,
        }
    }

    /// Insert keeping timestamps ordered; concurrent writers may arrive slightly out of order.
    fn insert(&mut self, at: DateTime<Utc>) {
        let idx = self.events.partition_point(|t| *t <= at);
        self.events.insert(idx, at);
    }

    /// Drop everything strictly older than `cutoff`. Returns how many were dropped.
    fn trim_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let stale = self.events.partition_point(|t| *t < cutoff);
        self.events.drain(..stale);
        stale
    }

    fn count_since(&self, since: DateTime<Utc>) -> u64 {
        let older = self.events.partition_point(|t| *t < since);
        (self.events.len() - older) as u64
    }
}

/// Number of entries removed by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub counters: usize,
    pub claims: usize,
    pub event_logs: usize,
}

impl SweepStats {
    /// Total number of entries removed.
    pub fn total(&self) -> usize {
        self.counters + self.claims + self.event_logs
    }
}

/// In-memory storage backend.
#[derive(Debug)]
pub struct MemoryStore {
    counters: DashMap<String, WindowCounter>,
    claims: DashMap<String, DateTime<Utc>>,
    events: DashMap<String, EventLog>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create a store driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create a store driven by the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: DashMap::new(),
            claims: DashMap::new(),
            events: DashMap::new(),
            clock,
        }
    }

    /// Remove expired counters and claims, trim event logs to their retention
    /// and drop logs left empty.
    pub fn sweep(&self) -> SweepStats {
        let now = self.clock.now();
        let mut stats = SweepStats::default();

        self.counters.retain(|_, counter| {
            let live = counter.expires_at > now;
            if !live {
                stats.counters += 1;
            }
            live
        });

        self.claims.retain(|_, expires_at| {
            let live = *expires_at > now;
            if !live {
                stats.claims += 1;
            }
            live
        });

        self.events.retain(|_, log| {
            log.trim_before(sub_duration(now, log.retention));
            let live = !log.events.is_empty();
            if !live {
                stats.event_logs += 1;
            }
            live
        });

        stats
    }

    /// Spawn a task that calls [`sweep`](Self::sweep) every `interval`.
    ///
    /// The task holds only a weak reference and exits once the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    debug!("Memory store dropped, stopping sweeper");
                    break;
                };
                let stats = store.sweep();
                if stats.total() > 0 {
                    debug!(
                        counters = stats.counters,
                        claims = stats.claims,
                        event_logs = stats.event_logs,
                        "Swept expired entries"
                    );
                }
            }
        })
    }

    /// Number of counters currently held, expired or not.
    pub fn counter_count(&self) -> usize {
        self.counters.len()
    }

    /// Number of claims currently held, expired or not.
    pub fn claim_count(&self) -> usize {
        self.claims.len()
    }

    /// Number of identifiers with an event log.
    pub fn event_log_count(&self) -> usize {
        self.events.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn increment_with_expiry(
        &self,
        key: &str,
        window: Duration,
    ) -> Result<WindowCount, BackendError> {
        let now = self.clock.now();
        let mut counter = self
            .counters
            .entry(key.to_string())
            .or_insert_with(|| WindowCounter {
                count: 0,
                expires_at: add_duration(now, window),
            });

        if counter.expires_at <= now {
            trace!(key = %key, "Window expired, starting a new one");
            counter.count = 0;
            counter.expires_at = add_duration(now, window);
        }

        counter.count += 1;

        Ok(WindowCount {
            count: counter.count,
            ttl: duration_between(now, counter.expires_at),
        })
    }

    async fn claim_once(&self, key: &str, ttl: Duration) -> Result<bool, BackendError> {
        let now = self.clock.now();
        let claimed = match self.claims.entry(key.to_string()) {
            Entry::Occupied(mut existing) => {
                if *existing.get() > now {
                    false
                } else {
                    existing.insert(add_duration(now, ttl));
                    true
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(add_duration(now, ttl));
                true
            }
        };
        Ok(claimed)
    }

    async fn append_event(
        &self,
        key: &str,
        at: DateTime<Utc>,
        retention: Duration,
    ) -> Result<(), BackendError> {
        let mut log = self
            .events
            .entry(key.to_string())
            .or_insert_with(|| EventLog::new(retention));
        log.retention = retention;
        log.trim_before(sub_duration(at, retention));
        log.insert(at);
        Ok(())
    }

    async fn count_events(
        &self,
        key: &str,
        since: DateTime<Utc>,
        retain_after: DateTime<Utc>,
    ) -> Result<u64, BackendError> {
        let Some(mut log) = self.events.get_mut(key) else {
            return Ok(0);
        };
        let trimmed = log.trim_before(retain_after);
        if trimmed > 0 {
            trace!(key = %key, trimmed, "Trimmed events past retention");
        }
        Ok(log.count_since(since))
    }
}
