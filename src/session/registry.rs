//! Process-wide registry of call sessions
//!
//! Sessions publish read-only snapshots here for the metrics endpoints. The
//! registry is never consulted by pipeline logic.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use lru::LruCache;
use serde::Serialize;

use crate::pipeline::{CallMetrics, TurnRecord};

/// Default number of finished calls kept for lookup
pub const DEFAULT_FINISHED_CAPACITY: usize = 256;

/// Point-in-time view of one call
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub call_id: String,
    pub stream_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub active: bool,
    pub speaking: bool,
    pub caller: HashMap<String, String>,
    pub turns: Vec<TurnRecord>,
    pub metrics: CallMetrics,
}

/// Active sessions plus a bounded history of finished ones
pub struct SessionRegistry {
    active: DashMap<String, SessionSnapshot>,
    finished: Mutex<LruCache<String, SessionSnapshot>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_FINISHED_CAPACITY)
    }
}

impl SessionRegistry {
    #[must_use]
    pub fn new(finished_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(finished_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            active: DashMap::new(),
            finished: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Publish the latest snapshot of an active call
    pub fn publish(&self, snapshot: SessionSnapshot) {
        self.active.insert(snapshot.call_id.clone(), snapshot);
    }

    /// Move a call to the finished history
    pub fn finish(&self, snapshot: SessionSnapshot) {
        self.active.remove(&snapshot.call_id);
        self.finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put(snapshot.call_id.clone(), snapshot);
    }

    /// Look up a call, active or recently finished
    #[must_use]
    pub fn get(&self, call_id: &str) -> Option<SessionSnapshot> {
        if let Some(snapshot) = self.active.get(call_id) {
            return Some(snapshot.clone());
        }
        self.finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .peek(call_id)
            .cloned()
    }

    /// Snapshots of every active call, oldest first
    #[must_use]
    pub fn active(&self) -> Vec<SessionSnapshot> {
        let mut sessions: Vec<SessionSnapshot> =
            self.active.iter().map(|entry| entry.value().clone()).collect();
        sessions.sort_by_key(|s| s.started_at);
        sessions
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}
