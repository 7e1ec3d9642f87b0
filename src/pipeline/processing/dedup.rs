use crate::observability::metrics;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

const DEFAULT_SHARDS: usize = 16;

/// Entity kinds tracked by a deduplicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Song,
    User,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Song => "song",
            EntityKind::User => "user",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// First sighting of the key in this pass; forward for persistence.
    Admit,
    /// Key already seen in this pass; discard.
    Suppress,
}

/// Set of natural keys seen during one pass.
///
/// Create it empty at the start of a pass and drop it at the end. Keys are
/// partitioned across shards by hash, each behind its own lock, so two callers
/// can never both admit the same key. Memory grows with distinct keys only.
#[derive(Debug)]
pub struct EntityDeduplicator {
    kind: EntityKind,
    shards: Vec<Mutex<HashSet<Box<str>>>>,
    admitted: AtomicU64,
    suppressed: AtomicU64,
}

impl EntityDeduplicator {
    pub fn new(kind: EntityKind) -> Self {
        Self::with_shards(kind, DEFAULT_SHARDS)
    }

    pub fn with_shards(kind: EntityKind, shards: usize) -> Self {
        let shards = shards.max(1);
        Self {
            kind,
            shards: (0..shards).map(|_| Mutex::new(HashSet::new())).collect(),
            admitted: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
        }
    }

    fn shard_for(&self, key: &str) -> &Mutex<HashSet<Box<str>>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    pub fn admit(&self, key: &str) -> Admission {
        let inserted = {
            let mut shard = self
                .shard_for(key)
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if shard.contains(key) {
                false
            } else {
                shard.insert(key.into())
            }
        };

        if inserted {
            self.admitted.fetch_add(1, Ordering::Relaxed);
            metrics::dedup::admitted(self.kind.as_str());
            Admission::Admit
        } else {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            metrics::dedup::suppressed(self.kind.as_str());
            Admission::Suppress
        }
    }

    pub fn admitted(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }

    pub fn suppressed(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }
}
