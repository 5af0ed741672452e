//! Client-id suffix generation.
//!
//! Several management clients commonly share one configured identifier, and a
//! broker disconnects the older of two connections presenting the same client
//! id. Each session therefore appends a suffix produced by a [`ClientIdGen`]
//! carried in the transport configuration. Tests inject a deterministic
//! generator; production uses a randomized numeric suffix.

use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Default exclusive upper bound for [`ClientIdGen::random_numeric`].
pub const DEFAULT_SUFFIX_BOUND: u64 = 5000;

type SuffixFn = dyn Fn() -> String + Send + Sync;

/// Produces the suffix appended to the configured client identifier on every
/// `open()`.
///
/// Cheap to clone; clones share state (a sequential generator keeps counting
/// across clones).
#[derive(Clone)]
pub struct ClientIdGen {
    label: &'static str,
    next: Arc<SuffixFn>,
}

impl ClientIdGen {
    // ---

    /// Random decimal suffix in `0..bound`.
    pub fn random_numeric(bound: u64) -> Self {
        // ---
        let bound = bound.max(1);
        Self {
            label: "random_numeric",
            next: Arc::new(move || {
                // A fresh RandomState is seeded per instance, which is all the
                // randomness needed to spread clients apart.
                let hash = RandomState::new().hash_one(std::time::SystemTime::now());
                (hash % bound).to_string()
            }),
        }
    }

    /// Always the same suffix. `fixed("")` yields the bare configured id.
    pub fn fixed(suffix: impl Into<String>) -> Self {
        // ---
        let suffix: String = suffix.into();
        Self {
            label: "fixed",
            next: Arc::new(move || suffix.clone()),
        }
    }

    /// Monotonic decimal suffix starting at `start`.
    pub fn sequential(start: u64) -> Self {
        // ---
        let counter = Arc::new(AtomicU64::new(start));
        Self {
            label: "sequential",
            next: Arc::new(move || counter.fetch_add(1, Ordering::Relaxed).to_string()),
        }
    }

    /// Arbitrary generator.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        Self {
            label: "custom",
            next: Arc::new(f),
        }
    }

    /// Produce the next suffix.
    pub fn next_suffix(&self) -> String {
        (self.next)()
    }

    /// Configured identifier followed by the next suffix.
    pub fn client_id(&self, base: &str) -> String {
        format!("{base}{}", self.next_suffix())
    }
}

impl Default for ClientIdGen {
    fn default() -> Self {
        Self::random_numeric(DEFAULT_SUFFIX_BOUND)
    }
}

impl fmt::Debug for ClientIdGen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ClientIdGen").field(&self.label).finish()
    }
}
