//! TTL Engine
//!
//! Pure expiry bookkeeping. The facade owns the timers and the substrate;
//! this module only answers three questions for a value and its metadata:
//!
//! 1. What metadata should a fresh write carry? ([`stamp`], [`reconcile`])
//! 2. Has anything expired? ([`evaluate`])
//! 3. When should we look again? ([`next_deadline`])
//!
//! ## Policies
//!
//! - **Whole-item**: the value expires as a unit `duration` after its last write.
//! - **Partitioned**: a function derives part ids from the value; each part
//!   expires `duration` after it *first appeared*. Rewriting the value keeps the
//!   timestamps of parts that already existed, so only new parts get "now".
//!   Expired parts are cut out of the value with the removal function. A
//!   partitioned item never expires as a unit.
//!
//! ## Lifecycle per physical key
//!
//! ```text
//!   Unset ──write/read──> Tracked ──write──> Refreshed
//!                            │
//!                            ├──deadline (parts)──> PartiallyExpired
//!                            └──deadline (whole)──> FullyExpired (entry deleted)
//! ```

use crate::item::guarded;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Derives part ids from a value.
pub type PartsFn = Arc<dyn Fn(&Value) -> Vec<String> + Send + Sync>;

/// Returns the value with one part removed.
pub type RemovePartFn = Arc<dyn Fn(Value, &str) -> Value + Send + Sync>;

/// How an item expires.
#[derive(Clone)]
pub enum TtlPolicy {
    /// The whole value expires `duration` after its last write
    Whole { duration: Duration },

    /// Each part expires `duration` after it first appeared
    Parts {
        duration: Duration,
        parts: PartsFn,
        remove: RemovePartFn,
    },
}

impl TtlPolicy {
    /// A whole-item policy.
    pub fn whole(duration: Duration) -> Self {
        TtlPolicy::Whole { duration }
    }

    /// A partitioned policy.
    pub fn parts<P, R>(duration: Duration, parts: P, remove: R) -> Self
    where
        P: Fn(&Value) -> Vec<String> + Send + Sync + 'static,
        R: Fn(Value, &str) -> Value + Send + Sync + 'static,
    {
        TtlPolicy::Parts {
            duration,
            parts: Arc::new(parts),
            remove: Arc::new(remove),
        }
    }

    /// The configured lifetime.
    pub fn duration(&self) -> Duration {
        match self {
            TtlPolicy::Whole { duration } | TtlPolicy::Parts { duration, .. } => *duration,
        }
    }

    fn duration_ms(&self) -> u64 {
        self.duration().as_millis() as u64
    }
}

impl fmt::Debug for TtlPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TtlPolicy::Whole { duration } => {
                f.debug_struct("Whole").field("duration", duration).finish()
            }
            TtlPolicy::Parts { duration, .. } => {
                f.debug_struct("Parts").field("duration", duration).finish()
            }
        }
    }
}

/// Expiry metadata for one stored value. Timestamps are unix milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TtlMeta {
    /// Last write of the value
    pub updated_at: u64,
    /// First appearance of each part (partitioned policies only)
    pub parts: BTreeMap<String, u64>,
}

impl TtlMeta {
    /// Metadata with only a whole-item timestamp.
    pub fn at(updated_at: u64) -> Self {
        Self {
            updated_at,
            parts: BTreeMap::new(),
        }
    }
}

/// Result of checking a value against its metadata.
#[derive(Debug, Clone, PartialEq)]
pub enum Expiry {
    /// Nothing expired
    Fresh,
    /// The whole value expired; delete it
    Expired,
    /// Some parts expired and were cut out
    Trimmed {
        value: Value,
        meta: TtlMeta,
        removed: Vec<String>,
    },
}

fn part_ids(item: &str, parts: &PartsFn, value: &Value) -> Vec<String> {
    guarded(item, "ttl parts", || parts(value)).unwrap_or_default()
}

/// Metadata for a value that was just written: the whole-item timestamp moves
/// to `now`, new parts start at `now`, existing parts keep their timestamps.
pub fn stamp(
    item: &str,
    policy: &TtlPolicy,
    previous: Option<&TtlMeta>,
    value: &Value,
    now: u64,
) -> TtlMeta {
    let mut meta = reconcile(item, policy, previous, value, now);
    meta.updated_at = now;
    meta
}

/// Like [`stamp`] but keeps the whole-item timestamp. Used when a value changes
/// without a user write (pruning on load), so the change does not extend its life.
pub fn reconcile(
    item: &str,
    policy: &TtlPolicy,
    previous: Option<&TtlMeta>,
    value: &Value,
    now: u64,
) -> TtlMeta {
    let updated_at = previous.map_or(now, |p| p.updated_at);
    match policy {
        TtlPolicy::Whole { .. } => TtlMeta::at(updated_at),
        TtlPolicy::Parts { parts, .. } => {
            let parts = part_ids(item, parts, value)
                .into_iter()
                .map(|id| {
                    let since = previous
                        .and_then(|p| p.parts.get(&id).copied())
                        .unwrap_or(now);
                    (id, since)
                })
                .collect();
            TtlMeta { updated_at, parts }
        }
    }
}

/// Checks `value` for expiry at `now`.
pub fn evaluate(item: &str, policy: &TtlPolicy, meta: &TtlMeta, value: &Value, now: u64) -> Expiry {
    let ttl = policy.duration_ms();
    match policy {
        TtlPolicy::Whole { .. } => {
            if now.saturating_sub(meta.updated_at) >= ttl {
                Expiry::Expired
            } else {
                Expiry::Fresh
            }
        }
        TtlPolicy::Parts { remove, .. } => {
            let removed: Vec<String> = meta
                .parts
                .iter()
                .filter(|(_, since)| now.saturating_sub(**since) >= ttl)
                .map(|(id, _)| id.clone())
                .collect();

            if removed.is_empty() {
                return Expiry::Fresh;
            }

            let mut value = value.clone();
            for id in &removed {
                // A failing removal leaves the part in place; its timestamp is
                // still dropped so the next write restarts its clock.
                if let Some(next) = guarded(item, "ttl remove part", || remove(value.clone(), id)) {
                    value = next;
                }
            }

            let mut meta = meta.clone();
            for id in &removed {
                meta.parts.remove(id);
            }

            Expiry::Trimmed {
                value,
                meta,
                removed,
            }
        }
    }
}

/// The earliest instant at which [`evaluate`] could report something.
pub fn next_deadline(policy: &TtlPolicy, meta: &TtlMeta) -> Option<u64> {
    let ttl = policy.duration_ms();
    match policy {
        TtlPolicy::Whole { .. } => Some(meta.updated_at.saturating_add(ttl)),
        TtlPolicy::Parts { .. } => meta
            .parts
            .values()
            .min()
            .map(|since| since.saturating_add(ttl)),
    }
}
