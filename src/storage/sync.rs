//! Sync Scheduler Policies
//!
//! A sync policy decides *when* a mutation reaches the substrate. The
//! in-memory value always changes immediately; only the physical write lags.
//!
//! ```text
//!   set ─┐   set ─┐     set ─┐                 (quiet)
//!        ▼        ▼          ▼
//!   ─────●────────●──────────●────────────────────▶ time
//!        │<─ wait ─>│ reset    │<──── wait ────>│ write
//!        │<────────────── max_wait ─────────────────>│ forced write
//! ```
//!
//! Debounce windows restart on every mutation, but `max_wait` is anchored to
//! the first mutation of the burst so continuous activity still persists.

use crate::runtime::TaskHandle;
use crate::storage::expiry::TtlMeta;
use serde_json::Value;
use std::time::Duration;

/// When mutations reach the substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPolicy {
    /// Write during the mutating call. On an item, this also suppresses the
    /// store-wide default.
    #[default]
    Immediate,

    /// Write once mutations have been quiet for `wait`, or at the latest
    /// `max_wait` after the burst began
    Debounce {
        wait: Duration,
        max_wait: Option<Duration>,
    },

    /// Write at the next idle opportunity, or after `timeout`
    Idle { timeout: Duration },
}

impl SyncPolicy {
    /// A trailing debounce with no maximum wait.
    pub fn debounce(wait: Duration) -> Self {
        SyncPolicy::Debounce {
            wait,
            max_wait: None,
        }
    }

    /// A trailing debounce that forces a write after `max_wait`.
    pub fn debounce_max(wait: Duration, max_wait: Duration) -> Self {
        SyncPolicy::Debounce {
            wait,
            max_wait: Some(max_wait),
        }
    }

    /// Defer to idle time.
    pub fn idle(timeout: Duration) -> Self {
        SyncPolicy::Idle { timeout }
    }

    /// The item's own policy wins; without one the store default applies.
    pub fn resolve(item: Option<SyncPolicy>, store_default: Option<SyncPolicy>) -> SyncPolicy {
        item.or(store_default).unwrap_or_default()
    }
}

/// Milliseconds until a debounced write should fire.
///
/// * `burst_started` - when the first pending mutation of this burst was scheduled
pub fn debounce_delay(
    wait: Duration,
    max_wait: Option<Duration>,
    burst_started: u64,
    now: u64,
) -> u64 {
    let wait = wait.as_millis() as u64;
    match max_wait {
        Some(max_wait) => {
            let forced_at = burst_started.saturating_add(max_wait.as_millis() as u64);
            wait.min(forced_at.saturating_sub(now))
        }
        None => wait,
    }
}

/// A write waiting for its deferral window to close.
#[derive(Debug)]
pub(crate) struct PendingSync {
    /// Latest value for the key; supersedes earlier mutations in the burst
    pub value: Value,
    /// TTL metadata stamped at mutation time
    pub meta: Option<TtlMeta>,
    /// Cancels the scheduled flush
    pub handle: TaskHandle,
    /// When the first mutation of the burst was scheduled
    pub started_at: u64,
}
