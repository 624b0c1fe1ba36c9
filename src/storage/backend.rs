//! Storage Substrate
//!
//! The store persists through a synchronous string key-value [`Backend`],
//! shaped like browser local/session storage: `get`, `set` (which may fail
//! with a quota error), `remove` and key enumeration.
//!
//! [`MemoryBackend`] is the in-process implementation. Several handles can
//! share one storage *area*, the way several tabs share one origin's local
//! storage. A write through one handle shows up as a [`StorageEvent`] on every
//! other handle's [`EventStream`], never on the writer's own.
//!
//! ```text
//!   MemoryBackend (tab A) ──┐                ┌──> EventStream (tab B)
//!                           ├──> Area ──────>┤
//!   MemoryBackend (tab B) ──┘  data + quota  └──> EventStream (tab A)
//! ```

use crate::error::BackendError;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

/// Capacity of the change-event channel per area.
const EVENT_CAPACITY: usize = 1024;

/// A synchronous string key-value substrate.
pub trait Backend: Send + Sync {
    /// Returns the stored string, if any.
    fn get_item(&self, key: &str) -> Option<String>;

    /// Stores a string. Fails with [`BackendError::QuotaExceeded`] when full.
    fn set_item(&self, key: &str, value: &str) -> Result<(), BackendError>;

    /// Removes a key. Removing a missing key is not an error.
    fn remove_item(&self, key: &str);

    /// Every key currently stored.
    fn keys(&self) -> Vec<String>;
}

/// A change made through another handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    /// The physical key that changed
    pub key: String,
    /// The new value, `None` when the key was removed
    pub new_value: Option<String>,
}

struct Area {
    data: Mutex<BTreeMap<String, String>>,
    quota: Option<usize>,
    events: broadcast::Sender<(u64, StorageEvent)>,
    next_origin: AtomicU64,
}

impl Area {
    fn publish(&self, origin: u64, key: &str, new_value: Option<&str>) {
        // No subscribers is fine.
        let _ = self.events.send((
            origin,
            StorageEvent {
                key: key.to_string(),
                new_value: new_value.map(str::to_string),
            },
        ));
    }
}

/// An in-memory substrate with an optional byte quota.
///
/// Usage is counted as key length plus value length, in bytes.
#[derive(Clone)]
pub struct MemoryBackend {
    area: Arc<Area>,
    origin: u64,
}

impl MemoryBackend {
    /// An unbounded, fresh area.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// A fresh area that rejects writes beyond `bytes`.
    pub fn with_quota(bytes: usize) -> Self {
        Self::build(Some(bytes))
    }

    fn build(quota: Option<usize>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            area: Arc::new(Area {
                data: Mutex::new(BTreeMap::new()),
                quota,
                events,
                next_origin: AtomicU64::new(1),
            }),
            origin: 0,
        }
    }

    /// Another handle on the same area, as if opened from another tab.
    pub fn connect(&self) -> Self {
        Self {
            area: Arc::clone(&self.area),
            origin: self.area.next_origin.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Changes made through *other* handles on this area.
    pub fn subscribe(&self) -> EventStream {
        EventStream {
            rx: self.area.events.subscribe(),
            origin: self.origin,
        }
    }

    /// Bytes currently used.
    pub fn used_bytes(&self) -> usize {
        self.area
            .data
            .lock()
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum()
    }

    /// The configured quota, if any.
    pub fn quota(&self) -> Option<usize> {
        self.area.quota
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.area.data.lock().len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MemoryBackend {
    fn get_item(&self, key: &str) -> Option<String> {
        self.area.data.lock().get(key).cloned()
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), BackendError> {
        {
            let mut data = self.area.data.lock();
            if let Some(quota) = self.area.quota {
                let used: usize = data.iter().map(|(k, v)| k.len() + v.len()).sum();
                let replaced = data.get(key).map_or(0, |old| key.len() + old.len());
                let needed = key.len() + value.len();
                let available = quota.saturating_sub(used - replaced);
                if needed > available {
                    return Err(BackendError::QuotaExceeded {
                        key: key.to_string(),
                        needed,
                        available,
                    });
                }
            }
            data.insert(key.to_string(), value.to_string());
        }
        self.area.publish(self.origin, key, Some(value));
        Ok(())
    }

    fn remove_item(&self, key: &str) {
        let removed = self.area.data.lock().remove(key).is_some();
        if removed {
            self.area.publish(self.origin, key, None);
        }
    }

    fn keys(&self) -> Vec<String> {
        self.area.data.lock().keys().cloned().collect()
    }
}

impl fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("origin", &self.origin)
            .field("keys", &self.len())
            .field("quota", &self.area.quota)
            .finish()
    }
}

/// Change events from other handles on the same area.
pub struct EventStream {
    rx: broadcast::Receiver<(u64, StorageEvent)>,
    origin: u64,
}

impl EventStream {
    /// Waits for the next foreign change. `None` once the area is gone.
    pub async fn recv(&mut self) -> Option<StorageEvent> {
        loop {
            match self.rx.recv().await {
                Ok((origin, event)) if origin != self.origin => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Storage event stream lagged, some changes were missed");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Returns the next foreign change if one is already queued.
    pub fn try_recv(&mut self) -> Option<StorageEvent> {
        loop {
            match self.rx.try_recv() {
                Ok((origin, event)) if origin != self.origin => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Storage event stream lagged, some changes were missed");
                }
                Err(_) => return None,
            }
        }
    }
}
