//! Item Store Facade
//!
//! [`Store`] is the only entry point applications use. It owns the in-memory
//! cells, TTL timers and pending writes for every configured item and
//! orchestrates the codecs and engines around them.
//!
//! ## Data Flow
//!
//! ```text
//!   get ──> cell hit? ──yes──> lazy expiry check ──> value
//!             │no
//!             ▼
//!   substrate ─> decode ─> TTL evaluate ─> prune ─> cell
//!                                  │ dirty (stamped, trimmed, pruned, migrated)
//!                                  ▼
//!                               rewrite
//!
//!   set ──> default? ──yes──> delete
//!             │no
//!             ▼
//!   prune ─> stamp TTL ─> sync policy ─┬─ immediate ─> write (quota recovery)
//!                                      └─ deferred ──> pending ─> flush later
//! ```
//!
//! ## Concurrency Model
//!
//! All mutable state sits behind one `parking_lot::Mutex`. Public operations
//! take the lock once and pass `&mut State` down; helpers never re-lock.
//! Scheduled tasks (TTL timers, deferred writes, housekeeping) hold a `Weak`
//! reference, so they become no-ops once the last [`Store`] handle is dropped.
//! User callbacks that run arbitrary code while a value is being computed
//! (`update`, `produce`) are invoked *outside* the lock.

use crate::codec::envelope;
use crate::codec::key::{is_own_key, parse_key, physical_key, KeyParts, StorageTarget};
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::item::{ItemConfig, Selector};
use crate::runtime::{Task, TaskHandle};
use crate::storage::backend::{Backend, EventStream};
use crate::storage::expiry::{self, Expiry, TtlMeta};
use crate::storage::prune;
use crate::storage::quota::{self, Candidate};
use crate::storage::sync::{self, PendingSync, SyncPolicy};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

const TARGETS: [StorageTarget; 2] = [StorageTarget::Persistent, StorageTarget::TabScoped];

/// Selects which sessions [`Store::clear_all_by`] removes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionFilter {
    /// Every owned key
    All,
    /// Keys written without a session
    Unscoped,
    /// Keys written under this session id
    Session(String),
}

impl SessionFilter {
    fn matches(&self, session: Option<&str>) -> bool {
        match self {
            SessionFilter::All => true,
            SessionFilter::Unscoped => session.is_none(),
            SessionFilter::Session(id) => session == Some(id.as_str()),
        }
    }
}

/// Counters describing store activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Substrate reads on cache misses
    pub reads: u64,
    /// Physical writes of item values
    pub writes: u64,
    /// Mutations whose write was deferred
    pub deferred: u64,
    /// Values or parts removed by TTL expiry
    pub expired: u64,
    /// Entries evicted to recover from quota pressure
    pub evicted: u64,
    /// Stored payloads rejected by decoding or validation
    pub decode_failures: u64,
    /// Changes adopted from other contexts
    pub external_changes: u64,
}

/// What a housekeeping pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Housekeeping {
    /// Owned keys no configured item accounts for
    pub orphans: usize,
    /// Entries expired or trimmed by the TTL sweep
    pub expired: usize,
}

#[derive(Default)]
struct Counters {
    reads: AtomicU64,
    writes: AtomicU64,
    deferred: AtomicU64,
    expired: AtomicU64,
    evicted: AtomicU64,
    decode_failures: AtomicU64,
    external_changes: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> StoreStats {
        StoreStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            external_changes: self.external_changes.load(Ordering::Relaxed),
        }
    }
}

struct TtlEntry {
    meta: TtlMeta,
    timer: Option<TaskHandle>,
}

#[derive(Default)]
struct State {
    /// One cell per physical key that has been read or written
    cells: HashMap<String, watch::Sender<Value>>,
    ttl: HashMap<String, TtlEntry>,
    pending: HashMap<String, PendingSync>,
    /// Set while quota recovery runs; writes inside recovery do not recurse
    recovering: bool,
}

struct Inner {
    config: StoreConfig,
    items: HashMap<String, Arc<ItemConfig>>,
    state: Mutex<State>,
    stats: Counters,
}

/// A persistent, reactive store of logical items.
///
/// Cloning is cheap; clones share all state.
///
/// ```
/// use serde_json::json;
/// use slsm::{ItemConfig, MemoryBackend, Store, StoreConfig};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let config = StoreConfig::builder()
///     .persistent(MemoryBackend::new())
///     .build()
///     .unwrap();
/// let store = Store::new(config, [ItemConfig::new("theme", json!("light"))]);
///
/// store.set("theme", json!("dark")).unwrap();
/// assert_eq!(store.get("theme").unwrap(), json!("dark"));
/// # }
/// ```
#[derive(Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

/// Keeps a [`Store::listen`] task alive. Dropping it stops listening.
#[derive(Debug)]
pub struct ListenerHandle {
    task: JoinHandle<()>,
}

impl ListenerHandle {
    /// Stops listening.
    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl Store {
    /// Creates a store over `items`. Item names must be unique; a later
    /// definition replaces an earlier one with the same name.
    ///
    /// When housekeeping is enabled, orphan removal and a TTL sweep are
    /// scheduled for the next idle opportunity.
    pub fn new(config: StoreConfig, items: impl IntoIterator<Item = ItemConfig>) -> Self {
        let mut map = HashMap::new();
        for item in items {
            if map.contains_key(&item.name) {
                warn!(item = %item.name, "Item configured twice, keeping the last definition");
            }
            map.insert(item.name.clone(), Arc::new(item));
        }

        let inner = Arc::new(Inner {
            config,
            items: map,
            state: Mutex::new(State::default()),
            stats: Counters::default(),
        });

        if inner.config.housekeeping {
            let weak = Arc::downgrade(&inner);
            inner.config.scheduler.run_when_idle(
                inner.config.housekeeping_timeout,
                Box::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.housekeep();
                    }
                }),
            );
        }

        debug!(
            namespace = %inner.config.namespace,
            items = inner.items.len(),
            "Store initialized"
        );
        Self { inner }
    }

    /// Current value of an item, loading it from the substrate on first access.
    ///
    /// Session-scoped items return their default while no session is active.
    pub fn get(&self, name: &str) -> StoreResult<Value> {
        let item = self.inner.item(name)?;
        let Some(key) = self.inner.key_for(&item) else {
            return Ok(item.default.clone());
        };
        let mut st = self.inner.state.lock();
        Ok(self.inner.load(&mut st, &item, &key))
    }

    /// Replaces an item's value. Setting the default deletes the item.
    ///
    /// Only fails with [`StoreError::QuotaExceeded`] when an immediate write
    /// cannot fit even after quota recovery, or when the substrate is unusable.
    pub fn set(&self, name: &str, value: Value) -> StoreResult<()> {
        let item = self.inner.item(name)?;
        let Some(key) = self.inner.key_for(&item) else {
            trace!(item = name, "No active session, ignoring set");
            return Ok(());
        };
        let mut st = self.inner.state.lock();
        self.inner.load(&mut st, &item, &key);
        self.inner.commit(&mut st, &item, &key, value)
    }

    /// Computes the next value from the current one. Returning `None` deletes.
    pub fn update<F>(&self, name: &str, f: F) -> StoreResult<()>
    where
        F: FnOnce(&Value) -> Option<Value>,
    {
        let current = self.get(name)?;
        match f(&current) {
            Some(next) => self.set(name, next),
            None => self.delete(name),
        }
    }

    /// Mutates a copy of the current value in place and stores the result.
    ///
    /// The recipe never sees the cached value itself, so earlier results of
    /// [`Store::get`] are unaffected.
    pub fn produce<F>(&self, name: &str, recipe: F) -> StoreResult<()>
    where
        F: FnOnce(&mut Value),
    {
        let mut draft = self.get(name)?;
        recipe(&mut draft);
        self.set(name, draft)
    }

    /// Removes an item from the substrate and resets it to its default.
    pub fn delete(&self, name: &str) -> StoreResult<()> {
        let item = self.inner.item(name)?;
        let Some(key) = self.inner.key_for(&item) else {
            return Ok(());
        };
        let mut st = self.inner.state.lock();
        self.inner.remove_entry(&mut st, item.target, &key);
        debug!(item = name, key = %key, "Deleted item");
        Ok(())
    }

    /// Removes every key this store owns, in every session.
    pub fn clear_all(&self) -> usize {
        self.clear_all_by(SessionFilter::All)
    }

    /// Removes every owned key whose session matches `filter`, cancels their
    /// pending writes and resets their cells. Returns the number of stored
    /// entries removed.
    pub fn clear_all_by(&self, filter: SessionFilter) -> usize {
        let inner = &self.inner;
        let mut st = inner.state.lock();

        let matches = |key: &str| {
            inner
                .parts(key)
                .is_some_and(|parts| filter.matches(parts.session.as_deref()))
        };

        let mut cleared = 0;
        for target in TARGETS {
            for key in inner.backend(target).keys() {
                if matches(&key) && inner.remove_entry(&mut st, target, &key) {
                    cleared += 1;
                }
            }
        }

        // Pending writes and loaded cells with nothing stored yet.
        let loose: BTreeSet<String> = st.pending.keys().chain(st.cells.keys()).cloned().collect();
        for key in loose {
            if !matches(&key) {
                continue;
            }
            if let Some(item) = inner.item_for_key(&key) {
                inner.remove_entry(&mut st, item.target, &key);
            }
        }

        debug!(cleared, filter = ?filter, "Cleared stored items");
        cleared
    }

    /// Writes every pending deferred mutation now. Returns the first failure,
    /// after attempting all of them.
    pub fn flush(&self) -> StoreResult<()> {
        let inner = &self.inner;
        let mut st = inner.state.lock();
        let keys: Vec<String> = st.pending.keys().cloned().collect();

        let mut first_error = None;
        for key in keys {
            let Some(pending) = st.pending.remove(&key) else {
                continue;
            };
            inner.config.scheduler.cancel(pending.handle);
            if let Err(e) = inner.flush_pending(&mut st, &key, pending) {
                error!(key = %key, error = %e, "Failed to flush deferred write");
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Number of mutations waiting for a deferred write.
    pub fn pending_writes(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Applies a change another context made to the shared substrate.
    ///
    /// Ignored for foreign keys, unknown items, items that opted out of
    /// cross-context sync, keys of another session, and items this store has
    /// not loaded yet (they will read the new value on first access). Never
    /// writes a value back; a change that arrives already expired has its
    /// stored entry removed.
    pub fn handle_external_change(&self, key: &str, new_value: Option<&str>) {
        self.inner.on_external_change(key, new_value);
    }

    /// Feeds change events from `events` into [`Store::handle_external_change`]
    /// on a Tokio task until the returned handle is dropped.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn listen(&self, mut events: EventStream) -> ListenerHandle {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.on_external_change(&event.key, event.new_value.as_deref());
            }
            debug!("Storage event listener stopped");
        });
        ListenerHandle { task }
    }

    /// Receiver that observes every change to an item's value.
    pub fn subscribe(&self, name: &str) -> StoreResult<watch::Receiver<Value>> {
        let item = self.inner.item(name)?;
        let Some(key) = self.inner.key_for(&item) else {
            return Ok(watch::channel(item.default.clone()).1);
        };
        let mut st = self.inner.state.lock();
        let value = self.inner.load(&mut st, &item, &key);
        let tx = st
            .cells
            .entry(key)
            .or_insert_with(|| watch::channel(value).0);
        Ok(tx.subscribe())
    }

    /// A derived view of an item that only reports changes of `project`'s result.
    pub fn select<P, F>(&self, name: &str, project: F) -> StoreResult<Selector<P>>
    where
        P: PartialEq + Clone,
        F: Fn(&Value) -> P + Send + Sync + 'static,
    {
        Ok(Selector::new(self.subscribe(name)?, project))
    }

    /// Removes orphaned keys and expired entries. Runs automatically once at
    /// startup when housekeeping is enabled.
    pub fn housekeep(&self) -> Housekeeping {
        self.inner.housekeep()
    }

    /// Snapshot of activity counters.
    pub fn stats(&self) -> StoreStats {
        self.inner.stats.snapshot()
    }

    /// The configuration of a registered item.
    pub fn item(&self, name: &str) -> Option<&ItemConfig> {
        self.inner.items.get(name).map(|item| item.as_ref())
    }

    /// The physical key an item currently maps to.
    pub fn key_of(&self, name: &str) -> StoreResult<Option<String>> {
        let item = self.inner.item(name)?;
        Ok(self.inner.key_for(&item))
    }
}

impl Inner {
    fn now(&self) -> u64 {
        self.config.clock.now_ms()
    }

    /// Instant recorded in TTL metadata. Whole minutes, so the tracked state
    /// and the persisted envelope hold the same deadline.
    fn stamp_time(&self) -> u64 {
        envelope::ceil_to_minute(self.now())
    }

    fn item(&self, name: &str) -> StoreResult<Arc<ItemConfig>> {
        self.items
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::UnknownItem(name.to_string()))
    }

    /// `None` without a session provider, `Some(None)` when it reports no session.
    fn current_session(&self) -> Option<Option<String>> {
        self.config.session.as_ref().map(|provider| provider())
    }

    fn key_for(&self, item: &ItemConfig) -> Option<String> {
        let session = self.current_session();
        physical_key(
            &self.config.namespace,
            &item.name,
            session.as_ref().map(|s| s.as_deref()),
            item.target,
            item.ignore_session,
        )
    }

    fn parts(&self, key: &str) -> Option<KeyParts> {
        parse_key(&self.config.namespace, key)
    }

    fn item_for_key(&self, key: &str) -> Option<Arc<ItemConfig>> {
        self.parts(key)
            .and_then(|parts| self.items.get(&parts.item).cloned())
    }

    fn backend(&self, target: StorageTarget) -> &dyn Backend {
        match target {
            StorageTarget::Persistent => self.config.persistent.as_ref(),
            StorageTarget::TabScoped => self.config.tab.as_ref(),
        }
    }

    // ---- reads -----------------------------------------------------------

    fn load(self: &Arc<Self>, st: &mut State, item: &ItemConfig, key: &str) -> Value {
        if st.cells.contains_key(key) {
            self.expire_if_due(st, item, key);
            return st
                .cells
                .get(key)
                .map(|cell| cell.borrow().clone())
                .unwrap_or_else(|| item.default.clone());
        }

        let value = self.read_through(st, item, key);
        st.cells
            .insert(key.to_string(), watch::channel(value.clone()).0);
        value
    }

    fn expire_if_due(self: &Arc<Self>, st: &mut State, item: &ItemConfig, key: &str) {
        let (Some(policy), Some(entry)) = (&item.ttl, st.ttl.get(key)) else {
            return;
        };
        if expiry::next_deadline(policy, &entry.meta).is_some_and(|at| at <= self.now()) {
            self.expire_key(st, item, key);
        }
    }

    /// Loads a value from the substrate, repairing what it can on the way.
    fn read_through(self: &Arc<Self>, st: &mut State, item: &ItemConfig, key: &str) -> Value {
        Counters::bump(&self.stats.reads);
        let backend = self.backend(item.target);
        let Some(raw) = backend.get_item(key) else {
            trace!(item = %item.name, key, "No stored value");
            return item.default.clone();
        };

        let decoded = match envelope::decode(item, &raw) {
            Ok(decoded) => decoded,
            Err(e) => {
                Counters::bump(&self.stats.decode_failures);
                warn!(item = %item.name, key, error = %e, "Stored value rejected, using default");
                return item.default.clone();
            }
        };

        let now = self.now();
        let mut value = decoded.value;
        let mut dirty = decoded.migrated;
        let mut meta = None;

        if let Some(policy) = &item.ttl {
            let tracked = match decoded.meta {
                Some(meta) => meta,
                None => {
                    // Written before the item had a TTL; its clock starts now.
                    dirty = true;
                    expiry::stamp(&item.name, policy, None, &value, self.stamp_time())
                }
            };
            match expiry::evaluate(&item.name, policy, &tracked, &value, now) {
                Expiry::Fresh => meta = Some(tracked),
                Expiry::Expired => {
                    backend.remove_item(key);
                    Counters::bump(&self.stats.expired);
                    debug!(item = %item.name, key, "Stored value expired");
                    return item.default.clone();
                }
                Expiry::Trimmed {
                    value: trimmed,
                    meta: trimmed_meta,
                    removed,
                } => {
                    debug!(item = %item.name, key, parts = ?removed, "Expired parts removed on load");
                    Counters::bump(&self.stats.expired);
                    value = trimmed;
                    meta = Some(trimmed_meta);
                    dirty = true;
                }
            }
        }

        let pruned = prune::prune(
            &item.name,
            item.prune.as_ref(),
            item.prune_by_size.as_ref(),
            value.clone(),
        );
        if pruned != value {
            debug!(item = %item.name, key, "Stored value pruned on load");
            value = pruned;
            if let Some(policy) = &item.ttl {
                let at = self.stamp_time();
                meta = meta.map(|m| expiry::reconcile(&item.name, policy, Some(&m), &value, at));
            }
            dirty = true;
        }

        if dirty && value == item.default {
            backend.remove_item(key);
            return item.default.clone();
        }
        if let Some(meta) = &meta {
            self.track(st, item, key, meta.clone());
        }
        if dirty {
            self.persist_now(st, item, key, &value, meta.as_ref());
        }
        value
    }

    // ---- writes ----------------------------------------------------------

    fn commit(
        self: &Arc<Self>,
        st: &mut State,
        item: &ItemConfig,
        key: &str,
        value: Value,
    ) -> StoreResult<()> {
        if value == item.default {
            trace!(item = %item.name, key, "Value equals default, deleting");
            self.remove_entry(st, item.target, key);
            return Ok(());
        }

        let value = prune::prune(
            &item.name,
            item.prune.as_ref(),
            item.prune_by_size.as_ref(),
            value,
        );
        if value == item.default {
            self.remove_entry(st, item.target, key);
            return Ok(());
        }

        let now = self.now();
        let meta = item.ttl.as_ref().map(|policy| {
            let previous = st.ttl.get(key).map(|entry| &entry.meta);
            expiry::stamp(&item.name, policy, previous, &value, self.stamp_time())
        });

        match SyncPolicy::resolve(item.sync, self.config.default_sync) {
            SyncPolicy::Immediate => {
                self.cancel_pending(st, key);
                let raw = envelope::encode(item, &value, meta.as_ref())?;
                self.write(st, item.target, key, &raw)?;
                Counters::bump(&self.stats.writes);
            }
            policy => self.schedule_sync(st, key, policy, value.clone(), meta.clone(), now),
        }

        if let Some(meta) = meta {
            self.track(st, item, key, meta);
        }
        self.publish(st, key, value);
        Ok(())
    }

    /// Best-effort write of a value the store repaired on its own.
    fn persist_now(
        self: &Arc<Self>,
        st: &mut State,
        item: &ItemConfig,
        key: &str,
        value: &Value,
        meta: Option<&TtlMeta>,
    ) {
        let result = envelope::encode(item, value, meta)
            .map_err(StoreError::from)
            .and_then(|raw| self.write(st, item.target, key, &raw));
        match result {
            Ok(()) => Counters::bump(&self.stats.writes),
            Err(e) => error!(item = %item.name, key, error = %e, "Failed to persist repaired value"),
        }
    }

    fn write(
        self: &Arc<Self>,
        st: &mut State,
        target: StorageTarget,
        key: &str,
        raw: &str,
    ) -> StoreResult<()> {
        match self.backend(target).set_item(key, raw) {
            Ok(()) => {
                trace!(key, bytes = raw.len(), "Wrote stored value");
                Ok(())
            }
            Err(e) if e.is_quota_exceeded() && !st.recovering => {
                st.recovering = true;
                let result = self.recover(st, target, key, raw);
                st.recovering = false;
                result
            }
            Err(e) => Err(e.into()),
        }
    }

    /// `Ok(false)` when the substrate is still full.
    fn try_write(&self, target: StorageTarget, key: &str, raw: &str) -> StoreResult<bool> {
        match self.backend(target).set_item(key, raw) {
            Ok(()) => Ok(true),
            Err(e) if e.is_quota_exceeded() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    // ---- quota recovery --------------------------------------------------

    fn recover(
        self: &Arc<Self>,
        st: &mut State,
        target: StorageTarget,
        key: &str,
        raw: &str,
    ) -> StoreResult<()> {
        warn!(key, bytes = raw.len(), "Storage quota exceeded, reclaiming space");

        let expired = self.sweep_expired(st, Some(key));
        if expired > 0 && self.try_write(target, key, raw)? {
            info!(key, expired, "Write succeeded after expiring stale entries");
            return Ok(());
        }

        let cleared = self.evict_tab_scoped(st, key);
        if cleared > 0 && self.try_write(target, key, raw)? {
            info!(key, cleared, "Write succeeded after clearing tab-scoped entries");
            return Ok(());
        }

        let current_session = self.current_session().flatten();
        let mut evicted = HashSet::new();
        loop {
            let candidates: Vec<Candidate> = self
                .eviction_candidates(target, key)
                .into_iter()
                .filter(|c| !evicted.contains(&c.key))
                .collect();
            let Some(victim) = quota::pick_candidate(&candidates, current_session.as_deref())
            else {
                error!(key, "Storage quota exhausted, nothing left to evict");
                return Err(StoreError::QuotaExceeded {
                    key: key.to_string(),
                });
            };

            debug!(
                key = %victim.key,
                priority = victim.priority,
                size = victim.size,
                "Evicting entry to free space"
            );
            Counters::bump(&self.stats.evicted);
            let victim = victim.key.clone();
            self.remove_entry(st, target, &victim);
            evicted.insert(victim);

            if self.try_write(target, key, raw)? {
                info!(key, evicted = evicted.len(), "Write succeeded after eviction");
                return Ok(());
            }
        }
    }

    fn eviction_candidates(&self, target: StorageTarget, exclude: &str) -> Vec<Candidate> {
        let backend = self.backend(target);
        backend
            .keys()
            .into_iter()
            .filter(|key| key != exclude)
            .filter_map(|key| {
                let parts = self.parts(&key)?;
                let size = key.len() + backend.get_item(&key).map_or(0, |raw| raw.len());
                let priority = self.items.get(&parts.item).map_or(0, |item| item.priority);
                Some(Candidate {
                    key,
                    session: parts.session,
                    priority,
                    size,
                })
            })
            .collect()
    }

    fn evict_tab_scoped(self: &Arc<Self>, st: &mut State, exclude: &str) -> usize {
        let keys: Vec<String> = self
            .config
            .tab
            .keys()
            .into_iter()
            .filter(|key| key != exclude && is_own_key(&self.config.namespace, key))
            .collect();
        for key in &keys {
            self.remove_entry(st, StorageTarget::TabScoped, key);
            Counters::bump(&self.stats.evicted);
        }
        if !keys.is_empty() {
            debug!(count = keys.len(), "Cleared tab-scoped entries");
        }
        keys.len()
    }

    /// Expires or trims every stale entry in both substrates. Returns how many
    /// entries were removed or shrunk.
    fn sweep_expired(self: &Arc<Self>, st: &mut State, exclude: Option<&str>) -> usize {
        let now = self.now();
        let mut swept = 0;

        for target in TARGETS {
            let backend = self.backend(target);
            for key in backend.keys() {
                if exclude == Some(key.as_str()) {
                    continue;
                }
                let Some(item) = self.item_for_key(&key) else {
                    continue;
                };
                let Some(policy) = &item.ttl else {
                    continue;
                };

                if st.ttl.contains_key(&key) {
                    if self.expire_key(st, &item, &key) {
                        swept += 1;
                    }
                    continue;
                }

                // Not loaded here; judge it by its persisted metadata.
                let Some(raw) = backend.get_item(&key) else {
                    continue;
                };
                let Ok(decoded) = envelope::decode(&item, &raw) else {
                    continue;
                };
                let Some(meta) = decoded.meta else {
                    continue;
                };
                match expiry::evaluate(&item.name, policy, &meta, &decoded.value, now) {
                    Expiry::Fresh => {}
                    Expiry::Expired => {
                        backend.remove_item(&key);
                        Counters::bump(&self.stats.expired);
                        swept += 1;
                    }
                    Expiry::Trimmed { value, meta, .. } => {
                        Counters::bump(&self.stats.expired);
                        swept += 1;
                        if value == item.default {
                            backend.remove_item(&key);
                        } else if let Ok(raw) = envelope::encode(&item, &value, Some(&meta)) {
                            if let Err(e) = backend.set_item(&key, &raw) {
                                warn!(key = %key, error = %e, "Failed to rewrite trimmed value");
                            }
                        }
                    }
                }
            }
        }

        if swept > 0 {
            debug!(swept, "Swept expired entries");
        }
        swept
    }

    // ---- expiry ----------------------------------------------------------

    fn track(self: &Arc<Self>, st: &mut State, item: &ItemConfig, key: &str, meta: TtlMeta) {
        let Some(policy) = &item.ttl else {
            return;
        };
        let deadline = expiry::next_deadline(policy, &meta);
        let entry = st.ttl.entry(key.to_string()).or_insert_with(|| TtlEntry {
            meta: TtlMeta::default(),
            timer: None,
        });
        entry.meta = meta;
        if let Some(timer) = entry.timer.take() {
            self.config.scheduler.cancel(timer);
        }

        if let Some(deadline) = deadline {
            let delay = Duration::from_millis(deadline.saturating_sub(self.now()));
            let weak = Arc::downgrade(self);
            let timer_key = key.to_string();
            entry.timer = Some(self.config.scheduler.run_after(
                delay,
                Box::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_ttl_timer(&timer_key);
                    }
                }),
            ));
        }
    }

    fn forget_ttl(&self, st: &mut State, key: &str) {
        if let Some(TtlEntry {
            timer: Some(timer), ..
        }) = st.ttl.remove(key)
        {
            self.config.scheduler.cancel(timer);
        }
    }

    fn on_ttl_timer(self: &Arc<Self>, key: &str) {
        let mut st = self.state.lock();
        match st.ttl.get_mut(key) {
            Some(entry) => entry.timer = None,
            None => return,
        }
        let Some(item) = self.item_for_key(key) else {
            return;
        };
        self.expire_key(&mut st, &item, key);
    }

    /// Applies expiry to a loaded key. Returns true if anything expired.
    fn expire_key(self: &Arc<Self>, st: &mut State, item: &ItemConfig, key: &str) -> bool {
        let Some(policy) = &item.ttl else {
            return false;
        };
        let Some(meta) = st.ttl.get(key).map(|entry| entry.meta.clone()) else {
            return false;
        };
        let Some(current) = st.cells.get(key).map(|cell| cell.borrow().clone()) else {
            self.forget_ttl(st, key);
            return false;
        };

        let now = self.now();
        match expiry::evaluate(&item.name, policy, &meta, &current, now) {
            Expiry::Fresh => {
                self.track(st, item, key, meta);
                false
            }
            Expiry::Expired => {
                debug!(item = %item.name, key, "Value expired");
                Counters::bump(&self.stats.expired);
                self.remove_entry(st, item.target, key);
                true
            }
            Expiry::Trimmed {
                value,
                meta,
                removed,
            } => {
                debug!(item = %item.name, key, parts = ?removed, "Expired parts removed");
                Counters::bump(&self.stats.expired);
                // The pending value is the one just trimmed.
                self.cancel_pending(st, key);

                let value = match &item.prune_by_size {
                    Some(size) => prune::prune_to_size(&item.name, size, value).0,
                    None => value,
                };
                if value == item.default {
                    self.remove_entry(st, item.target, key);
                    return true;
                }

                let meta =
                    expiry::reconcile(&item.name, policy, Some(&meta), &value, self.stamp_time());
                self.track(st, item, key, meta.clone());
                self.persist_now(st, item, key, &value, Some(&meta));
                self.publish(st, key, value);
                true
            }
        }
    }

    // ---- deferred writes -------------------------------------------------

    fn schedule_sync(
        self: &Arc<Self>,
        st: &mut State,
        key: &str,
        policy: SyncPolicy,
        value: Value,
        meta: Option<TtlMeta>,
        now: u64,
    ) {
        let started_at = match st.pending.remove(key) {
            Some(previous) => {
                self.config.scheduler.cancel(previous.handle);
                previous.started_at
            }
            None => now,
        };

        let weak = Arc::downgrade(self);
        let flush_key = key.to_string();
        let task: Task = Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.flush_key(&flush_key);
            }
        });

        let scheduler = &self.config.scheduler;
        let handle = match policy {
            SyncPolicy::Debounce { wait, max_wait } => {
                let delay = sync::debounce_delay(wait, max_wait, started_at, now);
                scheduler.run_after(Duration::from_millis(delay), task)
            }
            SyncPolicy::Idle { timeout } => scheduler.run_when_idle(timeout, task),
            SyncPolicy::Immediate => scheduler.run_after(Duration::ZERO, task),
        };

        trace!(key, policy = ?policy, "Deferred write scheduled");
        Counters::bump(&self.stats.deferred);
        st.pending.insert(
            key.to_string(),
            PendingSync {
                value,
                meta,
                handle,
                started_at,
            },
        );
    }

    fn flush_key(self: &Arc<Self>, key: &str) {
        let mut st = self.state.lock();
        let Some(pending) = st.pending.remove(key) else {
            return;
        };
        if let Err(e) = self.flush_pending(&mut st, key, pending) {
            error!(key, error = %e, "Deferred write failed");
        }
    }

    fn flush_pending(
        self: &Arc<Self>,
        st: &mut State,
        key: &str,
        pending: PendingSync,
    ) -> StoreResult<()> {
        let Some(item) = self.item_for_key(key) else {
            return Ok(());
        };
        // Expiry may have moved the metadata on since the mutation.
        let meta = st
            .ttl
            .get(key)
            .map(|entry| entry.meta.clone())
            .or(pending.meta);
        let raw = envelope::encode(&item, &pending.value, meta.as_ref())?;
        self.write(st, item.target, key, &raw)?;
        Counters::bump(&self.stats.writes);
        debug!(item = %item.name, key, "Flushed deferred write");
        Ok(())
    }

    fn cancel_pending(&self, st: &mut State, key: &str) {
        if let Some(pending) = st.pending.remove(key) {
            self.config.scheduler.cancel(pending.handle);
            trace!(key, "Cancelled deferred write");
        }
    }

    // ---- cells -----------------------------------------------------------

    fn publish(&self, st: &mut State, key: &str, value: Value) {
        match st.cells.get(key) {
            Some(cell) => {
                cell.send_if_modified(|current| {
                    if *current == value {
                        false
                    } else {
                        *current = value;
                        true
                    }
                });
            }
            None => {
                st.cells.insert(key.to_string(), watch::channel(value).0);
            }
        }
    }

    fn reset_cell(&self, st: &mut State, key: &str, default: &Value) {
        if st.cells.contains_key(key) {
            self.publish(st, key, default.clone());
        }
    }

    /// Removes a key from the `target` substrate. When that is where its item
    /// lives, also drops the pending write and TTL state and resets the cell.
    /// Returns true if the substrate held it.
    fn remove_entry(&self, st: &mut State, target: StorageTarget, key: &str) -> bool {
        let backend = self.backend(target);
        let existed = backend.get_item(key).is_some();
        backend.remove_item(key);
        if let Some(item) = self.item_for_key(key).filter(|item| item.target == target) {
            self.cancel_pending(st, key);
            self.forget_ttl(st, key);
            self.reset_cell(st, key, &item.default);
        }
        existed
    }

    // ---- cross-context changes -------------------------------------------

    fn on_external_change(self: &Arc<Self>, key: &str, new_value: Option<&str>) {
        let Some(item) = self.item_for_key(key) else {
            return;
        };
        if !item.sync_tabs || self.key_for(&item).as_deref() != Some(key) {
            return;
        }

        let mut st = self.state.lock();
        if !st.cells.contains_key(key) {
            return;
        }
        Counters::bump(&self.stats.external_changes);
        // The other context wrote last; a local write still waiting would undo it.
        self.cancel_pending(&mut st, key);

        let Some(raw) = new_value else {
            debug!(item = %item.name, key, "Value removed by another context");
            self.forget_ttl(&mut st, key);
            self.reset_cell(&mut st, key, &item.default);
            return;
        };

        let decoded = match envelope::decode(&item, raw) {
            Ok(decoded) => decoded,
            Err(e) => {
                Counters::bump(&self.stats.decode_failures);
                warn!(item = %item.name, key, error = %e, "External value rejected, using default");
                self.forget_ttl(&mut st, key);
                self.reset_cell(&mut st, key, &item.default);
                return;
            }
        };

        let mut value = decoded.value;
        match &item.ttl {
            None => self.forget_ttl(&mut st, key),
            Some(policy) => {
                let now = self.now();
                let meta = decoded.meta.unwrap_or_else(|| {
                    expiry::stamp(&item.name, policy, None, &value, self.stamp_time())
                });
                match expiry::evaluate(&item.name, policy, &meta, &value, now) {
                    Expiry::Fresh => self.track(&mut st, &item, key, meta),
                    Expiry::Expired => {
                        debug!(item = %item.name, key, "External value already expired");
                        Counters::bump(&self.stats.expired);
                        self.backend(item.target).remove_item(key);
                        self.forget_ttl(&mut st, key);
                        self.reset_cell(&mut st, key, &item.default);
                        return;
                    }
                    Expiry::Trimmed {
                        value: trimmed,
                        meta,
                        ..
                    } => {
                        value = trimmed;
                        self.track(&mut st, &item, key, meta);
                    }
                }
            }
        }

        trace!(item = %item.name, key, "Adopted value from another context");
        self.publish(&mut st, key, value);
    }

    // ---- housekeeping ----------------------------------------------------

    fn housekeep(self: &Arc<Self>) -> Housekeeping {
        let mut st = self.state.lock();

        let mut orphans = 0;
        for target in TARGETS {
            let backend = self.backend(target);
            for key in backend.keys() {
                let Some(parts) = self.parts(&key) else {
                    continue;
                };
                let accounted = self.items.get(&parts.item).is_some_and(|item| {
                    item.target == parts.target && !(item.ignore_session && parts.session.is_some())
                });
                if !accounted {
                    trace!(key = %key, "Removing orphaned key");
                    backend.remove_item(&key);
                    self.forget_ttl(&mut st, &key);
                    orphans += 1;
                }
            }
        }

        let expired = self.sweep_expired(&mut st, None);
        debug!(orphans, expired, "Housekeeping finished");
        Housekeeping { orphans, expired }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let st = self.state.get_mut();
        let scheduler = &self.config.scheduler;
        for timer in st.ttl.values().filter_map(|entry| entry.timer) {
            scheduler.cancel(timer);
        }
        for pending in st.pending.values() {
            scheduler.cancel(pending.handle);
        }
        if !st.pending.is_empty() {
            warn!(pending = st.pending.len(), "Store dropped with unflushed writes");
        }
    }
}
