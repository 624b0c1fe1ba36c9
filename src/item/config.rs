//! Logical Item Configuration
//!
//! An item is a named, schema-typed slot. Its configuration is fixed when the
//! store is created.
//!
//! ```
//! use slsm::{ItemConfig, SyncPolicy};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! let history = ItemConfig::typed("history", Vec::<String>::new())
//!     .unwrap()
//!     .priority(-1)
//!     .ttl(Duration::from_secs(24 * 3600))
//!     .prune(|v| match v {
//!         serde_json::Value::Array(items) => {
//!             let skip = items.len().saturating_sub(50);
//!             serde_json::Value::Array(items.into_iter().skip(skip).collect())
//!         }
//!         other => other,
//!     })
//!     .sync(SyncPolicy::debounce(Duration::from_millis(250)));
//!
//! assert_eq!(history.name(), "history");
//! assert_eq!(history.default_value(), &json!([]));
//! ```

use crate::codec::compress::Compression;
use crate::codec::key::StorageTarget;
use crate::error::SchemaError;
use crate::item::schema::{AnySchema, Schema, SerdeSchema};
use crate::storage::expiry::TtlPolicy;
use crate::storage::prune::{PruneFn, SizePrune};
use crate::storage::sync::SyncPolicy;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Repairs a stored value that no longer passes the schema.
pub type MigrateFn = Arc<dyn Fn(&Value, &SchemaError) -> Option<Value> + Send + Sync>;

/// Configuration of one logical item.
#[derive(Clone)]
pub struct ItemConfig {
    pub(crate) name: String,
    pub(crate) default: Value,
    pub(crate) schema: Arc<dyn Schema>,
    pub(crate) target: StorageTarget,
    pub(crate) ignore_session: bool,
    pub(crate) priority: i32,
    pub(crate) ttl: Option<TtlPolicy>,
    pub(crate) prune: Option<PruneFn>,
    pub(crate) prune_by_size: Option<SizePrune>,
    pub(crate) sync: Option<SyncPolicy>,
    pub(crate) compression: Option<Compression>,
    pub(crate) migrate: Option<MigrateFn>,
    pub(crate) sync_tabs: bool,
}

impl ItemConfig {
    /// An item accepting any JSON value.
    pub fn new(name: impl Into<String>, default: Value) -> Self {
        Self {
            name: name.into(),
            default,
            schema: Arc::new(AnySchema),
            target: StorageTarget::Persistent,
            ignore_session: false,
            priority: 0,
            ttl: None,
            prune: None,
            prune_by_size: None,
            sync: None,
            compression: None,
            migrate: None,
            sync_tabs: true,
        }
    }

    /// An item whose values must deserialize into `T`.
    pub fn typed<T>(name: impl Into<String>, default: T) -> serde_json::Result<Self>
    where
        T: Serialize + DeserializeOwned + 'static,
    {
        let default = serde_json::to_value(default)?;
        Ok(Self::new(name, default).schema(SerdeSchema::<T>::new()))
    }

    /// Replaces the schema.
    pub fn schema(mut self, schema: impl Schema + 'static) -> Self {
        self.schema = Arc::new(schema);
        self
    }

    /// Store in tab-scoped (session) storage instead of persistent storage.
    pub fn tab_scoped(mut self) -> Self {
        self.target = StorageTarget::TabScoped;
        self
    }

    /// Use the unscoped key even when a session is active.
    pub fn ignore_session(mut self) -> Self {
        self.ignore_session = true;
        self
    }

    /// Eviction priority under quota pressure; lower goes first.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Expire the whole value `duration` after its last write.
    pub fn ttl(mut self, duration: Duration) -> Self {
        self.ttl = Some(TtlPolicy::whole(duration));
        self
    }

    /// Any TTL policy, including partitioned ones.
    pub fn ttl_policy(mut self, policy: TtlPolicy) -> Self {
        self.ttl = Some(policy);
        self
    }

    /// Predicate prune applied after every write and on load.
    pub fn prune<F>(mut self, prune: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.prune = Some(Arc::new(prune));
        self
    }

    /// Shrink with `step` while the serialized value exceeds `max_kb`.
    pub fn prune_by_size<F>(mut self, max_kb: f64, step: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.prune_by_size = Some(SizePrune::new(max_kb, step));
        self
    }

    /// Overrides the store-wide sync policy.
    pub fn sync(mut self, policy: SyncPolicy) -> Self {
        self.sync = Some(policy);
        self
    }

    /// Compress the stored payload.
    pub fn compress(mut self, compression: Compression) -> Self {
        self.compression = Some(compression);
        self
    }

    /// Repairs stored values rejected by the schema.
    pub fn migrate<F>(mut self, migrate: F) -> Self
    where
        F: Fn(&Value, &SchemaError) -> Option<Value> + Send + Sync + 'static,
    {
        self.migrate = Some(Arc::new(migrate));
        self
    }

    /// Whether changes made by other tabs are adopted (default: true).
    pub fn sync_tabs(mut self, enabled: bool) -> Self {
        self.sync_tabs = enabled;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default_value(&self) -> &Value {
        &self.default
    }

    pub fn target(&self) -> StorageTarget {
        self.target
    }
}

impl fmt::Debug for ItemConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ItemConfig")
            .field("name", &self.name)
            .field("default", &self.default)
            .field("target", &self.target)
            .field("ignore_session", &self.ignore_session)
            .field("priority", &self.priority)
            .field("ttl", &self.ttl)
            .field("prune", &self.prune.is_some())
            .field("prune_by_size", &self.prune_by_size)
            .field("sync", &self.sync)
            .field("compression", &self.compression)
            .field("migrate", &self.migrate.is_some())
            .field("sync_tabs", &self.sync_tabs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let item = ItemConfig::new("a", json!(""));
        assert_eq!(item.target(), StorageTarget::Persistent);
        assert_eq!(item.priority, 0);
        assert!(item.sync_tabs);
        assert!(item.ttl.is_none());
        assert!(item.schema.parse(&json!({"anything": 1})).is_ok());
    }

    #[test]
    fn test_typed_uses_serde_schema() {
        let item = ItemConfig::typed("count", 0u32).unwrap();
        assert_eq!(item.default_value(), &json!(0));
        assert!(item.schema.parse(&json!(7)).is_ok());
        assert!(item.schema.parse(&json!("seven")).is_err());
    }

    #[test]
    fn test_builder_chain() {
        let item = ItemConfig::new("tab", json!(null))
            .tab_scoped()
            .ignore_session()
            .priority(7)
            .ttl(Duration::from_secs(60))
            .sync_tabs(false);
        assert_eq!(item.target(), StorageTarget::TabScoped);
        assert!(item.ignore_session);
        assert_eq!(item.priority, 7);
        assert_eq!(item.ttl.as_ref().unwrap().duration(), Duration::from_secs(60));
        assert!(!item.sync_tabs);
    }
}
