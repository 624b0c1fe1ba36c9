//! # slsm - Persistent, Reactive Client-Side State
//!
//! slsm keeps named, schema-checked values in memory and mirrors them into a
//! synchronous string key-value substrate shaped like browser local/session
//! storage.
//!
//! ## Features
//!
//! - **Schema-checked items**: every stored value is validated (and migrated
//!   when it no longer fits) before it reaches the application
//! - **TTL**: whole values or individual parts of a collection expire
//! - **Pruning**: predicate and size-bounded pruning on every write and load
//! - **Quota recovery**: capacity errors trigger expiry, tab-scoped clearing,
//!   then priority-ordered eviction before giving up
//! - **Deferred writes**: debounce or idle-time persistence per item
//! - **Sessions and tabs**: keys are scoped per session, and changes made by
//!   other contexts flow back into subscribers
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                                slsm                                 │
//! │                                                                     │
//! │   application ──> Store ──────────────> Backend (persistent)        │
//! │        ▲           │  ▲                 Backend (tab-scoped)        │
//! │        │           │  │                        │                    │
//! │   watch/Selector <─┘  └── StorageEvent ────────┘ (other contexts)   │
//! │                                                                     │
//! │   codec::key   codec::envelope   storage::{expiry,prune,quota,sync} │
//! │   runtime::{Clock, Scheduler}                                       │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```
//! use serde_json::json;
//! use slsm::{Backend, ItemConfig, MemoryBackend, Store, StoreConfig, SyncPolicy};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let local = MemoryBackend::with_quota(5 * 1024 * 1024);
//! let config = StoreConfig::builder()
//!     .persistent(local.clone())
//!     .build()
//!     .unwrap();
//!
//! let store = Store::new(
//!     config,
//!     [
//!         ItemConfig::new("theme", json!("light")),
//!         ItemConfig::new("recent", json!([]))
//!             .ttl(Duration::from_secs(3600))
//!             .sync(SyncPolicy::debounce(Duration::from_millis(250))),
//!     ],
//! );
//!
//! store.set("theme", json!("dark")).unwrap();
//! assert_eq!(local.get_item("slsm||theme").as_deref(), Some("\"dark\""));
//!
//! // Setting the default removes the stored entry.
//! store.set("theme", json!("light")).unwrap();
//! assert!(local.get_item("slsm||theme").is_none());
//! # }
//! ```
//!
//! ## Module Overview
//!
//! - [`codec`]: physical keys, stored envelopes and compression
//! - [`item`]: item configuration, schemas and selectors
//! - [`storage`]: substrates, policy engines and the [`Store`] facade
//! - [`runtime`]: injected clock and scheduler
//! - [`config`]: store-wide configuration
//! - [`error`]: error types
//!
//! ## Failure Model
//!
//! Reads never fail because of stored data: malformed or invalid payloads are
//! logged and the item falls back to its default. Writes fail only when the
//! item is unknown or the substrate stays full after quota recovery.

pub mod codec;
pub mod config;
pub mod error;
pub mod item;
pub mod runtime;
pub mod storage;

// Re-export commonly used types for convenience
pub use codec::{Compression, Compressor, StorageTarget, ZstdCompressor};
pub use config::{StoreConfig, StoreConfigBuilder};
pub use error::{BackendError, DecodeError, SchemaError, StoreError, StoreResult};
pub use item::{AnySchema, ItemConfig, Schema, Selector, SerdeSchema};
pub use runtime::{Clock, ManualClock, ManualScheduler, Scheduler, SystemClock, TokioScheduler};
pub use storage::{
    Backend, EventStream, Housekeeping, ListenerHandle, MemoryBackend, SessionFilter,
    StorageEvent, Store, StoreStats, SyncPolicy, TtlPolicy, TypedItem,
};

/// Version of slsm
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
