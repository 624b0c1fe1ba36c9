//! Storage Module
//!
//! The persistence side of the store: the substrate capability, the policy
//! engines that decide what is kept and when it is written, and the
//! [`Store`] facade that ties them together.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Store                              │
//! │   cells (watch)     TTL timers      pending writes          │
//! └──────┬──────────────────┬──────────────────┬────────────────┘
//!        │                  │                  │
//!   ┌────▼────┐       ┌─────▼─────┐      ┌─────▼─────┐
//!   │  prune  │       │  expiry   │      │   sync    │
//!   └─────────┘       └───────────┘      └───────────┘
//!        │                                     │
//!        ▼                                     ▼
//!   ┌─────────────────────────────────────────────────┐
//!   │  Backend (persistent)    Backend (tab-scoped)   │
//!   └─────────────────────────────────────────────────┘
//!                          ▲
//!                  quota ──┘ (recovery on capacity errors)
//! ```
//!
//! The engines (`expiry`, `prune`, `quota`, `sync`) are pure functions over
//! values and metadata; only [`Store`] touches substrates and timers.

pub mod backend;
pub mod engine;
pub mod expiry;
pub mod prune;
pub mod quota;
pub mod sync;
pub mod typed;

pub use backend::{Backend, EventStream, MemoryBackend, StorageEvent};
pub use engine::{Housekeeping, ListenerHandle, SessionFilter, Store, StoreStats};
pub use expiry::{TtlMeta, TtlPolicy};
pub use prune::{PruneFn, SizePrune};
pub use sync::SyncPolicy;
pub use typed::TypedItem;
