//! Logical Items
//!
//! Items are the application-facing slots of the store: a name, a schema, a
//! default and the policies that govern persistence.
//!
//! - [`config`]: the [`ItemConfig`] builder
//! - [`schema`]: the [`Schema`] capability and stock schemas
//! - [`cell`]: [`Selector`], change notification narrowed to a projection
//!
//! User-supplied callbacks (schemas, migrations, prune steps, TTL part
//! functions) run through [`guarded`]: a panic is logged and treated as "no
//! usable result" instead of unwinding through the store.

pub mod cell;
pub mod config;
pub mod schema;

pub use cell::Selector;
pub use config::{ItemConfig, MigrateFn};
pub use schema::{AnySchema, Schema, SerdeSchema};

use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::error;

/// Runs a user callback, turning a panic into `None`.
pub(crate) fn guarded<R>(item: &str, callback: &'static str, f: impl FnOnce() -> R) -> Option<R> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => Some(result),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            error!(item, callback, panic = %message, "User callback panicked");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guarded_passes_through() {
        assert_eq!(guarded("a", "prune", || 5), Some(5));
    }

    #[test]
    fn test_guarded_catches_panics() {
        assert_eq!(guarded("a", "prune", || -> i32 { panic!("nope") }), None);
        assert_eq!(
            guarded("a", "prune", || -> i32 { panic!("{}", String::from("owned")) }),
            None
        );
    }
}
