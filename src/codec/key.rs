//! Physical Key Codec
//!
//! Every logical item lives under a physical key in the substrate. The key
//! carries enough information to route a sweep back to its owner:
//!
//! ```text
//! slsm-user123|s||tabState
//! ^^^^ ^^^^^^^ ^^ ^^^^^^^^
//!  │      │     │    └── logical item name (everything after "||")
//!  │      │     └─────── tab-scoped storage marker (optional)
//!  │      └───────────── "-" + session id (optional)
//!  └──────────────────── namespace
//! ```
//!
//! Keys that do not start with the namespace, or whose prefix does not parse,
//! are foreign and every sweep leaves them alone.

/// The default namespace prefix.
pub const DEFAULT_NAMESPACE: &str = "slsm";

/// Separator between the key prefix and the logical item name.
pub const ITEM_SEPARATOR: &str = "||";

/// Marker appended to the prefix for tab-scoped (session storage) entries.
pub const TAB_SCOPED_MARKER: &str = "|s";

/// Which substrate an item is persisted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StorageTarget {
    /// Survives restarts (local storage)
    #[default]
    Persistent,
    /// Lives only as long as the tab (session storage)
    TabScoped,
}

/// The decoded parts of a physical key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyParts {
    /// Session id embedded in the key, if any
    pub session: Option<String>,
    /// Which substrate the key belongs to
    pub target: StorageTarget,
    /// Logical item name
    pub item: String,
}

/// Builds the physical key for an item.
///
/// Returns `None` when the item is session-scoped but no session is active,
/// which callers treat as "this operation is a no-op".
///
/// * `session` - `None` when the store has no session provider; `Some(None)`
///   when a provider exists but reports no valid session.
pub fn physical_key(
    namespace: &str,
    item: &str,
    session: Option<Option<&str>>,
    target: StorageTarget,
    ignore_session: bool,
) -> Option<String> {
    let session = if ignore_session {
        None
    } else {
        match session {
            None => None,
            Some(None) => return None,
            Some(Some(id)) => Some(id),
        }
    };

    let mut key = String::with_capacity(namespace.len() + item.len() + 16);
    key.push_str(namespace);
    if let Some(id) = session {
        key.push('-');
        key.push_str(id);
    }
    if target == StorageTarget::TabScoped {
        key.push_str(TAB_SCOPED_MARKER);
    }
    key.push_str(ITEM_SEPARATOR);
    key.push_str(item);
    Some(key)
}

/// Splits a physical key back into its parts.
///
/// Returns `None` for foreign keys.
pub fn parse_key(namespace: &str, key: &str) -> Option<KeyParts> {
    let rest = key.strip_prefix(namespace)?;
    let (prefix, item) = rest.split_once(ITEM_SEPARATOR)?;

    let (prefix, target) = match prefix.strip_suffix(TAB_SCOPED_MARKER) {
        Some(p) => (p, StorageTarget::TabScoped),
        None => (prefix, StorageTarget::Persistent),
    };

    let session = if prefix.is_empty() {
        None
    } else {
        // Anything other than "-<id>" means another namespace that merely
        // shares our prefix, e.g. "slsmfoo||bar".
        let id = prefix.strip_prefix('-')?;
        if id.is_empty() {
            return None;
        }
        Some(id.to_string())
    };

    Some(KeyParts {
        session,
        target,
        item: item.to_string(),
    })
}

/// Returns true if the key belongs to this namespace.
#[inline]
pub fn is_own_key(namespace: &str, key: &str) -> bool {
    parse_key(namespace, key).is_some()
}
