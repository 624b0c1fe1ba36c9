//! Typed Item Handles
//!
//! The store works on `serde_json::Value`. [`TypedItem`] puts a Rust type in
//! front of one item and converts at the boundary.
//!
//! ```
//! use serde::{Deserialize, Serialize};
//! use slsm::{ItemConfig, Store, StoreConfig};
//!
//! #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
//! struct Prefs {
//!     dark: bool,
//!     font_size: u8,
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let item = ItemConfig::typed("prefs", Prefs::default()).unwrap();
//! let store = Store::new(StoreConfig::builder().build().unwrap(), [item]);
//! let prefs = store.typed::<Prefs>("prefs").unwrap();
//!
//! prefs.produce(|p| p.dark = true).unwrap();
//! assert!(prefs.get().unwrap().dark);
//! # }
//! ```

use crate::error::{StoreError, StoreResult};
use crate::storage::engine::Store;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::marker::PhantomData;
use tokio::sync::watch;

/// A handle to one item that reads and writes `T`.
pub struct TypedItem<T> {
    store: Store,
    name: String,
    _type: PhantomData<fn() -> T>,
}

impl<T> Clone for TypedItem<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            name: self.name.clone(),
            _type: PhantomData,
        }
    }
}

impl<T> fmt::Debug for TypedItem<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedItem")
            .field("name", &self.name)
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T> TypedItem<T>
where
    T: Serialize + DeserializeOwned,
{
    fn decode(&self, value: Value) -> StoreResult<T> {
        serde_json::from_value(value).map_err(|source| StoreError::Typed {
            item: self.name.clone(),
            source,
        })
    }

    fn encode(&self, value: &T) -> StoreResult<Value> {
        serde_json::to_value(value).map_err(|source| StoreError::Typed {
            item: self.name.clone(),
            source,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self) -> StoreResult<T> {
        self.decode(self.store.get(&self.name)?)
    }

    pub fn set(&self, value: &T) -> StoreResult<()> {
        let value = self.encode(value)?;
        self.store.set(&self.name, value)
    }

    /// Returning `None` deletes the item.
    pub fn update<F>(&self, f: F) -> StoreResult<()>
    where
        F: FnOnce(T) -> Option<T>,
    {
        match f(self.get()?) {
            Some(next) => self.set(&next),
            None => self.delete(),
        }
    }

    pub fn produce<F>(&self, recipe: F) -> StoreResult<()>
    where
        F: FnOnce(&mut T),
    {
        let mut draft = self.get()?;
        recipe(&mut draft);
        self.set(&draft)
    }

    pub fn delete(&self) -> StoreResult<()> {
        self.store.delete(&self.name)
    }

    /// Raw JSON receiver; pair with [`TypedItem::read`] to convert.
    pub fn subscribe(&self) -> StoreResult<watch::Receiver<Value>> {
        self.store.subscribe(&self.name)
    }

    /// Converts a value observed through [`TypedItem::subscribe`].
    pub fn read(&self, value: &Value) -> StoreResult<T> {
        self.decode(value.clone())
    }
}

impl Store {
    /// A typed handle to a registered item.
    ///
    /// Fails when the item is unknown or its default does not convert to `T`.
    pub fn typed<T>(&self, name: &str) -> StoreResult<TypedItem<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        let item = self
            .item(name)
            .ok_or_else(|| StoreError::UnknownItem(name.to_string()))?;
        serde_json::from_value::<T>(item.default_value().clone()).map_err(|source| {
            StoreError::Typed {
                item: name.to_string(),
                source,
            }
        })?;
        Ok(TypedItem {
            store: self.clone(),
            name: name.to_string(),
            _type: PhantomData,
        })
    }
}
