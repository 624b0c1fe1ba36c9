//! Reactive Selectors
//!
//! Every item is backed by a `tokio::sync::watch` channel holding its current
//! value. A [`Selector`] narrows that channel to a projection and only wakes
//! its owner when the projection actually changes.

use serde_json::Value;
use std::fmt;
use tokio::sync::watch;

/// A projection of an item's value that notifies only on change.
pub struct Selector<P> {
    rx: watch::Receiver<Value>,
    project: Box<dyn Fn(&Value) -> P + Send + Sync>,
    current: P,
}

impl<P> Selector<P>
where
    P: PartialEq + Clone,
{
    /// Wraps a receiver with a projection.
    pub fn new<F>(mut rx: watch::Receiver<Value>, project: F) -> Self
    where
        F: Fn(&Value) -> P + Send + Sync + 'static,
    {
        let current = project(&rx.borrow_and_update());
        Self {
            rx,
            project: Box::new(project),
            current,
        }
    }

    /// The last observed projection.
    pub fn get(&self) -> &P {
        &self.current
    }

    /// Waits until the projection differs from the last one observed.
    ///
    /// Errors once the store that owns the item is gone.
    pub async fn changed(&mut self) -> Result<P, watch::error::RecvError> {
        loop {
            self.rx.changed().await?;
            let next = (self.project)(&self.rx.borrow_and_update());
            if next != self.current {
                self.current = next.clone();
                return Ok(next);
            }
        }
    }
}

impl<P: fmt::Debug> fmt::Debug for Selector<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selector")
            .field("current", &self.current)
            .finish()
    }
}
