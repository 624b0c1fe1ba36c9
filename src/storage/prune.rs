//! Pruning Engine
//!
//! Two policies keep stored values small:
//!
//! - **Predicate prune**: one pass of a user function, e.g. "keep the last 50
//!   entries". It must be idempotent; it runs after every write and on load.
//! - **Size prune**: while the compact JSON form exceeds the budget, apply a
//!   shrinking step. The loop is bounded and checks progress on every step.
//!
//! The size loop never returns a value produced by a misbehaving step. If a
//! step returns the same value, or a value that is not smaller, the loop stops
//! and keeps the value from before that step. If the iteration ceiling is hit
//! while steps were still shrinking, the best value so far is kept even though
//! it is over budget.

use crate::item::guarded;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{trace, warn};

/// A value transformation supplied by the item's configuration.
pub type PruneFn = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Maximum number of shrink steps per prune.
pub const MAX_PRUNE_ITERATIONS: usize = 1000;

/// Size-bounded pruning policy.
#[derive(Clone)]
pub struct SizePrune {
    /// Budget for the serialized value, in kilobytes
    pub max_kb: f64,
    /// One shrinking step
    pub step: PruneFn,
}

impl SizePrune {
    pub fn new<F>(max_kb: f64, step: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        Self {
            max_kb,
            step: Arc::new(step),
        }
    }

    /// The budget in bytes.
    pub fn budget(&self) -> usize {
        (self.max_kb * 1024.0).max(0.0) as usize
    }
}

impl fmt::Debug for SizePrune {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SizePrune")
            .field("max_kb", &self.max_kb)
            .finish()
    }
}

/// How a size prune ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeOutcome {
    /// Already within budget, nothing done
    Within,
    /// Shrunk into budget in this many steps
    Shrunk(usize),
    /// A step returned its input unchanged
    NoProgress,
    /// A step returned a value that was not smaller
    NotShrinking,
    /// A step panicked
    StepFailed,
    /// The iteration ceiling was reached while still over budget
    CeilingReached,
}

/// UTF-8 length of the compact JSON form.
pub fn serialized_size(value: &Value) -> usize {
    serde_json::to_string(value).map(|s| s.len()).unwrap_or(0)
}

/// Applies a predicate prune. A panicking function leaves the value unchanged.
pub fn prune_predicate(item: &str, prune: &PruneFn, value: Value) -> Value {
    let input = value.clone();
    guarded(item, "prune", move || prune(input)).unwrap_or(value)
}

/// Shrinks `value` until it fits the budget or the loop must stop.
pub fn prune_to_size(item: &str, policy: &SizePrune, value: Value) -> (Value, SizeOutcome) {
    let budget = policy.budget();
    let mut current = value;
    let mut size = serialized_size(&current);
    let mut steps = 0;

    if size <= budget {
        return (current, SizeOutcome::Within);
    }

    while size > budget {
        if steps >= MAX_PRUNE_ITERATIONS {
            warn!(
                item,
                steps,
                size,
                budget,
                "Size pruning did not converge, keeping best value so far"
            );
            return (current, SizeOutcome::CeilingReached);
        }
        steps += 1;

        let input = current.clone();
        let Some(next) = guarded(item, "prune by size", || (policy.step)(input)) else {
            return (current, SizeOutcome::StepFailed);
        };

        if next == current {
            warn!(item, steps, size, budget, "Size pruning step made no progress");
            return (current, SizeOutcome::NoProgress);
        }

        let next_size = serialized_size(&next);
        if next_size >= size {
            warn!(
                item,
                steps,
                size,
                next_size,
                budget,
                "Size pruning step did not shrink the value"
            );
            return (current, SizeOutcome::NotShrinking);
        }

        trace!(item, steps, size = next_size, "Size pruning step");
        current = next;
        size = next_size;
    }

    (current, SizeOutcome::Shrunk(steps))
}

/// Runs the predicate prune, then the size prune, whichever are configured.
pub fn prune(
    item: &str,
    predicate: Option<&PruneFn>,
    size: Option<&SizePrune>,
    value: Value,
) -> Value {
    let value = match predicate {
        Some(f) => prune_predicate(item, f, value),
        None => value,
    };
    match size {
        Some(policy) => prune_to_size(item, policy, value).0,
        None => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn drop_first(v: Value) -> Value {
        match v {
            Value::Array(mut items) if !items.is_empty() => {
                items.remove(0);
                Value::Array(items)
            }
            other => other,
        }
    }

    fn big_list(n: usize) -> Value {
        Value::Array((0..n).map(|i| json!(format!("entry-{i:04}"))).collect())
    }

    #[test]
    fn test_predicate_prune() {
        let last_two: PruneFn = Arc::new(|v| match v {
            Value::Array(items) => {
                let skip = items.len().saturating_sub(2);
                Value::Array(items.into_iter().skip(skip).collect())
            }
            other => other,
        });
        let pruned = prune_predicate("list", &last_two, json!([1, 2, 3, 4]));
        assert_eq!(pruned, json!([3, 4]));
        // idempotent
        assert_eq!(prune_predicate("list", &last_two, pruned.clone()), pruned);
    }

    #[test]
    fn test_size_prune_within_budget() {
        let policy = SizePrune::new(1.0, drop_first);
        let (value, outcome) = prune_to_size("list", &policy, json!([1, 2]));
        assert_eq!(value, json!([1, 2]));
        assert_eq!(outcome, SizeOutcome::Within);
    }

    #[test]
    fn test_size_prune_shrinks_into_budget() {
        let policy = SizePrune::new(1.0, drop_first);
        let (value, outcome) = prune_to_size("list", &policy, big_list(200));
        assert!(serialized_size(&value) <= 1024);
        assert!(matches!(outcome, SizeOutcome::Shrunk(n) if n > 0));
        // the newest entries survive
        assert_eq!(value.as_array().unwrap().last(), Some(&json!("entry-0199")));
    }

    #[test]
    fn test_size_prune_no_progress_keeps_value() {
        let policy = SizePrune::new(0.1, |v| v);
        let input = big_list(50);
        let (value, outcome) = prune_to_size("list", &policy, input.clone());
        assert_eq!(value, input);
        assert_eq!(outcome, SizeOutcome::NoProgress);
    }

    #[test]
    fn test_size_prune_rejects_growing_step() {
        // first step shrinks, second step grows: keep the result of the first
        let policy = SizePrune::new(0.1, |v: Value| {
            let len = v.as_array().map(|a| a.len()).unwrap_or(0);
            if len == 50 {
                big_list(40)
            } else {
                big_list(len + 10)
            }
        });
        let (value, outcome) = prune_to_size("list", &policy, big_list(50));
        assert_eq!(value, big_list(40));
        assert_eq!(outcome, SizeOutcome::NotShrinking);
    }

    #[test]
    fn test_size_prune_ceiling_keeps_best_so_far() {
        // Shrinks by one character per step, far too slowly to fit.
        let policy = SizePrune::new(0.0, |v: Value| {
            let s = v.as_str().unwrap_or_default();
            json!(s[..s.len().saturating_sub(1)].to_string())
        });
        let input = json!("y".repeat(MAX_PRUNE_ITERATIONS + 100));
        let (value, outcome) = prune_to_size("text", &policy, input);
        assert_eq!(outcome, SizeOutcome::CeilingReached);
        assert_eq!(value.as_str().unwrap().len(), 100);
    }

    #[test]
    fn test_size_prune_panicking_step() {
        let policy = SizePrune::new(0.01, |_| panic!("step exploded"));
        let input = big_list(10);
        let (value, outcome) = prune_to_size("list", &policy, input.clone());
        assert_eq!(value, input);
        assert_eq!(outcome, SizeOutcome::StepFailed);
    }

    #[test]
    fn test_prune_runs_predicate_before_size() {
        let keep_ten: PruneFn = Arc::new(|v| match v {
            Value::Array(items) => Value::Array(items.into_iter().take(10).collect()),
            other => other,
        });
        let size = SizePrune::new(0.05, drop_first);
        let value = prune("list", Some(&keep_ten), Some(&size), big_list(100));
        let items = value.as_array().unwrap();
        assert!(items.len() < 10);
        assert!(serialized_size(&value) <= 51);
        assert_eq!(items.last(), Some(&json!("entry-0009")));
    }
}
