//! Shared workflow state with per-key conflict resolution
//!
//! The [`StateStore`] holds the single global state of a workflow run. Every
//! node reads it (through a per-superstep [`StateView`] snapshot) and every
//! node output is written back through [`StateStore::update`].
//!
//! # Update strategies
//!
//! | Strategy | Behavior when the key exists | When absent |
//! |----------|------------------------------|-------------|
//! | [`UpdateStrategy::Overwrite`] | replace | insert |
//! | [`UpdateStrategy::Merge`] | reducer, object union, array concat, else replace | insert (reducer sees `Null`) |
//! | [`UpdateStrategy::Ignore`] | keep old value | insert |
//! | [`UpdateStrategy::Raise`] | reject the whole call with `DuplicateKey` | insert |
//!
//! # Reducers
//!
//! A [`Reducer`] registered for a key takes over `Merge` updates for that key.
//! Built-ins cover the common cases:
//!
//! - [`OverwriteReducer`] - keep only the latest value
//! - [`AppendReducer`] - accumulate into an array
//! - [`MergeReducer`] - shallow object union
//! - [`SumReducer`] - add numbers
//!
//! ```rust
//! use superstep_core::state::{StateStore, SumReducer, UpdateStrategy};
//! use serde_json::json;
//!
//! let store = StateStore::new();
//! store.register_reducer("tokens", Box::new(SumReducer));
//!
//! let update = json!({"tokens": 10}).as_object().unwrap().clone();
//! store.update(update.clone(), UpdateStrategy::Merge, "llm").unwrap();
//! store.update(update, UpdateStrategy::Merge, "llm").unwrap();
//!
//! assert_eq!(store.get("tokens"), Some(json!(20)));
//! ```
//!
//! # Concurrency
//!
//! One mutex guards the whole store so that a multi-key `update` is atomic.
//! Writes are cheap compared with node execution, so a single lock costs
//! little. Change events are collected while the lock is held and emitted
//! after it is released, which lets event handlers read the store.

use crate::error::{GraphError, Result};
use crate::events::{Event, EventBus, EventPayload};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;

/// Keyed record used for state, node inputs, node outputs and messages.
pub type StateMap = serde_json::Map<String, Value>;

/// Strategy applied by [`StateStore::update`] to every key of the update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStrategy {
    /// Replace each key unconditionally
    #[default]
    Overwrite,
    /// Combine old and new values (see module docs)
    Merge,
    /// Write only keys that are currently absent
    Ignore,
    /// Write only keys that are currently absent, fail otherwise
    Raise,
}

/// Error produced by a [`Reducer`]
#[derive(Debug, Error)]
pub enum StateError {
    /// Reducer encountered incompatible types or failed to merge
    #[error("{0}")]
    ReducerError(String),
}

/// Trait for merging an incoming value into the current one
pub trait Reducer: Send + Sync {
    /// Combine `current` (`Null` when the key is absent) with `update`
    fn reduce(&self, current: &Value, update: &Value) -> std::result::Result<Value, StateError>;

    /// Human-readable name for this reducer
    fn name(&self) -> &str;
}

/// Replaces the current value with the update
#[derive(Debug, Clone)]
pub struct OverwriteReducer;

impl Reducer for OverwriteReducer {
    fn reduce(&self, _current: &Value, update: &Value) -> std::result::Result<Value, StateError> {
        Ok(update.clone())
    }

    fn name(&self) -> &str {
        "overwrite"
    }
}

/// Appends the update to the current array
///
/// Arrays are concatenated, scalars are pushed as a single element, and a
/// missing current value starts a new array.
#[derive(Debug, Clone)]
pub struct AppendReducer;

impl Reducer for AppendReducer {
    fn reduce(&self, current: &Value, update: &Value) -> std::result::Result<Value, StateError> {
        let mut items = match current {
            Value::Array(items) => items.clone(),
            Value::Null => Vec::new(),
            other => {
                return Err(StateError::ReducerError(format!(
                    "AppendReducer requires an array, found {}",
                    type_name(other)
                )))
            }
        };

        match update {
            Value::Array(more) => items.extend(more.iter().cloned()),
            single => items.push(single.clone()),
        }
        Ok(Value::Array(items))
    }

    fn name(&self) -> &str {
        "append"
    }
}

/// Shallow union of two objects, update keys win
#[derive(Debug, Clone)]
pub struct MergeReducer;

impl Reducer for MergeReducer {
    fn reduce(&self, current: &Value, update: &Value) -> std::result::Result<Value, StateError> {
        match (current, update) {
            (Value::Object(curr_obj), Value::Object(upd_obj)) => {
                let mut result = curr_obj.clone();
                for (key, value) in upd_obj {
                    result.insert(key.clone(), value.clone());
                }
                Ok(Value::Object(result))
            }
            (Value::Null, Value::Object(upd_obj)) => Ok(Value::Object(upd_obj.clone())),
            _ => Err(StateError::ReducerError(
                "MergeReducer requires object values".to_string(),
            )),
        }
    }

    fn name(&self) -> &str {
        "merge"
    }
}

/// Adds numeric values, keeping integers as integers
///
/// A sum that does not fit (`i64` overflow or a non-finite float) is an error.
#[derive(Debug, Clone)]
pub struct SumReducer;

impl Reducer for SumReducer {
    fn reduce(&self, current: &Value, update: &Value) -> std::result::Result<Value, StateError> {
        match (current, update) {
            (Value::Null, Value::Number(_)) => Ok(update.clone()),
            (Value::Number(a), Value::Number(b)) => {
                if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
                    return x.checked_add(y).map(Value::from).ok_or_else(|| overflow(a, b));
                }
                a.as_f64()
                    .zip(b.as_f64())
                    .and_then(|(x, y)| serde_json::Number::from_f64(x + y))
                    .map(Value::Number)
                    .ok_or_else(|| overflow(a, b))
            }
            _ => Err(StateError::ReducerError(format!(
                "SumReducer requires numbers, found {} and {}",
                type_name(current),
                type_name(update)
            ))),
        }
    }

    fn name(&self) -> &str {
        "sum"
    }
}

fn overflow(a: &serde_json::Number, b: &serde_json::Number) -> StateError {
    StateError::ReducerError(format!("SumReducer overflow adding {a} and {b}"))
}

/// Adapter turning a plain merge closure into a [`Reducer`]
pub(crate) struct FnReducer<F>(pub(crate) F);

impl<F> Reducer for FnReducer<F>
where
    F: Fn(&Value, &Value) -> Value + Send + Sync,
{
    fn reduce(&self, current: &Value, update: &Value) -> std::result::Result<Value, StateError> {
        Ok((self.0)(current, update))
    }

    fn name(&self) -> &str {
        "custom"
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Default `Merge` behavior when no reducer is registered for a key.
fn default_merge(old: Option<&Value>, new: &Value) -> Value {
    match (old, new) {
        (Some(Value::Object(old_obj)), Value::Object(new_obj)) => {
            let mut merged = old_obj.clone();
            for (k, v) in new_obj {
                merged.insert(k.clone(), v.clone());
            }
            Value::Object(merged)
        }
        (Some(Value::Array(old_items)), Value::Array(new_items)) => {
            let mut merged = old_items.clone();
            merged.extend(new_items.iter().cloned());
            Value::Array(merged)
        }
        _ => new.clone(),
    }
}

/// Read-only, point-in-time view of the state.
///
/// Cheap to clone; every active node of a superstep shares the same view.
#[derive(Debug, Clone, Default)]
pub struct StateView {
    data: Arc<StateMap>,
}

impl StateView {
    /// Wrap an owned map
    pub fn new(data: StateMap) -> Self {
        Self {
            data: Arc::new(data),
        }
    }

    /// Value for `key`, if present
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Whether `key` is present
    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Borrow the underlying map
    pub fn as_map(&self) -> &StateMap {
        &self.data
    }

    /// Copy the view into an owned map
    pub fn to_map(&self) -> StateMap {
        self.data.as_ref().clone()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl From<StateMap> for StateView {
    fn from(data: StateMap) -> Self {
        Self::new(data)
    }
}

#[derive(Default)]
struct StoreInner {
    data: StateMap,
    reducers: HashMap<String, Arc<dyn Reducer>>,
}

/// Thread-safe global workflow state.
#[derive(Default)]
pub struct StateStore {
    inner: Mutex<StoreInner>,
    events: Option<Arc<EventBus>>,
}

impl fmt::Debug for StateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("StateStore")
            .field("keys", &inner.data.len())
            .field("reducers", &inner.reducers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl StateStore {
    /// Create an empty store without event publication
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with `initial`
    pub fn with_initial(initial: StateMap) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                data: initial,
                reducers: HashMap::new(),
            }),
            events: None,
        }
    }

    /// Publish `StateChanged` events on `bus`
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    /// Current value for `key`
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.lock().data.get(key).cloned()
    }

    /// Current value for `key`, or `default` when absent
    pub fn get_or(&self, key: &str, default: Value) -> Value {
        self.get(key).unwrap_or(default)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.lock().data.contains_key(key)
    }

    /// Atomically write a single key and publish the change
    pub fn set(&self, key: impl Into<String>, value: Value, source: &str) {
        let key = key.into();
        let old_value = {
            let mut inner = self.inner.lock();
            inner.data.insert(key.clone(), value.clone())
        };
        self.publish(vec![change(key, old_value, value, source)]);
    }

    /// Atomically apply `updates` using `strategy`.
    ///
    /// Either every key is handled according to the strategy or, on error,
    /// nothing from this call is applied.
    ///
    /// # Errors
    ///
    /// - [`GraphError::DuplicateKey`] for `Raise` when a key already exists
    /// - [`GraphError::Reducer`] when a registered reducer fails
    pub fn update(&self, updates: StateMap, strategy: UpdateStrategy, source: &str) -> Result<()> {
        let changes = self.update_deferred(updates, strategy, source)?;
        self.publish(changes);
        Ok(())
    }

    /// Like [`update`](Self::update), but hands the change events back
    /// instead of publishing them, so a caller that may still roll back can
    /// hold them until the writes are final.
    pub(crate) fn update_deferred(
        &self,
        updates: StateMap,
        strategy: UpdateStrategy,
        source: &str,
    ) -> Result<Vec<Event>> {
        let mut inner = self.inner.lock();
        let resolved = Self::resolve(&inner, updates, strategy)?;

        let mut changes = Vec::with_capacity(resolved.len());
        for (key, value) in resolved {
            let old = inner.data.insert(key.clone(), value.clone());
            changes.push(change(key, old, value, source));
        }
        Ok(changes)
    }

    /// Compute the final value of every key to write, without mutating.
    fn resolve(
        inner: &StoreInner,
        updates: StateMap,
        strategy: UpdateStrategy,
    ) -> Result<Vec<(String, Value)>> {
        if strategy == UpdateStrategy::Raise {
            if let Some(key) = updates.keys().find(|k| inner.data.contains_key(*k)) {
                return Err(GraphError::DuplicateKey { key: key.clone() });
            }
        }

        let mut resolved = Vec::with_capacity(updates.len());
        for (key, new_value) in updates {
            let old = inner.data.get(&key);
            let value = match strategy {
                UpdateStrategy::Overwrite | UpdateStrategy::Raise => new_value,
                UpdateStrategy::Ignore => {
                    if old.is_some() {
                        continue;
                    }
                    new_value
                }
                UpdateStrategy::Merge => match inner.reducers.get(&key) {
                    Some(reducer) => {
                        let current = old.unwrap_or(&Value::Null);
                        let call = AssertUnwindSafe(|| reducer.reduce(current, &new_value));
                        let reduced = panic::catch_unwind(call).unwrap_or_else(|_| {
                            let name = reducer.name();
                            Err(StateError::ReducerError(format!("reducer '{name}' panicked")))
                        });
                        reduced.map_err(|e| GraphError::Reducer {
                            key: key.clone(),
                            error: e.to_string(),
                        })?
                    }
                    None => default_merge(old, &new_value),
                },
            };
            resolved.push((key, value));
        }
        Ok(resolved)
    }

    /// Install a merge closure for future `Merge` updates to `key`
    pub fn register_merge_strategy<F>(&self, key: impl Into<String>, merge: F)
    where
        F: Fn(&Value, &Value) -> Value + Send + Sync + 'static,
    {
        self.register_reducer(key, Box::new(FnReducer(merge)));
    }

    /// Install a [`Reducer`] for future `Merge` updates to `key`
    pub fn register_reducer(&self, key: impl Into<String>, reducer: Box<dyn Reducer>) {
        self.install_reducer(key.into(), Arc::from(reducer));
    }

    pub(crate) fn install_reducer(&self, key: String, reducer: Arc<dyn Reducer>) {
        tracing::debug!(key = %key, reducer = reducer.name(), "Registered merge strategy");
        self.inner.lock().reducers.insert(key, reducer);
    }

    /// Copy of the whole state
    pub fn snapshot(&self) -> StateMap {
        self.inner.lock().data.clone()
    }

    /// Point-in-time read-only view
    pub fn view(&self) -> StateView {
        StateView::new(self.snapshot())
    }

    /// Replace the whole state with `snapshot`
    ///
    /// Restores do not publish change events; they rewind the store rather
    /// than write to it. Registered reducers are kept.
    pub fn restore(&self, snapshot: StateMap) {
        self.inner.lock().data = snapshot;
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().data.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().data.is_empty()
    }

    /// Remove every key, publishing one change per removed key
    pub fn clear(&self, source: &str) {
        let removed = std::mem::take(&mut self.inner.lock().data);
        let changes = removed
            .into_iter()
            .map(|(key, old)| change(key, Some(old), Value::Null, source))
            .collect();
        self.publish(changes);
    }

    pub(crate) fn publish(&self, changes: Vec<Event>) {
        if let Some(bus) = &self.events {
            for event in &changes {
                bus.emit(event);
            }
        }
    }
}

fn change(key: String, old_value: Option<Value>, new_value: Value, source: &str) -> Event {
    Event::new(EventPayload::StateChanged {
        key,
        old_value: old_value.unwrap_or(Value::Null),
        new_value,
        source: source.to_string(),
    })
}
