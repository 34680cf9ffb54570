//! State reducer engine.
//!
//! A transition receives a mutable draft (a clone of the current slice value)
//! and returns [`Next`]. For object and collection slices `Next::Keep`
//! commits whatever the draft now holds. Primitive slices have nothing to
//! fall back on, so they must return `Next::Replace`.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::action::{Action, ActionEvent, AnyValue};
use crate::error::StoreError;
use crate::persist::{Rehydrate, REHYDRATE};

/// Outcome of a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Next<S> {
    /// Commit the (possibly mutated) draft.
    Keep,
    /// Replace the slice value wholesale.
    Replace(S),
}

/// Values that can live in a slice.
pub trait SliceState:
    Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> SliceState for T where
    T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

pub(crate) type Transition<S> =
    Arc<dyn Fn(&mut S, &Action) -> Result<Next<S>, StoreError> + Send + Sync>;

/// Wrap a typed transition so it can ride on an [`Action`].
pub(crate) fn erase<S, P, R, F>(f: F) -> Transition<S>
where
    S: 'static,
    P: 'static,
    R: 'static,
    F: Fn(&mut S, &ActionEvent<'_, P, R>) -> Next<S> + Send + Sync + 'static,
{
    Arc::new(move |state: &mut S, action: &Action| {
        let event = action.event::<P, R>()?;
        Ok(f(state, &event))
    })
}

pub(crate) fn share<S: 'static>(transition: &Transition<S>) -> AnyValue {
    Arc::new(Arc::clone(transition))
}

/// A foreign-slice reaction to another model's action: `{when, effect}`.
pub struct Subscription<S> {
    pub when: String,
    pub(crate) effect: Transition<S>,
}

impl<S> Subscription<S> {
    pub(crate) fn new(when: String, effect: Transition<S>) -> Self {
        Self { when, effect }
    }
}

impl<S> Clone for Subscription<S> {
    fn clone(&self) -> Self {
        Self {
            when: self.when.clone(),
            effect: Arc::clone(&self.effect),
        }
    }
}

impl<S> fmt::Debug for Subscription<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("when", &self.when)
            .finish_non_exhaustive()
    }
}

pub(crate) type SliceValue = Arc<dyn Any + Send + Sync>;

/// Object-safe view of a slice the store can drive without knowing its type.
pub(crate) trait ErasedSlice: Send + Sync {
    fn name(&self) -> &str;

    fn initial(&self) -> SliceValue;

    /// Whether `value` has this slice's type.
    fn holds(&self, value: &SliceValue) -> bool;

    /// `Ok(None)` when the action leaves the slice untouched.
    fn reduce(&self, current: &SliceValue, action: &Action)
        -> Result<Option<SliceValue>, StoreError>;

    /// Persisted form, after the slice's persist filter.
    fn serialize(&self, value: &SliceValue) -> Result<Value, StoreError>;

    fn deserialize(&self, raw: Value) -> Option<SliceValue>;
}

pub(crate) type PersistFilter<S> = Arc<dyn Fn(&mut S) + Send + Sync>;

/// Typed slice: name, initial value, ordered cases.
pub(crate) struct SliceReducer<S> {
    name: String,
    initial: S,
    draftable: bool,
    cases: Vec<Subscription<S>>,
    persist_filter: Option<PersistFilter<S>>,
}

impl<S: SliceState> SliceReducer<S> {
    pub(crate) fn new(
        name: String,
        initial: S,
        cases: Vec<Subscription<S>>,
        persist_filter: Option<PersistFilter<S>>,
    ) -> Result<Self, StoreError> {
        let shape = serde_json::to_value(&initial).map_err(|e| StoreError::Serialize {
            slice: name.clone(),
            message: e.to_string(),
        })?;
        if shape.is_null() {
            return Err(StoreError::NullInitialState { slice: name });
        }
        Ok(Self {
            draftable: shape.is_object() || shape.is_array(),
            name,
            initial,
            cases,
            persist_filter,
        })
    }

    fn transitions<'a>(&'a self, action: &'a Action) -> Vec<&'a Transition<S>> {
        if action.model.as_deref() == Some(self.name.as_str()) {
            if let Some(own) = action
                .transition
                .as_ref()
                .and_then(|t| t.downcast_ref::<Transition<S>>())
            {
                return vec![own];
            }
        }
        self.cases
            .iter()
            .filter(|case| case.when == action.kind)
            .map(|case| &case.effect)
            .collect()
    }

    fn rehydrate(&self, current: &S, action: &Action) -> Option<SliceValue> {
        let raw = action.payload::<Rehydrate>()?.values.get(&self.name)?;
        match serde_json::from_value::<S>(raw.clone()) {
            Ok(restored) if restored != *current => Some(Arc::new(restored)),
            Ok(_) => None,
            Err(err) => {
                tracing::warn!(slice = %self.name, error = %err, "Discarding persisted value");
                None
            }
        }
    }
}

impl<S: SliceState> ErasedSlice for SliceReducer<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn initial(&self) -> SliceValue {
        Arc::new(self.initial.clone())
    }

    fn holds(&self, value: &SliceValue) -> bool {
        value.is::<S>()
    }

    fn reduce(
        &self,
        current: &SliceValue,
        action: &Action,
    ) -> Result<Option<SliceValue>, StoreError> {
        let current = current
            .downcast_ref::<S>()
            .ok_or_else(|| StoreError::SliceType {
                slice: self.name.clone(),
            })?;

        if action.kind == REHYDRATE {
            return Ok(self.rehydrate(current, action));
        }

        let transitions = self.transitions(action);
        if transitions.is_empty() {
            return Ok(None);
        }

        let mut draft = current.clone();
        for transition in transitions {
            match transition(&mut draft, action)? {
                Next::Keep if !self.draftable => {
                    return Err(StoreError::StateMustBeReturned {
                        slice: self.name.clone(),
                        event: action.kind.clone(),
                    });
                }
                Next::Keep => {}
                Next::Replace(value) => draft = value,
            }
        }

        if draft == *current {
            Ok(None)
        } else {
            Ok(Some(Arc::new(draft)))
        }
    }

    fn serialize(&self, value: &SliceValue) -> Result<Value, StoreError> {
        let value = value
            .downcast_ref::<S>()
            .ok_or_else(|| StoreError::SliceType {
                slice: self.name.clone(),
            })?;
        let result = match &self.persist_filter {
            Some(filter) => {
                let mut copy = value.clone();
                filter(&mut copy);
                serde_json::to_value(&copy)
            }
            None => serde_json::to_value(value),
        };
        result.map_err(|e| StoreError::Serialize {
            slice: self.name.clone(),
            message: e.to_string(),
        })
    }

    fn deserialize(&self, raw: Value) -> Option<SliceValue> {
        match serde_json::from_value::<S>(raw) {
            Ok(value) => Some(Arc::new(value)),
            Err(err) => {
                tracing::warn!(slice = %self.name, error = %err, "Discarding persisted value");
                None
            }
        }
    }
}

/// Immutable snapshot of the whole state tree.
#[derive(Clone, Default)]
pub struct StateTree {
    slices: Arc<HashMap<String, SliceValue>>,
}

impl StateTree {
    pub(crate) fn from_map(slices: HashMap<String, SliceValue>) -> Self {
        Self {
            slices: Arc::new(slices),
        }
    }

    pub(crate) fn raw(&self, name: &str) -> Option<&SliceValue> {
        self.slices.get(name)
    }

    pub(crate) fn to_map(&self) -> HashMap<String, SliceValue> {
        (*self.slices).clone()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slices.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.slices.keys().map(String::as_str)
    }

    /// Read a slice value.
    pub fn get<S: Send + Sync + 'static>(&self, name: &str) -> Result<Arc<S>, StoreError> {
        let value = self
            .slices
            .get(name)
            .ok_or_else(|| StoreError::SliceNotRegistered {
                slice: name.to_string(),
            })?;
        Arc::clone(value)
            .downcast::<S>()
            .map_err(|_| StoreError::SliceType {
                slice: name.to_string(),
            })
    }

    /// Whether two snapshots share the same slice value for `name`.
    pub fn same_slice(&self, other: &StateTree, name: &str) -> bool {
        match (self.slices.get(name), other.slices.get(name)) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl fmt::Debug for StateTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.names().collect();
        names.sort_unstable();
        f.debug_struct("StateTree").field("slices", &names).finish()
    }
}
