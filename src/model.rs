//! Models: one slice plus the actions that own it.
//!
//! A model is built against a [`Store`], which acts as the registration
//! context. The slice is registered lazily on first read or first dispatch
//! of one of its actions; until then foreign subscriptions can still be
//! added.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;

use crate::action::{ActionEvent, ComposeAction, DirectAction, RequestBuilder};
use crate::error::StoreError;
use crate::http::Transport;
use crate::identity::ModelName;
use crate::reducer::{erase, Next, PersistFilter, SliceReducer, SliceState, Subscription};
use crate::store::{ListenerId, Store};

struct Pending<S> {
    cases: Vec<Subscription<S>>,
    persist_filter: Option<PersistFilter<S>>,
}

pub(crate) struct ModelCore<S> {
    pub(crate) store: Store,
    name: ModelName,
    initial: S,
    pending: Mutex<Pending<S>>,
    slice: OnceLock<Arc<SliceReducer<S>>>,
}

impl<S: SliceState> ModelCore<S> {
    pub(crate) fn name(&self) -> &str {
        self.name.as_str()
    }

    pub(crate) fn ensure_registered(&self) -> Result<(), StoreError> {
        if self.slice.get().is_some() {
            return Ok(());
        }
        let pending = self.pending.lock();
        if self.slice.get().is_some() {
            return Ok(());
        }
        let reducer = Arc::new(SliceReducer::new(
            self.name().to_string(),
            self.initial.clone(),
            pending.cases.clone(),
            pending.persist_filter.clone(),
        )?);
        let _ = self.slice.set(Arc::clone(&reducer));
        self.store.register(reducer);
        Ok(())
    }

    fn sealed(&self) -> StoreError {
        StoreError::SliceSealed {
            slice: self.name().to_string(),
        }
    }
}

/// Handle to a model. Clones share the same slice and name lease.
pub struct Model<S> {
    core: Arc<ModelCore<S>>,
}

impl<S> Clone for Model<S> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<S: SliceState> Model<S> {
    pub fn new(store: &Store, class: &str, initial: S) -> Self {
        Self::build(store, class, None, initial)
    }

    /// A named instance of `class`, stored under `class.alias`.
    pub fn with_alias(store: &Store, class: &str, alias: &str, initial: S) -> Self {
        Self::build(store, class, Some(alias), initial)
    }

    fn build(store: &Store, class: &str, alias: Option<&str>, initial: S) -> Self {
        let name = store.identity().name_model(class, alias);
        Self {
            core: Arc::new(ModelCore {
                store: store.clone(),
                name,
                initial,
                pending: Mutex::new(Pending {
                    cases: Vec::new(),
                    persist_filter: None,
                }),
                slice: OnceLock::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn store(&self) -> &Store {
        &self.core.store
    }

    /// React to another model's action.
    pub fn on(&self, subscription: Subscription<S>) -> Result<(), StoreError> {
        let mut pending = self.core.pending.lock();
        if self.core.slice.get().is_some() {
            return Err(self.core.sealed());
        }
        pending.cases.push(subscription);
        Ok(())
    }

    /// React to a raw action type, e.g. one dispatched by hand.
    pub fn on_type<P, F>(&self, kind: &str, transition: F) -> Result<(), StoreError>
    where
        P: Send + Sync + 'static,
        F: Fn(&mut S, &P) -> Next<S> + Send + Sync + 'static,
    {
        let effect = erase(move |state: &mut S, event: &ActionEvent<'_, P, ()>| {
            transition(state, event.payload)
        });
        self.on(Subscription::new(kind.to_string(), effect))
    }

    /// Trim the value before it is persisted. Runs on a copy.
    pub fn persist_filter<F>(&self, filter: F) -> Result<(), StoreError>
    where
        F: Fn(&mut S) + Send + Sync + 'static,
    {
        let mut pending = self.core.pending.lock();
        if self.core.slice.get().is_some() {
            return Err(self.core.sealed());
        }
        pending.persist_filter = Some(Arc::new(filter));
        Ok(())
    }

    pub fn register(&self) -> Result<(), StoreError> {
        self.core.ensure_registered()
    }

    pub fn is_registered(&self) -> bool {
        self.core.slice.get().is_some()
    }

    /// Current value of the slice. Registers the slice on first call.
    pub fn state(&self) -> Result<Arc<S>, StoreError> {
        self.core.ensure_registered()?;
        self.core.store.slice::<S>(self.name())
    }

    /// Watch a projection of this slice.
    pub fn watch<T, P, C>(&self, project: P, on_change: C) -> Result<ListenerId, StoreError>
    where
        T: Clone + PartialEq + Send + 'static,
        P: Fn(&S) -> T + Send + Sync + 'static,
        C: Fn(&T) + Send + Sync + 'static,
    {
        self.core.ensure_registered()?;
        Ok(self.core.store.watch::<S, T, P, C>(self.name(), project, on_change))
    }

    /// A synchronous action changing this slice.
    pub fn action<P, F>(&self, key: &str, transition: F) -> DirectAction<S, P>
    where
        P: Send + Sync + 'static,
        F: Fn(&mut S, &P) -> Next<S> + Send + Sync + 'static,
    {
        DirectAction::new(Arc::clone(&self.core), key, transition)
    }

    /// A request action sent through `transport`.
    pub fn request<P, R>(&self, key: &str, transport: Arc<dyn Transport>) -> RequestBuilder<S, P, R>
    where
        P: Send + Sync + 'static,
        R: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        RequestBuilder::new(Arc::clone(&self.core), key, transport)
    }

    /// Track an arbitrary async function in the meta slice.
    pub fn compose<P, T, E, F, Fut>(&self, key: &str, f: F) -> ComposeAction<S, P, T>
    where
        P: Send + Sync + 'static,
        T: Send + 'static,
        E: fmt::Display + Send + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        ComposeAction::new(Arc::clone(&self.core), key, f)
    }
}

impl<S> fmt::Debug for Model<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("name", &self.core.name.as_str())
            .field("registered", &self.core.slice.get().is_some())
            .finish()
    }
}
