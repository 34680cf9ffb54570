use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use super::{Action, ActionEvent, BaseAction, Phase};
use crate::error::StoreError;
use crate::identity::LazyName;
use crate::model::ModelCore;
use crate::reducer::{erase, share, Next, SliceState, Subscription, Transition};

/// A synchronous action: one success dispatch carrying its own transition.
pub struct DirectAction<S, P> {
    model: Arc<ModelCore<S>>,
    name: LazyName,
    transition: Transition<S>,
    _payload: PhantomData<fn(P)>,
}

impl<S: SliceState, P: Send + Sync + 'static> DirectAction<S, P> {
    pub(crate) fn new<F>(model: Arc<ModelCore<S>>, key: &str, transition: F) -> Self
    where
        F: Fn(&mut S, &P) -> Next<S> + Send + Sync + 'static,
    {
        let name = LazyName::new(model.name(), key);
        let transition = erase(move |state: &mut S, event: &ActionEvent<'_, P, ()>| {
            transition(state, event.payload)
        });
        Self {
            model,
            name,
            transition,
            _payload: PhantomData,
        }
    }

    /// Dispatch the success event. Registers the owning slice if needed.
    pub fn invoke(&self, payload: P) -> Result<(), StoreError> {
        self.model.ensure_registered()?;
        let action = Action::new(self.success_type(), Phase::Success, payload)
            .with_model(self.model.name())
            .with_transition(Some(share(&self.transition)));
        self.model.store.dispatch(action)
    }

    /// Let another model's slice react to this action.
    pub fn on_success<T, F>(&self, effect: F) -> Subscription<T>
    where
        T: 'static,
        F: Fn(&mut T, &P) -> Next<T> + Send + Sync + 'static,
    {
        let effect = erase(move |state: &mut T, event: &ActionEvent<'_, P, ()>| {
            effect(state, event.payload)
        });
        Subscription::new(self.success_type(), effect)
    }
}

impl<S: SliceState, P> BaseAction for DirectAction<S, P> {
    fn name(&self) -> &str {
        self.name.get(self.model.store.identity())
    }

    fn set_name(&self, name: &str) -> bool {
        self.name.set(name)
    }
}

impl<S: SliceState, P> fmt::Debug for DirectAction<S, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectAction")
            .field("model", &self.model.name())
            .field("key", &self.name.key())
            .finish_non_exhaustive()
    }
}
