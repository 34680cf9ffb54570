//! Dispatchable action descriptors and the action kinds built on them.
//!
//! ```text
//! invoke ──→ prepare ──→ transport ──┬──→ success
//!                                    └──→ fail
//! ```
//!
//! - **DirectAction**: a single synchronous success dispatch
//! - **RequestAction**: prepare/success/fail around a transport call
//! - **ComposeAction**: prepare/success/fail around any async function,
//!   tracked only by the meta slice

mod compose;
mod direct;
mod request;

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub use compose::ComposeAction;
pub use direct::DirectAction;
pub use request::{CallOptions, CancelHandle, RequestAction, RequestBuilder, RequestPromise};

use crate::error::StoreError;

/// Type-erased, shareable value carried by actions and the state tree.
pub type AnyValue = Arc<dyn Any + Send + Sync>;

/// Lifecycle phase an action reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Prepare,
    Success,
    Fail,
    /// Internal actions (meta restore, rehydrate).
    System,
}

/// A dispatched action.
///
/// This is the protocol between slices: any slice can react to any action
/// type, while the originating slice additionally receives the transition
/// carried on the action itself.
#[derive(Clone)]
pub struct Action {
    pub kind: String,
    pub phase: Phase,
    pub payload: AnyValue,
    /// Name of the slice that issued this action.
    pub model: Option<String>,
    pub(crate) transition: Option<AnyValue>,
    /// Key for keyed metas.
    pub meta_key: Option<String>,
    /// Action name the meta slice records this event under.
    pub meta_action: Option<String>,
    pub response: Option<AnyValue>,
    pub message: Option<String>,
    pub http_status: Option<u16>,
    pub business_code: Option<String>,
    pub from_throttle: bool,
}

impl Action {
    pub fn new<P: Send + Sync + 'static>(kind: impl Into<String>, phase: Phase, payload: P) -> Self {
        Self::from_shared(kind, phase, Arc::new(payload))
    }

    pub(crate) fn from_shared(kind: impl Into<String>, phase: Phase, payload: AnyValue) -> Self {
        Self {
            kind: kind.into(),
            phase,
            payload,
            model: None,
            transition: None,
            meta_key: None,
            meta_action: None,
            response: None,
            message: None,
            http_status: None,
            business_code: None,
            from_throttle: false,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub(crate) fn with_transition(mut self, transition: Option<AnyValue>) -> Self {
        self.transition = transition;
        self
    }

    pub(crate) fn with_meta(mut self, action: Option<String>, key: Option<String>) -> Self {
        self.meta_action = action;
        self.meta_key = key;
        self
    }

    pub fn payload<P: 'static>(&self) -> Option<&P> {
        self.payload.downcast_ref::<P>()
    }

    pub fn response<R: 'static>(&self) -> Option<&R> {
        self.response.as_ref().and_then(|r| r.downcast_ref::<R>())
    }

    /// Typed view of this action for transitions and effects.
    pub fn event<P: 'static, R: 'static>(&self) -> Result<ActionEvent<'_, P, R>, StoreError> {
        let payload = self.payload::<P>().ok_or_else(|| StoreError::PayloadType {
            event: self.kind.clone(),
        })?;
        // `R = ()` means the caller does not look at the response.
        let response = match &self.response {
            Some(response) => match response.downcast_ref::<R>() {
                Some(response) => Some(response),
                None if TypeId::of::<R>() == TypeId::of::<()>() => None,
                None => {
                    return Err(StoreError::PayloadType {
                        event: self.kind.clone(),
                    })
                }
            },
            None => None,
        };
        Ok(ActionEvent {
            kind: &self.kind,
            phase: self.phase,
            payload,
            response,
            message: self.message.as_deref(),
            http_status: self.http_status,
            business_code: self.business_code.as_deref(),
            from_throttle: self.from_throttle,
        })
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("kind", &self.kind)
            .field("phase", &self.phase)
            .field("model", &self.model)
            .field("meta_action", &self.meta_action)
            .field("meta_key", &self.meta_key)
            .field("message", &self.message)
            .field("http_status", &self.http_status)
            .field("from_throttle", &self.from_throttle)
            .finish_non_exhaustive()
    }
}

/// Typed, borrowed view of an [`Action`].
#[derive(Debug)]
pub struct ActionEvent<'a, P, R = ()> {
    pub kind: &'a str,
    pub phase: Phase,
    pub payload: &'a P,
    pub response: Option<&'a R>,
    pub message: Option<&'a str>,
    pub http_status: Option<u16>,
    pub business_code: Option<&'a str>,
    pub from_throttle: bool,
}

/// Contract shared by every action kind.
pub trait BaseAction {
    /// Bound action name. Binds on first call.
    fn name(&self) -> &str;

    /// Bind an explicit name. Only the first binding takes effect.
    fn set_name(&self, name: &str) -> bool;

    fn success_type(&self) -> String {
        format!("{}/success", self.name())
    }

    fn prepare_type(&self) -> String {
        format!("{}/prepare", self.name())
    }

    fn fail_type(&self) -> String {
        format!("{}/fail", self.name())
    }
}

/// Side effect run after a lifecycle dispatch, optionally delayed.
pub(crate) struct Effect {
    delay: Option<Duration>,
    run: Arc<dyn Fn(&Action) + Send + Sync>,
}

impl Effect {
    pub(crate) fn new<P, R, F>(delay: Option<Duration>, f: F) -> Self
    where
        P: 'static,
        R: 'static,
        F: Fn(&ActionEvent<'_, P, R>) + Send + Sync + 'static,
    {
        Self {
            delay,
            run: Arc::new(move |action: &Action| match action.event::<P, R>() {
                Ok(event) => f(&event),
                Err(err) => tracing::warn!(error = %err, "Skipping effect"),
            }),
        }
    }

    /// Run now, or on a timer when a delay is set.
    pub(crate) fn schedule(&self, action: &Action) {
        match self.delay {
            None => (self.run)(action),
            Some(delay) => {
                let run = Arc::clone(&self.run);
                let action = action.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    run(&action);
                });
            }
        }
    }
}
