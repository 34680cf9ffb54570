use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use tokio::runtime::Handle;

use super::{Action, BaseAction, Phase, RequestPromise};
use crate::error::RequestError;
use crate::identity::LazyName;
use crate::meta::Meta;
use crate::model::ModelCore;
use crate::reducer::SliceState;

type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T, String>> + Send>>;
type Composed<P, T> = Arc<dyn Fn(P) -> BoxFuture<T> + Send + Sync>;

/// Tracks an arbitrary async function through prepare/success/fail.
///
/// The lifecycle events only feed the meta slice: they carry no transition
/// and no response, and are never throttled.
pub struct ComposeAction<S, P, T> {
    model: Arc<ModelCore<S>>,
    name: Arc<LazyName>,
    run: Composed<P, T>,
    _payload: PhantomData<fn(P)>,
}

impl<S, P, T> ComposeAction<S, P, T>
where
    S: SliceState,
    P: Send + Sync + 'static,
    T: Send + 'static,
{
    pub(crate) fn new<E, F, Fut>(model: Arc<ModelCore<S>>, key: &str, f: F) -> Self
    where
        E: fmt::Display + Send + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let name = Arc::new(LazyName::new(model.name(), key));
        let run: Composed<P, T> = Arc::new(move |payload: P| {
            let fut = f(payload);
            Box::pin(async move { fut.await.map_err(|e| e.to_string()) })
        });
        Self {
            model,
            name,
            run,
            _payload: PhantomData,
        }
    }

    pub fn invoke(&self, payload: P) -> RequestPromise<T> {
        let Ok(runtime) = Handle::try_current() else {
            return RequestPromise::settled(Err(RequestError::Failed(
                "composed actions need a Tokio runtime".to_string(),
            )));
        };
        if let Err(err) = self.model.ensure_registered() {
            return RequestPromise::settled(Err(err.into()));
        }

        let store = self.model.store.clone();
        let name = self.name().to_string();
        let model = self.model.name().to_string();
        let event = move |phase: Phase, suffix: &str| {
            Action::new(format!("{}/{}", name, suffix), phase, ())
                .with_model(model.clone())
                .with_meta(Some(name.clone()), None)
        };

        if let Err(err) = store.dispatch(event(Phase::Prepare, "prepare")) {
            return RequestPromise::settled(Err(err.into()));
        }

        let fut = (self.run)(payload);
        let (sender, promise) = RequestPromise::channel();
        let cancel = promise.cancel_handle();
        runtime.spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(RequestError::Cancelled),
                result = fut => result.map_err(RequestError::Failed),
            };
            let result = match outcome {
                Ok(value) => store
                    .dispatch(event(Phase::Success, "success"))
                    .map(|_| value)
                    .map_err(RequestError::from),
                Err(err) => {
                    let mut action = event(Phase::Fail, "fail");
                    action.message = Some(err.message());
                    if let Err(dispatch_err) = store.dispatch(action) {
                        tracing::warn!(error = %dispatch_err, "Fail dispatch rejected");
                    }
                    tracing::warn!(error = %err, "Composed action failed");
                    Err(err)
                }
            };
            let _ = sender.send(result);
        });
        promise
    }

    pub fn meta(&self) -> Meta {
        self.model.store.meta(self.name())
    }

    pub fn loading(&self) -> bool {
        self.meta().loading
    }
}

impl<S: SliceState, P, T> BaseAction for ComposeAction<S, P, T> {
    fn name(&self) -> &str {
        self.name.get(self.model.store.identity())
    }

    fn set_name(&self, name: &str) -> bool {
        self.name.set(name)
    }
}

impl<S: SliceState, P, T> fmt::Debug for ComposeAction<S, P, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComposeAction")
            .field("model", &self.model.name())
            .field("key", &self.name.key())
            .finish_non_exhaustive()
    }
}
