//! Request actions: prepare, transport call, then success or fail.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Notify};
use uuid::Uuid;

use super::{Action, ActionEvent, AnyValue, BaseAction, Effect, Phase};
use crate::error::{RequestError, StoreError, TransportError};
use crate::http::{HttpRequest, Method, Transport};
use crate::identity::LazyName;
use crate::meta::{Meta, Metas};
use crate::model::ModelCore;
use crate::reducer::{erase, share, Next, SliceState, Subscription, Transition};
use crate::throttle::{fingerprint, ThrottleSpec};

type FromPayload<P, T> = Arc<dyn Fn(&P) -> T + Send + Sync>;

enum MetaMode<P> {
    Off,
    Single,
    Keyed(FromPayload<P, String>),
}

/// Per-call overrides.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOptions {
    /// Force the throttle on or off for this call.
    pub throttle: Option<bool>,
}

/// Cooperative cancellation of one invocation.
#[derive(Clone, Default)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        // Register before checking the flag so a concurrent cancel is not lost.
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Outcome of an invocation. Await it, or keep the cancel handle and drop it.
pub struct RequestPromise<T> {
    receiver: oneshot::Receiver<Result<T, RequestError>>,
    cancel: CancelHandle,
}

impl<T> RequestPromise<T> {
    pub(crate) fn channel() -> (oneshot::Sender<Result<T, RequestError>>, Self) {
        let (sender, receiver) = oneshot::channel();
        (
            sender,
            Self {
                receiver,
                cancel: CancelHandle::new(),
            },
        )
    }

    pub(crate) fn settled(result: Result<T, RequestError>) -> Self {
        let (sender, promise) = Self::channel();
        let _ = sender.send(result);
        promise
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl<T> Future for RequestPromise<T> {
    type Output = Result<T, RequestError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(RequestError::Dropped)))
    }
}

/// Builder for a [`RequestAction`], obtained from `Model::request`.
pub struct RequestBuilder<S, P, R> {
    model: Arc<ModelCore<S>>,
    key: String,
    transport: Arc<dyn Transport>,
    method: Method,
    uri: FromPayload<P, String>,
    query: Option<FromPayload<P, Value>>,
    body: Option<FromPayload<P, Value>>,
    headers: BTreeMap<String, String>,
    options: Value,
    throttle: Option<ThrottleSpec>,
    meta: MetaMode<P>,
    on_prepare: Option<Transition<S>>,
    on_success: Option<Transition<S>>,
    on_fail: Option<Transition<S>>,
    after_prepare: Option<Effect>,
    after_success: Option<Effect>,
    after_fail: Option<Effect>,
    show_error: bool,
    _response: std::marker::PhantomData<fn() -> R>,
}

impl<S, P, R> RequestBuilder<S, P, R>
where
    S: SliceState,
    P: Send + Sync + 'static,
    R: DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub(crate) fn new(model: Arc<ModelCore<S>>, key: &str, transport: Arc<dyn Transport>) -> Self {
        Self {
            model,
            key: key.to_string(),
            transport,
            method: Method::Get,
            uri: Arc::new(|_: &P| String::new()),
            query: None,
            body: None,
            headers: BTreeMap::new(),
            options: Value::Object(Default::default()),
            throttle: None,
            meta: MetaMode::Single,
            on_prepare: None,
            on_success: None,
            on_fail: None,
            after_prepare: None,
            after_success: None,
            after_fail: None,
            show_error: false,
            _response: std::marker::PhantomData,
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        let uri = uri.into();
        self.uri = Arc::new(move |_: &P| uri.clone());
        self
    }

    /// URI built from the payload, e.g. `/users/{id}`.
    pub fn uri_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&P) -> String + Send + Sync + 'static,
    {
        self.uri = Arc::new(f);
        self
    }

    /// Query parameters as a JSON object.
    pub fn query<F>(mut self, f: F) -> Self
    where
        F: Fn(&P) -> Value + Send + Sync + 'static,
    {
        self.query = Some(Arc::new(f));
        self
    }

    pub fn body<F>(mut self, f: F) -> Self
    where
        F: Fn(&P) -> Value + Send + Sync + 'static,
    {
        self.body = Some(Arc::new(f));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn options(mut self, options: Value) -> Self {
        self.options = options;
        self
    }

    pub fn throttle(mut self, spec: ThrottleSpec) -> Self {
        self.throttle = Some(spec);
        self
    }

    /// Record (or stop recording) this action in the meta slice.
    pub fn meta(mut self, enabled: bool) -> Self {
        self.meta = if enabled { MetaMode::Single } else { MetaMode::Off };
        self
    }

    /// Record one meta per key derived from the payload.
    pub fn meta_keyed<F>(mut self, key: F) -> Self
    where
        F: Fn(&P) -> String + Send + Sync + 'static,
    {
        self.meta = MetaMode::Keyed(Arc::new(key));
        self
    }

    pub fn on_prepare<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut S, &ActionEvent<'_, P, R>) -> Next<S> + Send + Sync + 'static,
    {
        self.on_prepare = Some(erase(f));
        self
    }

    pub fn on_success<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut S, &ActionEvent<'_, P, R>) -> Next<S> + Send + Sync + 'static,
    {
        self.on_success = Some(erase(f));
        self
    }

    pub fn on_fail<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut S, &ActionEvent<'_, P, R>) -> Next<S> + Send + Sync + 'static,
    {
        self.on_fail = Some(erase(f));
        self
    }

    pub fn after_prepare<F>(mut self, delay: Option<Duration>, f: F) -> Self
    where
        F: Fn(&ActionEvent<'_, P, R>) + Send + Sync + 'static,
    {
        self.after_prepare = Some(Effect::new(delay, f));
        self
    }

    pub fn after_success<F>(mut self, delay: Option<Duration>, f: F) -> Self
    where
        F: Fn(&ActionEvent<'_, P, R>) + Send + Sync + 'static,
    {
        self.after_success = Some(Effect::new(delay, f));
        self
    }

    pub fn after_fail<F>(mut self, delay: Option<Duration>, f: F) -> Self
    where
        F: Fn(&ActionEvent<'_, P, R>) + Send + Sync + 'static,
    {
        self.after_fail = Some(Effect::new(delay, f));
        self
    }

    /// Pass failures to the store's error hook.
    pub fn show_error(mut self, show: bool) -> Self {
        self.show_error = show;
        self
    }

    pub fn build(self) -> RequestAction<S, P, R> {
        let name = LazyName::new(self.model.name(), &self.key);
        RequestAction {
            inner: Arc::new(RequestInner {
                name,
                builder: self,
                sequence: AtomicU64::new(0),
                last_success: AtomicU64::new(0),
            }),
        }
    }
}

struct RequestInner<S, P, R> {
    name: LazyName,
    builder: RequestBuilder<S, P, R>,
    sequence: AtomicU64,
    /// Sequence number of the latest invocation that dispatched success.
    last_success: AtomicU64,
}

/// One in-flight invocation.
struct Call {
    id: Uuid,
    seq: u64,
    payload: AnyValue,
    request: HttpRequest,
    meta_key: Option<String>,
    /// Set when throttling is enabled for this call.
    fingerprint: Option<(String, Duration)>,
}

/// An asynchronous action around a transport call.
pub struct RequestAction<S, P, R> {
    inner: Arc<RequestInner<S, P, R>>,
}

impl<S, P, R> Clone for RequestAction<S, P, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S, P, R> RequestAction<S, P, R>
where
    S: SliceState,
    P: Send + Sync + 'static,
    R: DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn invoke(&self, payload: P) -> RequestPromise<R> {
        self.invoke_with(payload, CallOptions::default())
    }

    /// Start an invocation. Prepare is dispatched before this returns; the
    /// transport runs on the current Tokio runtime.
    pub fn invoke_with(&self, payload: P, options: CallOptions) -> RequestPromise<R> {
        let Ok(runtime) = Handle::try_current() else {
            return RequestPromise::settled(Err(RequestError::Failed(
                "request actions need a Tokio runtime".to_string(),
            )));
        };
        if let Err(err) = self.inner.builder.model.ensure_registered() {
            return RequestPromise::settled(Err(err.into()));
        }

        let call = self.inner.new_call(payload, options);
        if let Some(hit) = self.inner.throttle_hit(&call) {
            return RequestPromise::settled(hit);
        }

        if let Err(err) = self.inner.dispatch_prepare(&call) {
            return RequestPromise::settled(Err(err.into()));
        }

        let (sender, promise) = RequestPromise::channel();
        let cancel = promise.cancel_handle();
        let inner = Arc::clone(&self.inner);
        runtime.spawn(async move {
            let result = inner.settle(call, cancel).await;
            let _ = sender.send(result);
        });
        promise
    }

    /// Drop every cached response of this action.
    pub fn clear_throttle(&self) {
        self.inner.builder.model.store.clear_throttle(&self.success_type());
    }

    pub fn meta(&self) -> Meta {
        self.inner.builder.model.store.meta(self.name())
    }

    pub fn metas(&self) -> Metas {
        self.inner.builder.model.store.metas(self.name())
    }

    pub fn loading(&self) -> bool {
        self.meta().loading
    }

    /// Loading flag of one key of a keyed action.
    pub fn loading_for(&self, key: &str) -> bool {
        self.metas().loading(key)
    }

    pub fn on_prepare<T, F>(&self, effect: F) -> Subscription<T>
    where
        T: 'static,
        F: Fn(&mut T, &ActionEvent<'_, P, R>) -> Next<T> + Send + Sync + 'static,
    {
        Subscription::new(self.prepare_type(), erase(effect))
    }

    pub fn on_success<T, F>(&self, effect: F) -> Subscription<T>
    where
        T: 'static,
        F: Fn(&mut T, &ActionEvent<'_, P, R>) -> Next<T> + Send + Sync + 'static,
    {
        Subscription::new(self.success_type(), erase(effect))
    }

    pub fn on_fail<T, F>(&self, effect: F) -> Subscription<T>
    where
        T: 'static,
        F: Fn(&mut T, &ActionEvent<'_, P, R>) -> Next<T> + Send + Sync + 'static,
    {
        Subscription::new(self.fail_type(), erase(effect))
    }
}

impl<S, P, R> RequestInner<S, P, R>
where
    S: SliceState,
    P: Send + Sync + 'static,
    R: DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        self.name.get(self.builder.model.store.identity())
    }

    fn new_call(&self, payload: P, options: CallOptions) -> Call {
        let b = &self.builder;
        let mut request = HttpRequest::new(b.method, (b.uri)(&payload));
        if let Some(query) = &b.query {
            request.query = query(&payload);
        }
        request.body = b.body.as_ref().map(|body| body(&payload));
        request.headers = b.headers.clone();
        request.options = b.options.clone();

        let meta_key = match &b.meta {
            MetaMode::Keyed(key) => Some(key(&payload)),
            _ => None,
        };

        let fingerprint = b.throttle.as_ref().and_then(|spec| {
            let success_type = format!("{}/success", self.name());
            let print = fingerprint(
                b.model.name(),
                &success_type,
                &request,
                spec.transform.as_ref(),
            );
            if options.throttle.unwrap_or(spec.enabled) {
                Some((print, spec.duration))
            } else {
                b.model.store.throttle().invalidate(&success_type, &print);
                None
            }
        });

        Call {
            id: Uuid::new_v4(),
            seq: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
            payload: Arc::new(payload),
            request,
            meta_key,
            fingerprint,
        }
    }

    fn lifecycle(&self, call: &Call, phase: Phase) -> Action {
        let (kind, transition) = match phase {
            Phase::Prepare => (format!("{}/prepare", self.name()), &self.builder.on_prepare),
            Phase::Fail => (format!("{}/fail", self.name()), &self.builder.on_fail),
            _ => (format!("{}/success", self.name()), &self.builder.on_success),
        };
        let meta_action = match self.builder.meta {
            MetaMode::Off => None,
            _ => Some(self.name().to_string()),
        };
        Action::from_shared(kind, phase, Arc::clone(&call.payload))
            .with_model(self.builder.model.name())
            .with_transition(transition.as_ref().map(share))
            .with_meta(meta_action, call.meta_key.clone())
    }

    fn throttle_hit(&self, call: &Call) -> Option<Result<R, RequestError>> {
        let (print, _) = call.fingerprint.as_ref()?;
        let success_type = format!("{}/success", self.name());
        let cached = self
            .builder
            .model
            .store
            .throttle()
            .lookup(&success_type, print)?;
        let value = match serde_json::from_value::<R>(cached) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(action = %self.name(), error = %err, "Dropping undecodable cached response");
                self.builder.model.store.throttle().invalidate(&success_type, print);
                return None;
            }
        };
        tracing::debug!(action = %self.name(), call = %call.id, "Throttle hit");

        let mut action = self.lifecycle(call, Phase::Success);
        action.response = Some(Arc::new(value.clone()));
        action.from_throttle = true;
        // A cached success lands like a real one, so older failures are stale.
        self.last_success.fetch_max(call.seq, Ordering::SeqCst);
        if let Err(err) = self.builder.model.store.dispatch(action.clone()) {
            return Some(Err(err.into()));
        }
        if let Some(effect) = &self.builder.after_success {
            effect.schedule(&action);
        }
        Some(Ok(value))
    }

    fn dispatch_prepare(&self, call: &Call) -> Result<(), StoreError> {
        let action = self.lifecycle(call, Phase::Prepare);
        self.builder.model.store.dispatch(action.clone())?;
        tracing::debug!(action = %self.name(), call = %call.id, seq = call.seq, "Request prepared");
        if let Some(effect) = &self.builder.after_prepare {
            effect.schedule(&action);
        }
        Ok(())
    }

    async fn settle(&self, call: Call, cancel: CancelHandle) -> Result<R, RequestError> {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RequestError::Cancelled),
            result = self.builder.transport.send(call.request.clone()) => {
                result.map_err(RequestError::from)
            }
        };
        let decoded = outcome.and_then(|response| {
            serde_json::from_value::<R>(response.data.clone())
                .map(|value| (value, response.data))
                .map_err(|e| RequestError::Decode {
                    action: self.name().to_string(),
                    message: e.to_string(),
                })
        });

        let mut success_invoked = false;
        let result = match decoded {
            Ok((value, raw)) => {
                success_invoked = true;
                self.succeed(&call, value, raw)
            }
            Err(err) => Err(err),
        };
        match result {
            Ok(value) => Ok(value),
            Err(err) if success_invoked => Err(err),
            Err(err) => self.reject(&call, err),
        }
    }

    fn succeed(&self, call: &Call, value: R, raw: Value) -> Result<R, RequestError> {
        let store = &self.builder.model.store;
        let mut action = self.lifecycle(call, Phase::Success);
        action.response = Some(Arc::new(value.clone()));
        self.last_success.fetch_max(call.seq, Ordering::SeqCst);
        store.dispatch(action.clone())?;

        if let Some((print, duration)) = &call.fingerprint {
            let success_type = format!("{}/success", self.name());
            store
                .throttle()
                .store(&success_type, print.clone(), *duration, raw);
        }
        tracing::debug!(action = %self.name(), call = %call.id, "Request succeeded");
        if let Some(effect) = &self.builder.after_success {
            effect.schedule(&action);
        }
        Ok(value)
    }

    fn reject(&self, call: &Call, err: RequestError) -> Result<R, RequestError> {
        if let RequestError::Transport(transport) = &err {
            if transport.aborted {
                tracing::debug!(action = %self.name(), call = %call.id, "Request aborted");
                return Err(err);
            }
        }
        if self.last_success.load(Ordering::SeqCst) > call.seq {
            tracing::debug!(action = %self.name(), call = %call.id, "Dropping failure superseded by a newer success");
            let cause = match err {
                RequestError::Transport(transport) => transport,
                other => TransportError::new(other.message()),
            };
            return Err(RequestError::Superseded(cause));
        }

        let store = &self.builder.model.store;
        let mut action = self.lifecycle(call, Phase::Fail);
        action.message = Some(err.message());
        action.http_status = err.http_status();
        action.business_code = err.business_code().map(str::to_string);
        if let Err(dispatch_err) = store.dispatch(action.clone()) {
            tracing::warn!(action = %self.name(), error = %dispatch_err, "Fail dispatch rejected");
        }
        tracing::warn!(action = %self.name(), call = %call.id, error = %err, "Request failed");

        if self.builder.show_error {
            store.report_error(self.name(), &err);
        }
        if let Some(effect) = &self.builder.after_fail {
            effect.schedule(&action);
        }
        Err(err)
    }
}

impl<S: SliceState, P, R> BaseAction for RequestAction<S, P, R> {
    fn name(&self) -> &str {
        self.inner
            .name
            .get(self.inner.builder.model.store.identity())
    }

    fn set_name(&self, name: &str) -> bool {
        self.inner.name.set(name)
    }
}

impl<S: SliceState, P, R> fmt::Debug for RequestAction<S, P, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.inner.builder;
        f.debug_struct("RequestAction")
            .field("model", &b.model.name())
            .field("key", &self.inner.name.key())
            .field("method", &b.method)
            .field("throttle", &b.throttle)
            .finish_non_exhaustive()
    }
}
