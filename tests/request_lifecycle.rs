//! Request action lifecycle: prepare, transport, success or fail.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{record_actions, RecordingTransport, User};
use parking_lot::Mutex;
use reslice::{
    ActionEvent, BaseAction, MetaStatus, Model, Next, RequestAction, RequestError, Store,
    TransportError,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
struct Profile {
    user: Option<User>,
    error: Option<String>,
    loads: u32,
}

fn profile(store: &Store) -> Model<Profile> {
    Model::new(store, "Profile", Profile::default())
}

fn fetch_user(model: &Model<Profile>, transport: Arc<RecordingTransport>) -> RequestAction<Profile, u32, User> {
    model
        .request::<u32, User>("fetch", transport)
        .uri_with(|id| format!("/users/{}", id))
        .on_success(|state: &mut Profile, event: &ActionEvent<'_, u32, User>| {
            state.user = event.response.cloned();
            state.error = None;
            state.loads += 1;
            Next::Keep
        })
        .on_fail(|state: &mut Profile, event: &ActionEvent<'_, u32, User>| {
            state.error = event.message.map(str::to_string);
            Next::Keep
        })
        .build()
}

fn ann() -> Value {
    json!({ "id": 1, "name": "ann" })
}

#[tokio::test(start_paused = true)]
async fn loading_is_true_only_while_pending() {
    let store = common::store();
    let model = profile(&store);
    let transport = RecordingTransport::new();
    transport.respond_after(Duration::from_millis(100), ann());
    let fetch = fetch_user(&model, transport.clone());

    assert!(!fetch.loading());
    let promise = fetch.invoke(1);
    assert!(fetch.loading());
    assert_eq!(fetch.meta().status, MetaStatus::Pending);

    let user = promise.await.unwrap();
    assert_eq!(user.name, "ann");
    assert!(!fetch.loading());
    assert_eq!(fetch.meta().status, MetaStatus::Succeeded);
    assert_eq!(model.state().unwrap().user.as_ref(), Some(&user));
    assert_eq!(transport.requests()[0].uri, "/users/1");
}

#[tokio::test]
async fn failure_reaches_state_meta_and_caller() {
    let store = common::store();
    let model = profile(&store);
    let transport = RecordingTransport::new();
    transport.fail(
        TransportError::new("no such user")
            .with_status(404)
            .with_business_code("E_USER"),
    );
    let fetch = fetch_user(&model, transport);

    let err = fetch.invoke(7).await.unwrap_err();
    assert_eq!(err.http_status(), Some(404));

    let meta = fetch.meta();
    assert!(meta.is_failed());
    assert!(!meta.loading);
    assert_eq!(meta.message.as_deref(), Some("no such user"));
    assert_eq!(meta.http_status, Some(404));
    assert_eq!(meta.business_code.as_deref(), Some("E_USER"));
    assert_eq!(model.state().unwrap().error.as_deref(), Some("no such user"));
}

#[tokio::test]
async fn show_error_calls_the_store_hook() {
    let store = common::store();
    let reported = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reported);
    store.set_error_hook(move |action: &str, err: &RequestError| {
        sink.lock().push((action.to_string(), err.message()));
    });
    let model = profile(&store);
    let transport = RecordingTransport::new();
    transport.fail(TransportError::new("boom"));
    transport.fail(TransportError::new("quiet"));

    let loud = model
        .request::<u32, User>("loud", transport.clone())
        .show_error(true)
        .build();
    let quiet = model.request::<u32, User>("quiet", transport).build();

    assert!(loud.invoke(1).await.is_err());
    assert!(quiet.invoke(1).await.is_err());
    assert_eq!(
        *reported.lock(),
        vec![("Profile.loud".to_string(), "boom".to_string())]
    );
}

#[tokio::test(start_paused = true)]
async fn earlier_failure_does_not_override_later_success() {
    let store = common::store();
    let model = profile(&store);
    let transport = RecordingTransport::new();
    transport.fail_after(Duration::from_millis(200), TransportError::new("slow failure"));
    transport.respond_after(Duration::from_millis(50), json!({ "id": 2, "name": "bob" }));
    let fetch = fetch_user(&model, transport);
    let seen = record_actions(&store);

    let first = fetch.invoke(1);
    let second = fetch.invoke(2);

    assert_eq!(second.await.unwrap().name, "bob");
    let err = first.await.unwrap_err();
    assert!(matches!(err, RequestError::Superseded(_)));

    let state = model.state().unwrap();
    assert_eq!(state.user.as_ref().map(|u| u.id), Some(2));
    assert_eq!(state.error, None);
    assert_eq!(fetch.meta().status, MetaStatus::Succeeded);
    assert!(!seen.lock().iter().any(|kind| kind == "Profile.fetch/fail"));
}

#[tokio::test(start_paused = true)]
async fn cancel_rejects_and_dispatches_fail() {
    let store = common::store();
    let model = profile(&store);
    let transport = RecordingTransport::new();
    transport.respond_after(Duration::from_secs(5), ann());
    let fetch = fetch_user(&model, transport);

    let promise = fetch.invoke(1);
    promise.cancel();
    assert_eq!(promise.await, Err(RequestError::Cancelled));

    let meta = fetch.meta();
    assert!(meta.is_failed());
    assert_eq!(meta.message.as_deref(), Some("Request cancelled"));
    assert_eq!(model.state().unwrap().user, None);
}

#[tokio::test]
async fn pure_abort_skips_fail() {
    let store = common::store();
    let model = profile(&store);
    let transport = RecordingTransport::new();
    transport.fail(TransportError::aborted("dropped by transport"));
    let fetch = fetch_user(&model, transport);
    let seen = record_actions(&store);

    let err = fetch.invoke(1).await.unwrap_err();
    assert!(matches!(err, RequestError::Transport(ref e) if e.aborted));
    assert_eq!(*seen.lock(), vec!["Profile.fetch/prepare"]);
    assert_eq!(model.state().unwrap().error, None);
}

#[tokio::test]
async fn undecodable_response_fails() {
    let store = common::store();
    let model = profile(&store);
    let transport = RecordingTransport::new();
    transport.respond(json!("not a user"));
    let fetch = fetch_user(&model, transport);

    let err = fetch.invoke(1).await.unwrap_err();
    assert!(matches!(err, RequestError::Decode { .. }));
    assert!(fetch.meta().is_failed());
    assert_eq!(model.state().unwrap().loads, 0);
}

#[tokio::test(start_paused = true)]
async fn keyed_metas_track_each_payload() {
    let store = common::store();
    let model = profile(&store);
    let transport = RecordingTransport::new();
    transport.respond_after(Duration::from_millis(100), ann());
    transport.fail_after(Duration::from_millis(50), TransportError::new("missing"));
    let fetch = model
        .request::<u32, User>("byId", transport)
        .meta_keyed(|id| id.to_string())
        .build();

    let one = fetch.invoke(1);
    let two = fetch.invoke(2);
    assert!(fetch.loading_for("1"));
    assert!(fetch.loading_for("2"));
    assert!(!fetch.loading_for("3"));

    assert!(two.await.is_err());
    let metas = fetch.metas();
    assert!(metas.pick("2").is_failed());
    assert!(metas.loading("1"));

    one.await.unwrap();
    let metas = fetch.metas();
    assert_eq!(metas.pick("1").status, MetaStatus::Succeeded);
    assert_eq!(metas.pick("3").status, MetaStatus::Idle);
    assert_eq!(metas.len(), 2);
}

#[tokio::test]
async fn three_increments_are_observed_in_order() {
    let store = common::store();
    let counter = Model::new(&store, "Counter", 10u32);
    let inc = counter
        .request::<(), Value>("inc", RecordingTransport::new())
        .on_success(|n: &mut u32, _: &ActionEvent<'_, (), Value>| Next::Replace(*n + 1))
        .build();
    let seen = record_actions(&store);

    for _ in 0..3 {
        inc.invoke(()).await.unwrap();
    }

    assert_eq!(*counter.state().unwrap(), 13);
    assert_eq!(
        *seen.lock(),
        vec![
            "Counter.inc/prepare",
            "Counter.inc/success",
            "Counter.inc/prepare",
            "Counter.inc/success",
            "Counter.inc/prepare",
            "Counter.inc/success",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn after_effects_run_immediately_or_delayed() {
    let store = common::store();
    let model = profile(&store);
    let transport = RecordingTransport::new();
    transport.respond(ann());
    let events = Arc::new(Mutex::new(Vec::new()));
    let on_prepare = Arc::clone(&events);
    let on_success = Arc::clone(&events);
    let fetch = model
        .request::<u32, User>("fetch", transport)
        .after_prepare(None, move |event: &ActionEvent<'_, u32, User>| {
            on_prepare.lock().push(format!("prepare {}", event.payload));
        })
        .after_success(
            Some(Duration::from_secs(1)),
            move |event: &ActionEvent<'_, u32, User>| {
                let name = event.response.map(|u| u.name.clone()).unwrap_or_default();
                on_success.lock().push(format!("success {}", name));
            },
        )
        .build();

    let promise = fetch.invoke(1);
    assert_eq!(*events.lock(), vec!["prepare 1"]);
    promise.await.unwrap();
    assert_eq!(events.lock().len(), 1);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(*events.lock(), vec!["prepare 1", "success ann"]);
}

#[tokio::test]
async fn other_models_react_to_request_success() {
    let store = common::store();
    let model = profile(&store);
    let transport = RecordingTransport::new();
    transport.respond(ann());
    let fetch = fetch_user(&model, transport);

    let audit = Model::new(&store, "Audit", Vec::<String>::new());
    audit
        .on(fetch.on_success(|log: &mut Vec<String>, event: &ActionEvent<'_, u32, User>| {
            let name = event.response.map(|u| u.name.as_str()).unwrap_or("?");
            log.push(format!("loaded {} as {}", event.payload, name));
            Next::Keep
        }))
        .unwrap();
    audit.register().unwrap();

    fetch.invoke(1).await.unwrap();
    assert_eq!(*audit.state().unwrap(), vec!["loaded 1 as ann"]);
}

#[test]
fn invoking_outside_a_runtime_fails_without_dispatching() {
    let store = common::store();
    let model = profile(&store);
    let fetch = fetch_user(&model, RecordingTransport::new());
    let seen = record_actions(&store);

    let promise = fetch.invoke(1);
    let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
    assert!(matches!(runtime.block_on(promise), Err(RequestError::Failed(_))));
    assert!(seen.lock().is_empty());
}

#[test]
fn action_names_follow_model_and_key() {
    let store = common::store();
    let model = profile(&store);
    let fetch = fetch_user(&model, RecordingTransport::new());
    assert_eq!(fetch.name(), "Profile.fetch");
    assert_eq!(fetch.prepare_type(), "Profile.fetch/prepare");
    assert_eq!(fetch.fail_type(), "Profile.fetch/fail");
}
