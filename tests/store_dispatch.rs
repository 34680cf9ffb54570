//! Dispatch, reducer and listener behaviour of the store.

mod common;

use std::sync::Arc;

use common::{record_actions, todo, todo_model, Todo, TodoList};
use parking_lot::Mutex;
use reslice::{Action, Model, Next, Phase, StateTree, StoreError};

#[test]
fn mutated_draft_is_committed() {
    let store = common::store();
    let todos = todo_model(&store);
    let add = todos.action("add", |list: &mut TodoList, item: &Todo| {
        list.items.push(item.clone());
        Next::Keep
    });
    let toggle = todos.action("toggle", |list: &mut TodoList, id: &u32| {
        if let Some(item) = list.items.iter_mut().find(|t| t.id == *id) {
            item.done = !item.done;
        }
        Next::Keep
    });

    add.invoke(todo(1, "milk")).unwrap();
    add.invoke(todo(2, "eggs")).unwrap();
    toggle.invoke(2).unwrap();

    let list = todos.state().unwrap();
    assert_eq!(list.items.len(), 2);
    assert!(!list.items[0].done);
    assert!(list.items[1].done);
}

#[test]
fn noop_mutation_keeps_previous_value() {
    let store = common::store();
    let todos = todo_model(&store);
    let add = todos.action("add", |list: &mut TodoList, item: &Todo| {
        list.items.push(item.clone());
        Next::Keep
    });
    let touch = todos.action("touch", |_: &mut TodoList, _: &()| Next::Keep);
    add.invoke(todo(1, "milk")).unwrap();

    let before = store.state();
    touch.invoke(()).unwrap();
    let after = store.state();
    assert!(before.same_slice(&after, "Todo"));
}

#[test]
fn cases_for_one_event_apply_in_order() {
    let store = common::store();
    let log = Model::new(&store, "Log", Vec::<String>::new());
    log.on_type("note", |lines: &mut Vec<String>, text: &String| {
        lines.push(format!("first:{}", text));
        Next::Keep
    })
    .unwrap();
    log.on_type("note", |lines: &mut Vec<String>, text: &String| {
        lines.push(format!("second:{}", text));
        Next::Keep
    })
    .unwrap();
    log.register().unwrap();

    store
        .dispatch(Action::new("note", Phase::Success, "x".to_string()))
        .unwrap();
    assert_eq!(*log.state().unwrap(), vec!["first:x", "second:x"]);
}

#[test]
fn usage_error_aborts_the_whole_dispatch() {
    let store = common::store();
    let log = Model::new(&store, "Log", Vec::<String>::new());
    log.on_type("mixed", |lines: &mut Vec<String>, _: &()| {
        lines.push("touched".to_string());
        Next::Keep
    })
    .unwrap();
    let count = Model::new(&store, "Count", 0u32);
    count
        .on_type("mixed", |n: &mut u32, _: &()| {
            *n += 1;
            Next::Keep
        })
        .unwrap();
    log.register().unwrap();
    count.register().unwrap();
    let seen = record_actions(&store);

    let err = store
        .dispatch(Action::new("mixed", Phase::Success, ()))
        .unwrap_err();
    assert!(matches!(err, StoreError::StateMustBeReturned { .. }));
    assert!(log.state().unwrap().is_empty());
    assert_eq!(*count.state().unwrap(), 0);
    assert!(seen.lock().is_empty());
}

#[test]
fn wrong_payload_type_is_reported() {
    let store = common::store();
    let log = Model::new(&store, "Log", Vec::<String>::new());
    log.on_type("note", |lines: &mut Vec<String>, text: &String| {
        lines.push(text.clone());
        Next::Keep
    })
    .unwrap();
    log.register().unwrap();

    let err = store
        .dispatch(Action::new("note", Phase::Success, 42u32))
        .unwrap_err();
    assert_eq!(
        err,
        StoreError::PayloadType {
            event: "note".to_string()
        }
    );
}

#[test]
fn dispatch_for_unknown_model_fails() {
    let store = common::store();
    let err = store
        .dispatch(Action::new("Ghost.x/success", Phase::Success, ()).with_model("Ghost"))
        .unwrap_err();
    assert_eq!(
        err,
        StoreError::SliceNotRegistered {
            slice: "Ghost".to_string()
        }
    );
}

#[test]
fn dispatch_from_inside_a_transition_is_rejected() {
    let store = common::store();
    let errors: Arc<Mutex<Vec<StoreError>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    let inner = store.clone();
    let count = Model::new(&store, "Count", 0u32);
    let bump = count.action("bump", move |n: &mut u32, _: &()| {
        if let Err(err) = inner.dispatch(Action::new("nested", Phase::Success, ())) {
            sink.lock().push(err);
        }
        Next::Replace(*n + 1)
    });

    bump.invoke(()).unwrap();
    assert_eq!(*count.state().unwrap(), 1);
    assert!(matches!(
        errors.lock().as_slice(),
        [StoreError::DispatchInReducer { .. }]
    ));
}

#[test]
fn listeners_see_the_new_tree_and_may_dispatch() {
    let store = common::store();
    let counter = Model::new(&store, "Counter", 0u32);
    let bump = counter.action("bump", |n: &mut u32, _: &()| Next::Replace(*n + 1));
    let mirror = Model::new(&store, "Mirror", 0u32);
    let set = mirror.action("set", |_: &mut u32, value: &u32| Next::Replace(*value));
    counter.register().unwrap();
    mirror.register().unwrap();

    store.subscribe(move |action: &Action, tree: &StateTree| {
        if action.kind == "Counter.bump/success" {
            let n = tree.get::<u32>("Counter").unwrap();
            set.invoke(*n).unwrap();
        }
    });

    bump.invoke(()).unwrap();
    bump.invoke(()).unwrap();
    assert_eq!(*mirror.state().unwrap(), 2);
}

#[test]
fn watch_fires_only_when_projection_changes() {
    let store = common::store();
    let todos = todo_model(&store);
    let add = todos.action("add", |list: &mut TodoList, item: &Todo| {
        list.items.push(item.clone());
        Next::Keep
    });
    let finish = todos.action("finish", |list: &mut TodoList, _: &()| {
        list.items.iter_mut().for_each(|t| t.done = true);
        Next::Keep
    });

    let lengths = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&lengths);
    todos
        .watch(
            |list: &TodoList| list.items.len(),
            move |len: &usize| sink.lock().push(*len),
        )
        .unwrap();

    add.invoke(todo(1, "milk")).unwrap();
    finish.invoke(()).unwrap();
    add.invoke(todo(2, "eggs")).unwrap();
    assert_eq!(*lengths.lock(), vec![1, 2]);
}

#[test]
fn unsubscribed_listener_is_not_called() {
    let store = common::store();
    let counter = Model::new(&store, "Counter", 0u32);
    let bump = counter.action("bump", |n: &mut u32, _: &()| Next::Replace(*n + 1));

    let calls = Arc::new(Mutex::new(0));
    let sink = Arc::clone(&calls);
    let id = store.subscribe(move |_: &Action, _: &StateTree| *sink.lock() += 1);

    bump.invoke(()).unwrap();
    assert!(store.unsubscribe(id));
    assert!(!store.unsubscribe(id));
    bump.invoke(()).unwrap();
    assert_eq!(*calls.lock(), 1);
}

#[test]
fn state_tree_reads_check_the_type() {
    let store = common::store();
    let counter = Model::new(&store, "Counter", 7u32);
    counter.register().unwrap();
    assert_eq!(*store.slice::<u32>("Counter").unwrap(), 7);
    assert!(matches!(
        store.slice::<String>("Counter"),
        Err(StoreError::SliceType { .. })
    ));
    assert!(matches!(
        store.slice::<u32>("Missing"),
        Err(StoreError::SliceNotRegistered { .. })
    ));
}
