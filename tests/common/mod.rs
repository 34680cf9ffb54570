//! Shared test utilities: fixture slices and a scripted transport.

#![allow(dead_code, unused_imports)]

pub mod mock_backend;

use async_trait::async_trait;
use parking_lot::Mutex;
use reslice::{
    Action, HttpRequest, HttpResponse, Model, Next, StateTree, Store, StoreConfig, Transport,
    TransportError,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Todo {
    pub id: u32,
    pub title: String,
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TodoList {
    pub items: Vec<Todo>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct User {
    pub id: u32,
    pub name: String,
}

pub fn todo(id: u32, title: &str) -> Todo {
    Todo {
        id,
        title: title.to_string(),
        done: false,
    }
}

pub fn store() -> Store {
    Store::new(StoreConfig::default())
}

/// Empty `Todo` model.
pub fn todo_model(store: &Store) -> Model<TodoList> {
    Model::new(store, "Todo", TodoList::default())
}

/// Record the type of every dispatched action.
pub fn record_actions(store: &Store) -> Arc<Mutex<Vec<String>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    store.subscribe(move |action: &Action, _: &StateTree| {
        sink.lock().push(action.kind.clone());
    });
    seen
}

/// One scripted transport reply.
#[derive(Debug, Clone)]
pub struct Scripted {
    pub delay: Duration,
    pub result: Result<Value, TransportError>,
}

/// Transport that records requests and replies from a script.
///
/// With an empty script every request succeeds with `null` right away.
#[derive(Default)]
pub struct RecordingTransport {
    requests: Mutex<Vec<HttpRequest>>,
    script: Mutex<VecDeque<Scripted>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond(&self, data: Value) {
        self.respond_after(Duration::ZERO, data);
    }

    pub fn respond_after(&self, delay: Duration, data: Value) {
        self.script.lock().push_back(Scripted {
            delay,
            result: Ok(data),
        });
    }

    pub fn fail(&self, err: TransportError) {
        self.fail_after(Duration::ZERO, err);
    }

    pub fn fail_after(&self, delay: Duration, err: TransportError) {
        self.script.lock().push_back(Scripted {
            delay,
            result: Err(err),
        });
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.requests.lock().push(request);
        let scripted = self.script.lock().pop_front().unwrap_or(Scripted {
            delay: Duration::ZERO,
            result: Ok(Value::Null),
        });
        if !scripted.delay.is_zero() {
            tokio::time::sleep(scripted.delay).await;
        }
        scripted.result.map(|data| HttpResponse { data, status: 200 })
    }
}
