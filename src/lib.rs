//! reslice: models, actions and reducers over one shared state tree.
//!
//! A [`Store`] holds the state tree. Each [`Model`] owns one slice of it and
//! builds the actions that change it:
//!
//! - [`DirectAction`]: a synchronous transition
//! - [`RequestAction`]: prepare/success/fail around a [`Transport`] call,
//!   with throttling and meta tracking
//! - [`ComposeAction`]: meta tracking around any async function
//!
//! Allow-listed slices can be persisted through a [`Storage`] backend.

pub mod action;
pub mod config;
pub mod error;
pub mod http;
pub mod identity;
pub mod logging;
pub mod meta;
pub mod model;
pub mod persist;
pub mod reducer;
pub mod store;
pub mod throttle;

pub use action::{
    Action, ActionEvent, BaseAction, CallOptions, CancelHandle, ComposeAction, DirectAction,
    Phase, RequestAction, RequestBuilder, RequestPromise,
};
pub use config::{NamingMode, PersistSettings, StoreConfig};
pub use error::{ConfigError, RequestError, StorageError, StoreError, TransportError};
pub use http::{HttpRequest, HttpResponse, HttpService, Method, Transport};
pub use meta::{Meta, MetaStatus, Metas};
pub use model::Model;
pub use persist::{FileStorage, MemoryStorage, PersistStatus, Storage};
pub use reducer::{Next, SliceState, StateTree, Subscription};
pub use store::{ListenerId, Store};
pub use throttle::ThrottleSpec;
