//! Error types for the store, request lifecycle and storage.
//!
//! Usage errors (`StoreError`) are returned synchronously from dispatch and
//! reads. Transport failures end up in `RequestError` and the meta slice.
//! Storage problems are recovered by the persistence layer and only logged.

use std::path::PathBuf;

use thiserror::Error;

/// Programmer-usage errors raised by dispatch and reads.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Slice '{slice}' is not registered")]
    SliceNotRegistered { slice: String },

    #[error("Slice '{slice}' is already registered; its cases can no longer change")]
    SliceSealed { slice: String },

    #[error("Cannot dispatch '{event}' from inside a reducer")]
    DispatchInReducer { event: String },

    #[error("Slice '{slice}' has a null initial state")]
    NullInitialState { slice: String },

    #[error("Slice '{slice}' does not hold a value of the requested type")]
    SliceType { slice: String },

    #[error("Transition for '{event}' on primitive slice '{slice}': state must be returned")]
    StateMustBeReturned { slice: String, event: String },

    #[error("Action '{event}' carries a payload of an unexpected type")]
    PayloadType { event: String },

    #[error("Failed to serialize slice '{slice}': {message}")]
    Serialize { slice: String, message: String },
}

/// Failure reported by a transport collaborator.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
    pub http_status: Option<u16>,
    pub business_code: Option<String>,
    /// Raw error body, when the transport received one.
    pub response: Option<serde_json::Value>,
    /// Pure abort: the fail branch is not dispatched.
    pub aborted: bool,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            http_status: None,
            business_code: None,
            response: None,
            aborted: false,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn with_business_code(mut self, code: impl Into<String>) -> Self {
        self.business_code = Some(code.into());
        self
    }

    pub fn with_response(mut self, response: serde_json::Value) -> Self {
        self.response = Some(response);
        self
    }

    /// A pure abort, e.g. a transport dropping a request it was told to.
    pub fn aborted(message: impl Into<String>) -> Self {
        Self {
            aborted: true,
            ..Self::new(message)
        }
    }
}

/// Errors surfaced through a request or compose promise.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RequestError {
    #[error("Request failed: {0}")]
    Transport(#[from] TransportError),

    #[error("Request cancelled")]
    Cancelled,

    /// A later invocation of the same action already succeeded; this
    /// failure was not applied to the state.
    #[error("Request superseded by a newer success: {0}")]
    Superseded(TransportError),

    #[error("Failed to decode response for '{action}': {message}")]
    Decode { action: String, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Failure of a composed async function.
    #[error("{0}")]
    Failed(String),

    #[error("Request task dropped before completion")]
    Dropped,
}

impl RequestError {
    /// Message recorded in the meta slice for this failure.
    pub fn message(&self) -> String {
        match self {
            RequestError::Transport(err) | RequestError::Superseded(err) => err.message.clone(),
            other => other.to_string(),
        }
    }

    pub fn http_status(&self) -> Option<u16> {
        match self {
            RequestError::Transport(err) | RequestError::Superseded(err) => err.http_status,
            _ => None,
        }
    }

    pub fn business_code(&self) -> Option<&str> {
        match self {
            RequestError::Transport(err) | RequestError::Superseded(err) => {
                err.business_code.as_deref()
            }
            _ => None,
        }
    }
}

/// Errors from a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage I/O failed for '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Storage task failed: {0}")]
    Task(String),
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {source}")]
    ParseError {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Config validation failed: {message}")]
    ValidationError { message: String },
}
