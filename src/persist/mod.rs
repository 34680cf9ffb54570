//! Persistence: rehydrate allow-listed slices at startup and write them back,
//! debounced, whenever they change.
//!
//! # Lifecycle
//!
//! ```text
//! Unconfigured ──configure──→ Loading ──blob parsed──→ Ready ⇄ dirty
//! ```
//!
//! Blob format: every allow-listed alias maps to the JSON *string* of its
//! slice value, next to `"__persist": {"version": N}`. A blob that fails to
//! parse or carries another version is discarded and replaced.

mod storage;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::runtime::Handle;
use tokio::sync::Notify;

pub use storage::{FileStorage, MemoryStorage, Storage};

use crate::action::{Action, Phase};
use crate::config::PersistSettings;
use crate::error::StorageError;
use crate::store::Store;

/// Reserved blob field holding the version stamp.
pub const PERSIST_FIELD: &str = "__persist";

/// Action type carrying persisted values into the slices.
pub const REHYDRATE: &str = "@@reslice/rehydrate";

/// Payload of a [`REHYDRATE`] action: slice name -> persisted value.
#[derive(Debug, Clone, Default)]
pub struct Rehydrate {
    pub values: HashMap<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistStatus {
    Unconfigured,
    Loading,
    Ready,
}

struct PersistConfig {
    settings: PersistSettings,
    storage: Arc<dyn Storage>,
    runtime: Handle,
}

struct ReadyState {
    config: Arc<PersistConfig>,
    /// Slice name -> persisted value, for slices registered after Ready.
    persisted: HashMap<String, Value>,
    /// Alias -> serialized value of the last write. `None` until the
    /// rehydrate pass has settled.
    last: Option<BTreeMap<String, String>>,
    scheduled: bool,
}

enum PersistPhase {
    Unconfigured,
    Loading {
        config: Arc<PersistConfig>,
        queued: Vec<String>,
    },
    Ready(ReadyState),
}

/// Outcome of reading the stored blob.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct Decoded {
    /// Alias -> parsed slice value.
    pub values: HashMap<String, Value>,
    /// The stored blob was unusable and must be replaced.
    pub reset: bool,
}

/// Parse a stored blob against the active settings.
pub(crate) fn decode_blob(raw: &str, settings: &PersistSettings) -> Decoded {
    let reset = Decoded {
        values: HashMap::new(),
        reset: true,
    };

    let blob: Map<String, Value> = match serde_json::from_str(raw) {
        Ok(Value::Object(blob)) => blob,
        Ok(_) => {
            tracing::warn!(key = %settings.key, "Persisted blob is not an object, resetting");
            return reset;
        }
        Err(err) => {
            tracing::warn!(key = %settings.key, error = %err, "Persisted blob is corrupt, resetting");
            return reset;
        }
    };

    let version = blob
        .get(PERSIST_FIELD)
        .and_then(|p| p.get("version"))
        .and_then(Value::as_u64);
    if version != Some(u64::from(settings.version)) {
        tracing::warn!(
            key = %settings.key,
            stored = ?version,
            expected = settings.version,
            "Persisted blob version mismatch, resetting"
        );
        return reset;
    }

    let mut values = HashMap::new();
    for alias in settings.allowlist.keys() {
        let Some(raw) = blob.get(alias) else {
            continue;
        };
        let parsed = match raw {
            Value::String(s) => serde_json::from_str::<Value>(s),
            _ => {
                tracing::warn!(key = %settings.key, alias = %alias, "Persisted entry is not a string, resetting");
                return reset;
            }
        };
        match parsed {
            Ok(value) => {
                values.insert(alias.clone(), value);
            }
            Err(err) => {
                tracing::warn!(key = %settings.key, alias = %alias, error = %err, "Persisted entry is corrupt, resetting");
                return reset;
            }
        }
    }

    Decoded {
        values,
        reset: false,
    }
}

/// Build the blob string for `serialized` (alias -> JSON string).
pub(crate) fn encode_blob(serialized: &BTreeMap<String, String>, version: u32) -> String {
    let mut blob = Map::new();
    for (alias, value) in serialized {
        blob.insert(alias.clone(), Value::String(value.clone()));
    }
    blob.insert(PERSIST_FIELD.to_string(), json!({ "version": version }));
    Value::Object(blob).to_string()
}

/// Drives the persistence lifecycle for one store.
pub(crate) struct Persistor {
    phase: Mutex<PersistPhase>,
    ready: Notify,
}

impl Default for Persistor {
    fn default() -> Self {
        Self {
            phase: Mutex::new(PersistPhase::Unconfigured),
            ready: Notify::new(),
        }
    }
}

impl Persistor {
    pub(crate) fn status(&self) -> PersistStatus {
        match &*self.phase.lock() {
            PersistPhase::Unconfigured => PersistStatus::Unconfigured,
            PersistPhase::Loading { .. } => PersistStatus::Loading,
            PersistPhase::Ready(_) => PersistStatus::Ready,
        }
    }

    /// Start (or restart) loading with new settings.
    pub(crate) fn configure(
        &self,
        store: &Store,
        settings: PersistSettings,
        storage: Arc<dyn Storage>,
    ) -> Result<(), StorageError> {
        let runtime = Handle::try_current()
            .map_err(|_| StorageError::Task("persistence requires a Tokio runtime".to_string()))?;
        let queued: Vec<String> = store
            .slice_names()
            .into_iter()
            .filter(|name| settings.allowlist.values().any(|s| s == name))
            .collect();
        let config = Arc::new(PersistConfig {
            settings,
            storage,
            runtime,
        });

        *self.phase.lock() = PersistPhase::Loading {
            config: Arc::clone(&config),
            queued,
        };
        tracing::debug!(key = %config.settings.key, "Loading persisted state");

        let store = store.clone();
        let runtime = config.runtime.clone();
        runtime.spawn(async move {
            let decoded = match config.storage.get_item(&config.settings.key).await {
                Ok(Some(raw)) => decode_blob(&raw, &config.settings),
                Ok(None) => Decoded::default(),
                Err(err) => {
                    tracing::warn!(key = %config.settings.key, error = %err, "Failed to read persisted state");
                    Decoded::default()
                }
            };
            store.persistor().finish_loading(&store, config, decoded);
        });
        Ok(())
    }

    fn finish_loading(&self, store: &Store, config: Arc<PersistConfig>, decoded: Decoded) {
        let values = {
            let mut phase = self.phase.lock();
            let queued = match &*phase {
                PersistPhase::Loading {
                    config: active,
                    queued,
                } if Arc::ptr_eq(active, &config) => queued.clone(),
                _ => {
                    tracing::debug!(key = %config.settings.key, "Dropping stale persistence load");
                    return;
                }
            };

            let persisted: HashMap<String, Value> = decoded
                .values
                .into_iter()
                .filter_map(|(alias, value)| {
                    config
                        .settings
                        .allowlist
                        .get(&alias)
                        .map(|slice| (slice.clone(), value))
                })
                .collect();
            let values: HashMap<String, Value> = queued
                .iter()
                .filter_map(|slice| persisted.get(slice).map(|v| (slice.clone(), v.clone())))
                .collect();

            *phase = PersistPhase::Ready(ReadyState {
                config: Arc::clone(&config),
                persisted,
                last: None,
                scheduled: false,
            });
            values
        };

        if !values.is_empty() {
            tracing::info!(
                key = %config.settings.key,
                slices = values.len(),
                "Rehydrating persisted slices"
            );
            let action = Action::new(REHYDRATE, Phase::System, Rehydrate { values });
            if let Err(err) = store.dispatch(action) {
                tracing::warn!(error = %err, "Rehydrate dispatch failed");
            }
        }

        {
            let mut phase = self.phase.lock();
            if let PersistPhase::Ready(ready) = &mut *phase {
                if Arc::ptr_eq(&ready.config, &config) {
                    ready.last = Some(serialize_allowlisted(store, &config.settings));
                }
            }
        }

        if decoded.reset {
            let blob = encode_blob(&BTreeMap::new(), config.settings.version);
            let config = Arc::clone(&config);
            config.runtime.clone().spawn(async move { write(&config, blob).await });
        }

        tracing::info!(key = %config.settings.key, "Persistence ready");
        self.ready.notify_waiters();
    }

    /// Called before a slice enters the tree. Returns the persisted value to
    /// seed it with, when one is already known.
    pub(crate) fn on_register(&self, slice: &str) -> Option<Value> {
        let mut phase = self.phase.lock();
        match &mut *phase {
            PersistPhase::Unconfigured => None,
            PersistPhase::Loading { config, queued } => {
                let allowed = config.settings.allowlist.values().any(|s| s == slice);
                if allowed && !queued.iter().any(|q| q == slice) {
                    queued.push(slice.to_string());
                }
                None
            }
            PersistPhase::Ready(ready) => ready.persisted.get(slice).cloned(),
        }
    }

    /// Called after every state change.
    pub(crate) fn on_change(&self, store: &Store) {
        let mut phase = self.phase.lock();
        let PersistPhase::Ready(ready) = &mut *phase else {
            return;
        };
        if ready.scheduled {
            return;
        }
        let Some(last) = &ready.last else {
            return;
        };
        let current = serialize_allowlisted(store, &ready.config.settings);
        if &current == last {
            return;
        }

        ready.scheduled = true;
        let debounce = ready.config.settings.debounce();
        let store = store.clone();
        ready.config.runtime.spawn(async move {
            tokio::time::sleep(debounce).await;
            store.persistor().write_latest(&store, false).await;
        });
    }

    /// Write the current allow-listed state. With `force == false` only a
    /// scheduled write proceeds.
    pub(crate) async fn write_latest(&self, store: &Store, force: bool) {
        let (config, blob) = {
            let mut phase = self.phase.lock();
            let PersistPhase::Ready(ready) = &mut *phase else {
                return;
            };
            if !force && !ready.scheduled {
                return;
            }
            let current = serialize_allowlisted(store, &ready.config.settings);
            let blob = encode_blob(&current, ready.config.settings.version);
            ready.scheduled = false;
            ready.last = Some(current);
            (Arc::clone(&ready.config), blob)
        };
        write(&config, blob).await;
    }

    /// Resolves once the phase is Ready (or immediately when unconfigured).
    pub(crate) async fn wait_ready(&self) {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.status() != PersistStatus::Loading {
                return;
            }
            notified.await;
        }
    }
}

fn serialize_allowlisted(store: &Store, settings: &PersistSettings) -> BTreeMap<String, String> {
    let names: Vec<&str> = settings.allowlist.values().map(String::as_str).collect();
    let serialized = store.serialize_slices(&names);
    settings
        .allowlist
        .iter()
        .filter_map(|(alias, slice)| {
            serialized
                .get(slice)
                .map(|value| (alias.clone(), value.to_string()))
        })
        .collect()
}

async fn write(config: &PersistConfig, blob: String) {
    tracing::debug!(key = %config.settings.key, bytes = blob.len(), "Writing persisted state");
    if let Err(err) = config.storage.set_item(&config.settings.key, blob).await {
        tracing::warn!(key = %config.settings.key, error = %err, "Failed to write persisted state");
    }
}
