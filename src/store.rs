//! The shared, synchronously updated state tree.
//!
//! Every dispatch runs all slice reducers against the current tree in one
//! pass under the store lock, then swaps the tree in a single step. Listeners
//! run after the swap with the lock released, so they may read or dispatch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::{Mutex, MutexGuard, RwLock};
use serde_json::Value;

use crate::action::Action;
use crate::config::StoreConfig;
use crate::error::{RequestError, StorageError, StoreError};
use crate::identity::IdentityRegistry;
use crate::meta::{restore_action, Meta, MetaSlice, MetaSlot, MetaStash, MetaState, Metas, META_SLICE};
use crate::persist::{FileStorage, PersistStatus, Persistor, Storage};
use crate::reducer::{ErasedSlice, StateTree};
use crate::throttle::ThrottleCache;

pub type ListenerId = u64;

type Listener = Arc<dyn Fn(&Action, &StateTree) + Send + Sync>;

/// Called with the action name and error when a request with
/// `show_error` enabled fails.
pub type ErrorHook = Arc<dyn Fn(&str, &RequestError) + Send + Sync>;

struct Core {
    slices: Vec<Arc<dyn ErasedSlice>>,
    tree: StateTree,
}

struct Shared {
    config: StoreConfig,
    identity: IdentityRegistry,
    core: Mutex<Core>,
    /// Thread currently running reducers, to reject dispatch from inside one.
    reducing: Mutex<Option<ThreadId>>,
    listeners: RwLock<Vec<(ListenerId, Listener)>>,
    next_listener: AtomicU64,
    throttle: Mutex<ThrottleCache>,
    metas: MetaStash,
    persist: Persistor,
    error_hook: RwLock<Option<ErrorHook>>,
}

/// Handle to a store. Clones share the same tree.
#[derive(Clone)]
pub struct Store {
    shared: Arc<Shared>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl Store {
    pub fn new(config: StoreConfig) -> Self {
        let identity = IdentityRegistry::new(config.naming);
        Self {
            shared: Arc::new(Shared {
                config,
                identity,
                core: Mutex::new(Core {
                    slices: Vec::new(),
                    tree: StateTree::default(),
                }),
                reducing: Mutex::new(None),
                listeners: RwLock::new(Vec::new()),
                next_listener: AtomicU64::new(1),
                throttle: Mutex::new(ThrottleCache::default()),
                metas: MetaStash::default(),
                persist: Persistor::default(),
                error_hook: RwLock::new(None),
            }),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.shared.config
    }

    pub fn identity(&self) -> &IdentityRegistry {
        &self.shared.identity
    }

    /// Current snapshot of the state tree.
    pub fn state(&self) -> StateTree {
        self.shared.core.lock().tree.clone()
    }

    /// Read one slice.
    pub fn slice<S: Send + Sync + 'static>(&self, name: &str) -> Result<Arc<S>, StoreError> {
        self.state().get::<S>(name)
    }

    pub fn slice_names(&self) -> Vec<String> {
        self.shared
            .core
            .lock()
            .slices
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    /// Add a slice to the tree.
    ///
    /// Re-registering a name swaps in the new reducer and keeps the current
    /// value when its type still matches.
    pub(crate) fn register(&self, slice: Arc<dyn ErasedSlice>) {
        let name = slice.name().to_string();
        let seed = self
            .shared
            .persist
            .on_register(&name)
            .and_then(|raw| slice.deserialize(raw));

        let mut core = self.shared.core.lock();
        let mut map = core.tree.to_map();
        match core.slices.iter().position(|s| s.name() == name) {
            Some(index) => {
                if Arc::ptr_eq(&core.slices[index], &slice) {
                    return;
                }
                let keep = map.get(&name).map(|v| slice.holds(v)).unwrap_or(false);
                if !keep {
                    map.insert(name.clone(), seed.unwrap_or_else(|| slice.initial()));
                }
                core.slices[index] = slice;
                tracing::debug!(slice = %name, kept_state = keep, "Slice reducer replaced");
            }
            None => {
                map.insert(name.clone(), seed.unwrap_or_else(|| slice.initial()));
                core.slices.push(slice);
                tracing::debug!(slice = %name, "Slice registered");
            }
        }
        core.tree = StateTree::from_map(map);
    }

    /// Dispatch an action through every slice.
    ///
    /// Errors are usage errors: the tree is left untouched and nothing is
    /// notified.
    pub fn dispatch(&self, action: Action) -> Result<(), StoreError> {
        let me = thread::current().id();
        if *self.shared.reducing.lock() == Some(me) {
            return Err(StoreError::DispatchInReducer {
                event: action.kind.clone(),
            });
        }

        let (tree, changed) = {
            let mut core = self.shared.core.lock();
            if let Some(model) = &action.model {
                if !core.tree.contains(model) {
                    return Err(StoreError::SliceNotRegistered {
                        slice: model.clone(),
                    });
                }
            }

            *self.shared.reducing.lock() = Some(me);
            let _reducing = scopeguard::guard((), |_| {
                *self.shared.reducing.lock() = None;
            });

            let mut next: Option<HashMap<_, _>> = None;
            for slice in &core.slices {
                let Some(current) = core.tree.raw(slice.name()) else {
                    continue;
                };
                if let Some(value) = slice.reduce(current, &action)? {
                    next.get_or_insert_with(|| core.tree.to_map())
                        .insert(slice.name().to_string(), value);
                }
            }

            let changed = next.is_some();
            if let Some(map) = next {
                core.tree = StateTree::from_map(map);
            }
            (core.tree.clone(), changed)
        };

        self.shared.metas.observe(&action);
        tracing::trace!(action = %action.kind, changed, "Dispatched");

        let listeners: Vec<Listener> = self
            .shared
            .listeners
            .read()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(&action, &tree);
        }

        if changed {
            self.shared.persist.on_change(self);
        }
        Ok(())
    }

    /// Listen to every dispatch.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Action, &StateTree) + Send + Sync + 'static,
    {
        let id = self.shared.next_listener.fetch_add(1, Ordering::Relaxed);
        self.shared.listeners.write().push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.shared.listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Select a projection of one slice and get called when it changes.
    ///
    /// The callback does not fire for the initial value.
    pub fn watch<S, T, P, C>(&self, slice: &str, project: P, on_change: C) -> ListenerId
    where
        S: Send + Sync + 'static,
        T: Clone + PartialEq + Send + 'static,
        P: Fn(&S) -> T + Send + Sync + 'static,
        C: Fn(&T) + Send + Sync + 'static,
    {
        let name = slice.to_string();
        let initial = self.slice::<S>(&name).ok().map(|s| project(&s));
        let last = Mutex::new(initial);
        self.subscribe(move |_, tree| {
            let Ok(state) = tree.get::<S>(&name) else {
                return;
            };
            let next = project(&state);
            {
                let mut last = last.lock();
                if last.as_ref() == Some(&next) {
                    return;
                }
                *last = Some(next.clone());
            }
            on_change(&next);
        })
    }

    pub fn set_error_hook<F>(&self, hook: F)
    where
        F: Fn(&str, &RequestError) + Send + Sync + 'static,
    {
        *self.shared.error_hook.write() = Some(Arc::new(hook));
    }

    pub(crate) fn report_error(&self, action: &str, err: &RequestError) {
        let hook = self.shared.error_hook.read().clone();
        if let Some(hook) = hook {
            hook(action, err);
        }
    }

    pub(crate) fn throttle(&self) -> MutexGuard<'_, ThrottleCache> {
        self.shared.throttle.lock()
    }

    /// Drop every cached response of one action.
    pub fn clear_throttle(&self, success_type: &str) {
        self.throttle().clear(success_type);
    }

    fn ensure_meta_slice(&self) {
        if !self.state().contains(META_SLICE) {
            self.register(Arc::new(MetaSlice));
        }
    }

    /// Meta slot of an action, replaying the stash on first read.
    fn meta_slot(&self, action: &str) -> Option<MetaSlot> {
        self.ensure_meta_slice();
        if let Ok(metas) = self.slice::<MetaState>(META_SLICE) {
            if let Some(slot) = metas.get(action) {
                return Some(slot.clone());
            }
        }
        let slot = self.shared.metas.take_unused(action)?;
        if let Err(err) = self.dispatch(restore_action(action, slot.clone())) {
            tracing::warn!(action = %action, error = %err, "Meta restore failed");
        }
        Some(slot)
    }

    /// Meta of a non-keyed action. Unknown actions read as the default meta.
    pub fn meta(&self, action: &str) -> Meta {
        match self.meta_slot(action) {
            Some(MetaSlot::Single(meta)) => meta,
            _ => Meta::default(),
        }
    }

    /// Metas of a keyed action.
    pub fn metas(&self, action: &str) -> Metas {
        match self.meta_slot(action) {
            Some(MetaSlot::Keyed(metas)) => metas,
            _ => Metas::default(),
        }
    }

    pub(crate) fn persistor(&self) -> &Persistor {
        &self.shared.persist
    }

    /// Start loading persisted state.
    ///
    /// Must be called from within a Tokio runtime. Calling it again switches
    /// to the new settings; a load still running for the old ones is dropped.
    pub fn configure_persist(
        &self,
        settings: crate::config::PersistSettings,
        storage: Arc<dyn Storage>,
    ) -> Result<(), StorageError> {
        self.shared.persist.configure(self, settings, storage)
    }

    /// Configure persistence from `StoreConfig::persist` with file storage.
    /// No-op when the config has no persist section.
    pub fn persist_from_config(&self) -> Result<(), StorageError> {
        let Some(settings) = self.shared.config.persist.clone() else {
            return Ok(());
        };
        let storage = Arc::new(FileStorage::new(settings.storage_dir()));
        self.configure_persist(settings, storage)
    }

    pub fn persist_status(&self) -> PersistStatus {
        self.shared.persist.status()
    }

    /// Wait until persisted state has been loaded and rehydrated.
    pub async fn persist_ready(&self) {
        self.shared.persist.wait_ready().await
    }

    /// Write allow-listed slices now, skipping the debounce.
    pub async fn flush_persist(&self) {
        self.shared.persist.write_latest(self, true).await
    }

    /// Persisted form of the named slices that are registered.
    pub(crate) fn serialize_slices(&self, names: &[&str]) -> HashMap<String, Value> {
        let core = self.shared.core.lock();
        let mut out = HashMap::new();
        for slice in &core.slices {
            if !names.contains(&slice.name()) {
                continue;
            }
            let Some(value) = core.tree.raw(slice.name()) else {
                continue;
            };
            match slice.serialize(value) {
                Ok(serialized) => {
                    out.insert(slice.name().to_string(), serialized);
                }
                Err(err) => tracing::warn!(slice = %slice.name(), error = %err, "Skipping slice"),
            }
        }
        out
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("tree", &self.state())
            .field("persist", &self.persist_status())
            .finish()
    }
}
