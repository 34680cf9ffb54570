//! Meta tracker: per-action status and loading flags.
//!
//! Metas live in their own slice, registered on first read. Lifecycle events
//! fired before that are kept in an in-memory stash; the first read that
//! finds the slice without an entry replays the stash once through a restore
//! action.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::action::{Action, Phase};
use crate::error::StoreError;
use crate::reducer::{ErasedSlice, SliceValue};

/// Name of the meta slice in the state tree.
pub const META_SLICE: &str = "__metas__";

/// Action type used to replay stashed metas.
pub const META_RESTORE: &str = "@@reslice/meta-restore";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetaStatus {
    #[default]
    Idle,
    Pending,
    Succeeded,
    Failed,
}

/// Status record of one action (or one key of a keyed action).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    pub action_type: String,
    pub loading: bool,
    pub status: MetaStatus,
    pub message: Option<String>,
    pub http_status: Option<u16>,
    pub business_code: Option<String>,
}

impl Meta {
    fn from_action(action: &Action) -> Option<Self> {
        let (loading, status) = match action.phase {
            Phase::Prepare => (true, MetaStatus::Pending),
            Phase::Success => (false, MetaStatus::Succeeded),
            Phase::Fail => (false, MetaStatus::Failed),
            Phase::System => return None,
        };
        let failed = action.phase == Phase::Fail;
        Some(Self {
            action_type: action.kind.clone(),
            loading,
            status,
            message: failed.then(|| action.message.clone()).flatten(),
            http_status: failed.then_some(action.http_status).flatten(),
            business_code: failed.then(|| action.business_code.clone()).flatten(),
        })
    }

    pub fn is_pending(&self) -> bool {
        self.status == MetaStatus::Pending
    }

    pub fn is_failed(&self) -> bool {
        self.status == MetaStatus::Failed
    }
}

/// Metas of a keyed action. Unknown keys read as the default meta.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metas(BTreeMap<String, Meta>);

impl Metas {
    pub fn pick(&self, key: &str) -> Meta {
        self.0.get(key).cloned().unwrap_or_default()
    }

    pub fn loading(&self, key: &str) -> bool {
        self.0.get(key).map(|m| m.loading).unwrap_or(false)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetaSlot {
    Single(Meta),
    Keyed(Metas),
}

impl MetaSlot {
    fn apply(slot: Option<&MetaSlot>, key: Option<&str>, meta: Meta) -> MetaSlot {
        match key {
            None => MetaSlot::Single(meta),
            Some(key) => {
                let mut metas = match slot {
                    Some(MetaSlot::Keyed(metas)) => metas.clone(),
                    _ => Metas::default(),
                };
                metas.0.insert(key.to_string(), meta);
                MetaSlot::Keyed(metas)
            }
        }
    }

    /// Merge two slots; `other` wins per key.
    fn merge(self, other: MetaSlot) -> MetaSlot {
        match (self, other) {
            (MetaSlot::Keyed(mut mine), MetaSlot::Keyed(theirs)) => {
                mine.0.extend(theirs.0);
                MetaSlot::Keyed(mine)
            }
            (_, other) => other,
        }
    }
}

/// State of the meta slice: action name -> slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaState {
    slots: BTreeMap<String, MetaSlot>,
}

impl MetaState {
    pub fn get(&self, action: &str) -> Option<&MetaSlot> {
        self.slots.get(action)
    }

    fn record(&mut self, action: &str, key: Option<&str>, meta: Meta) {
        let slot = MetaSlot::apply(self.slots.get(action), key, meta);
        self.slots.insert(action.to_string(), slot);
    }
}

/// Payload of a [`META_RESTORE`] action.
#[derive(Debug, Clone)]
pub(crate) struct MetaRestore {
    pub action: String,
    pub slot: MetaSlot,
}

/// The meta slice reducer.
pub(crate) struct MetaSlice;

impl ErasedSlice for MetaSlice {
    fn name(&self) -> &str {
        META_SLICE
    }

    fn initial(&self) -> SliceValue {
        Arc::new(MetaState::default())
    }

    fn holds(&self, value: &SliceValue) -> bool {
        value.is::<MetaState>()
    }

    fn reduce(
        &self,
        current: &SliceValue,
        action: &Action,
    ) -> Result<Option<SliceValue>, StoreError> {
        let current = current
            .downcast_ref::<MetaState>()
            .ok_or_else(|| StoreError::SliceType {
                slice: META_SLICE.to_string(),
            })?;

        if action.kind == META_RESTORE {
            let Some(restore) = action.payload::<MetaRestore>() else {
                return Ok(None);
            };
            let mut next = current.clone();
            let slot = match next.slots.remove(&restore.action) {
                Some(existing) => restore.slot.clone().merge(existing),
                None => restore.slot.clone(),
            };
            next.slots.insert(restore.action.clone(), slot);
            return Ok(Some(Arc::new(next)));
        }

        let Some(name) = action.meta_action.as_deref() else {
            return Ok(None);
        };
        let Some(meta) = Meta::from_action(action) else {
            return Ok(None);
        };
        let mut next = current.clone();
        next.record(name, action.meta_key.as_deref(), meta);
        Ok(Some(Arc::new(next)))
    }

    fn serialize(&self, value: &SliceValue) -> Result<Value, StoreError> {
        let state = value
            .downcast_ref::<MetaState>()
            .ok_or_else(|| StoreError::SliceType {
                slice: META_SLICE.to_string(),
            })?;
        serde_json::to_value(state).map_err(|e| StoreError::Serialize {
            slice: META_SLICE.to_string(),
            message: e.to_string(),
        })
    }

    fn deserialize(&self, raw: Value) -> Option<SliceValue> {
        serde_json::from_value::<MetaState>(raw)
            .ok()
            .map(|state| Arc::new(state) as SliceValue)
    }
}

struct StashEntry {
    slot: MetaSlot,
    used: bool,
}

/// In-memory stash of meta events, replayed once into the meta slice.
#[derive(Default)]
pub(crate) struct MetaStash {
    entries: Mutex<HashMap<String, StashEntry>>,
}

impl MetaStash {
    /// Track a dispatched action.
    pub(crate) fn observe(&self, action: &Action) {
        let Some(name) = action.meta_action.as_deref() else {
            return;
        };
        let Some(meta) = Meta::from_action(action) else {
            return;
        };
        let mut entries = self.entries.lock();
        let key = action.meta_key.as_deref();
        match entries.get_mut(name) {
            Some(entry) => entry.slot = MetaSlot::apply(Some(&entry.slot), key, meta),
            None => {
                entries.insert(
                    name.to_string(),
                    StashEntry {
                        slot: MetaSlot::apply(None, key, meta),
                        used: false,
                    },
                );
            }
        }
    }

    /// Take the stash for `action` if it has not been restored yet.
    pub(crate) fn take_unused(&self, action: &str) -> Option<MetaSlot> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(action)?;
        if entry.used {
            return None;
        }
        entry.used = true;
        Some(entry.slot.clone())
    }
}

pub(crate) fn restore_action(action: &str, slot: MetaSlot) -> Action {
    Action::new(
        META_RESTORE,
        Phase::System,
        MetaRestore {
            action: action.to_string(),
            slot,
        },
    )
}
