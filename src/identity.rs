//! Model and action naming.
//!
//! Model names are leased: constructing the same `(class, alias)` while an
//! earlier instance is alive yields `Class.alias-1`, `Class.alias-2`, ... and
//! dropping an instance returns its suffix to the pool.
//!
//! Action names are bound lazily on first use. In development mode the
//! explicit key is used (`Owner.key`); in production mode keys are replaced by
//! a monotonic counter (`Owner.#3`) so names stay stable under minified keys.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use crate::config::NamingMode;

#[derive(Debug, Default)]
struct IdentityInner {
    /// base name -> suffixes currently leased
    live: HashMap<String, BTreeSet<u32>>,
    action_counter: u64,
}

/// Names models and actions for one store.
#[derive(Clone)]
pub struct IdentityRegistry {
    inner: Arc<Mutex<IdentityInner>>,
    mode: NamingMode,
}

impl IdentityRegistry {
    pub fn new(mode: NamingMode) -> Self {
        Self {
            inner: Arc::new(Mutex::new(IdentityInner::default())),
            mode,
        }
    }

    pub fn mode(&self) -> NamingMode {
        self.mode
    }

    /// Lease a collision-free name for a model instance.
    pub fn name_model(&self, class: &str, alias: Option<&str>) -> ModelName {
        let base = match alias {
            Some(alias) if !alias.is_empty() => format!("{}.{}", class, alias),
            _ => class.to_string(),
        };

        let mut inner = self.inner.lock();
        let leased = inner.live.entry(base.clone()).or_default();
        let suffix = (0u32..)
            .find(|n| !leased.contains(n))
            .unwrap_or_default();
        leased.insert(suffix);

        let name = if suffix == 0 {
            base.clone()
        } else {
            format!("{}-{}", base, suffix)
        };
        tracing::trace!(model = %name, "Model name leased");

        ModelName {
            name,
            base,
            suffix,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Compute an action name for `owner`.
    pub fn name_action(&self, owner: &str, key: &str) -> String {
        match self.mode {
            NamingMode::Development => format!("{}.{}", owner, key),
            NamingMode::Production => {
                let mut inner = self.inner.lock();
                inner.action_counter += 1;
                format!("{}.#{}", owner, inner.action_counter)
            }
        }
    }
}

impl fmt::Debug for IdentityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityRegistry")
            .field("mode", &self.mode)
            .finish()
    }
}

/// A leased model name. Releases its suffix on drop.
pub struct ModelName {
    name: String,
    base: String,
    suffix: u32,
    registry: Weak<Mutex<IdentityInner>>,
}

impl ModelName {
    pub fn as_str(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ModelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl fmt::Debug for ModelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ModelName").field(&self.name).finish()
    }
}

impl Drop for ModelName {
    fn drop(&mut self) {
        let Some(inner) = self.registry.upgrade() else {
            return;
        };
        let mut inner = inner.lock();
        if let Some(leased) = inner.live.get_mut(&self.base) {
            leased.remove(&self.suffix);
            if leased.is_empty() {
                inner.live.remove(&self.base);
            }
        }
    }
}

/// An action name bound on first use.
///
/// Concurrent first uses race on the `OnceLock`; only one binding wins and
/// every caller observes it.
pub struct LazyName {
    owner: String,
    key: String,
    bound: OnceLock<String>,
}

impl LazyName {
    pub fn new(owner: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            key: key.into(),
            bound: OnceLock::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Bound name, binding through `registry` if this is the first use.
    pub fn get(&self, registry: &IdentityRegistry) -> &str {
        self.bound
            .get_or_init(|| registry.name_action(&self.owner, &self.key))
    }

    /// Bind an explicit name. Returns false if already bound.
    pub fn set(&self, name: impl Into<String>) -> bool {
        self.bound.set(name.into()).is_ok()
    }

    pub fn is_bound(&self) -> bool {
        self.bound.get().is_some()
    }
}
