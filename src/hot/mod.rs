//! The hot facade: per-instance registration state.
//!
//! Module bodies reach this through `meta.hot` and declare how they relate
//! to updates: `accept` (bare or per-dependency), `decline`, `dispose`,
//! `prune`, `invalidate`. The update algorithm never runs user callbacks
//! directly; it goes through the inspectors and runners in
//! [`predicates`].

pub mod predicates;

use parking_lot::Mutex;
use std::sync::Arc;

use crate::module::Value;

/// Callback for an accepted update; receives the new namespace of the
/// updated module (for self-accept, the module's own new namespace).
pub type AcceptCallback = Arc<dyn Fn(Value) -> anyhow::Result<()> + Send + Sync>;

/// Callback run before an instance is replaced; fills the carry-over data
/// object handed to the successor.
pub type DisposeCallback = Arc<dyn Fn(&mut Value) -> anyhow::Result<()> + Send + Sync>;

/// Callback run when a module becomes unreachable.
pub type PruneCallback = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

/// One `accept` registration. `deps: None` is a self-accept.
#[derive(Clone)]
pub(crate) struct AcceptEntry {
    pub(crate) deps: Option<Vec<String>>,
    pub(crate) callback: Option<AcceptCallback>,
}

#[derive(Default)]
struct HotState {
    accepts: Vec<AcceptEntry>,
    declined: bool,
    invalidated: bool,
    dispose: Vec<DisposeCallback>,
    prune: Vec<PruneCallback>,
    /// Carry-over data seeded from the predecessor's dispose callbacks.
    data: Option<Value>,
}

/// Cloneable handle to one instance's hot registration state.
#[derive(Clone)]
pub struct Hot {
    url: Arc<str>,
    state: Arc<Mutex<HotState>>,
}

impl Hot {
    pub(crate) fn new(url: &str) -> Self {
        Self {
            url: Arc::from(url),
            state: Arc::new(Mutex::new(HotState::default())),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Self-accept: this module handles updates by re-evaluating itself,
    /// terminating propagation toward its importers.
    pub fn accept(&self) {
        self.state.lock().accepts.push(AcceptEntry {
            deps: None,
            callback: None,
        });
    }

    /// Self-accept with a callback invoked with the new namespace after
    /// re-evaluation.
    pub fn accept_with(
        &self,
        callback: impl Fn(Value) -> anyhow::Result<()> + Send + Sync + 'static,
    ) {
        self.state.lock().accepts.push(AcceptEntry {
            deps: None,
            callback: Some(Arc::new(callback)),
        });
    }

    /// Accept updates of specific dependencies without re-evaluating this
    /// module.
    pub fn accept_of(&self, deps: impl IntoIterator<Item = impl Into<String>>) {
        self.state.lock().accepts.push(AcceptEntry {
            deps: Some(deps.into_iter().map(Into::into).collect()),
            callback: None,
        });
    }

    /// Accept updates of specific dependencies, running `callback` with
    /// each updated dependency's new namespace.
    pub fn accept_of_with(
        &self,
        deps: impl IntoIterator<Item = impl Into<String>>,
        callback: impl Fn(Value) -> anyhow::Result<()> + Send + Sync + 'static,
    ) {
        self.state.lock().accepts.push(AcceptEntry {
            deps: Some(deps.into_iter().map(Into::into).collect()),
            callback: Some(Arc::new(callback)),
        });
    }

    /// Forbid hot replacement of this module.
    pub fn decline(&self) {
        self.state.lock().declined = true;
    }

    /// Mark this module as needing re-evaluation on the next update.
    pub fn invalidate(&self) {
        self.state.lock().invalidated = true;
    }

    /// Register a callback run immediately before this instance is
    /// replaced.
    pub fn dispose(
        &self,
        callback: impl Fn(&mut Value) -> anyhow::Result<()> + Send + Sync + 'static,
    ) {
        self.state.lock().dispose.push(Arc::new(callback));
    }

    /// Register a callback run when this module becomes unreachable.
    pub fn prune(&self, callback: impl Fn() -> anyhow::Result<()> + Send + Sync + 'static) {
        self.state.lock().prune.push(Arc::new(callback));
    }

    /// Carry-over data left by the predecessor's dispose callbacks.
    pub fn data(&self) -> Option<Value> {
        self.state.lock().data.clone()
    }

    // ------------------------------------------------------------------------
    // Internal accessors for the predicates
    // ------------------------------------------------------------------------

    pub(crate) fn seed(&self, data: Option<Value>) {
        self.state.lock().data = data;
    }

    pub(crate) fn has_self_accept(&self) -> bool {
        self.state.lock().accepts.iter().any(|e| e.deps.is_none())
    }

    pub(crate) fn self_accept_callbacks(&self) -> Vec<AcceptCallback> {
        self.state
            .lock()
            .accepts
            .iter()
            .filter(|e| e.deps.is_none())
            .filter_map(|e| e.callback.clone())
            .collect()
    }

    pub(crate) fn dependency_accepts(&self) -> Vec<AcceptEntry> {
        self.state
            .lock()
            .accepts
            .iter()
            .filter(|e| e.deps.is_some())
            .cloned()
            .collect()
    }

    pub(crate) fn is_declined(&self) -> bool {
        self.state.lock().declined
    }

    pub(crate) fn is_invalidated(&self) -> bool {
        self.state.lock().invalidated
    }

    pub(crate) fn dispose_callbacks(&self) -> Vec<DisposeCallback> {
        self.state.lock().dispose.clone()
    }

    pub(crate) fn prune_callbacks(&self) -> Vec<PruneCallback> {
        self.state.lock().prune.clone()
    }
}

// ============================================================================
// Tests
// ============================================================================
