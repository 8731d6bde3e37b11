//! Reloadable module controllers.
//!
//! One controller exists per URL (interned by the application's acquire
//! map) and owns that URL's lifecycle across reloads. Up to five instance
//! slots express which version of the module is real right now:
//!
//! ```text
//! staging    freshly loaded, awaiting adoption by the next update
//! current    the live instance serving imports
//! pending    during an update: what current will become
//! previous   during an update: what current was
//! temporary  ephemeral clone used only by the pre-commit link test
//! ```
//!
//! `dispatch` performs the initial instantiate → link → evaluate over the
//! whole reachable graph; `request_update` (in `update`) runs the
//! hot-reload algorithm.

mod chain;
mod result;
mod update;

#[cfg(test)]
mod tests;

pub use chain::{ChainNode, InvalidationChain};
pub use result::{DispatchError, FatalError, FatalPhase, UpdateStats, UpdateStatus};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use crate::application::Application;
use crate::module::binding::InstanceSelector;
use crate::module::{
    EvaluationError, InstanceState, LinkError, LoadedModuleRequest, ModuleBody,
    ModuleDeclaration, ModuleFormat, ReloadableModuleInstance, Value,
};
use crate::traverse::{GraphNode, traverse_depth_first, traverse_depth_first_async};

#[derive(Default)]
struct Slots {
    current: Option<Arc<ReloadableModuleInstance>>,
    pending: Option<Arc<ReloadableModuleInstance>>,
    previous: Option<Arc<ReloadableModuleInstance>>,
    staging: Option<Arc<ReloadableModuleInstance>>,
    temporary: Option<Arc<ReloadableModuleInstance>>,
}

/// Per-URL module lifecycle owner.
pub struct ReloadableModuleController {
    weak: Weak<Self>,
    url: String,
    application: Weak<Application>,
    /// Monotonic, incremented per watcher event; cache-busts re-imports.
    version: AtomicU32,
    slots: Mutex<Slots>,
    /// Once set, every further update short-circuits with this record.
    fatal_error: Mutex<Option<Arc<FatalError>>>,
    /// Scratch tag for visit-index based walks.
    visit_index: AtomicU32,
}

impl GraphNode for Arc<ReloadableModuleController> {
    type Id = usize;

    fn id(&self) -> usize {
        Arc::as_ptr(self) as usize
    }
}

impl ReloadableModuleController {
    pub(crate) fn new(url: &str, application: &Arc<Application>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            url: url.to_string(),
            application: Arc::downgrade(application),
            version: AtomicU32::new(0),
            slots: Mutex::new(Slots::default()),
            fatal_error: Mutex::new(None),
            visit_index: AtomicU32::new(0),
        })
    }

    pub(crate) fn arc(&self) -> Arc<Self> {
        self.weak.upgrade().expect("controller is alive while borrowed")
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn version(&self) -> u32 {
        self.version.load(Ordering::SeqCst)
    }

    pub(crate) fn bump_version(&self) -> u32 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn fatal_error(&self) -> Option<Arc<FatalError>> {
        self.fatal_error.lock().clone()
    }

    pub(crate) fn set_fatal_error(&self, error: Arc<FatalError>) {
        let mut slot = self.fatal_error.lock();
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    // ------------------------------------------------------------------------
    // Slots
    // ------------------------------------------------------------------------

    pub(crate) fn current(&self) -> Option<Arc<ReloadableModuleInstance>> {
        self.slots.lock().current.clone()
    }

    pub(crate) fn pending(&self) -> Option<Arc<ReloadableModuleInstance>> {
        self.slots.lock().pending.clone()
    }

    pub(crate) fn previous(&self) -> Option<Arc<ReloadableModuleInstance>> {
        self.slots.lock().previous.clone()
    }

    pub(crate) fn staging(&self) -> Option<Arc<ReloadableModuleInstance>> {
        self.slots.lock().staging.clone()
    }

    pub(crate) fn temporary(&self) -> Option<Arc<ReloadableModuleInstance>> {
        self.slots.lock().temporary.clone()
    }

    pub(crate) fn set_current(&self, instance: Option<Arc<ReloadableModuleInstance>>) {
        self.slots.lock().current = instance;
    }

    pub(crate) fn set_pending(&self, instance: Option<Arc<ReloadableModuleInstance>>) {
        self.slots.lock().pending = instance;
    }

    pub(crate) fn set_previous(&self, instance: Option<Arc<ReloadableModuleInstance>>) {
        self.slots.lock().previous = instance;
    }

    pub(crate) fn set_staging(&self, instance: Option<Arc<ReloadableModuleInstance>>) {
        self.slots.lock().staging = instance;
    }

    pub(crate) fn set_temporary(&self, instance: Option<Arc<ReloadableModuleInstance>>) {
        self.slots.lock().temporary = instance;
    }

    pub(crate) fn take_pending(&self) -> Option<Arc<ReloadableModuleInstance>> {
        self.slots.lock().pending.take()
    }

    pub(crate) fn take_temporary(&self) -> Option<Arc<ReloadableModuleInstance>> {
        self.slots.lock().temporary.take()
    }

    /// Whether the update will replace this module's code: the pending
    /// instance differs from the previous one.
    pub(crate) fn has_new_code(&self) -> bool {
        let slots = self.slots.lock();
        !option_ptr_eq(&slots.previous, &slots.pending)
    }

    /// The live namespace object of this module.
    pub fn module_namespace(&self) -> Result<Value, LinkError> {
        let current = self.current().ok_or_else(|| LinkError::NotLoaded {
            url: self.url.clone(),
        })?;
        current.namespace(&|child| child.current())
    }

    // ------------------------------------------------------------------------
    // Visit index scratch
    // ------------------------------------------------------------------------

    pub(crate) fn visit_index(&self) -> u32 {
        self.visit_index.load(Ordering::Relaxed)
    }

    pub(crate) fn set_visit_index(&self, tag: u32) {
        self.visit_index.store(tag, Ordering::Relaxed);
    }

    /// Simple cycle-cut walk over one view of the graph, collecting every
    /// reachable controller. The caller supplies a freshly acquired tag.
    pub(crate) fn traverse_view(
        &self,
        tag: u32,
        select: InstanceSelector<'_>,
        out: &mut Vec<Arc<Self>>,
    ) {
        if self.visit_index() == tag {
            return;
        }
        self.set_visit_index(tag);
        let this = self.arc();
        out.push(this.clone());
        if let Some(instance) = select(&this) {
            for child in instance.iterate_dependencies() {
                child.traverse_view(tag, select, out);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------------

    /// The transformer contract: every transformed module executes exactly
    /// one `load` call against its URL's controller, placing a fresh
    /// instance in `staging`.
    pub fn load(
        &self,
        body: ModuleBody,
        meta: Option<FxHashMap<String, Value>>,
        uses_dynamic_import: bool,
        format: ModuleFormat,
        import_assertions: FxHashMap<String, String>,
        loaded_modules: Vec<LoadedModuleRequest>,
    ) {
        let declaration = Arc::new(ModuleDeclaration::new(
            body,
            meta,
            uses_dynamic_import,
            format,
            import_assertions,
            loaded_modules,
        ));
        let instance = ReloadableModuleInstance::new(&self.url, declaration);
        self.slots.lock().staging = Some(instance);

        let version = self.version();
        if version > 0
            && let Some(application) = self.application.upgrade()
        {
            application.loader().evict(&self.url, version - 1);
        }
        crate::debug!("hot"; "loaded `{}` version {}", self.url, version);
    }

    // ------------------------------------------------------------------------
    // Dispatch (initial load)
    // ------------------------------------------------------------------------

    /// Initial instantiate → link → evaluate of the whole graph reachable
    /// from this controller's staging instance.
    pub(crate) async fn dispatch(
        &self,
        application: &Arc<Application>,
    ) -> Result<(), DispatchError> {
        // Pass 1: adopt staging into current and link, SCC by SCC.
        let mut adopted: Vec<Arc<Self>> = Vec::new();
        let link_result: Result<(), LinkError> = traverse_depth_first(
            self.arc(),
            |controller: &Arc<Self>| {
                let fresh = {
                    let mut slots = controller.slots.lock();
                    if slots.current.is_none() {
                        slots.current = slots.staging.clone();
                        slots.current.clone()
                    } else {
                        None
                    }
                };
                if let Some(instance) = fresh {
                    instance.instantiate(None);
                    adopted.push(controller.clone());
                }
                controller
                    .current()
                    .map(|instance| instance.iterate_dependencies())
                    .unwrap_or_default()
            },
            |component, _forward: Vec<()>| {
                let mut linked: Vec<Arc<ReloadableModuleInstance>> = Vec::new();
                for controller in component {
                    let Some(instance) = controller.current() else {
                        return Err(LinkError::NotLoaded {
                            url: controller.url().to_string(),
                        });
                    };
                    if instance.state() != InstanceState::Unlinked {
                        continue;
                    }
                    match instance.link(&|child| child.current()) {
                        Ok(()) => linked.push(instance),
                        Err(error) => {
                            for instance in linked {
                                instance.unlink();
                            }
                            return Err(error);
                        }
                    }
                }
                Ok(())
            },
            |_| {},
        );
        if let Err(error) = link_result {
            // Unwind everything adopted this pass so a retry starts clean.
            for controller in adopted {
                if let Some(current) = controller.current()
                    && current.unlink()
                {
                    controller.set_current(None);
                }
            }
            return Err(DispatchError::Link(error));
        }

        // Pass 2: evaluate, children first, sequential within an SCC.
        let evaluation: Result<(), EvaluationError> = traverse_depth_first_async(
            self.arc(),
            |controller: &Arc<Self>| {
                controller
                    .current()
                    .map(|instance| instance.iterate_dependencies())
                    .unwrap_or_default()
            },
            |component: Vec<Arc<Self>>, _forward: Vec<()>| {
                let application = application.clone();
                async move {
                    for controller in component {
                        let Some(instance) = controller.current() else {
                            continue;
                        };
                        if instance.state() == InstanceState::Evaluated {
                            continue;
                        }
                        instance.evaluate(&application).await?;
                        let adopted_staging = controller
                            .staging()
                            .is_some_and(|staging| Arc::ptr_eq(&staging, &instance));
                        if adopted_staging {
                            controller.set_staging(None);
                        }
                    }
                    Ok(())
                }
            },
            |_| {},
        )
        .await;
        evaluation.map_err(DispatchError::Evaluation)?;
        Ok(())
    }
}

impl std::fmt::Debug for ReloadableModuleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slots = self.slots.lock();
        f.debug_struct("ReloadableModuleController")
            .field("url", &self.url)
            .field("version", &self.version())
            .field("current", &slots.current.is_some())
            .field("pending", &slots.pending.is_some())
            .field("previous", &slots.previous.is_some())
            .field("staging", &slots.staging.is_some())
            .field("temporary", &slots.temporary.is_some())
            .finish()
    }
}

pub(crate) fn option_ptr_eq(
    a: &Option<Arc<ReloadableModuleInstance>>,
    b: &Option<Arc<ReloadableModuleInstance>>,
) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}
