//! One concrete linked form of a module declaration.
//!
//! An instance owns the mutable export namespace and the resolved import
//! bindings. Its lifecycle: `instantiate` (allocate exports, seed dispose
//! data) → `link` (bind every imported name) → `evaluate` (run the body).
//! `relink` re-binds after dependency replacement, `unlink` releases
//! bindings, `clone_instance` produces a fresh instance over the same
//! declaration for re-evaluation.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::application::Application;
use crate::controller::ReloadableModuleController;
use crate::hot::Hot;
use crate::module::binding::{self, InstanceSelector, LinkError, ResolvedBinding};
use crate::module::declaration::{BodyFn, ModuleBinding, ModuleDeclaration};
use crate::module::scope::ModuleScope;
use crate::module::{ExportsHandle, Value};

/// Link/evaluation state of an instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstanceState {
    Unlinked,
    Linked,
    Evaluating,
    /// Terminal; discriminated by the presence of an evaluation error.
    Evaluated,
}

/// Failure of a module body. Cheap to clone so it can live in the instance
/// and travel in the update result.
#[derive(Clone, Debug)]
pub struct EvaluationError {
    url: String,
    source: Arc<anyhow::Error>,
}

impl EvaluationError {
    pub(crate) fn new(url: &str, source: anyhow::Error) -> Self {
        Self {
            url: url.to_string(),
            source: Arc::new(source),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl fmt::Display for EvaluationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "evaluation of `{}` failed: {}", self.url, self.source)
    }
}

impl std::error::Error for EvaluationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref().as_ref())
    }
}

// ============================================================================
// Instance
// ============================================================================

pub struct ReloadableModuleInstance {
    weak: Weak<Self>,
    url: String,
    declaration: Arc<ModuleDeclaration>,
    state: RwLock<InstanceState>,
    instantiated: AtomicBool,
    exports: ExportsHandle,
    bindings: RwLock<FxHashMap<String, ResolvedBinding>>,
    evaluation_error: RwLock<Option<EvaluationError>>,
    hot: Hot,
    /// Controllers observed through `dynamic_import`, in first-seen order.
    dynamic_children: RwLock<Vec<Arc<ReloadableModuleController>>>,
}

impl ReloadableModuleInstance {
    pub(crate) fn new(url: &str, declaration: Arc<ModuleDeclaration>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            url: url.to_string(),
            declaration,
            state: RwLock::new(InstanceState::Unlinked),
            instantiated: AtomicBool::new(false),
            exports: Arc::new(RwLock::new(FxHashMap::default())),
            bindings: RwLock::new(FxHashMap::default()),
            evaluation_error: RwLock::new(None),
            hot: Hot::new(url),
            dynamic_children: RwLock::new(Vec::new()),
        })
    }

    fn arc(&self) -> Arc<Self> {
        self.weak.upgrade().expect("instance is alive while borrowed")
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn declaration(&self) -> &Arc<ModuleDeclaration> {
        &self.declaration
    }

    pub fn hot(&self) -> &Hot {
        &self.hot
    }

    pub fn state(&self) -> InstanceState {
        *self.state.read()
    }

    pub fn evaluation_error(&self) -> Option<EvaluationError> {
        self.evaluation_error.read().clone()
    }

    pub(crate) fn exports_handle(&self) -> ExportsHandle {
        self.exports.clone()
    }

    /// Allocate the export namespace and seed carry-over data from the
    /// predecessor's dispose callbacks.
    pub(crate) fn instantiate(&self, data: Option<Value>) {
        let mut exports = self.exports.write();
        exports.clear();
        for name in self.declaration.local_exports() {
            exports.insert(name.clone(), Value::Null);
        }
        drop(exports);
        self.hot.seed(data);
        self.instantiated.store(true, Ordering::SeqCst);
    }

    /// Bind every imported name against the instances chosen by `select`.
    ///
    /// Also validates the instance's own export surface: duplicate
    /// exports, unresolvable indirect exports, and single-hop `export *`
    /// self-references all fail here, before any user code runs.
    pub(crate) fn link(&self, select: InstanceSelector<'_>) -> Result<(), LinkError> {
        debug_assert!(self.instantiated.load(Ordering::SeqCst));
        let bindings = self.compute_bindings(select)?;
        *self.bindings.write() = bindings;
        let mut state = self.state.write();
        debug_assert_eq!(*state, InstanceState::Unlinked);
        *state = InstanceState::Linked;
        Ok(())
    }

    /// Re-bind imported names, assuming the graph structure is unchanged.
    ///
    /// Used after dependency SCCs were replaced, so live names in modules
    /// that were not themselves replaced point into the new instances.
    pub(crate) fn relink(&self, select: InstanceSelector<'_>) -> Result<(), LinkError> {
        debug_assert_ne!(self.state(), InstanceState::Unlinked);
        let bindings = self.compute_bindings(select)?;
        let mut slot = self.bindings.write();
        debug_assert_eq!(slot.len(), bindings.len());
        *slot = bindings;
        Ok(())
    }

    fn compute_bindings(
        &self,
        select: InstanceSelector<'_>,
    ) -> Result<FxHashMap<String, ResolvedBinding>, LinkError> {
        let declaration = self.declaration.clone();

        for name in declaration.local_exports() {
            if declaration.indirect_export(name).is_some() {
                return Err(LinkError::DuplicateExport {
                    url: self.url.clone(),
                    name: name.clone(),
                });
            }
        }
        for name in declaration.indirect_export_names() {
            let resolved = binding::resolve_export(self, name, select)?;
            if resolved.is_none() {
                return Err(LinkError::UnresolvedImport {
                    importer: self.url.clone(),
                    from: self.url.clone(),
                    name: name.clone(),
                });
            }
        }
        for &request in declaration.star_exports() {
            let entry = &declaration.loaded_modules()[request];
            let controller = entry.controller();
            let child = select(&controller).ok_or_else(|| LinkError::MissingDependency {
                url: self.url.clone(),
                specifier: entry.specifier().to_string(),
            })?;
            if std::ptr::eq(child.as_ref(), self) {
                return Err(LinkError::StarSelfReference {
                    url: self.url.clone(),
                });
            }
        }

        let mut bindings = FxHashMap::default();
        for (index, request) in declaration.loaded_modules().iter().enumerate() {
            for entry in request.bindings() {
                match entry {
                    ModuleBinding::Import { name, alias } => {
                        let child = self.request_instance(index, select)?;
                        let resolved = binding::resolve_export(&child, name, select)?
                            .ok_or_else(|| LinkError::UnresolvedImport {
                                importer: self.url.clone(),
                                from: child.url().to_string(),
                                name: name.clone(),
                            })?;
                        let local = alias.clone().unwrap_or_else(|| name.clone());
                        bindings.insert(local, ResolvedBinding::Named(resolved));
                    }
                    ModuleBinding::ImportStar { alias } => {
                        let child = self.request_instance(index, select)?;
                        let shape = binding::namespace_shape(&child, select)?;
                        bindings.insert(alias.clone(), ResolvedBinding::Namespace(Arc::new(shape)));
                    }
                    ModuleBinding::IndirectExport { .. } | ModuleBinding::ExportStar => {}
                }
            }
        }
        Ok(bindings)
    }

    fn request_instance(
        &self,
        request: usize,
        select: InstanceSelector<'_>,
    ) -> Result<Arc<Self>, LinkError> {
        let entry = &self.declaration.loaded_modules()[request];
        let controller = entry.controller();
        select(&controller).ok_or_else(|| LinkError::MissingDependency {
            url: self.url.clone(),
            specifier: entry.specifier().to_string(),
        })
    }

    /// Release bindings. Returns whether the caller should forget the
    /// slot holding this instance (true when it never started evaluating).
    pub(crate) fn unlink(&self) -> bool {
        self.bindings.write().clear();
        let mut state = self.state.write();
        match *state {
            InstanceState::Unlinked | InstanceState::Linked => {
                *state = InstanceState::Unlinked;
                true
            }
            InstanceState::Evaluating | InstanceState::Evaluated => false,
        }
    }

    /// Run the body to completion. The post-state is always `Evaluated`,
    /// discriminated by the stored error.
    pub(crate) async fn evaluate(
        &self,
        application: &Arc<Application>,
    ) -> Result<(), EvaluationError> {
        *self.state.write() = InstanceState::Evaluating;
        let scope = ModuleScope::new(self.arc(), application.clone());
        let result = match self.declaration.body().execute() {
            BodyFn::Sync(body) => (&**body)(&scope),
            BodyFn::Async(body) => (&**body)(scope.clone()).await,
        };
        *self.state.write() = InstanceState::Evaluated;
        match result {
            Ok(()) => Ok(()),
            Err(source) => {
                let error = EvaluationError::new(&self.url, source);
                *self.evaluation_error.write() = Some(error.clone());
                Err(error)
            }
        }
    }

    /// Fresh instance over the same declaration.
    pub(crate) fn clone_instance(&self) -> Arc<Self> {
        Self::new(&self.url, self.declaration.clone())
    }

    /// Static dependencies plus dynamically imported children, in order,
    /// deduplicated by controller identity.
    pub(crate) fn iterate_dependencies(&self) -> Vec<Arc<ReloadableModuleController>> {
        let mut seen = rustc_hash::FxHashSet::default();
        let mut children = Vec::new();
        let dynamic = self.dynamic_children.read();
        let all = self
            .declaration
            .loaded_modules()
            .iter()
            .map(|request| request.controller())
            .chain(dynamic.iter().cloned());
        for controller in all {
            if seen.insert(Arc::as_ptr(&controller) as usize) {
                children.push(controller);
            }
        }
        children
    }

    pub(crate) fn add_dynamic_child(&self, controller: Arc<ReloadableModuleController>) {
        let mut children = self.dynamic_children.write();
        if !children
            .iter()
            .any(|child| Arc::ptr_eq(child, &controller))
        {
            children.push(controller);
        }
    }

    /// Read an imported binding by local name.
    pub(crate) fn read_binding(&self, local: &str) -> Option<Value> {
        self.bindings.read().get(local).map(ResolvedBinding::get)
    }

    /// Write a live export binding.
    pub(crate) fn export(&self, name: &str, value: Value) -> anyhow::Result<()> {
        if !self.declaration.local_exports().iter().any(|e| e == name) {
            anyhow::bail!("module `{}` does not declare export `{}`", self.url, name);
        }
        self.exports.write().insert(name.to_string(), value);
        Ok(())
    }

    /// The module namespace object under the given graph view.
    pub fn namespace(&self, select: InstanceSelector<'_>) -> Result<Value, LinkError> {
        binding::namespace_shape(self, select).map(|shape| shape.to_value())
    }
}

impl fmt::Debug for ReloadableModuleInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReloadableModuleInstance")
            .field("url", &self.url)
            .field("state", &self.state())
            .field("error", &self.evaluation_error.read().is_some())
            .finish_non_exhaustive()
    }
}
