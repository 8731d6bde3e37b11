//! Shared application state: controller interning, host loading, update
//! scheduling.
//!
//! One [`Application`] is reachable from every controller. It owns the
//! per-URL acquire map, the visit-index allocator, the host loader, and,
//! once the root has dispatched, the debounced update entry points
//! (`request_update` / `request_update_result`).

use anyhow::Context;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use crate::controller::{ReloadableModuleController, UpdateStatus};
use crate::module::declaration::ControllerThunk;
use crate::module::Value;
use crate::traverse::VisitIndexAllocator;
use crate::util::BoxFuture;
use crate::util::debounce::Debounced;

/// Watcher events inside this window coalesce into one update run.
const UPDATE_DEBOUNCE: Duration = Duration::from_millis(100);

// ============================================================================
// Loader contract
// ============================================================================

/// The host loader: resolves a URL at a version to transformed module
/// code whose execution performs exactly one `controller.load(...)` call
/// for that URL.
pub trait ModuleLoader: Send + Sync {
    fn import<'a>(
        &'a self,
        application: &'a Arc<Application>,
        url: &'a str,
        version: u32,
    ) -> BoxFuture<'a, anyhow::Result<()>>;

    /// Called with the previous version's coordinates when a newer one
    /// loads, so hosts can drop stale cache entries.
    fn evict(&self, _url: &str, _version: u32) {}
}

// ============================================================================
// Application
// ============================================================================

pub struct Application {
    weak: Weak<Application>,
    controllers: DashMap<String, Arc<ReloadableModuleController>>,
    visit_indexes: VisitIndexAllocator,
    loader: Arc<dyn ModuleLoader>,
    root: OnceLock<Arc<ReloadableModuleController>>,
    updates: OnceLock<Debounced<Option<UpdateStatus>>>,
}

impl Application {
    pub fn new(loader: Arc<dyn ModuleLoader>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            controllers: DashMap::new(),
            visit_indexes: VisitIndexAllocator::new(),
            loader,
            root: OnceLock::new(),
            updates: OnceLock::new(),
        })
    }

    fn arc(&self) -> Arc<Self> {
        self.weak.upgrade().expect("application is alive while borrowed")
    }

    /// Intern the controller for a URL. At most one controller exists per
    /// URL for the lifetime of the application.
    pub fn acquire(&self, url: &str) -> Arc<ReloadableModuleController> {
        self.controllers
            .entry(url.to_string())
            .or_insert_with(|| ReloadableModuleController::new(url, &self.arc()))
            .clone()
    }

    /// A lazy controller handle for use in `LoadedModuleRequest` entries.
    pub fn thunk(&self, url: &str) -> ControllerThunk {
        let application = self.arc();
        let url = url.to_string();
        Arc::new(move || application.acquire(&url))
    }

    pub fn root(&self) -> Option<Arc<ReloadableModuleController>> {
        self.root.get().cloned()
    }

    pub(crate) fn loader(&self) -> &Arc<dyn ModuleLoader> {
        &self.loader
    }

    pub(crate) fn visit_indexes(&self) -> &VisitIndexAllocator {
        &self.visit_indexes
    }

    /// Entry point: import and dispatch the root module, then install the
    /// update hooks. The hooks are bound to the root exactly once.
    pub async fn main(&self, url: &str) -> anyhow::Result<()> {
        let this = self.arc();
        let root = self.acquire(url);
        self.loader
            .import(&this, url, root.version())
            .await
            .with_context(|| format!("importing `{url}`"))?;
        root.dispatch(&this).await?;

        let weak = self.weak.clone();
        let _ = self.root.set(root);
        let _ = self.updates.set(Debounced::new(
            UPDATE_DEBOUNCE,
            Arc::new(move || {
                let weak = weak.clone();
                Box::pin(async move {
                    match weak.upgrade() {
                        Some(application) => application.run_update().await,
                        None => None,
                    }
                }) as BoxFuture<'static, Option<UpdateStatus>>
            }),
        ));
        crate::log!("hot"; "dispatched `{url}`");
        Ok(())
    }

    async fn run_update(&self) -> Option<UpdateStatus> {
        let this = self.arc();
        let root = self.root()?;
        root.request_update(&this).await
    }

    /// Schedule a debounced update across the whole reachable graph.
    /// Requires a tokio runtime; a no-op before `main` has dispatched.
    pub fn request_update(&self) {
        if let Some(updates) = self.updates.get() {
            updates.schedule();
        }
    }

    /// Await the settled result of the latest scheduled update. `None`
    /// means no update was needed (or none was ever scheduled).
    pub async fn request_update_result(&self) -> Option<UpdateStatus> {
        match self.updates.get() {
            Some(updates) => updates.result().await.flatten(),
            None => None,
        }
    }

    /// Watcher entry point: bump the version, re-import under it, and
    /// schedule the debounced update.
    pub async fn notify_changed(&self, url: &str) -> anyhow::Result<()> {
        let this = self.arc();
        let controller = self.acquire(url);
        let version = controller.bump_version();
        crate::debug!("watch"; "`{url}` changed, importing version {version}");
        self.loader
            .import(&this, url, version)
            .await
            .with_context(|| format!("re-importing `{url}`"))?;
        self.request_update();
        Ok(())
    }

    /// Dynamically import a module, dispatching it on first use. Returns
    /// its namespace object.
    pub async fn dynamic_import(&self, url: &str) -> anyhow::Result<Value> {
        let controller = self.acquire(url);
        self.ensure_dispatched(&controller).await?;
        let current = controller
            .current()
            .with_context(|| format!("module `{url}` has no live instance"))?;
        current.namespace(&|child| child.current()).map_err(Into::into)
    }

    pub(crate) async fn ensure_dispatched(
        &self,
        controller: &Arc<ReloadableModuleController>,
    ) -> anyhow::Result<()> {
        if controller.current().is_some() {
            return Ok(());
        }
        let this = self.arc();
        if controller.staging().is_none() {
            self.loader
                .import(&this, controller.url(), controller.version())
                .await?;
        }
        controller.dispatch(&this).await?;
        Ok(())
    }
}

// ============================================================================
// Hot URL scheme
// ============================================================================

/// A parsed `hot:` URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HotUrl {
    /// `hot:reload` (vs `hot:module`).
    pub reload: bool,
    pub url: String,
    pub version: u32,
    /// Raw serialized import assertions, when present.
    pub assertions: Option<String>,
}

/// Format the cache-busted loader URL for a module at a version.
pub fn module_url(url: &str, version: u32, assertions: Option<&str>) -> String {
    format_hot_url("hot:module", url, version, assertions)
}

/// Format the re-import trigger URL for a module at a version.
pub fn reload_url(url: &str, version: u32, assertions: Option<&str>) -> String {
    format_hot_url("hot:reload", url, version, assertions)
}

fn format_hot_url(scheme: &str, url: &str, version: u32, assertions: Option<&str>) -> String {
    match assertions {
        Some(with) => format!("{scheme}?url={url}&version={version}&with={with}"),
        None => format!("{scheme}?url={url}&version={version}"),
    }
}

/// Parse a `hot:module?…` / `hot:reload?…` URL.
pub fn parse_hot_url(input: &str) -> Option<HotUrl> {
    let (scheme, query) = input.split_once('?')?;
    let reload = match scheme {
        "hot:module" => false,
        "hot:reload" => true,
        _ => return None,
    };
    let mut url = None;
    let mut version = None;
    let mut assertions = None;
    for pair in query.split('&') {
        let (key, value) = pair.split_once('=')?;
        match key {
            "url" => url = Some(value.to_string()),
            "version" => version = value.parse().ok(),
            "with" => assertions = Some(value.to_string()),
            _ => {}
        }
    }
    Some(HotUrl {
        reload,
        url: url?,
        version: version?,
        assertions,
    })
}

// ============================================================================
// In-memory loader
// ============================================================================

/// Declaration factory registered for one URL: runs the "transformed
/// module", i.e. performs the `controller.load(...)` call.
pub type SourceBuilder =
    Arc<dyn Fn(&Arc<Application>, &Arc<ReloadableModuleController>) + Send + Sync>;

/// Source registered for one URL in a [`MemoryLoader`].
#[derive(Clone)]
pub struct ModuleSource {
    /// URLs statically imported by this module; loaded first, ES-style.
    pub imports: Vec<String>,
    pub build: SourceBuilder,
}

impl ModuleSource {
    pub fn new(
        imports: impl IntoIterator<Item = impl Into<String>>,
        build: impl Fn(&Arc<Application>, &Arc<ReloadableModuleController>) + Send + Sync + 'static,
    ) -> Self {
        Self {
            imports: imports.into_iter().map(Into::into).collect(),
            build: Arc::new(build),
        }
    }
}

/// Reference loader over registered sources. Used for embedding without a
/// real host loader, and throughout the test suite.
pub struct MemoryLoader {
    sources: RwLock<FxHashMap<String, ModuleSource>>,
    /// url → version the declaration was last built at.
    built: Mutex<FxHashMap<String, u32>>,
    /// Import-in-progress guard; breaks load cycles the ES way.
    in_flight: Mutex<FxHashSet<String>>,
}

impl Default for MemoryLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self {
            sources: RwLock::new(FxHashMap::default()),
            built: Mutex::new(FxHashMap::default()),
            in_flight: Mutex::new(FxHashSet::default()),
        }
    }

    /// Register (or replace) the source for a URL. A replacement takes
    /// effect at the next import of a bumped version.
    pub fn register(&self, url: &str, source: ModuleSource) {
        self.sources.write().insert(url.to_string(), source);
    }

    fn import_inner(&self, application: &Arc<Application>, url: &str) -> anyhow::Result<()> {
        if !self.in_flight.lock().insert(url.to_string()) {
            return Ok(());
        }
        let result = self.import_guarded(application, url);
        self.in_flight.lock().remove(url);
        result
    }

    fn import_guarded(&self, application: &Arc<Application>, url: &str) -> anyhow::Result<()> {
        let controller = application.acquire(url);
        let version = controller.version();
        let source = self
            .sources
            .read()
            .get(url)
            .cloned()
            .with_context(|| format!("no module registered for `{url}`"))?;

        // Load dependencies first; satisfied ones are skipped, exactly as
        // a module cache would.
        for dep in &source.imports {
            let dep_controller = application.acquire(dep);
            if dep_controller.current().is_some() || dep_controller.staging().is_some() {
                continue;
            }
            self.import_inner(application, dep)?;
        }

        let fresh = self.built.lock().get(url) == Some(&version);
        if fresh && controller.staging().is_some() {
            return Ok(());
        }
        (&*source.build)(application, &controller);
        self.built.lock().insert(url.to_string(), version);
        Ok(())
    }
}

impl ModuleLoader for MemoryLoader {
    fn import<'a>(
        &'a self,
        application: &'a Arc<Application>,
        url: &'a str,
        _version: u32,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move { self.import_inner(application, url) })
    }
}

// ============================================================================
// Tests
// ============================================================================
