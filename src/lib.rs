//! # rekindle
//!
//! A hot module replacement runtime for live module graphs.
//!
//! Given a directed module graph whose nodes may be edited at runtime,
//! the core replaces out-of-date nodes with newly loaded versions while
//! preserving semantics wherever the graph's own code says it is safe to
//! do so: per-module `accept` / `decline` declarations, dispose/prune
//! callbacks with carry-over data, and SCC-grouped link/evaluate so
//! cyclic imports are handled natively.
//!
//! # Architecture
//!
//! ```text
//! ModuleWatcher -> Application::notify_changed -> loader re-import
//!    (notify)          (version bump)            (controller.load → staging)
//!                             |
//!                 debounced request_update
//!                             |
//!        dry-run accept -> link test -> commit & evaluate -> prune
//!          (phase 1)       (phase 2)       (phase 3)       (phase 4)
//! ```
//!
//! The traversal underneath everything is a depth-first walk with
//! Tarjan-style SCC grouping (`traverse`); the SCC is the atomic unit of
//! linking, evaluation and acceptance.
//!
//! # Example
//!
//! ```ignore
//! let loader = Arc::new(MemoryLoader::new());
//! loader.register("file:///main.js", main_source());
//! let app = Application::new(loader.clone());
//! app.main("file:///main.js").await?;
//!
//! // After a source change:
//! app.notify_changed("file:///main.js").await?;
//! match app.request_update_result().await {
//!     Some(UpdateStatus::Success { stats }) => { /* hot-swapped */ }
//!     other => { /* declined / unaccepted / errors */ }
//! }
//! ```

pub mod application;
pub mod controller;
pub mod hot;
pub mod logger;
pub mod module;
pub mod traverse;
pub mod util;
pub mod watch;

pub use application::{
    Application, HotUrl, MemoryLoader, ModuleLoader, ModuleSource, module_url, parse_hot_url,
    reload_url,
};
pub use controller::{
    ChainNode, DispatchError, FatalError, FatalPhase, InvalidationChain,
    ReloadableModuleController, UpdateStats, UpdateStatus,
};
pub use hot::Hot;
pub use module::{
    BodyFn, EvaluationError, InstanceState, LinkError, LoadedModuleRequest, ModuleBinding,
    ModuleBody, ModuleDeclaration, ModuleFormat, ModuleMeta, ModuleScope,
    ReloadableModuleInstance, Value,
};
pub use watch::{ModuleWatcher, UrlMap, WatchOptions, file_url_map};
