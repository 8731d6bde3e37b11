//! Module data model.
//!
//! A module exists at three layers:
//!
//! - [`ModuleDeclaration`]: the immutable output of the source
//!   transformer; a body, the static import/export shape, and a controller
//!   thunk per dependency.
//! - [`ReloadableModuleInstance`]: one concrete linked form of a
//!   declaration; live exports, resolved import bindings, evaluation state.
//! - [`ModuleScope`]: the handle a body evaluates against to read imports,
//!   write exports, reach the hot facade, and dynamically import.

pub mod binding;
pub mod declaration;
pub mod instance;
pub mod scope;

pub use binding::{LinkError, NamedBinding, ResolvedBinding};
pub use declaration::{
    BodyFn, ControllerThunk, LoadedModuleRequest, ModuleBinding, ModuleBody, ModuleDeclaration,
    ModuleFormat,
};
pub use instance::{EvaluationError, InstanceState, ReloadableModuleInstance};
pub use scope::{ModuleMeta, ModuleScope};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Export values carried in module namespaces.
pub use serde_json::Value;

/// The mutable export namespace of one instance.
pub type ExportsMap = FxHashMap<String, Value>;

/// Shared handle to an exports map; import bindings read through it.
pub type ExportsHandle = Arc<RwLock<ExportsMap>>;
