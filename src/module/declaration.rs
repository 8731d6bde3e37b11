//! Immutable module declarations produced by the source transformer.
//!
//! The transformer rewrites every module into a single
//! `controller.load(body, meta, uses_dynamic_import, format,
//! import_assertions, loaded_modules)` call. Everything the update
//! algorithm needs to know about a module's static shape lives here; the
//! body closure carries the runtime behavior.

use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::Arc;

use crate::controller::ReloadableModuleController;
use crate::module::scope::ModuleScope;
use crate::module::Value;
use crate::util::BoxFuture;

/// Lazily resolves the controller serving a module request.
///
/// Thunks keep declarations independent of load order: the target
/// controller is interned on first use.
pub type ControllerThunk = Arc<dyn Fn() -> Arc<ReloadableModuleController> + Send + Sync>;

pub type SyncBodyFn = Arc<dyn Fn(&ModuleScope) -> anyhow::Result<()> + Send + Sync>;
pub type AsyncBodyFn =
    Arc<dyn Fn(ModuleScope) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

// ============================================================================
// Body
// ============================================================================

/// Executable form of a module body.
#[derive(Clone)]
pub enum BodyFn {
    Sync(SyncBodyFn),
    /// Async bodies suspend at their own awaits; the update algorithm
    /// awaits them per SCC.
    Async(AsyncBodyFn),
}

/// A module body plus its statically declared export names.
///
/// Export names must be known before evaluation so that linking (and the
/// pre-commit link test) can verify the import surface without running any
/// user code.
#[derive(Clone)]
pub struct ModuleBody {
    exports: Vec<String>,
    execute: BodyFn,
}

impl ModuleBody {
    pub fn new_sync(
        exports: impl IntoIterator<Item = impl Into<String>>,
        execute: impl Fn(&ModuleScope) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            exports: exports.into_iter().map(Into::into).collect(),
            execute: BodyFn::Sync(Arc::new(execute)),
        }
    }

    pub fn new_async(
        exports: impl IntoIterator<Item = impl Into<String>>,
        execute: impl Fn(ModuleScope) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            exports: exports.into_iter().map(Into::into).collect(),
            execute: BodyFn::Async(Arc::new(execute)),
        }
    }

    pub fn exports(&self) -> &[String] {
        &self.exports
    }

    pub fn execute(&self) -> &BodyFn {
        &self.execute
    }
}

impl fmt::Debug for ModuleBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleBody")
            .field("exports", &self.exports)
            .field(
                "execute",
                &match self.execute {
                    BodyFn::Sync(_) => "sync",
                    BodyFn::Async(_) => "async",
                },
            )
            .finish()
    }
}

// ============================================================================
// Bindings
// ============================================================================

/// Module format tag, passed through to the host loader.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModuleFormat {
    Module,
    CommonJs,
    Json,
}

/// One binding of a module request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModuleBinding {
    /// `import { name as alias } from "specifier"`
    Import { name: String, alias: Option<String> },
    /// `import * as alias from "specifier"`
    ImportStar { alias: String },
    /// `export { name as alias } from "specifier"`
    IndirectExport { name: String, alias: Option<String> },
    /// `export * from "specifier"`
    ExportStar,
}

impl ModuleBinding {
    pub fn import(name: impl Into<String>) -> Self {
        Self::Import {
            name: name.into(),
            alias: None,
        }
    }

    pub fn import_as(name: impl Into<String>, alias: impl Into<String>) -> Self {
        Self::Import {
            name: name.into(),
            alias: Some(alias.into()),
        }
    }

    pub fn import_star(alias: impl Into<String>) -> Self {
        Self::ImportStar {
            alias: alias.into(),
        }
    }

    pub fn indirect_export(name: impl Into<String>) -> Self {
        Self::IndirectExport {
            name: name.into(),
            alias: None,
        }
    }

    pub fn indirect_export_as(name: impl Into<String>, alias: impl Into<String>) -> Self {
        Self::IndirectExport {
            name: name.into(),
            alias: Some(alias.into()),
        }
    }

    pub fn export_star() -> Self {
        Self::ExportStar
    }
}

/// A static module request: specifier, its bindings, and the thunk that
/// resolves the target controller.
#[derive(Clone)]
pub struct LoadedModuleRequest {
    specifier: String,
    bindings: Vec<ModuleBinding>,
    controller: ControllerThunk,
}

impl LoadedModuleRequest {
    pub fn new(
        specifier: impl Into<String>,
        bindings: Vec<ModuleBinding>,
        controller: ControllerThunk,
    ) -> Self {
        Self {
            specifier: specifier.into(),
            bindings,
            controller,
        }
    }

    pub fn specifier(&self) -> &str {
        &self.specifier
    }

    pub fn bindings(&self) -> &[ModuleBinding] {
        &self.bindings
    }

    pub fn controller(&self) -> Arc<ReloadableModuleController> {
        (&*self.controller)()
    }
}

impl fmt::Debug for LoadedModuleRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModuleRequest")
            .field("specifier", &self.specifier)
            .field("bindings", &self.bindings)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Declaration
// ============================================================================

/// The immutable record attached to every instance of a module.
///
/// Indirect- and star-export tables are derived from the request bindings
/// at construction; resolution chases them per the host module semantics.
#[derive(Debug)]
pub struct ModuleDeclaration {
    body: ModuleBody,
    meta: Option<FxHashMap<String, Value>>,
    format: ModuleFormat,
    import_assertions: FxHashMap<String, String>,
    uses_dynamic_import: bool,
    loaded_modules: Vec<LoadedModuleRequest>,
    /// Exported name → (request index, name in the target module).
    indirect_exports: FxHashMap<String, (usize, String)>,
    /// Request indexes contributing `export *`.
    star_exports: Vec<usize>,
}

impl ModuleDeclaration {
    pub fn new(
        body: ModuleBody,
        meta: Option<FxHashMap<String, Value>>,
        uses_dynamic_import: bool,
        format: ModuleFormat,
        import_assertions: FxHashMap<String, String>,
        loaded_modules: Vec<LoadedModuleRequest>,
    ) -> Self {
        let mut indirect_exports = FxHashMap::default();
        let mut star_exports = Vec::new();
        for (index, request) in loaded_modules.iter().enumerate() {
            for binding in request.bindings() {
                match binding {
                    ModuleBinding::IndirectExport { name, alias } => {
                        let exported = alias.clone().unwrap_or_else(|| name.clone());
                        indirect_exports.insert(exported, (index, name.clone()));
                    }
                    ModuleBinding::ExportStar => star_exports.push(index),
                    _ => {}
                }
            }
        }
        Self {
            body,
            meta,
            format,
            import_assertions,
            uses_dynamic_import,
            loaded_modules,
            indirect_exports,
            star_exports,
        }
    }

    pub fn body(&self) -> &ModuleBody {
        &self.body
    }

    /// Names exported by the body itself.
    pub fn local_exports(&self) -> &[String] {
        self.body.exports()
    }

    pub fn meta(&self) -> Option<&FxHashMap<String, Value>> {
        self.meta.as_ref()
    }

    pub fn format(&self) -> ModuleFormat {
        self.format
    }

    pub fn import_assertions(&self) -> &FxHashMap<String, String> {
        &self.import_assertions
    }

    pub fn uses_dynamic_import(&self) -> bool {
        self.uses_dynamic_import
    }

    pub fn loaded_modules(&self) -> &[LoadedModuleRequest] {
        &self.loaded_modules
    }

    pub(crate) fn indirect_export(&self, name: &str) -> Option<&(usize, String)> {
        self.indirect_exports.get(name)
    }

    pub(crate) fn indirect_export_names(&self) -> impl Iterator<Item = &String> {
        self.indirect_exports.keys()
    }

    pub(crate) fn star_exports(&self) -> &[usize] {
        &self.star_exports
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn dead_thunk() -> ControllerThunk {
        Arc::new(|| unreachable!("thunk not used in this test"))
    }

    #[test]
    fn derives_export_tables_from_bindings() {
        let body = ModuleBody::new_sync(["local"], |_| Ok(()));
        let declaration = ModuleDeclaration::new(
            body,
            None,
            false,
            ModuleFormat::Module,
            FxHashMap::default(),
            vec![
                LoadedModuleRequest::new(
                    "./a",
                    vec![
                        ModuleBinding::import("x"),
                        ModuleBinding::indirect_export_as("inner", "outer"),
                    ],
                    dead_thunk(),
                ),
                LoadedModuleRequest::new("./b", vec![ModuleBinding::export_star()], dead_thunk()),
            ],
        );

        assert_eq!(declaration.local_exports(), ["local"]);
        assert_eq!(
            declaration.indirect_export("outer"),
            Some(&(0, "inner".to_string()))
        );
        assert!(declaration.indirect_export("inner").is_none());
        assert_eq!(declaration.star_exports(), [1]);
    }

    #[test]
    fn binding_constructors() {
        assert_eq!(
            ModuleBinding::import_as("a", "b"),
            ModuleBinding::Import {
                name: "a".into(),
                alias: Some("b".into())
            }
        );
        assert_eq!(
            ModuleBinding::import_star("ns"),
            ModuleBinding::ImportStar { alias: "ns".into() }
        );
    }
}
