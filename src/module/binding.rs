//! Export resolution: binding imported names to export slots.
//!
//! A name is resolvable against an instance if exactly one non-ambiguous
//! binding exists for it, chasing indirect exports and `export *` per the
//! host module semantics. Cycles through star exports terminate via a
//! visited set; an `export * from` the module itself is a link error.

use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use thiserror::Error;

use crate::controller::ReloadableModuleController;
use crate::module::instance::ReloadableModuleInstance;
use crate::module::{ExportsHandle, Value};

/// Chooses which instance of a child controller a link pass binds against.
///
/// Passing different selectors lets the same resolution code run over the
/// current, pending, or temporary view of the graph.
pub(crate) type InstanceSelector<'a> =
    &'a dyn Fn(&Arc<ReloadableModuleController>) -> Option<Arc<ReloadableModuleInstance>>;

/// Static linking failures. These carry the offending module URL and stand
/// in for the host's `SyntaxError`.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("module `{from}` does not provide an export named `{name}`, imported by `{importer}`")]
    UnresolvedImport {
        importer: String,
        from: String,
        name: String,
    },

    #[error("ambiguous star export `{name}` in `{url}`")]
    AmbiguousExport { url: String, name: String },

    #[error("module `{url}` cannot `export *` from itself")]
    StarSelfReference { url: String },

    #[error("duplicate export `{name}` in `{url}`")]
    DuplicateExport { url: String, name: String },

    #[error("dependency `{specifier}` of `{url}` has no loadable instance")]
    MissingDependency { url: String, specifier: String },

    #[error("module `{url}` was never loaded")]
    NotLoaded { url: String },
}

impl LinkError {
    /// The URL the error is attributed to.
    pub fn url(&self) -> &str {
        match self {
            Self::UnresolvedImport { importer, .. } => importer,
            Self::AmbiguousExport { url, .. }
            | Self::StarSelfReference { url }
            | Self::DuplicateExport { url, .. }
            | Self::MissingDependency { url, .. }
            | Self::NotLoaded { url } => url,
        }
    }
}

// ============================================================================
// Resolved bindings
// ============================================================================

/// A name bound to a slot in some instance's exports map.
///
/// Reads go through the shared handle, which keeps bindings live: a
/// re-assignment in the exporting module is visible to every importer.
#[derive(Clone)]
pub struct NamedBinding {
    exports: ExportsHandle,
    name: String,
}

impl NamedBinding {
    pub(crate) fn new(exports: ExportsHandle, name: impl Into<String>) -> Self {
        Self {
            exports,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current value of the bound slot. Unevaluated slots read as null.
    pub fn get(&self) -> Value {
        self.exports
            .read()
            .get(&self.name)
            .cloned()
            .unwrap_or(Value::Null)
    }

    /// Two bindings are the same when they alias the same slot.
    pub(crate) fn same_slot(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.exports, &other.exports) && self.name == other.name
    }
}

/// A fully resolved namespace: name → slot, fixed at link time.
pub struct NamespaceShape {
    entries: Vec<(String, NamedBinding)>,
}

impl NamespaceShape {
    /// Snapshot the namespace into a value object, keys sorted.
    pub fn to_value(&self) -> Value {
        let mut object = serde_json::Map::new();
        for (name, binding) in &self.entries {
            object.insert(name.clone(), binding.get());
        }
        Value::Object(object)
    }
}

/// One resolved import binding of an instance.
#[derive(Clone)]
pub enum ResolvedBinding {
    Named(NamedBinding),
    Namespace(Arc<NamespaceShape>),
}

impl ResolvedBinding {
    pub fn get(&self) -> Value {
        match self {
            Self::Named(named) => named.get(),
            Self::Namespace(shape) => shape.to_value(),
        }
    }
}

// ============================================================================
// Resolution
// ============================================================================

type Visited = FxHashSet<(usize, String)>;

fn instance_key(instance: &ReloadableModuleInstance) -> usize {
    instance as *const ReloadableModuleInstance as usize
}

/// Resolve an exported name against an instance.
///
/// Returns `Ok(None)` when the name does not resolve (including circular
/// chases, which terminate silently beyond the single-hop self case).
pub(crate) fn resolve_export(
    instance: &ReloadableModuleInstance,
    name: &str,
    select: InstanceSelector<'_>,
) -> Result<Option<NamedBinding>, LinkError> {
    let mut visited = Visited::default();
    resolve_inner(instance, name, select, &mut visited)
}

fn resolve_inner(
    instance: &ReloadableModuleInstance,
    name: &str,
    select: InstanceSelector<'_>,
    visited: &mut Visited,
) -> Result<Option<NamedBinding>, LinkError> {
    if !visited.insert((instance_key(instance), name.to_string())) {
        return Ok(None);
    }
    let declaration = instance.declaration().clone();

    if declaration.local_exports().iter().any(|e| e == name) {
        return Ok(Some(NamedBinding::new(instance.exports_handle(), name)));
    }

    if let Some((request, source)) = declaration.indirect_export(name) {
        let child = request_instance(instance, *request, select)?;
        return resolve_inner(&child, source, select, visited);
    }

    let mut resolution: Option<NamedBinding> = None;
    if name != "default" {
        for &request in declaration.star_exports() {
            let child = request_instance(instance, request, select)?;
            if std::ptr::eq(child.as_ref(), instance) {
                return Err(LinkError::StarSelfReference {
                    url: instance.url().to_string(),
                });
            }
            if let Some(binding) = resolve_inner(&child, name, select, visited)? {
                match &resolution {
                    Some(existing) if !existing.same_slot(&binding) => {
                        return Err(LinkError::AmbiguousExport {
                            url: instance.url().to_string(),
                            name: name.to_string(),
                        });
                    }
                    Some(_) => {}
                    None => resolution = Some(binding),
                }
            }
        }
    }
    Ok(resolution)
}

fn request_instance(
    instance: &ReloadableModuleInstance,
    request: usize,
    select: InstanceSelector<'_>,
) -> Result<Arc<ReloadableModuleInstance>, LinkError> {
    let declaration = instance.declaration();
    let entry = &declaration.loaded_modules()[request];
    let controller = entry.controller();
    select(&controller).ok_or_else(|| LinkError::MissingDependency {
        url: instance.url().to_string(),
        specifier: entry.specifier().to_string(),
    })
}

/// All exported names of an instance: locals, indirect exports, and the
/// star closure (`default` never crosses a star edge).
pub(crate) fn export_names(
    instance: &ReloadableModuleInstance,
    select: InstanceSelector<'_>,
) -> Result<Vec<String>, LinkError> {
    let mut seen = FxHashSet::default();
    let mut names = Vec::new();
    collect_names(instance, select, &mut seen, &mut names, true)?;
    let mut unique = FxHashSet::default();
    names.retain(|name| unique.insert(name.clone()));
    Ok(names)
}

fn collect_names(
    instance: &ReloadableModuleInstance,
    select: InstanceSelector<'_>,
    seen: &mut FxHashSet<usize>,
    names: &mut Vec<String>,
    include_default: bool,
) -> Result<(), LinkError> {
    if !seen.insert(instance_key(instance)) {
        return Ok(());
    }
    let declaration = instance.declaration().clone();
    for name in declaration.local_exports() {
        if include_default || name != "default" {
            names.push(name.clone());
        }
    }
    for name in declaration.indirect_export_names() {
        if include_default || name != "default" {
            names.push(name.clone());
        }
    }
    for &request in declaration.star_exports() {
        let child = request_instance(instance, request, select)?;
        if std::ptr::eq(child.as_ref(), instance) {
            return Err(LinkError::StarSelfReference {
                url: instance.url().to_string(),
            });
        }
        collect_names(&child, select, seen, names, false)?;
    }
    Ok(())
}

/// Resolve the full namespace of an instance.
///
/// Ambiguous star names are omitted, matching namespace-object semantics;
/// other resolution failures propagate.
pub(crate) fn namespace_shape(
    instance: &ReloadableModuleInstance,
    select: InstanceSelector<'_>,
) -> Result<NamespaceShape, LinkError> {
    let mut entries = Vec::new();
    for name in export_names(instance, select)? {
        match resolve_export(instance, &name, select) {
            Ok(Some(binding)) => entries.push((name, binding)),
            Ok(None) => {}
            Err(LinkError::AmbiguousExport { .. }) => {}
            Err(error) => return Err(error),
        }
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(NamespaceShape { entries })
}

/// Map each request specifier of an instance to its controller URL.
pub(crate) fn specifier_urls(instance: &ReloadableModuleInstance) -> FxHashMap<String, String> {
    instance
        .declaration()
        .loaded_modules()
        .iter()
        .map(|request| {
            (
                request.specifier().to_string(),
                request.controller().url().to_string(),
            )
        })
        .collect()
}
