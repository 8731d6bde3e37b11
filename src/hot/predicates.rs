//! Inspectors and runners over an instance's hot registrations.
//!
//! The pure predicates (`is_*`) drive the dry-run phase; the `try_*`
//! runners and `dispose`/`prune` execute user callbacks during commit.
//!
//! Registered dependency specifiers are matched against changed modules by
//! resolving each request specifier to its controller URL.

use std::sync::Arc;

use crate::module::binding::specifier_urls;
use crate::module::instance::ReloadableModuleInstance;
use crate::module::Value;

/// A dependency that was replaced during the current update.
#[derive(Clone, Debug)]
pub struct ChangedDependency {
    pub url: String,
    pub namespace: Value,
}

/// True iff every changed dependency is covered by a bare `accept()` or a
/// dependency-specific accept registration.
pub fn is_accepted(instance: &Arc<ReloadableModuleInstance>, changed: &[String]) -> bool {
    if changed.is_empty() {
        return true;
    }
    let hot = instance.hot();
    if hot.has_self_accept() {
        return true;
    }
    let entries = hot.dependency_accepts();
    if entries.is_empty() {
        return false;
    }
    let urls = specifier_urls(instance);
    changed.iter().all(|url| {
        entries.iter().any(|entry| {
            entry
                .deps
                .as_deref()
                .unwrap_or_default()
                .iter()
                .any(|specifier| urls.get(specifier) == Some(url))
        })
    })
}

/// True iff the instance registered a bare `accept()`.
pub fn is_accepted_self(instance: &Arc<ReloadableModuleInstance>) -> bool {
    instance.hot().has_self_accept()
}

/// True iff `decline()` was called.
pub fn is_declined(instance: &Arc<ReloadableModuleInstance>) -> bool {
    instance.hot().is_declined()
}

/// True iff user code explicitly invalidated this instance.
pub fn is_invalidated(instance: &Arc<ReloadableModuleInstance>) -> bool {
    instance.hot().is_invalidated()
}

/// Run dependency-accept callbacks for the changed modules.
///
/// Returns false when the instance must be re-evaluated instead: some
/// changed dependency has no dependency-specific registration (a bare
/// self-accept absorbs the update by re-running the body), a callback
/// failed, or an invalidation was raised.
pub fn try_accept(
    instance: &Arc<ReloadableModuleInstance>,
    changed: &[ChangedDependency],
) -> bool {
    if changed.is_empty() {
        return true;
    }
    let hot = instance.hot();
    let entries = hot.dependency_accepts();
    let urls = specifier_urls(instance);
    for change in changed {
        let mut covered = false;
        for entry in &entries {
            let matches = entry
                .deps
                .as_deref()
                .unwrap_or_default()
                .iter()
                .any(|specifier| urls.get(specifier) == Some(&change.url));
            if !matches {
                continue;
            }
            covered = true;
            if let Some(callback) = &entry.callback
                && (&**callback)(change.namespace.clone()).is_err()
            {
                return false;
            }
        }
        if !covered {
            return false;
        }
    }
    !hot.is_invalidated()
}

/// Run the self-accept callbacks with the new instance's namespace.
///
/// Returns false when no self-accept is registered, a callback failed, or
/// an invalidation was raised.
pub fn try_accept_self(
    instance: &Arc<ReloadableModuleInstance>,
    namespace: impl FnOnce() -> Value,
) -> bool {
    let hot = instance.hot();
    if !hot.has_self_accept() {
        return false;
    }
    let callbacks = hot.self_accept_callbacks();
    if !callbacks.is_empty() {
        let namespace = namespace();
        for callback in callbacks {
            if (&*callback)(namespace.clone()).is_err() {
                return false;
            }
        }
    }
    !hot.is_invalidated()
}

/// Run dispose callbacks and return the carry-over data for the successor.
///
/// A callback failure propagates; callers classify it as fatal.
pub fn dispose(instance: &Arc<ReloadableModuleInstance>) -> anyhow::Result<Value> {
    let mut data = Value::Object(serde_json::Map::new());
    for callback in instance.hot().dispose_callbacks() {
        (&*callback)(&mut data)?;
    }
    Ok(data)
}

/// Run prune callbacks for a permanently removed module.
pub fn prune(instance: &Arc<ReloadableModuleInstance>) -> anyhow::Result<()> {
    for callback in instance.hot().prune_callbacks() {
        (&*callback)()?;
    }
    Ok(())
}
