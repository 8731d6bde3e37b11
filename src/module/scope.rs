//! The evaluation handle a module body runs against.
//!
//! Stands in for the transformed-module protocol: reading imported
//! bindings, writing live export bindings, reaching the hot facade through
//! `meta`, and dynamic import.

use std::sync::Arc;

use anyhow::Context;

use crate::application::Application;
use crate::hot::Hot;
use crate::module::Value;
use crate::module::instance::ReloadableModuleInstance;

/// Per-module metadata visible to the body (`import.meta` shape).
#[derive(Clone)]
pub struct ModuleMeta {
    pub url: String,
    pub hot: Hot,
}

/// Handle passed to a module body for one evaluation.
#[derive(Clone)]
pub struct ModuleScope {
    instance: Arc<ReloadableModuleInstance>,
    application: Arc<Application>,
}

impl ModuleScope {
    pub(crate) fn new(
        instance: Arc<ReloadableModuleInstance>,
        application: Arc<Application>,
    ) -> Self {
        Self {
            instance,
            application,
        }
    }

    pub fn url(&self) -> &str {
        self.instance.url()
    }

    pub fn meta(&self) -> ModuleMeta {
        ModuleMeta {
            url: self.instance.url().to_string(),
            hot: self.instance.hot().clone(),
        }
    }

    /// The hot facade of this instance.
    pub fn hot(&self) -> Hot {
        self.instance.hot().clone()
    }

    /// Read an imported binding by its local name. Bindings are live:
    /// re-assignments in the exporting module are observed here.
    pub fn import(&self, local: &str) -> anyhow::Result<Value> {
        self.instance.read_binding(local).with_context(|| {
            format!(
                "no imported binding `{local}` in module `{}`",
                self.instance.url()
            )
        })
    }

    /// Write a live export binding. The name must be declared by the body.
    pub fn export(&self, name: &str, value: Value) -> anyhow::Result<()> {
        self.instance.export(name, value)
    }

    /// Import a module at runtime, recording the edge so subsequent
    /// updates traverse into it. Returns the target's namespace object.
    pub async fn dynamic_import(&self, specifier: &str) -> anyhow::Result<Value> {
        anyhow::ensure!(
            self.instance.declaration().uses_dynamic_import(),
            "module `{}` was not transformed with dynamic import support",
            self.instance.url()
        );
        let controller = self.application.acquire(specifier);
        self.instance.add_dynamic_child(controller.clone());
        self.application.ensure_dispatched(&controller).await?;
        let current = controller
            .current()
            .with_context(|| format!("module `{specifier}` has no live instance"))?;
        current
            .namespace(&|child| child.current())
            .map_err(Into::into)
    }
}
