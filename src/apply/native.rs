//! Backend for packages that render to a plain object stream. Apply and
//! remove delegate to the diff/apply engine; only the render function
//! differs between kustomize and template instances.

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use crate::api::values::equal_values;
use crate::api::{Instance, Phase};
use crate::apply::engine::{ClientApply, SyncOptions};
use crate::apply::{split_yaml, Materializer};
use crate::error::Result;

/// Renders a package directory into a YAML object stream.
pub type RenderFn =
    Box<dyn Fn(&Instance, &Path) -> anyhow::Result<Vec<u8>> + Send + Sync>;

pub struct NativeApply {
    engine: ClientApply,
    render: RenderFn,
}

impl NativeApply {
    pub fn new(engine: ClientApply, render: RenderFn) -> Self {
        Self { engine, render }
    }
}

#[async_trait]
impl Materializer for NativeApply {
    async fn template(&self, instance: &Instance, location: &Path) -> Result<Vec<u8>> {
        (self.render)(instance, location)
            .map_err(|e| crate::error::Error::Render(format!("{e:#}")))
    }

    async fn apply(&self, instance: &mut Instance, location: &Path) -> Result<()> {
        let rendered = self.template(instance, location).await?;
        let mut resources = split_yaml(&rendered)?;

        let namespace = instance.metadata.namespace.clone().unwrap_or_default();
        let status = instance.status.clone().unwrap_or_default();
        let (mapper, diffresult) = self
            .engine
            .diff_with_default_namespace(&namespace, &status.resources, &mut resources)
            .await?;

        // No-op fast path: nothing to create or prune and the desired state
        // matches what was last applied.
        if status.phase == Some(Phase::Installed)
            && instance.spec.version == status.version
            && equal_values(&status.values.0, &instance.spec.values.0)
            && diffresult.creates.is_empty()
            && diffresult.removes.is_empty()
        {
            info!("all resources are already applied");
            return Ok(());
        }

        let outcome = self
            .engine
            .sync_diff(&mapper, diffresult, &SyncOptions::default())
            .await?;

        let status = instance.status.get_or_insert_with(Default::default);
        status.resources = outcome.managed.clone();
        if let Some(err) = outcome.into_error() {
            return Err(err);
        }

        status.values = instance.spec.values.without_nulls();
        status.phase = Some(Phase::Installed);
        status.version = instance.spec.version.clone();
        status.namespace = namespace;
        status.message = String::new();
        let now = Utc::now().to_rfc3339();
        status.upgrade_timestamp = Some(now.clone());
        if status.creation_timestamp.is_none() {
            status.creation_timestamp = Some(now);
        }
        Ok(())
    }

    async fn remove(&self, instance: &mut Instance) -> Result<()> {
        let namespace = instance.metadata.namespace.clone().unwrap_or_default();
        let managed = instance
            .status
            .as_ref()
            .map(|s| s.resources.clone())
            .unwrap_or_default();
        let outcome = self
            .engine
            .sync(&namespace, &managed, Vec::new(), &SyncOptions::default())
            .await?;

        let status = instance.status.get_or_insert_with(Default::default);
        status.resources = outcome.managed.clone();
        if let Some(err) = outcome.into_error() {
            return Err(err);
        }
        status.phase = Some(Phase::Disabled);
        status.message = String::new();
        Ok(())
    }
}
