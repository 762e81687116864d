//! # Materializers
//!
//! Pluggable engines that turn a fetched package directory into an object
//! stream or a native release. Three backends sit behind the
//! [`Materializer`] trait:
//!
//! - `helm`: chart load/render with its own release storage
//! - `kustomize`: overlay build delegated to the diff/apply engine
//! - `template`: parameterized render delegated to the diff/apply engine
//!
//! [`BundleApplier`] downloads the package and dispatches on
//! `spec.kind`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use kube::Client;
use serde::Deserialize;
use serde_json::Value;

use crate::api::{Instance, InstanceKind};
use crate::error::{Error, Result};

pub mod download;
pub mod engine;
pub mod helm;
pub mod kustomize;
pub mod native;
pub mod template;

pub use download::Downloader;
pub use engine::{diff, ClientApply, DiffResult, SyncOptions};

/// Uniform contract exposed by each backend.
#[async_trait]
pub trait Materializer: Send + Sync {
    /// Pure rendering of the package at `location`; no cluster writes.
    async fn template(&self, instance: &Instance, location: &Path) -> Result<Vec<u8>>;

    /// Materialize the package into the cluster and record the outcome on
    /// the instance status.
    async fn apply(&self, instance: &mut Instance, location: &Path) -> Result<()>;

    /// Best-effort teardown of everything the instance materialized.
    async fn remove(&self, instance: &mut Instance) -> Result<()>;
}

/// Options shared by the applier stack.
#[derive(Debug, Clone, Default)]
pub struct ApplierOptions {
    /// Directory for downloaded package archives.
    pub cache_dir: PathBuf,
}

/// Downloads packages and dispatches to the backend matching the instance
/// kind.
pub struct BundleApplier {
    downloader: Downloader,
    appliers: HashMap<InstanceKind, Arc<dyn Materializer>>,
}

impl BundleApplier {
    pub fn new(client: Client, options: &ApplierOptions) -> Self {
        let engine = ClientApply::new(client.clone());
        let mut appliers: HashMap<InstanceKind, Arc<dyn Materializer>> = HashMap::new();
        appliers.insert(
            InstanceKind::Helm,
            Arc::new(helm::HelmApply::new(client.clone())),
        );
        appliers.insert(
            InstanceKind::Kustomize,
            Arc::new(native::NativeApply::new(
                engine.clone(),
                Box::new(|_, dir| kustomize::kustomize_build(dir)),
            )),
        );
        appliers.insert(
            InstanceKind::Template,
            Arc::new(native::NativeApply::new(
                engine,
                Box::new(template::render_directory),
            )),
        );
        Self {
            downloader: Downloader::new(&options.cache_dir),
            appliers,
        }
    }

    fn applier(&self, kind: InstanceKind) -> Result<&Arc<dyn Materializer>> {
        self.appliers
            .get(&kind)
            .ok_or_else(|| Error::UnknownKind(kind.to_string()))
    }

    async fn download(&self, instance: &Instance) -> Result<PathBuf> {
        let spec = &instance.spec;
        let name = if spec.chart.is_empty() {
            instance.metadata.name.as_deref().unwrap_or_default()
        } else {
            spec.chart.as_str()
        };
        self.downloader
            .download(&spec.url, name, &spec.version, &spec.path)
            .await
            .map_err(|e| Error::Render(format!("download: {e:#}")))
    }

    pub async fn template(&self, instance: &Instance) -> Result<Vec<u8>> {
        let location = self.download(instance).await?;
        self.applier(instance.spec.kind)?
            .template(instance, &location)
            .await
    }

    pub async fn apply(&self, instance: &mut Instance) -> Result<()> {
        let location = self.download(instance).await?;
        self.applier(instance.spec.kind)?
            .apply(instance, &location)
            .await
    }

    pub async fn remove(&self, instance: &mut Instance) -> Result<()> {
        self.applier(instance.spec.kind)?.remove(instance).await
    }
}

/// Split a rendered YAML stream into discrete object documents. Empty and
/// null documents are dropped; non-mapping documents are an error.
pub fn split_yaml(rendered: &[u8]) -> Result<Vec<Value>> {
    let text = std::str::from_utf8(rendered)
        .map_err(|e| Error::Render(format!("rendered stream is not utf-8: {e}")))?;
    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(text) {
        let value = Value::deserialize(document)
            .map_err(|e| Error::Render(format!("parse rendered document: {e}")))?;
        match value {
            Value::Null => continue,
            Value::Object(map) if map.is_empty() => continue,
            Value::Object(map) => objects.push(Value::Object(map)),
            other => {
                return Err(Error::Render(format!(
                    "rendered document is not an object: {other}"
                )))
            }
        }
    }
    Ok(objects)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_yaml_separates_documents() {
        let stream = b"apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n---\napiVersion: v1\nkind: Service\nmetadata:\n  name: b\n";
        let objects = split_yaml(stream).unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0]["kind"], "ConfigMap");
        assert_eq!(objects[1]["kind"], "Service");
    }

    #[test]
    fn split_yaml_drops_empty_documents() {
        let stream = b"---\n# only a comment\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n---\n";
        let objects = split_yaml(stream).unwrap();
        assert_eq!(objects.len(), 1);
    }

    #[test]
    fn split_yaml_rejects_scalars() {
        assert!(split_yaml(b"just a string\n").is_err());
    }
}
