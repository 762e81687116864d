//! Release storage.
//!
//! Each release revision is a versioned record persisted as one in-cluster
//! Secret, keyed by name+revision. The record is what makes pending-state
//! recovery possible: a stuck revision can be deleted from storage without
//! touching any deployed resource.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::core::ObjectMeta;
use kube::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use anyhow::{bail, Context, Result};

use crate::apply::helm::chart::ChartMetadata;

pub const STORAGE_SECRET_TYPE: &str = "bundler.dev/release.v1";
const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
const LABEL_RELEASE_NAME: &str = "bundler.dev/release-name";
const LABEL_RELEASE_REVISION: &str = "bundler.dev/release-revision";

/// Lifecycle of one stored revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReleaseStatus {
    Deployed,
    Failed,
    Superseded,
    Uninstalling,
    PendingInstall,
    PendingUpgrade,
    PendingRollback,
}

impl ReleaseStatus {
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            ReleaseStatus::PendingInstall
                | ReleaseStatus::PendingUpgrade
                | ReleaseStatus::PendingRollback
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseStatus::Deployed => "deployed",
            ReleaseStatus::Failed => "failed",
            ReleaseStatus::Superseded => "superseded",
            ReleaseStatus::Uninstalling => "uninstalling",
            ReleaseStatus::PendingInstall => "pending-install",
            ReleaseStatus::PendingUpgrade => "pending-upgrade",
            ReleaseStatus::PendingRollback => "pending-rollback",
        }
    }
}

impl std::fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One versioned release record.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRelease {
    pub name: String,
    pub namespace: String,
    /// 1-indexed revision, incremented on every install/upgrade attempt.
    pub revision: u32,
    pub status: ReleaseStatus,
    pub chart: ChartMetadata,
    /// User-supplied values (without chart defaults), compared on upgrade.
    #[serde(default)]
    pub values: Map<String, Value>,
    /// Rendered manifest of this revision.
    #[serde(default)]
    pub manifest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub first_deployed: DateTime<Utc>,
    pub last_deployed: DateTime<Utc>,
    /// Human-readable outcome of the last operation on this revision.
    #[serde(default)]
    pub description: String,
}

impl StoredRelease {
    pub fn storage_key(&self) -> String {
        storage_key(&self.name, self.revision)
    }
}

pub fn storage_key(name: &str, revision: u32) -> String {
    format!("dev.bundler.release.v1.{name}.v{revision}")
}

/// Secret-backed release storage.
#[derive(Clone)]
pub struct ReleaseStorage {
    client: Client,
}

impl ReleaseStorage {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn secrets_api(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn build_secret(&self, release: &StoredRelease) -> Result<Secret> {
        let encoded = serde_json::to_vec(release).context("encode release record")?;
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_MANAGED_BY.to_string(), "bundler".to_string());
        labels.insert(LABEL_RELEASE_NAME.to_string(), release.name.clone());
        labels.insert(
            LABEL_RELEASE_REVISION.to_string(),
            release.revision.to_string(),
        );
        let mut data = BTreeMap::new();
        data.insert("release".to_string(), ByteString(encoded));
        Ok(Secret {
            metadata: ObjectMeta {
                name: Some(release.storage_key()),
                namespace: Some(release.namespace.clone()),
                labels: Some(labels),
                ..Default::default()
            },
            type_: Some(STORAGE_SECRET_TYPE.to_string()),
            data: Some(data),
            ..Default::default()
        })
    }

    fn parse_secret(secret: &Secret) -> Result<StoredRelease> {
        let data = secret
            .data
            .as_ref()
            .and_then(|d| d.get("release"))
            .context("release secret missing 'release' data")?;
        serde_json::from_slice(&data.0).context("decode release record")
    }

    /// All revisions of a release, newest first.
    pub async fn history(&self, namespace: &str, name: &str) -> Result<Vec<StoredRelease>> {
        let selector = format!("{LABEL_MANAGED_BY}=bundler,{LABEL_RELEASE_NAME}={name}");
        let params = ListParams::default().labels(&selector);
        let secrets = self.secrets_api(namespace).list(&params).await?;
        let mut releases: Vec<StoredRelease> = secrets
            .items
            .iter()
            .filter_map(|s| Self::parse_secret(s).ok())
            .collect();
        releases.sort_by(|a, b| b.revision.cmp(&a.revision));
        Ok(releases)
    }

    /// Latest revision, or `None` when the release was never installed.
    pub async fn get_latest(&self, namespace: &str, name: &str) -> Result<Option<StoredRelease>> {
        Ok(self.history(namespace, name).await?.into_iter().next())
    }

    pub async fn create(&self, release: &StoredRelease) -> Result<()> {
        let api = self.secrets_api(&release.namespace);
        let secret = self.build_secret(release)?;
        match api.create(&PostParams::default(), &secret).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                bail!(
                    "release record {} already exists",
                    release.storage_key()
                )
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn update(&self, release: &StoredRelease) -> Result<()> {
        let api = self.secrets_api(&release.namespace);
        let mut secret = self.build_secret(release)?;
        // replace needs the live resourceVersion
        if let Ok(existing) = api.get(&release.storage_key()).await {
            secret.metadata.resource_version = existing.metadata.resource_version;
        }
        api.replace(&release.storage_key(), &PostParams::default(), &secret)
            .await?;
        Ok(())
    }

    /// Delete one revision record. This never touches deployed resources.
    pub async fn delete(&self, namespace: &str, name: &str, revision: u32) -> Result<()> {
        let api = self.secrets_api(namespace);
        match api
            .delete(&storage_key(name, revision), &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete_all(&self, namespace: &str, name: &str) -> Result<Vec<StoredRelease>> {
        let releases = self.history(namespace, name).await?;
        let api = self.secrets_api(namespace);
        for release in &releases {
            let _ = api
                .delete(&release.storage_key(), &DeleteParams::default())
                .await;
        }
        Ok(releases)
    }

    /// Drop superseded revisions beyond `max_history`, oldest first.
    pub async fn prune_history(&self, namespace: &str, name: &str, max_history: usize) -> Result<()> {
        let releases = self.history(namespace, name).await?;
        for release in releases.iter().skip(max_history) {
            self.delete(namespace, name, release.revision).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn release(revision: u32, status: ReleaseStatus) -> StoredRelease {
        StoredRelease {
            name: "myapp".into(),
            namespace: "default".into(),
            revision,
            status,
            chart: ChartMetadata {
                name: "demo".into(),
                version: "0.1.0".into(),
                ..Default::default()
            },
            values: Map::new(),
            manifest: String::new(),
            notes: None,
            first_deployed: Utc::now(),
            last_deployed: Utc::now(),
            description: String::new(),
        }
    }

    #[test]
    fn storage_key_encodes_name_and_revision() {
        assert_eq!(
            release(1, ReleaseStatus::Deployed).storage_key(),
            "dev.bundler.release.v1.myapp.v1"
        );
        assert_eq!(storage_key("other", 12), "dev.bundler.release.v1.other.v12");
    }

    #[test]
    fn pending_detection() {
        assert!(ReleaseStatus::PendingInstall.is_pending());
        assert!(ReleaseStatus::PendingUpgrade.is_pending());
        assert!(ReleaseStatus::PendingRollback.is_pending());
        assert!(!ReleaseStatus::Deployed.is_pending());
        assert!(!ReleaseStatus::Failed.is_pending());
        assert!(!ReleaseStatus::Uninstalling.is_pending());
    }

    #[test]
    fn record_round_trips_through_json() {
        let original = release(3, ReleaseStatus::PendingUpgrade);
        let bytes = serde_json::to_vec(&original).unwrap();
        let decoded: StoredRelease = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded.revision, 3);
        assert_eq!(decoded.status, ReleaseStatus::PendingUpgrade);
        assert_eq!(decoded.chart.name, "demo");
    }

    #[test]
    fn status_strings_are_kebab_case() {
        assert_eq!(
            serde_json::to_value(ReleaseStatus::PendingInstall).unwrap(),
            serde_json::json!("pending-install")
        );
        assert_eq!(ReleaseStatus::Uninstalling.to_string(), "uninstalling");
    }
}
