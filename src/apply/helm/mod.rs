//! Helm backend.
//!
//! Loads a chart from the package directory, renders it, and drives the
//! release workflow against secret-backed release storage: fresh install,
//! upgrade on drift, no-op when the deployed revision already matches, and
//! recovery of revisions stuck in a pending state.

pub mod chart;
pub mod storage;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use kube::Client;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::api::values::equal_values;
use crate::api::{Instance, InstanceOption, ManagedResource, Phase, Values};
use crate::apply::engine::{ClientApply, SyncOptions};
use crate::apply::{split_yaml, Materializer};
use crate::constants::{HELM_APPLY_TIMEOUT_SECS, HELM_MAX_HISTORY, HELM_REMOVE_TIMEOUT_SECS};
use crate::error::{Error, Result};

use chart::Chart;
use storage::{ReleaseStatus, ReleaseStorage, StoredRelease};

/// Options consumed from `spec.options`.
#[derive(Debug, Clone, PartialEq)]
pub struct HelmOptions {
    pub timeout: Duration,
    pub remove_timeout: Duration,
    pub max_history: usize,
    pub disable_hooks: bool,
    pub wait: bool,
    pub wait_for_jobs: bool,
    pub sub_notes: bool,
}

impl Default for HelmOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(HELM_APPLY_TIMEOUT_SECS),
            remove_timeout: Duration::from_secs(HELM_REMOVE_TIMEOUT_SECS),
            max_history: HELM_MAX_HISTORY,
            disable_hooks: false,
            wait: false,
            wait_for_jobs: false,
            sub_notes: false,
        }
    }
}

/// Parse the backend options; unknown names are an error.
pub fn parse_options(options: &[InstanceOption]) -> anyhow::Result<HelmOptions> {
    let mut parsed = HelmOptions::default();
    for opt in options {
        match opt.name.as_str() {
            "timeout" => {
                parsed.timeout = parse_duration(&opt.value)
                    .map_err(|e| anyhow::anyhow!("parse timeout: {e}"))?;
            }
            "maxHistory" => {
                parsed.max_history = opt
                    .value
                    .parse()
                    .map_err(|e| anyhow::anyhow!("parse maxHistory: {e}"))?;
            }
            "disableHooks" => parsed.disable_hooks = parse_bool(&opt.value, "disableHooks")?,
            "wait" => parsed.wait = parse_bool(&opt.value, "wait")?,
            "waitForJobs" => parsed.wait_for_jobs = parse_bool(&opt.value, "waitForJobs")?,
            "subNotes" => parsed.sub_notes = parse_bool(&opt.value, "subNotes")?,
            other => anyhow::bail!("unknown option: {other}"),
        }
    }
    Ok(parsed)
}

fn parse_bool(raw: &str, name: &str) -> anyhow::Result<bool> {
    raw.parse()
        .map_err(|e| anyhow::anyhow!("parse {name}: {e}"))
}

/// Parse durations like `600s`, `10m`, `1h30m` or a bare number of seconds.
pub fn parse_duration(raw: &str) -> anyhow::Result<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        anyhow::bail!("empty duration");
    }
    if let Ok(secs) = raw.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    let mut total = 0u64;
    let mut number = String::new();
    for c in raw.chars() {
        if c.is_ascii_digit() {
            number.push(c);
            continue;
        }
        let value: u64 = number
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid duration {raw}"))?;
        number.clear();
        let unit = match c {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            _ => anyhow::bail!("invalid duration unit {c} in {raw}"),
        };
        total += value * unit;
    }
    if !number.is_empty() {
        anyhow::bail!("trailing number without unit in {raw}");
    }
    Ok(Duration::from_secs(total))
}

/// References named by a rendered manifest, in document order.
pub fn parse_resource_references(manifest: &str, default_namespace: &str) -> Vec<ManagedResource> {
    let Ok(objects) = split_yaml(manifest.as_bytes()) else {
        return Vec::new();
    };
    objects
        .iter()
        .filter_map(ManagedResource::from_object)
        .map(|mut reference| {
            if reference.namespace.is_empty() {
                reference.namespace = default_namespace.to_string();
            }
            reference
        })
        .collect()
}

pub struct HelmApply {
    engine: ClientApply,
    storage: ReleaseStorage,
}

struct DeployOutcome {
    release: StoredRelease,
    managed: Vec<ManagedResource>,
}

impl HelmApply {
    pub fn new(client: Client) -> Self {
        Self {
            engine: ClientApply::new(client.clone()),
            storage: ReleaseStorage::new(client),
        }
    }

    /// Install a fresh revision: record goes in pending-install first, the
    /// manifest is applied, then the record flips to deployed.
    async fn install(
        &self,
        chart: &Chart,
        name: &str,
        namespace: &str,
        user_values: &Map<String, Value>,
        revision: u32,
        options: &HelmOptions,
    ) -> Result<DeployOutcome> {
        info!(%name, %namespace, revision, "installing release");
        let merged = chart.merged_values(user_values);
        let rendered = chart
            .render(name, namespace, &merged)
            .map_err(|e| Error::Render(format!("{e:#}")))?;

        let now = Utc::now();
        let mut record = StoredRelease {
            name: name.to_string(),
            namespace: namespace.to_string(),
            revision,
            status: ReleaseStatus::PendingInstall,
            chart: chart.metadata.clone(),
            values: user_values.clone(),
            manifest: rendered.manifest.clone(),
            notes: rendered.notes.clone(),
            first_deployed: now,
            last_deployed: now,
            description: "Initial install underway".to_string(),
        };
        self.storage
            .create(&record)
            .await
            .map_err(Error::Other)?;

        let outcome = self
            .deploy(&mut record, &[], options.timeout)
            .await?;
        Ok(outcome)
    }

    /// Upgrade from a previous revision, pruning everything the new
    /// manifest no longer declares.
    async fn upgrade(
        &self,
        chart: &Chart,
        previous: StoredRelease,
        user_values: &Map<String, Value>,
        options: &HelmOptions,
    ) -> Result<DeployOutcome> {
        let name = previous.name.clone();
        let namespace = previous.namespace.clone();
        info!(%name, %namespace, revision = previous.revision + 1, "upgrading release");

        let merged = chart.merged_values(user_values);
        let rendered = chart
            .render(&name, &namespace, &merged)
            .map_err(|e| Error::Render(format!("{e:#}")))?;

        let mut record = StoredRelease {
            name: name.clone(),
            namespace: namespace.clone(),
            revision: previous.revision + 1,
            status: ReleaseStatus::PendingUpgrade,
            chart: chart.metadata.clone(),
            values: user_values.clone(),
            manifest: rendered.manifest.clone(),
            notes: rendered.notes.clone(),
            first_deployed: previous.first_deployed,
            last_deployed: Utc::now(),
            description: "Upgrade underway".to_string(),
        };
        self.storage
            .create(&record)
            .await
            .map_err(Error::Other)?;

        let prior = parse_resource_references(&previous.manifest, &namespace);
        let outcome = self.deploy(&mut record, &prior, options.timeout).await?;

        // Retire the old revision and bound history.
        let mut previous = previous;
        previous.status = ReleaseStatus::Superseded;
        if let Err(e) = self.storage.update(&previous).await {
            warn!("marking previous revision superseded: {e:#}");
        }
        if let Err(e) = self
            .storage
            .prune_history(&namespace, &name, options.max_history)
            .await
        {
            warn!("pruning release history: {e:#}");
        }
        Ok(outcome)
    }

    /// Apply a pending record's manifest and flip it to deployed/failed.
    async fn deploy(
        &self,
        record: &mut StoredRelease,
        prior: &[ManagedResource],
        timeout: Duration,
    ) -> Result<DeployOutcome> {
        let objects = split_yaml(record.manifest.as_bytes())?;
        let sync_options = SyncOptions::default();
        let sync = self
            .engine
            .sync(&record.namespace, prior, objects, &sync_options);
        let outcome = match tokio::time::timeout(timeout, sync).await {
            Ok(result) => result?,
            Err(_) => {
                record.status = ReleaseStatus::Failed;
                record.description = format!("timed out after {}s", timeout.as_secs());
                let _ = self.storage.update(record).await;
                return Err(Error::Other(anyhow::anyhow!(
                    "release {} timed out after {}s",
                    record.name,
                    timeout.as_secs()
                )));
            }
        };

        let managed = outcome.managed.clone();
        if let Some(err) = outcome.into_error() {
            record.status = ReleaseStatus::Failed;
            record.description = err.to_string();
            let _ = self.storage.update(record).await;
            return Err(err);
        }

        record.status = ReleaseStatus::Deployed;
        record.last_deployed = Utc::now();
        record.description = if record.revision == 1 {
            "Install complete".to_string()
        } else {
            "Upgrade complete".to_string()
        };
        self.storage.update(record).await.map_err(Error::Other)?;
        Ok(DeployOutcome {
            release: record.clone(),
            managed,
        })
    }

    fn write_status(instance: &mut Instance, release: &StoredRelease, managed: Vec<ManagedResource>) {
        let status = instance.status.get_or_insert_with(Default::default);
        status.resources = managed;
        status.phase = Some(Phase::Installed);
        status.message = String::new();
        status.notes = release.notes.clone().unwrap_or_default();
        status.namespace = release.namespace.clone();
        status.values = Values(release.values.clone()).without_nulls();
        status.version = release.chart.version.clone();
        status.app_version = release.chart.app_version.clone();
        status.creation_timestamp = Some(release.first_deployed.to_rfc3339());
        status.upgrade_timestamp = Some(release.last_deployed.to_rfc3339());
        status.summary.clear();
        if !release.chart.description.is_empty() {
            status
                .summary
                .insert("description".to_string(), release.chart.description.clone());
        }
        if !release.chart.home.is_empty() {
            status
                .summary
                .insert("home".to_string(), release.chart.home.clone());
        }
    }
}

#[async_trait]
impl Materializer for HelmApply {
    async fn template(&self, instance: &Instance, location: &Path) -> Result<Vec<u8>> {
        let chart = Chart::load(location).map_err(|e| Error::Render(format!("{e:#}")))?;
        let name = instance.metadata.name.clone().unwrap_or_default();
        let namespace = instance.metadata.namespace.clone().unwrap_or_default();
        let merged = chart.merged_values(&instance.spec.values.0);
        let rendered = chart
            .render(&name, &namespace, &merged)
            .map_err(|e| Error::Render(format!("{e:#}")))?;
        Ok(rendered.manifest.into_bytes())
    }

    async fn apply(&self, instance: &mut Instance, location: &Path) -> Result<()> {
        let options = parse_options(&instance.spec.options)
            .map_err(|e| Error::Other(anyhow::anyhow!("parse options: {e:#}")))?;
        let chart = Chart::load(location)
            .map_err(|e| Error::Render(format!("load chart: {e:#}")))?;

        let name = instance.metadata.name.clone().unwrap_or_default();
        let namespace = instance.metadata.namespace.clone().unwrap_or_default();
        let user_values = instance.spec.values.0.clone();

        let existing = self
            .storage
            .get_latest(&namespace, &name)
            .await
            .map_err(Error::Other)?;

        let outcome = match existing {
            None => {
                self.install(&chart, &name, &namespace, &user_values, 1, &options)
                    .await?
            }
            Some(release) if release.status.is_pending() => {
                // Only the stuck record is deleted from storage; deployed
                // resources are untouched. A fresh install then re-applies
                // on top of whatever exists.
                info!(%name, status = %release.status, "release in pending state, attempting recovery");
                self.storage
                    .delete(&namespace, &name, release.revision)
                    .await
                    .map_err(|e| Error::PendingRelease {
                        name: name.clone(),
                        status: release.status.to_string(),
                        detail: format!("{e:#}"),
                    })?;
                self.install(
                    &chart,
                    &name,
                    &namespace,
                    &user_values,
                    release.revision + 1,
                    &options,
                )
                .await?
            }
            Some(release) if release.status == ReleaseStatus::Uninstalling => {
                return Err(Error::Other(anyhow::anyhow!(
                    "release {} is being uninstalled, retry later",
                    release.name
                )));
            }
            Some(release)
                if release.status == ReleaseStatus::Deployed
                    && release.chart.version == chart.metadata.version
                    && equal_values(&release.values, &user_values) =>
            {
                info!(%name, "release already up to date");
                let managed = match instance.status.as_ref() {
                    Some(s) if !s.resources.is_empty() => s.resources.clone(),
                    _ => parse_resource_references(&release.manifest, &namespace),
                };
                DeployOutcome { release, managed }
            }
            // Failed releases recover through the upgrade path.
            Some(release) => self.upgrade(&chart, release, &user_values, &options).await?,
        };

        if outcome.release.status != ReleaseStatus::Deployed {
            return Err(Error::Other(anyhow::anyhow!(
                "apply not finished: {}",
                outcome.release.description
            )));
        }
        Self::write_status(instance, &outcome.release, outcome.managed);
        Ok(())
    }

    async fn remove(&self, instance: &mut Instance) -> Result<()> {
        let name = instance.metadata.name.clone().unwrap_or_default();
        let namespace = instance.metadata.namespace.clone().unwrap_or_default();
        if instance
            .status
            .as_ref()
            .is_some_and(|s| s.phase == Some(Phase::Disabled))
        {
            info!(%name, "already removed or not installed");
            return Ok(());
        }
        let options = parse_options(&instance.spec.options)
            .map_err(|e| Error::Other(anyhow::anyhow!("parse options: {e:#}")))?;

        let Some(mut release) = self
            .storage
            .get_latest(&namespace, &name)
            .await
            .map_err(Error::Other)?
        else {
            let status = instance.status.get_or_insert_with(Default::default);
            status.phase = Some(Phase::Disabled);
            status.message = "release not installed".to_string();
            return Ok(());
        };

        info!(%name, %namespace, "uninstalling release");
        release.status = ReleaseStatus::Uninstalling;
        release.description = "Uninstall underway".to_string();
        self.storage.update(&release).await.map_err(Error::Other)?;

        let prior = parse_resource_references(&release.manifest, &namespace);
        let sync_options = SyncOptions::default();
        let sync = self
            .engine
            .sync(&namespace, &prior, Vec::new(), &sync_options);
        let outcome = match tokio::time::timeout(options.remove_timeout, sync).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::Other(anyhow::anyhow!(
                    "uninstall of {name} timed out after {}s",
                    options.remove_timeout.as_secs()
                )))
            }
        };

        let status = instance.status.get_or_insert_with(Default::default);
        status.resources = outcome.managed.clone();
        if let Some(err) = outcome.into_error() {
            return Err(err);
        }
        self.storage
            .delete_all(&namespace, &name)
            .await
            .map_err(Error::Other)?;
        status.phase = Some(Phase::Disabled);
        status.message = "Uninstall complete".to_string();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opt(name: &str, value: &str) -> InstanceOption {
        InstanceOption {
            name: name.into(),
            value: value.into(),
        }
    }

    #[test]
    fn parse_options_defaults() {
        let parsed = parse_options(&[]).unwrap();
        assert_eq!(parsed, HelmOptions::default());
        assert_eq!(parsed.timeout, Duration::from_secs(600));
        assert_eq!(parsed.remove_timeout, Duration::from_secs(300));
        assert_eq!(parsed.max_history, 5);
    }

    #[test]
    fn parse_options_overrides() {
        let parsed = parse_options(&[
            opt("timeout", "5m"),
            opt("maxHistory", "3"),
            opt("disableHooks", "true"),
            opt("wait", "true"),
            opt("waitForJobs", "false"),
            opt("subNotes", "true"),
        ])
        .unwrap();
        assert_eq!(parsed.timeout, Duration::from_secs(300));
        assert_eq!(parsed.max_history, 3);
        assert!(parsed.disable_hooks);
        assert!(parsed.wait);
        assert!(!parsed.wait_for_jobs);
        assert!(parsed.sub_notes);
    }

    #[test]
    fn parse_options_rejects_unknown_names_and_bad_values() {
        assert!(parse_options(&[opt("bogus", "1")]).is_err());
        assert!(parse_options(&[opt("maxHistory", "many")]).is_err());
        assert!(parse_options(&[opt("wait", "yes")]).is_err());
    }

    #[test]
    fn parse_duration_accepts_compound_forms() {
        assert_eq!(parse_duration("600s").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5x").is_err());
        assert!(parse_duration("5m30").is_err());
    }

    #[test]
    fn references_parsed_from_manifest_fill_namespace() {
        let manifest = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n---\napiVersion: v1\nkind: Service\nmetadata:\n  name: b\n  namespace: other\n";
        let refs = parse_resource_references(manifest, "default");
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].namespace, "default");
        assert_eq!(refs[1].namespace, "other");
    }
}
