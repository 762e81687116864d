//! Chart loading and rendering.
//!
//! A chart directory carries `Chart.yaml` metadata, `values.yaml` defaults
//! and a `templates/` tree. Templates render with the merged values; files
//! whose name starts with `_` are helpers, and `NOTES.txt` renders into the
//! release notes instead of the manifest.

use std::path::Path;

use anyhow::{bail, Context, Result};
use minijinja::Environment;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use walkdir::WalkDir;

use crate::api::values::merge_maps;

/// Metadata from `Chart.yaml`.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChartMetadata {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub app_version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub home: String,
}

/// A chart loaded from disk.
#[derive(Debug, Clone)]
pub struct Chart {
    pub metadata: ChartMetadata,
    pub default_values: Map<String, Value>,
    /// (relative name, source) pairs under `templates/`.
    templates: Vec<(String, String)>,
}

/// Output of a render pass.
#[derive(Debug, Default)]
pub struct Rendered {
    pub manifest: String,
    pub notes: Option<String>,
}

impl Chart {
    pub fn load(dir: &Path) -> Result<Chart> {
        let metadata_path = dir.join("Chart.yaml");
        if !metadata_path.exists() {
            bail!("{} has no Chart.yaml", dir.display());
        }
        let metadata: ChartMetadata = serde_yaml::from_str(
            &std::fs::read_to_string(&metadata_path).context("read Chart.yaml")?,
        )
        .context("parse Chart.yaml")?;

        let default_values = match std::fs::read_to_string(dir.join("values.yaml")) {
            Ok(source) => match serde_yaml::from_str::<Value>(&source).context("parse values.yaml")? {
                Value::Null => Map::new(),
                Value::Object(map) => map,
                other => bail!("values.yaml is not a mapping: {other}"),
            },
            Err(_) => Map::new(),
        };

        let templates_dir = dir.join("templates");
        let mut templates = Vec::new();
        if templates_dir.exists() {
            let mut entries: Vec<_> = WalkDir::new(&templates_dir)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .collect();
            entries.sort_by(|a, b| a.path().cmp(b.path()));
            for entry in entries {
                let name = entry
                    .path()
                    .strip_prefix(&templates_dir)
                    .expect("walked under templates dir")
                    .to_string_lossy()
                    .to_string();
                let source = std::fs::read_to_string(entry.path())
                    .with_context(|| format!("read template {name}"))?;
                templates.push((name, source));
            }
        }

        Ok(Chart {
            metadata,
            default_values,
            templates,
        })
    }

    /// Effective values: chart defaults with `overrides` merged on top.
    pub fn merged_values(&self, overrides: &Map<String, Value>) -> Map<String, Value> {
        merge_maps(&self.default_values, overrides)
    }

    /// Render every manifest template with the given values.
    pub fn render(
        &self,
        release_name: &str,
        namespace: &str,
        values: &Map<String, Value>,
    ) -> Result<Rendered> {
        let mut env = Environment::new();
        env.set_undefined_behavior(minijinja::UndefinedBehavior::Chainable);
        for (name, source) in &self.templates {
            env.add_template_owned(name.clone(), source.clone())
                .with_context(|| format!("compile template {name}"))?;
        }

        let context = minijinja::context! {
            values => minijinja::Value::from_serialize(values),
            release => minijinja::context! {
                name => release_name,
                namespace => namespace,
                service => "bundler",
            },
            chart => minijinja::Value::from_serialize(&self.metadata),
        };

        let mut rendered = Rendered::default();
        let mut documents = Vec::new();
        for (name, _) in &self.templates {
            let file = Path::new(name)
                .file_name()
                .map(|f| f.to_string_lossy().to_string())
                .unwrap_or_default();
            if file.starts_with('_') {
                continue;
            }
            let output = env
                .get_template(name)
                .and_then(|t| t.render(&context))
                .with_context(|| format!("render template {name}"))?;
            if file.eq_ignore_ascii_case("NOTES.txt") {
                let notes = output.trim().to_string();
                if !notes.is_empty() {
                    rendered.notes = Some(notes);
                }
                continue;
            }
            if output.trim().is_empty() {
                continue;
            }
            documents.push(output);
        }
        rendered.manifest = documents.join("\n---\n");
        Ok(rendered)
    }
}
