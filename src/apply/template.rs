//! Template backend: renders every manifest file in the package directory
//! with the instance's final values.

use std::path::Path;

use anyhow::{Context, Result};
use minijinja::Environment;
use walkdir::WalkDir;

use crate::api::Instance;

/// Render all `.yaml`/`.yml` files under `dir` and join them into one
/// stream. Files whose name starts with `_` are helpers and are skipped.
pub fn render_directory(instance: &Instance, dir: &Path) -> Result<Vec<u8>> {
    let mut env = Environment::new();
    env.set_undefined_behavior(minijinja::UndefinedBehavior::Chainable);

    let context = minijinja::context! {
        values => minijinja::Value::from_serialize(&instance.spec.values),
        instance => minijinja::context! {
            name => instance.metadata.name.clone().unwrap_or_default(),
            namespace => instance.metadata.namespace.clone().unwrap_or_default(),
        },
    };

    let mut documents = Vec::new();
    let mut entries: Vec<_> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            let name = e.file_name().to_string_lossy();
            !name.starts_with('_')
                && (name.ends_with(".yaml") || name.ends_with(".yml"))
        })
        .collect();
    entries.sort_by(|a, b| a.path().cmp(b.path()));

    for entry in entries {
        let source = std::fs::read_to_string(entry.path())
            .with_context(|| format!("read template {}", entry.path().display()))?;
        let rendered = env
            .render_str(&source, &context)
            .with_context(|| format!("render template {}", entry.path().display()))?;
        if rendered.trim().is_empty() {
            continue;
        }
        documents.push(rendered);
    }
    Ok(documents.join("\n---\n").into_bytes())
}
