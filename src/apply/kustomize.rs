//! Kustomize backend: the overlay renderer is the `kustomize` binary.

use std::path::Path;
use std::process::Command;

use anyhow::{bail, Context, Result};
use tracing::info;

/// Run `kustomize build` on the package directory and return the rendered
/// YAML stream.
pub fn kustomize_build(dir: &Path) -> Result<Vec<u8>> {
    if !dir.join("kustomization.yaml").exists() && !dir.join("kustomization.yml").exists() {
        bail!("no kustomization.yaml found in {}", dir.display());
    }
    info!("running kustomize build on {}", dir.display());
    let output = Command::new("kustomize")
        .arg("build")
        .arg(dir)
        .output()
        .context("execute kustomize build")?;
    if !output.status.success() {
        bail!(
            "kustomize build failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(output.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_kustomization_fails_before_spawning() {
        let tmp = tempfile::tempdir().unwrap();
        let err = kustomize_build(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("no kustomization.yaml"));
    }
}
