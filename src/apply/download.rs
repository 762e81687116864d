//! Package download and cache.
//!
//! Resolves `spec.url` into a local directory. `file://` URLs resolve
//! directly; `http(s)://` tarballs are fetched once per (name, version)
//! into a per-repo cache directory and unpacked.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use tar::Archive;
use tracing::info;

pub struct Downloader {
    cache_dir: PathBuf,
}

impl Downloader {
    pub fn new(cache_dir: &Path) -> Self {
        Self {
            cache_dir: cache_dir.to_path_buf(),
        }
    }

    /// Resolve `url` into the local directory holding the package, with
    /// `path` joined when non-empty.
    pub async fn download(&self, url: &str, name: &str, version: &str, path: &str) -> Result<PathBuf> {
        if let Some(local) = url.strip_prefix("file://") {
            let dir = join_path(Path::new(local), path);
            if !dir.exists() {
                bail!("package path {} does not exist", dir.display());
            }
            return Ok(dir);
        }
        if url.starts_with("http://") || url.starts_with("https://") {
            let unpacked = self.fetch_tarball(url, name, version).await?;
            let dir = join_path(&unpacked, path);
            if !dir.exists() {
                bail!("path {} not found in package {}", path, url);
            }
            return Ok(dir);
        }
        bail!("unsupported package url: {url}")
    }

    async fn fetch_tarball(&self, url: &str, name: &str, version: &str) -> Result<PathBuf> {
        let repo_dir = per_repo_cache_dir(url, &self.cache_dir);
        let dest = repo_dir.join(format!("{name}-{version}"));
        if dest.exists() {
            return Ok(dest);
        }

        info!(url, dest = %dest.display(), "fetching package archive");
        let response = reqwest::get(url).await.context("fetch archive")?;
        if !response.status().is_success() {
            bail!("fetch {url}: status {}", response.status());
        }
        let body = response.bytes().await.context("read archive body")?;

        // Unpack next to the destination, then rename into place so a
        // concurrent reader never sees a half-written directory.
        let staging = repo_dir.join(format!(".{name}-{version}.partial"));
        if staging.exists() {
            std::fs::remove_dir_all(&staging).context("clear stale staging dir")?;
        }
        std::fs::create_dir_all(&staging).context("create staging dir")?;
        let mut archive = Archive::new(GzDecoder::new(body.as_ref()));
        archive.unpack(&staging).context("unpack archive")?;
        std::fs::rename(&staging, &dest).context("move unpacked archive into cache")?;
        Ok(dest)
    }
}

/// Cache directory for one repository: the scheme is stripped and the
/// host/path of the URL becomes a subtree of the base directory.
pub fn per_repo_cache_dir(repo: &str, basedir: &Path) -> PathBuf {
    let trimmed = repo
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/');
    basedir.join(trimmed)
}

fn join_path(base: &Path, path: &str) -> PathBuf {
    if path.is_empty() {
        base.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_repo_cache_dir_strips_scheme() {
        let got = per_repo_cache_dir("https://foo.com/bar", Path::new("/app/plugins"));
        assert_eq!(got, PathBuf::from("/app/plugins/foo.com/bar"));
    }

    #[test]
    fn per_repo_cache_dir_trims_trailing_slash() {
        let got = per_repo_cache_dir("http://foo.com/bar/", Path::new("/cache"));
        assert_eq!(got, PathBuf::from("/cache/foo.com/bar"));
    }

    #[tokio::test]
    async fn file_url_resolves_directly() {
        let tmp = tempfile::tempdir().unwrap();
        let chart = tmp.path().join("chart");
        std::fs::create_dir_all(&chart).unwrap();

        let downloader = Downloader::new(Path::new("/unused"));
        let url = format!("file://{}", tmp.path().display());
        let got = downloader.download(&url, "demo", "v0.0.0", "chart").await.unwrap();
        assert_eq!(got, chart);
    }

    #[tokio::test]
    async fn missing_file_path_fails() {
        let downloader = Downloader::new(Path::new("/unused"));
        let err = downloader
            .download("file:///nonexistent/path", "demo", "v0.0.0", "")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[tokio::test]
    async fn unsupported_scheme_fails() {
        let downloader = Downloader::new(Path::new("/unused"));
        let err = downloader
            .download("s3://bucket/chart", "demo", "v1", "")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unsupported package url"));
    }
}
