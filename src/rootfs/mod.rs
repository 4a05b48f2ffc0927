//! Sandbox root provisioning
//!
//! The committed root only ever appears through a staging directory plus one
//! atomic rename:
//!
//! ```text
//!   absent ──download──▶ rootfs.staging ──rename──▶ rootfs
//!                             │
//!                             └── any failure: staging deleted,
//!                                 prior committed root untouched
//! ```
//!
//! Provisioning is a no-op while the committed root exists; deleting the
//! directory is the only way to force a re-install. Callers serialize
//! provisioning runs; the existence check is the only guard.

pub mod archive;

pub use archive::{ArchiveFormat, UnpackStats};

use std::io;
use std::path::{Path, PathBuf};

use futures::StreamExt;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::config::Config;
use crate::context::Context;
use crate::images::ImageAsset;

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("download failed: {0}")]
    Download(#[from] reqwest::Error),

    #[error("archive entry escapes the staging root: {0}")]
    Traversal(PathBuf),

    #[error("unsupported archive format: {0}")]
    UnsupportedFormat(String),

    #[error("archive read failed: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("local archive not found: {0}")]
    MissingArchive(PathBuf),

    #[error("failed to promote staging root: {0}")]
    Promote(io::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Where the rootfs archive comes from
#[derive(Debug, Clone)]
pub enum ArchiveSource {
    /// Resolved remote image, downloaded before extraction
    Remote(ImageAsset),
    /// Pre-fetched archive on the local filesystem
    Local(PathBuf),
}

/// True once a committed sandbox root exists
pub fn is_provisioned(config: &Config) -> bool {
    config.rootfs_dir().exists()
}

/// Populate the committed sandbox root from `source`. Idempotent: returns
/// immediately, without touching the filesystem, when the committed root
/// already exists.
pub async fn provision(ctx: &Context, source: &ArchiveSource) -> Result<(), InstallError> {
    let committed = ctx.config.rootfs_dir();
    if committed.exists() {
        log::debug!("sandbox root already committed at {}", committed.display());
        return Ok(());
    }

    ctx.set_progress(0);

    let staging = ctx.config.staging_dir();
    if staging.exists() {
        log::warn!("removing stale staging root {}", staging.display());
        std::fs::remove_dir_all(&staging)?;
    }
    std::fs::create_dir_all(&staging)?;

    if let Err(err) = populate_staging(ctx, source, &staging).await {
        let _ = std::fs::remove_dir_all(&staging);
        return Err(err);
    }

    if let Err(err) = std::fs::rename(&staging, &committed) {
        let _ = std::fs::remove_dir_all(&staging);
        return Err(InstallError::Promote(err));
    }

    log::info!("sandbox root committed at {}", committed.display());
    ctx.set_progress(15);
    Ok(())
}

async fn populate_staging(
    ctx: &Context,
    source: &ArchiveSource,
    staging: &Path,
) -> Result<(), InstallError> {
    match source {
        ArchiveSource::Local(path) => {
            if !path.exists() {
                return Err(InstallError::MissingArchive(path.clone()));
            }
            ctx.set_progress(5);
            unpack_into(path.clone(), staging.to_path_buf()).await?;
            Ok(())
        }
        ArchiveSource::Remote(asset) => {
            let cached = ctx.config.cache_dir().join(remote_file_name(&asset.url));
            log::info!("downloading {} image from {}", asset.distro, asset.url);

            let downloaded = download(&asset.url, &cached).await;
            let result = match downloaded {
                Ok(bytes) => {
                    log::info!("downloaded {} ({} bytes)", cached.display(), bytes);
                    ctx.set_progress(5);
                    unpack_into(cached.clone(), staging.to_path_buf()).await
                }
                Err(err) => Err(err),
            };

            let _ = std::fs::remove_file(&cached);
            result
        }
    }
}

/// File name a remote archive is cached under
fn remote_file_name(url: &str) -> &str {
    url.rsplit('/')
        .find(|part| !part.is_empty())
        .unwrap_or("rootfs.tar.xz")
}

async fn download(url: &str, target: &Path) -> Result<u64, InstallError> {
    let client = reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(30))
        .build()?;
    let response = client.get(url).send().await?.error_for_status()?;

    let mut out = tokio::fs::File::create(target).await?;
    let mut stream = response.bytes_stream();
    let mut total: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        total += chunk.len() as u64;
        out.write_all(&chunk).await?;
    }
    out.flush().await?;

    Ok(total)
}

async fn unpack_into(archive_path: PathBuf, staging: PathBuf) -> Result<(), InstallError> {
    let stats = tokio::task::spawn_blocking(move || archive::unpack(&archive_path, &staging))
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;

    log::info!(
        "unpacked {} files, {} dirs, {} symlinks ({} entries skipped)",
        stats.files,
        stats.dirs,
        stats.symlinks,
        stats.skipped
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_file_name() {
        assert_eq!(
            remote_file_name("https://images.example.org/images/u/j/arm64/default/20240101/rootfs.tar.xz"),
            "rootfs.tar.xz"
        );
        assert_eq!(remote_file_name("https://example.org/base.zip"), "base.zip");
        assert_eq!(remote_file_name("https://example.org/dir/"), "dir");
    }

    #[test]
    fn test_is_provisioned() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = dir.path().to_path_buf();

        assert!(!is_provisioned(&config));
        std::fs::create_dir_all(config.rootfs_dir()).unwrap();
        assert!(is_provisioned(&config));
    }
}
