//! Release-artifact resolution for host-executed services.
//!
//! A service flagged for host execution carries release metadata naming one
//! downloadable asset per platform. Binaries are cached under the state
//! root (`bin/<name>-<version>-<platform>`) and downloaded on first use.

use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::manifest::ReleaseArtifact;
use crate::session;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

fn http_client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(DOWNLOAD_TIMEOUT)
        .build()?)
}

/// Cache path for the release's binary on the running platform
pub fn cache_path(release: &ReleaseArtifact) -> Result<PathBuf> {
    let platform = ReleaseArtifact::current_platform();
    Ok(session::binary_cache_dir()?.join(release.cache_name(&platform)))
}

/// Verify the release binary is cached or downloadable, without fetching it.
///
/// # Errors
///
/// Returns [`Error::ArtifactFetch`] when no asset is registered for the
/// running platform or the release host does not serve it.
pub async fn check_available(release: &ReleaseArtifact) -> Result<()> {
    let cached = cache_path(release)?;
    if tokio::fs::metadata(&cached).await.is_ok() {
        return Ok(());
    }
    let platform = ReleaseArtifact::current_platform();
    let url = release.download_url(&platform).ok_or_else(|| {
        Error::artifact_fetch(
            &release.name,
            format!("no release asset registered for platform {platform}"),
        )
    })?;
    let response = http_client()?
        .head(&url)
        .send()
        .await
        .map_err(|e| Error::artifact_fetch(&release.name, e.to_string()))?;
    if !response.status().is_success() {
        return Err(Error::artifact_fetch(
            &release.name,
            format!("{url} returned {}", response.status()),
        ));
    }
    Ok(())
}

/// Return the path of the release binary for the running platform,
/// downloading and caching it if necessary.
pub async fn ensure(release: &ReleaseArtifact) -> Result<PathBuf> {
    let cached = cache_path(release)?;
    if tokio::fs::metadata(&cached).await.is_ok() {
        debug!(binary = %cached.display(), "release binary already cached");
        return Ok(cached);
    }

    let platform = ReleaseArtifact::current_platform();
    let url = release.download_url(&platform).ok_or_else(|| {
        Error::artifact_fetch(
            &release.name,
            format!("no release asset registered for platform {platform}"),
        )
    })?;
    info!(url = %url, "downloading release binary");

    let response = http_client()?
        .get(&url)
        .send()
        .await
        .map_err(|e| Error::artifact_fetch(&release.name, e.to_string()))?;
    if !response.status().is_success() {
        return Err(Error::artifact_fetch(
            &release.name,
            format!("{url} returned {}", response.status()),
        ));
    }
    let body = response
        .bytes()
        .await
        .map_err(|e| Error::artifact_fetch(&release.name, e.to_string()))?;

    if let Some(parent) = cached.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    // Write to a temp name first so a crashed download never leaves a
    // half-written binary under the cache name.
    let staging = cached.with_extension("partial");
    tokio::fs::write(&staging, &body).await?;
    set_executable(&staging).await?;
    tokio::fs::rename(&staging, &cached).await?;

    info!(binary = %cached.display(), size = body.len(), "cached release binary");
    Ok(cached)
}

#[cfg(unix)]
async fn set_executable(path: &std::path::Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = tokio::fs::metadata(path).await?.permissions();
    perms.set_mode(0o755);
    tokio::fs::set_permissions(path, perms).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_executable(_path: &std::path::Path) -> Result<()> {
    Ok(())
}
