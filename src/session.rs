//! Session identity and on-disk state layout.
//!
//! Every run of the playground is one session. Its generated files live
//! under `${XDG_STATE_HOME:-$HOME/.local/state}/builder-playground/sessions/
//! <session-id>/`: the compose document, the canonical manifest, the DOT
//! graph, and one log file per service.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Directory name of the state root under the XDG state home
const STATE_DIR_NAME: &str = "builder-playground";

/// State directory used by old releases, removed on sight
const LEGACY_STATE_DIR: &str = ".playground";

/// One end-to-end invocation: artifacts, manifest, running services.
#[derive(Debug, Clone)]
pub struct Session {
    id: String,
    root: PathBuf,
    artifact_dir: PathBuf,
}

impl Session {
    /// Create a session with a fresh identifier, materializing its state
    /// directory and removing the legacy state root if one is found.
    pub async fn create(artifact_dir: impl Into<PathBuf>) -> Result<Self> {
        let id = short_id();
        Self::with_id(id, artifact_dir).await
    }

    /// Create a session with an explicit identifier (used by tests)
    pub async fn with_id(id: impl Into<String>, artifact_dir: impl Into<PathBuf>) -> Result<Self> {
        let id = id.into();
        remove_legacy_state().await;
        let root = sessions_root()?.join(&id);
        tokio::fs::create_dir_all(&root).await?;
        tokio::fs::create_dir_all(root.join("logs")).await?;
        debug!(session = %id, root = %root.display(), "created session state directory");
        Ok(Self {
            id,
            root,
            artifact_dir: artifact_dir.into(),
        })
    }

    /// The session identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The session's state directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The artifact directory this session mounts
    pub fn artifact_dir(&self) -> &Path {
        &self.artifact_dir
    }

    /// Directory holding one log file per service
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Log sink path for one service
    pub fn log_path(&self, service: &str) -> PathBuf {
        self.logs_dir().join(format!("{service}.log"))
    }

    /// Path of the generated compose document
    pub fn compose_path(&self) -> PathBuf {
        self.root.join("docker-compose.yaml")
    }

    /// Per-session scratch directory backing a named volume
    pub fn volume_dir(&self, volume: &str) -> PathBuf {
        self.root.join("volumes").join(volume)
    }

    /// Name of the session's bridge network
    pub fn network_name(&self) -> String {
        format!("{STATE_DIR_NAME}-{}", self.id)
    }

    /// Delete the session's state directory
    pub async fn remove(&self) -> Result<()> {
        tokio::fs::remove_dir_all(&self.root).await?;
        Ok(())
    }
}

/// A short, log-friendly session identifier
fn short_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

/// The state root: `$XDG_STATE_HOME/builder-playground` or
/// `$HOME/.local/state/builder-playground`
pub fn state_root() -> Result<PathBuf> {
    if let Some(xdg) = std::env::var_os("XDG_STATE_HOME") {
        if !xdg.is_empty() {
            return Ok(PathBuf::from(xdg).join(STATE_DIR_NAME));
        }
    }
    let home = dirs::home_dir()
        .ok_or_else(|| Error::custom("cannot determine home directory"))?;
    Ok(home.join(".local").join("state").join(STATE_DIR_NAME))
}

/// The directory all sessions live under
pub fn sessions_root() -> Result<PathBuf> {
    Ok(state_root()?.join("sessions"))
}

/// Cache directory for downloaded release binaries
pub fn binary_cache_dir() -> Result<PathBuf> {
    Ok(state_root()?.join("bin"))
}

/// Count sessions that currently have state on disk. Used to offset the
/// port allocator's starting ranges between parallel sessions.
pub async fn count_sessions() -> usize {
    let Ok(root) = sessions_root() else {
        return 0;
    };
    let Ok(mut entries) = tokio::fs::read_dir(&root).await else {
        return 0;
    };
    let mut count = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
            count += 1;
        }
    }
    count
}

async fn remove_legacy_state() {
    let Some(home) = dirs::home_dir() else {
        return;
    };
    let legacy = home.join(LEGACY_STATE_DIR);
    if tokio::fs::metadata(&legacy).await.is_ok() {
        warn!(path = %legacy.display(), "removing legacy state directory");
        if let Err(err) = tokio::fs::remove_dir_all(&legacy).await {
            warn!(error = %err, "failed to remove legacy state directory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[tokio::test]
    #[serial]
    async fn test_session_layout() {
        let state = tempfile::tempdir().unwrap();
        std::env::set_var("XDG_STATE_HOME", state.path());

        let artifacts = tempfile::tempdir().unwrap();
        let session = Session::with_id("abc123", artifacts.path()).await.unwrap();

        assert_eq!(session.id(), "abc123");
        assert!(session.root().ends_with("builder-playground/sessions/abc123"));
        assert!(session.logs_dir().is_dir());
        assert_eq!(
            session.log_path("el"),
            session.root().join("logs").join("el.log")
        );
        assert!(session
            .compose_path()
            .ends_with("abc123/docker-compose.yaml"));
        assert_eq!(session.network_name(), "builder-playground-abc123");

        std::env::remove_var("XDG_STATE_HOME");
    }

    #[tokio::test]
    #[serial]
    async fn test_count_sessions() {
        let state = tempfile::tempdir().unwrap();
        std::env::set_var("XDG_STATE_HOME", state.path());

        let artifacts = tempfile::tempdir().unwrap();
        let _a = Session::with_id("s1", artifacts.path()).await.unwrap();
        let _b = Session::with_id("s2", artifacts.path()).await.unwrap();
        assert_eq!(count_sessions().await, 2);

        std::env::remove_var("XDG_STATE_HOME");
    }

    #[test]
    fn test_short_id_is_eight_hex_chars() {
        let id = short_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
