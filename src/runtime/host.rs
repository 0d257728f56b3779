//! Host-executed services.
//!
//! A service flagged for host execution (or overridden with a local
//! binary) runs as an ordinary child process instead of a container. Its
//! arguments and environment are resolved with host placement, so `Dir`
//! becomes the on-disk artifact directory and ports become the reserved
//! host numbers. Stdout and stderr are teed into the service's log sink.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::runtime::logs::{pump, LogSink, LogStream};

/// Handle to a launched host process
#[derive(Debug)]
pub struct HostProcess {
    service: String,
    child: Child,
}

impl HostProcess {
    /// Spawn the binary with resolved arguments and environment, capturing
    /// output into the log sink.
    pub fn spawn(
        service: impl Into<String>,
        binary: &Path,
        args: &[String],
        env: &BTreeMap<String, String>,
        sink: &LogSink,
    ) -> Result<Self> {
        let service = service.into();
        let mut child = Command::new(binary)
            .args(args)
            .envs(env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::lifecycle(
                    &service,
                    format!("failed to spawn {}: {e}", binary.display()),
                )
            })?;

        if let Some(stdout) = child.stdout.take() {
            pump(stdout, sink.clone(), LogStream::Stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            pump(stderr, sink.clone(), LogStream::Stderr);
        }

        info!(service = %service, binary = %binary.display(), pid = child.id(), "launched host process");
        Ok(Self { service, child })
    }

    /// The service this process backs
    pub fn service(&self) -> &str {
        &self.service
    }

    /// OS process id, while the process is running
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Whether the process has exited, and with what code
    pub fn try_status(&mut self) -> Option<i32> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.code().unwrap_or(-1)),
            _ => None,
        }
    }

    /// Kill the process and reap it
    pub async fn kill(&mut self) {
        debug!(service = %self.service, "killing host process");
        if let Err(err) = self.child.kill().await {
            warn!(service = %self.service, error = %err, "failed to kill host process");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    #[tokio::test]
    async fn test_spawn_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LogSink::create(dir.path().join("echo.log")).await.unwrap();
        let args = vec!["hello from host".to_string()];
        let mut process = HostProcess::spawn(
            "echo",
            &PathBuf::from("/bin/echo"),
            &args,
            &BTreeMap::new(),
            &sink,
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(process.try_status(), Some(0));
        let body = tokio::fs::read_to_string(sink.path()).await.unwrap();
        assert!(body.contains("hello from host"));
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LogSink::create(dir.path().join("x.log")).await.unwrap();
        let err = HostProcess::spawn(
            "ghost",
            &PathBuf::from("/nonexistent/binary"),
            &[],
            &BTreeMap::new(),
            &sink,
        )
        .unwrap_err();
        assert_eq!(err.category(), "lifecycle");
    }

    #[tokio::test]
    async fn test_kill_long_running_process() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LogSink::create(dir.path().join("sleep.log")).await.unwrap();
        let args = vec!["60".to_string()];
        let mut process = HostProcess::spawn(
            "sleeper",
            &PathBuf::from("/bin/sleep"),
            &args,
            &BTreeMap::new(),
            &sink,
        )
        .unwrap();
        assert!(process.pid().is_some());
        process.kill().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(process.try_status().is_some());
    }
}
