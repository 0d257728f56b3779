//! Per-service log capture.
//!
//! Every service gets one append-only log file under the session's `logs/`
//! directory. Container output is followed with `docker logs --follow`;
//! host-process output is piped straight from the child. Stdout and stderr
//! are demultiplexed line by line, each line tagged with its stream.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::error::{Error, Result};

/// Which stream a captured line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
}

impl LogStream {
    fn tag(self) -> &'static str {
        match self {
            Self::Stdout => "out",
            Self::Stderr => "err",
        }
    }
}

/// Handle to a per-service log file.
///
/// Cloneable; all clones feed the same writer task, which serializes
/// concurrent stdout/stderr lines into the file.
#[derive(Debug, Clone)]
pub struct LogSink {
    path: PathBuf,
    tx: mpsc::UnboundedSender<(LogStream, String)>,
}

impl LogSink {
    /// Create the log file (truncating any previous run) and start the
    /// writer task.
    pub async fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut file = tokio::fs::File::create(&path).await?;
        let (tx, mut rx) = mpsc::unbounded_channel::<(LogStream, String)>();
        let file_path = path.clone();
        tokio::spawn(async move {
            while let Some((stream, line)) = rx.recv().await {
                let tagged = format!("{} | {line}\n", stream.tag());
                if let Err(err) = file.write_all(tagged.as_bytes()).await {
                    warn!(path = %file_path.display(), error = %err, "log write failed");
                    return;
                }
            }
            let _ = file.flush().await;
        });
        Ok(Self { path, tx })
    }

    /// Path of the log file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line
    pub fn write_line(&self, stream: LogStream, line: impl Into<String>) {
        // The writer task only stops when every sender is gone, so a send
        // failure here means the file is already broken; drop the line.
        let _ = self.tx.send((stream, line.into()));
    }
}

/// Pump lines from an async reader into the sink until EOF
pub fn pump<R>(reader: R, sink: LogSink, stream: LogStream) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            sink.write_line(stream, line);
        }
        trace!(path = %sink.path().display(), "log pump finished");
    })
}

/// Attach a `docker logs --follow` tail to a container, teeing its stdout
/// and stderr into the sink. The follower runs until the container exits.
pub fn follow_container(container_id: &str, sink: LogSink) -> Result<JoinHandle<()>> {
    let mut child = Command::new("docker")
        .args(["logs", "--follow", container_id])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(Stdio::null())
        .spawn()
        .map_err(|e| Error::custom(format!("failed to spawn docker logs: {e}")))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::custom("failed to capture docker logs stdout"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::custom("failed to capture docker logs stderr"))?;

    let out_pump = pump(stdout, sink.clone(), LogStream::Stdout);
    let err_pump = pump(stderr, sink, LogStream::Stderr);

    Ok(tokio::spawn(async move {
        let _ = tokio::join!(out_pump, err_pump);
        let _ = child.wait().await;
    }))
}
