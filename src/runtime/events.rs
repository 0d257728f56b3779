//! Container-engine lifecycle events.
//!
//! The runtime subscribes to `docker events` filtered by the session label
//! and translates the stream into readiness-gate transitions: `start`
//! marks a service started (and attaches its log follower), `die` marks it
//! failed with the container's exit code, and a healthy health-status
//! event marks it healthy. Events arrive in engine order, so per-service
//! transitions are consistent with what the engine observed.

use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::Arc;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::manifest::{LABEL_PLAYGROUND, LABEL_SERVICE, LABEL_SESSION};
use crate::readiness::ReadinessGate;
use crate::runtime::logs::{self, LogSink};

/// One event as printed by `docker events --format json`
#[derive(Debug, Clone, Deserialize)]
pub struct EngineEvent {
    /// Event type (`container`, `network`, ...)
    #[serde(rename = "Type")]
    pub event_type: String,
    /// Event action (`start`, `die`, `health_status: healthy`, ...)
    #[serde(rename = "Action")]
    pub action: String,
    /// The object the event concerns
    #[serde(rename = "Actor")]
    pub actor: EventActor,
}

/// Actor information for an engine event
#[derive(Debug, Clone, Deserialize)]
pub struct EventActor {
    /// Container ID
    #[serde(rename = "ID")]
    pub id: String,
    /// Attributes, including the container's labels
    #[serde(rename = "Attributes", default)]
    pub attributes: HashMap<String, String>,
}

impl EngineEvent {
    /// Parse one line of `docker events --format json` output
    pub fn parse(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line)?)
    }

    /// The service name from the container's session labels
    pub fn service(&self) -> Option<&str> {
        self.actor.attributes.get(LABEL_SERVICE).map(String::as_str)
    }

    /// The container's exit code, present on `die` events
    pub fn exit_code(&self) -> Option<i64> {
        self.actor
            .attributes
            .get("exitCode")
            .and_then(|c| c.parse().ok())
    }

    /// Whether this is a healthy health-status transition
    pub fn is_healthy(&self) -> bool {
        self.action.starts_with("health_status") && self.action.ends_with("healthy")
            && !self.action.ends_with("unhealthy")
    }
}

/// Watches the engine's event stream for one session and drives the gate.
pub struct EventWatcher {
    handle: JoinHandle<()>,
}

impl EventWatcher {
    /// Spawn `docker events` filtered to this session and start
    /// dispatching. For every `start` event a log follower is attached,
    /// teeing the container's output into the service's sink.
    pub fn spawn(
        session_id: &str,
        gate: Arc<ReadinessGate>,
        sinks: Arc<HashMap<String, LogSink>>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let playground_filter = format!("label={LABEL_PLAYGROUND}=true");
        let session_filter = format!("label={LABEL_SESSION}={session_id}");
        let mut child = Command::new("docker")
            .args([
                "events",
                "--format",
                "json",
                "--filter",
                playground_filter.as_str(),
                "--filter",
                session_filter.as_str(),
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| Error::custom(format!("failed to spawn docker events: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::custom("failed to capture docker events stdout"))?;

        let handle = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut following: HashSet<String> = HashSet::new();
            loop {
                tokio::select! {
                    line = lines.next_line() => {
                        match line {
                            Ok(Some(line)) => {
                                dispatch(&line, &gate, &sinks, &mut following);
                            }
                            Ok(None) => {
                                debug!("engine event stream closed");
                                break;
                            }
                            Err(err) => {
                                warn!(error = %err, "error reading engine events");
                                break;
                            }
                        }
                    }
                    () = cancel.cancelled() => {
                        trace!("event watcher cancelled");
                        break;
                    }
                }
            }
            let _ = child.kill().await;
        });

        Ok(Self { handle })
    }

    /// Stop the watcher
    pub fn abort(&self) {
        self.handle.abort();
    }
}

fn dispatch(
    line: &str,
    gate: &ReadinessGate,
    sinks: &HashMap<String, LogSink>,
    following: &mut HashSet<String>,
) {
    let event = match EngineEvent::parse(line) {
        Ok(event) => event,
        Err(err) => {
            // other event types (network create, volume mount) share the
            // stream; only malformed lines are worth a warning
            warn!(error = %err, line, "unparseable engine event");
            return;
        }
    };
    if event.event_type != "container" {
        return;
    }
    let Some(service) = event.service() else {
        return;
    };

    match event.action.as_str() {
        "start" => {
            gate.on_started(service);
            if following.insert(event.actor.id.clone()) {
                if let Some(sink) = sinks.get(service) {
                    if let Err(err) = logs::follow_container(&event.actor.id, sink.clone()) {
                        warn!(service, error = %err, "failed to attach log follower");
                    }
                }
            }
        }
        "die" => {
            let message = match event.exit_code() {
                Some(code) => format!("container exited with code {code}"),
                None => "container exited".to_string(),
            };
            gate.on_failed(service, message);
        }
        _ if event.is_healthy() => {
            gate.on_healthy(service);
        }
        action if action.starts_with("health_status") => {
            warn!(service, action, "health check regressed");
        }
        _ => {}
    }
}
