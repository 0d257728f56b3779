//! The orchestration runtime.
//!
//! Drives a validated manifest through its lifecycle: reserve host ports,
//! materialize the compose document, bring the composition up, launch
//! host-executed services, watch the engine's event stream, gate
//! readiness, run post-launch completion hooks, and tear everything down
//! on exit.

pub mod compose;
pub mod events;
pub mod host;
pub mod logs;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::artifacts;
use crate::component::ReadyContext;
use crate::error::{Error, Result};
use crate::manifest::{Manifest, ReadyProbe, LABEL_SESSION};
use crate::ports::PortAllocator;
use crate::readiness::ReadinessGate;
use crate::session::{self, Session};
use crate::shutdown::Shutdown;
use crate::template::{PlacementIndex, PortBinding, PortMap, ResolveContext};

use compose::{ComposeDocument, ComposeParams};
use events::EventWatcher;
use host::HostProcess;
use logs::LogSink;

/// Default deadline for [`Runtime::wait_for_ready`]
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(60);

/// Consecutive watchdog probe failures before a service is declared failed
const WATCHDOG_STRIKES: u32 = 3;

const WATCHDOG_INTERVAL: Duration = Duration::from_secs(5);

/// Caller-supplied replacement for one service
#[derive(Debug, Clone)]
pub enum ServiceOverride {
    /// Run a local executable on the host instead of the container
    HostBinary(PathBuf),
    /// Replace the image and tag in place
    Image {
        /// Replacement image
        image: String,
        /// Replacement tag
        tag: String,
    },
}

/// Options shaping a launch
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Publish container ports on 127.0.0.1 only
    pub bind_loopback: bool,
    /// Materialize the compose document and manifest, launch nothing
    pub dry_run: bool,
    /// Deadline for the readiness gate
    pub ready_timeout: Duration,
    /// Optional bound on the whole session
    pub session_timeout: Option<Duration>,
    /// Per-service overrides
    pub overrides: HashMap<String, ServiceOverride>,
    /// Keep polling HTTP readiness probes after the gate is satisfied
    pub watchdog: bool,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            bind_loopback: false,
            dry_run: false,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            session_timeout: None,
            overrides: HashMap::new(),
            watchdog: false,
        }
    }
}

/// Why [`Runtime::wait_for_exit`] returned
#[derive(Debug)]
pub enum ExitReason {
    /// The user requested shutdown
    Interrupted,
    /// A service failed after launch
    ServiceFailed(Error),
    /// The session timeout elapsed
    TimedOut,
}

/// The orchestration runtime for one session
pub struct Runtime {
    session: Session,
    manifest: Manifest,
    options: LaunchOptions,
    shutdown: Shutdown,
    gate: Arc<ReadinessGate>,
    placements: PlacementIndex,
    ports: PortMap,
    binaries: HashMap<String, PathBuf>,
    sinks: Arc<HashMap<String, LogSink>>,
    hosts: Vec<HostProcess>,
    watcher: Option<EventWatcher>,
    watcher_cancel: CancellationToken,
    exit_rx: Option<mpsc::UnboundedReceiver<Error>>,
    outputs: BTreeMap<String, String>,
}

impl Runtime {
    /// Create a runtime for a session and its manifest
    pub fn new(
        session: Session,
        manifest: Manifest,
        shutdown: Shutdown,
        options: LaunchOptions,
    ) -> Self {
        Self {
            session,
            manifest,
            options,
            shutdown,
            gate: Arc::new(ReadinessGate::new()),
            placements: PlacementIndex::new(),
            ports: PortMap::new(),
            binaries: HashMap::new(),
            sinks: Arc::new(HashMap::new()),
            hosts: Vec::new(),
            watcher: None,
            watcher_cancel: CancellationToken::new(),
            exit_rx: None,
            outputs: BTreeMap::new(),
        }
    }

    /// The session this runtime drives
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The manifest, ports stamped once the plan phase has run
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// The readiness gate
    pub fn gate(&self) -> &Arc<ReadinessGate> {
        &self.gate
    }

    /// Reserved port bindings, populated by the plan phase
    pub fn ports(&self) -> &PortMap {
        &self.ports
    }

    /// Placement of every service, populated by the plan phase
    pub fn placements(&self) -> &PlacementIndex {
        &self.placements
    }

    /// Outputs published by completion hooks
    pub fn outputs(&self) -> &BTreeMap<String, String> {
        &self.outputs
    }

    /// Validate, plan, materialize, and launch the session.
    ///
    /// With `dry_run` set this stops after writing the compose document,
    /// `manifest.json`, and `graph.dot`.
    pub async fn launch(&mut self) -> Result<()> {
        ensure_docker()?;
        self.apply_overrides()?;
        self.build_placements();
        self.manifest.validate().await?;

        // Phase A: reserve every host port before the document is written.
        let concurrent = session::count_sessions().await.saturating_sub(1);
        self.reserve_ports(&PortAllocator::with_session_offset(concurrent))?;
        self.resolve_binaries().await?;

        // Phase B: materialize the session's on-disk state.
        self.materialize().await?;
        if self.options.dry_run {
            info!(root = %self.session.root().display(), "dry run, nothing launched");
            return Ok(());
        }

        // Phase C: watcher first, so no start event is missed, then the
        // composition, then host processes.
        self.prepare_gate().await?;
        self.watcher = Some(EventWatcher::spawn(
            self.session.id(),
            Arc::clone(&self.gate),
            Arc::clone(&self.sinks),
            self.watcher_cancel.clone(),
        )?);
        self.compose_up().await?;
        self.launch_host_services()?;
        Ok(())
    }

    /// Phase D: block until every service is ready, then run each
    /// component's completion hook (phase E) and save published outputs.
    pub async fn wait_for_ready(&mut self) -> Result<()> {
        self.gate
            .wait_for_ready(self.options.ready_timeout, self.shutdown.graceful())
            .await?;
        info!("all services ready");

        let mut outputs = std::mem::take(&mut self.outputs);
        for (name, component) in self.manifest.components() {
            let svc = self.manifest.must_service(name)?;
            let mut ctx = ReadyContext::new(svc, &self.ports, &self.placements, &mut outputs);
            if let Err(err) = component.ready(&mut ctx).await {
                error!(service = %name, error = %err, "completion hook failed");
                self.outputs = outputs;
                return Err(err);
            }
        }
        self.outputs = outputs;
        self.save_outputs().await?;

        if self.options.watchdog {
            self.spawn_watchdog();
        }
        Ok(())
    }

    /// Phase F: block until the user interrupts, a service fails, or the
    /// session timeout elapses.
    pub async fn wait_for_exit(&mut self) -> ExitReason {
        let session_timeout = self.options.session_timeout;
        let graceful = self.shutdown.graceful().clone();
        let exit_rx = self.exit_rx.as_mut();
        tokio::select! {
            () = graceful.cancelled() => ExitReason::Interrupted,
            err = recv_exit(exit_rx) => ExitReason::ServiceFailed(err),
            () = sleep_opt(session_timeout) => ExitReason::TimedOut,
        }
    }

    /// Phase G: tear the session down. Containers are removed
    /// concurrently (with their volumes unless `keep` is set) and every
    /// host process is killed. A force signal during teardown abandons
    /// the wait.
    pub async fn stop(&mut self, keep: bool) -> Result<()> {
        info!(session = %self.session.id(), keep, "stopping session");
        self.watcher_cancel.cancel();
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }

        for process in &mut self.hosts {
            process.kill().await;
        }
        self.hosts.clear();

        let filter = format!("label={LABEL_SESSION}={}", self.session.id());
        let listed = docker(["ps", "-aq", "--filter", filter.as_str()]).await?;
        let ids: Vec<&str> = listed.split_whitespace().collect();
        debug!(containers = ids.len(), "removing session containers");

        let removals = ids.iter().copied().map(|id| {
            let mut args = vec!["rm", "-f"];
            if !keep {
                args.push("-v");
            }
            args.push(id);
            docker(args)
        });
        let removal = futures::future::join_all(removals);
        tokio::select! {
            results = removal => {
                for result in results {
                    if let Err(err) = result {
                        warn!(error = %err, "container removal failed");
                    }
                }
            }
            () = self.shutdown.force().cancelled() => {
                warn!("force shutdown requested, abandoning teardown wait");
                return Ok(());
            }
        }

        if !keep {
            let network = self.session.network_name();
            if let Err(err) = docker(["network", "rm", network.as_str()]).await {
                debug!(error = %err, "network removal failed (may not exist)");
            }
        }
        Ok(())
    }

    // ---- launch internals -------------------------------------------------

    fn apply_overrides(&mut self) -> Result<()> {
        for (name, service_override) in &self.options.overrides {
            let svc = self
                .manifest
                .services_mut()
                .iter_mut()
                .find(|s| s.name == *name)
                .ok_or_else(|| {
                    Error::validation(format!("override targets unknown service {name:?}"))
                })?;
            match service_override {
                ServiceOverride::Image { image, tag } => {
                    info!(service = %name, image = %image, tag = %tag, "image override");
                    svc.image = image.clone();
                    svc.tag = tag.clone();
                }
                ServiceOverride::HostBinary(path) => {
                    info!(service = %name, binary = %path.display(), "host-binary override");
                    if !path.is_file() {
                        return Err(Error::validation(format!(
                            "override binary {} does not exist",
                            path.display()
                        )));
                    }
                    self.binaries.insert(name.clone(), path.clone());
                }
            }
        }
        Ok(())
    }

    fn build_placements(&mut self) {
        let mut placements = PlacementIndex::new();
        for svc in self.manifest.services() {
            if svc.is_host_executed() {
                placements.set_host(&svc.name);
            }
        }
        for (name, service_override) in &self.options.overrides {
            if matches!(service_override, ServiceOverride::HostBinary(_)) {
                placements.set_host(name.clone());
            }
        }
        self.placements = placements;
    }

    fn reserve_ports(&mut self, allocator: &PortAllocator) -> Result<()> {
        let mut bindings = Vec::new();
        for svc in self.manifest.services() {
            // One host port per port name; a TCP/UDP pair sharing a name
            // shares its host number too.
            let mut seen: BTreeMap<&str, u16> = BTreeMap::new();
            for port in &svc.ports {
                if seen.contains_key(port.name.as_str()) {
                    continue;
                }
                let host = allocator.reserve(port.number)?;
                seen.insert(&port.name, host);
                bindings.push((svc.name.clone(), port.name.clone(), port.number, host));
            }
        }
        for (service, port_name, container, host) in bindings {
            self.ports
                .insert(&service, &port_name, PortBinding { container, host });
            if let Some(svc) = self
                .manifest
                .services_mut()
                .iter_mut()
                .find(|s| s.name == service)
            {
                for protocol in [crate::manifest::Protocol::Tcp, crate::manifest::Protocol::Udp] {
                    svc.set_host_port(&port_name, protocol, host);
                }
            }
            debug!(service, port = %port_name, host, "reserved host port");
        }
        Ok(())
    }

    async fn resolve_binaries(&mut self) -> Result<()> {
        for name in self
            .placements
            .host_services()
            .map(str::to_string)
            .collect::<Vec<_>>()
        {
            if self.binaries.contains_key(&name) {
                continue;
            }
            let svc = self.manifest.must_service(&name)?;
            let release = svc.release.as_ref().ok_or_else(|| {
                Error::validation(format!(
                    "service {name} requests host execution but carries no release metadata"
                ))
            })?;
            let path = artifacts::ensure(release).await?;
            self.binaries.insert(name, path);
        }
        Ok(())
    }

    async fn materialize(&self) -> Result<()> {
        for svc in self.manifest.services() {
            for mount in &svc.volume_mounts {
                tokio::fs::create_dir_all(self.session.volume_dir(&mount.name)).await?;
            }
        }
        let params = ComposeParams {
            network: self.session.network_name(),
            volumes_dir: self.session.root().join("volumes"),
            bind_loopback: self.options.bind_loopback,
        };
        let doc = ComposeDocument::generate(&self.manifest, &self.placements, &self.ports, &params)?;
        doc.write(&self.session.compose_path()).await?;
        self.manifest.save_json(self.session.root()).await?;
        self.manifest.save_dot_graph(self.session.root()).await?;
        Ok(())
    }

    async fn prepare_gate(&mut self) -> Result<()> {
        let mut sinks = HashMap::new();
        for svc in self.manifest.services() {
            let host = self.placements.is_host(&svc.name);
            self.gate.register(&svc.name, svc.has_ready_check(), host);
            let sink = LogSink::create(self.session.log_path(&svc.name)).await?;
            sinks.insert(svc.name.clone(), sink);
        }
        self.sinks = Arc::new(sinks);
        for svc in self.manifest.services_mut() {
            let path = self.session.log_path(&svc.name);
            svc.attach_logs(path);
        }
        self.exit_rx = self.gate.take_exit_receiver();
        Ok(())
    }

    async fn compose_up(&self) -> Result<()> {
        let compose_file = self.session.compose_path().display().to_string();
        let project = self.session.network_name();
        info!(file = %compose_file, "starting composition");
        let result = docker([
            "compose",
            "-f",
            compose_file.as_str(),
            "-p",
            project.as_str(),
            "up",
            "-d",
        ])
        .await;
        if let Err(err) = result {
            // best-effort cleanup of whatever the engine managed to start
            error!(error = %err, "compose up failed, cleaning up partial launch");
            let filter = format!("label={LABEL_SESSION}={}", self.session.id());
            if let Ok(listed) = docker(["ps", "-aq", "--filter", filter.as_str()]).await {
                for id in listed.split_whitespace() {
                    let _ = docker(["rm", "-f", "-v", id]).await;
                }
            }
            return Err(err);
        }
        Ok(())
    }

    fn launch_host_services(&mut self) -> Result<()> {
        let names: Vec<String> = self
            .manifest
            .services()
            .iter()
            .filter(|s| self.placements.is_host(&s.name))
            .map(|s| s.name.clone())
            .collect();
        for name in names {
            let svc = self.manifest.must_service(&name)?;
            let ctx = ResolveContext {
                service: &name,
                artifact_dir: self.manifest.artifact_dir(),
                placements: &self.placements,
                ports: &self.ports,
            };
            let args = svc
                .args
                .iter()
                .map(|arg| crate::template::second_pass(arg, &ctx))
                .collect::<Result<Vec<_>>>()?;
            let env = svc
                .env
                .iter()
                .map(|(k, v)| Ok((k.clone(), crate::template::second_pass(v, &ctx)?)))
                .collect::<Result<BTreeMap<_, _>>>()?;
            let binary = self.binaries.get(&name).ok_or_else(|| {
                Error::lifecycle(&name, "no resolved binary for host execution")
            })?;
            let sink = self
                .sinks
                .get(&name)
                .ok_or_else(|| Error::lifecycle(&name, "no log sink"))?;

            let process = HostProcess::spawn(&name, binary, &args, &env, sink)?;
            self.hosts.push(process);
            self.gate.on_started(&name);
        }
        Ok(())
    }

    async fn save_outputs(&self) -> Result<()> {
        if self.outputs.is_empty() {
            return Ok(());
        }
        let mut body = serde_json::to_string_pretty(&self.outputs)?;
        body.push('\n');
        tokio::fs::write(self.session.root().join("outputs.json"), body).await?;
        Ok(())
    }

    // Keeps polling HTTP readiness probes from the host side after the
    // gate is satisfied; sustained regression fails the service.
    fn spawn_watchdog(&self) {
        let mut probes = Vec::new();
        for svc in self.manifest.services() {
            let Some(check) = &svc.ready_check else {
                continue;
            };
            let ReadyProbe::Http { url } = &check.probe else {
                continue;
            };
            // resolve with the service itself placed host-side, so ports
            // become the published host numbers reachable from here
            let mut hostified = self.placements.clone();
            hostified.set_host(&svc.name);
            let ctx = ResolveContext {
                service: &svc.name,
                artifact_dir: self.manifest.artifact_dir(),
                placements: &hostified,
                ports: &self.ports,
            };
            match crate::template::second_pass(url, &ctx) {
                Ok(resolved) => probes.push((svc.name.clone(), resolved)),
                Err(err) => warn!(service = %svc.name, error = %err, "watchdog cannot resolve probe"),
            }
        }
        if probes.is_empty() {
            return;
        }

        let gate = Arc::clone(&self.gate);
        let cancel = self.watcher_cancel.clone();
        tokio::spawn(async move {
            let client = match reqwest::Client::builder()
                .timeout(Duration::from_secs(2))
                .build()
            {
                Ok(client) => client,
                Err(err) => {
                    warn!(error = %err, "watchdog disabled");
                    return;
                }
            };
            let mut strikes: HashMap<String, u32> = HashMap::new();
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(WATCHDOG_INTERVAL) => {}
                }
                for (service, url) in &probes {
                    let healthy = matches!(
                        client.get(url).send().await,
                        Ok(resp) if resp.status().is_success()
                    );
                    let count = strikes.entry(service.clone()).or_insert(0);
                    if healthy {
                        *count = 0;
                    } else {
                        *count += 1;
                        if *count == WATCHDOG_STRIKES {
                            gate.on_failed(service, "readiness probe regressed");
                        }
                    }
                }
            }
        });
    }
}

async fn recv_exit(rx: Option<&mut mpsc::UnboundedReceiver<Error>>) -> Error {
    match rx {
        Some(rx) => match rx.recv().await {
            Some(err) => err,
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

async fn sleep_opt(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}

/// Verify the container engine binary is reachable
pub fn ensure_docker() -> Result<()> {
    which::which("docker").map_err(|_| Error::DockerNotFound)?;
    Ok(())
}

async fn docker<I, S>(args: I) -> Result<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let args: Vec<String> = args.into_iter().map(|a| a.as_ref().to_string()).collect();
    let output = Command::new("docker")
        .args(&args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| Error::custom(format!("failed to execute docker: {e}")))?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    if !output.status.success() {
        return Err(Error::launch_failed(
            format!("docker {}", args.join(" ")),
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stderr).to_string(),
        ));
    }
    Ok(stdout)
}
