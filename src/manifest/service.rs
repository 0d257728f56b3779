//! Service descriptors and their fluent builder.
//!
//! A [`Service`] is the central value object of a session: container image,
//! arguments, environment, declared ports, cross-service references,
//! dependency edges, readiness check, and mounts. Recipes populate
//! descriptors through the fluent methods; every argument and environment
//! string passes through template pass 1 on the way in, so port and
//! reference declarations accumulate as a side effect of building.
//!
//! Programming errors made while building (malformed placeholders,
//! conflicting port declarations) are recorded on the descriptor and
//! surfaced by manifest validation before anything launches.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::template::{self, PortDecl, ServiceRef};

/// Label every session-managed container carries
pub const LABEL_PLAYGROUND: &str = "playground";
/// Label carrying the session identifier
pub const LABEL_SESSION: &str = "session";
/// Label carrying the service name
pub const LABEL_SERVICE: &str = "service";
/// Reserved label requesting host execution instead of a container
pub const LABEL_HOST_EXECUTION: &str = "host-execution";
/// Prefix for per-port labels (`port.<name>=<number>`)
pub const LABEL_PORT_PREFIX: &str = "port.";

/// Network protocol for declared ports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP protocol
    Tcp,
    /// UDP protocol
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

/// A port declared by a service.
///
/// `(name, protocol)` determines identity within the service; the host
/// number is stamped late, during port reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Port {
    /// Port name, unique within the service per protocol
    pub name: String,
    /// Container-internal port number
    #[serde(rename = "port")]
    pub number: u16,
    /// Port protocol
    pub protocol: Protocol,
    /// Reserved host port, populated during the runtime's plan phase
    #[serde(rename = "hostPort", skip_serializing_if = "Option::is_none")]
    pub host_number: Option<u16>,
}

/// Start-order condition for a dependency edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DependsCondition {
    /// The target container must have started
    #[serde(rename = "service_started")]
    Started,
    /// The target must have passed its readiness check
    #[serde(rename = "service_healthy")]
    Healthy,
}

impl fmt::Display for DependsCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started => write!(f, "service_started"),
            Self::Healthy => write!(f, "service_healthy"),
        }
    }
}

/// A dependency edge: this service starts after the target meets the condition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dependency {
    /// The depended-upon service
    #[serde(rename = "name")]
    pub target: String,
    /// Required condition on the target
    pub condition: DependsCondition,
}

/// The probe a readiness check runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ReadyProbe {
    /// HTTP GET that must return a success status. The URL may carry
    /// template placeholders and is resolved with the service's own
    /// placement, so an in-container probe sees container port numbers.
    Http {
        /// Probe URL
        url: String,
    },
    /// Command executed inside the container that must exit 0
    Exec {
        /// Command and arguments
        command: Vec<String>,
    },
}

/// Readiness check configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadyCheck {
    /// The probe to run
    #[serde(flatten)]
    pub probe: ReadyProbe,
    /// Time between probe attempts
    #[serde(serialize_with = "serialize_duration")]
    pub interval: Duration,
    /// Per-attempt timeout
    #[serde(serialize_with = "serialize_duration")]
    pub timeout: Duration,
    /// Failures tolerated before the service is marked unhealthy
    pub retries: u32,
    /// Grace period before failures count
    #[serde(rename = "startPeriod", serialize_with = "serialize_duration")]
    pub start_period: Duration,
}

impl ReadyCheck {
    /// HTTP probe with default timing
    pub fn http(url: impl Into<String>) -> Self {
        Self {
            probe: ReadyProbe::Http { url: url.into() },
            ..Self::default_timing()
        }
    }

    /// In-container command probe with default timing
    pub fn exec(command: Vec<String>) -> Self {
        Self {
            probe: ReadyProbe::Exec { command },
            ..Self::default_timing()
        }
    }

    fn default_timing() -> Self {
        Self {
            probe: ReadyProbe::Exec {
                command: Vec::new(),
            },
            interval: Duration::from_millis(500),
            timeout: Duration::from_secs(30),
            retries: 3,
            start_period: Duration::from_secs(0),
        }
    }

    /// Set the probe interval
    #[must_use]
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the per-attempt timeout
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the tolerated failure count
    #[must_use]
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Set the initial grace period
    #[must_use]
    pub fn start_period(mut self, start_period: Duration) -> Self {
        self.start_period = start_period;
        self
    }
}

fn serialize_duration<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&format_duration(*d))
}

/// Render a duration in the compose-friendly `500ms` / `30s` form
pub fn format_duration(d: Duration) -> String {
    let millis = d.as_millis();
    if millis % 1000 == 0 {
        format!("{}s", millis / 1000)
    } else {
        format!("{millis}ms")
    }
}

/// A read-only mount of a file from the artifact directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactMount {
    /// File name inside the artifact directory
    pub source: String,
    /// Path inside the container
    pub target: String,
}

/// A named volume mounted into the container, persistent within the session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeMount {
    /// Volume name
    pub name: String,
    /// Path inside the container
    pub target: String,
}

/// Release metadata for a host-executed service.
///
/// Describes where the native binary for the running platform can be
/// downloaded: one GitHub release asset per platform, keyed `os-arch`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReleaseArtifact {
    /// GitHub organization
    pub org: String,
    /// GitHub repository
    pub repo: String,
    /// Release version tag
    pub version: String,
    /// Binary name inside the release
    pub name: String,
    /// Platform (`os-arch`) to asset-suffix mapping
    pub assets: BTreeMap<String, String>,
}

impl ReleaseArtifact {
    /// Create release metadata
    pub fn new(
        org: impl Into<String>,
        repo: impl Into<String>,
        version: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            org: org.into(),
            repo: repo.into(),
            version: version.into(),
            name: name.into(),
            assets: BTreeMap::new(),
        }
    }

    /// Register the asset suffix for a platform (`os-arch`)
    #[must_use]
    pub fn asset(mut self, platform: impl Into<String>, suffix: impl Into<String>) -> Self {
        self.assets.insert(platform.into(), suffix.into());
        self
    }

    /// The `os-arch` key for the running platform
    pub fn current_platform() -> String {
        let arch = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            other => other,
        };
        format!("{}-{arch}", std::env::consts::OS)
    }

    /// Download URL for the given platform, if an asset is registered
    pub fn download_url(&self, platform: &str) -> Option<String> {
        let suffix = self.assets.get(platform)?;
        Some(format!(
            "https://github.com/{}/{}/releases/download/{}/{}-{}-{}",
            self.org, self.repo, self.version, self.name, self.version, suffix
        ))
    }

    /// Cache file name for the given platform
    pub fn cache_name(&self, platform: &str) -> String {
        format!("{}-{}-{platform}", self.name, self.version)
    }
}

/// A declarative description of one service in the session.
///
/// Built by a recipe component through the fluent methods, validated and
/// frozen by the manifest, then consumed by the runtime. The runtime only
/// writes back the late-bound host port numbers and the log-sink path.
#[derive(Debug, Serialize)]
pub struct Service {
    /// Unique service name, stable across the session
    pub name: String,
    /// Container image
    pub image: String,
    /// Image tag
    pub tag: String,
    /// Entrypoint override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<String>,
    /// Arguments, in canonical intermediate form
    pub args: Vec<String>,
    /// Environment variables, values in canonical intermediate form
    pub env: BTreeMap<String, String>,
    /// Declared ports
    pub ports: Vec<Port>,
    /// Declared dependency edges
    pub dependencies: Vec<Dependency>,
    /// Readiness check, if declared
    #[serde(rename = "readyCheck")]
    pub ready_check: Option<ReadyCheck>,
    /// Free-form labels
    pub labels: BTreeMap<String, String>,

    /// Declared cross-service references
    #[serde(skip)]
    pub references: Vec<ServiceRef>,
    /// Artifact-file mounts
    #[serde(skip)]
    pub artifact_mounts: Vec<ArtifactMount>,
    /// Named-volume mounts
    #[serde(skip)]
    pub volume_mounts: Vec<VolumeMount>,
    /// Release metadata, required for host execution
    #[serde(skip)]
    pub release: Option<ReleaseArtifact>,
    /// Per-service log sink, assigned by the runtime
    #[serde(skip)]
    pub log_path: Option<PathBuf>,

    // Programming errors accumulated while building, surfaced by validate().
    #[serde(skip)]
    pub(crate) build_errors: Vec<Error>,
}

impl Service {
    /// Create an empty descriptor with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: String::new(),
            tag: "latest".to_string(),
            entrypoint: None,
            args: Vec::new(),
            env: BTreeMap::new(),
            ports: Vec::new(),
            dependencies: Vec::new(),
            ready_check: None,
            labels: BTreeMap::new(),
            references: Vec::new(),
            artifact_mounts: Vec::new(),
            volume_mounts: Vec::new(),
            release: None,
            log_path: None,
            build_errors: Vec::new(),
        }
    }

    /// Set the container image
    pub fn with_image(&mut self, image: impl Into<String>) -> &mut Self {
        self.image = image.into();
        self
    }

    /// Set the image tag
    pub fn with_tag(&mut self, tag: impl Into<String>) -> &mut Self {
        self.tag = tag.into();
        self
    }

    /// Override the image entrypoint
    pub fn with_entrypoint(&mut self, entrypoint: impl Into<String>) -> &mut Self {
        self.entrypoint = Some(entrypoint.into());
        self
    }

    /// Append arguments. Each string runs through template pass 1 and its
    /// port/reference declarations are recorded.
    pub fn with_args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for arg in args {
            let arg = arg.into();
            match template::first_pass(&arg) {
                Ok(pass) => {
                    self.absorb_declarations(pass.ports, pass.references);
                    self.args.push(pass.rendered);
                }
                Err(err) => {
                    self.build_errors.push(err);
                    self.args.push(arg);
                }
            }
        }
        self
    }

    /// Replace the value following `flag` in the argument list, or append
    /// `flag value` if the flag is not present yet.
    pub fn with_replacement_arg(
        &mut self,
        flag: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        let flag = flag.into();
        let value = value.into();
        let rendered = match template::first_pass(&value) {
            Ok(pass) => {
                self.absorb_declarations(pass.ports, pass.references);
                pass.rendered
            }
            Err(err) => {
                self.build_errors.push(err);
                value
            }
        };
        if let Some(pos) = self.args.iter().position(|a| *a == flag) {
            if pos + 1 < self.args.len() {
                self.args[pos + 1] = rendered;
            } else {
                self.args.push(rendered);
            }
        } else {
            self.args.push(flag);
            self.args.push(rendered);
        }
        self
    }

    /// Set an environment variable. The value runs through pass 1.
    pub fn with_env(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let value = value.into();
        let rendered = match template::first_pass(&value) {
            Ok(pass) => {
                self.absorb_declarations(pass.ports, pass.references);
                pass.rendered
            }
            Err(err) => {
                self.build_errors.push(err);
                value
            }
        };
        self.env.insert(key.into(), rendered);
        self
    }

    /// Declare a TCP port explicitly, without a template occurrence
    pub fn with_port(&mut self, name: impl Into<String>, number: u16) -> &mut Self {
        self.declare_port(PortDecl {
            name: name.into(),
            number,
            protocol: Protocol::Tcp,
        });
        self
    }

    /// Declare a UDP port explicitly
    pub fn with_udp_port(&mut self, name: impl Into<String>, number: u16) -> &mut Self {
        self.declare_port(PortDecl {
            name: name.into(),
            number,
            protocol: Protocol::Udp,
        });
        self
    }

    /// Mount a file from the artifact directory, read-only
    pub fn with_artifact(
        &mut self,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> &mut Self {
        self.artifact_mounts.push(ArtifactMount {
            source: source.into(),
            target: target.into(),
        });
        self
    }

    /// Mount a named volume, persistent within the session
    pub fn with_volume(&mut self, name: impl Into<String>, target: impl Into<String>) -> &mut Self {
        self.volume_mounts.push(VolumeMount {
            name: name.into(),
            target: target.into(),
        });
        self
    }

    /// Declare the readiness check. An HTTP probe URL runs through pass 1.
    pub fn with_ready(&mut self, mut check: ReadyCheck) -> &mut Self {
        if let ReadyProbe::Http { url } = &check.probe {
            match template::first_pass(url) {
                Ok(pass) => {
                    self.absorb_declarations(pass.ports, pass.references);
                    check.probe = ReadyProbe::Http {
                        url: pass.rendered,
                    };
                }
                Err(err) => self.build_errors.push(err),
            }
        }
        self.ready_check = Some(check);
        self
    }

    /// Declare a dependency edge
    pub fn depends_on(
        &mut self,
        target: impl Into<String>,
        condition: DependsCondition,
    ) -> &mut Self {
        self.dependencies.push(Dependency {
            target: target.into(),
            condition,
        });
        self
    }

    /// Attach a free-form label
    pub fn with_label(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Request launch as a host process instead of a container.
    ///
    /// The descriptor must also carry release metadata
    /// ([`Self::with_release_artifact`]) so the runtime can fetch the
    /// native binary; validation enforces this.
    pub fn use_host_execution(&mut self) -> &mut Self {
        self.labels
            .insert(LABEL_HOST_EXECUTION.to_string(), "true".to_string());
        self
    }

    /// Attach release metadata for host execution
    pub fn with_release_artifact(&mut self, release: ReleaseArtifact) -> &mut Self {
        self.release = Some(release);
        self
    }

    /// Whether this service is launched as a host process
    pub fn is_host_executed(&self) -> bool {
        self.labels
            .get(LABEL_HOST_EXECUTION)
            .is_some_and(|v| v == "true")
    }

    /// Whether this service declares a readiness check
    pub fn has_ready_check(&self) -> bool {
        self.ready_check.is_some()
    }

    /// The declared port with the given name, if any
    pub fn port(&self, name: &str) -> Option<&Port> {
        self.ports.iter().find(|p| p.name == name)
    }

    /// Stamp the reserved host number onto a declared port.
    ///
    /// Written exactly once per port, during the runtime's plan phase.
    pub(crate) fn set_host_port(&mut self, name: &str, protocol: Protocol, host: u16) {
        if let Some(port) = self
            .ports
            .iter_mut()
            .find(|p| p.name == name && p.protocol == protocol)
        {
            port.host_number = Some(host);
        }
    }

    /// Attach the per-service log sink path
    pub(crate) fn attach_logs(&mut self, path: impl Into<PathBuf>) {
        self.log_path = Some(path.into());
    }

    /// The per-service log sink path, once the runtime has assigned it
    pub fn logs(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    /// Errors accumulated while building, if any
    pub(crate) fn check_build_errors(&self) -> Result<()> {
        if let Some(first) = self.build_errors.first() {
            return Err(Error::validation(format!(
                "service {}: {first}",
                self.name
            )));
        }
        Ok(())
    }

    fn absorb_declarations(&mut self, ports: Vec<PortDecl>, references: Vec<ServiceRef>) {
        for decl in ports {
            self.declare_port(decl);
        }
        for reference in references {
            if !self.references.contains(&reference) {
                self.references.push(reference);
            }
        }
    }

    fn declare_port(&mut self, decl: PortDecl) {
        if let Some(existing) = self
            .ports
            .iter()
            .find(|p| p.name == decl.name && p.protocol == decl.protocol)
        {
            // Re-declaring the same (name, protocol) is a no-op when the
            // number matches; a different number is a programming error.
            if existing.number != decl.number {
                self.build_errors.push(Error::validation(format!(
                    "port {:?} declared twice with numbers {} and {}",
                    decl.name, existing.number, decl.number
                )));
            }
            return;
        }
        self.ports.push(Port {
            name: decl.name,
            number: decl.number,
            protocol: decl.protocol,
            host_number: None,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_declare_ports_and_references() {
        let mut svc = Service::new("el");
        svc.with_image("ghcr.io/paradigmxyz/reth")
            .with_tag("v1.0.0")
            .with_args([
                "node",
                "--http.port",
                "{{Port \"http\" 8545}}",
                "--authrpc.port",
                "{{Port \"authrpc\" 8551}}",
            ])
            .with_env("RELAY_URL", "{{Service \"relay\" \"http\" http}}");

        assert_eq!(svc.ports.len(), 2);
        assert_eq!(svc.port("http").unwrap().number, 8545);
        assert_eq!(svc.port("authrpc").unwrap().number, 8551);
        assert_eq!(svc.references.len(), 1);
        assert_eq!(svc.references[0].target, "relay");
        assert!(svc.check_build_errors().is_ok());
    }

    #[test]
    fn test_redeclaring_same_port_is_noop() {
        let mut svc = Service::new("el");
        svc.with_args(["{{Port \"http\" 8545}}", "{{Port \"http\" 8545}}"]);
        assert_eq!(svc.ports.len(), 1);
        assert!(svc.check_build_errors().is_ok());
    }

    #[test]
    fn test_conflicting_port_number_is_recorded() {
        let mut svc = Service::new("el");
        svc.with_port("http", 8545).with_port("http", 9999);
        assert!(svc.check_build_errors().is_err());
    }

    #[test]
    fn test_same_name_different_protocol_allowed() {
        let mut svc = Service::new("el");
        svc.with_port("p2p", 30303).with_udp_port("p2p", 30303);
        assert_eq!(svc.ports.len(), 2);
        assert!(svc.check_build_errors().is_ok());
    }

    #[test]
    fn test_replacement_arg() {
        let mut svc = Service::new("el");
        svc.with_args(["--datadir", "/data", "--chain", "mainnet"]);
        svc.with_replacement_arg("--chain", "sepolia");
        assert_eq!(svc.args, vec!["--datadir", "/data", "--chain", "sepolia"]);
        svc.with_replacement_arg("--new-flag", "value");
        assert_eq!(svc.args[4], "--new-flag");
        assert_eq!(svc.args[5], "value");
    }

    #[test]
    fn test_malformed_placeholder_recorded() {
        let mut svc = Service::new("el");
        svc.with_args(["{{Port \"http\""]);
        assert!(svc.check_build_errors().is_err());
    }

    #[test]
    fn test_host_execution_label() {
        let mut svc = Service::new("el");
        assert!(!svc.is_host_executed());
        svc.use_host_execution();
        assert!(svc.is_host_executed());
        assert_eq!(svc.labels.get(LABEL_HOST_EXECUTION).unwrap(), "true");
    }

    #[test]
    fn test_ready_check_url_pass_one() {
        let mut svc = Service::new("el");
        svc.with_ready(ReadyCheck::http("http://localhost:{{Port \"http\" 8545}}/health"));
        assert_eq!(svc.port("http").unwrap().number, 8545);
    }

    #[test]
    fn test_release_artifact_urls() {
        let release = ReleaseArtifact::new("paradigmxyz", "reth", "v1.0.0", "reth")
            .asset("linux-amd64", "x86_64-unknown-linux-gnu")
            .asset("darwin-arm64", "aarch64-apple-darwin");
        assert_eq!(
            release.download_url("linux-amd64").unwrap(),
            "https://github.com/paradigmxyz/reth/releases/download/v1.0.0/reth-v1.0.0-x86_64-unknown-linux-gnu"
        );
        assert!(release.download_url("plan9-386").is_none());
        assert_eq!(release.cache_name("linux-amd64"), "reth-v1.0.0-linux-amd64");
    }

    #[test]
    fn test_manifest_json_shape() {
        let mut svc = Service::new("el");
        svc.with_image("reth").with_tag("v1.0.0").with_args([
            "--http.port",
            "{{Port \"http\" 8545}}",
        ]);
        svc.depends_on("cl", DependsCondition::Healthy);
        svc.set_host_port("http", Protocol::Tcp, 32000);

        let value = serde_json::to_value(&svc).unwrap();
        assert_eq!(value["name"], "el");
        assert_eq!(value["ports"][0]["port"], 8545);
        assert_eq!(value["ports"][0]["hostPort"], 32000);
        assert_eq!(value["ports"][0]["protocol"], "tcp");
        assert_eq!(value["dependencies"][0]["name"], "cl");
        assert_eq!(value["dependencies"][0]["condition"], "service_healthy");
        assert_eq!(value["readyCheck"], serde_json::Value::Null);
    }

    #[test]
    fn test_duration_formatting() {
        assert_eq!(format_duration(Duration::from_millis(500)), "500ms");
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(0)), "0s");
    }
}
