//! The session manifest: an ordered collection of service descriptors.
//!
//! A recipe populates the manifest through [`Manifest::add_service`]; the
//! manifest validates every cross-service reference, dependency edge,
//! artifact mount, and host-execution prerequisite before anything is
//! launched, and serializes itself to the canonical `manifest.json`
//! consumed by companion tools.

mod service;

pub use service::{
    format_duration, ArtifactMount, Dependency, DependsCondition, Port, Protocol, ReadyCheck,
    ReadyProbe, ReleaseArtifact, Service, VolumeMount, LABEL_HOST_EXECUTION, LABEL_PLAYGROUND,
    LABEL_PORT_PREFIX, LABEL_SERVICE, LABEL_SESSION,
};

use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::artifacts;
use crate::component::Component;
use crate::error::{Error, Result};

/// Log verbosity recorded in the execution context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Errors only
    Error,
    /// Errors and warnings
    Warn,
    /// Normal operation
    #[default]
    Info,
    /// Verbose
    Debug,
    /// Everything
    Trace,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warn => write!(f, "warn"),
            Self::Info => write!(f, "info"),
            Self::Debug => write!(f, "debug"),
            Self::Trace => write!(f, "trace"),
        }
    }
}

/// Session-wide execution context carried by the manifest
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    /// Log level handed to services that accept one
    pub log_level: LogLevel,
    /// Free-form feature flags recipes may consult
    pub flags: BTreeMap<String, String>,
}

/// Ordered collection of service descriptors plus execution context.
///
/// The manifest exclusively owns its descriptors: lookup hands out borrows
/// and mutation is confined to building, before validation.
pub struct Manifest {
    id: String,
    name: String,
    artifact_dir: PathBuf,
    ctx: ExecutionContext,
    services: Vec<Service>,
    components: Vec<(String, Arc<dyn Component>)>,
}

impl fmt::Debug for Manifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manifest")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("services", &self.services.iter().map(|s| &s.name).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct ManifestDoc<'a> {
    id: &'a str,
    name: &'a str,
    services: &'a [Service],
}

impl Manifest {
    /// Create an empty manifest for a session
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        artifact_dir: impl Into<PathBuf>,
        ctx: ExecutionContext,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            artifact_dir: artifact_dir.into(),
            ctx,
            services: Vec::new(),
            components: Vec::new(),
        }
    }

    /// The session identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The recipe name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The artifact directory on the host
    pub fn artifact_dir(&self) -> &Path {
        &self.artifact_dir
    }

    /// The execution context
    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    /// All services, in registration order
    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub(crate) fn services_mut(&mut self) -> &mut [Service] {
        &mut self.services
    }

    /// The components that populated this manifest, in registration order
    pub fn components(&self) -> &[(String, Arc<dyn Component>)] {
        &self.components
    }

    /// Instantiate a descriptor with the given name and let the component
    /// populate it.
    ///
    /// # Errors
    ///
    /// Returns a `validation` error if the name is already registered.
    pub fn add_service(
        &mut self,
        name: impl Into<String>,
        component: Arc<dyn Component>,
    ) -> Result<()> {
        let name = name.into();
        if self.services.iter().any(|s| s.name == name) {
            return Err(Error::validation(format!(
                "service {name:?} is already registered"
            )));
        }
        debug!(service = %name, "adding service to manifest");
        let mut service = Service::new(&name);
        component.apply(&mut service);
        self.services.push(service);
        self.components.push((name, component));
        Ok(())
    }

    /// Look up a service by name
    pub fn service(&self, name: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Look up a service by name, failing if it is absent
    pub fn must_service(&self, name: &str) -> Result<&Service> {
        self.service(name)
            .ok_or_else(|| Error::validation(format!("unknown service {name:?}")))
    }

    /// Run every validation check.
    ///
    /// 1. Every reference targets a defined service exposing that port.
    /// 2. Every `healthy` dependency targets a service with a readiness
    ///    check.
    /// 3. Every artifact mount corresponds to a file on disk.
    /// 4. Every host-executed service has a release asset for the running
    ///    platform, cached or downloadable.
    ///
    /// Builder-time errors recorded on any descriptor surface here too.
    pub async fn validate(&self) -> Result<()> {
        for svc in &self.services {
            svc.check_build_errors()?;

            for reference in &svc.references {
                let target = self.service(&reference.target).ok_or_else(|| {
                    Error::validation(format!(
                        "service {} references unknown service {:?}",
                        svc.name, reference.target
                    ))
                })?;
                if target.port(&reference.port_name).is_none() {
                    return Err(Error::validation(format!(
                        "service {} references port {:?} which {:?} does not expose",
                        svc.name, reference.port_name, reference.target
                    )));
                }
            }

            for dep in &svc.dependencies {
                let target = self.service(&dep.target).ok_or_else(|| {
                    Error::validation(format!(
                        "service {} depends on unknown service {:?}",
                        svc.name, dep.target
                    ))
                })?;
                if dep.condition == DependsCondition::Healthy && !target.has_ready_check() {
                    return Err(Error::validation(format!(
                        "service {} requires {:?} healthy, but it declares no readiness check",
                        svc.name, dep.target
                    )));
                }
            }

            for mount in &svc.artifact_mounts {
                let path = self.artifact_dir.join(&mount.source);
                if tokio::fs::metadata(&path).await.is_err() {
                    return Err(Error::validation(format!(
                        "service {} mounts artifact {:?} which does not exist in {}",
                        svc.name,
                        mount.source,
                        self.artifact_dir.display()
                    )));
                }
            }

            if svc.is_host_executed() {
                let release = svc.release.as_ref().ok_or_else(|| {
                    Error::validation(format!(
                        "service {} requests host execution but carries no release metadata",
                        svc.name
                    ))
                })?;
                artifacts::check_available(release).await?;
            }
        }
        info!(services = self.services.len(), "manifest validated");
        Ok(())
    }

    /// Write the canonical JSON serialization to `dir/manifest.json`.
    ///
    /// This file is the single source of truth consumed by companion
    /// tools; its field names and ordering are stable.
    pub async fn save_json(&self, dir: &Path) -> Result<PathBuf> {
        let doc = ManifestDoc {
            id: &self.id,
            name: &self.name,
            services: &self.services,
        };
        let mut body = serde_json::to_string_pretty(&doc)?;
        body.push('\n');
        let path = dir.join("manifest.json");
        tokio::fs::write(&path, body).await?;
        debug!(path = %path.display(), "wrote manifest");
        Ok(path)
    }

    /// Render a DOT graph of the manifest: services with their ports,
    /// solid edges for dependencies, dashed edges for references.
    pub fn dot_graph(&self) -> String {
        let mut out = String::from("digraph manifest {\n  rankdir=LR;\n  node [shape=box];\n");
        for svc in &self.services {
            let ports = svc
                .ports
                .iter()
                .map(|p| format!("{}:{}/{}", p.name, p.number, p.protocol))
                .collect::<Vec<_>>()
                .join("\\n");
            let label = if ports.is_empty() {
                svc.name.clone()
            } else {
                format!("{}\\n{ports}", svc.name)
            };
            let _ = writeln!(out, "  \"{}\" [label=\"{label}\"];", svc.name);
        }
        for svc in &self.services {
            for dep in &svc.dependencies {
                let _ = writeln!(
                    out,
                    "  \"{}\" -> \"{}\" [label=\"{}\"];",
                    svc.name, dep.target, dep.condition
                );
            }
            for reference in &svc.references {
                let _ = writeln!(
                    out,
                    "  \"{}\" -> \"{}\" [style=dashed, label=\"{}\"];",
                    svc.name, reference.target, reference.port_name
                );
            }
        }
        out.push_str("}\n");
        out
    }

    /// Write the DOT graph to `dir/graph.dot`
    pub async fn save_dot_graph(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join("graph.dot");
        tokio::fs::write(&path, self.dot_graph()).await?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::FnComponent;

    fn manifest(dir: &Path) -> Manifest {
        Manifest::new("sess-1", "l1", dir, ExecutionContext::default())
    }

    #[tokio::test]
    async fn test_duplicate_service_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manifest(dir.path());
        m.add_service("el", Arc::new(FnComponent::new(|s| {
            s.with_image("reth");
        })))
        .unwrap();
        let err = m
            .add_service("el", Arc::new(FnComponent::new(|_| {})))
            .unwrap_err();
        assert_eq!(err.category(), "validation");
    }

    #[tokio::test]
    async fn test_reference_to_unknown_service_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manifest(dir.path());
        m.add_service("cl", Arc::new(FnComponent::new(|s| {
            s.with_image("lighthouse")
                .with_args(["--el", "{{Service \"el\" \"authrpc\" http}}"]);
        })))
        .unwrap();
        let err = m.validate().await.unwrap_err();
        assert_eq!(err.category(), "validation");
    }

    #[tokio::test]
    async fn test_reference_to_unknown_port_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manifest(dir.path());
        m.add_service("el", Arc::new(FnComponent::new(|s| {
            s.with_image("reth")
                .with_args(["--http.port", "{{Port \"http\" 8545}}"]);
        })))
        .unwrap();
        m.add_service("cl", Arc::new(FnComponent::new(|s| {
            s.with_image("lighthouse")
                .with_args(["--el", "{{Service \"el\" \"authrpc\" http}}"]);
        })))
        .unwrap();
        let err = m.validate().await.unwrap_err();
        assert!(err.to_string().contains("authrpc"));
    }

    #[tokio::test]
    async fn test_mutual_references_allowed() {
        // references are not dependencies; a builder and a sequencer may
        // exchange endpoints without forming a dependency cycle
        let dir = tempfile::tempdir().unwrap();
        let mut m = manifest(dir.path());
        m.add_service("a", Arc::new(FnComponent::new(|s| {
            s.with_image("a-img")
                .with_args(["--self", "{{Port \"api\" 9000}}"])
                .with_args(["--peer", "{{Service \"b\" \"api\"}}"]);
        })))
        .unwrap();
        m.add_service("b", Arc::new(FnComponent::new(|s| {
            s.with_image("b-img")
                .with_args(["--self", "{{Port \"api\" 9001}}"])
                .with_args(["--peer", "{{Service \"a\" \"api\"}}"]);
        })))
        .unwrap();
        m.validate().await.unwrap();
    }

    #[tokio::test]
    async fn test_healthy_dependency_requires_ready_check() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manifest(dir.path());
        m.add_service("el", Arc::new(FnComponent::new(|s| {
            s.with_image("reth");
        })))
        .unwrap();
        m.add_service("cl", Arc::new(FnComponent::new(|s| {
            s.with_image("lighthouse")
                .depends_on("el", DependsCondition::Healthy);
        })))
        .unwrap();
        let err = m.validate().await.unwrap_err();
        assert!(err.to_string().contains("readiness"));
    }

    #[tokio::test]
    async fn test_started_dependency_needs_no_check() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manifest(dir.path());
        m.add_service("el", Arc::new(FnComponent::new(|s| {
            s.with_image("reth");
        })))
        .unwrap();
        m.add_service("cl", Arc::new(FnComponent::new(|s| {
            s.with_image("lighthouse")
                .depends_on("el", DependsCondition::Started);
        })))
        .unwrap();
        m.validate().await.unwrap();
    }

    #[tokio::test]
    async fn test_artifact_mount_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manifest(dir.path());
        m.add_service("el", Arc::new(FnComponent::new(|s| {
            s.with_image("reth")
                .with_artifact("genesis.json", "/chain/genesis.json");
        })))
        .unwrap();
        let err = m.validate().await.unwrap_err();
        assert!(err.to_string().contains("genesis.json"));

        tokio::fs::write(dir.path().join("genesis.json"), "{}")
            .await
            .unwrap();
        m.validate().await.unwrap();
    }

    #[tokio::test]
    async fn test_host_execution_requires_release() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manifest(dir.path());
        m.add_service("el", Arc::new(FnComponent::new(|s| {
            s.with_image("reth").use_host_execution();
        })))
        .unwrap();
        let err = m.validate().await.unwrap_err();
        assert!(err.to_string().contains("release"));
    }

    #[tokio::test]
    async fn test_save_json_schema() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manifest(dir.path());
        m.add_service("el", Arc::new(FnComponent::new(|s| {
            s.with_image("reth")
                .with_tag("v1.0.0")
                .with_args(["--http.port", "{{Port \"http\" 8545}}"]);
        })))
        .unwrap();

        let path = m.save_json(dir.path()).await.unwrap();
        let body = tokio::fs::read_to_string(&path).await.unwrap();
        let doc: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(doc["id"], "sess-1");
        assert_eq!(doc["name"], "l1");
        assert_eq!(doc["services"][0]["name"], "el");
        assert_eq!(doc["services"][0]["image"], "reth");
        assert_eq!(doc["services"][0]["ports"][0]["name"], "http");
    }

    #[tokio::test]
    async fn test_dot_graph_edges() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manifest(dir.path());
        m.add_service("el", Arc::new(FnComponent::new(|s| {
            s.with_image("reth")
                .with_args(["--http.port", "{{Port \"http\" 8545}}"]);
        })))
        .unwrap();
        m.add_service("cl", Arc::new(FnComponent::new(|s| {
            s.with_image("lighthouse")
                .with_args(["--el", "{{Service \"el\" \"http\" http}}"])
                .depends_on("el", DependsCondition::Started);
        })))
        .unwrap();

        let dot = m.dot_graph();
        assert!(dot.contains("\"cl\" -> \"el\" [label=\"service_started\"]"));
        assert!(dot.contains("style=dashed"));
        assert!(dot.contains("http:8545/tcp"));
    }
}
