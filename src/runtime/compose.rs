//! Compose document generation.
//!
//! The validated manifest, the reserved port map, and the placement index
//! render into a typed compose model that serializes with serde_yaml. The
//! document is regenerated on every run and is not a persistent contract,
//! but it always: defines one bridge network named after the session,
//! labels every service with `playground=true` and `session=<id>`, mounts
//! the artifact directory at `/artifacts`, and emits a healthcheck clause
//! only when a readiness check is declared.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use crate::error::Result;
use crate::manifest::{
    format_duration, Manifest, Protocol, ReadyProbe, Service, LABEL_PLAYGROUND, LABEL_PORT_PREFIX,
    LABEL_SERVICE, LABEL_SESSION,
};
use crate::template::{self, PlacementIndex, PortMap, ResolveContext, CONTAINER_ARTIFACT_DIR, HOST_GATEWAY_NAME};

/// Inputs that shape the rendered document beyond the manifest itself
#[derive(Debug, Clone)]
pub struct ComposeParams {
    /// Name of the session bridge network
    pub network: String,
    /// Directory backing named volumes for this session
    pub volumes_dir: PathBuf,
    /// Publish ports on 127.0.0.1 only
    pub bind_loopback: bool,
}

/// A generated compose document
#[derive(Debug, Serialize)]
pub struct ComposeDocument {
    name: String,
    services: BTreeMap<String, ComposeService>,
    networks: BTreeMap<String, ComposeNetwork>,
}

#[derive(Debug, Serialize)]
struct ComposeService {
    image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    entrypoint: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    command: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    environment: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ports: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    volumes: Vec<String>,
    labels: BTreeMap<String, String>,
    networks: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    healthcheck: Option<ComposeHealthcheck>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    depends_on: BTreeMap<String, ComposeDependsOn>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    extra_hosts: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ComposeHealthcheck {
    test: Vec<String>,
    interval: String,
    timeout: String,
    retries: u32,
    start_period: String,
}

#[derive(Debug, Serialize)]
struct ComposeDependsOn {
    condition: String,
}

#[derive(Debug, Serialize)]
struct ComposeNetwork {
    driver: String,
}

impl ComposeDocument {
    /// Render the document for every container-executed service in the
    /// manifest. Host-executed services are left out entirely.
    pub fn generate(
        manifest: &Manifest,
        placements: &PlacementIndex,
        ports: &PortMap,
        params: &ComposeParams,
    ) -> Result<Self> {
        let mut services = BTreeMap::new();
        for svc in manifest.services() {
            if placements.is_host(&svc.name) {
                debug!(service = %svc.name, "host-executed, omitted from compose document");
                continue;
            }
            let entry = compose_service(svc, manifest, placements, ports, params)?;
            services.insert(svc.name.clone(), entry);
        }
        let mut networks = BTreeMap::new();
        networks.insert(
            params.network.clone(),
            ComposeNetwork {
                driver: "bridge".to_string(),
            },
        );
        Ok(Self {
            name: params.network.clone(),
            services,
            networks,
        })
    }

    /// Serialize to YAML
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Write the YAML document to `path`
    pub async fn write(&self, path: &Path) -> Result<()> {
        tokio::fs::write(path, self.to_yaml()?).await?;
        debug!(path = %path.display(), "wrote compose document");
        Ok(())
    }

    /// Service names present in the document
    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }
}

fn compose_service(
    svc: &Service,
    manifest: &Manifest,
    placements: &PlacementIndex,
    ports: &PortMap,
    params: &ComposeParams,
) -> Result<ComposeService> {
    let ctx = ResolveContext {
        service: &svc.name,
        artifact_dir: manifest.artifact_dir(),
        placements,
        ports,
    };

    let command = svc
        .args
        .iter()
        .map(|arg| template::second_pass(arg, &ctx))
        .collect::<Result<Vec<_>>>()?;

    let environment = svc
        .env
        .iter()
        .map(|(k, v)| Ok((k.clone(), template::second_pass(v, &ctx)?)))
        .collect::<Result<BTreeMap<_, _>>>()?;

    let mut published = Vec::new();
    for port in &svc.ports {
        let Some(host) = ports.get(&svc.name, &port.name).map(|b| b.host) else {
            continue;
        };
        let suffix = match port.protocol {
            Protocol::Tcp => "",
            Protocol::Udp => "/udp",
        };
        if params.bind_loopback {
            published.push(format!("127.0.0.1:{host}:{}{suffix}", port.number));
        } else {
            published.push(format!("{host}:{}{suffix}", port.number));
        }
    }

    let mut volumes = vec![format!(
        "{}:{CONTAINER_ARTIFACT_DIR}",
        manifest.artifact_dir().display()
    )];
    for mount in &svc.artifact_mounts {
        volumes.push(format!(
            "{}:{}:ro",
            manifest.artifact_dir().join(&mount.source).display(),
            mount.target
        ));
    }
    for mount in &svc.volume_mounts {
        volumes.push(format!(
            "{}:{}",
            params.volumes_dir.join(&mount.name).display(),
            mount.target
        ));
    }

    let mut labels = svc.labels.clone();
    labels.insert(LABEL_PLAYGROUND.to_string(), "true".to_string());
    labels.insert(LABEL_SESSION.to_string(), manifest.id().to_string());
    labels.insert(LABEL_SERVICE.to_string(), svc.name.clone());
    for port in &svc.ports {
        labels.insert(
            format!("{LABEL_PORT_PREFIX}{}", port.name),
            port.number.to_string(),
        );
    }

    let healthcheck = svc
        .ready_check
        .as_ref()
        .map(|check| -> Result<ComposeHealthcheck> {
            let test = match &check.probe {
                ReadyProbe::Exec { command } => {
                    let mut test = vec!["CMD".to_string()];
                    test.extend(command.iter().cloned());
                    test
                }
                ReadyProbe::Http { url } => {
                    let url = template::second_pass(url, &ctx)?;
                    vec![
                        "CMD-SHELL".to_string(),
                        format!("curl -fsS {url} > /dev/null || exit 1"),
                    ]
                }
            };
            Ok(ComposeHealthcheck {
                test,
                interval: format_duration(check.interval),
                timeout: format_duration(check.timeout),
                retries: check.retries,
                start_period: format_duration(check.start_period),
            })
        })
        .transpose()?;

    let mut depends_on = BTreeMap::new();
    for dep in &svc.dependencies {
        // The engine can only order containers; edges onto host processes
        // are enforced by launch order instead.
        if placements.is_host(&dep.target) {
            debug!(service = %svc.name, target = %dep.target, "dependency on host service not expressed in compose");
            continue;
        }
        depends_on.insert(
            dep.target.clone(),
            ComposeDependsOn {
                condition: dep.condition.to_string(),
            },
        );
    }

    // Docker on Linux does not define host.docker.internal; point it at
    // the bridge gateway so references to host services resolve.
    let extra_hosts = if cfg!(target_os = "linux") {
        vec![format!("{HOST_GATEWAY_NAME}:host-gateway")]
    } else {
        Vec::new()
    };

    Ok(ComposeService {
        image: format!("{}:{}", svc.image, svc.tag),
        entrypoint: svc.entrypoint.clone(),
        command,
        environment,
        ports: published,
        volumes,
        labels,
        networks: vec![params.network.clone()],
        healthcheck,
        depends_on,
        extra_hosts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::FnComponent;
    use crate::manifest::{DependsCondition, ExecutionContext, ReadyCheck};
    use crate::template::PortBinding;
    use std::sync::Arc;

    fn params() -> ComposeParams {
        ComposeParams {
            network: "builder-playground-test".to_string(),
            volumes_dir: PathBuf::from("/tmp/session/volumes"),
            bind_loopback: false,
        }
    }

    fn l1_manifest(dir: &Path) -> (Manifest, PortMap) {
        let mut manifest = Manifest::new("test", "l1", dir, ExecutionContext::default());
        manifest
            .add_service(
                "el",
                Arc::new(FnComponent::new(|s: &mut Service| {
                    s.with_image("ghcr.io/paradigmxyz/reth")
                        .with_tag("v1.0.0")
                        .with_args([
                            "node",
                            "--http.port",
                            "{{Port \"http\" 8545}}",
                            "--datadir",
                            "{{Dir}}",
                        ])
                        .with_volume("data", "/data")
                        .with_ready(ReadyCheck::http(
                            "http://localhost:{{Port \"http\" 8545}}",
                        ));
                })),
            )
            .unwrap();
        manifest
            .add_service(
                "cl",
                Arc::new(FnComponent::new(|s: &mut Service| {
                    s.with_image("sigp/lighthouse")
                        .with_tag("v5.0.0")
                        .with_args(["--el", "{{Service \"el\" \"http\" http}}"])
                        .depends_on("el", DependsCondition::Healthy);
                })),
            )
            .unwrap();

        let mut ports = PortMap::new();
        ports.insert(
            "el",
            "http",
            PortBinding {
                container: 8545,
                host: 32001,
            },
        );
        (manifest, ports)
    }

    #[test]
    fn test_generated_document_shape() {
        let dir = PathBuf::from("/tmp/artifacts");
        let (manifest, ports) = l1_manifest(&dir);
        let placements = PlacementIndex::new();
        let doc =
            ComposeDocument::generate(&manifest, &placements, &ports, &params()).unwrap();
        let yaml: serde_yaml::Value = serde_yaml::from_str(&doc.to_yaml().unwrap()).unwrap();

        let el = &yaml["services"]["el"];
        assert_eq!(el["image"], "ghcr.io/paradigmxyz/reth:v1.0.0");
        assert_eq!(el["command"][2], "8545");
        assert_eq!(el["command"][4], "/artifacts");
        assert_eq!(el["ports"][0], "32001:8545");
        assert_eq!(el["labels"]["playground"], "true");
        assert_eq!(el["labels"]["session"], "test");
        assert_eq!(el["labels"]["service"], "el");
        assert_eq!(el["labels"]["port.http"], "8545");
        assert_eq!(el["volumes"][0], "/tmp/artifacts:/artifacts");
        assert_eq!(el["volumes"][1], "/tmp/session/volumes/data:/data");
        assert!(el["healthcheck"]["test"][1]
            .as_str()
            .unwrap()
            .contains("http://localhost:8545"));

        let cl = &yaml["services"]["cl"];
        assert_eq!(cl["command"][1], "http://el:8545");
        assert_eq!(cl["depends_on"]["el"]["condition"], "service_healthy");
        // no readiness check declared, no healthcheck emitted
        assert!(cl.get("healthcheck").is_none());

        assert_eq!(
            yaml["networks"]["builder-playground-test"]["driver"],
            "bridge"
        );
    }

    #[test]
    fn test_host_service_omitted_and_gateway_used() {
        let dir = PathBuf::from("/tmp/artifacts");
        let (manifest, ports) = l1_manifest(&dir);
        let mut placements = PlacementIndex::new();
        placements.set_host("el");
        let doc =
            ComposeDocument::generate(&manifest, &placements, &ports, &params()).unwrap();
        let yaml: serde_yaml::Value = serde_yaml::from_str(&doc.to_yaml().unwrap()).unwrap();

        assert!(yaml["services"].get("el").is_none());
        let cl = &yaml["services"]["cl"];
        assert_eq!(cl["command"][1], "http://host.docker.internal:32001");
        // dependency on a host process cannot be expressed to the engine
        assert!(cl.get("depends_on").is_none());
    }

    #[test]
    fn test_loopback_binding() {
        let dir = PathBuf::from("/tmp/artifacts");
        let (manifest, ports) = l1_manifest(&dir);
        let placements = PlacementIndex::new();
        let mut p = params();
        p.bind_loopback = true;
        let doc = ComposeDocument::generate(&manifest, &placements, &ports, &p).unwrap();
        let yaml: serde_yaml::Value = serde_yaml::from_str(&doc.to_yaml().unwrap()).unwrap();
        assert_eq!(yaml["services"]["el"]["ports"][0], "127.0.0.1:32001:8545");
    }

    #[test]
    fn test_udp_port_suffix() {
        let dir = PathBuf::from("/tmp/artifacts");
        let mut manifest = Manifest::new("test", "l1", &dir, ExecutionContext::default());
        manifest
            .add_service(
                "el",
                Arc::new(FnComponent::new(|s: &mut Service| {
                    s.with_image("reth")
                        .with_args(["--discovery.port", "{{PortUDP \"disc\" 30303}}"]);
                })),
            )
            .unwrap();
        let mut ports = PortMap::new();
        ports.insert(
            "el",
            "disc",
            PortBinding {
                container: 30303,
                host: 33030,
            },
        );
        let placements = PlacementIndex::new();
        let doc =
            ComposeDocument::generate(&manifest, &placements, &ports, &params()).unwrap();
        let yaml: serde_yaml::Value = serde_yaml::from_str(&doc.to_yaml().unwrap()).unwrap();
        assert_eq!(yaml["services"]["el"]["ports"][0], "33030:30303/udp");
    }
}
