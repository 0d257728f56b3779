//! Two-pass placeholder resolution for service arguments and environment.
//!
//! Argument strings carry placeholders for values that are not known when a
//! recipe is written: ports the service itself exposes, endpoints of other
//! services, and the artifact directory. Pass 1 runs at build time, records
//! the declarations the placeholders imply, and rewrites the string into a
//! canonical intermediate form. Pass 2 runs at launch time, once host ports
//! have been reserved and service placement is known, and substitutes the
//! concrete values.
//!
//! Placeholder grammar:
//!
//! ```text
//! {{Port "rpc" 8545}}             declare a TCP port named "rpc", default 8545
//! {{PortUDP "disc" 30303}}        declare a UDP port
//! {{Service "el" "authrpc"}}      reference el's "authrpc" port, bare host:port
//! {{Service "el" "authrpc" http}} same, rendered as http://host:port
//! {{Dir}}                         the artifact directory as seen by the service
//! ```

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::manifest::Protocol;

/// Artifact directory path as mounted inside every container
pub const CONTAINER_ARTIFACT_DIR: &str = "/artifacts";

/// Hostname under which containers reach services on the host
pub const HOST_GATEWAY_NAME: &str = "host.docker.internal";

/// A port declaration collected during pass 1
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortDecl {
    /// Port name, unique within the declaring service per protocol
    pub name: String,
    /// Container-internal port number
    pub number: u16,
    /// Port protocol
    pub protocol: Protocol,
}

/// A cross-service reference collected during pass 1
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceRef {
    /// The referenced service
    pub target: String,
    /// The referenced port name
    pub port_name: String,
}

/// One parsed placeholder expression
#[derive(Debug, Clone, PartialEq, Eq)]
enum Placeholder {
    Port {
        name: String,
        number: u16,
        protocol: Protocol,
    },
    Service {
        target: String,
        port_name: String,
        http: bool,
    },
    Dir,
}

/// A parsed fragment of an input string
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(Placeholder),
}

/// Where a service runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Inside the container engine, on the session bridge network
    Container,
    /// As a native child process on the host
    Host,
}

/// The single source of truth for service placement.
///
/// Every URL, port, and path derivation routes through this index rather
/// than scattering host checks through the runtime.
#[derive(Debug, Clone, Default)]
pub struct PlacementIndex {
    host: HashSet<String>,
}

impl PlacementIndex {
    /// Create an index with every service placed in a container
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a service as host-executed
    pub fn set_host(&mut self, service: impl Into<String>) {
        self.host.insert(service.into());
    }

    /// Whether the named service runs on the host
    pub fn is_host(&self, service: &str) -> bool {
        self.host.contains(service)
    }

    /// Placement of the named service
    pub fn placement(&self, service: &str) -> Placement {
        if self.is_host(service) {
            Placement::Host
        } else {
            Placement::Container
        }
    }

    /// Names of all host-executed services
    pub fn host_services(&self) -> impl Iterator<Item = &str> {
        self.host.iter().map(String::as_str)
    }
}

/// Reserved host ports, keyed by `(service, port name)`
#[derive(Debug, Clone, Default)]
pub struct PortMap {
    entries: HashMap<(String, String), PortBinding>,
}

/// The two numbers a declared port resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortBinding {
    /// Container-internal port number
    pub container: u16,
    /// Host-side reserved port number
    pub host: u16,
}

impl PortMap {
    /// Create an empty port map
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the binding for a service's named port
    pub fn insert(
        &mut self,
        service: impl Into<String>,
        port: impl Into<String>,
        binding: PortBinding,
    ) {
        self.entries.insert((service.into(), port.into()), binding);
    }

    /// Look up the binding for a service's named port
    pub fn get(&self, service: &str, port: &str) -> Option<PortBinding> {
        self.entries
            .get(&(service.to_string(), port.to_string()))
            .copied()
    }

    /// All reserved host ports
    pub fn host_ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.entries.values().map(|b| b.host)
    }
}

/// Runtime context for pass 2 substitution
#[derive(Debug, Clone)]
pub struct ResolveContext<'a> {
    /// Name of the service whose strings are being resolved
    pub service: &'a str,
    /// Host path of the artifact directory
    pub artifact_dir: &'a Path,
    /// Placement of every service in the session
    pub placements: &'a PlacementIndex,
    /// Reserved port bindings for every declared port
    pub ports: &'a PortMap,
}

/// Result of running pass 1 over one string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirstPass {
    /// The canonical intermediate form, placeholders preserved
    pub rendered: String,
    /// Port declarations found in the string
    pub ports: Vec<PortDecl>,
    /// Service references found in the string
    pub references: Vec<ServiceRef>,
}

/// Run pass 1: collect declarations and canonicalize the string.
///
/// Idempotent: feeding the `rendered` output back in yields the same
/// declarations and the same string.
///
/// # Errors
///
/// Returns [`Error::TemplateParse`] for unterminated or malformed
/// placeholders.
pub fn first_pass(input: &str) -> Result<FirstPass> {
    let segments = scan(input)?;
    let mut ports = Vec::new();
    let mut references = Vec::new();
    for segment in &segments {
        match segment {
            Segment::Placeholder(Placeholder::Port {
                name,
                number,
                protocol,
            }) => ports.push(PortDecl {
                name: name.clone(),
                number: *number,
                protocol: *protocol,
            }),
            Segment::Placeholder(Placeholder::Service {
                target, port_name, ..
            }) => references.push(ServiceRef {
                target: target.clone(),
                port_name: port_name.clone(),
            }),
            _ => {}
        }
    }
    Ok(FirstPass {
        rendered: render(&segments),
        ports,
        references,
    })
}

/// Run pass 2: substitute concrete values for every placeholder.
///
/// # Errors
///
/// Returns [`Error::Validation`] when a referenced service or port has no
/// reserved binding, and [`Error::TemplateParse`] if the intermediate form
/// is malformed (which indicates a bug in pass 1, not user input).
pub fn second_pass(input: &str, ctx: &ResolveContext<'_>) -> Result<String> {
    let segments = scan(input)?;
    let caller = ctx.placements.placement(ctx.service);
    let mut out = String::with_capacity(input.len());
    for segment in segments {
        match segment {
            Segment::Literal(text) => out.push_str(&text),
            Segment::Placeholder(Placeholder::Dir) => {
                out.push_str(&artifact_path(caller, ctx.artifact_dir).to_string_lossy());
            }
            Segment::Placeholder(Placeholder::Port { name, number, .. }) => {
                let value = match caller {
                    Placement::Container => number,
                    Placement::Host => ctx
                        .ports
                        .get(ctx.service, &name)
                        .map(|b| b.host)
                        .ok_or_else(|| {
                            Error::validation(format!(
                                "no host port reserved for {}.{name}",
                                ctx.service
                            ))
                        })?,
                };
                out.push_str(&value.to_string());
            }
            Segment::Placeholder(Placeholder::Service {
                target,
                port_name,
                http,
            }) => {
                let binding = ctx.ports.get(&target, &port_name).ok_or_else(|| {
                    Error::validation(format!(
                        "service {} references unknown port {target}.{port_name}",
                        ctx.service
                    ))
                })?;
                let (host, port) =
                    endpoint(caller, ctx.placements.placement(&target), &target, binding);
                if http {
                    out.push_str("http://");
                }
                out.push_str(&host);
                out.push(':');
                out.push_str(&port.to_string());
            }
        }
    }
    Ok(out)
}

/// The artifact directory as visible to a service with the given placement
pub fn artifact_path(placement: Placement, host_dir: &Path) -> PathBuf {
    match placement {
        Placement::Host => host_dir.to_path_buf(),
        Placement::Container => PathBuf::from(CONTAINER_ARTIFACT_DIR),
    }
}

/// The reachable `(host, port)` endpoint for a cross-service reference.
///
/// Container-to-container traffic uses the engine's service DNS and the
/// container-internal port. Everything that crosses the host boundary uses
/// the reserved host port: containers reach host processes through the
/// gateway name, and host processes reach everything through loopback.
fn endpoint(
    caller: Placement,
    target: Placement,
    target_name: &str,
    binding: PortBinding,
) -> (String, u16) {
    match (caller, target) {
        (Placement::Container, Placement::Container) => {
            (target_name.to_string(), binding.container)
        }
        (Placement::Container, Placement::Host) => (HOST_GATEWAY_NAME.to_string(), binding.host),
        (Placement::Host, _) => ("localhost".to_string(), binding.host),
    }
}

fn scan(input: &str) -> Result<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut rest = input;
    while let Some(open) = rest.find("{{") {
        if open > 0 {
            segments.push(Segment::Literal(rest[..open].to_string()));
        }
        let after_open = &rest[open + 2..];
        let close = after_open.find("}}").ok_or_else(|| {
            Error::template_parse(input, "unterminated placeholder (missing \"}}\")")
        })?;
        let inner = &after_open[..close];
        segments.push(Segment::Placeholder(parse_placeholder(input, inner)?));
        rest = &after_open[close + 2..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Literal(rest.to_string()));
    }
    Ok(segments)
}

fn parse_placeholder(input: &str, inner: &str) -> Result<Placeholder> {
    let atoms = split_atoms(input, inner)?;
    let mut atoms = atoms.into_iter();
    let keyword = atoms
        .next()
        .ok_or_else(|| Error::template_parse(input, "empty placeholder"))?;
    match keyword {
        Atom::Word(word) => match word.as_str() {
            "Port" | "PortUDP" => {
                let protocol = if word == "PortUDP" {
                    Protocol::Udp
                } else {
                    Protocol::Tcp
                };
                let name = expect_quoted(input, atoms.next(), "port name")?;
                let number = expect_word(input, atoms.next(), "port number")?;
                let number: u16 = number.parse().map_err(|_| {
                    Error::template_parse(input, format!("invalid port number {number:?}"))
                })?;
                expect_end(input, atoms.next())?;
                Ok(Placeholder::Port {
                    name,
                    number,
                    protocol,
                })
            }
            "Service" => {
                let target = expect_quoted(input, atoms.next(), "target service")?;
                let port_name = expect_quoted(input, atoms.next(), "port name")?;
                let http = match atoms.next() {
                    None => false,
                    Some(Atom::Word(hint)) if hint == "http" => true,
                    Some(other) => {
                        return Err(Error::template_parse(
                            input,
                            format!("unexpected token {other:?} after Service reference"),
                        ))
                    }
                };
                expect_end(input, atoms.next())?;
                Ok(Placeholder::Service {
                    target,
                    port_name,
                    http,
                })
            }
            "Dir" => {
                expect_end(input, atoms.next())?;
                Ok(Placeholder::Dir)
            }
            other => Err(Error::template_parse(
                input,
                format!("unknown placeholder keyword {other:?}"),
            )),
        },
        Atom::Quoted(q) => Err(Error::template_parse(
            input,
            format!("expected a keyword, found quoted string {q:?}"),
        )),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Atom {
    Word(String),
    Quoted(String),
}

fn split_atoms(input: &str, inner: &str) -> Result<Vec<Atom>> {
    let mut atoms = Vec::new();
    let mut chars = inner.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '"' {
            chars.next();
            let mut value = String::new();
            loop {
                match chars.next() {
                    Some('"') => break,
                    Some(ch) => value.push(ch),
                    None => {
                        return Err(Error::template_parse(input, "unterminated quoted string"))
                    }
                }
            }
            atoms.push(Atom::Quoted(value));
        } else {
            let mut word = String::new();
            while let Some(&ch) = chars.peek() {
                if ch.is_whitespace() || ch == '"' {
                    break;
                }
                word.push(ch);
                chars.next();
            }
            atoms.push(Atom::Word(word));
        }
    }
    Ok(atoms)
}

fn expect_quoted(input: &str, atom: Option<Atom>, what: &str) -> Result<String> {
    match atom {
        Some(Atom::Quoted(value)) => Ok(value),
        other => Err(Error::template_parse(
            input,
            format!("expected quoted {what}, found {other:?}"),
        )),
    }
}

fn expect_word(input: &str, atom: Option<Atom>, what: &str) -> Result<String> {
    match atom {
        Some(Atom::Word(value)) => Ok(value),
        other => Err(Error::template_parse(
            input,
            format!("expected {what}, found {other:?}"),
        )),
    }
}

fn expect_end(input: &str, atom: Option<Atom>) -> Result<()> {
    match atom {
        None => Ok(()),
        Some(extra) => Err(Error::template_parse(
            input,
            format!("unexpected trailing token {extra:?}"),
        )),
    }
}

fn render(segments: &[Segment]) -> String {
    let mut out = String::new();
    for segment in segments {
        match segment {
            Segment::Literal(text) => out.push_str(text),
            Segment::Placeholder(Placeholder::Port {
                name,
                number,
                protocol,
            }) => {
                let keyword = match protocol {
                    Protocol::Tcp => "Port",
                    Protocol::Udp => "PortUDP",
                };
                out.push_str(&format!("{{{{{keyword} \"{name}\" {number}}}}}"));
            }
            Segment::Placeholder(Placeholder::Service {
                target,
                port_name,
                http,
            }) => {
                if *http {
                    out.push_str(&format!(
                        "{{{{Service \"{target}\" \"{port_name}\" http}}}}"
                    ));
                } else {
                    out.push_str(&format!("{{{{Service \"{target}\" \"{port_name}\"}}}}"));
                }
            }
            Segment::Placeholder(Placeholder::Dir) => out.push_str("{{Dir}}"),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(
        service: &'a str,
        dir: &'a Path,
        placements: &'a PlacementIndex,
        ports: &'a PortMap,
    ) -> ResolveContext<'a> {
        ResolveContext {
            service,
            artifact_dir: dir,
            placements,
            ports,
        }
    }

    #[test]
    fn test_first_pass_collects_declarations() {
        let result =
            first_pass("--http.port {{Port \"http\" 8545}} --peer {{Service \"cl\" \"p2p\"}}")
                .unwrap();
        assert_eq!(
            result.ports,
            vec![PortDecl {
                name: "http".to_string(),
                number: 8545,
                protocol: Protocol::Tcp,
            }]
        );
        assert_eq!(
            result.references,
            vec![ServiceRef {
                target: "cl".to_string(),
                port_name: "p2p".to_string(),
            }]
        );
    }

    #[test]
    fn test_first_pass_udp() {
        let result = first_pass("--discovery.port {{PortUDP \"disc\" 30303}}").unwrap();
        assert_eq!(result.ports[0].protocol, Protocol::Udp);
        assert_eq!(
            result.rendered,
            "--discovery.port {{PortUDP \"disc\" 30303}}"
        );
    }

    #[test]
    fn test_first_pass_idempotent() {
        let input = "a {{Port \"rpc\" 8545}} b {{Service \"el\" \"rpc\" http}} c {{Dir}}";
        let once = first_pass(input).unwrap();
        let twice = first_pass(&once.rendered).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_parse_errors() {
        assert!(first_pass("{{Port \"x\" 8545").is_err());
        assert!(first_pass("{{Frob \"x\"}}").is_err());
        assert!(first_pass("{{Port \"x\" eight}}").is_err());
        assert!(first_pass("{{Port x 8545}}").is_err());
        assert!(first_pass("{{Service \"a\" \"b\" https}}").is_err());
        assert!(first_pass("{{Port \"unterminated}}").is_err());
    }

    #[test]
    fn test_plain_strings_pass_through() {
        let result = first_pass("--chain /data/genesis.json").unwrap();
        assert_eq!(result.rendered, "--chain /data/genesis.json");
        assert!(result.ports.is_empty());
        assert!(result.references.is_empty());
    }

    #[test]
    fn test_second_pass_container_caller() {
        let dir = PathBuf::from("/tmp/artifacts-x");
        let placements = PlacementIndex::new();
        let mut ports = PortMap::new();
        ports.insert(
            "el",
            "rpc",
            PortBinding {
                container: 8545,
                host: 32000,
            },
        );
        let ctx = ctx("el", &dir, &placements, &ports);

        let out = second_pass("--http.port {{Port \"rpc\" 8545}} --dir {{Dir}}", &ctx).unwrap();
        assert_eq!(out, "--http.port 8545 --dir /artifacts");
    }

    #[test]
    fn test_second_pass_host_caller() {
        let dir = PathBuf::from("/tmp/artifacts-x");
        let mut placements = PlacementIndex::new();
        placements.set_host("el");
        let mut ports = PortMap::new();
        ports.insert(
            "el",
            "rpc",
            PortBinding {
                container: 8545,
                host: 32000,
            },
        );
        let ctx = ctx("el", &dir, &placements, &ports);

        let out = second_pass("--http.port {{Port \"rpc\" 8545}} --dir {{Dir}}", &ctx).unwrap();
        assert_eq!(out, "--http.port 32000 --dir /tmp/artifacts-x");
    }

    #[test]
    fn test_placement_matrix() {
        let dir = PathBuf::from("/tmp/a");
        let mut ports = PortMap::new();
        ports.insert(
            "target",
            "api",
            PortBinding {
                container: 9000,
                host: 39000,
            },
        );

        // container -> container: service DNS, container port
        let placements = PlacementIndex::new();
        let out = second_pass(
            "{{Service \"target\" \"api\" http}}",
            &ctx("caller", &dir, &placements, &ports),
        )
        .unwrap();
        assert_eq!(out, "http://target:9000");

        // container -> host: gateway name, host port
        let mut placements = PlacementIndex::new();
        placements.set_host("target");
        let out = second_pass(
            "{{Service \"target\" \"api\" http}}",
            &ctx("caller", &dir, &placements, &ports),
        )
        .unwrap();
        assert_eq!(out, "http://host.docker.internal:39000");

        // host -> container: localhost, host port
        let mut placements = PlacementIndex::new();
        placements.set_host("caller");
        let out = second_pass(
            "{{Service \"target\" \"api\" http}}",
            &ctx("caller", &dir, &placements, &ports),
        )
        .unwrap();
        assert_eq!(out, "http://localhost:39000");

        // host -> host: localhost, host port
        let mut placements = PlacementIndex::new();
        placements.set_host("caller");
        placements.set_host("target");
        let out = second_pass(
            "{{Service \"target\" \"api\"}}",
            &ctx("caller", &dir, &placements, &ports),
        )
        .unwrap();
        assert_eq!(out, "localhost:39000");
    }

    #[test]
    fn test_second_pass_unknown_reference() {
        let dir = PathBuf::from("/tmp/a");
        let placements = PlacementIndex::new();
        let ports = PortMap::new();
        let err = second_pass(
            "{{Service \"ghost\" \"api\"}}",
            &ctx("caller", &dir, &placements, &ports),
        )
        .unwrap_err();
        assert_eq!(err.category(), "validation");
    }

    #[test]
    fn test_second_pass_deterministic() {
        let dir = PathBuf::from("/tmp/a");
        let placements = PlacementIndex::new();
        let mut ports = PortMap::new();
        ports.insert(
            "el",
            "rpc",
            PortBinding {
                container: 8545,
                host: 32001,
            },
        );
        let ctx = ctx("cl", &dir, &placements, &ports);
        let input = "--el {{Service \"el\" \"rpc\" http}}";
        assert_eq!(
            second_pass(input, &ctx).unwrap(),
            second_pass(input, &ctx).unwrap()
        );
    }
}
