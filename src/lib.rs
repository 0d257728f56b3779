//! # builder-playground
//!
//! Self-contained, ephemeral Ethereum development networks for testing
//! block building and MEV relay behavior.
//!
//! A recipe selects a topology of execution clients, consensus clients,
//! relays, and auxiliary services. The crate materializes a declarative
//! service manifest from it, reserves host ports, renders a compose
//! document, brings the services up under the container engine, gates
//! readiness on lifecycle events, and monitors liveness until exit. A
//! standalone Engine-API multiplexer (the `engine-mux` binary) fans a
//! consensus client's traffic out to a primary execution client and a
//! filtered secondary builder.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use builder_playground::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let recipe = Recipe::new("l1").with(
//!         "el",
//!         Arc::new(FnComponent::new(|s: &mut Service| {
//!             s.with_image("ghcr.io/paradigmxyz/reth")
//!                 .with_tag("v1.0.0")
//!                 .with_args([
//!                     "node",
//!                     "--datadir",
//!                     "{{Dir}}",
//!                     "--http.port",
//!                     "{{Port \"http\" 8545}}",
//!                 ])
//!                 .with_ready(ReadyCheck::http("http://localhost:{{Port \"http\" 8545}}"));
//!         })),
//!     );
//!
//!     let session = Session::create("/tmp/artifacts").await?;
//!     let manifest = recipe.apply(session.id(), session.artifact_dir(), Default::default())?;
//!
//!     let shutdown = Shutdown::install();
//!     let mut runtime = Runtime::new(session, manifest, shutdown, LaunchOptions::default());
//!     runtime.launch().await?;
//!     runtime.wait_for_ready().await?;
//!     let reason = runtime.wait_for_exit().await;
//!     println!("exiting: {reason:?}");
//!     runtime.stop(false).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`template`] - two-pass placeholder resolution for service arguments
//! - [`manifest`] - service descriptors, validation, canonical JSON
//! - [`component`] - the component/recipe framework
//! - [`ports`] - host port reservation
//! - [`session`] - session identity and on-disk state layout
//! - [`artifacts`] - release binaries for host-executed services
//! - [`runtime`] - compose generation, launch, events, logs, teardown
//! - [`readiness`] - the per-service readiness gate
//! - [`proxy`] - the Engine-API multiplexer
//! - [`shutdown`] - graceful/force cancellation
//! - [`error`] - error types

#![warn(missing_docs)]
#![warn(clippy::all)]

// Re-export the most commonly used types and traits
pub use component::{Component, FnComponent, ReadyContext, Recipe};
pub use error::{Error, Result};
pub use manifest::{
    DependsCondition, ExecutionContext, LogLevel, Manifest, Port, Protocol, ReadyCheck,
    ReadyProbe, ReleaseArtifact, Service,
};
pub use ports::PortAllocator;
pub use proxy::{EngineMux, MuxConfig};
pub use readiness::{ReadinessGate, ServiceStatus};
pub use runtime::{ExitReason, LaunchOptions, Runtime, ServiceOverride};
pub use session::Session;
pub use shutdown::Shutdown;
pub use template::{Placement, PlacementIndex, PortBinding, PortMap};

// Core modules
pub mod artifacts;
pub mod component;
pub mod error;
pub mod manifest;
pub mod ports;
pub mod proxy;
pub mod readiness;
pub mod runtime;
pub mod session;
pub mod shutdown;
pub mod template;

/// The version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
