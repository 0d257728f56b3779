//! Components and recipes.
//!
//! A component knows how to populate one service descriptor; a recipe is an
//! ordered list of component instantiations. The recipes themselves are
//! data; this module is the framework that consumes them.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Error, Result};
use crate::manifest::{ExecutionContext, Manifest, Service};
use crate::template::{PlacementIndex, PortMap};

/// One component of a recipe.
///
/// `apply` populates the service descriptor through its fluent builder.
/// `ready` is an optional post-launch hook, invoked once the readiness gate
/// is satisfied; it may inspect the service's log sink to extract
/// runtime-generated identifiers and publish them as session outputs. A
/// `ready` failure aborts the session.
#[async_trait]
pub trait Component: Send + Sync {
    /// Populate the service descriptor
    fn apply(&self, service: &mut Service);

    /// One-shot post-launch introspection hook
    async fn ready(&self, ctx: &mut ReadyContext<'_>) -> Result<()> {
        let _ = ctx;
        Ok(())
    }
}

/// A component built from a plain closure, for recipes that need no
/// post-launch hook.
pub struct FnComponent<F> {
    apply: F,
}

impl<F> FnComponent<F>
where
    F: Fn(&mut Service) + Send + Sync,
{
    /// Wrap a closure as a component
    pub fn new(apply: F) -> Self {
        Self { apply }
    }
}

#[async_trait]
impl<F> Component for FnComponent<F>
where
    F: Fn(&mut Service) + Send + Sync,
{
    fn apply(&self, service: &mut Service) {
        (self.apply)(service);
    }
}

/// Context handed to a component's `ready` hook
pub struct ReadyContext<'a> {
    /// The service this component populated, host ports stamped
    pub service: &'a Service,
    /// Reserved port bindings for the whole session
    pub ports: &'a PortMap,
    /// Placement of every service
    pub placements: &'a PlacementIndex,
    outputs: &'a mut BTreeMap<String, String>,
}

impl<'a> ReadyContext<'a> {
    pub(crate) fn new(
        service: &'a Service,
        ports: &'a PortMap,
        placements: &'a PlacementIndex,
        outputs: &'a mut BTreeMap<String, String>,
    ) -> Self {
        Self {
            service,
            ports,
            placements,
            outputs,
        }
    }

    /// Publish a named session output (saved as `outputs.json`)
    pub fn publish(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        debug!(service = %self.service.name, output = %key, "publishing session output");
        self.outputs.insert(key, value);
    }

    /// Scan the service's log sink for the first line containing `needle`.
    ///
    /// Used by completion hooks to pull runtime-generated identifiers
    /// (enodes, peer ids) out of client startup logs.
    pub async fn find_log_line(&self, needle: &str) -> Result<Option<String>> {
        let path = self.service.logs().ok_or_else(|| {
            Error::lifecycle(&self.service.name, "no log sink attached")
        })?;
        let body = tokio::fs::read_to_string(path).await?;
        Ok(body.lines().find(|l| l.contains(needle)).map(str::to_string))
    }
}

/// A named, ordered list of component instantiations
pub struct Recipe {
    name: String,
    components: Vec<(String, Arc<dyn Component>)>,
}

impl Recipe {
    /// Create an empty recipe
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            components: Vec::new(),
        }
    }

    /// The recipe name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a component instantiation
    #[must_use]
    pub fn with(mut self, service: impl Into<String>, component: Arc<dyn Component>) -> Self {
        self.components.push((service.into(), component));
        self
    }

    /// Assemble the manifest for a session: instantiate every component's
    /// descriptor in order.
    pub fn apply(
        &self,
        session_id: impl Into<String>,
        artifact_dir: impl Into<std::path::PathBuf>,
        ctx: ExecutionContext,
    ) -> Result<Manifest> {
        let mut manifest = Manifest::new(session_id, &self.name, artifact_dir, ctx);
        for (name, component) in &self.components {
            manifest.add_service(name.clone(), Arc::clone(component))?;
        }
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recipe_applies_components_in_order() {
        let recipe = Recipe::new("l1")
            .with(
                "el",
                Arc::new(FnComponent::new(|s: &mut Service| {
                    s.with_image("reth")
                        .with_args(["--http.port", "{{Port \"http\" 8545}}"]);
                })),
            )
            .with(
                "cl",
                Arc::new(FnComponent::new(|s: &mut Service| {
                    s.with_image("lighthouse");
                })),
            );

        let manifest = recipe
            .apply("sess", "/tmp/artifacts", ExecutionContext::default())
            .unwrap();
        let names: Vec<_> = manifest.services().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["el", "cl"]);
    }

    #[test]
    fn test_recipe_duplicate_name_rejected() {
        let recipe = Recipe::new("l1")
            .with("el", Arc::new(FnComponent::new(|_: &mut Service| {})))
            .with("el", Arc::new(FnComponent::new(|_: &mut Service| {})));
        assert!(recipe
            .apply("sess", "/tmp/a", ExecutionContext::default())
            .is_err());
    }

    #[tokio::test]
    async fn test_ready_context_outputs() {
        let svc = Service::new("el");
        let ports = PortMap::new();
        let placements = PlacementIndex::new();
        let mut outputs = BTreeMap::new();
        let mut ctx = ReadyContext::new(&svc, &ports, &placements, &mut outputs);
        ctx.publish("enode", "enode://abc@127.0.0.1:30303");
        assert_eq!(outputs["enode"], "enode://abc@127.0.0.1:30303");
    }
}
