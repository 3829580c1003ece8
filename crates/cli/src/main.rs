use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use serde::Deserialize;
use tokio::signal;
use tracing::{info, warn};

use vigil_core::{
    validate_patch_set, validate_resource_set, FieldPath, FieldProjection, ObjectIdentity,
    ParentKey, PatchDescriptor, ResourceDescriptor,
};
use vigil_enforce::EnforceConfig;
use vigil_kubehub::KubeCluster;
use vigil_manager::EnforcementEngine;

#[derive(Parser, Debug)]
#[command(name = "vigilctl", version, about = "Vigil enforcement engine CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate a bundle file without touching the cluster
    Validate {
        /// Bundle file (YAML): parent, resources, patches
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },
    /// Enforce a bundle against the current cluster until Ctrl-C
    Enforce {
        /// Bundle file (YAML): parent, resources, patches
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
        /// Delete managed objects on shutdown instead of orphaning them
        #[arg(long = "delete-on-exit", action = ArgAction::SetTrue)]
        delete_on_exit: bool,
        /// GVK key of the parent resource whose status subresource receives
        /// snapshots, e.g. "vigil.dev/v1/EnforcedSet"
        #[arg(long = "status-gvk")]
        status_gvk: Option<String>,
    },
}

/// On-disk bundle: one parent plus its desired resource and patch sets.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct Bundle {
    parent: ParentSpec,
    #[serde(default)]
    resources: Vec<ResourceSpec>,
    #[serde(default)]
    patches: Vec<PatchSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ParentSpec {
    namespace: Option<String>,
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ResourceSpec {
    manifest: serde_json::Value,
    #[serde(default)]
    excluded_paths: Vec<String>,
    #[serde(default)]
    retain_on_removal: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct PatchSpec {
    /// Identity key, e.g. "v1/ConfigMap/ns/name" ("-" for cluster scope)
    source: String,
    target: String,
    #[serde(default)]
    priority: u32,
    projections: Vec<ProjectionSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProjectionSpec {
    from: String,
    to: String,
}

impl Bundle {
    fn load(path: &PathBuf) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading bundle {}", path.display()))?;
        serde_yaml::from_str(&raw).with_context(|| format!("parsing bundle {}", path.display()))
    }

    fn into_parts(self) -> Result<(ParentKey, Vec<ResourceDescriptor>, Vec<PatchDescriptor>)> {
        let parent = ParentKey::new(self.parent.namespace.as_deref(), &self.parent.name);
        let mut resources = Vec::with_capacity(self.resources.len());
        for r in self.resources {
            let excluded = r
                .excluded_paths
                .iter()
                .map(|p| FieldPath::parse(p))
                .collect::<Result<Vec<_>, _>>()
                .context("parsing excludedPaths")?;
            let mut d = ResourceDescriptor::from_manifest(r.manifest, excluded)
                .context("building resource descriptor")?;
            d.retain_on_removal = r.retain_on_removal;
            resources.push(d);
        }
        let mut patches = Vec::with_capacity(self.patches.len());
        for p in self.patches {
            let mut projections = Vec::with_capacity(p.projections.len());
            for pr in &p.projections {
                projections.push(FieldProjection {
                    from: FieldPath::parse(&pr.from).context("parsing projection source path")?,
                    to: FieldPath::parse(&pr.to).context("parsing projection target path")?,
                });
            }
            patches.push(PatchDescriptor {
                source: parse_identity(&p.source)?,
                target: parse_identity(&p.target)?,
                projections,
                priority: p.priority,
            });
        }
        Ok((parent, resources, patches))
    }
}

/// Parse an identity key of the form `gvk/namespace/name`, where gvk itself
/// is `version/Kind` or `group/version/Kind` and namespace is `-` for
/// cluster-scoped objects.
fn parse_identity(key: &str) -> Result<ObjectIdentity> {
    let parts: Vec<&str> = key.split('/').collect();
    let (gvk, ns, name) = match parts.as_slice() {
        [version, kind, ns, name] => (format!("{version}/{kind}"), *ns, *name),
        [group, version, kind, ns, name] => (format!("{group}/{version}/{kind}"), *ns, *name),
        _ => bail!("invalid identity key {key:?}; expected gvk/namespace/name"),
    };
    let ns = if ns == "-" { None } else { Some(ns) };
    Ok(ObjectIdentity::new(gvk, ns, name))
}

fn init_tracing() {
    let env = std::env::var("VIGIL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("VIGIL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid VIGIL_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { file } => {
            let (parent, resources, patches) = Bundle::load(&file)?.into_parts()?;
            validate_resource_set(&resources)?;
            validate_patch_set(&patches)?;
            println!(
                "{}: ok ({} resources, {} patches for parent {})",
                file.display(),
                resources.len(),
                patches.len(),
                parent
            );
        }
        Commands::Enforce { file, delete_on_exit, status_gvk } => {
            let (parent, resources, patches) = Bundle::load(&file)?.into_parts()?;
            let cluster = KubeCluster::connect(status_gvk).await?;
            let engine = EnforcementEngine::new(Arc::new(cluster), EnforceConfig::from_env());
            let mut notifications = engine
                .take_notifications()
                .context("notification stream already taken")?;

            engine.reconcile(&parent, resources, patches).await?;
            info!(parent = %parent, "enforcement running; Ctrl-C to stop");

            loop {
                tokio::select! {
                    _ = signal::ctrl_c() => break,
                    changed = notifications.recv() => {
                        let Some(changed) = changed else { break };
                        if let Err(e) = engine.publish_status(&changed).await {
                            warn!(parent = %changed, error = %e, "failed to publish status");
                        }
                    }
                }
            }

            info!(parent = %parent, delete_on_exit, "shutting down");
            engine.terminate(&parent, delete_on_exit).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_keys_parse_both_gvk_forms() {
        let id = parse_identity("v1/ConfigMap/ns/app").unwrap();
        assert_eq!(id.gvk_key, "v1/ConfigMap");
        assert_eq!(id.namespace.as_deref(), Some("ns"));

        let id = parse_identity("cert-manager.io/v1/Certificate/-/ca").unwrap();
        assert_eq!(id.gvk_key, "cert-manager.io/v1/Certificate");
        assert_eq!(id.namespace, None);
        assert_eq!(id.name, "ca");

        assert!(parse_identity("v1/ConfigMap").is_err());
    }

    #[test]
    fn bundle_yaml_maps_onto_descriptors() {
        let raw = r#"
parent:
  namespace: ns
  name: app
resources:
  - manifest:
      apiVersion: v1
      kind: ConfigMap
      metadata:
        name: cm
        namespace: ns
      data:
        k: v
    excludedPaths: [".data.generated"]
    retainOnRemoval: true
patches:
  - source: v1/ConfigMap/ns/cm
    target: v1/Service/ns/svc
    priority: 2
    projections:
      - from: .data.k
        to: .metadata.annotations.k
"#;
        let bundle: Bundle = serde_yaml::from_str(raw).unwrap();
        let (parent, resources, patches) = bundle.into_parts().unwrap();
        assert_eq!(parent.to_string(), "ns/app");
        assert_eq!(resources.len(), 1);
        assert!(resources[0].retain_on_removal);
        assert!(resources[0].excluded_paths.covers(&["data", "generated"]));
        assert_eq!(patches[0].priority, 2);
        assert_eq!(patches[0].target.gvk_key, "v1/Service");
    }
}
