//! fleet.yaml configuration parser.
//!
//! The configuration document declares a single fleet: compartment, image,
//! shape, subnet, instance groups with counts, scaling knobs, and an
//! optional load balancer. The daemon re-reads this file whenever its mtime
//! advances, so parsing must be side-effect free.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default worker-pool size for concurrent launches.
pub const DEFAULT_PARALLEL_LAUNCH: usize = 5;
/// Default worker-pool size for concurrent terminations.
pub const DEFAULT_PARALLEL_TERMINATE: usize = 10;

/// Errors raised while loading or validating a configuration document.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Root configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetConfig {
    pub kind: String,
    pub metadata: Metadata,
    pub spec: Spec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Spec {
    pub compartment_id: String,
    pub image_id: String,
    #[serde(default)]
    pub availability_domain: String,
    pub shape: String,
    #[serde(default)]
    pub shape_config: Option<ShapeConfig>,
    pub subnet_id: String,
    #[serde(default)]
    pub display_name_prefix: String,
    #[serde(default)]
    pub scaling: Scaling,
    #[serde(default)]
    pub load_balancer: Option<LoadBalancerSpec>,
    #[serde(default)]
    pub auth: Auth,
    #[serde(default)]
    pub defined_tags: HashMap<String, String>,
    #[serde(default)]
    pub freeform_tags: HashMap<String, String>,
    #[serde(default)]
    pub instances: Vec<InstanceGroup>,
}

/// OCPU/memory sizing for flexible shapes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShapeConfig {
    pub ocpus: f32,
    #[serde(rename = "memoryInGBs")]
    pub memory_in_gbs: f32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scaling {
    #[serde(default)]
    pub parallel_launch: i64,
    #[serde(default)]
    pub parallel_terminate: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerSpec {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub subnet_id: String,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub listener_port: u16,
    #[serde(default)]
    pub backend_port: u16,
    #[serde(default)]
    pub min_bandwidth_mbps: u32,
    #[serde(default)]
    pub max_bandwidth_mbps: u32,
    #[serde(default)]
    pub health_path: String,
    #[serde(default)]
    pub policy: String,
}

/// How the cloud provider is authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    /// Instance principal (running inside the cloud).
    Instance,
    /// User principal from an SDK config file.
    User,
    /// In-process simulated cloud, for local development.
    Simulated,
}

impl Default for AuthMethod {
    fn default() -> Self {
        AuthMethod::Instance
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Auth {
    #[serde(default)]
    pub method: AuthMethod,
    #[serde(default)]
    pub config_file: String,
    #[serde(default)]
    pub profile: String,
    #[serde(default)]
    pub region: String,
}

/// One logical subdivision of the fleet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceGroup {
    #[serde(default)]
    pub name: String,
    pub count: i64,
    /// Per-group subnet override; falls back to `spec.subnetId`.
    #[serde(default)]
    pub subnet_id: String,
}

impl FleetConfig {
    /// Load and validate a configuration document from disk.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg: FleetConfig =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check the structural invariants the engine relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.metadata.name.trim().is_empty() {
            return Err(ConfigError::Invalid("metadata.name must be set".into()));
        }
        if self.spec.compartment_id.trim().is_empty() {
            return Err(ConfigError::Invalid("spec.compartmentId must be set".into()));
        }
        if self.spec.image_id.trim().is_empty() {
            return Err(ConfigError::Invalid("spec.imageId must be set".into()));
        }
        if self.spec.subnet_id.trim().is_empty() {
            return Err(ConfigError::Invalid("spec.subnetId must be set".into()));
        }
        if self.spec.shape.to_lowercase().contains("flex") && self.spec.shape_config.is_none() {
            return Err(ConfigError::Invalid(format!(
                "shape {:?} requires shapeConfig (ocpus, memoryInGBs)",
                self.spec.shape
            )));
        }
        for group in &self.spec.instances {
            if group.count < 0 {
                return Err(ConfigError::Invalid(format!(
                    "instances[{:?}].count must be >= 0",
                    group.name
                )));
            }
        }
        if let Some(lb) = &self.spec.load_balancer {
            if lb.enabled && lb.subnet_id.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "loadBalancer.subnetId must be set when the load balancer is enabled".into(),
                ));
            }
        }
        Ok(())
    }

    /// Sum of the declared per-group counts.
    pub fn desired_total(&self) -> usize {
        self.spec
            .instances
            .iter()
            .map(|g| g.count.max(0) as usize)
            .sum()
    }

    /// First declared group with a non-empty name, else `"default"`.
    pub fn default_group(&self) -> String {
        self.spec
            .instances
            .first()
            .filter(|g| !g.name.is_empty())
            .map(|g| g.name.clone())
            .unwrap_or_else(|| "default".to_string())
    }

    /// Display-name prefix for launched instances: `displayNamePrefix` if
    /// set, else `<fleetName>-`. Launch names follow
    /// `<prefix><group>-<timestamp>-<idx>` so the group can be parsed back
    /// out during state sync.
    pub fn display_name_prefix(&self) -> String {
        let prefix = self.spec.display_name_prefix.trim();
        if prefix.is_empty() {
            format!("{}-", self.metadata.name)
        } else {
            prefix.to_string()
        }
    }

    /// Subnet for launching into `group`: per-group override wins.
    pub fn subnet_for_group(&self, group: &str) -> String {
        self.spec
            .instances
            .iter()
            .find(|g| g.name == group && !g.subnet_id.trim().is_empty())
            .map(|g| g.subnet_id.trim().to_string())
            .unwrap_or_else(|| self.spec.subnet_id.trim().to_string())
    }

    /// Launch pool size with the documented default.
    pub fn parallel_launch(&self) -> usize {
        if self.spec.scaling.parallel_launch <= 0 {
            DEFAULT_PARALLEL_LAUNCH
        } else {
            self.spec.scaling.parallel_launch as usize
        }
    }

    /// Terminate pool size with the documented default.
    pub fn parallel_terminate(&self) -> usize {
        if self.spec.scaling.parallel_terminate <= 0 {
            DEFAULT_PARALLEL_TERMINATE
        } else {
            self.spec.scaling.parallel_terminate as usize
        }
    }

    /// Whether backend reconciliation should run at all.
    pub fn lb_enabled(&self) -> bool {
        self.spec
            .load_balancer
            .as_ref()
            .map(|lb| lb.enabled)
            .unwrap_or(false)
    }

    /// One-line description used by the CLI summary command.
    pub fn summary(&self) -> String {
        format!(
            "Fleet(kind={}, name={}, instances={})",
            self.kind,
            self.metadata.name,
            self.spec.instances.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
kind: FleetConfig
metadata:
  name: web
spec:
  compartmentId: ocid1.compartment.oc1..aaa
  imageId: ocid1.image.oc1..bbb
  shape: VM.Standard.E4.Flex
  shapeConfig:
    ocpus: 1
    memoryInGBs: 8
  subnetId: ocid1.subnet.oc1..ccc
  auth:
    method: simulated
  instances:
    - name: web
      count: 3
    - name: worker
      count: 2
"#;

    fn parse(yaml: &str) -> FleetConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn parses_minimal_document() {
        let cfg = parse(MINIMAL);
        cfg.validate().unwrap();
        assert_eq!(cfg.metadata.name, "web");
        assert_eq!(cfg.desired_total(), 5);
        assert_eq!(cfg.default_group(), "web");
        assert_eq!(cfg.display_name_prefix(), "web-");
    }

    #[test]
    fn flex_shape_requires_shape_config() {
        let mut cfg = parse(MINIMAL);
        cfg.spec.shape_config = None;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("shapeConfig"));
    }

    #[test]
    fn missing_name_is_invalid() {
        let mut cfg = parse(MINIMAL);
        cfg.metadata.name = " ".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn negative_group_count_is_invalid() {
        let mut cfg = parse(MINIMAL);
        cfg.spec.instances[1].count = -1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn enabled_lb_requires_subnet() {
        let mut cfg = parse(MINIMAL);
        cfg.spec.load_balancer = Some(LoadBalancerSpec {
            enabled: true,
            ..serde_yaml::from_str("{}").unwrap()
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn scaling_defaults_apply_when_unset_or_nonpositive() {
        let mut cfg = parse(MINIMAL);
        assert_eq!(cfg.parallel_launch(), DEFAULT_PARALLEL_LAUNCH);
        assert_eq!(cfg.parallel_terminate(), DEFAULT_PARALLEL_TERMINATE);
        cfg.spec.scaling.parallel_launch = 2;
        cfg.spec.scaling.parallel_terminate = -3;
        assert_eq!(cfg.parallel_launch(), 2);
        assert_eq!(cfg.parallel_terminate(), DEFAULT_PARALLEL_TERMINATE);
    }

    #[test]
    fn group_subnet_override_wins() {
        let mut cfg = parse(MINIMAL);
        cfg.spec.instances[0].subnet_id = "ocid1.subnet.oc1..override".into();
        assert_eq!(cfg.subnet_for_group("web"), "ocid1.subnet.oc1..override");
        assert_eq!(cfg.subnet_for_group("worker"), "ocid1.subnet.oc1..ccc");
    }

    #[test]
    fn empty_group_names_fall_back_to_default() {
        let mut cfg = parse(MINIMAL);
        cfg.spec.instances[0].name = "".into();
        assert_eq!(cfg.default_group(), "default");
    }
}
