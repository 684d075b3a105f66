use anyhow::{Context, Result};
use dsr_protocol::Address;
use dsr_routing::DsrConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub routing: DsrConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub scenario: ScenarioConfig,

    #[serde(skip)]
    config_file_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Simulated network and the traffic offered to it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioConfig {
    pub duration_ms: u64,
    /// Seeds payload contents and per-node tie-breaking
    #[serde(default)]
    pub seed: Option<u64>,
    /// Neighbors of a transmitter overhear its unicast packets
    #[serde(default = "default_true")]
    pub promiscuous: bool,
    /// The radio reports unicast to an unreachable neighbor
    #[serde(default = "default_true")]
    pub link_feedback: bool,
    pub nodes: Vec<Address>,
    pub links: Vec<(Address, Address)>,
    #[serde(default)]
    pub link_events: Vec<LinkEvent>,
    #[serde(default)]
    pub flows: Vec<FlowConfig>,
}

fn default_true() -> bool {
    true
}

/// Link coming up or going down during the run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkEvent {
    pub at_ms: u64,
    pub a: Address,
    pub b: Address,
    pub up: bool,
}

/// Constant-rate traffic between two nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowConfig {
    pub src: Address,
    pub dst: Address,
    pub start_ms: u64,
    pub interval_ms: u64,
    pub count: u32,
    #[serde(default = "default_payload_size")]
    pub size: usize,
}

fn default_payload_size() -> usize {
    64
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        let node = |n| Address::from_octets(10, 0, 0, n);
        Self {
            duration_ms: 20_000,
            seed: Some(1),
            promiscuous: true,
            link_feedback: true,
            nodes: (1..=5).map(node).collect(),
            // 1 - 2 - 3 - 4 with a detour 2 - 5 - 4
            links: vec![
                (node(1), node(2)),
                (node(2), node(3)),
                (node(3), node(4)),
                (node(2), node(5)),
                (node(5), node(4)),
            ],
            link_events: vec![LinkEvent {
                at_ms: 8_000,
                a: node(3),
                b: node(4),
                up: false,
            }],
            flows: vec![FlowConfig {
                src: node(1),
                dst: node(4),
                start_ms: 1_000,
                interval_ms: 500,
                count: 30,
                size: 64,
            }],
        }
    }
}

impl Config {
    /// Configuration for `scenario` with default routing and logging
    pub fn new(scenario: ScenarioConfig) -> Self {
        Config {
            routing: DsrConfig::default(),
            logging: LoggingConfig::default(),
            scenario,
            config_file_path: PathBuf::new(),
        }
    }

    /// Load configuration from file
    pub fn load(config_path: Option<PathBuf>) -> Result<Self> {
        let config_path = config_path.unwrap_or_else(Self::default_config_path);

        if !config_path.exists() {
            anyhow::bail!(
                "Configuration file not found: {}\nRun with --init to create a new configuration",
                config_path.display()
            );
        }

        let contents =
            fs::read_to_string(&config_path).context("Failed to read configuration file")?;

        let mut config: Config =
            serde_yaml::from_str(&contents).context("Failed to parse configuration file")?;
        config.config_file_path = config_path;

        config.validate()?;
        Ok(config)
    }

    /// Create a new default configuration and write it to disk
    pub fn create_default(config_path: Option<PathBuf>) -> Result<Self> {
        let config_path = config_path.unwrap_or_else(Self::default_config_path);

        if let Some(parent) = config_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let config = Config {
            routing: DsrConfig {
                tie_break_seed: None,
                ..Default::default()
            },
            logging: LoggingConfig::default(),
            scenario: ScenarioConfig::default(),
            config_file_path: config_path.clone(),
        };

        let yaml = serde_yaml::to_string(&config)?;
        fs::write(&config_path, yaml)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;

        Ok(config)
    }

    /// Check that the scenario only refers to declared nodes
    pub fn validate(&self) -> Result<()> {
        self.routing
            .validate()
            .context("Invalid routing configuration")?;

        let mut nodes = HashSet::new();
        for node in &self.scenario.nodes {
            if node.is_broadcast() {
                anyhow::bail!("Node address {} is reserved", node);
            }
            if !nodes.insert(*node) {
                anyhow::bail!("Node {} declared twice", node);
            }
        }

        let known = |addr: &Address, what: &str| -> Result<()> {
            if nodes.contains(addr) {
                Ok(())
            } else {
                anyhow::bail!("{} refers to unknown node {}", what, addr)
            }
        };

        for (a, b) in &self.scenario.links {
            known(a, "link")?;
            known(b, "link")?;
        }
        for event in &self.scenario.link_events {
            known(&event.a, "link event")?;
            known(&event.b, "link event")?;
        }
        for flow in &self.scenario.flows {
            known(&flow.src, "flow")?;
            known(&flow.dst, "flow")?;
            if flow.interval_ms == 0 {
                anyhow::bail!("Flow {} -> {} has a zero interval", flow.src, flow.dst);
            }
        }

        Ok(())
    }

    /// Routing configuration for the `index`th node
    ///
    /// Without an explicit tie-break seed, each node derives one from the
    /// scenario seed so runs are repeatable.
    pub fn node_routing(&self, index: usize) -> DsrConfig {
        let mut routing = self.routing.clone();
        if routing.tie_break_seed.is_none() {
            routing.tie_break_seed = self
                .scenario
                .seed
                .map(|seed| seed.wrapping_add(index as u64));
        }
        routing
    }

    pub fn config_path(&self) -> &Path {
        &self.config_file_path
    }

    fn default_config_path() -> PathBuf {
        PathBuf::from("dsrnode.yaml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_default_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("conf").join("dsrnode.yaml");

        let created = Config::create_default(Some(path.clone())).unwrap();
        let loaded = Config::load(Some(path.clone())).unwrap();

        assert_eq!(loaded.routing, created.routing);
        assert_eq!(loaded.scenario, created.scenario);
        assert_eq!(loaded.logging.level, "info");
        assert_eq!(loaded.config_path(), path.as_path());
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let result = Config::load(Some(dir.path().join("absent.yaml")));
        assert!(result.is_err());
    }

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let yaml = r#"
scenario:
  duration_ms: 1000
  nodes: ["10.0.0.1", "10.0.0.2"]
  links: [["10.0.0.1", "10.0.0.2"]]
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert!(config.validate().is_ok());
        assert_eq!(config.routing, DsrConfig::default());
        assert!(config.scenario.promiscuous);
        assert!(config.scenario.flows.is_empty());
    }

    #[test]
    fn test_validate_rejects_unknown_node() {
        let mut config = Config::new(ScenarioConfig::default());
        assert!(config.validate().is_ok());

        config
            .scenario
            .links
            .push((Address::from_octets(10, 0, 0, 1), Address::from_octets(10, 0, 0, 99)));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_node() {
        let mut scenario = ScenarioConfig::default();
        scenario.nodes.push(Address::from_octets(10, 0, 0, 1));
        let config = Config::new(scenario);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_node_routing_derives_seed() {
        let config = Config::new(ScenarioConfig {
            seed: Some(10),
            ..Default::default()
        });

        assert_eq!(config.node_routing(0).tie_break_seed, Some(10));
        assert_eq!(config.node_routing(3).tie_break_seed, Some(13));
    }
}
