//! Deployment file shared by the gateway and all subgraphs.

use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::GatewayError;
use crate::identity::TokenAuthority;

/// Deployment file compiled into the binary.
pub const DEFAULT_CONFIG: &str = include_str!(concat!(env!("OUT_SCHEMAS"), "/supergraph.yaml"));

#[derive(Debug, Clone, Deserialize)]
pub struct SupergraphConfig {
    #[serde(default)]
    pub gateway: GatewaySettings,
    pub identity: IdentitySettings,
    pub subgraphs: BTreeMap<String, SubgraphConfig>,
    #[serde(default)]
    pub provisioning: ProvisioningSettings,
    /// Directory relative schema files are resolved against.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySettings {
    #[serde(default = "default_gateway_listen")]
    pub listen: SocketAddr,
    #[serde(default)]
    pub cors_origins: Vec<String>,
    #[serde(default = "default_timeout_ms")]
    pub subgraph_timeout_ms: u64,
    #[serde(default)]
    pub poll_interval_secs: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        GatewaySettings {
            listen: default_gateway_listen(),
            cors_origins: Vec::new(),
            subgraph_timeout_ms: default_timeout_ms(),
            poll_interval_secs: 0,
        }
    }
}

impl GatewaySettings {
    pub fn subgraph_timeout(&self) -> Duration {
        Duration::from_millis(self.subgraph_timeout_ms)
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        (self.poll_interval_secs > 0).then(|| Duration::from_secs(self.poll_interval_secs))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdentitySettings {
    pub active_key: String,
    pub keys: BTreeMap<String, String>,
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
    #[serde(default = "default_provisioning_ttl_secs")]
    pub provisioning_token_ttl_secs: u64,
}

impl IdentitySettings {
    pub fn authority(&self) -> Result<TokenAuthority, GatewayError> {
        Ok(TokenAuthority::new(
            &self.active_key,
            self.keys.iter().map(|(kid, secret)| (kid.clone(), secret.as_str())),
            Duration::from_secs(self.token_ttl_secs),
        )?)
    }

    pub fn provisioning_token_ttl(&self) -> Duration {
        Duration::from_secs(self.provisioning_token_ttl_secs)
    }

    /// Environment overrides: `JWT_KEY_ID` selects the active key and
    /// `JWT_SECRET` replaces its secret.
    pub fn apply_overrides(&mut self, key_id: Option<String>, secret: Option<String>) {
        if let Some(kid) = key_id {
            self.active_key = kid;
        }
        if let Some(secret) = secret {
            self.keys.insert(self.active_key.clone(), secret);
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubgraphConfig {
    pub routing_url: String,
    #[serde(default)]
    pub listen: Option<SocketAddr>,
    #[serde(default)]
    pub schema: Option<SchemaConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchemaConfig {
    pub file: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProvisioningSettings {
    pub patient_url: String,
    pub nurse_url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ProvisioningSettings {
    fn default() -> Self {
        ProvisioningSettings {
            patient_url: "http://localhost:4003/graphql".into(),
            nurse_url: "http://localhost:4004/graphql".into(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl ProvisioningSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_gateway_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 4000))
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_token_ttl_secs() -> u64 {
    4 * 60 * 60
}

fn default_provisioning_ttl_secs() -> u64 {
    60
}

impl SupergraphConfig {
    pub fn from_yaml(contents: &str, base_dir: impl Into<PathBuf>) -> Result<Self, GatewayError> {
        let mut config: SupergraphConfig = serde_yaml::from_str(contents)?;
        config.base_dir = base_dir.into();
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, GatewayError> {
        let contents = fs::read_to_string(path).map_err(|source| GatewayError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("")).to_path_buf();
        Self::from_yaml(&contents, base_dir)
    }

    /// The embedded deployment file; schema files resolve against `./schemas`.
    pub fn embedded() -> Result<Self, GatewayError> {
        Self::from_yaml(DEFAULT_CONFIG, "schemas")
    }

    fn validate(&self) -> Result<(), GatewayError> {
        if self.subgraphs.is_empty() {
            return Err(GatewayError::NoSubgraphs);
        }
        for (name, subgraph) in &self.subgraphs {
            reqwest::Url::parse(&subgraph.routing_url).map_err(|e| {
                GatewayError::InvalidConfig(format!("subgraph {name} has an invalid routing_url: {e}"))
            })?;
        }
        if self.gateway.subgraph_timeout_ms == 0 {
            return Err(GatewayError::InvalidConfig(
                "gateway.subgraph_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn subgraph(&self, name: &str) -> Result<&SubgraphConfig, GatewayError> {
        self.subgraphs
            .get(name)
            .ok_or_else(|| GatewayError::InvalidConfig(format!("no subgraph named {name} in config")))
    }

    /// Where a subgraph should bind: its explicit `listen`, or every
    /// interface on the port of its routing URL.
    pub fn subgraph_listen(&self, name: &str) -> Result<SocketAddr, GatewayError> {
        let subgraph = self.subgraph(name)?;
        if let Some(listen) = subgraph.listen {
            return Ok(listen);
        }
        let port = reqwest::Url::parse(&subgraph.routing_url)
            .ok()
            .and_then(|url| url.port_or_known_default())
            .ok_or_else(|| {
                GatewayError::InvalidConfig(format!("cannot derive a listen port for subgraph {name}"))
            })?;
        Ok(SocketAddr::from(([0, 0, 0, 0], port)))
    }

    pub fn schema_path(&self, schema: &SchemaConfig) -> PathBuf {
        self.base_dir.join(&schema.file)
    }
}
