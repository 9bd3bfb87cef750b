//! Layered application configuration.
//!
//! Precedence (lowest to highest):
//! 1. Compiled defaults
//! 2. YAML file passed with `--config`
//! 3. Environment variables (`GREETER__` prefix, `__` separates sections)
//! 4. CLI overrides

use anyhow::{Context, Result};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use naming::RegistrarConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Example: `GREETER__SERVER__LISTEN` -> `server.listen`
const ENV_PREFIX: &str = "GREETER__";

pub const DEFAULT_SERVICE: &str = "app/grpc/helloworld";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub directory: DirectoryConfig,
    pub registrar: RegistrarConfig,
    pub server: ServerConfig,
    pub gateway: GatewayConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DirectoryKind {
    /// Process-local directory; only meaningful in `standalone` mode.
    #[default]
    Memory,
    Etcd,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DirectoryConfig {
    pub kind: DirectoryKind,
    pub endpoints: Vec<String>,
    #[serde(with = "naming::humantime_serde")]
    pub dial_timeout: Duration,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            kind: DirectoryKind::default(),
            endpoints: vec!["127.0.0.1:2379".to_owned()],
            dial_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Service name the greeter registers under.
    pub name: String,
    /// Socket address the greeter listens on.
    pub listen: String,
    /// Address published in the directory; defaults to the bound address.
    pub advertise: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_SERVICE.to_owned(),
            listen: "127.0.0.1:50051".to_owned(),
            advertise: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    pub listen: String,
    /// Service whose instances receive the forwarded requests.
    pub upstream_service: String,
    #[serde(with = "naming::humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8090".to_owned(),
            upstream_service: DEFAULT_SERVICE.to_owned(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is not set.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            json: false,
        }
    }
}

/// Values given on the command line; `None` leaves the loaded value alone.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub name: Option<String>,
    pub addr: Option<String>,
    pub listen: Option<String>,
    pub directory: Option<DirectoryKind>,
}

impl AppConfig {
    /// Merge defaults, the optional YAML file and the environment.
    ///
    /// # Errors
    /// Returns an error if the file is missing or any layer does not match
    /// the configuration schema.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::figment(path)?
            .extract()
            .context("invalid configuration")
    }

    fn figment(path: Option<&Path>) -> Result<Figment> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            if !path.is_file() {
                anyhow::bail!("config file does not exist: {}", path.display());
            }
            figment = figment.merge(Yaml::file(path));
        }
        Ok(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    pub fn apply_cli_overrides(&mut self, overrides: &CliOverrides) {
        if let Some(name) = &overrides.name {
            self.server.name.clone_from(name);
        }
        if let Some(addr) = &overrides.addr {
            self.server.advertise = Some(addr.clone());
        }
        if let Some(listen) = &overrides.listen {
            self.server.listen.clone_from(listen);
        }
        if let Some(kind) = overrides.directory {
            self.directory.kind = kind;
        }
    }

    /// Effective configuration as pretty-printed JSON.
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    pub fn to_pretty_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("failed to render configuration")
    }
}
