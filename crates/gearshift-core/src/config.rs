use std::collections::BTreeMap;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{GearshiftError, Result};
use crate::task::DEFAULT_CONNECTION;

pub const DEFAULT_GEARMAN_HOST: &str = "127.0.0.1";
pub const DEFAULT_GEARMAN_PORT: u16 = 4730;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_MAX_ITERATIONS: u64 = 720; // one hour at the default poll interval
pub const DEFAULT_LEASE_SECS: u64 = 300;

/// Top-level config (gearshift.toml + GEARSHIFT_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GearshiftConfig {
    #[serde(default = "default_connections")]
    pub connections: BTreeMap<String, ConnectionConfig>,
    #[serde(default)]
    pub workers: BTreeMap<String, WorkerConfig>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

impl Default for GearshiftConfig {
    fn default() -> Self {
        Self {
            connections: default_connections(),
            workers: BTreeMap::new(),
            scheduler: SchedulerConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

/// A named pool of Gearman job servers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Per-call timeout in milliseconds. `None` waits indefinitely.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    pub endpoints: Vec<Endpoint>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: None,
            endpoints: vec![Endpoint::default()],
        }
    }
}

impl ConnectionConfig {
    pub fn timeout(&self) -> Option<std::time::Duration> {
        self.timeout_ms.map(std::time::Duration::from_millis)
    }

    /// `host:port host:port` listing for display.
    pub fn servers(&self) -> String {
        self.endpoints
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A worker profile: which connection it pulls from and what it can run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_connection_name")]
    pub connection: String,
    /// Capability names; each must match a job registered with the worker.
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// An idle worker exits after this long without a job.
    #[serde(default)]
    pub idle_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u64,
    /// How long a promoter owns the due tasks it claimed.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            max_iterations: default_max_iterations(),
            lease_secs: default_lease_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_connections() -> BTreeMap<String, ConnectionConfig> {
    BTreeMap::from([(DEFAULT_CONNECTION.to_string(), ConnectionConfig::default())])
}
fn default_connection_name() -> String {
    DEFAULT_CONNECTION.to_string()
}
fn default_host() -> String {
    DEFAULT_GEARMAN_HOST.to_string()
}
fn default_port() -> u16 {
    DEFAULT_GEARMAN_PORT
}
fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}
fn default_max_iterations() -> u64 {
    DEFAULT_MAX_ITERATIONS
}
fn default_lease_secs() -> u64 {
    DEFAULT_LEASE_SECS
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.gearshift/gearshift.db", home)
}

impl GearshiftConfig {
    /// Load config from a TOML file with GEARSHIFT_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.gearshift/gearshift.toml
    ///
    /// Nested keys in env vars use a double underscore, e.g.
    /// `GEARSHIFT_SCHEDULER__POLL_INTERVAL_SECS=10`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("GEARSHIFT_").split("__"))
            .extract()
            .map_err(|e| GearshiftError::Config(e.to_string()))
    }

    /// Parse config from TOML text only, without env overrides.
    pub fn from_toml(text: &str) -> Result<Self> {
        Figment::new()
            .merge(Toml::string(text))
            .extract()
            .map_err(|e| GearshiftError::Config(e.to_string()))
    }

    pub fn connection(&self, name: &str) -> Result<&ConnectionConfig> {
        self.connections.get(name).ok_or_else(|| {
            GearshiftError::config(format!(
                "Can't create client '{name}'. Connection configuration is missing."
            ))
        })
    }

    /// Resolve a worker profile together with the connection it uses.
    pub fn worker(&self, name: &str) -> Result<(&WorkerConfig, &ConnectionConfig)> {
        let worker = self
            .workers
            .get(name)
            .ok_or_else(|| GearshiftError::config(format!("Worker '{name}' is not configured")))?;
        let connection = self.connections.get(&worker.connection).ok_or_else(|| {
            GearshiftError::config(format!(
                "Connection '{}' requested by worker '{name}' is not configured",
                worker.connection
            ))
        })?;
        Ok((worker, connection))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.gearshift/gearshift.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [scheduler]
        poll_interval_secs = 10
        max_iterations = 3

        [connections.default]
        endpoints = [{ host = "10.0.0.1" }]

        [connections.reports]
        timeout_ms = 2500
        endpoints = [
            { host = "gm-1", port = 4731 },
            { host = "gm-2", port = 4732 },
        ]

        [workers.example]
        capabilities = ["gearshift.example"]

        [workers.renderer]
        connection = "reports"
        capabilities = ["reports.render"]
        description = "Renders monthly reports"

        [workers.orphan]
        connection = "missing"
    "#;

    #[test]
    fn defaults_include_local_default_connection() {
        let config = GearshiftConfig::default();
        let conn = config.connection("default").unwrap();
        assert_eq!(conn.endpoints, vec![Endpoint::default()]);
        assert_eq!(conn.servers(), "127.0.0.1:4730");
        assert!(conn.timeout().is_none());
        assert_eq!(config.scheduler.lease_secs, DEFAULT_LEASE_SECS);
    }

    #[test]
    fn parses_connections_and_workers() {
        let config = GearshiftConfig::from_toml(SAMPLE).unwrap();

        assert_eq!(config.scheduler.poll_interval_secs, 10);
        assert_eq!(config.scheduler.max_iterations, 3);
        assert_eq!(config.scheduler.lease_secs, DEFAULT_LEASE_SECS);

        let default = config.connection("default").unwrap();
        assert_eq!(default.endpoints[0].port, DEFAULT_GEARMAN_PORT);

        let reports = config.connection("reports").unwrap();
        assert_eq!(reports.timeout_ms, Some(2500));
        assert_eq!(reports.servers(), "gm-1:4731 gm-2:4732");

        let (worker, conn) = config.worker("renderer").unwrap();
        assert_eq!(worker.description.as_deref(), Some("Renders monthly reports"));
        assert_eq!(conn, reports);

        let (example, _) = config.worker("example").unwrap();
        assert_eq!(example.connection, "default");
    }

    #[test]
    fn missing_names_are_configuration_errors() {
        let config = GearshiftConfig::from_toml(SAMPLE).unwrap();

        let err = config.connection("nope").unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
        assert!(err.to_string().contains("'nope'"));

        let err = config.worker("ghost").unwrap_err();
        assert!(err.to_string().contains("Worker 'ghost' is not configured"));

        let err = config.worker("orphan").unwrap_err();
        assert!(err
            .to_string()
            .contains("Connection 'missing' requested by worker 'orphan' is not configured"));
    }

    #[test]
    fn malformed_toml_is_a_configuration_error() {
        let err = GearshiftConfig::from_toml("[connections.default]\nendpoints = 5").unwrap_err();
        assert!(matches!(err, GearshiftError::Config(_)));
    }
}
