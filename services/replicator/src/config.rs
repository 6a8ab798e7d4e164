//! Replication controller configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides for the
//! `process/Replication` section itself. Default path:
//! `/etc/replctl/replication.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `[process.replication]` with `server`, `auth`, `provider`, `application`, `oauth2`
//! - `[database]` with `url`
//!
//! # oauth2 credentials file format
//! JSON object: `{"key_id", "secret", "issuer", "audience", "token_endpoint"}`.

use serde::Deserialize;
use std::path::Path;

// ---------------------------------------------------------------------------
// Config types (validated)
// ---------------------------------------------------------------------------

/// Top-level controller configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub schema_version: u32,
    pub replication: ReplicationConfig,
    pub database: DatabaseConfig,
    pub heartbeat: HeartbeatConfig,
}

/// Replication mode, selected at configuration and immutable after reload
/// within one process lifetime (a reload still re-reads it from disk).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Slave,
    Proxy,
    Master,
}

impl Mode {
    fn parse(s: &str) -> Result<Self, ConfigError> {
        match s {
            "slave" => Ok(Mode::Slave),
            "proxy" => Ok(Mode::Proxy),
            "master" => Ok(Mode::Master),
            other => Err(ConfigError::InvalidValue(format!(
                "process.replication.mode must be slave|proxy|master, got '{}'",
                other
            ))),
        }
    }

    pub fn is_publisher(self) -> bool {
        matches!(self, Mode::Master)
    }

    pub fn marks_proxied_rows(self) -> bool {
        matches!(self, Mode::Proxy)
    }
}

#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    pub mode: Mode,
    /// This node's logical name; defaults to the local host name.
    pub source: String,
    /// Peer WebSocket base URL.
    pub server: String,
    /// Auth server base URL (token endpoint lives under it).
    pub auth: String,
    pub provider: String,
    pub application: String,
    /// Path to the oauth2 provider credentials file.
    pub oauth2: String,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub listen_channel: String,
    pub pool_min: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    pub tick_ms: u64,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    process: Option<RawProcess>,
    database: Option<RawDatabaseConfig>,
    heartbeat: Option<RawHeartbeatConfig>,
}

#[derive(Debug, Deserialize)]
struct RawProcess {
    replication: Option<RawReplicationConfig>,
}

#[derive(Debug, Deserialize)]
struct RawReplicationConfig {
    mode: Option<String>,
    source: Option<String>,
    server: Option<String>,
    auth: Option<String>,
    provider: Option<String>,
    application: Option<String>,
    oauth2: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawDatabaseConfig {
    url: Option<String>,
    listen_channel: Option<String>,
    pool_min: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawHeartbeatConfig {
    tick_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load controller config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<ControllerConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load controller config from the default path `/etc/replctl/replication.toml`.
pub fn load_config() -> Result<ControllerConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/replctl/replication.toml"))
}

/// Load controller config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<ControllerConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {}",
            schema_version
        )));
    }

    let raw_replication = raw
        .process
        .and_then(|p| p.replication)
        .ok_or_else(|| ConfigError::MissingField("process.replication".to_owned()))?;

    let mode = match raw_replication.mode {
        Some(m) => Mode::parse(&m)?,
        None => Mode::Slave,
    };
    let source = match raw_replication.source {
        Some(s) => s,
        None => local_host_name()?,
    };
    let server = raw_replication
        .server
        .ok_or_else(|| ConfigError::MissingField("process.replication.server".to_owned()))?;
    let auth = raw_replication
        .auth
        .ok_or_else(|| ConfigError::MissingField("process.replication.auth".to_owned()))?;
    let provider = raw_replication
        .provider
        .ok_or_else(|| ConfigError::MissingField("process.replication.provider".to_owned()))?;
    let application = raw_replication
        .application
        .ok_or_else(|| ConfigError::MissingField("process.replication.application".to_owned()))?;
    let oauth2 = raw_replication
        .oauth2
        .ok_or_else(|| ConfigError::MissingField("process.replication.oauth2".to_owned()))?;

    let raw_database = raw
        .database
        .ok_or_else(|| ConfigError::MissingField("database".to_owned()))?;
    let url = raw_database
        .url
        .ok_or_else(|| ConfigError::MissingField("database.url".to_owned()))?;
    let database = DatabaseConfig {
        url,
        listen_channel: raw_database
            .listen_channel
            .unwrap_or_else(|| "replication".to_owned()),
        pool_min: raw_database.pool_min.unwrap_or(4),
    };

    let heartbeat = HeartbeatConfig {
        tick_ms: raw.heartbeat.and_then(|h| h.tick_ms).unwrap_or(1000),
    };

    Ok(ControllerConfig {
        schema_version,
        replication: ReplicationConfig {
            mode,
            source,
            server,
            auth,
            provider,
            application,
            oauth2,
        },
        database,
        heartbeat,
    })
}

/// Read and parse the oauth2 provider credentials file referenced by
/// `process.replication.oauth2`.
pub fn load_oauth2_credentials(path: &str) -> Result<crate::auth::ProviderCredentials, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading oauth2 file '{}': {}", path, e)))?;
    serde_json::from_str(&content)
        .map_err(|e| ConfigError::Parse(format!("oauth2 file '{}': {}", path, e)))
}

fn local_host_name() -> Result<String, ConfigError> {
    let uname = std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok().map(|s| s.trim().to_owned()));
    uname.ok_or_else(|| {
        ConfigError::InvalidValue(
            "process.replication.source omitted and host name could not be determined".to_owned(),
        )
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingField(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {}", s),
            ConfigError::Parse(s) => write!(f, "Parse error: {}", s),
            ConfigError::MissingField(s) => write!(f, "Missing required field: {}", s),
            ConfigError::InvalidValue(s) => write!(f, "Invalid config value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_toml() -> &'static str {
        r#"
            schema_version = 1

            [process.replication]
            mode = "master"
            source = "node-a"
            server = "wss://peer.example.com/ws/replication"
            auth = "https://auth.example.com"
            provider = "internal"
            application = "replication-controller"
            oauth2 = "/etc/replctl/oauth2-internal.json"

            [database]
            url = "postgres://replctl@localhost/app"
        "#
    }

    #[test]
    fn loads_required_fields_and_applies_defaults() {
        let cfg = load_config_from_str(sample_toml()).unwrap();
        assert_eq!(cfg.replication.mode, Mode::Master);
        assert_eq!(cfg.replication.source, "node-a");
        assert_eq!(cfg.database.listen_channel, "replication");
        assert_eq!(cfg.database.pool_min, 4);
        assert_eq!(cfg.heartbeat.tick_ms, 1000);
    }

    #[test]
    fn rejects_unknown_mode() {
        let toml_str = sample_toml().replace("master", "rogue");
        let err = load_config_from_str(&toml_str).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn rejects_wrong_schema_version() {
        let toml_str = sample_toml().replace("schema_version = 1", "schema_version = 2");
        let err = load_config_from_str(&toml_str).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn missing_server_is_an_error() {
        let toml_str = sample_toml().replace("server = \"wss://peer.example.com/ws/replication\"", "");
        let err = load_config_from_str(&toml_str).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(_)));
    }
}
