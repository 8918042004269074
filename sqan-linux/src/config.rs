//! Load config from file and environment.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use sqan_core::{NodeId, Settings};

use crate::logging::LogFormat;
use crate::relay::RelaySettings;

/// Default relay TCP port.
pub const DEFAULT_PORT: u16 = 1716;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Server,
    Client,
}

/// Daemon configuration. File: ~/.config/sqan/config.toml or /etc/sqan/config.toml.
/// Env overrides: SQAN_NODE_ID, SQAN_ROLE, SQAN_LISTEN_PORT, SQAN_SERVER, SQAN_CALLSIGN, SQAN_LOG_FORMAT.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Fixed node id; random when absent.
    #[serde(default)]
    pub node_id: Option<i32>,
    #[serde(default)]
    pub role: Role,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: IpAddr,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// `host:port` of the relay server, client role only.
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub callsign: Option<String>,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default)]
    pub mesh: Settings,
    #[serde(default)]
    pub relay: RelaySettings,
}

fn default_listen_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_listen_port() -> u16 {
    DEFAULT_PORT
}
fn default_heartbeat_secs() -> u64 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: None,
            role: Role::default(),
            listen_addr: default_listen_addr(),
            listen_port: default_listen_port(),
            server: None,
            callsign: None,
            heartbeat_secs: default_heartbeat_secs(),
            log_format: LogFormat::default(),
            mesh: Settings::default(),
            relay: RelaySettings::default(),
        }
    }
}

impl Config {
    pub fn node_id(&self) -> NodeId {
        self.node_id.map(NodeId).unwrap_or_else(NodeId::random)
    }

    pub fn listen(&self) -> SocketAddr {
        SocketAddr::new(self.listen_addr, self.listen_port)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    /// Server address for the client role; `localhost` on the default port when unset.
    pub fn server_addr(&self) -> String {
        self.server
            .clone()
            .unwrap_or_else(|| format!("localhost:{}", DEFAULT_PORT))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value {value:?} for {var}")]
    Env { var: &'static str, value: String },
    #[error(transparent)]
    Settings(#[from] sqan_core::SettingsError),
}

/// Load config: default, then the first config file found, then env vars.
pub fn load() -> Result<Config, ConfigError> {
    let mut c = match config_paths().into_iter().find(|p| p.exists()) {
        Some(path) => load_file(&path)?,
        None => Config::default(),
    };
    apply_env(&mut c, |var| std::env::var(var).ok())?;
    c.mesh.validate()?;
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/sqan/config.toml"));
    }
    out.push(PathBuf::from("/etc/sqan/config.toml"));
    out
}

fn load_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_owned(),
        source,
    })?;
    toml::from_str(&s).map_err(|source| ConfigError::Parse {
        path: path.to_owned(),
        source,
    })
}

/// Apply overrides from `lookup` (the process environment outside tests).
fn apply_env(c: &mut Config, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
    fn bad(var: &'static str, value: String) -> ConfigError {
        ConfigError::Env { var, value }
    }
    if let Some(v) = lookup("SQAN_NODE_ID") {
        c.node_id = Some(v.trim().parse().map_err(|_| bad("SQAN_NODE_ID", v.clone()))?);
    }
    if let Some(v) = lookup("SQAN_ROLE") {
        c.role = match v.trim().to_ascii_lowercase().as_str() {
            "server" => Role::Server,
            "client" => Role::Client,
            _ => return Err(bad("SQAN_ROLE", v)),
        };
    }
    if let Some(v) = lookup("SQAN_LISTEN_PORT") {
        c.listen_port = v.trim().parse().map_err(|_| bad("SQAN_LISTEN_PORT", v.clone()))?;
    }
    if let Some(v) = lookup("SQAN_SERVER") {
        c.server = Some(v);
    }
    if let Some(v) = lookup("SQAN_CALLSIGN") {
        c.callsign = Some(v);
    }
    if let Some(v) = lookup("SQAN_LOG_FORMAT") {
        c.log_format = LogFormat::parse(&v).ok_or_else(|| bad("SQAN_LOG_FORMAT", v.clone()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn empty_file_gives_defaults() {
        let c: Config = toml::from_str("").unwrap();
        assert_eq!(c.role, Role::Server);
        assert_eq!(c.listen_port, DEFAULT_PORT);
        assert_eq!(c.heartbeat_secs, 5);
        assert_eq!(c.mesh.max_hops, 4);
        assert_eq!(c.relay.queue_factor, 100);
        assert_eq!(c.listen().to_string(), "0.0.0.0:1716");
    }

    #[test]
    fn nested_tables_parse() {
        let c: Config = toml::from_str(
            r#"
            role = "client"
            server = "10.0.0.1:1716"
            callsign = "alpha"
            log_format = "json"

            [mesh]
            max_hops = 2

            [relay]
            reconnect_spacing_ms = 500
            "#,
        )
        .unwrap();
        assert_eq!(c.role, Role::Client);
        assert_eq!(c.server_addr(), "10.0.0.1:1716");
        assert_eq!(c.log_format, LogFormat::Json);
        assert_eq!(c.mesh.max_hops, 2);
        assert_eq!(c.relay.reconnect_spacing(), Duration::from_millis(500));
    }

    #[test]
    fn unknown_field_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128").is_err());
    }

    #[test]
    fn env_overrides_file() {
        let mut c = Config::default();
        apply_env(
            &mut c,
            env(&[
                ("SQAN_NODE_ID", "42"),
                ("SQAN_ROLE", "Client"),
                ("SQAN_LISTEN_PORT", "9000"),
                ("SQAN_CALLSIGN", "bravo"),
            ]),
        )
        .unwrap();
        assert_eq!(c.node_id(), NodeId(42));
        assert_eq!(c.role, Role::Client);
        assert_eq!(c.listen_port, 9000);
        assert_eq!(c.callsign.as_deref(), Some("bravo"));
    }

    #[test]
    fn bad_env_value_is_an_error() {
        let mut c = Config::default();
        let err = apply_env(&mut c, env(&[("SQAN_LISTEN_PORT", "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::Env { var: "SQAN_LISTEN_PORT", .. }));
    }
}
