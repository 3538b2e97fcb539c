//! # Node Configuration
//!
//! Sources, later ones winning:
//!
//! 1. `ServerConfig::default()`
//! 2. JSON file named by `MESHBUS_CONFIG`, if set
//! 3. `MESHBUS_*` environment overrides
//!
//! | Variable | Field |
//! |---|---|
//! | `MESHBUS_ID` | `id` |
//! | `MESHBUS_HOST` | `host` |
//! | `MESHBUS_PORT` | `port` |
//! | `MESHBUS_ADVERTISE_ADDR` | `advertise_addr` |
//! | `MESHBUS_WS_PATH` | `ws_path` |
//! | `MESHBUS_RPC_PATH` | `rpc.path` |
//! | `MESHBUS_RPC_ENABLED` | `rpc.enabled` |
//! | `MESHBUS_PEERS` | `peers`, comma separated, `tls://` prefix for secure |

use anyhow::{Context, Result};
use mesh_server::{PeerConfig, ServerConfig};
use std::path::Path;
use tracing::{info, warn};

/// Environment variable naming the JSON config file.
pub const CONFIG_ENV: &str = "MESHBUS_CONFIG";

const SECURE_PREFIX: &str = "tls://";

/// Load configuration from the process environment.
pub fn load_config() -> Result<ServerConfig> {
    let lookup = |key: &str| std::env::var(key).ok();
    let path = lookup(CONFIG_ENV);
    load_with(path.as_deref().map(Path::new), lookup)
}

/// Load from an optional file, then apply overrides from `lookup`.
pub fn load_with<F>(path: Option<&Path>, lookup: F) -> Result<ServerConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = match path {
        Some(path) => from_file(path)?,
        None => ServerConfig::default(),
    };
    apply_env(&mut config, lookup);
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Read a JSON config file. Missing fields take their defaults.
pub fn from_file(path: &Path) -> Result<ServerConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

/// Apply `MESHBUS_*` overrides. Unparseable values are ignored with a warning.
pub fn apply_env<F>(config: &mut ServerConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(id) = lookup("MESHBUS_ID") {
        config.id = id;
    }
    if let Some(host) = lookup("MESHBUS_HOST") {
        match host.parse() {
            Ok(ip) => config.host = ip,
            Err(_) => warn!("MESHBUS_HOST must be an IP address, got {host}"),
        }
    }
    if let Some(port) = lookup("MESHBUS_PORT") {
        match port.parse() {
            Ok(p) => config.port = p,
            Err(_) => warn!("MESHBUS_PORT must be a port number, got {port}"),
        }
    }
    if let Some(addr) = lookup("MESHBUS_ADVERTISE_ADDR") {
        config.advertise_addr = Some(addr);
    }
    if let Some(path) = lookup("MESHBUS_WS_PATH") {
        config.ws_path = path;
    }
    if let Some(path) = lookup("MESHBUS_RPC_PATH") {
        config.rpc.path = path;
    }
    if let Some(enabled) = lookup("MESHBUS_RPC_ENABLED") {
        match enabled.parse() {
            Ok(flag) => config.rpc.enabled = flag,
            Err(_) => warn!("MESHBUS_RPC_ENABLED must be true or false, got {enabled}"),
        }
    }
    if let Some(peers) = lookup("MESHBUS_PEERS") {
        config.peers = parse_peers(&peers);
    }
}

fn parse_peers(list: &str) -> Vec<PeerConfig> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.strip_prefix(SECURE_PREFIX) {
            Some(address) => PeerConfig {
                address: address.to_string(),
                secure: true,
            },
            None => PeerConfig {
                address: entry.to_string(),
                secure: false,
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use std::time::Duration;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_sources() {
        let config = load_with(None, env(&[])).unwrap();
        assert_eq!(config.port, mesh_server::domain::config::DEFAULT_PORT);
        assert!(config.peers.is_empty());
    }

    #[test]
    fn test_file_then_env() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"id": "node-a", "port": 9400, "reply_timeout": "750ms",
                "rpc": {{"queue_capacity": 16}},
                "peers": [{{"address": "10.0.0.2:9313"}}]}}"#
        )
        .unwrap();

        let config = load_with(Some(file.path()), env(&[("MESHBUS_PORT", "9500")])).unwrap();
        assert_eq!(config.id, "node-a");
        assert_eq!(config.port, 9500);
        assert_eq!(config.reply_timeout, Duration::from_millis(750));
        assert_eq!(config.rpc.queue_capacity, 16);
        assert!(config.rpc.enabled);
        assert_eq!(config.peers.len(), 1);
    }

    #[test]
    fn test_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        assert!(load_with(Some(&missing), env(&[])).is_err());
    }

    #[test]
    fn test_malformed_file_is_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        let err = load_with(Some(file.path()), env(&[])).unwrap_err();
        assert!(err.to_string().contains("Failed to parse"));
    }

    #[test]
    fn test_invalid_values_fail_validation() {
        let err = load_with(None, env(&[("MESHBUS_WS_PATH", "bus")])).unwrap_err();
        assert!(err.to_string().contains("Invalid configuration"));
    }

    #[test]
    fn test_bad_env_values_are_ignored() {
        let config = load_with(
            None,
            env(&[("MESHBUS_PORT", "http"), ("MESHBUS_HOST", "localhost")]),
        )
        .unwrap();
        assert_eq!(config.port, mesh_server::domain::config::DEFAULT_PORT);
        assert_eq!(config.host.to_string(), "127.0.0.1");
    }

    #[test]
    fn test_peer_list() {
        let peers = parse_peers("a:1, tls://b:2,,");
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].address, "a:1");
        assert!(!peers[0].secure);
        assert_eq!(peers[1].address, "b:2");
        assert!(peers[1].secure);
    }
}
