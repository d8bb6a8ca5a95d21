use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use crate::error::RelayError;

// =============================================================================
// Relay config (figment-deserialized from defaults / relay.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   relay.toml:      max_clients = 4
//
//   env var:         RELAY_MAX_CLIENTS=4
//
//   CLI flag:        relay --max-clients 4     (applied by the binary, wins)

pub const DEFAULT_PORT: u16 = 12345;
pub const DEFAULT_MAX_CLIENTS: usize = 10;
pub const DEFAULT_BUFFER_SIZE: usize = 1024;
/// Largest read buffer a worker will allocate.
pub const MAX_BUFFER_SIZE: usize = 1 << 20;

/// Tunables for the relay.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Interface to listen on (an IP literal).
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Registry capacity. Connections beyond this are turned away.
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Size of each worker's read buffer. A single read takes at most
    /// `buffer_size - 1` bytes.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// A broadcast write that takes longer than this marks the receiver dead.
    /// 0 = wait forever.
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
    /// Listen backlog. Defaults to `max_clients`.
    #[serde(default)]
    pub backlog: Option<u32>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_clients: default_max_clients(),
            buffer_size: default_buffer_size(),
            write_timeout_secs: default_write_timeout_secs(),
            backlog: None,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_max_clients() -> usize {
    DEFAULT_MAX_CLIENTS
}
fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}
fn default_write_timeout_secs() -> u64 {
    10
}

impl RelayConfig {
    /// Extract and validate a config from a figment built by [`load_config`].
    pub fn from_figment(figment: &figment::Figment) -> Result<Self, RelayError> {
        let config: RelayConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RelayError> {
        if self.max_clients == 0 {
            return Err(RelayError::Config("max_clients must be at least 1".into()));
        }
        if !(2..=MAX_BUFFER_SIZE).contains(&self.buffer_size) {
            return Err(RelayError::Config(format!(
                "buffer_size must be between 2 and {MAX_BUFFER_SIZE} (got {})",
                self.buffer_size
            )));
        }
        if self.backlog == Some(0) {
            return Err(RelayError::Config("backlog must be at least 1".into()));
        }
        self.bind_addr()?;
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, RelayError> {
        let ip: IpAddr = self
            .host
            .trim()
            .parse()
            .map_err(|source| RelayError::InvalidAddress {
                addr: self.host.clone(),
                source,
            })?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        if self.write_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.write_timeout_secs))
        }
    }

    pub fn listen_backlog(&self) -> u32 {
        self.backlog
            .unwrap_or_else(|| u32::try_from(self.max_clients).unwrap_or(u32::MAX))
    }
}

/// Build a figment that layers: defaults → config file (if any) → RELAY_* env vars.
///
///   `RELAY_PORT=4000`          →  `port = 4000`
///   `RELAY_WRITE_TIMEOUT_SECS=0`  →  `write_timeout_secs = 0`
pub fn load_config(path: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let mut figment = Figment::from(Serialized::defaults(RelayConfig::default()));
    if let Some(path) = path {
        figment = figment.merge(Toml::file(path));
    }
    figment.merge(Env::prefixed("RELAY_"))
}
