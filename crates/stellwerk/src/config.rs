//! Configuration: TOML file with serde defaults, `STELLWERK_*`
//! environment overrides, and a validation pass.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::channel::ProbeConfig;
use crate::error::StellwerkError;
use crate::transport::Transport;

/// Full configuration of one stellwerk node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StellwerkConfig {
    #[serde(default)]
    pub node: NodeConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    /// Receive-channel probe timing.
    #[serde(default)]
    pub probe: ProbeConfig,
}

/// Node section: how many processing units this host runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Total processing units, scheduler included.
    #[serde(default = "default_units")]
    pub units: u32,
}

fn default_units() -> u32 {
    4
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            units: default_units(),
        }
    }
}

/// Transport family for the unit endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Ipc,
    Tcp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_kind")]
    pub kind: TransportKind,

    /// TCP host (only used with `kind = "tcp"`).
    #[serde(default = "default_host")]
    pub host: String,

    /// TCP base port; unit `r` binds `base_port + r`.
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// IPC socket name prefix; unit `r` binds `<prefix>-<r>`.
    #[serde(default = "default_ipc_prefix")]
    pub ipc_prefix: String,
}

fn default_kind() -> TransportKind {
    TransportKind::Ipc
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_base_port() -> u16 {
    5600
}

fn default_ipc_prefix() -> String {
    "node".into()
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: default_kind(),
            host: default_host(),
            base_port: default_base_port(),
            ipc_prefix: default_ipc_prefix(),
        }
    }
}

impl TransportConfig {
    /// The node base address unit endpoints derive from.
    pub fn base(&self) -> Transport {
        match self.kind {
            TransportKind::Ipc => Transport::ipc(&self.ipc_prefix),
            TransportKind::Tcp => Transport::tcp(self.host.clone(), self.base_port),
        }
    }
}

impl StellwerkConfig {
    /// Load from a TOML file, apply environment overrides, validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StellwerkError> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&raw)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self, StellwerkError> {
        let mut config = Self::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Some(units) = env_parse::<u32>("STELLWERK_UNITS") {
            self.node.units = units;
        }
        if let Ok(kind) = std::env::var("STELLWERK_TRANSPORT") {
            match kind.as_str() {
                "ipc" => self.transport.kind = TransportKind::Ipc,
                "tcp" => self.transport.kind = TransportKind::Tcp,
                other => warn!(value = other, "ignoring unknown STELLWERK_TRANSPORT"),
            }
        }
        if let Ok(host) = std::env::var("STELLWERK_HOST") {
            self.transport.host = host;
        }
        if let Some(port) = env_parse::<u16>("STELLWERK_BASE_PORT") {
            self.transport.base_port = port;
        }
        if let Ok(prefix) = std::env::var("STELLWERK_IPC_PREFIX") {
            self.transport.ipc_prefix = prefix;
        }
    }

    pub fn validate(&self) -> Result<(), StellwerkError> {
        if self.node.units < 2 {
            return Err(StellwerkError::Config(format!(
                "a node needs at least 2 units (scheduler + worker), got {}",
                self.node.units
            )));
        }
        if self.probe.base_delay_ms == 0 {
            return Err(StellwerkError::Config(
                "probe.base_delay_ms must be at least 1".into(),
            ));
        }
        if self.probe.base_delay_ms > self.probe.max_delay_ms {
            return Err(StellwerkError::Config(format!(
                "probe.base_delay_ms {} exceeds probe.max_delay_ms {}",
                self.probe.base_delay_ms, self.probe.max_delay_ms
            )));
        }
        if self.transport.kind == TransportKind::Tcp
            && u32::from(self.transport.base_port) + self.node.units > 65536
        {
            return Err(StellwerkError::Config(format!(
                "base_port {} leaves no room for {} unit endpoints",
                self.transport.base_port, self.node.units
            )));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(var = name, value = raw, "ignoring unparsable environment override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = StellwerkConfig::default();
        config.validate().unwrap();
        assert_eq!(config.node.units, 4);
        assert_eq!(config.transport.kind, TransportKind::Ipc);
        assert_eq!(config.probe.max_delay_ms, 300);
    }

    #[test]
    fn parse_minimal_toml() {
        let config: StellwerkConfig = toml::from_str(
            r#"
            [node]
            units = 8

            [transport]
            kind = "tcp"
            host = "10.0.0.5"
            base_port = 7000
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.node.units, 8);
        assert_eq!(
            config.transport.base().endpoint(),
            "tcp://10.0.0.5:7000"
        );
        // untouched sections keep their defaults
        assert_eq!(config.probe.base_delay_ms, 2);
    }

    #[test]
    fn single_unit_node_is_rejected() {
        let mut config = StellwerkConfig::default();
        config.node.units = 1;
        assert!(matches!(
            config.validate(),
            Err(StellwerkError::Config(_))
        ));
    }

    #[test]
    fn inverted_probe_delays_are_rejected() {
        let mut config = StellwerkConfig::default();
        config.probe.base_delay_ms = 500;
        assert!(config.validate().is_err());
    }

    #[test]
    fn tcp_port_space_is_checked() {
        let mut config = StellwerkConfig::default();
        config.transport.kind = TransportKind::Tcp;
        config.transport.base_port = 65530;
        config.node.units = 10;
        assert!(config.validate().is_err());
    }
}
