//! Configuration management
//!
//! The framework does not parse configuration files; embedders build a
//! [`Config`] in code (or deserialize one with serde) and hand it to the
//! bot. Every network key falls back to the global section and then to a
//! hard-coded default, resolved through [`NetworkContext`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default command prefix rune.
pub const DEFAULT_PREFIX: char = '.';
/// Default flood penalty divisor in bytes per second owed.
pub const DEFAULT_FLOOD_LEN_PENALTY: u64 = 120;
/// Default flood penalty ceiling in seconds.
pub const DEFAULT_FLOOD_TIMEOUT: f64 = 10.0;
/// Default flood penalty decay in seconds per second.
pub const DEFAULT_FLOOD_STEP: f64 = 2.0;
/// Default keepalive interval in seconds.
pub const DEFAULT_KEEP_ALIVE: f64 = 60.0;
/// Default reconnect backoff base in seconds.
pub const DEFAULT_RECONNECT_TIMEOUT: u64 = 10;
/// Default QUIT message on clean shutdown.
pub const DEFAULT_QUIT_MESSAGE: &str = "ironbot exiting";

/// One channel to join, with an optional key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    #[serde(default)]
    pub password: Option<String>,
}

impl ChannelConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            password: None,
        }
    }

    pub fn with_password(name: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            password: Some(password.into()),
        }
    }
}

/// Per-network settings. Every field is optional; unset fields resolve
/// through the global section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub nick: Option<String>,
    pub altnick: Option<String>,
    pub username: Option<String>,
    pub realname: Option<String>,
    pub password: Option<String>,

    pub ssl: Option<bool>,
    pub ssl_cert: Option<PathBuf>,
    pub no_verify_cert: Option<bool>,

    /// Servers as `host:port`, tried in rotation.
    pub servers: Option<Vec<String>>,
    pub channels: Option<Vec<ChannelConfig>>,

    pub prefix: Option<char>,

    pub no_state: Option<bool>,
    pub no_store: Option<bool>,
    pub no_auto_join: Option<bool>,
    pub no_reconnect: Option<bool>,

    /// Delay between autojoins, in milliseconds.
    pub join_delay: Option<u64>,
    /// Reconnect backoff base, in seconds.
    pub reconnect_timeout: Option<u64>,

    pub flood_len_penalty: Option<u64>,
    pub flood_timeout: Option<f64>,
    pub flood_step: Option<f64>,
    pub keep_alive: Option<f64>,

    /// QUIT message sent on clean shutdown.
    pub quit_message: Option<String>,
}

/// Full bot configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub global: NetworkConfig,
    pub networks: HashMap<String, NetworkConfig>,
    /// Path of the stored-user database; `None` keeps it in memory.
    pub store_file: Option<PathBuf>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// The settings for a network, or a fresh entry to fill in.
    pub fn network_mut(&mut self, id: &str) -> &mut NetworkConfig {
        self.networks.entry(id.to_string()).or_default()
    }

    /// A resolver for one network; unknown ids resolve purely through the
    /// global section.
    pub fn network(&self, id: &str) -> NetworkContext<'_> {
        NetworkContext {
            net: self.networks.get(id),
            global: &self.global,
        }
    }

    /// Check the configuration is complete enough to run.
    pub fn validate(&self) -> Result<()> {
        if self.networks.is_empty() {
            return Err(Error::ConfigInvalid("No networks defined".to_string()));
        }
        for id in self.networks.keys() {
            let ctx = self.network(id);
            if ctx.nick().is_empty() {
                return Err(Error::ConfigInvalid(format!("Network {} has no nick", id)));
            }
            if ctx.username().is_empty() {
                return Err(Error::ConfigInvalid(format!(
                    "Network {} has no username",
                    id
                )));
            }
            if ctx.realname().is_empty() {
                return Err(Error::ConfigInvalid(format!(
                    "Network {} has no realname",
                    id
                )));
            }
            if ctx.servers().is_empty() {
                return Err(Error::ConfigInvalid(format!(
                    "Network {} has no servers",
                    id
                )));
            }
        }
        Ok(())
    }
}

/// Two-level resolver: network key, then global key, then hard default.
#[derive(Debug, Clone, Copy)]
pub struct NetworkContext<'a> {
    net: Option<&'a NetworkConfig>,
    global: &'a NetworkConfig,
}

macro_rules! resolve {
    ($self:ident, $field:ident) => {
        $self
            .net
            .and_then(|n| n.$field.as_ref())
            .or($self.global.$field.as_ref())
    };
}

impl<'a> NetworkContext<'a> {
    pub fn nick(&self) -> String {
        resolve!(self, nick).cloned().unwrap_or_default()
    }

    pub fn altnick(&self) -> Option<String> {
        resolve!(self, altnick).cloned()
    }

    pub fn username(&self) -> String {
        resolve!(self, username).cloned().unwrap_or_default()
    }

    pub fn realname(&self) -> String {
        resolve!(self, realname).cloned().unwrap_or_default()
    }

    pub fn password(&self) -> Option<String> {
        resolve!(self, password).cloned()
    }

    pub fn ssl(&self) -> bool {
        resolve!(self, ssl).copied().unwrap_or(false)
    }

    pub fn ssl_cert(&self) -> Option<PathBuf> {
        resolve!(self, ssl_cert).cloned()
    }

    pub fn no_verify_cert(&self) -> bool {
        resolve!(self, no_verify_cert).copied().unwrap_or(false)
    }

    pub fn servers(&self) -> Vec<String> {
        resolve!(self, servers).cloned().unwrap_or_default()
    }

    pub fn channels(&self) -> Vec<ChannelConfig> {
        resolve!(self, channels).cloned().unwrap_or_default()
    }

    pub fn prefix(&self) -> char {
        resolve!(self, prefix).copied().unwrap_or(DEFAULT_PREFIX)
    }

    pub fn no_state(&self) -> bool {
        resolve!(self, no_state).copied().unwrap_or(false)
    }

    pub fn no_store(&self) -> bool {
        resolve!(self, no_store).copied().unwrap_or(false)
    }

    pub fn no_auto_join(&self) -> bool {
        resolve!(self, no_auto_join).copied().unwrap_or(false)
    }

    pub fn no_reconnect(&self) -> bool {
        resolve!(self, no_reconnect).copied().unwrap_or(false)
    }

    pub fn join_delay(&self) -> Duration {
        Duration::from_millis(resolve!(self, join_delay).copied().unwrap_or(0))
    }

    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_secs(
            resolve!(self, reconnect_timeout)
                .copied()
                .unwrap_or(DEFAULT_RECONNECT_TIMEOUT),
        )
    }

    pub fn flood_len_penalty(&self) -> u64 {
        resolve!(self, flood_len_penalty)
            .copied()
            .unwrap_or(DEFAULT_FLOOD_LEN_PENALTY)
    }

    pub fn flood_timeout(&self) -> Duration {
        Duration::from_secs_f64(
            resolve!(self, flood_timeout)
                .copied()
                .unwrap_or(DEFAULT_FLOOD_TIMEOUT),
        )
    }

    pub fn flood_step(&self) -> Duration {
        Duration::from_secs_f64(
            resolve!(self, flood_step).copied().unwrap_or(DEFAULT_FLOOD_STEP),
        )
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs_f64(
            resolve!(self, keep_alive).copied().unwrap_or(DEFAULT_KEEP_ALIVE),
        )
    }

    pub fn quit_message(&self) -> String {
        resolve!(self, quit_message)
            .cloned()
            .unwrap_or_else(|| DEFAULT_QUIT_MESSAGE.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        let mut cfg = Config::new();
        cfg.global.nick = Some("bot".to_string());
        cfg.global.username = Some("bot".to_string());
        cfg.global.realname = Some("An IRC bot".to_string());
        let net = cfg.network_mut("testnet");
        net.servers = Some(vec!["irc.test.net:6667".to_string()]);
        cfg
    }

    #[test]
    fn test_network_overrides_global() {
        let mut cfg = config();
        cfg.network_mut("testnet").nick = Some("other".to_string());

        assert_eq!(cfg.network("testnet").nick(), "other");
        assert_eq!(cfg.network("elsewhere").nick(), "bot");
    }

    #[test]
    fn test_hard_defaults() {
        let cfg = config();
        let ctx = cfg.network("testnet");
        assert_eq!(ctx.prefix(), '.');
        assert_eq!(ctx.flood_len_penalty(), 120);
        assert_eq!(ctx.flood_timeout(), Duration::from_secs(10));
        assert_eq!(ctx.flood_step(), Duration::from_secs(2));
        assert_eq!(ctx.keep_alive(), Duration::from_secs(60));
        assert_eq!(ctx.reconnect_timeout(), Duration::from_secs(10));
        assert_eq!(ctx.join_delay(), Duration::ZERO);
        assert!(!ctx.ssl());
        assert!(!ctx.no_state());
    }

    #[test]
    fn test_validate() {
        assert!(config().validate().is_ok());

        let mut missing_nick = config();
        missing_nick.global.nick = None;
        assert!(matches!(
            missing_nick.validate(),
            Err(Error::ConfigInvalid(_))
        ));

        let mut no_servers = config();
        no_servers.network_mut("testnet").servers = None;
        assert!(no_servers.validate().is_err());

        let empty = Config::new();
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_serde_shape() {
        let json = r##"{
            "global": {"nick": "bot", "username": "bot", "realname": "r"},
            "networks": {
                "net": {
                    "servers": ["irc.example.org:6697"],
                    "ssl": true,
                    "channels": [{"name": "#chan", "password": "key"}]
                }
            }
        }"##;
        let cfg: Config = serde_json::from_str(json).unwrap();
        let ctx = cfg.network("net");
        assert!(ctx.ssl());
        assert_eq!(ctx.channels()[0].name, "#chan");
        assert_eq!(ctx.channels()[0].password.as_deref(), Some("key"));
        assert!(cfg.validate().is_ok());
    }
}
