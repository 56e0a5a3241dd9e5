//! Per-network protocol capabilities
//!
//! Caches the ISUPPORT and MYINFO data a server advertises so the rest of
//! the framework can interpret channel names, mode letters and status
//! prefixes the way this particular ircd means them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::message::{names, Message};

/// Fallback CHANTYPES until the server advertises its own.
pub const DEFAULT_CHANTYPES: &str = "#&";
/// Fallback PREFIX until the server advertises its own.
pub const DEFAULT_PREFIX: &str = "(ov)@+";
/// Fallback CHANMODES until the server advertises its own.
pub const DEFAULT_CHANMODES: &str = "b,k,l,imnpst";

/// Parsed RPL_ISUPPORT and RPL_MYINFO capabilities for one network.
///
/// The owning server keeps this behind its lock and hands out cloned
/// snapshots on every dispatched event, so consumers always read a
/// consistent view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    server_name: String,
    ircd_version: String,
    usermodes: String,
    legacy_chanmodes: String,

    chantypes: String,
    prefix: String,
    chanmodes: String,
    network: String,
    casemapping: String,

    /// Every ISUPPORT token seen, stored verbatim (value empty for bare keys).
    tokens: HashMap<String, String>,
}

impl Default for NetworkInfo {
    fn default() -> Self {
        Self {
            server_name: String::new(),
            ircd_version: String::new(),
            usermodes: String::new(),
            legacy_chanmodes: String::new(),
            chantypes: DEFAULT_CHANTYPES.to_string(),
            prefix: DEFAULT_PREFIX.to_string(),
            chanmodes: DEFAULT_CHANMODES.to_string(),
            network: String::new(),
            casemapping: "rfc1459".to_string(),
            tokens: HashMap::new(),
        }
    }
}

impl NetworkInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingest one RPL_ISUPPORT (005) message.
    ///
    /// Tokens are `KEY` or `KEY=VALUE`. The leading nick parameter and the
    /// trailing "are supported by this server" text are skipped; unknown
    /// tokens are kept verbatim in the token map.
    pub fn parse_isupport(&mut self, msg: &Message) {
        if msg.command != names::RPL_ISUPPORT || msg.params.len() < 2 {
            return;
        }

        let mut tokens: &[String] = &msg.params[1..];
        if let Some(last) = tokens.last() {
            if last.contains(' ') {
                tokens = &tokens[..tokens.len() - 1];
            }
        }

        for token in tokens {
            let (key, value) = match token.split_once('=') {
                Some((k, v)) => (k, v),
                None => (token.as_str(), ""),
            };
            if key.is_empty() {
                continue;
            }
            let key = key.to_uppercase();

            match key.as_str() {
                "CHANTYPES" if !value.is_empty() => self.chantypes = value.to_string(),
                "PREFIX" if !value.is_empty() => self.prefix = value.to_string(),
                "CHANMODES" if !value.is_empty() => self.chanmodes = value.to_string(),
                "NETWORK" => self.network = value.to_string(),
                "CASEMAPPING" if !value.is_empty() => self.casemapping = value.to_string(),
                _ => {}
            }
            self.tokens.insert(key, value.to_string());
        }
    }

    /// Ingest the RPL_MYINFO (004) message.
    ///
    /// Fills the server name, ircd version, user modes and the legacy
    /// channel-mode list used by pre-ISUPPORT servers.
    pub fn parse_myinfo(&mut self, msg: &Message) {
        if msg.command != names::RPL_MYINFO || msg.params.len() < 5 {
            return;
        }
        self.server_name = msg.params[1].clone();
        self.ircd_version = msg.params[2].clone();
        self.usermodes = msg.params[3].clone();
        self.legacy_chanmodes = msg.params[4].clone();
    }

    /// Look up a raw ISUPPORT token. `Some("")` for a bare key.
    pub fn token(&self, key: &str) -> Option<&str> {
        self.tokens.get(&key.to_uppercase()).map(String::as_str)
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn ircd_version(&self) -> &str {
        &self.ircd_version
    }

    pub fn usermodes(&self) -> &str {
        &self.usermodes
    }

    pub fn legacy_chanmodes(&self) -> &str {
        &self.legacy_chanmodes
    }

    pub fn chantypes(&self) -> &str {
        &self.chantypes
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn chanmodes(&self) -> &str {
        &self.chanmodes
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn casemapping(&self) -> &str {
        &self.casemapping
    }

    /// Whether the target string names a channel under this network's
    /// CHANTYPES.
    pub fn is_channel(&self, target: &str) -> bool {
        target
            .chars()
            .next()
            .map(|c| self.chantypes.contains(c))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn isupport(tokens: &[&str]) -> Message {
        let mut params = vec!["bot".to_string()];
        params.extend(tokens.iter().map(|t| t.to_string()));
        params.push("are supported by this server".to_string());
        Message::new(names::RPL_ISUPPORT, params)
    }

    #[test]
    fn test_isupport_recognized_tokens() {
        let mut info = NetworkInfo::new();
        info.parse_isupport(&isupport(&[
            "CHANTYPES=#&!",
            "PREFIX=(qov)~@+",
            "CHANMODES=beI,k,l,imnpst",
            "NETWORK=TestNet",
            "CASEMAPPING=ascii",
        ]));

        assert_eq!(info.chantypes(), "#&!");
        assert_eq!(info.prefix(), "(qov)~@+");
        assert_eq!(info.chanmodes(), "beI,k,l,imnpst");
        assert_eq!(info.network(), "TestNet");
        assert_eq!(info.casemapping(), "ascii");
    }

    #[test]
    fn test_isupport_unknown_tokens_verbatim() {
        let mut info = NetworkInfo::new();
        info.parse_isupport(&isupport(&["EXCEPTS", "MODES=4", "TARGMAX=NAMES:1"]));

        assert_eq!(info.token("EXCEPTS"), Some(""));
        assert_eq!(info.token("MODES"), Some("4"));
        assert_eq!(info.token("targmax"), Some("NAMES:1"));
        assert_eq!(info.token("MISSING"), None);
    }

    #[test]
    fn test_myinfo() {
        let mut info = NetworkInfo::new();
        let msg = Message::new(
            names::RPL_MYINFO,
            vec![
                "bot".to_string(),
                "irc.test.net".to_string(),
                "testircd-1.2".to_string(),
                "acCior".to_string(),
                "beiIklmno".to_string(),
            ],
        );
        info.parse_myinfo(&msg);

        assert_eq!(info.server_name(), "irc.test.net");
        assert_eq!(info.ircd_version(), "testircd-1.2");
        assert_eq!(info.usermodes(), "acCior");
        assert_eq!(info.legacy_chanmodes(), "beiIklmno");
    }

    #[test]
    fn test_defaults_and_is_channel() {
        let info = NetworkInfo::new();
        assert!(info.is_channel("#chan"));
        assert!(info.is_channel("&chan"));
        assert!(!info.is_channel("nick"));
        assert!(!info.is_channel(""));
    }
}
