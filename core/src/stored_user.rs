//! Persistent user records
//!
//! A [`StoredUser`] is one registered account: a bcrypt password hash, an
//! optional hostmask allowlist, and access granted at three tiers (global,
//! per-network, per-channel). Flag and level checks walk channel, then
//! network, then global.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::utils::Mask;
use crate::{Error, Result};

/// An access grant: a numeric level plus a set of single-letter flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Access {
    pub level: u8,
    flags: u64,
}

fn flag_bit(flag: char) -> Option<u64> {
    match flag {
        'a'..='z' => Some(1 << (flag as u32 - 'a' as u32)),
        'A'..='Z' => Some(1 << (flag as u32 - 'A' as u32 + 26)),
        _ => None,
    }
}

impl Access {
    pub fn new(level: u8, flags: &str) -> Self {
        let mut a = Self { level, flags: 0 };
        a.set_flags(flags);
        a
    }

    pub fn set_flags(&mut self, flags: &str) {
        for c in flags.chars() {
            if let Some(bit) = flag_bit(c) {
                self.flags |= bit;
            }
        }
    }

    pub fn clear_flags(&mut self, flags: &str) {
        for c in flags.chars() {
            if let Some(bit) = flag_bit(c) {
                self.flags &= !bit;
            }
        }
    }

    pub fn has_flag(&self, flag: char) -> bool {
        flag_bit(flag)
            .map(|bit| self.flags & bit == bit)
            .unwrap_or(false)
    }

    pub fn has_level(&self, level: u8) -> bool {
        self.level >= level
    }

    pub fn is_zero(&self) -> bool {
        self.level == 0 && self.flags == 0
    }

    /// The set flags as a sorted string of letters.
    pub fn flags_string(&self) -> String {
        ('a'..='z')
            .chain('A'..='Z')
            .filter(|&c| self.has_flag(c))
            .collect()
    }
}

/// One registered user record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredUser {
    username: String,
    password: String,
    masks: Vec<String>,
    global: Access,
    networks: HashMap<String, Access>,
    channels: HashMap<String, Access>,
}

fn channel_key(network: &str, channel: &str) -> String {
    format!("{}:{}", network.to_lowercase(), channel.to_lowercase())
}

impl StoredUser {
    /// Create a record, hashing the password with the default bcrypt cost.
    pub fn new(username: &str, password: &str) -> Result<Self> {
        Self::with_cost(username, password, bcrypt::DEFAULT_COST)
    }

    /// Create a record with an explicit bcrypt cost. Tests use the minimum
    /// cost to stay fast.
    pub fn with_cost(username: &str, password: &str, cost: u32) -> Result<Self> {
        if username.is_empty() {
            return Err(Error::ConfigInvalid("Empty username".to_string()));
        }
        Ok(Self {
            username: username.to_lowercase(),
            password: bcrypt::hash(password, cost)?,
            masks: Vec::new(),
            global: Access::default(),
            networks: HashMap::new(),
            channels: HashMap::new(),
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn verify_password(&self, password: &str) -> bool {
        bcrypt::verify(password, &self.password).unwrap_or(false)
    }

    pub fn set_password(&mut self, password: &str) -> Result<()> {
        self.password = bcrypt::hash(password, bcrypt::DEFAULT_COST)?;
        Ok(())
    }

    pub fn masks(&self) -> &[String] {
        &self.masks
    }

    pub fn add_mask(&mut self, mask: &str) -> bool {
        if self.masks.iter().any(|m| m.eq_ignore_ascii_case(mask)) {
            return false;
        }
        self.masks.push(mask.to_string());
        true
    }

    pub fn remove_mask(&mut self, mask: &str) -> bool {
        let before = self.masks.len();
        self.masks.retain(|m| !m.eq_ignore_ascii_case(mask));
        before != self.masks.len()
    }

    /// Whether any allowlisted mask matches the host. An empty allowlist
    /// matches nothing; callers decide whether that means "unrestricted".
    pub fn mask_matches(&self, host: &str) -> bool {
        self.masks.iter().any(|m| Mask(m).matches(host))
    }

    /// Grant access. Empty network targets the global tier; a channel
    /// requires its network.
    pub fn grant(&mut self, network: &str, channel: &str, level: u8, flags: &str) {
        let access = self.access_mut(network, channel);
        access.level = access.level.max(level);
        access.set_flags(flags);
    }

    /// Revoke the whole grant at one tier.
    pub fn revoke(&mut self, network: &str, channel: &str) {
        if network.is_empty() {
            self.global = Access::default();
        } else if channel.is_empty() {
            self.networks.remove(&network.to_lowercase());
        } else {
            self.channels.remove(&channel_key(network, channel));
        }
    }

    fn access_mut(&mut self, network: &str, channel: &str) -> &mut Access {
        if network.is_empty() {
            &mut self.global
        } else if channel.is_empty() {
            self.networks
                .entry(network.to_lowercase())
                .or_default()
        } else {
            self.channels
                .entry(channel_key(network, channel))
                .or_default()
        }
    }

    fn tiers(&self, network: &str, channel: &str) -> impl Iterator<Item = &Access> {
        let chan = if network.is_empty() || channel.is_empty() {
            None
        } else {
            self.channels.get(&channel_key(network, channel))
        };
        let net = if network.is_empty() {
            None
        } else {
            self.networks.get(&network.to_lowercase())
        };
        chan.into_iter().chain(net).chain(Some(&self.global))
    }

    /// Flag check walking channel, then network, then global.
    pub fn has_flag(&self, network: &str, channel: &str, flag: char) -> bool {
        self.tiers(network, channel).any(|a| a.has_flag(flag))
    }

    /// Every letter in `flags` must be held at some tier.
    pub fn has_flags(&self, network: &str, channel: &str, flags: &str) -> bool {
        flags.chars().all(|f| self.has_flag(network, channel, f))
    }

    /// Level check walking channel, then network, then global.
    pub fn has_level(&self, network: &str, channel: &str, level: u8) -> bool {
        self.tiers(network, channel).any(|a| a.has_level(level))
    }

    /// The effective access at the most specific populated tier.
    pub fn access(&self, network: &str, channel: &str) -> Access {
        self.tiers(network, channel)
            .find(|a| !a.is_zero())
            .copied()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COST: u32 = 4;

    fn user() -> StoredUser {
        StoredUser::with_cost("Admin", "hunter2", COST).unwrap()
    }

    #[test]
    fn test_password() {
        let u = user();
        assert_eq!(u.username(), "admin");
        assert!(u.verify_password("hunter2"));
        assert!(!u.verify_password("wrong"));
    }

    #[test]
    fn test_access_flags() {
        let mut a = Access::new(5, "abo");
        assert!(a.has_flag('a'));
        assert!(a.has_flag('o'));
        assert!(!a.has_flag('z'));
        assert!(!a.has_flag('!'));
        assert!(a.has_level(5));
        assert!(!a.has_level(6));
        assert_eq!(a.flags_string(), "abo");

        a.clear_flags("b");
        assert!(!a.has_flag('b'));
        a.set_flags("Z");
        assert!(a.has_flag('Z'));
    }

    #[test]
    fn test_flag_tier_walk() {
        let mut u = user();
        u.grant("", "", 1, "g");
        u.grant("net", "", 2, "n");
        u.grant("net", "#chan", 3, "c");

        assert!(u.has_flag("net", "#chan", 'c'));
        assert!(u.has_flag("net", "#chan", 'n'));
        assert!(u.has_flag("net", "#chan", 'g'));
        assert!(u.has_flag("net", "", 'n'));
        assert!(!u.has_flag("net", "", 'c'));
        assert!(u.has_flag("other", "", 'g'));
        assert!(!u.has_flag("other", "", 'n'));

        assert!(u.has_level("net", "#chan", 3));
        assert!(!u.has_level("net", "", 3));
        assert!(u.has_level("", "", 1));

        // Case-insensitive keys.
        assert!(u.has_flag("NET", "#CHAN", 'c'));
    }

    #[test]
    fn test_revoke() {
        let mut u = user();
        u.grant("net", "#chan", 3, "c");
        u.revoke("net", "#chan");
        assert!(!u.has_flag("net", "#chan", 'c'));
    }

    #[test]
    fn test_masks() {
        let mut u = user();
        assert!(u.add_mask("*!*@trusted.org"));
        assert!(!u.add_mask("*!*@TRUSTED.org"));
        assert!(u.mask_matches("admin!user@trusted.org"));
        assert!(!u.mask_matches("admin!user@evil.org"));
        assert!(u.remove_mask("*!*@trusted.org"));
        assert!(!u.mask_matches("admin!user@trusted.org"));
    }

    #[test]
    fn test_serde_round_trip() {
        let mut u = user();
        u.grant("net", "#chan", 3, "c");
        u.add_mask("*!*@host");
        let bytes = serde_json::to_vec(&u).unwrap();
        let back: StoredUser = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(u, back);
    }
}
