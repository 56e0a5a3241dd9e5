//! Channel modes and the CHANMODES kind classifier
//!
//! CHANMODES partitions a network's channel-mode letters into four groups
//! by argument semantics: address lists (bans), modes that always take an
//! argument, modes that take one only when set, and plain boolean flags.
//! Every raw mode string is routed through this classifier; status-mode
//! letters from PREFIX are not channel modes and are handed back to the
//! caller as user-mode deltas.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::user_modes::UserModeKinds;
use crate::{Error, Result};

/// Argument semantics of one channel-mode letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelModeKind {
    /// Maintains a list of addresses, e.g. `b` ban masks.
    Address,
    /// Takes an argument when set and when unset, e.g. `k`.
    Always,
    /// Takes an argument only when set, e.g. `l`.
    OnSet,
    /// No argument, a boolean flag, e.g. `i`.
    None,
}

/// Mode letters partitioned by kind, parsed from the CHANMODES CSV.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelModeKinds {
    kinds: HashMap<char, ChannelModeKind>,
}

impl ChannelModeKinds {
    /// Parse a CHANMODES value, a CSV of exactly four groups.
    pub fn parse(csv: &str) -> Result<Self> {
        let groups: Vec<&str> = csv.split(',').collect();
        if groups.len() != 4 {
            return Err(Error::ConfigInvalid(format!(
                "CHANMODES must have four groups: {:?}",
                csv
            )));
        }

        let mut kinds = HashMap::new();
        let order = [
            ChannelModeKind::Address,
            ChannelModeKind::Always,
            ChannelModeKind::OnSet,
            ChannelModeKind::None,
        ];
        for (group, kind) in groups.iter().zip(order) {
            for c in group.chars() {
                kinds.insert(c, kind);
            }
        }
        Ok(Self { kinds })
    }

    /// The kind for a letter; unknown letters behave like boolean flags.
    pub fn kind(&self, mode: char) -> ChannelModeKind {
        self.kinds
            .get(&mode)
            .copied()
            .unwrap_or(ChannelModeKind::None)
    }
}

/// One status-mode change for a channel member, produced while applying a
/// combined mode string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserModeChange {
    pub mode: char,
    pub nick: String,
}

/// The modes currently set on one channel.
#[derive(Debug, Clone)]
pub struct ChannelModes {
    kinds: Arc<ChannelModeKinds>,
    addresses: HashMap<char, Vec<String>>,
    args: HashMap<char, String>,
    flags: HashSet<char>,
}

impl ChannelModes {
    pub fn new(kinds: Arc<ChannelModeKinds>) -> Self {
        Self {
            kinds,
            addresses: HashMap::new(),
            args: HashMap::new(),
            flags: HashSet::new(),
        }
    }

    /// Apply a raw mode line (`+xy-z arg1 arg2…`). Letters from the PREFIX
    /// kinds are not stored here; they come back as positive and negative
    /// user-mode deltas for the caller to route to member modes.
    pub fn apply(
        &mut self,
        umodes: &UserModeKinds,
        modeline: &str,
    ) -> (Vec<UserModeChange>, Vec<UserModeChange>) {
        let mut tokens = modeline.split_whitespace();
        let modestring = tokens.next().unwrap_or("");
        let mut args = tokens;

        let mut pos = Vec::new();
        let mut neg = Vec::new();
        let mut adding = true;

        for c in modestring.chars() {
            match c {
                '+' => adding = true,
                '-' => adding = false,
                _ if umodes.is_user_mode(c) => {
                    if let Some(nick) = args.next() {
                        let change = UserModeChange {
                            mode: c,
                            nick: nick.to_string(),
                        };
                        if adding {
                            pos.push(change);
                        } else {
                            neg.push(change);
                        }
                    }
                }
                _ => match self.kinds.kind(c) {
                    ChannelModeKind::Address => {
                        if let Some(addr) = args.next() {
                            if adding {
                                self.set_address(c, addr);
                            } else {
                                self.unset_address(c, addr);
                            }
                        }
                    }
                    ChannelModeKind::Always => {
                        let arg = args.next();
                        if adding {
                            if let Some(arg) = arg {
                                self.args.insert(c, arg.to_string());
                            }
                        } else {
                            self.args.remove(&c);
                        }
                    }
                    ChannelModeKind::OnSet => {
                        if adding {
                            if let Some(arg) = args.next() {
                                self.args.insert(c, arg.to_string());
                            }
                        } else {
                            self.args.remove(&c);
                        }
                    }
                    ChannelModeKind::None => {
                        if adding {
                            self.flags.insert(c);
                        } else {
                            self.flags.remove(&c);
                        }
                    }
                },
            }
        }

        (pos, neg)
    }

    /// Swap in a rehashed kind classifier, keeping the stored modes.
    pub fn set_kinds(&mut self, kinds: Arc<ChannelModeKinds>) {
        self.kinds = kinds;
    }

    pub fn set_address(&mut self, mode: char, address: &str) {
        let list = self.addresses.entry(mode).or_default();
        if !list.iter().any(|a| a == address) {
            list.push(address.to_string());
        }
    }

    pub fn unset_address(&mut self, mode: char, address: &str) {
        if let Some(list) = self.addresses.get_mut(&mode) {
            list.retain(|a| a != address);
            if list.is_empty() {
                self.addresses.remove(&mode);
            }
        }
    }

    /// The address list for a mode, e.g. the ban masks under `b`.
    pub fn addresses(&self, mode: char) -> &[String] {
        self.addresses
            .get(&mode)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Whether the exact ban mask is present.
    pub fn has_ban(&self, mask: &str) -> bool {
        self.addresses('b').iter().any(|a| a == mask)
    }

    /// The stored argument for an argument-taking mode.
    pub fn arg(&self, mode: char) -> Option<&str> {
        self.args.get(&mode).map(String::as_str)
    }

    /// Query a `"modes args…"` string: every listed letter must be set,
    /// and each provided argument must match the stored one in order.
    pub fn is_set(&self, query: &str) -> bool {
        let mut tokens = query.split_whitespace();
        let modestring = tokens.next().unwrap_or("");
        let mut query_args = tokens;

        for c in modestring.chars() {
            match self.kinds.kind(c) {
                ChannelModeKind::Address => match query_args.next() {
                    Some(addr) => {
                        if !self.addresses(c).iter().any(|a| a == addr) {
                            return false;
                        }
                    }
                    None => {
                        if self.addresses(c).is_empty() {
                            return false;
                        }
                    }
                },
                ChannelModeKind::Always | ChannelModeKind::OnSet => {
                    match (self.args.get(&c), query_args.next()) {
                        (Some(stored), Some(wanted)) => {
                            if stored != wanted {
                                return false;
                            }
                        }
                        (Some(_), None) => {}
                        (None, _) => return false,
                    }
                }
                ChannelModeKind::None => {
                    if !self.flags.contains(&c) {
                        return false;
                    }
                }
            }
        }
        !modestring.is_empty()
    }

    /// Produce the mode string that turns `self` into `target`.
    ///
    /// Flags and argument modes only; address lists are replicated through
    /// RPL_BANLIST rather than diffed.
    pub fn diff(&self, target: &ChannelModes) -> String {
        let mut plus = String::new();
        let mut plus_args = Vec::new();
        let mut minus = String::new();

        for &c in target.flags.iter() {
            if !self.flags.contains(&c) {
                plus.push(c);
            }
        }
        for (&c, arg) in target.args.iter() {
            if self.args.get(&c) != Some(arg) {
                plus.push(c);
                plus_args.push(arg.clone());
            }
        }
        for &c in self.flags.iter() {
            if !target.flags.contains(&c) {
                minus.push(c);
            }
        }
        for &c in self.args.keys() {
            if !target.args.contains_key(&c) {
                minus.push(c);
            }
        }

        let mut out = String::new();
        if !plus.is_empty() {
            out.push('+');
            out.push_str(&plus);
        }
        if !minus.is_empty() {
            out.push('-');
            out.push_str(&minus);
        }
        for arg in plus_args {
            out.push(' ');
            out.push_str(&arg);
        }
        out
    }
}
