//! Channel-status user modes
//!
//! The PREFIX ISUPPORT token pairs mode letters with the status symbols
//! shown in NAMES replies, e.g. `(ov)@+`. [`UserModeKinds`] holds those
//! pairs for one network and [`UserModes`] is the per-membership bitset
//! indexed through them.

use crate::{Error, Result};

/// Mode-letter/status-symbol pairs parsed from the PREFIX token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserModeKinds {
    /// `(mode, symbol)` pairs; a pair's index is its bit position.
    pairs: Vec<(char, char)>,
}

impl UserModeKinds {
    /// Parse a PREFIX value of the form `(modes)symbols`.
    pub fn parse(prefix: &str) -> Result<Self> {
        let inner = prefix
            .strip_prefix('(')
            .ok_or(Error::ProtoCapsMissing)?;
        let (modes, symbols) = inner.split_once(')').ok_or(Error::ProtoCapsMissing)?;

        let modes: Vec<char> = modes.chars().collect();
        let symbols: Vec<char> = symbols.chars().collect();
        if modes.is_empty() || modes.len() != symbols.len() || modes.len() > 8 {
            return Err(Error::ProtoCapsMissing);
        }

        Ok(Self {
            pairs: modes.into_iter().zip(symbols).collect(),
        })
    }

    /// The bit for a mode letter, 0 when the letter is not a status mode.
    pub fn mode_bit(&self, mode: char) -> u8 {
        self.pairs
            .iter()
            .position(|&(m, _)| m == mode)
            .map(|i| 1 << i)
            .unwrap_or(0)
    }

    /// Whether the letter is one of this network's status modes.
    pub fn is_user_mode(&self, mode: char) -> bool {
        self.mode_bit(mode) != 0
    }

    /// The mode letter for a status symbol, e.g. `@` to `o`.
    pub fn symbol_mode(&self, symbol: char) -> Option<char> {
        self.pairs
            .iter()
            .find(|&&(_, s)| s == symbol)
            .map(|&(m, _)| m)
    }

    fn iter(&self) -> impl Iterator<Item = (usize, char, char)> + '_ {
        self.pairs
            .iter()
            .enumerate()
            .map(|(i, &(m, s))| (i, m, s))
    }
}

/// Per-membership status modes, a bitset indexed via [`UserModeKinds`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserModes {
    bits: u8,
}

impl UserModes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_mode(&mut self, kinds: &UserModeKinds, mode: char) {
        self.bits |= kinds.mode_bit(mode);
    }

    pub fn unset_mode(&mut self, kinds: &UserModeKinds, mode: char) {
        self.bits &= !kinds.mode_bit(mode);
    }

    pub fn has_mode(&self, kinds: &UserModeKinds, mode: char) -> bool {
        let bit = kinds.mode_bit(mode);
        bit != 0 && self.bits & bit == bit
    }

    /// Set the mode for a status symbol, as seen in NAMES prefixes.
    pub fn set_symbol(&mut self, kinds: &UserModeKinds, symbol: char) {
        if let Some(mode) = kinds.symbol_mode(symbol) {
            self.set_mode(kinds, mode);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// The set modes as letters, in PREFIX order.
    pub fn modes_string(&self, kinds: &UserModeKinds) -> String {
        kinds
            .iter()
            .filter(|&(i, _, _)| self.bits & (1 << i) != 0)
            .map(|(_, m, _)| m)
            .collect()
    }

    /// The set modes as status symbols, in PREFIX order.
    pub fn symbols_string(&self, kinds: &UserModeKinds) -> String {
        kinds
            .iter()
            .filter(|&(i, _, _)| self.bits & (1 << i) != 0)
            .map(|(_, _, s)| s)
            .collect()
    }
}
