//! Mask and channel-name utilities

use regex::Regex;

use crate::{Error, Result};

/// A `nick!user@host` string with helpers for splitting and wildcard
/// matching. Also used for bare hostmask patterns in allowlists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mask<'a>(pub &'a str);

impl<'a> Mask<'a> {
    /// The nick portion, everything before `!` (or `@` when no `!`).
    pub fn nick(&self) -> &'a str {
        let end = self
            .0
            .find(['!', '@'])
            .unwrap_or(self.0.len());
        &self.0[..end]
    }

    /// The user portion between `!` and `@`, empty if absent.
    pub fn username(&self) -> &'a str {
        match (self.0.find('!'), self.0.find('@')) {
            (Some(bang), Some(at)) if bang < at => &self.0[bang + 1..at],
            _ => "",
        }
    }

    /// The host portion after `@`, empty if absent.
    pub fn hostname(&self) -> &'a str {
        match self.0.find('@') {
            Some(at) => &self.0[at + 1..],
            None => "",
        }
    }

    /// Split into (nick, user, host). Missing pieces come back empty.
    pub fn split_fullhost(&self) -> (&'a str, &'a str, &'a str) {
        (self.nick(), self.username(), self.hostname())
    }

    /// Whether this string is shaped like a full `nick!user@host`.
    pub fn is_fullhost(&self) -> bool {
        !self.nick().is_empty() && !self.username().is_empty() && !self.hostname().is_empty()
    }

    /// Case-insensitive wildcard match of this pattern against a concrete
    /// mask. `*` matches any run, `?` a single character.
    pub fn matches(&self, concrete: &str) -> bool {
        wild_match(self.0, concrete)
    }
}

/// Case-insensitive glob match supporting `*` and `?`.
pub fn wild_match(pattern: &str, s: &str) -> bool {
    let p: Vec<char> = pattern.chars().flat_map(|c| c.to_lowercase()).collect();
    let t: Vec<char> = s.chars().flat_map(|c| c.to_lowercase()).collect();

    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// Scans strings for channel names using a regex compiled from the
/// network's CHANTYPES.
#[derive(Debug, Clone)]
pub struct ChannelFinder {
    chantypes: String,
    channel_regex: Regex,
}

impl ChannelFinder {
    /// Build a finder from the CHANTYPES prefix characters.
    pub fn new(chantypes: &str) -> Result<Self> {
        if chantypes.is_empty() {
            return Err(Error::ProtoCapsMissing);
        }
        let escaped = regex::escape(chantypes);
        let channel_regex = Regex::new(&format!("[{}][^\\s,]+", escaped))
            .map_err(|e| Error::ConfigInvalid(format!("Bad CHANTYPES {:?}: {}", chantypes, e)))?;
        Ok(Self {
            chantypes: chantypes.to_string(),
            channel_regex,
        })
    }

    /// Whether the string starts with one of the channel prefix characters.
    pub fn is_channel(&self, s: &str) -> bool {
        s.chars()
            .next()
            .map(|c| self.chantypes.contains(c))
            .unwrap_or(false)
    }

    /// All channel names occurring in the string.
    pub fn find_channels(&self, msg: &str) -> Vec<String> {
        self.channel_regex
            .find_iter(msg)
            .map(|m| m.as_str().to_string())
            .collect()
    }
}
