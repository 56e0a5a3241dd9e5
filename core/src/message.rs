//! IRC message parsing and formatting
//!
//! This module implements the IRC message format as defined in RFC 1459.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Error, Result};

/// Command and numeric names the framework itself cares about.
///
/// Dispatch is keyed by these strings; numerics are dispatched under their
/// three-digit form exactly as they appear on the wire.
pub mod names {
    /// Wildcard event name receiving every dispatched event.
    pub const RAW: &str = "RAW";
    /// Synthetic event emitted when a connection is established.
    pub const CONNECT: &str = "CONNECT";
    /// Synthetic event emitted when a connection is lost.
    pub const DISCONNECT: &str = "DISCONNECT";

    pub const PASS: &str = "PASS";
    pub const NICK: &str = "NICK";
    pub const USER: &str = "USER";
    pub const PING: &str = "PING";
    pub const PONG: &str = "PONG";
    pub const JOIN: &str = "JOIN";
    pub const PART: &str = "PART";
    pub const QUIT: &str = "QUIT";
    pub const KICK: &str = "KICK";
    pub const MODE: &str = "MODE";
    pub const TOPIC: &str = "TOPIC";
    pub const WHO: &str = "WHO";
    pub const PRIVMSG: &str = "PRIVMSG";
    pub const NOTICE: &str = "NOTICE";

    pub const RPL_WELCOME: &str = "001";
    pub const RPL_MYINFO: &str = "004";
    pub const RPL_ISUPPORT: &str = "005";
    pub const RPL_CHANNELMODEIS: &str = "324";
    pub const RPL_TOPIC: &str = "332";
    pub const RPL_WHOREPLY: &str = "352";
    pub const RPL_NAMREPLY: &str = "353";
    pub const RPL_BANLIST: &str = "367";
    pub const ERR_NICKNAMEINUSE: &str = "433";
    pub const ERR_BANNEDFROMCHAN: &str = "474";
}

/// IRC message prefix (server or user)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Prefix {
    /// Server name
    Server(String),
    /// User prefix (nick!user@host)
    User {
        nick: String,
        user: String,
        host: String,
    },
}

impl Prefix {
    fn parse(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::Parse("Empty prefix".to_string()));
        }
        if let Some(bang) = s.find('!') {
            let (nick, rest) = s.split_at(bang);
            let rest = &rest[1..];
            let at = rest
                .find('@')
                .ok_or_else(|| Error::Parse(format!("Invalid user prefix: {}", s)))?;
            let (user, host) = rest.split_at(at);
            let host = &host[1..];
            if nick.is_empty() || user.is_empty() || host.is_empty() {
                return Err(Error::Parse(format!("Invalid user prefix: {}", s)));
            }
            Ok(Prefix::User {
                nick: nick.to_string(),
                user: user.to_string(),
                host: host.to_string(),
            })
        } else {
            Ok(Prefix::Server(s.to_string()))
        }
    }

    /// The nick for a user prefix, the server name otherwise.
    pub fn name(&self) -> &str {
        match self {
            Prefix::Server(name) => name,
            Prefix::User { nick, .. } => nick,
        }
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prefix::Server(name) => write!(f, "{}", name),
            Prefix::User { nick, user, host } => write!(f, "{}!{}@{}", nick, user, host),
        }
    }
}

/// IRC message as defined in RFC 1459
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Optional prefix (server or user)
    pub prefix: Option<Prefix>,
    /// Message command, uppercased verb or three-digit numeric
    pub command: String,
    /// Message parameters; a trailing parameter keeps its interior spaces
    pub params: Vec<String>,
}

impl Message {
    /// Create a new message
    pub fn new(command: impl Into<String>, params: Vec<String>) -> Self {
        Self {
            prefix: None,
            command: command.into(),
            params,
        }
    }

    /// Create a new message with prefix
    pub fn with_prefix(prefix: Prefix, command: impl Into<String>, params: Vec<String>) -> Self {
        Self {
            prefix: Some(prefix),
            command: command.into(),
            params,
        }
    }

    /// Parse an IRC message from a single line without its terminator.
    pub fn parse(input: &str) -> Result<Self> {
        let line = input.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return Err(Error::Parse("Empty message".to_string()));
        }

        let mut rest = line;
        let prefix = if let Some(stripped) = rest.strip_prefix(':') {
            let space = stripped
                .find(' ')
                .ok_or_else(|| Error::Parse(format!("Prefix without command: {}", line)))?;
            let (prefix_str, remainder) = stripped.split_at(space);
            rest = remainder;
            Some(Prefix::parse(prefix_str)?)
        } else {
            None
        };

        rest = rest.trim_start_matches(' ');
        let command = match rest.find(' ') {
            Some(idx) => {
                let (cmd, remainder) = rest.split_at(idx);
                rest = remainder;
                cmd
            }
            None => {
                let cmd = rest;
                rest = "";
                cmd
            }
        };
        if command.is_empty() {
            return Err(Error::Parse(format!("Empty command: {}", line)));
        }

        let mut params = Vec::new();
        loop {
            rest = rest.trim_start_matches(' ');
            if rest.is_empty() {
                break;
            }
            if let Some(trailing) = rest.strip_prefix(':') {
                params.push(trailing.to_string());
                break;
            }
            match rest.find(' ') {
                Some(idx) => {
                    let (param, remainder) = rest.split_at(idx);
                    params.push(param.to_string());
                    rest = remainder;
                }
                None => {
                    params.push(rest.to_string());
                    break;
                }
            }
        }

        Ok(Message {
            prefix,
            command: command.to_uppercase(),
            params,
        })
    }

    /// Format the message back into a wire line, without the `\r\n`
    /// terminator. `Message::parse(m.to_line())` reproduces `m` for any
    /// message built from recognized input.
    pub fn to_line(&self) -> String {
        let mut result = String::new();

        if let Some(ref prefix) = self.prefix {
            result.push(':');
            result.push_str(&prefix.to_string());
            result.push(' ');
        }

        result.push_str(&self.command);

        for (i, param) in self.params.iter().enumerate() {
            result.push(' ');
            if i == self.params.len() - 1
                && (param.is_empty() || param.contains(' ') || param.starts_with(':'))
            {
                result.push(':');
            }
            result.push_str(param);
        }

        result
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_line())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_message() {
        let msg = Message::parse("NICK alice").unwrap();
        assert_eq!(msg.command, "NICK");
        assert_eq!(msg.params, vec!["alice"]);
        assert!(msg.prefix.is_none());
    }

    #[test]
    fn test_parse_message_with_prefix() {
        let msg = Message::parse(":alice!user@host PRIVMSG #channel :Hello world").unwrap();
        match msg.prefix {
            Some(Prefix::User {
                ref nick,
                ref user,
                ref host,
            }) => {
                assert_eq!(nick, "alice");
                assert_eq!(user, "user");
                assert_eq!(host, "host");
            }
            _ => panic!("Expected user prefix"),
        }
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, vec!["#channel", "Hello world"]);
    }

    #[test]
    fn test_parse_server_prefix_numeric() {
        let msg = Message::parse(":irc.test.net 001 bot :Welcome to the network bot!b@h").unwrap();
        assert_eq!(msg.prefix, Some(Prefix::Server("irc.test.net".to_string())));
        assert_eq!(msg.command, "001");
        assert_eq!(msg.params[1], "Welcome to the network bot!b@h");
    }

    #[test]
    fn test_parse_preserves_trailing_spaces() {
        let msg = Message::parse("PRIVMSG #c :two  spaces kept ").unwrap();
        assert_eq!(msg.params[1], "two  spaces kept ");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(Message::parse("").is_err());
        assert!(Message::parse("   ").is_err());
        assert!(Message::parse(":prefixonly").is_err());
        assert!(Message::parse(":nick!user PRIVMSG #c :hi").is_err());
    }

    #[test]
    fn test_format_round_trip() {
        let lines = [
            "PING :irc.test.net",
            ":alice!user@host PRIVMSG #channel :Hello world",
            ":irc.test.net 353 bot = #c :@op +voice plain",
            "JOIN #a,#b",
            "MODE #c +ov alice bob",
        ];
        for line in lines {
            let msg = Message::parse(line).unwrap();
            assert_eq!(Message::parse(&msg.to_line()).unwrap(), msg);
        }
    }

    #[test]
    fn test_format_empty_trailing() {
        let msg = Message::new("TOPIC", vec!["#c".to_string(), String::new()]);
        assert_eq!(msg.to_line(), "TOPIC #c :");
        assert_eq!(Message::parse(&msg.to_line()).unwrap(), msg);
    }
}
