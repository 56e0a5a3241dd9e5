//! Dispatched events
//!
//! An [`Event`] is one parsed IRC message enriched with the network it came
//! from and a snapshot of that network's capabilities at the time it was
//! read. Events are immutable once created and shared between handlers.

use std::sync::Arc;

use crate::message::{names, Message, Prefix};
use crate::network_info::NetworkInfo;

/// One parsed IRC message bound to its originating network.
#[derive(Debug, Clone)]
pub struct Event {
    /// The parsed message.
    pub message: Message,
    /// Identifier of the network the message arrived on.
    pub network_id: String,
    /// Capabilities of the network as they were when this event was read.
    pub network_info: Arc<NetworkInfo>,
}

impl Event {
    pub fn new(message: Message, network_id: impl Into<String>, info: Arc<NetworkInfo>) -> Self {
        Self {
            message,
            network_id: network_id.into(),
            network_info: info,
        }
    }

    /// Synthesize a framework event (CONNECT/DISCONNECT) with no sender.
    pub fn synthetic(name: &str, network_id: impl Into<String>, info: Arc<NetworkInfo>) -> Self {
        Self::new(Message::new(name, Vec::new()), network_id, info)
    }

    pub fn command(&self) -> &str {
        &self.message.command
    }

    pub fn args(&self) -> &[String] {
        &self.message.params
    }

    pub fn arg(&self, index: usize) -> &str {
        self.message
            .params
            .get(index)
            .map(String::as_str)
            .unwrap_or("")
    }

    /// The full sender, `nick!user@host` or a server name. Empty when the
    /// message carried no prefix.
    pub fn sender(&self) -> String {
        self.message
            .prefix
            .as_ref()
            .map(|p| p.to_string())
            .unwrap_or_default()
    }

    /// The sender's nick, or the server name for server-prefixed messages.
    pub fn nick(&self) -> &str {
        self.message.prefix.as_ref().map(Prefix::name).unwrap_or("")
    }

    pub fn username(&self) -> &str {
        match self.message.prefix {
            Some(Prefix::User { ref user, .. }) => user,
            _ => "",
        }
    }

    pub fn hostname(&self) -> &str {
        match self.message.prefix {
            Some(Prefix::User { ref host, .. }) => host,
            _ => "",
        }
    }

    /// The first argument, which for most commands is the target.
    pub fn target(&self) -> &str {
        self.arg(0)
    }

    /// Whether the first argument names a channel on this network.
    pub fn is_channel_target(&self) -> bool {
        self.network_info.is_channel(self.target())
    }

    /// For PRIVMSG/NOTICE, the channel the message was sent to, if any.
    pub fn channel_target(&self) -> Option<&str> {
        if (self.command() == names::PRIVMSG || self.command() == names::NOTICE)
            && self.is_channel_target()
        {
            Some(self.target())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(line: &str) -> Event {
        Event::new(
            Message::parse(line).unwrap(),
            "testnet",
            Arc::new(NetworkInfo::new()),
        )
    }

    #[test]
    fn test_sender_accessors() {
        let ev = event(":nick!user@host PRIVMSG #chan :hi there");
        assert_eq!(ev.sender(), "nick!user@host");
        assert_eq!(ev.nick(), "nick");
        assert_eq!(ev.username(), "user");
        assert_eq!(ev.hostname(), "host");
        assert_eq!(ev.target(), "#chan");
        assert!(ev.is_channel_target());
        assert_eq!(ev.channel_target(), Some("#chan"));
    }

    #[test]
    fn test_server_sender() {
        let ev = event(":irc.test.net 001 bot :Welcome");
        assert_eq!(ev.sender(), "irc.test.net");
        assert_eq!(ev.nick(), "irc.test.net");
        assert_eq!(ev.username(), "");
        assert_eq!(ev.hostname(), "");
    }

    #[test]
    fn test_private_message_target() {
        let ev = event(":nick!u@h PRIVMSG bot :hello");
        assert!(!ev.is_channel_target());
        assert_eq!(ev.channel_target(), None);
    }
}
