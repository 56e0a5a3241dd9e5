//! Per-network state mirror
//!
//! [`State`] replicates the channel/user topology of one network from a
//! restricted set of IRC messages. Membership is kept in two mirrored maps
//! keyed by lowercased names; both sides of one membership share a single
//! mode cell, so presence and modes can never disagree between them. The
//! whole struct is guarded by its server's read/write lock; readers see a
//! consistent view for the duration of their lock.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::channel_modes::{ChannelModeKinds, ChannelModes};
use crate::event::Event;
use crate::message::names;
use crate::network_info::NetworkInfo;
use crate::user_modes::{UserModeKinds, UserModes};
use crate::utils::{ChannelFinder, Mask};
use crate::{Error, Result};

/// A user visible on the network. Identity key is the lowercased nick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    mask: String,
    realname: String,
}

impl User {
    pub fn new(mask: &str) -> Self {
        Self {
            mask: mask.to_string(),
            realname: String::new(),
        }
    }

    /// The full `nick!user@host` when known, otherwise just the nick.
    pub fn fullhost(&self) -> &str {
        &self.mask
    }

    pub fn nick(&self) -> &str {
        Mask(&self.mask).nick()
    }

    pub fn username(&self) -> &str {
        Mask(&self.mask).username()
    }

    pub fn hostname(&self) -> &str {
        Mask(&self.mask).hostname()
    }

    pub fn realname(&self) -> &str {
        &self.realname
    }

    fn set_mask(&mut self, mask: &str) {
        self.mask = mask.to_string();
    }

    fn set_nick(&mut self, nick: &str) {
        let (_, user, host) = Mask(&self.mask).split_fullhost();
        if user.is_empty() && host.is_empty() {
            self.mask = nick.to_string();
        } else {
            self.mask = format!("{}!{}@{}", nick, user, host);
        }
    }
}

/// A channel the bot is on.
#[derive(Debug, Clone)]
pub struct Channel {
    name: String,
    topic: String,
    pub modes: ChannelModes,
}

impl Channel {
    fn new(name: &str, kinds: Arc<ChannelModeKinds>) -> Self {
        Self {
            name: name.to_lowercase(),
            topic: String::new(),
            modes: ChannelModes::new(kinds),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// The bot's own identity on the network, plus its personal modes.
#[derive(Debug, Clone, Default)]
pub struct SelfUser {
    user: Option<User>,
    modes: HashSet<char>,
}

impl SelfUser {
    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    pub fn nick(&self) -> &str {
        self.user.as_ref().map(User::nick).unwrap_or("")
    }

    pub fn fullhost(&self) -> &str {
        self.user.as_ref().map(User::fullhost).unwrap_or("")
    }

    pub fn has_mode(&self, mode: char) -> bool {
        self.modes.contains(&mode)
    }

    fn apply_modes(&mut self, modestring: &str) {
        let mut adding = true;
        for c in modestring.chars() {
            match c {
                '+' => adding = true,
                '-' => adding = false,
                _ if adding => {
                    self.modes.insert(c);
                }
                _ => {
                    self.modes.remove(&c);
                }
            }
        }
    }
}

/// One membership as seen from the channel side.
#[derive(Debug, Clone)]
pub struct ChannelUser {
    pub user: User,
    pub modes: UserModes,
}

/// One membership as seen from the user side.
#[derive(Debug, Clone)]
pub struct UserChannel {
    pub channel: String,
    pub modes: UserModes,
}

type SharedModes = Arc<Mutex<UserModes>>;

/// The state mirror for one network.
pub struct State {
    self_user: SelfUser,

    channels: HashMap<String, Channel>,
    users: HashMap<String, User>,

    channel_users: HashMap<String, HashMap<String, SharedModes>>,
    user_channels: HashMap<String, HashMap<String, SharedModes>>,

    kinds: Arc<ChannelModeKinds>,
    umodes: UserModeKinds,
    cfinder: ChannelFinder,
}

impl State {
    /// Build a state mirror from the network's capabilities. Fails when
    /// CHANTYPES or PREFIX are missing or unusable.
    pub fn new(info: &NetworkInfo) -> Result<Self> {
        if info.chantypes().is_empty() || info.prefix().is_empty() {
            return Err(Error::ProtoCapsMissing);
        }
        let kinds = Arc::new(ChannelModeKinds::parse(info.chanmodes())?);
        let umodes = UserModeKinds::parse(info.prefix())?;
        let cfinder = ChannelFinder::new(info.chantypes())?;

        Ok(Self {
            self_user: SelfUser::default(),
            channels: HashMap::new(),
            users: HashMap::new(),
            channel_users: HashMap::new(),
            user_channels: HashMap::new(),
            kinds,
            umodes,
            cfinder,
        })
    }

    /// Rehash after new 004/005 data arrives; every channel's mode set is
    /// reclassified under the new kinds.
    pub fn set_network_info(&mut self, info: &NetworkInfo) -> Result<()> {
        if info.chantypes().is_empty() || info.prefix().is_empty() {
            return Err(Error::ProtoCapsMissing);
        }
        self.kinds = Arc::new(ChannelModeKinds::parse(info.chanmodes())?);
        self.umodes = UserModeKinds::parse(info.prefix())?;
        self.cfinder = ChannelFinder::new(info.chantypes())?;
        for channel in self.channels.values_mut() {
            channel.modes.set_kinds(self.kinds.clone());
        }
        Ok(())
    }

    pub fn self_user(&self) -> &SelfUser {
        &self.self_user
    }

    pub fn user_mode_kinds(&self) -> &UserModeKinds {
        &self.umodes
    }

    /// Look up a user by nick or fullhost.
    pub fn user(&self, nickorhost: &str) -> Option<&User> {
        self.users.get(&nick_key(nickorhost))
    }

    pub fn channel(&self, name: &str) -> Option<&Channel> {
        self.channels.get(&name.to_lowercase())
    }

    pub fn is_on(&self, nickorhost: &str, channel: &str) -> bool {
        self.user_channels
            .get(&nick_key(nickorhost))
            .map(|chans| chans.contains_key(&channel.to_lowercase()))
            .unwrap_or(false)
    }

    /// The status modes a user holds on a channel.
    pub fn user_modes(&self, channel: &str, nickorhost: &str) -> Option<UserModes> {
        self.channel_users
            .get(&channel.to_lowercase())
            .and_then(|users| users.get(&nick_key(nickorhost)))
            .map(|modes| *modes.lock())
    }

    /// Everyone on a channel, joined with their membership modes.
    pub fn users_on(&self, channel: &str) -> Vec<ChannelUser> {
        let Some(members) = self.channel_users.get(&channel.to_lowercase()) else {
            return Vec::new();
        };
        members
            .iter()
            .filter_map(|(nick, modes)| {
                self.users.get(nick).map(|user| ChannelUser {
                    user: user.clone(),
                    modes: *modes.lock(),
                })
            })
            .collect()
    }

    /// Every channel a user shares with the bot.
    pub fn channels_for(&self, nickorhost: &str) -> Vec<UserChannel> {
        let Some(chans) = self.user_channels.get(&nick_key(nickorhost)) else {
            return Vec::new();
        };
        chans
            .iter()
            .map(|(name, modes)| UserChannel {
                channel: name.clone(),
                modes: *modes.lock(),
            })
            .collect()
    }

    pub fn num_users(&self) -> usize {
        self.users.len()
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    /// Apply one event to the mirror. Events outside the tracked set are
    /// ignored; no-op transitions leave the state unchanged.
    pub fn update(&mut self, ev: &Event) {
        match ev.command() {
            names::NICK => self.on_nick(ev),
            names::JOIN => self.on_join(ev),
            names::PART => self.on_part(ev),
            names::QUIT => self.on_quit(ev),
            names::KICK => self.on_kick(ev),
            names::MODE => self.on_mode(ev),
            names::TOPIC => self.on_topic(ev),
            names::RPL_TOPIC => self.on_rpl_topic(ev),
            names::RPL_WELCOME => self.on_rpl_welcome(ev),
            names::RPL_NAMREPLY => self.on_rpl_namreply(ev),
            names::RPL_WHOREPLY => self.on_rpl_whoreply(ev),
            names::RPL_CHANNELMODEIS => self.on_rpl_channelmodeis(ev),
            names::RPL_BANLIST => self.on_rpl_banlist(ev),
            names::PRIVMSG | names::NOTICE => self.on_msg(ev),
            _ => {}
        }
    }

    fn is_self(&self, sender: &str) -> bool {
        !sender.is_empty()
            && (sender == self.self_user.fullhost()
                || nick_key(sender) == nick_key(self.self_user.nick()))
    }

    fn add_user(&mut self, nickorhost: &str) -> bool {
        // Dotted names that are not full masks are servers, not users.
        let mask = Mask(nickorhost);
        if nickorhost.contains('.') && !mask.is_fullhost() {
            return false;
        }

        let key = nick_key(nickorhost);
        if key.is_empty() {
            return false;
        }
        match self.users.get_mut(&key) {
            Some(user) => {
                if mask.is_fullhost() && user.fullhost() != nickorhost {
                    user.set_mask(nickorhost);
                }
            }
            None => {
                self.users.insert(key, User::new(nickorhost));
            }
        }
        true
    }

    fn remove_user(&mut self, nickorhost: &str) {
        let key = nick_key(nickorhost);
        for members in self.channel_users.values_mut() {
            members.remove(&key);
        }
        self.user_channels.remove(&key);
        self.users.remove(&key);
    }

    fn add_channel(&mut self, name: &str) {
        let key = name.to_lowercase();
        if !self.channels.contains_key(&key) {
            self.channels
                .insert(key.clone(), Channel::new(name, self.kinds.clone()));
        }
    }

    fn remove_channel(&mut self, name: &str) {
        let key = name.to_lowercase();
        for chans in self.user_channels.values_mut() {
            chans.remove(&key);
        }
        self.channel_users.remove(&key);
        self.channels.remove(&key);
    }

    fn add_to_channel(&mut self, nickorhost: &str, channel: &str) -> Option<SharedModes> {
        let chan_key = channel.to_lowercase();
        if !self.channels.contains_key(&chan_key) {
            return None;
        }
        if !self.add_user(nickorhost) {
            return None;
        }
        let nick = nick_key(nickorhost);

        let shared = self
            .channel_users
            .entry(chan_key.clone())
            .or_default()
            .entry(nick.clone())
            .or_insert_with(|| Arc::new(Mutex::new(UserModes::new())))
            .clone();
        self.user_channels
            .entry(nick)
            .or_default()
            .insert(chan_key, shared.clone());
        Some(shared)
    }

    fn remove_from_channel(&mut self, nickorhost: &str, channel: &str) {
        let nick = nick_key(nickorhost);
        let chan_key = channel.to_lowercase();

        if let Some(members) = self.channel_users.get_mut(&chan_key) {
            members.remove(&nick);
        }
        if let Some(chans) = self.user_channels.get_mut(&nick) {
            chans.remove(&chan_key);
        }
    }

    fn on_nick(&mut self, ev: &Event) {
        let sender = ev.sender();
        let old_key = nick_key(&sender);
        let new_nick = ev.arg(0).to_string();
        if new_nick.is_empty() {
            return;
        }
        let new_key = nick_key(&new_nick);

        if !self.users.contains_key(&old_key) {
            // Unknown old nick; materialize the new identity instead.
            let (_, user, host) = Mask(&sender).split_fullhost();
            if user.is_empty() || host.is_empty() {
                self.add_user(&new_nick);
            } else {
                self.add_user(&format!("{}!{}@{}", new_nick, user, host));
            }
            return;
        }

        if let Some(mut user) = self.users.remove(&old_key) {
            user.set_nick(&new_nick);
            self.users.insert(new_key.clone(), user);
        }
        if let Some(chans) = self.user_channels.remove(&old_key) {
            for chan in chans.keys() {
                if let Some(members) = self.channel_users.get_mut(chan) {
                    if let Some(modes) = members.remove(&old_key) {
                        members.insert(new_key.clone(), modes);
                    }
                }
            }
            self.user_channels.insert(new_key.clone(), chans);
        }
        if nick_key(self.self_user.nick()) == old_key {
            if let Some(user) = self.self_user.user.as_mut() {
                user.set_nick(&new_nick);
            }
        }
    }

    fn on_join(&mut self, ev: &Event) {
        let sender = ev.sender();
        let channel = ev.arg(0).to_string();
        if channel.is_empty() {
            return;
        }
        if self.is_self(&sender) {
            self.add_channel(&channel);
        }
        self.add_to_channel(&sender, &channel);
    }

    fn on_part(&mut self, ev: &Event) {
        let sender = ev.sender();
        let channel = ev.arg(0).to_string();
        if self.is_self(&sender) {
            self.remove_channel(&channel);
        } else {
            self.remove_from_channel(&sender, &channel);
        }
    }

    fn on_quit(&mut self, ev: &Event) {
        let sender = ev.sender();
        if !self.is_self(&sender) {
            self.remove_user(&sender);
        }
    }

    fn on_kick(&mut self, ev: &Event) {
        let channel = ev.arg(0).to_string();
        let kicked = ev.arg(1).to_string();
        if kicked.is_empty() {
            return;
        }
        if nick_key(&kicked) == nick_key(self.self_user.nick()) {
            self.remove_channel(&channel);
        } else {
            self.remove_from_channel(&kicked, &channel);
        }
    }

    fn on_mode(&mut self, ev: &Event) {
        let target = ev.arg(0).to_string();
        if self.cfinder.is_channel(&target) {
            let modeline = ev.args()[1..].join(" ");
            let chan_key = target.to_lowercase();
            let Some(channel) = self.channels.get_mut(&chan_key) else {
                return;
            };
            let (pos, neg) = channel.modes.apply(&self.umodes, &modeline);

            for change in pos {
                if let Some(modes) = self
                    .channel_users
                    .get(&chan_key)
                    .and_then(|m| m.get(&nick_key(&change.nick)))
                {
                    modes.lock().set_mode(&self.umodes, change.mode);
                }
            }
            for change in neg {
                if let Some(modes) = self
                    .channel_users
                    .get(&chan_key)
                    .and_then(|m| m.get(&nick_key(&change.nick)))
                {
                    modes.lock().unset_mode(&self.umodes, change.mode);
                }
            }
        } else if nick_key(&target) == nick_key(self.self_user.nick()) {
            self.self_user.apply_modes(ev.arg(1));
        }
    }

    fn on_topic(&mut self, ev: &Event) {
        let key = ev.arg(0).to_lowercase();
        if let Some(channel) = self.channels.get_mut(&key) {
            channel.topic = ev.arg(1).to_string();
        }
    }

    fn on_rpl_topic(&mut self, ev: &Event) {
        let key = ev.arg(1).to_lowercase();
        if let Some(channel) = self.channels.get_mut(&key) {
            channel.topic = ev.arg(2).to_string();
        }
    }

    fn on_rpl_welcome(&mut self, ev: &Event) {
        let trailing = ev.args().last().map(String::as_str).unwrap_or("");
        let host = trailing.split(' ').next_back().unwrap_or("");
        let mask = if Mask(host).is_fullhost() {
            host
        } else {
            ev.arg(0)
        };
        if mask.is_empty() {
            return;
        }
        let user = User::new(mask);
        self.users.insert(nick_key(mask), user.clone());
        self.self_user.user = Some(user);
    }

    fn on_rpl_namreply(&mut self, ev: &Event) {
        let channel = ev.arg(2).to_string();
        let names = ev.arg(3).to_string();
        for entry in names.split_whitespace() {
            let mut modes = UserModes::new();
            let nick = entry.trim_start_matches(|c: char| {
                if let Some(mode) = self.umodes.symbol_mode(c) {
                    modes.set_mode(&self.umodes, mode);
                    true
                } else {
                    false
                }
            });
            if nick.is_empty() {
                continue;
            }
            if let Some(shared) = self.add_to_channel(nick, &channel) {
                *shared.lock() = modes;
            }
        }
    }

    fn on_rpl_whoreply(&mut self, ev: &Event) {
        let channel = ev.arg(1).to_string();
        let username = ev.arg(2);
        let host = ev.arg(3);
        let nick = ev.arg(5);
        let flags = ev.arg(6).to_string();
        let realname = ev
            .arg(7)
            .split_once(' ')
            .map(|(_, rest)| rest)
            .unwrap_or("")
            .to_string();
        if nick.is_empty() {
            return;
        }

        let fullhost = format!("{}!{}@{}", nick, username, host);
        if !self.add_user(&fullhost) {
            return;
        }
        if let Some(user) = self.users.get_mut(&nick_key(nick)) {
            user.realname = realname;
        }

        if let Some(shared) = self.add_to_channel(&fullhost, &channel) {
            let mut modes = shared.lock();
            if flags.contains('@') {
                modes.set_mode(&self.umodes, 'o');
            }
            if flags.contains('+') {
                modes.set_mode(&self.umodes, 'v');
            }
        }
    }

    fn on_rpl_channelmodeis(&mut self, ev: &Event) {
        let key = ev.arg(1).to_lowercase();
        let modeline = ev.args()[2.min(ev.args().len())..].join(" ");
        if let Some(channel) = self.channels.get_mut(&key) {
            channel.modes.apply(&self.umodes, &modeline);
        }
    }

    fn on_rpl_banlist(&mut self, ev: &Event) {
        let key = ev.arg(1).to_lowercase();
        let mask = ev.arg(2).to_string();
        if mask.is_empty() {
            return;
        }
        if let Some(channel) = self.channels.get_mut(&key) {
            channel.modes.set_address('b', &mask);
        }
    }

    fn on_msg(&mut self, ev: &Event) {
        let sender = ev.sender();
        if !sender.is_empty() && !self.add_user(&sender) {
            debug!(sender = %sender, "ignoring non-user message sender");
        }
    }
}

fn nick_key(nickorhost: &str) -> String {
    Mask(nickorhost).nick().to_lowercase()
}
