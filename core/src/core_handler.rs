//! Framework-internal event handler
//!
//! Registered first on every network's dispatcher under the RAW wildcard.
//! Keeps the connection registered and healthy: PONG replies, the
//! PASS/NICK/USER handshake, nick collision cycling, 004/005 ingestion
//! with a state rehash, autojoin after welcome, rejoin after kicks and
//! bans, and WHO/MODE warm-up when the bot enters a channel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::Config;
use crate::dispatch::Handler;
use crate::event::Event;
use crate::message::names;
use crate::network_info::NetworkInfo;
use crate::state::State;
use crate::writer::Writer;

/// Wait before re-joining a channel we were kicked or banned from.
const REJOIN_DELAY: Duration = Duration::from_secs(3);
/// Collision retries after the primary nick, altnick included.
const MAX_NICK_ATTEMPTS: usize = 3;

pub(crate) struct CoreHandler {
    network_id: String,
    config: Arc<Config>,
    net_info: Arc<RwLock<NetworkInfo>>,
    state: Option<Arc<RwLock<State>>>,
    nick_attempts: Mutex<usize>,
}

impl CoreHandler {
    pub(crate) fn new(
        network_id: &str,
        config: Arc<Config>,
        net_info: Arc<RwLock<NetworkInfo>>,
        state: Option<Arc<RwLock<State>>>,
    ) -> Self {
        Self {
            network_id: network_id.to_string(),
            config: config.clone(),
            net_info,
            state,
            nick_attempts: Mutex::new(0),
        }
    }

    /// The nick the bot currently goes by, falling back to configuration
    /// before welcome has established one.
    async fn self_nick(&self) -> String {
        if let Some(ref state) = self.state {
            let nick = state.read().await.self_user().nick().to_string();
            if !nick.is_empty() {
                return nick;
            }
        }
        self.config.network(&self.network_id).nick()
    }

    async fn on_connect(&self, writer: &Writer) {
        *self.nick_attempts.lock() = 0;
        let ctx = self.config.network(&self.network_id);
        if let Some(password) = ctx.password() {
            let _ = writer.pass(&password).await;
        }
        let _ = writer.nick(&ctx.nick()).await;
        let _ = writer.user(&ctx.username(), &ctx.realname()).await;
    }

    async fn on_welcome(&self, writer: &Writer) {
        *self.nick_attempts.lock() = 0;
        let ctx = self.config.network(&self.network_id);
        if ctx.no_auto_join() {
            return;
        }
        let delay = ctx.join_delay();
        for (i, channel) in ctx.channels().iter().enumerate() {
            if i > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let _ = writer.join(&channel.name, channel.password.as_deref()).await;
        }
    }

    async fn on_nick_in_use(&self, writer: &Writer) {
        let ctx = self.config.network(&self.network_id);
        let primary = ctx.nick();

        let mut candidates = Vec::with_capacity(MAX_NICK_ATTEMPTS);
        if let Some(altnick) = ctx.altnick() {
            candidates.push(altnick);
        }
        candidates.push(format!("{}_", primary));
        candidates.push(format!("{}__", primary));
        candidates.truncate(MAX_NICK_ATTEMPTS);

        let attempt = {
            let mut attempts = self.nick_attempts.lock();
            let current = *attempts;
            *attempts += 1;
            current
        };
        match candidates.get(attempt) {
            Some(nick) => {
                let _ = writer.nick(nick).await;
            }
            None => warn!(network = %self.network_id, "out of nick candidates, giving up"),
        }
    }

    async fn rehash(&self, ev: &Event) {
        {
            let mut info = self.net_info.write().await;
            match ev.command() {
                names::RPL_MYINFO => info.parse_myinfo(&ev.message),
                names::RPL_ISUPPORT => info.parse_isupport(&ev.message),
                _ => {}
            }
        }
        if let Some(ref state) = self.state {
            let snapshot = self.net_info.read().await.clone();
            if let Err(err) = state.write().await.set_network_info(&snapshot) {
                warn!(network = %self.network_id, error = %err, "state rehash failed");
            }
        }
    }

    /// Rejoin a configured channel after a kick or ban, after a pause.
    async fn maybe_rejoin(&self, writer: &Writer, channel: &str) {
        let ctx = self.config.network(&self.network_id);
        if ctx.no_auto_join() {
            return;
        }
        let Some(config) = ctx
            .channels()
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(channel))
            .cloned()
        else {
            return;
        };
        let writer = writer.clone();
        tokio::spawn(async move {
            tokio::time::sleep(REJOIN_DELAY).await;
            let _ = writer.join(&config.name, config.password.as_deref()).await;
        });
    }
}

#[async_trait]
impl Handler for CoreHandler {
    async fn handle_raw(&self, writer: Writer, ev: Arc<Event>) {
        match ev.command() {
            names::PING => {
                let _ = writer.pong(ev.arg(0)).await;
            }
            names::CONNECT => self.on_connect(&writer).await,
            names::RPL_WELCOME => self.on_welcome(&writer).await,
            names::ERR_NICKNAMEINUSE => self.on_nick_in_use(&writer).await,
            names::RPL_MYINFO | names::RPL_ISUPPORT => self.rehash(&ev).await,
            names::KICK => {
                let nick = self.self_nick().await;
                if ev.arg(1).eq_ignore_ascii_case(&nick) {
                    debug!(network = %self.network_id, channel = ev.arg(0), "kicked, scheduling rejoin");
                    self.maybe_rejoin(&writer, ev.arg(0)).await;
                }
            }
            names::ERR_BANNEDFROMCHAN => {
                self.maybe_rejoin(&writer, ev.arg(1)).await;
            }
            names::JOIN => {
                let nick = self.self_nick().await;
                if ev.nick().eq_ignore_ascii_case(&nick) {
                    let channel = ev.arg(0);
                    let _ = writer.who(channel).await;
                    let _ = writer.mode(channel).await;
                }
            }
            _ => {}
        }
    }
}
