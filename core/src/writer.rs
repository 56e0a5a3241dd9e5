//! Outbound protocol-line handle
//!
//! A [`Writer`] is the cheap-clone handle handlers use to talk to one
//! network. It routes through a slot the server publishes its current
//! connection's write queue into, so the same handle stays valid across
//! reconnects.

use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};

use crate::message::Message;
use crate::{Error, Result};

/// Handle for writing protocol lines to one network.
#[derive(Clone)]
pub struct Writer {
    network_id: String,
    slot: Arc<RwLock<Option<mpsc::Sender<Vec<u8>>>>>,
}

impl Writer {
    pub fn new(network_id: impl Into<String>) -> Self {
        Self {
            network_id: network_id.into(),
            slot: Arc::new(RwLock::new(None)),
        }
    }

    /// Attach the queue this handle routes into. The server does this when
    /// a connection comes up; tests attach a channel to capture output.
    pub async fn attach(&self, sender: mpsc::Sender<Vec<u8>>) {
        *self.slot.write().await = Some(sender);
    }

    /// Detach the queue; subsequent writes fail with `NotConnected`.
    pub async fn detach(&self) {
        *self.slot.write().await = None;
    }

    pub fn network_id(&self) -> &str {
        &self.network_id
    }

    /// Send one raw line. Blocks while the write queue is full; fails when
    /// the network is not connected or its client has closed.
    pub async fn write(&self, line: impl AsRef<str>) -> Result<()> {
        let sender = {
            let guard = self.slot.read().await;
            guard.as_ref().ok_or(Error::NotConnected)?.clone()
        };
        sender
            .send(line.as_ref().as_bytes().to_vec())
            .await
            .map_err(|_| Error::ClientClosed)
    }

    pub async fn write_message(&self, message: &Message) -> Result<()> {
        self.write(message.to_line()).await
    }

    pub async fn privmsg(&self, target: &str, msg: &str) -> Result<()> {
        self.write(format!("PRIVMSG {} :{}", target, msg)).await
    }

    pub async fn notice(&self, target: &str, msg: &str) -> Result<()> {
        self.write(format!("NOTICE {} :{}", target, msg)).await
    }

    pub async fn join(&self, channel: &str, key: Option<&str>) -> Result<()> {
        match key {
            Some(key) => self.write(format!("JOIN {} :{}", channel, key)).await,
            None => self.write(format!("JOIN :{}", channel)).await,
        }
    }

    pub async fn part(&self, channel: &str) -> Result<()> {
        self.write(format!("PART :{}", channel)).await
    }

    pub async fn pong(&self, arg: &str) -> Result<()> {
        self.write(format!("PONG :{}", arg)).await
    }

    pub async fn pass(&self, password: &str) -> Result<()> {
        self.write(format!("PASS :{}", password)).await
    }

    pub async fn nick(&self, nick: &str) -> Result<()> {
        self.write(format!("NICK :{}", nick)).await
    }

    pub async fn user(&self, username: &str, realname: &str) -> Result<()> {
        self.write(format!("USER {} 0 * :{}", username, realname))
            .await
    }

    pub async fn who(&self, target: &str) -> Result<()> {
        self.write(format!("WHO :{}", target)).await
    }

    pub async fn mode(&self, target: &str) -> Result<()> {
        self.write(format!("MODE :{}", target)).await
    }

    pub async fn mode_set(&self, target: &str, modes: &str, args: &str) -> Result<()> {
        if args.is_empty() {
            self.write(format!("MODE {} {}", target, modes)).await
        } else {
            self.write(format!("MODE {} {} :{}", target, modes, args))
                .await
        }
    }

    pub async fn quit(&self, msg: &str) -> Result<()> {
        self.write(format!("QUIT :{}", msg)).await
    }
}
