//! ironbot core
//!
//! This crate provides the core of a multi-network IRC bot framework:
//! connection lifecycle management, event dispatch, a stateful protocol
//! mirror, a command engine with typed argument resolution and access
//! control, and a persistent authenticated user store.

pub mod bot;
pub mod cache;
pub mod channel_modes;
pub mod client;
pub mod commands;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod message;
pub mod network_info;
pub mod server;
pub mod state;
pub mod store;
pub mod stored_user;
pub mod user_modes;
pub mod utils;
pub mod writer;

mod core_handler;

pub use bot::Bot;
pub use cache::LruCache;
pub use channel_modes::{ChannelModeKind, ChannelModeKinds, ChannelModes, UserModeChange};
pub use client::IrcClient;
pub use commands::{Cmds, Command, CommandEvent, CommandHandler, MessageKind, Scope};
pub use config::{ChannelConfig, Config, NetworkConfig, NetworkContext};
pub use dispatch::{DispatchCore, Dispatcher, Handler};
pub use error::{Error, Result};
pub use event::Event;
pub use message::{names, Message, Prefix};
pub use network_info::NetworkInfo;
pub use server::{Server, Status};
pub use state::{Channel, ChannelUser, SelfUser, State, User, UserChannel};
pub use store::Store;
pub use stored_user::{Access, StoredUser};
pub use user_modes::{UserModeKinds, UserModes};
pub use utils::{wild_match, ChannelFinder, Mask};
pub use writer::Writer;

/// Re-exports for convenience
pub use async_trait::async_trait;
pub use tracing::{debug, error, info, warn};
