//! Top-level supervisor
//!
//! A [`Bot`] owns the stored-user database, one [`Server`] per configured
//! network, and the global dispatcher and command registries that see
//! every network's events alongside the per-network ones.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::info;

use crate::commands::{Cmds, Command};
use crate::config::Config;
use crate::dispatch::{DispatchCore, Dispatcher, Handler};
use crate::server::Server;
use crate::store::Store;
use crate::writer::Writer;
use crate::{Error, Result};

/// The bot: storage, servers, global dispatch.
pub struct Bot {
    config: Arc<Config>,
    store: Option<Arc<RwLock<Store>>>,
    servers: HashMap<String, Arc<Server>>,
    dispatcher: Arc<Dispatcher>,
    cmds: Arc<Cmds>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: Mutex<HashSet<String>>,
}

impl Bot {
    /// Build a bot from a validated configuration. Nothing connects until
    /// [`Bot::connect`].
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let store_wanted = config
            .networks
            .keys()
            .any(|id| !config.network(id).no_store());
        let store = if store_wanted {
            let store = match config.store_file {
                Some(ref path) => Store::open(path)?,
                None => Store::in_memory()?,
            };
            Some(Arc::new(RwLock::new(store)))
        } else {
            None
        };

        let global_channels = config
            .global
            .channels
            .as_ref()
            .map(|chans| chans.iter().map(|c| c.name.clone()).collect());
        let core = Arc::new(DispatchCore::with_filters(None, global_channels));
        let dispatcher = Arc::new(Dispatcher::new(core.clone()));
        let cmds = Arc::new(Cmds::new(config.network("").prefix(), core));

        let mut servers = HashMap::new();
        for id in config.networks.keys() {
            let server_store = if config.network(id).no_store() {
                None
            } else {
                store.clone()
            };
            let server = Server::new(
                id,
                config.clone(),
                server_store,
                dispatcher.clone(),
                cmds.clone(),
            )?;
            servers.insert(id.clone(), server);
        }

        Ok(Self {
            config,
            store,
            servers,
            dispatcher,
            cmds,
            tasks: Mutex::new(Vec::new()),
            running: Mutex::new(HashSet::new()),
        })
    }

    /// Build a configuration with the closure and start the bot: the
    /// embedding entry point.
    pub async fn run<F>(configurator: F) -> Result<Arc<Bot>>
    where
        F: FnOnce(&mut Config),
    {
        let mut config = Config::new();
        configurator(&mut config);
        let bot = Arc::new(Bot::new(config)?);
        bot.connect();
        Ok(bot)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn server(&self, network_id: &str) -> Option<&Arc<Server>> {
        self.servers.get(network_id)
    }

    /// The writer handle for a network.
    pub fn writer(&self, network_id: &str) -> Result<Writer> {
        self.servers
            .get(network_id)
            .map(|s| s.writer())
            .ok_or_else(|| Error::UnknownNetwork(network_id.to_string()))
    }

    /// Start every network's connection supervisor.
    pub fn connect(&self) {
        let ids: Vec<String> = self.servers.keys().cloned().collect();
        for id in ids {
            let _ = self.connect_server(&id);
        }
    }

    /// Start all message pumps; alias of [`Bot::connect`] for embedders
    /// following the connect-then-start call order.
    pub fn start(&self) {
        self.connect();
    }

    /// Start one network's connection supervisor.
    pub fn connect_server(&self, network_id: &str) -> Result<()> {
        let server = self
            .servers
            .get(network_id)
            .ok_or_else(|| Error::UnknownNetwork(network_id.to_string()))?;
        if !self.running.lock().insert(network_id.to_string()) {
            return Ok(());
        }
        info!(network = network_id, "starting");
        let server = server.clone();
        self.tasks.lock().push(tokio::spawn(server.run()));
        Ok(())
    }

    /// Ask every server to terminate gracefully.
    pub fn stop(&self) {
        for server in self.servers.values() {
            server.shutdown();
        }
    }

    /// Ask one server to terminate gracefully.
    pub fn stop_server(&self, network_id: &str) -> Result<()> {
        self.servers
            .get(network_id)
            .map(|s| s.shutdown())
            .ok_or_else(|| Error::UnknownNetwork(network_id.to_string()))
    }

    /// Block until every server task has exited and every in-flight
    /// handler has returned.
    pub async fn wait_for_halt(&self) {
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        for server in self.servers.values() {
            server.wait_for_completion().await;
        }
        self.dispatcher.core().wait_for_completion().await;
        self.cmds.core().wait_for_completion().await;
    }

    /// Register a handler on the global dispatcher.
    pub fn register(&self, event: &str, handler: Arc<dyn Handler>) -> u64 {
        self.dispatcher.register(event, handler)
    }

    /// Remove a global handler registration.
    pub fn unregister(&self, event: &str, id: u64) -> bool {
        self.dispatcher.unregister(event, id)
    }

    /// Register a handler on one network's dispatcher.
    pub fn register_network(
        &self,
        network_id: &str,
        event: &str,
        handler: Arc<dyn Handler>,
    ) -> Result<u64> {
        self.servers
            .get(network_id)
            .map(|s| s.dispatcher().register(event, handler))
            .ok_or_else(|| Error::UnknownNetwork(network_id.to_string()))
    }

    /// Remove a per-network handler registration.
    pub fn unregister_network(&self, network_id: &str, event: &str, id: u64) -> Result<bool> {
        self.servers
            .get(network_id)
            .map(|s| s.dispatcher().unregister(event, id))
            .ok_or_else(|| Error::UnknownNetwork(network_id.to_string()))
    }

    /// Register a command on the global registry.
    pub fn register_command(&self, command: Command) -> Result<()> {
        self.cmds.register(command)
    }

    /// Remove a command from the global registry.
    pub fn unregister_command(&self, name: &str) -> bool {
        self.cmds.unregister(name)
    }

    /// Register a command on one network's registry.
    pub fn register_network_command(&self, network_id: &str, command: Command) -> Result<()> {
        self.servers
            .get(network_id)
            .ok_or_else(|| Error::UnknownNetwork(network_id.to_string()))?
            .cmds()
            .register(command)
    }

    /// Run a closure under the store's read lock.
    pub async fn read_store<R>(&self, f: impl FnOnce(&Store) -> R) -> Result<R> {
        let store = self.store.as_ref().ok_or(Error::StoreDisabled)?;
        let guard = store.read().await;
        Ok(f(&guard))
    }

    /// Run a closure under the store's write lock, for atomic multi-call
    /// sequences.
    pub async fn write_store<R>(&self, f: impl FnOnce(&Store) -> R) -> Result<R> {
        let store = self.store.as_ref().ok_or(Error::StoreDisabled)?;
        let guard = store.write().await;
        Ok(f(&guard))
    }
}
