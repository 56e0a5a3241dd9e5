//! Event dispatch
//!
//! [`DispatchCore`] holds the plumbing shared by the raw-event dispatcher
//! and the command engine: the network/channel filters and the in-flight
//! handler tracker behind `wait_for_completion`. [`Dispatcher`] is the
//! raw-event registry itself.
//!
//! Handlers for one event are spawned in registration order (then by
//! priority) but run concurrently. Each handler task holds the network's
//! state read lock for the duration of the call, and panics are caught at
//! the task boundary so a broken handler cannot take the bot down.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{Notify, RwLock};
use tracing::error;

use crate::event::Event;
use crate::message::names;
use crate::state::State;
use crate::writer::Writer;

/// Counts in-flight handler tasks.
#[derive(Default)]
struct Tracker {
    count: Mutex<usize>,
    notify: Notify,
}

impl Tracker {
    fn track(&self) {
        *self.count.lock() += 1;
    }

    fn done(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.notify.notify_waiters();
        }
    }

    async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if *self.count.lock() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Filter and accounting plumbing shared by Dispatcher and Cmds.
#[derive(Default)]
pub struct DispatchCore {
    networks: Option<Vec<String>>,
    channels: Option<Vec<String>>,
    tracker: Tracker,
}

impl DispatchCore {
    /// A core with no filtering.
    pub fn new() -> Self {
        Self::default()
    }

    /// A core restricted to the given networks and/or channels. `None`
    /// means unrestricted; names are matched case-insensitively.
    pub fn with_filters(networks: Option<Vec<String>>, channels: Option<Vec<String>>) -> Self {
        Self {
            networks,
            channels: channels.map(|chans| chans.iter().map(|c| c.to_lowercase()).collect()),
            tracker: Tracker::default(),
        }
    }

    /// Whether an event passes the network and channel whitelists. The
    /// channel is the event's first argument interpreted against the
    /// network's CHANTYPES; events without a channel target always pass
    /// the channel filter.
    pub fn should_dispatch(&self, ev: &Event) -> bool {
        if let Some(ref networks) = self.networks {
            if !networks.iter().any(|n| n == &ev.network_id) {
                return false;
            }
        }
        if let Some(ref channels) = self.channels {
            if ev.is_channel_target() {
                let target = ev.target().to_lowercase();
                if !channels.iter().any(|c| *c == target) {
                    return false;
                }
            }
        }
        true
    }

    pub fn track(&self) {
        self.tracker.track();
    }

    pub fn done(&self) {
        self.tracker.done();
    }

    /// Wait until every handler spawned through this core has returned.
    pub async fn wait_for_completion(&self) {
        self.tracker.wait().await;
    }
}

/// A raw-event handler.
///
/// `handle_raw` receives every event the handler is registered for. The
/// specialized methods receive decoded arguments and fall back to
/// `handle_raw` unless overridden.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle_raw(&self, writer: Writer, ev: Arc<Event>);

    async fn privmsg(&self, writer: Writer, ev: Arc<Event>, target: &str, msg: &str) {
        let _ = (target, msg);
        self.handle_raw(writer, ev).await;
    }

    async fn notice(&self, writer: Writer, ev: Arc<Event>, target: &str, msg: &str) {
        let _ = (target, msg);
        self.handle_raw(writer, ev).await;
    }
}

#[derive(Clone)]
struct Registration {
    id: u64,
    priority: u32,
    lock_state: bool,
    handler: Arc<dyn Handler>,
}

/// Registry of raw-event handlers for one scope (global or one network).
pub struct Dispatcher {
    core: Arc<DispatchCore>,
    handlers: Mutex<HashMap<String, Vec<Registration>>>,
    next_id: AtomicU64,
}

impl Dispatcher {
    pub fn new(core: Arc<DispatchCore>) -> Self {
        Self {
            core,
            handlers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn core(&self) -> &Arc<DispatchCore> {
        &self.core
    }

    /// Register a handler for an event name ("RAW" receives everything).
    /// Returns the id used to unregister.
    pub fn register(&self, event: &str, handler: Arc<dyn Handler>) -> u64 {
        self.register_with_priority(event, 0, handler)
    }

    /// Register with an explicit priority; lower priorities dispatch first,
    /// ties in registration order.
    pub fn register_with_priority(
        &self,
        event: &str,
        priority: u32,
        handler: Arc<dyn Handler>,
    ) -> u64 {
        self.register_inner(event, priority, true, handler)
    }

    /// Framework-internal registration that runs without the state read
    /// guard, for handlers that take the state write lock themselves.
    pub(crate) fn register_unlocked(&self, event: &str, handler: Arc<dyn Handler>) -> u64 {
        self.register_inner(event, 0, false, handler)
    }

    fn register_inner(
        &self,
        event: &str,
        priority: u32,
        lock_state: bool,
        handler: Arc<dyn Handler>,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .lock()
            .entry(event.to_uppercase())
            .or_default()
            .push(Registration {
                id,
                priority,
                lock_state,
                handler,
            });
        id
    }

    /// Remove a registration. Returns whether it was found.
    pub fn unregister(&self, event: &str, id: u64) -> bool {
        let mut handlers = self.handlers.lock();
        let Some(list) = handlers.get_mut(&event.to_uppercase()) else {
            return false;
        };
        let before = list.len();
        list.retain(|reg| reg.id != id);
        let removed = before != list.len();
        if list.is_empty() {
            handlers.remove(&event.to_uppercase());
        }
        removed
    }

    /// Dispatch one event to every matching handler.
    ///
    /// Handlers are spawned on their own tasks; each holds the state read
    /// lock while it runs. This call itself never blocks on handlers.
    pub fn dispatch(&self, ev: Arc<Event>, writer: Writer, state: Option<Arc<RwLock<State>>>) {
        if !self.core.should_dispatch(&ev) {
            return;
        }

        let mut candidates = {
            let handlers = self.handlers.lock();
            let mut list: Vec<Registration> = Vec::new();
            if let Some(exact) = handlers.get(ev.command()) {
                list.extend(exact.iter().cloned());
            }
            if ev.command() != names::RAW {
                if let Some(raw) = handlers.get(names::RAW) {
                    list.extend(raw.iter().cloned());
                }
            }
            list
        };
        candidates.sort_by_key(|reg| (reg.priority, reg.id));

        for reg in candidates {
            self.core.track();
            let core = self.core.clone();
            let handler = reg.handler;
            let ev = ev.clone();
            let writer = writer.clone();
            let state = state.clone();

            let lock_state = reg.lock_state;
            tokio::spawn(async move {
                let _state_guard = match state {
                    Some(state) if lock_state => Some(state.read_owned().await),
                    _ => None,
                };

                let call = invoke(handler, writer, ev.clone());
                if AssertUnwindSafe(call).catch_unwind().await.is_err() {
                    error!(
                        command = ev.command(),
                        network = %ev.network_id,
                        "handler panicked"
                    );
                }
                core.done();
            });
        }
    }
}

async fn invoke(handler: Arc<dyn Handler>, writer: Writer, ev: Arc<Event>) {
    match ev.command() {
        names::PRIVMSG if ev.args().len() >= 2 => {
            let target = ev.arg(0).to_string();
            let msg = ev.arg(1).to_string();
            handler.privmsg(writer, ev, &target, &msg).await;
        }
        names::NOTICE if ev.args().len() >= 2 => {
            let target = ev.arg(0).to_string();
            let msg = ev.arg(1).to_string();
            handler.notice(writer, ev, &target, &msg).await;
        }
        _ => handler.handle_raw(writer, ev).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::network_info::NetworkInfo;
    use tokio::sync::mpsc;

    struct Recorder {
        label: &'static str,
        tx: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl Handler for Recorder {
        async fn handle_raw(&self, _writer: Writer, ev: Arc<Event>) {
            let _ = self.tx.send(format!("{}:{}", self.label, ev.command()));
        }
    }

    struct Panicker;

    #[async_trait]
    impl Handler for Panicker {
        async fn handle_raw(&self, _writer: Writer, _ev: Arc<Event>) {
            panic!("boom");
        }
    }

    fn event(line: &str) -> Arc<Event> {
        Arc::new(Event::new(
            Message::parse(line).unwrap(),
            "testnet",
            Arc::new(NetworkInfo::new()),
        ))
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(Arc::new(DispatchCore::new()))
    }

    #[tokio::test]
    async fn test_exact_and_raw_dispatch() {
        let d = dispatcher();
        let (tx, mut rx) = mpsc::unbounded_channel();
        d.register(
            "PING",
            Arc::new(Recorder {
                label: "ping",
                tx: tx.clone(),
            }),
        );
        d.register(names::RAW, Arc::new(Recorder { label: "raw", tx }));

        d.dispatch(event("PING :abc"), Writer::new("testnet"), None);
        d.core().wait_for_completion().await;

        let mut got = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        got.sort();
        assert_eq!(got, vec!["ping:PING".to_string(), "raw:PING".to_string()]);

        d.dispatch(event("JOIN :#c"), Writer::new("testnet"), None);
        d.core().wait_for_completion().await;
        assert_eq!(rx.recv().await.unwrap(), "raw:JOIN");
    }

    #[tokio::test]
    async fn test_unregister() {
        let d = dispatcher();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = d.register("PING", Arc::new(Recorder { label: "h", tx }));

        assert!(d.unregister("PING", id));
        assert!(!d.unregister("PING", id));

        d.dispatch(event("PING :abc"), Writer::new("testnet"), None);
        d.core().wait_for_completion().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_network_filter() {
        let core = Arc::new(DispatchCore::with_filters(
            Some(vec!["othernet".to_string()]),
            None,
        ));
        let d = Dispatcher::new(core);
        let (tx, mut rx) = mpsc::unbounded_channel();
        d.register(names::RAW, Arc::new(Recorder { label: "h", tx }));

        d.dispatch(event("PING :abc"), Writer::new("testnet"), None);
        d.core().wait_for_completion().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_channel_filter() {
        let core = Arc::new(DispatchCore::with_filters(
            None,
            Some(vec!["#Allowed".to_string()]),
        ));
        let d = Dispatcher::new(core);
        let (tx, mut rx) = mpsc::unbounded_channel();
        d.register(names::RAW, Arc::new(Recorder { label: "h", tx }));

        d.dispatch(
            event(":n!u@h PRIVMSG #other :hi"),
            Writer::new("testnet"),
            None,
        );
        d.core().wait_for_completion().await;
        assert!(rx.try_recv().is_err());

        d.dispatch(
            event(":n!u@h PRIVMSG #allowed :hi"),
            Writer::new("testnet"),
            None,
        );
        d.core().wait_for_completion().await;
        assert_eq!(rx.recv().await.unwrap(), "h:PRIVMSG");

        // Non-channel events always pass the channel filter.
        d.dispatch(event("PING :abc"), Writer::new("testnet"), None);
        d.core().wait_for_completion().await;
        assert_eq!(rx.recv().await.unwrap(), "h:PING");
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let d = dispatcher();
        let (tx, mut rx) = mpsc::unbounded_channel();
        d.register(names::RAW, Arc::new(Panicker));
        d.register(names::RAW, Arc::new(Recorder { label: "ok", tx }));

        d.dispatch(event("PING :abc"), Writer::new("testnet"), None);
        d.core().wait_for_completion().await;
        assert_eq!(rx.recv().await.unwrap(), "ok:PING");
    }

    #[tokio::test]
    async fn test_wait_for_completion_idle() {
        let d = dispatcher();
        // Must not hang when nothing is in flight.
        d.core().wait_for_completion().await;
    }
}
