//! Command engine
//!
//! Commands are declared with a message kind, a scope, optional access
//! requirements and an argument specification. Incoming PRIVMSG/NOTICE
//! lines are parsed against the registry, arguments are bound and resolved
//! into typed entities (channels, known nicks, stored users), access is
//! enforced, and the handler runs under owned read guards on the state and
//! store. Failures are reported to the invoking user by NOTICE.
//!
//! Argument specification grammar:
//!
//! ```text
//! spec      := part (' ' part)*
//! part      := required | optional | variadic
//! required  := name
//! optional  := '[' name ']'
//! variadic  := name '...'
//! name      := plain | '#' plain   (channel)
//!                    | '~' plain   (known nick)
//!                    | '*' plain   (stored user)
//! ```

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{OwnedRwLockReadGuard, RwLock};
use tracing::{debug, error};

use crate::dispatch::DispatchCore;
use crate::event::Event;
use crate::message::names;
use crate::state::{Channel, State, User};
use crate::store::Store;
use crate::stored_user::StoredUser;
use crate::user_modes::UserModes;
use crate::writer::Writer;
use crate::{Error, Result};

/// Which message commands may invoke a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Privmsg,
    Notice,
    All,
}

impl MessageKind {
    fn accepts(self, command: &str) -> bool {
        match self {
            MessageKind::Privmsg => command == names::PRIVMSG,
            MessageKind::Notice => command == names::NOTICE,
            MessageKind::All => true,
        }
    }
}

/// Where a command may be invoked from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Private,
    Public,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArgReq {
    Required,
    Optional,
    Variadic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArgKind {
    Plain,
    Channel,
    NickUser,
    StoredUser,
}

#[derive(Debug, Clone)]
struct ArgSpec {
    name: String,
    kind: ArgKind,
    req: ArgReq,
}

fn parse_arg_spec(spec: &str) -> Result<Vec<ArgSpec>> {
    let mut args = Vec::new();
    let mut seen_optional = false;
    let mut seen_variadic = false;

    for part in spec.split_whitespace() {
        if seen_variadic {
            return Err(Error::ArgSpecInvalid(format!(
                "variadic argument must be last: {}",
                spec
            )));
        }

        let (part, req) = if let Some(inner) = part.strip_prefix('[') {
            let inner = inner.strip_suffix(']').ok_or_else(|| {
                Error::ArgSpecInvalid(format!("unterminated optional: {}", part))
            })?;
            seen_optional = true;
            (inner, ArgReq::Optional)
        } else if let Some(inner) = part.strip_suffix("...") {
            seen_variadic = true;
            (inner, ArgReq::Variadic)
        } else {
            if seen_optional {
                return Err(Error::ArgSpecInvalid(format!(
                    "required argument after optional: {}",
                    spec
                )));
            }
            (part, ArgReq::Required)
        };

        let (name, kind) = match part.chars().next() {
            Some('#') => (&part[1..], ArgKind::Channel),
            Some('~') => (&part[1..], ArgKind::NickUser),
            Some('*') => (&part[1..], ArgKind::StoredUser),
            _ => (part, ArgKind::Plain),
        };
        if name.is_empty() {
            return Err(Error::ArgSpecInvalid(format!("empty argument name: {}", spec)));
        }
        if kind == ArgKind::Channel && (!args.is_empty() || req == ArgReq::Variadic) {
            return Err(Error::ArgSpecInvalid(format!(
                "channel argument must be first and not variadic: {}",
                spec
            )));
        }

        args.push(ArgSpec {
            name: name.to_string(),
            kind,
            req,
        });
    }

    Ok(args)
}

/// A command handler.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Run the command. A returned error is delivered to the invoking user
    /// by NOTICE.
    async fn execute(&self, ev: &mut CommandEvent, writer: Writer) -> Result<()>;
}

/// A declared command.
pub struct Command {
    pub extension: String,
    pub name: String,
    pub description: String,
    pub kind: MessageKind,
    pub scope: Scope,
    pub req_level: u8,
    pub req_flags: String,
    args: Vec<ArgSpec>,
    handler: Arc<dyn CommandHandler>,
}

impl Command {
    pub fn new(
        extension: &str,
        name: &str,
        description: &str,
        handler: Arc<dyn CommandHandler>,
    ) -> Self {
        Self {
            extension: extension.to_string(),
            name: name.to_lowercase(),
            description: description.to_string(),
            kind: MessageKind::All,
            scope: Scope::All,
            req_level: 0,
            req_flags: String::new(),
            args: Vec::new(),
            handler,
        }
    }

    pub fn kind(mut self, kind: MessageKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    /// Require an access level; implies authentication.
    pub fn level(mut self, level: u8) -> Self {
        self.req_level = level;
        self
    }

    /// Require flag letters; implies authentication.
    pub fn flags(mut self, flags: &str) -> Self {
        self.req_flags = flags.to_string();
        self
    }

    /// Attach an argument specification.
    pub fn args(mut self, spec: &str) -> Result<Self> {
        self.args = parse_arg_spec(spec)?;
        Ok(self)
    }

    fn requires_auth(&self) -> bool {
        self.req_level > 0 || !self.req_flags.is_empty()
    }
}

/// The resolved context a command handler runs with.
///
/// The state and store are held under their read locks for the lifetime of
/// the event; a handler that needs to run long past its data can release
/// them early with [`CommandEvent::close`], after which the resolved fields
/// are gone.
pub struct CommandEvent {
    pub event: Arc<Event>,
    state: Option<OwnedRwLockReadGuard<State>>,
    store: Option<OwnedRwLockReadGuard<Store>>,

    /// The invoking user, when state tracking is enabled.
    pub user: Option<User>,
    /// The invoker's stored user, when the command required access.
    pub stored_user: Option<StoredUser>,
    /// The invoker's modes on the message channel.
    pub user_channel_modes: Option<UserModes>,
    /// The channel the message was sent to, if any.
    pub channel: Option<Channel>,
    /// The resolved `#channel` argument; `None` when unknown to state.
    pub target_channel: Option<Channel>,
    /// Users resolved from `~nick` arguments, by argument name.
    pub target_users: HashMap<String, User>,
    /// Stored users resolved from `*user` arguments, by argument name.
    pub target_stored_users: HashMap<String, StoredUser>,
    /// Users resolved through a `~nick...` variadic.
    pub target_var_users: Vec<User>,
    /// Stored users resolved through a `*user...` variadic.
    pub target_var_stored_users: Vec<StoredUser>,

    args: HashMap<String, String>,
    closed: bool,
}

impl CommandEvent {
    /// A named argument, as bound from the message.
    pub fn arg(&self, name: &str) -> Option<&str> {
        self.args.get(name).map(String::as_str)
    }

    /// A named argument split on whitespace; handy for variadics.
    pub fn split_arg(&self, name: &str) -> Vec<String> {
        self.args
            .get(name)
            .map(|v| v.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// The locked state, until `close` is called.
    pub fn state(&self) -> Option<&State> {
        self.state.as_deref()
    }

    /// The locked store, until `close` is called.
    pub fn store(&self) -> Option<&Store> {
        self.store.as_deref()
    }

    /// Find a user by nickname in the locked state.
    pub fn find_user_by_nick(&self, nick: &str) -> Result<User> {
        let state = self.state().ok_or(Error::StateDisabled)?;
        state
            .user(nick)
            .cloned()
            .ok_or_else(|| Error::UserNotFound(nick.to_string()))
    }

    /// Find stored access by `*username` or by an authed nickname. The
    /// nickname path also returns the state user it went through.
    pub fn find_access_by_user(
        &self,
        network: &str,
        nick_or_user: &str,
    ) -> Result<(StoredUser, Option<User>)> {
        let store = self.store().ok_or(Error::StoreDisabled)?;
        if let Some(username) = nick_or_user.strip_prefix('*') {
            if username.is_empty() {
                return Err(Error::UserNotRegistered(nick_or_user.to_string()));
            }
            let stored = store
                .find_user(username)?
                .ok_or_else(|| Error::UserNotRegistered(username.to_string()))?;
            Ok((stored, None))
        } else {
            let user = self.find_user_by_nick(nick_or_user)?;
            let stored = store
                .authed_user(network, user.fullhost())
                .ok_or_else(|| Error::UserNotAuthed(nick_or_user.to_string()))?;
            Ok((stored, Some(user)))
        }
    }

    /// Release the state and store locks early and drop every resolved
    /// field. Idempotent; called automatically when the handler returns.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.user = None;
        self.stored_user = None;
        self.user_channel_modes = None;
        self.channel = None;
        self.target_channel = None;
        self.target_users.clear();
        self.target_stored_users.clear();
        self.target_var_users.clear();
        self.target_var_stored_users.clear();
        self.state.take();
        self.store.take();
    }
}

/// Command registry and dispatcher for one scope.
pub struct Cmds {
    core: Arc<DispatchCore>,
    prefix: char,
    commands: Mutex<HashMap<String, Arc<Command>>>,
}

impl Cmds {
    pub fn new(prefix: char, core: Arc<DispatchCore>) -> Self {
        Self {
            core,
            prefix,
            commands: Mutex::new(HashMap::new()),
        }
    }

    pub fn core(&self) -> &Arc<DispatchCore> {
        &self.core
    }

    /// Register a command under its word. Duplicate words are an error.
    pub fn register(&self, cmd: Command) -> Result<()> {
        let mut commands = self.commands.lock();
        if commands.contains_key(&cmd.name) {
            return Err(Error::DuplicateCommand(cmd.name.clone()));
        }
        commands.insert(cmd.name.clone(), Arc::new(cmd));
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.commands.lock().remove(&name.to_lowercase()).is_some()
    }

    /// Parse one PRIVMSG/NOTICE against the registry and, when it names a
    /// command, run it on its own task under the locks.
    pub fn dispatch(
        &self,
        ev: Arc<Event>,
        writer: Writer,
        state: Option<Arc<RwLock<State>>>,
        store: Option<Arc<RwLock<Store>>>,
    ) {
        if ev.command() != names::PRIVMSG && ev.command() != names::NOTICE {
            return;
        }
        if ev.args().len() < 2 || !self.core.should_dispatch(&ev) {
            return;
        }

        let is_public = ev.is_channel_target();
        let text = ev.arg(1);

        let stripped = if is_public {
            // Public invocations must start with the prefix rune.
            match text.strip_prefix(self.prefix) {
                Some(rest) => rest,
                None => return,
            }
        } else {
            // Private messages take the bare word; a leading prefix is
            // tolerated.
            text.strip_prefix(self.prefix).unwrap_or(text)
        };

        let mut tokens = stripped.split_whitespace();
        let Some(word) = tokens.next() else { return };
        let word = word.to_lowercase();
        let rest: Vec<String> = tokens.map(str::to_string).collect();

        let Some(cmd) = self.commands.lock().get(&word).cloned() else {
            debug!(command = %word, network = %ev.network_id, "unknown command dropped");
            return;
        };

        if !cmd.kind.accepts(ev.command()) {
            return;
        }
        match cmd.scope {
            Scope::Private if is_public => return,
            Scope::Public if !is_public => return,
            _ => {}
        }

        self.core.track();
        let core = self.core.clone();
        tokio::spawn(async move {
            let nick = ev.nick().to_string();
            let result = run_command(cmd, ev, writer.clone(), state, store, rest).await;
            match result {
                Ok(Err(err)) | Err(err) => {
                    if !nick.is_empty() {
                        let _ = writer.notice(&nick, &err.to_string()).await;
                    }
                }
                Ok(Ok(())) => {}
            }
            core.done();
        });
    }
}

/// Bind, resolve, authorize and invoke. The outer result is the binding/
/// authorization outcome, the inner one the handler's own.
async fn run_command(
    cmd: Arc<Command>,
    ev: Arc<Event>,
    writer: Writer,
    state: Option<Arc<RwLock<State>>>,
    store: Option<Arc<RwLock<Store>>>,
    tokens: Vec<String>,
) -> Result<Result<()>> {
    let state_guard = match state {
        Some(state) => Some(state.read_owned().await),
        None => None,
    };
    let store_guard = match store {
        Some(store) => Some(store.read_owned().await),
        None => None,
    };

    let network = ev.network_id.clone();
    let event_channel = ev.channel_target().map(str::to_string);

    // Bind tokens to the argument specification. A leading channel token
    // fills the command's channel argument, overriding the event channel.
    let mut tokens = tokens.into_iter().peekable();
    let mut bound: HashMap<String, String> = HashMap::new();
    let mut specs = cmd.args.iter().peekable();

    if specs.peek().map(|s| s.kind == ArgKind::Channel).unwrap_or(false) {
        if let Some(spec) = specs.next() {
            let from_token = tokens
                .peek()
                .map(|t| ev.network_info.is_channel(t))
                .unwrap_or(false);
            if from_token {
                if let Some(token) = tokens.next() {
                    bound.insert(spec.name.clone(), token);
                }
            } else if let Some(ref chan) = event_channel {
                bound.insert(spec.name.clone(), chan.clone());
            } else if spec.req == ArgReq::Required {
                return Err(Error::MissingArgument(spec.name.clone()));
            }
        }
    }

    for spec in specs {
        match spec.req {
            ArgReq::Required => {
                let token = tokens
                    .next()
                    .ok_or_else(|| Error::MissingArgument(spec.name.clone()))?;
                bound.insert(spec.name.clone(), token);
            }
            ArgReq::Optional => {
                if let Some(token) = tokens.next() {
                    bound.insert(spec.name.clone(), token);
                }
            }
            ArgReq::Variadic => {
                let rest: Vec<String> = tokens.by_ref().collect();
                if !rest.is_empty() {
                    bound.insert(spec.name.clone(), rest.join(" "));
                }
            }
        }
    }
    if tokens.next().is_some() {
        return Err(Error::ExcessArguments(cmd.name.clone()));
    }

    // Resolve typed arguments.
    let mut target_channel = None;
    let mut target_users = HashMap::new();
    let mut target_stored_users = HashMap::new();
    let mut target_var_users = Vec::new();
    let mut target_var_stored_users = Vec::new();

    for spec in &cmd.args {
        let Some(value) = bound.get(&spec.name) else {
            continue;
        };
        match spec.kind {
            ArgKind::Plain => {}
            ArgKind::Channel => {
                target_channel = state_guard
                    .as_deref()
                    .and_then(|s| s.channel(value))
                    .cloned();
            }
            ArgKind::NickUser => {
                let state = state_guard.as_deref().ok_or(Error::StateDisabled)?;
                if spec.req == ArgReq::Variadic {
                    for nick in value.split_whitespace() {
                        let user = state
                            .user(nick)
                            .cloned()
                            .ok_or_else(|| Error::UserNotFound(nick.to_string()))?;
                        target_var_users.push(user);
                    }
                } else {
                    let user = state
                        .user(value)
                        .cloned()
                        .ok_or_else(|| Error::UserNotFound(value.clone()))?;
                    target_users.insert(spec.name.clone(), user);
                }
            }
            ArgKind::StoredUser => {
                let store = store_guard.as_deref().ok_or(Error::StoreDisabled)?;
                if spec.req == ArgReq::Variadic {
                    for token in value.split_whitespace() {
                        let (stored, user) = resolve_stored(
                            store,
                            state_guard.as_deref(),
                            &network,
                            token,
                        )?;
                        if let Some(user) = user {
                            target_var_users.push(user);
                        }
                        target_var_stored_users.push(stored);
                    }
                } else {
                    let (stored, user) =
                        resolve_stored(store, state_guard.as_deref(), &network, value)?;
                    if let Some(user) = user {
                        target_users.insert(spec.name.clone(), user);
                    }
                    target_stored_users.insert(spec.name.clone(), stored);
                }
            }
        }
    }

    // Authorize. Access is scoped to the channel the command acts on: the
    // bound channel argument when present, else the message channel.
    let scope_channel = cmd
        .args
        .first()
        .filter(|spec| spec.kind == ArgKind::Channel)
        .and_then(|spec| bound.get(&spec.name).cloned())
        .or_else(|| event_channel.clone())
        .unwrap_or_default();

    let mut stored_user = None;
    if cmd.requires_auth() {
        let store = store_guard.as_deref().ok_or(Error::StoreDisabled)?;
        let sender = ev.sender();
        let authed = store
            .authed_user(&network, &sender)
            .ok_or_else(|| Error::UserNotAuthed(ev.nick().to_string()))?;
        if !authed.has_level(&network, &scope_channel, cmd.req_level) {
            return Err(Error::Access(cmd.req_level));
        }
        if !authed.has_flags(&network, &scope_channel, &cmd.req_flags) {
            return Err(Error::Flags(cmd.req_flags.clone()));
        }
        stored_user = Some(authed);
    }

    // Snapshot the invoker's surroundings.
    let user = state_guard.as_deref().and_then(|s| s.user(ev.nick()).cloned());
    let channel = event_channel
        .as_deref()
        .and_then(|c| state_guard.as_deref().and_then(|s| s.channel(c)))
        .cloned();
    let user_channel_modes = event_channel
        .as_deref()
        .and_then(|c| state_guard.as_deref().and_then(|s| s.user_modes(c, ev.nick())));

    let mut cmd_ev = CommandEvent {
        event: ev.clone(),
        state: state_guard,
        store: store_guard,
        user,
        stored_user,
        user_channel_modes,
        channel,
        target_channel,
        target_users,
        target_stored_users,
        target_var_users,
        target_var_stored_users,
        args: bound,
        closed: false,
    };

    let call = cmd.handler.execute(&mut cmd_ev, writer);
    let outcome = match AssertUnwindSafe(call).catch_unwind().await {
        Ok(result) => Ok(result),
        Err(_) => {
            error!(command = %cmd.name, network = %ev.network_id, "command handler panicked");
            Ok(Ok(()))
        }
    };
    cmd_ev.close();
    outcome
}

fn resolve_stored(
    store: &Store,
    state: Option<&State>,
    network: &str,
    token: &str,
) -> Result<(StoredUser, Option<User>)> {
    if let Some(username) = token.strip_prefix('*') {
        if username.is_empty() {
            return Err(Error::UserNotRegistered(token.to_string()));
        }
        let stored = store
            .find_user(username)?
            .ok_or_else(|| Error::UserNotRegistered(username.to_string()))?;
        Ok((stored, None))
    } else {
        let state = state.ok_or(Error::StateDisabled)?;
        let user = state
            .user(token)
            .cloned()
            .ok_or_else(|| Error::UserNotFound(token.to_string()))?;
        let stored = store
            .authed_user(network, user.fullhost())
            .ok_or_else(|| Error::UserNotAuthed(token.to_string()))?;
        Ok((stored, Some(user)))
    }
}
