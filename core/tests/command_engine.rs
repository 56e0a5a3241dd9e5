//! End-to-end command engine tests: parsing, typed resolution, access
//! control and error reporting over a live state and store.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};

use ironbot_core::{
    Cmds, Command, CommandEvent, CommandHandler, DispatchCore, Error, Event, Message, NetworkInfo,
    Result, State, Store, StoredUser, Writer,
};

const NETWORK: &str = "testnet";
const SENDER: &str = "nick!user@host.net";

fn event(line: &str) -> Arc<Event> {
    Arc::new(Event::new(
        Message::parse(line).unwrap(),
        NETWORK,
        Arc::new(NetworkInfo::new()),
    ))
}

/// A state with the bot and one user on #c.
fn state() -> State {
    let mut st = State::new(&NetworkInfo::new()).unwrap();
    st.update(&event(":irc.net 001 bot :Welcome to the net bot!b@h.net"));
    st.update(&event(":bot!b@h.net JOIN :#c"));
    st.update(&event(&format!(":{} JOIN :#c", SENDER)));
    st
}

fn store_with_admin() -> Store {
    let store = Store::in_memory().unwrap();
    let mut admin = StoredUser::with_cost("admin", "pw", 4).unwrap();
    admin.grant(NETWORK, "#c", 1, "o");
    store.add_user(&admin).unwrap();
    store
}

async fn wired_writer() -> (Writer, mpsc::Receiver<Vec<u8>>) {
    let writer = Writer::new(NETWORK);
    let (tx, rx) = mpsc::channel(32);
    writer.attach(tx).await;
    (writer, rx)
}

async fn recv_line(rx: &mut mpsc::Receiver<Vec<u8>>) -> String {
    String::from_utf8(rx.recv().await.unwrap()).unwrap()
}

struct UpHandler;

#[async_trait]
impl CommandHandler for UpHandler {
    async fn execute(&self, ev: &mut CommandEvent, writer: Writer) -> Result<()> {
        let chan = ev.arg("chan").unwrap_or("").to_string();
        let nick = ev.event.nick().to_string();
        writer.write(format!("MODE {} +o :{}", chan, nick)).await
    }
}

struct InfoHandler;

#[async_trait]
impl CommandHandler for InfoHandler {
    async fn execute(&self, ev: &mut CommandEvent, writer: Writer) -> Result<()> {
        let target = ev.target_users.get("target").unwrap().nick().to_string();
        let account = ev
            .target_stored_users
            .get("account")
            .unwrap()
            .username()
            .to_string();
        writer.write(format!("RESOLVED {} {}", target, account)).await
    }
}

fn up_command() -> Command {
    Command::new("access", "up", "Ops the caller", Arc::new(UpHandler))
        .flags("o")
        .args("#chan")
        .unwrap()
}

#[tokio::test]
async fn test_command_requires_auth() {
    let cmds = Cmds::new('.', Arc::new(DispatchCore::new()));
    cmds.register(up_command()).unwrap();

    let state = Arc::new(RwLock::new(state()));
    let store = Arc::new(RwLock::new(store_with_admin()));
    let (writer, mut rx) = wired_writer().await;

    cmds.dispatch(
        event(&format!(":{} PRIVMSG #c :.up", SENDER)),
        writer,
        Some(state),
        Some(store),
    );
    cmds.core().wait_for_completion().await;

    let line = recv_line(&mut rx).await;
    assert!(line.starts_with("NOTICE nick :"));
    assert!(line.contains("not authenticated"), "got: {}", line);
}

#[tokio::test]
async fn test_command_runs_after_auth() {
    let cmds = Cmds::new('.', Arc::new(DispatchCore::new()));
    cmds.register(up_command()).unwrap();

    let state = Arc::new(RwLock::new(state()));
    let store = store_with_admin();
    store.auth_user(NETWORK, SENDER, "admin", "pw").unwrap();
    let store = Arc::new(RwLock::new(store));
    let (writer, mut rx) = wired_writer().await;

    cmds.dispatch(
        event(&format!(":{} PRIVMSG #c :.up", SENDER)),
        writer,
        Some(state),
        Some(store),
    );
    cmds.core().wait_for_completion().await;

    assert_eq!(recv_line(&mut rx).await, "MODE #c +o :nick");
}

#[tokio::test]
async fn test_flags_checked_per_channel() {
    let cmds = Cmds::new('.', Arc::new(DispatchCore::new()));
    cmds.register(up_command()).unwrap();

    let state = {
        let mut st = state();
        st.update(&event(":bot!b@h.net JOIN :#other"));
        st.update(&event(&format!(":{} JOIN :#other", SENDER)));
        Arc::new(RwLock::new(st))
    };
    // Authed, but the flag was granted on #c only.
    let store = store_with_admin();
    store.auth_user(NETWORK, SENDER, "admin", "pw").unwrap();
    let store = Arc::new(RwLock::new(store));
    let (writer, mut rx) = wired_writer().await;

    cmds.dispatch(
        event(&format!(":{} PRIVMSG #other :.up", SENDER)),
        writer,
        Some(state),
        Some(store),
    );
    cmds.core().wait_for_completion().await;

    let line = recv_line(&mut rx).await;
    assert!(line.contains("flags"), "got: {}", line);
}

#[tokio::test]
async fn test_typed_argument_resolution() {
    let cmds = Cmds::new('.', Arc::new(DispatchCore::new()));
    cmds.register(
        Command::new("info", "info", "Resolves targets", Arc::new(InfoHandler))
            .args("~target *account")
            .unwrap(),
    )
    .unwrap();

    let state = Arc::new(RwLock::new(state()));
    let store = Arc::new(RwLock::new(store_with_admin()));
    let (writer, mut rx) = wired_writer().await;

    cmds.dispatch(
        event(&format!(":{} PRIVMSG #c :.info nick *admin", SENDER)),
        writer,
        Some(state),
        Some(store),
    );
    cmds.core().wait_for_completion().await;

    assert_eq!(recv_line(&mut rx).await, "RESOLVED nick admin");
}

#[tokio::test]
async fn test_unknown_nick_reported() {
    let cmds = Cmds::new('.', Arc::new(DispatchCore::new()));
    cmds.register(
        Command::new("info", "info", "Resolves targets", Arc::new(InfoHandler))
            .args("~target *account")
            .unwrap(),
    )
    .unwrap();

    let state = Arc::new(RwLock::new(state()));
    let store = Arc::new(RwLock::new(store_with_admin()));
    let (writer, mut rx) = wired_writer().await;

    cmds.dispatch(
        event(&format!(":{} PRIVMSG #c :.info ghost *admin", SENDER)),
        writer,
        Some(state),
        Some(store),
    );
    cmds.core().wait_for_completion().await;

    let line = recv_line(&mut rx).await;
    assert!(line.starts_with("NOTICE nick :"));
    assert!(line.contains("ghost"), "got: {}", line);
}

#[tokio::test]
async fn test_missing_argument_reported() {
    let cmds = Cmds::new('.', Arc::new(DispatchCore::new()));
    cmds.register(
        Command::new("echo", "echo", "Echoes", Arc::new(UpHandler))
            .args("needed")
            .unwrap(),
    )
    .unwrap();

    let state = Arc::new(RwLock::new(state()));
    let (writer, mut rx) = wired_writer().await;

    cmds.dispatch(
        event(&format!(":{} PRIVMSG #c :.echo", SENDER)),
        writer,
        Some(state),
        None,
    );
    cmds.core().wait_for_completion().await;

    let line = recv_line(&mut rx).await;
    assert!(line.contains("needed"), "got: {}", line);
}

#[tokio::test]
async fn test_unknown_command_dropped_silently() {
    let cmds = Cmds::new('.', Arc::new(DispatchCore::new()));
    let (writer, mut rx) = wired_writer().await;

    cmds.dispatch(
        event(&format!(":{} PRIVMSG #c :.nosuchcmd", SENDER)),
        writer,
        None,
        None,
    );
    cmds.core().wait_for_completion().await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_public_requires_prefix() {
    let cmds = Cmds::new('.', Arc::new(DispatchCore::new()));
    cmds.register(
        Command::new("echo", "echo", "Echoes", Arc::new(UpHandler))
            .args("[chan]")
            .unwrap(),
    )
    .unwrap();
    let (writer, mut rx) = wired_writer().await;

    // No prefix in a channel: not a command invocation.
    cmds.dispatch(
        event(&format!(":{} PRIVMSG #c :echo hello", SENDER)),
        writer,
        None,
        None,
    );
    cmds.core().wait_for_completion().await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_private_invocation_without_prefix() {
    let cmds = Cmds::new('.', Arc::new(DispatchCore::new()));
    cmds.register(Command::new("greet", "greet", "Greets", Arc::new(GreetHandler)))
        .unwrap();

    let (writer, mut rx) = wired_writer().await;
    cmds.dispatch(
        event(&format!(":{} PRIVMSG bot :greet", SENDER)),
        writer,
        None,
        None,
    );
    cmds.core().wait_for_completion().await;
    assert_eq!(recv_line(&mut rx).await, "PRIVMSG nick :hello");
}

struct GreetHandler;

#[async_trait]
impl CommandHandler for GreetHandler {
    async fn execute(&self, ev: &mut CommandEvent, writer: Writer) -> Result<()> {
        writer.privmsg(ev.event.nick(), "hello").await
    }
}

#[tokio::test]
async fn test_close_is_idempotent_and_releases_locks() {
    struct Closer;

    #[async_trait]
    impl CommandHandler for Closer {
        async fn execute(&self, ev: &mut CommandEvent, _writer: Writer) -> Result<()> {
            assert!(ev.state().is_some());
            ev.close();
            ev.close();
            assert!(ev.state().is_none());
            assert!(ev.store().is_none());
            Ok(())
        }
    }

    let cmds = Cmds::new('.', Arc::new(DispatchCore::new()));
    cmds.register(Command::new("done", "done", "Closes early", Arc::new(Closer))).unwrap();

    let state = Arc::new(RwLock::new(state()));
    let store = Arc::new(RwLock::new(store_with_admin()));
    let (writer, _rx) = wired_writer().await;

    cmds.dispatch(
        event(&format!(":{} PRIVMSG #c :.done", SENDER)),
        writer,
        Some(state.clone()),
        Some(store.clone()),
    );
    cmds.core().wait_for_completion().await;

    // Both locks are free again.
    assert!(state.try_write().is_ok());
    assert!(store.try_write().is_ok());
}

#[tokio::test]
async fn test_store_disabled_error() {
    let cmds = Cmds::new('.', Arc::new(DispatchCore::new()));
    cmds.register(up_command()).unwrap();
    let state = Arc::new(RwLock::new(state()));
    let (writer, mut rx) = wired_writer().await;

    cmds.dispatch(
        event(&format!(":{} PRIVMSG #c :.up", SENDER)),
        writer,
        Some(state),
        None,
    );
    cmds.core().wait_for_completion().await;

    let line = recv_line(&mut rx).await;
    assert_eq!(line, format!("NOTICE nick :{}", Error::StoreDisabled));
}
