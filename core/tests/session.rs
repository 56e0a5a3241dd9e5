//! Full-session tests against a scripted in-process IRC server.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::time::{timeout, Duration};

use ironbot_core::{Bot, ChannelConfig, Config, Status};

const RECV_TIMEOUT: Duration = Duration::from_secs(10);

fn config(servers: Vec<String>) -> Config {
    let mut cfg = Config::new();
    cfg.global.nick = Some("bot".to_string());
    cfg.global.altnick = Some("alt".to_string());
    cfg.global.username = Some("u".to_string());
    cfg.global.realname = Some("r".to_string());
    let net = cfg.network_mut("testnet");
    net.servers = Some(servers);
    net.channels = Some(vec![ChannelConfig::new("#x")]);
    net.no_store = Some(true);
    net.no_reconnect = Some(true);
    cfg
}

async fn expect_line(
    lines: &mut tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
    want: &str,
) {
    let got = timeout(RECV_TIMEOUT, lines.next_line())
        .await
        .expect("timed out waiting for line")
        .unwrap()
        .unwrap_or_else(|| panic!("connection closed waiting for {:?}", want));
    assert_eq!(got, want);
}

#[tokio::test]
async fn test_session_handshake_ping_join_and_shutdown() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let bot = Bot::new(config(vec![addr.to_string()])).unwrap();
    bot.connect();

    let (socket, _) = listener.accept().await.unwrap();
    let (read, mut write) = socket.into_split();
    let mut lines = BufReader::new(read).lines();

    // Registration handshake from the CONNECT pseudo-event.
    expect_line(&mut lines, "NICK :bot").await;
    expect_line(&mut lines, "USER u 0 * :r").await;

    // Welcome triggers autojoin of the configured channel.
    write
        .write_all(b":irc.test.net 001 bot :Welcome to the network bot!u@h\r\n")
        .await
        .unwrap();
    expect_line(&mut lines, "JOIN :#x").await;

    // PING is answered in kind.
    write.write_all(b"PING :abc\r\n").await.unwrap();
    expect_line(&mut lines, "PONG :abc").await;

    // Seeing ourselves join warms the state with WHO and MODE.
    write.write_all(b":bot!u@h JOIN :#x\r\n").await.unwrap();
    expect_line(&mut lines, "WHO :#x").await;
    expect_line(&mut lines, "MODE :#x").await;

    // State saw the join.
    let state = bot.server("testnet").unwrap().state().unwrap();
    {
        let state = state.read().await;
        assert!(state.channel("#x").is_some());
        assert!(state.is_on("bot", "#x"));
    }

    // Clean shutdown announces itself.
    bot.stop();
    expect_line(&mut lines, "QUIT :ironbot exiting").await;
    bot.wait_for_halt().await;
    assert_eq!(bot.server("testnet").unwrap().status(), Status::Stopped);
}

#[tokio::test]
async fn test_nick_collision_cycles_through_candidates() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let bot = Bot::new(config(vec![addr.to_string()])).unwrap();
    bot.connect();

    let (socket, _) = listener.accept().await.unwrap();
    let (read, mut write) = socket.into_split();
    let mut lines = BufReader::new(read).lines();

    expect_line(&mut lines, "NICK :bot").await;
    expect_line(&mut lines, "USER u 0 * :r").await;

    for expected in ["NICK :alt", "NICK :bot_", "NICK :bot__"] {
        write
            .write_all(b":irc.test.net 433 * bot :Nickname is already in use\r\n")
            .await
            .unwrap();
        expect_line(&mut lines, expected).await;
    }

    bot.stop();
    bot.wait_for_halt().await;
}

#[tokio::test]
async fn test_temporary_failure_rotates_and_reconnects() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // A port that refuses connections.
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    let mut cfg = config(vec![dead_addr.to_string(), addr.to_string()]);
    cfg.network_mut("testnet").reconnect_timeout = Some(0);

    let bot = Bot::new(cfg).unwrap();
    let server = bot.server("testnet").unwrap().clone();
    let mut status_rx = server.subscribe_status(None);
    bot.connect();

    let (_socket, _) = listener.accept().await.unwrap();

    let mut seen = Vec::new();
    for _ in 0..4 {
        seen.push(timeout(RECV_TIMEOUT, status_rx.recv()).await.unwrap().unwrap());
    }
    assert_eq!(
        seen,
        vec![
            Status::Connecting,
            Status::Reconnecting,
            Status::Connecting,
            Status::Started,
        ]
    );
    assert_eq!(server.server_index(), 1);

    bot.stop();
    bot.wait_for_halt().await;
}
