//! Integration tests for the hexmap server
//!
//! These tests start a real server on a loopback port with a temporary data
//! directory and drive it with line-protocol clients over TCP.

use futures_util::{SinkExt, StreamExt};
use server::config::ServerConfig;
use server::error::ServerError;
use server::network::{Server, ServerHandle};
use shared::{Color, EnvelopeCodec, Message, Registry, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::Framed;

const WAIT: Duration = Duration::from_secs(5);

struct TestServer {
    handle: ServerHandle,
    task: JoinHandle<Result<(), ServerError>>,
    dir: TempDir,
}

impl TestServer {
    async fn start() -> Self {
        Self::start_with(|_| {}, Duration::from_secs(60)).await
    }

    /// Starts a server after letting `prepare` seed the data directory.
    async fn start_with(prepare: impl FnOnce(&Path), ping_interval: Duration) -> Self {
        let dir = tempfile::tempdir().unwrap();
        prepare(dir.path());

        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            data_dir: dir.path().to_path_buf(),
            ping_interval,
            close_timeout: Duration::from_millis(500),
            ..ServerConfig::default()
        };
        let server = Server::bind(config).await.unwrap();
        let handle = server.handle();
        let task = tokio::spawn(server.run());

        TestServer { handle, task, dir }
    }

    fn addr(&self) -> SocketAddr {
        self.handle.local_addr()
    }

    async fn stop(self) -> TempDir {
        assert!(self.handle.console("/stop").await);
        timeout(WAIT, self.task)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
        self.dir
    }
}

struct TestClient {
    framed: Framed<TcpStream, EnvelopeCodec>,
    answer_pings: bool,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let codec = EnvelopeCodec::new(Arc::new(Registry::standard()));
        TestClient {
            framed: Framed::new(stream, codec),
            answer_pings: true,
        }
    }

    /// Connects, logs in and waits for the server to announce the login.
    async fn login(addr: SocketAddr, name: &str, password: Option<&str>) -> Self {
        let mut client = Self::connect(addr).await;
        client.handshake(PROTOCOL_VERSION).await;
        client.validate(name, password).await;
        client.expect_chat(&format!("{} has joined.", name)).await;
        client
    }

    async fn send(&mut self, message: Message) {
        self.framed.send(message).await.unwrap();
    }

    async fn handshake(&mut self, version: &str) {
        self.send(Message::Handshake {
            version: version.to_string(),
        })
        .await;
    }

    async fn validate(&mut self, name: &str, password: Option<&str>) {
        self.send(Message::Validation {
            name: name.to_string(),
            password: password.map(str::to_string),
        })
        .await;
    }

    async fn command(&mut self, name: &str, args: Option<&str>) {
        self.send(Message::Command {
            name: name.to_string(),
            command: args.map(str::to_string),
        })
        .await;
    }

    /// Next message other than a server ping, or None once the server hangs
    /// up. Pings are answered when `answer_pings` is set.
    async fn recv(&mut self) -> Option<Message> {
        loop {
            let frame = timeout(WAIT, self.framed.next())
                .await
                .expect("timed out waiting for the server");
            let message = frame?.unwrap();
            if let Message::Ping { from_client: false } = message {
                if self.answer_pings {
                    self.send(message).await;
                }
                continue;
            }
            return Some(message);
        }
    }

    async fn expect_chat(&mut self, text: &str) {
        loop {
            match self.recv().await {
                Some(Message::Chat { text: got }) if got == text => return,
                Some(_) => continue,
                None => panic!("connection closed while waiting for {:?}", text),
            }
        }
    }

    /// Reads until the server's close notice and returns its reason.
    async fn expect_close(&mut self) -> String {
        loop {
            match self.recv().await {
                Some(Message::Close { reason }) => return reason,
                Some(_) => continue,
                None => panic!("connection dropped without a close notice"),
            }
        }
    }

    /// Reads for `duration`, answering pings, and returns everything else.
    async fn pump_for(&mut self, duration: Duration) -> Vec<Message> {
        let deadline = tokio::time::Instant::now() + duration;
        let mut seen = Vec::new();
        while let Ok(frame) = tokio::time::timeout_at(deadline, self.framed.next()).await {
            match frame {
                Some(Ok(Message::Ping { from_client: false })) => {
                    self.send(Message::Ping { from_client: false }).await;
                }
                Some(Ok(message)) => seen.push(message),
                Some(Err(e)) => panic!("bad frame from server: {}", e),
                None => break,
            }
        }
        seen
    }

    /// Collects the next `count` spoken chat lines and unit moves, skipping
    /// server notices.
    async fn updates(&mut self, count: usize) -> Vec<Message> {
        let mut seen = Vec::new();
        while seen.len() < count {
            match self.recv().await {
                Some(message @ Message::MoveUnit { .. }) => seen.push(message),
                Some(Message::Chat { text }) if text.contains(": ") => {
                    seen.push(Message::chat(text))
                }
                Some(_) => continue,
                None => panic!("connection closed after {} updates", seen.len()),
            }
        }
        seen
    }

    async fn chats(&mut self, count: usize, filter: impl Fn(&str) -> bool) -> Vec<String> {
        let mut seen = Vec::new();
        while seen.len() < count {
            match self.recv().await {
                Some(Message::Chat { text }) if filter(&text) => seen.push(text),
                Some(_) => continue,
                None => panic!("connection closed after {} chats", seen.len()),
            }
        }
        seen
    }
}

/// LOGIN TESTS
mod login_tests {
    use super::*;

    #[tokio::test]
    async fn new_user_is_registered_on_login() {
        let server = TestServer::start().await;
        let mut alice = TestClient::connect(server.addr()).await;

        alice.handshake(PROTOCOL_VERSION).await;
        alice.validate("alice", None).await;

        assert_eq!(
            alice.recv().await,
            Some(Message::Handshake {
                version: PROTOCOL_VERSION.to_string()
            })
        );
        assert_eq!(alice.recv().await, Some(Message::Init { x: 10, y: 10 }));
        assert_eq!(alice.recv().await, Some(Message::chat("alice has joined.")));

        let dir = server.stop().await;
        let saved: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("users.json")).unwrap())
                .unwrap();
        assert_eq!(saved, serde_json::json!({ "alice": null }));
    }

    #[tokio::test]
    async fn duplicate_username_is_rejected() {
        let server = TestServer::start().await;
        let _alice = TestClient::login(server.addr(), "alice", None).await;

        let mut imposter = TestClient::connect(server.addr()).await;
        imposter.handshake(PROTOCOL_VERSION).await;
        imposter.validate("alice", None).await;

        assert_eq!(imposter.expect_close().await, "duplicate username: alice");
        server.stop().await;
    }

    #[tokio::test]
    async fn wrong_password_is_rejected() {
        let server = TestServer::start_with(
            |dir| std::fs::write(dir.join("users.json"), r#"{"alice": "secret"}"#).unwrap(),
            Duration::from_secs(60),
        )
        .await;

        let mut attempt = TestClient::connect(server.addr()).await;
        attempt.handshake(PROTOCOL_VERSION).await;
        attempt.validate("alice", Some("guess")).await;
        assert_eq!(attempt.expect_close().await, "invalid password");

        let _alice = TestClient::login(server.addr(), "alice", Some("secret")).await;
        server.stop().await;
    }

    #[tokio::test]
    async fn blank_username_is_rejected() {
        let server = TestServer::start().await;
        let mut client = TestClient::connect(server.addr()).await;

        client.validate("   ", None).await;
        assert_eq!(client.expect_close().await, "invalid username");
        server.stop().await;
    }

    #[tokio::test]
    async fn wrong_version_is_rejected() {
        let server = TestServer::start().await;
        let mut client = TestClient::connect(server.addr()).await;

        client.handshake("HEXMAP 0.1").await;
        assert_eq!(client.expect_close().await, "wrong version: HEXMAP 0.1.");
        server.stop().await;
    }
}

/// BROADCAST TESTS
mod broadcast_tests {
    use super::*;

    #[tokio::test]
    async fn every_client_sees_the_same_order() {
        let server = TestServer::start().await;
        let mut a = TestClient::login(server.addr(), "a", None).await;
        let mut b = TestClient::login(server.addr(), "b", None).await;
        let mut c = TestClient::login(server.addr(), "c", None).await;

        assert!(server.handle.console("/add Bob 0 0 255 0 0").await);
        let mut uid = None;
        for client in [&mut a, &mut b, &mut c] {
            loop {
                match client.recv().await {
                    Some(Message::NewUnit { unit }) => {
                        uid = Some(unit.uid);
                        break;
                    }
                    Some(Message::Chat { .. }) => continue,
                    other => panic!("expected new unit, got {:?}", other),
                }
            }
        }
        let uid = uid.unwrap();

        // a and c chat while b walks the unit along the diagonal.
        for i in 0..10 {
            a.send(Message::chat(format!("a{}", i))).await;
            b.send(Message::MoveUnit {
                uid,
                to_x: (i + 1) % 10,
                to_y: (i + 1) % 10,
                from_x: 0,
                from_y: 0,
            })
            .await;
            c.send(Message::chat(format!("c{}", i))).await;
        }

        let seen_a = a.updates(30).await;
        let seen_b = b.updates(30).await;
        let seen_c = c.updates(30).await;

        assert_eq!(seen_a, seen_b);
        assert_eq!(seen_b, seen_c);

        // Each sender's own traffic keeps its relative order.
        let from_a: Vec<&Message> = seen_a
            .iter()
            .filter(|m| matches!(m, Message::Chat { text } if text.starts_with("a: ")))
            .collect();
        let expected: Vec<Message> = (0..10).map(|i| Message::chat(format!("a: a{}", i))).collect();
        assert_eq!(from_a, expected.iter().collect::<Vec<_>>());

        // Every broadcast move starts where the previous one ended.
        let moves: Vec<(i32, i32, i32, i32)> = seen_a
            .iter()
            .filter_map(|m| match m {
                Message::MoveUnit {
                    to_x,
                    to_y,
                    from_x,
                    from_y,
                    ..
                } => Some((*from_x, *from_y, *to_x, *to_y)),
                _ => None,
            })
            .collect();
        assert_eq!(moves.len(), 10);
        for (i, (from_x, from_y, to_x, to_y)) in moves.iter().enumerate() {
            assert_eq!((*from_x, *from_y), (i as i32, i as i32));
            assert_eq!((*to_x, *to_y), ((i as i32 + 1) % 10, (i as i32 + 1) % 10));
        }

        server.stop().await;
    }

    #[tokio::test]
    async fn console_setup_then_add_reaches_everyone() {
        let server = TestServer::start().await;
        let mut alice = TestClient::login(server.addr(), "alice", None).await;

        assert!(server.handle.console("/setup 5 7").await);
        assert!(server.handle.console("/add Bob 1 2 255 0 0").await);

        let unit = match alice.recv().await {
            Some(Message::NewUnit { unit }) => unit,
            other => panic!("expected new unit, got {:?}", other),
        };
        assert_eq!(unit.name, "Bob");
        assert_eq!((unit.x, unit.y), (1, 2));
        assert_eq!(unit.color, Color::rgb(255, 0, 0));

        // A later login gets the new size followed by the existing units.
        let mut bob = TestClient::connect(server.addr()).await;
        bob.handshake(PROTOCOL_VERSION).await;
        bob.validate("bob", None).await;
        assert!(matches!(bob.recv().await, Some(Message::Handshake { .. })));
        assert_eq!(bob.recv().await, Some(Message::Init { x: 5, y: 7 }));
        assert_eq!(bob.recv().await, Some(Message::NewUnit { unit: unit.clone() }));

        server.stop().await;
    }

    #[tokio::test]
    async fn unit_moves_are_broadcast() {
        let server = TestServer::start().await;
        let mut alice = TestClient::login(server.addr(), "alice", None).await;
        server.handle.console("add Bob 1 2 0 0 255").await;
        let uid = match alice.recv().await {
            Some(Message::NewUnit { unit }) => unit.uid,
            other => panic!("expected new unit, got {:?}", other),
        };

        alice
            .send(Message::MoveUnit {
                uid,
                to_x: 4,
                to_y: 4,
                from_x: 0,
                from_y: 0,
            })
            .await;

        assert_eq!(
            alice.recv().await,
            Some(Message::MoveUnit {
                uid,
                to_x: 4,
                to_y: 4,
                from_x: 1,
                from_y: 2
            })
        );
        server.stop().await;
    }

    #[tokio::test]
    async fn leaving_is_announced() {
        let server = TestServer::start().await;
        let mut alice = TestClient::login(server.addr(), "alice", None).await;
        let mut bob = TestClient::login(server.addr(), "bob", None).await;

        bob.send(Message::close("bye")).await;
        assert_eq!(bob.expect_close().await, "bye");

        alice.expect_chat("bob has left.").await;
        server.stop().await;
    }
}

/// COMMAND AND PERMISSION TESTS
mod command_tests {
    use super::*;

    #[tokio::test]
    async fn roll_needs_permission() {
        let server = TestServer::start_with(
            |dir| {
                let users = dir.join("permissions").join("users");
                std::fs::create_dir_all(&users).unwrap();
                std::fs::write(users.join("alice.txt"), "hexmap.commands.roll\n").unwrap();
            },
            Duration::from_secs(60),
        )
        .await;
        let mut alice = TestClient::login(server.addr(), "alice", None).await;
        let mut bob = TestClient::login(server.addr(), "bob", None).await;

        bob.command("roll", Some("2d6")).await;
        bob.expect_chat("you do not have permission to use \"/roll\"")
            .await;

        alice.command("roll", Some("2d6")).await;
        let rolled = bob
            .chats(1, |text| text.starts_with("Server: alice rolled 2d6: "))
            .await;
        let total: u32 = rolled[0].rsplit("= ").next().unwrap().parse().unwrap();
        assert!((2..=12).contains(&total));

        bob.command("teleport", None).await;
        bob.expect_chat("unknown command \"teleport\"").await;

        server.stop().await;
    }

    #[tokio::test]
    async fn group_file_grants_wildcards() {
        let server = TestServer::start_with(
            |dir| {
                let groups = dir.join("permissions").join("groups");
                let users = dir.join("permissions").join("users");
                std::fs::create_dir_all(&groups).unwrap();
                std::fs::create_dir_all(&users).unwrap();
                std::fs::write(groups.join("op.txt"), "hexmap.commands.*\n").unwrap();
                std::fs::write(users.join("admin.txt"), "group op\n").unwrap();
            },
            Duration::from_secs(60),
        )
        .await;
        let mut admin = TestClient::login(server.addr(), "admin", None).await;

        admin.command("setup", Some("3")).await;
        admin
            .expect_chat("invalid command \"setup 3\" expected \"/setup <x> <y>\"")
            .await;

        admin.command("add", Some("Eve 0 0 10 20 30")).await;
        match admin.recv().await {
            Some(Message::NewUnit { unit }) => assert_eq!(unit.name, "Eve"),
            other => panic!("expected new unit, got {:?}", other),
        }

        admin.command("stop", None).await;
        assert_eq!(admin.expect_close().await, "Server closing.");
        timeout(WAIT, server.task).await.unwrap().unwrap().unwrap();
    }
}

/// CONNECTION LIFECYCLE TESTS
mod lifecycle_tests {
    use super::*;

    #[tokio::test]
    async fn unanswered_pings_time_out() {
        let server = TestServer::start_with(|_| {}, Duration::from_millis(200)).await;
        let mut lazy = TestClient::login(server.addr(), "lazy", None).await;
        lazy.answer_pings = false;
        let mut eager = TestClient::login(server.addr(), "eager", None).await;

        let lazy_task = tokio::spawn(async move { lazy.expect_close().await });

        // Several intervals pass; the eager client answers every ping.
        let seen = eager.pump_for(Duration::from_millis(1200)).await;
        assert!(seen.contains(&Message::chat("lazy has left.")));
        assert_eq!(lazy_task.await.unwrap(), "Connection timed out.");

        eager.send(Message::chat("still here")).await;
        eager.expect_chat("eager: still here").await;

        server.stop().await;
    }

    #[tokio::test]
    async fn malformed_line_closes_session() {
        let server = TestServer::start().await;
        let mut client = TestClient::connect(server.addr()).await;

        client
            .framed
            .get_mut()
            .write_all(b"this is not an envelope\n")
            .await
            .unwrap();

        let reason = client.expect_close().await;
        assert!(reason.starts_with("protocol error"), "{}", reason);
        server.stop().await;
    }

    #[tokio::test]
    async fn client_ping_is_echoed() {
        let server = TestServer::start().await;
        let mut alice = TestClient::login(server.addr(), "alice", None).await;

        alice.send(Message::Ping { from_client: true }).await;
        assert_eq!(alice.recv().await, Some(Message::Ping { from_client: true }));
        server.stop().await;
    }

    #[tokio::test]
    async fn stop_closes_every_client() {
        let server = TestServer::start().await;
        let mut alice = TestClient::login(server.addr(), "alice", None).await;
        let mut bob = TestClient::login(server.addr(), "bob", None).await;

        server.stop().await;

        assert_eq!(alice.expect_close().await, "Server closing.");
        assert_eq!(bob.expect_close().await, "Server closing.");
        assert_eq!(alice.recv().await, None);
    }
}
