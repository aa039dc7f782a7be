//! Common test utilities and fixtures
//!
//! Starts a relay on an ephemeral port backed by an in-memory store and the
//! mock completion backend, plus a small WebSocket client.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use persona_relay::completion::MockCompletionBackend;
use persona_relay::config::RelayConfig;
use persona_relay::identity::{TokenIssuer, UserIdentity};
use persona_relay::server::{build_context, RelayServer};
use persona_relay::session::SessionContext;
use persona_relay::store::{SqliteStore, UserStore};

pub const SECRET: &str = "integration-secret";

/// Upper bound on any single wait in these tests
pub const WAIT: Duration = Duration::from_secs(5);

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestRelay {
    pub addr: SocketAddr,
    pub ctx: Arc<SessionContext>,
    pub store: Arc<SqliteStore>,
    pub completion: Arc<MockCompletionBackend>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<persona_relay::Result<()>>,
}

impl TestRelay {
    pub async fn start() -> Self {
        Self::start_with(MockCompletionBackend::new(), |_| {}).await
    }

    pub async fn start_with(
        completion: MockCompletionBackend,
        configure: impl FnOnce(&mut RelayConfig),
    ) -> Self {
        let mut config = RelayConfig::default();
        config.auth.jwt_secret = SECRET.to_string();
        configure(&mut config);

        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let completion = Arc::new(completion);
        let ctx = build_context(&config, store.clone(), completion.clone()).unwrap();

        let server = RelayServer::bind("127.0.0.1:0".parse().unwrap(), ctx.clone())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();

        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(server.run_until(async move {
            let _ = rx.await;
        }));

        Self {
            addr,
            ctx,
            store,
            completion,
            shutdown: Some(tx),
            task,
        }
    }

    pub async fn user(&self, handle: &str) -> UserIdentity {
        self.store.ensure_user(handle).await.unwrap()
    }

    pub fn token_for(&self, user: &UserIdentity) -> String {
        TokenIssuer::new(SECRET, Duration::from_secs(3600))
            .issue(user)
            .unwrap()
    }

    pub fn url(&self, persona: &str, token: Option<&str>) -> String {
        match token {
            Some(token) => format!("ws://{}/ws/llm/{}?token={}", self.addr, persona, token),
            None => format!("ws://{}/ws/llm/{}", self.addr, persona),
        }
    }

    /// Connect as `user` to `persona` with a valid token
    pub async fn connect(&self, user: &UserIdentity, persona: &str) -> Client {
        let token = self.token_for(user);
        self.connect_url(&self.url(persona, Some(&token))).await
    }

    pub async fn connect_url(&self, url: &str) -> Client {
        let (ws, _) = tokio::time::timeout(WAIT, connect_async(url))
            .await
            .expect("connect timed out")
            .expect("handshake failed");
        ws
    }

    /// Wait until the router reports `expected` members in `group`
    pub async fn wait_for_members(&self, group: &str, expected: usize) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while self.ctx.router.member_count(group) != expected {
            assert!(
                tokio::time::Instant::now() < deadline,
                "group {} never reached {} members (has {})",
                group,
                expected,
                self.ctx.router.member_count(group)
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = tokio::time::timeout(WAIT, &mut self.task).await;
    }
}

pub async fn send_json(ws: &mut Client, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

pub async fn send_text(ws: &mut Client, text: &str) {
    ws.send(Message::Text(text.to_string())).await.unwrap();
}

/// Next text frame, parsed as JSON
pub async fn recv_json(ws: &mut Client) -> Value {
    loop {
        let frame = tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for a reply")
            .expect("stream ended")
            .expect("transport error");
        match frame {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Close(frame) => panic!("connection closed: {:?}", frame),
            _ => continue,
        }
    }
}

/// Close code and reason the server ended the connection with
pub async fn recv_close(ws: &mut Client) -> Option<(u16, String)> {
    loop {
        let frame = tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for close")?;
        match frame {
            Ok(Message::Close(Some(frame))) => {
                return Some((u16::from(frame.code), frame.reason.into_owned()))
            }
            Ok(Message::Close(None)) => return None,
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

/// Assert no text frame arrives within `window`
pub async fn assert_silent(ws: &mut Client, window: Duration) {
    if let Ok(Some(Ok(Message::Text(text)))) = tokio::time::timeout(window, ws.next()).await {
        panic!("unexpected frame: {}", text);
    }
}
