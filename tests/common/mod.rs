#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use codex_console::api::{self, AppState, RouterConfig};
use codex_console::manager::SessionManager;
use codex_console::metrics::Metrics;
use codex_console::pty::CommandSpec;
use codex_console::session::SessionConfig;

pub type Ws = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Generous bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(10);

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    pub http: reqwest::Client,
    /// Keeps the transcript directory alive for the test's duration.
    pub dir: tempfile::TempDir,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, id: &str) -> String {
        format!("ws://{}/sessions/{}/stream", self.addr, id)
    }
}

/// `/bin/cat` with long TTL and idle timeout, for tests to tweak.
pub fn cat_config(dir: &std::path::Path) -> SessionConfig {
    SessionConfig {
        command: CommandSpec::new("/bin/cat"),
        session_ttl: Duration::from_secs(3600),
        idle_timeout: Duration::from_secs(3600),
        panic_kill_grace: Duration::from_millis(500),
        transcript_dir: dir.to_path_buf(),
        read_buffer_size: 4096,
        rows: 24,
        cols: 80,
    }
}

pub async fn start_server(
    configure: impl FnOnce(&mut SessionConfig),
    max_concurrent: usize,
    router_config: RouterConfig,
) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let mut config = cat_config(dir.path());
    configure(&mut config);

    let manager = SessionManager::new(config, max_concurrent, Arc::new(Metrics::new()));
    let state = AppState::new(manager);
    let app = api::router(state.clone(), router_config);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer {
        addr,
        state,
        http: reqwest::Client::new(),
        dir,
    }
}

pub async fn create_session(server: &TestServer) -> String {
    let resp = server
        .http
        .post(server.url("/sessions"))
        .json(&serde_json::json!({ "operator": "tester" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let body: serde_json::Value = resp.json().await.unwrap();
    body["id"].as_str().unwrap().to_string()
}

pub async fn connect(server: &TestServer, id: &str) -> Ws {
    let (ws, _) = connect_async(server.ws_url(id)).await.expect("ws connect");
    ws
}

/// Next text frame as JSON, or `None` once the socket is closed.
pub async fn recv_json(ws: &mut Ws) -> Option<serde_json::Value> {
    loop {
        let msg = tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for a frame");
        match msg {
            Some(Ok(Message::Text(text))) => {
                return Some(serde_json::from_str(text.as_str()).unwrap());
            }
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
            Some(Ok(_)) => continue,
        }
    }
}

pub async fn send_json(ws: &mut Ws, value: serde_json::Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

pub async fn send_input(ws: &mut Ws, text: &str) {
    send_json(
        ws,
        serde_json::json!({ "type": "input", "payload": { "data": text, "encoding": "utf-8" } }),
    )
    .await;
}

pub fn decode_output(env: &serde_json::Value) -> Vec<u8> {
    let data = env["payload"]["data"].as_str().unwrap();
    base64::engine::general_purpose::STANDARD.decode(data).unwrap()
}

/// Read frames until the accumulated stdout contains `needle`.
pub async fn wait_for_output(ws: &mut Ws, needle: &str) -> String {
    let mut seen = Vec::new();
    loop {
        let env = recv_json(ws).await.expect("socket closed before output arrived");
        if env["type"] == "output" {
            seen.extend(decode_output(&env));
            let text = String::from_utf8_lossy(&seen).into_owned();
            if text.contains(needle) {
                return text;
            }
        }
    }
}

/// Skip frames until a `status` with the given value, returning it.
pub async fn wait_for_status(ws: &mut Ws, status: &str) -> serde_json::Value {
    loop {
        let env = recv_json(ws)
            .await
            .unwrap_or_else(|| panic!("socket closed before status {status}"));
        if env["type"] == "status" && env["payload"]["status"] == status {
            return env;
        }
    }
}

pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition should become true");
}
