pub mod error;
mod handlers;
pub mod proxy;
mod ws;

use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderName, HeaderValue},
    routing::{get, post},
    Router,
};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use std::sync::Arc;

use crate::manager::SessionManager;
use crate::metrics::Metrics;

use handlers::*;

#[derive(Clone)]
pub struct AppState {
    pub manager: SessionManager,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(manager: SessionManager) -> Self {
        let metrics = manager.metrics().clone();
        Self { manager, metrics }
    }
}

/// Configuration for the HTTP/WS router.
///
/// Use `RouterConfig::default()` in tests for an unguarded setup.
#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
    pub require_proxy: bool,
}

pub fn router(state: AppState, config: RouterConfig) -> Router {
    let routes = Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics))
        .route("/sessions", post(session_create).get(session_list))
        .route("/sessions/{id}", get(session_get).delete(session_kill))
        .route("/sessions/{id}/stream", get(ws::session_stream))
        .with_state(state);

    let routes = if config.require_proxy {
        routes.layer(axum::middleware::from_fn(proxy::require_forwarded_headers))
    } else {
        routes
    };

    routes
        .layer(DefaultBodyLimit::max(64 * 1024))
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("no-referrer"),
        ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::CommandSpec;
    use crate::session::SessionConfig;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_state(dir: &std::path::Path, max: usize) -> AppState {
        state_with_command(dir, max, CommandSpec::new("/bin/cat"))
    }

    fn state_with_command(dir: &std::path::Path, max: usize, command: CommandSpec) -> AppState {
        let config = SessionConfig {
            command,
            session_ttl: Duration::from_secs(3600),
            idle_timeout: Duration::from_secs(3600),
            panic_kill_grace: Duration::from_millis(500),
            transcript_dir: dir.to_path_buf(),
            read_buffer_size: 4096,
            rows: 24,
            cols: 80,
        };
        AppState::new(SessionManager::new(config, max, Arc::new(Metrics::new())))
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, body.to_vec())
    }

    fn json(body: &[u8]) -> serde_json::Value {
        serde_json::from_slice(body).unwrap()
    }

    fn post_sessions(body: &'static str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/sessions")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn delete_req(uri: &str) -> Request<Body> {
        Request::builder()
            .method("DELETE")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn healthz_ok() {
        let tmp = tempfile::tempdir().unwrap();
        let app = router(test_state(tmp.path(), 1), RouterConfig::default());
        let (status, body) = send(&app, get_req("/healthz")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body)["status"], "ok");
    }

    #[tokio::test]
    async fn create_get_delete_cycle() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path(), 2);
        let app = router(state.clone(), RouterConfig::default());

        let (status, body) = send(&app, post_sessions(r#"{"operator":"op"}"#)).await;
        assert_eq!(status, StatusCode::CREATED);
        let created = json(&body);
        let id = created["id"].as_str().unwrap().to_string();
        assert!(created["createdAt"].is_string());
        assert!(created["expiresAt"].is_string());

        let (status, body) = send(&app, get_req(&format!("/sessions/{id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body)["state"], "active");

        let (status, body) = send(&app, get_req("/sessions")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body).as_array().unwrap().len(), 1);

        let (status, _) = send(&app, delete_req(&format!("/sessions/{id}"))).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, body) = send(&app, delete_req(&format!("/sessions/{id}"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json(&body)["error"]["code"], "session_not_found");

        assert_eq!(state.metrics.snapshot().panic_stops, 1);
    }

    #[tokio::test]
    async fn kill_returns_while_input_is_stalled() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state_with_command(
            tmp.path(),
            1,
            CommandSpec::new("/bin/sh").with_args(["-c", "stty raw -echo; sleep 100"]),
        );
        let app = router(state.clone(), RouterConfig::default());
        let session = state.manager.create(&Default::default()).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let flood = {
            let session = session.clone();
            std::thread::spawn(move || {
                for _ in 0..512 {
                    if session.handle_input(&[b'x'; 4096]).is_err() {
                        break;
                    }
                }
            })
        };
        tokio::time::sleep(Duration::from_millis(1000)).await;

        let (status, _) = tokio::time::timeout(
            Duration::from_secs(3),
            send(&app, delete_req(&format!("/sessions/{}", session.id()))),
        )
        .await
        .expect("delete should not hang");
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(state.manager.is_empty());

        let (status, _) = tokio::time::timeout(Duration::from_secs(1), send(&app, get_req("/healthz")))
            .await
            .expect("server should stay responsive");
        assert_eq!(status, StatusCode::OK);

        tokio::time::timeout(Duration::from_secs(5), async {
            while !flood.is_finished() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("stalled write should be released");
    }

    #[tokio::test]
    async fn empty_body_creates_session() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path(), 1);
        let app = router(state.clone(), RouterConfig::default());
        let req = Request::builder()
            .method("POST")
            .uri("/sessions")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::CREATED);
        state.manager.shutdown();
    }

    #[tokio::test]
    async fn malformed_body_is_400() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path(), 1);
        let app = router(state.clone(), RouterConfig::default());
        let (status, body) = send(&app, post_sessions("{oops")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json(&body)["error"]["code"], "invalid_request");
        assert!(state.manager.is_empty());
    }

    #[tokio::test]
    async fn capacity_is_429() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path(), 1);
        let app = router(state.clone(), RouterConfig::default());
        let (status, _) = send(&app, post_sessions("{}")).await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, body) = send(&app, post_sessions("{}")).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        let body = json(&body);
        assert_eq!(body["error"]["code"], "capacity_reached");
        assert!(body["error"]["message"].as_str().unwrap().contains("capacity reached"));
        state.manager.shutdown();
    }

    #[tokio::test]
    async fn stream_unknown_session_is_404_without_failed_upgrade() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path(), 1);
        let app = router(state.clone(), RouterConfig::default());
        let (status, _) = send(&app, get_req("/sessions/nope/stream")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(state.metrics.snapshot().failed_upgrades, 0);
    }

    #[tokio::test]
    async fn stream_without_upgrade_headers_counts_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path(), 1);
        let app = router(state.clone(), RouterConfig::default());
        let session = state.manager.create(&Default::default()).unwrap();
        let (status, body) = send(&app, get_req(&format!("/sessions/{}/stream", session.id()))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json(&body)["error"]["code"], "upgrade_failed");
        assert_eq!(state.metrics.snapshot().failed_upgrades, 1);
        state.manager.shutdown();
    }

    #[tokio::test]
    async fn metrics_are_prometheus_text() {
        let tmp = tempfile::tempdir().unwrap();
        let app = router(test_state(tmp.path(), 1), RouterConfig::default());
        let response = app.oneshot(get_req("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/plain; version=0.0.4"
        );
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("codex_console_active_sessions 0"));
    }

    #[tokio::test]
    async fn proxy_guard_blocks_api_but_not_healthz() {
        let tmp = tempfile::tempdir().unwrap();
        let app = router(
            test_state(tmp.path(), 1),
            RouterConfig { require_proxy: true },
        );
        let (status, body) = send(&app, get_req("/sessions")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(json(&body)["error"]["code"], "proxy_headers_required");

        let (status, _) = send(&app, get_req("/healthz")).await;
        assert_eq!(status, StatusCode::OK);

        let req = Request::builder()
            .uri("/sessions")
            .header("x-forwarded-for", "10.1.2.3")
            .header("x-forwarded-proto", "https")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn security_headers_are_set() {
        let tmp = tempfile::tempdir().unwrap();
        let app = router(test_state(tmp.path(), 1), RouterConfig::default());
        let response = app.oneshot(get_req("/healthz")).await.unwrap();
        assert_eq!(response.headers().get("x-content-type-options").unwrap(), "nosniff");
        assert_eq!(response.headers().get("x-frame-options").unwrap(), "DENY");
    }
}
