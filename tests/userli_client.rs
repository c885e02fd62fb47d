//! Backend client tests against a local mock HTTP server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::Path;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use userli_postfix_adapter::error::UserliError;
use userli_postfix_adapter::metrics::AdapterMetrics;
use userli_postfix_adapter::userli::{Quota, UserliApi, UserliClient, UserliConfig};

const TOKEN: &str = "test-token";

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {TOKEN}"))
}

async fn alias(headers: HeaderMap, Path(email): Path<String>) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match email.as_str() {
        "broken@example.com" => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        "notjson@example.com" => "this is not json".into_response(),
        "slow@example.com" => {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Json(Vec::<String>::new()).into_response()
        }
        _ => Json(vec![
            "user1@example.com".to_string(),
            "user2@example.com".to_string(),
        ])
        .into_response(),
    }
}

async fn domain(headers: HeaderMap, Path(domain): Path<String>) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(domain == "example.com").into_response()
}

async fn mailbox(headers: HeaderMap, Path(_email): Path<String>) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(true).into_response()
}

async fn senders(headers: HeaderMap, Path(_email): Path<String>) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(Vec::<String>::new()).into_response()
}

async fn quota(headers: HeaderMap, Path(_email): Path<String>) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(serde_json::json!({"per_hour": 5, "per_day": 50})).into_response()
}

struct Backend {
    addr: SocketAddr,
    shutdown: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl Backend {
    async fn start() -> Self {
        let app = Router::new()
            .route("/api/postfix/alias/{email}", get(alias))
            .route("/api/postfix/domain/{domain}", get(domain))
            .route("/api/postfix/mailbox/{email}", get(mailbox))
            .route("/api/postfix/senders/{email}", get(senders))
            .route("/api/postfix/quota/{email}", get(quota));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
                .unwrap();
        });

        Self {
            addr,
            shutdown,
            task,
        }
    }

    fn client(&self, token: &str) -> UserliClient {
        let metrics = Arc::new(AdapterMetrics::new(&mut Registry::default()));
        UserliClient::new(
            UserliConfig {
                base_url: format!("http://{}", self.addr),
                token: token.to_string(),
                ..Default::default()
            },
            metrics,
        )
        .unwrap()
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.task.await.unwrap();
    }
}

#[tokio::test]
async fn test_get_aliases() {
    let backend = Backend::start().await;
    let client = backend.client(TOKEN);

    let aliases = client.get_aliases(None, "alias@example.com").await.unwrap();
    assert_eq!(aliases, vec!["user1@example.com", "user2@example.com"]);

    backend.stop().await;
}

#[tokio::test]
async fn test_get_domain() {
    let backend = Backend::start().await;
    let client = backend.client(TOKEN);

    assert!(client.get_domain(None, "example.com").await.unwrap());
    assert!(!client.get_domain(None, "example.org").await.unwrap());

    backend.stop().await;
}

#[tokio::test]
async fn test_get_mailbox_and_senders() {
    let backend = Backend::start().await;
    let client = backend.client(TOKEN);

    assert!(client.get_mailbox(None, "user@example.com").await.unwrap());
    assert!(
        client
            .get_senders(None, "user@example.com")
            .await
            .unwrap()
            .is_empty()
    );

    backend.stop().await;
}

#[tokio::test]
async fn test_get_quota() {
    let backend = Backend::start().await;
    let client = backend.client(TOKEN);

    let quota = client.get_quota(None, "user@example.com").await.unwrap();
    assert_eq!(
        quota,
        Quota {
            per_hour: 5,
            per_day: 50
        }
    );

    backend.stop().await;
}

#[tokio::test]
async fn test_wrong_token_surfaces_status() {
    let backend = Backend::start().await;
    let client = backend.client("wrong-token");

    let err = client
        .get_aliases(None, "alias@example.com")
        .await
        .unwrap_err();
    assert!(matches!(err, UserliError::Status { status: 401 }));

    backend.stop().await;
}

#[tokio::test]
async fn test_backend_500_surfaces_status() {
    let backend = Backend::start().await;
    let client = backend.client(TOKEN);

    let err = client
        .get_aliases(None, "broken@example.com")
        .await
        .unwrap_err();
    assert!(matches!(err, UserliError::Status { status: 500 }));

    backend.stop().await;
}

#[tokio::test]
async fn test_invalid_body_surfaces_decode_error() {
    let backend = Backend::start().await;
    let client = backend.client(TOKEN);

    let err = client
        .get_aliases(None, "notjson@example.com")
        .await
        .unwrap_err();
    assert!(matches!(err, UserliError::Decode { .. }));

    backend.stop().await;
}

#[tokio::test]
async fn test_deadline_aborts_slow_call() {
    let backend = Backend::start().await;
    let client = backend.client(TOKEN);

    let started = Instant::now();
    let deadline = started + Duration::from_millis(200);
    let err = client
        .get_aliases(Some(deadline), "slow@example.com")
        .await
        .unwrap_err();

    assert!(matches!(err, UserliError::Timeout { .. }), "got: {err:?}");
    assert!(started.elapsed() < Duration::from_secs(1));

    backend.stop().await;
}

#[tokio::test]
async fn test_connection_refused_classified_as_connect() {
    let metrics = Arc::new(AdapterMetrics::new(&mut Registry::default()));
    // Bind a port, then drop it so nothing is listening.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = UserliClient::new(
        UserliConfig {
            base_url: format!("http://{addr}"),
            token: TOKEN.to_string(),
            ..Default::default()
        },
        metrics,
    )
    .unwrap();

    let err = client.get_domain(None, "example.com").await.unwrap_err();
    assert!(matches!(err, UserliError::Connect { .. }), "got: {err:?}");
}

#[tokio::test]
async fn test_client_swap_keeps_working() {
    let backend = Backend::start().await;
    let client = backend.client(TOKEN);

    assert!(client.get_domain(None, "example.com").await.unwrap());
    client.set_timeout(Duration::from_secs(3)).unwrap();
    assert!(client.get_domain(None, "example.com").await.unwrap());

    backend.stop().await;
}
