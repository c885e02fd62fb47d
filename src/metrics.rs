//! Prometheus metrics and the probe endpoints.
//!
//! All metric families live on [`AdapterMetrics`]; registration happens once
//! at startup and the struct is shared behind an `Arc`. Exposition is an
//! axum server on its own listener with `/metrics`, `/health`, and `/ready`
//! routes, shut down by the same cancellation token as the TCP servers.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::UserliError;
use crate::ratelimit::RateLimiter;
use crate::userli::UserliApi;

/// Deadline for the backend probe behind `/ready`.
const READINESS_TIMEOUT: Duration = Duration::from_secs(2);

/// Known-invalid domain used to probe backend reachability.
const READINESS_PROBE_DOMAIN: &str = "health-check.invalid";

// ─────────────────────────────────────────────────────────────────────────────
// Label Sets
// ─────────────────────────────────────────────────────────────────────────────

/// Labels for lookup request counters and duration histograms.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HandlerLabels {
    /// Map name (`alias`, `domain`, `mailbox`, `senders`) or `invalid`/`unknown`.
    pub handler: String,
    /// Outcome class: `success`, `notfound`, or `error`.
    pub status: String,
}

/// Labels for backend HTTP client counters and histograms.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EndpointLabels {
    /// API resource name derived from the URL path.
    pub endpoint: String,
    /// HTTP status code, or `error` when no response arrived.
    pub status_code: String,
}

/// Labels for policy request counters and histograms.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PolicyLabels {
    /// Decision stage: `skip` (pre-END-OF-MESSAGE) or `check`.
    pub stage: String,
    /// Resulting action class: `dunno`, `reject`, or `error`.
    pub action: String,
}

/// Labels for the quota check counter.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResultLabels {
    /// Check result classification.
    pub result: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// AdapterMetrics
// ─────────────────────────────────────────────────────────────────────────────

/// All metric families of the adapter, prefixed `userli_postfix_adapter_`.
pub struct AdapterMetrics {
    /// Socketmap requests by handler and outcome.
    pub requests: Family<HandlerLabels, Counter>,
    /// Socketmap request latency.
    pub request_duration_seconds: Family<HandlerLabels, Histogram>,
    /// Currently open socketmap connections.
    pub active_connections: Gauge,
    /// Currently open policy connections.
    pub policy_active_connections: Gauge,
    /// Occupancy of the socketmap connection pool (0-500).
    pub connection_pool_usage: Gauge,
    /// Connections refused because the pool was exhausted.
    pub connections_refused: Counter,
    /// Backend API calls by endpoint and status code.
    pub http_client_requests: Family<EndpointLabels, Counter>,
    /// Backend API call latency.
    pub http_client_duration_seconds: Family<EndpointLabels, Histogram>,
    /// Result of the last readiness probe (1 healthy, 0 unhealthy).
    pub health_check_status: Gauge,
    /// Policy requests by stage and action.
    pub policy_requests: Family<PolicyLabels, Counter>,
    /// Policy request latency.
    pub policy_request_duration_seconds: Family<PolicyLabels, Histogram>,
    /// Messages rejected because a quota was exceeded.
    pub quota_exceeded: Counter,
    /// Quota checks performed against the rate limiter.
    pub quota_checks: Family<ResultLabels, Counter>,
    /// Senders currently tracked by the rate limiter.
    pub tracked_senders: Gauge,
}

impl AdapterMetrics {
    /// Create and register all metric families with the given registry.
    pub fn new(registry: &mut Registry) -> Self {
        let requests = Family::<HandlerLabels, Counter>::default();
        registry.register(
            "userli_postfix_adapter_requests",
            "Total number of socketmap requests",
            requests.clone(),
        );

        let request_duration_seconds =
            Family::<HandlerLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 10))
            });
        registry.register(
            "userli_postfix_adapter_request_duration_seconds",
            "Duration of socketmap requests",
            request_duration_seconds.clone(),
        );

        let active_connections = Gauge::default();
        registry.register(
            "userli_postfix_adapter_active_connections",
            "Number of currently active socketmap connections",
            active_connections.clone(),
        );

        let policy_active_connections = Gauge::default();
        registry.register(
            "userli_postfix_adapter_policy_active_connections",
            "Number of currently active policy connections",
            policy_active_connections.clone(),
        );

        let connection_pool_usage = Gauge::default();
        registry.register(
            "userli_postfix_adapter_connection_pool_usage",
            "Current usage of the socketmap connection pool",
            connection_pool_usage.clone(),
        );

        let connections_refused = Counter::default();
        registry.register(
            "userli_postfix_adapter_connections_refused",
            "Connections closed immediately because the pool was full",
            connections_refused.clone(),
        );

        let http_client_requests = Family::<EndpointLabels, Counter>::default();
        registry.register(
            "userli_postfix_adapter_http_client_requests",
            "Total number of HTTP requests to the userli API",
            http_client_requests.clone(),
        );

        let http_client_duration_seconds =
            Family::<EndpointLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.01, 2.0, 10))
            });
        registry.register(
            "userli_postfix_adapter_http_client_duration_seconds",
            "Duration of HTTP requests to the userli API",
            http_client_duration_seconds.clone(),
        );

        let health_check_status = Gauge::default();
        registry.register(
            "userli_postfix_adapter_health_check_status",
            "Readiness check status (1 = healthy, 0 = unhealthy)",
            health_check_status.clone(),
        );

        let policy_requests = Family::<PolicyLabels, Counter>::default();
        registry.register(
            "userli_postfix_adapter_policy_requests",
            "Total number of policy requests",
            policy_requests.clone(),
        );

        let policy_request_duration_seconds =
            Family::<PolicyLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 10))
            });
        registry.register(
            "userli_postfix_adapter_policy_request_duration_seconds",
            "Duration of policy requests",
            policy_request_duration_seconds.clone(),
        );

        let quota_exceeded = Counter::default();
        registry.register(
            "userli_postfix_adapter_quota_exceeded",
            "Total number of messages rejected due to quota",
            quota_exceeded.clone(),
        );

        let quota_checks = Family::<ResultLabels, Counter>::default();
        registry.register(
            "userli_postfix_adapter_quota_checks",
            "Total number of quota checks performed",
            quota_checks.clone(),
        );

        let tracked_senders = Gauge::default();
        registry.register(
            "userli_postfix_adapter_tracked_senders",
            "Number of senders currently tracked by the rate limiter",
            tracked_senders.clone(),
        );

        Self {
            requests,
            request_duration_seconds,
            active_connections,
            policy_active_connections,
            connection_pool_usage,
            connections_refused,
            http_client_requests,
            http_client_duration_seconds,
            health_check_status,
            policy_requests,
            policy_request_duration_seconds,
            quota_exceeded,
            quota_checks,
            tracked_senders,
        }
    }

    /// Record one socketmap request outcome.
    pub fn record_lookup_request(&self, handler: &str, status: &str, duration: Duration) {
        let labels = HandlerLabels {
            handler: handler.to_string(),
            status: status.to_string(),
        };
        self.requests.get_or_create(&labels).inc();
        self.request_duration_seconds
            .get_or_create(&labels)
            .observe(duration.as_secs_f64());
    }

    /// Record one backend API call.
    pub fn record_http_client_request(&self, endpoint: &str, status_code: &str, duration: Duration) {
        let labels = EndpointLabels {
            endpoint: endpoint.to_string(),
            status_code: status_code.to_string(),
        };
        self.http_client_requests.get_or_create(&labels).inc();
        self.http_client_duration_seconds
            .get_or_create(&labels)
            .observe(duration.as_secs_f64());
    }

    /// Record one policy request outcome.
    pub fn record_policy_request(&self, stage: &str, action: &str, duration: Duration) {
        let labels = PolicyLabels {
            stage: stage.to_string(),
            action: action.to_string(),
        };
        self.policy_requests.get_or_create(&labels).inc();
        self.policy_request_duration_seconds
            .get_or_create(&labels)
            .observe(duration.as_secs_f64());
    }

    /// Record one rate-limiter quota check.
    pub fn record_quota_check(&self, result: &str) {
        self.quota_checks
            .get_or_create(&ResultLabels {
                result: result.to_string(),
            })
            .inc();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Metrics and probe server
// ─────────────────────────────────────────────────────────────────────────────

struct MetricsState {
    registry: Registry,
    metrics: Arc<AdapterMetrics>,
    client: Arc<dyn UserliApi>,
    limiter: Arc<RateLimiter>,
}

/// Serve `/metrics`, `/health`, and `/ready` until `shutdown` fires.
///
/// # Errors
///
/// Returns the bind error if the listen address is unavailable; this is
/// fatal for the process.
pub async fn serve(
    addr: String,
    registry: Registry,
    metrics: Arc<AdapterMetrics>,
    client: Arc<dyn UserliApi>,
    limiter: Arc<RateLimiter>,
    shutdown: CancellationToken,
) -> io::Result<()> {
    let state = Arc::new(MetricsState {
        registry,
        metrics,
        client,
        limiter,
    });

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .with_state(state);

    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "metrics server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("metrics server stopped");
    Ok(())
}

async fn metrics_handler(State(state): State<Arc<MetricsState>>) -> Response {
    // The tracked-senders gauge is refreshed at scrape time; everything else
    // is updated inline by the handlers.
    state
        .metrics
        .tracked_senders
        .set(state.limiter.sender_count() as i64);

    let mut body = String::new();
    if let Err(e) = encode(&mut body, &state.registry) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {e}"),
        )
            .into_response();
    }
    (
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        body,
    )
        .into_response()
}

async fn health_handler() -> Response {
    Json(json!({"status": "ok"})).into_response()
}

/// Readiness is one probe call against a known-invalid domain. Any answer
/// from the backend, including an HTTP error status, proves reachability;
/// only transport failures and timeouts report unavailable.
async fn ready_handler(State(state): State<Arc<MetricsState>>) -> Response {
    let deadline = Instant::now() + READINESS_TIMEOUT;
    match state
        .client
        .get_domain(Some(deadline), READINESS_PROBE_DOMAIN)
        .await
    {
        Ok(_) | Err(UserliError::Status { .. }) | Err(UserliError::Decode { .. }) => {
            state.metrics.health_check_status.set(1);
            Json(json!({"status": "ready"})).into_response()
        }
        Err(e) => {
            state.metrics.health_check_status.set(0);
            warn!(error = %e, "readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"status": "unavailable", "error": e.to_string()})),
            )
                .into_response()
        }
    }
}
