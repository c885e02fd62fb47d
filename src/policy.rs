//! Postfix SMTP access policy delegation handler.
//!
//! Each request is a block of `name=value` lines terminated by an empty
//! line; the response is a single `action=…` line followed by an empty line.
//! The handler rate-limits outgoing mail per authenticated sender: quota
//! comes from the backend, the sliding window is local. Backend failures
//! fail open, because rejecting here would mean losing mail.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::time::{Instant, timeout};
use tracing::{debug, error, info, warn};

use crate::metrics::AdapterMetrics;
use crate::ratelimit::RateLimiter;
use crate::server::{ConnectionCtx, ConnectionHandler, READ_TIMEOUT, WRITE_TIMEOUT};
use crate::userli::UserliApi;

/// Budget for the quota fetch.
const QUOTA_TIMEOUT: Duration = Duration::from_secs(5);

/// Reject text sent to the MTA when a sender exceeds quota.
const REJECT_MESSAGE: &str = "Rate limit exceeded, please try again later";

/// Action returned to the MTA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyAction {
    /// No opinion; let other restrictions decide.
    Dunno,
    /// Reject the message with the given text.
    Reject(&'static str),
}

impl PolicyAction {
    /// Wire form: `action=…` plus the terminating empty line.
    #[must_use]
    pub fn to_wire(self) -> String {
        match self {
            Self::Dunno => "action=DUNNO\n\n".to_string(),
            Self::Reject(message) => format!("action=REJECT {message}\n\n"),
        }
    }
}

/// A parsed policy delegation request.
///
/// All fields postfix is known to send are parsed; only `protocol_state`,
/// `sasl_username`, and `sender` participate in decisioning.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PolicyRequest {
    pub request: String,
    pub protocol_state: String,
    pub protocol_name: String,
    pub sender: String,
    pub recipient: String,
    pub recipient_count: String,
    pub client_address: String,
    pub client_name: String,
    pub sasl_method: String,
    pub sasl_username: String,
    pub size: String,
    pub queue_id: String,
    pub instance: String,
    pub encryption_cipher: String,
}

/// Read one policy request: `name=value` lines up to an empty line.
///
/// Returns `Ok(None)` when the peer closed the connection. Lines without
/// `=` are skipped; unrecognized names are discarded.
async fn read_request(
    reader: &mut BufReader<OwnedReadHalf>,
) -> io::Result<Option<PolicyRequest>> {
    let mut request = PolicyRequest::default();
    let mut buf = String::new();

    loop {
        buf.clear();
        if reader.read_line(&mut buf).await? == 0 {
            return Ok(None);
        }

        let line = buf.trim();
        if line.is_empty() {
            return Ok(Some(request));
        }

        let Some((name, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().to_string();
        match name.trim() {
            "request" => request.request = value,
            "protocol_state" => request.protocol_state = value,
            "protocol_name" => request.protocol_name = value,
            "sender" => request.sender = value,
            "recipient" => request.recipient = value,
            "recipient_count" => request.recipient_count = value,
            "client_address" => request.client_address = value,
            "client_name" => request.client_name = value,
            "sasl_method" => request.sasl_method = value,
            "sasl_username" => request.sasl_username = value,
            "size" => request.size = value,
            "queue_id" => request.queue_id = value,
            "instance" => request.instance = value,
            "encryption_cipher" => request.encryption_cipher = value,
            _ => {}
        }
    }
}

/// Rate-limits outgoing mail via quota lookups and the sliding window.
pub struct PolicyHandler {
    client: Arc<dyn UserliApi>,
    limiter: Arc<RateLimiter>,
    metrics: Arc<AdapterMetrics>,
}

impl PolicyHandler {
    /// Create a handler.
    pub fn new(
        client: Arc<dyn UserliApi>,
        limiter: Arc<RateLimiter>,
        metrics: Arc<AdapterMetrics>,
    ) -> Self {
        Self {
            client,
            limiter,
            metrics,
        }
    }

    /// Decide the action for one request.
    async fn decide(&self, ctx: &ConnectionCtx, request: &PolicyRequest) -> PolicyAction {
        let started = Instant::now();

        // Only count at END-OF-MESSAGE, when the message will actually be
        // sent; earlier protocol stages would double-count.
        if request.protocol_state != "END-OF-MESSAGE" {
            self.metrics
                .record_policy_request("skip", "dunno", started.elapsed());
            return PolicyAction::Dunno;
        }

        // The SASL username is more reliable than the envelope sender for
        // authenticated submission; fall back to the envelope sender.
        let sender = if request.sasl_username.is_empty() {
            request.sender.as_str()
        } else {
            request.sasl_username.as_str()
        };

        if sender.is_empty() {
            debug!("no sender identity found, allowing message");
            self.metrics
                .record_policy_request("check", "dunno", started.elapsed());
            return PolicyAction::Dunno;
        }

        let deadline = ctx.request_deadline(QUOTA_TIMEOUT);
        let fetched = tokio::select! {
            fetched = self.client.get_quota(Some(deadline), sender) => fetched,
            _ = ctx.shutdown.cancelled() => {
                self.metrics
                    .record_policy_request("check", "dunno", started.elapsed());
                return PolicyAction::Dunno;
            }
        };

        let quota = match fetched {
            Ok(quota) => quota,
            Err(e) => {
                // Fail open: a fault here must not cause mail loss.
                warn!(sender = %sender, error = %e, "failed to fetch quota, allowing message");
                self.metrics
                    .record_policy_request("check", "error", started.elapsed());
                return PolicyAction::Dunno;
            }
        };

        if quota.is_unlimited() {
            debug!(sender = %sender, "no quota limits configured");
            self.metrics
                .record_policy_request("check", "dunno", started.elapsed());
            return PolicyAction::Dunno;
        }

        let decision = self.limiter.check_and_increment(sender, &quota);
        self.metrics.record_quota_check("checked");

        if !decision.allowed {
            info!(
                sender = %sender,
                hour_count = decision.hour_count,
                day_count = decision.day_count,
                hour_limit = quota.per_hour,
                day_limit = quota.per_day,
                "rate limit exceeded"
            );
            self.metrics
                .record_policy_request("check", "reject", started.elapsed());
            self.metrics.quota_exceeded.inc();
            return PolicyAction::Reject(REJECT_MESSAGE);
        }

        debug!(
            sender = %sender,
            hour_count = decision.hour_count,
            day_count = decision.day_count,
            "message allowed"
        );
        self.metrics
            .record_policy_request("check", "dunno", started.elapsed());
        PolicyAction::Dunno
    }
}

#[async_trait]
impl ConnectionHandler for PolicyHandler {
    async fn handle(&self, ctx: ConnectionCtx, stream: TcpStream) {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        loop {
            if ctx.shutdown.is_cancelled() {
                return;
            }

            let request = match timeout(READ_TIMEOUT, read_request(&mut reader)).await {
                Err(_) => {
                    debug!("read deadline elapsed, closing connection");
                    return;
                }
                Ok(Ok(None)) => {
                    debug!("client closed connection");
                    return;
                }
                Ok(Err(e)) => {
                    debug!(error = %e, "failed to read policy request");
                    return;
                }
                Ok(Ok(Some(request))) => request,
            };

            let action = self.decide(&ctx, &request).await;
            let response = action.to_wire();

            match timeout(WRITE_TIMEOUT, write_half.write_all(response.as_bytes())).await {
                Err(_) => {
                    error!("write deadline elapsed");
                    return;
                }
                Ok(Err(e)) => {
                    error!(error = %e, "failed to write policy response");
                    return;
                }
                Ok(Ok(())) => {}
            }
        }
    }
}
