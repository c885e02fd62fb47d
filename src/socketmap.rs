//! Socketmap lookup protocol handler.
//!
//! Postfix sends netstring-framed requests of the form `"{map} {key}"` and
//! expects a netstring response of `{status}` or `{status} {data}`.
//! Connections are persistent; the handler loops until the client closes,
//! a deadline fires, or shutdown is signaled.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout};
use tracing::{debug, error};

use crate::metrics::AdapterMetrics;
use crate::netstring::{self, NetstringReader};
use crate::sanitize::sanitize;
use crate::server::{ConnectionCtx, ConnectionHandler, READ_TIMEOUT, WRITE_TIMEOUT};
use crate::userli::UserliApi;

/// Budget for a single backend call.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// A socketmap protocol response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketmapResponse {
    /// The key was found; carries the result data.
    Ok(String),
    /// The key does not exist.
    NotFound,
    /// Transient failure; the MTA will retry.
    Temp(&'static str),
    /// Permanent failure; the MTA will not retry.
    Perm(&'static str),
}

impl SocketmapResponse {
    /// Wire form of the response payload.
    #[must_use]
    pub fn to_payload(&self) -> String {
        match self {
            Self::Ok(data) => format!("OK {data}"),
            Self::NotFound => "NOTFOUND".to_string(),
            Self::Temp(reason) => format!("TEMP {reason}"),
            Self::Perm(reason) => format!("PERM {reason}"),
        }
    }

    /// Status class used as the metrics label.
    fn status_class(&self) -> &'static str {
        match self {
            Self::Ok(_) => "success",
            Self::NotFound => "notfound",
            Self::Temp(_) | Self::Perm(_) => "error",
        }
    }
}

/// Handles socketmap lookups against the userli backend.
pub struct SocketmapHandler {
    client: Arc<dyn UserliApi>,
    metrics: Arc<AdapterMetrics>,
    delimiter: Option<String>,
}

impl SocketmapHandler {
    /// Create a handler.
    ///
    /// `delimiter` is the postfix recipient delimiter stripped from local
    /// parts before lookups.
    pub fn new(
        client: Arc<dyn UserliApi>,
        metrics: Arc<AdapterMetrics>,
        delimiter: Option<String>,
    ) -> Self {
        Self {
            client,
            metrics,
            delimiter,
        }
    }

    /// Route a request to the map-specific lookup.
    async fn dispatch(&self, map: &str, key: &str, deadline: Instant) -> SocketmapResponse {
        match map {
            "alias" => self.lookup_alias(deadline, key).await,
            "domain" => self.lookup_domain(deadline, key).await,
            "mailbox" => self.lookup_mailbox(deadline, key).await,
            "senders" => self.lookup_senders(deadline, key).await,
            _ => {
                error!(map = %map, "unknown map name");
                SocketmapResponse::Perm("Unknown map name")
            }
        }
    }

    async fn lookup_alias(&self, deadline: Instant, key: &str) -> SocketmapResponse {
        let Some(email) = self.sanitized(key) else {
            return SocketmapResponse::NotFound;
        };
        match self.client.get_aliases(Some(deadline), &email).await {
            Ok(aliases) if aliases.is_empty() => SocketmapResponse::NotFound,
            Ok(aliases) => SocketmapResponse::Ok(aliases.join(",")),
            Err(e) => {
                error!(key = %email, error = %e, "error fetching aliases");
                SocketmapResponse::Temp("Error fetching aliases")
            }
        }
    }

    async fn lookup_domain(&self, deadline: Instant, key: &str) -> SocketmapResponse {
        match self.client.get_domain(Some(deadline), key).await {
            Ok(true) => SocketmapResponse::Ok("1".to_string()),
            Ok(false) => SocketmapResponse::NotFound,
            Err(e) => {
                error!(key = %key, error = %e, "error fetching domain");
                SocketmapResponse::Temp("Error fetching domain")
            }
        }
    }

    async fn lookup_mailbox(&self, deadline: Instant, key: &str) -> SocketmapResponse {
        let Some(email) = self.sanitized(key) else {
            return SocketmapResponse::NotFound;
        };
        match self.client.get_mailbox(Some(deadline), &email).await {
            Ok(true) => SocketmapResponse::Ok("1".to_string()),
            Ok(false) => SocketmapResponse::NotFound,
            Err(e) => {
                error!(key = %email, error = %e, "error fetching mailbox");
                SocketmapResponse::Temp("Error fetching mailbox")
            }
        }
    }

    async fn lookup_senders(&self, deadline: Instant, key: &str) -> SocketmapResponse {
        let Some(email) = self.sanitized(key) else {
            return SocketmapResponse::NotFound;
        };
        match self.client.get_senders(Some(deadline), &email).await {
            Ok(senders) if senders.is_empty() => SocketmapResponse::NotFound,
            Ok(senders) => SocketmapResponse::Ok(senders.join(",")),
            Err(e) => {
                error!(key = %email, error = %e, "error fetching senders");
                SocketmapResponse::Temp("Error fetching senders")
            }
        }
    }

    /// Sanitize a lookup key. Failures are "no result", not errors.
    fn sanitized(&self, key: &str) -> Option<String> {
        match sanitize(key, self.delimiter.as_deref()) {
            Ok(email) => Some(email),
            Err(e) => {
                debug!(key = %key, error = %e, "unable to sanitize lookup key");
                None
            }
        }
    }
}

#[async_trait]
impl ConnectionHandler for SocketmapHandler {
    async fn handle(&self, ctx: ConnectionCtx, stream: TcpStream) {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = NetstringReader::new(read_half);

        loop {
            if ctx.shutdown.is_cancelled() {
                return;
            }

            let frame = match timeout(READ_TIMEOUT, reader.read_frame()).await {
                Err(_) => {
                    debug!("read deadline elapsed, closing connection");
                    return;
                }
                Ok(Ok(None)) => {
                    debug!("client closed connection");
                    return;
                }
                Ok(Err(e)) => {
                    debug!(error = %e, "failed to decode request frame");
                    return;
                }
                Ok(Ok(Some(frame))) => frame,
            };

            let started = Instant::now();
            let request = String::from_utf8_lossy(&frame);
            let request = request.trim();
            debug!(request = %request, "processing socketmap request");

            let (map_label, response) = match request.split_once(' ') {
                None => {
                    error!(request = %request, "invalid request format");
                    (
                        "invalid",
                        SocketmapResponse::Perm("Invalid request format"),
                    )
                }
                Some((map, key)) => {
                    let deadline = ctx.request_deadline(REQUEST_TIMEOUT);
                    let response = tokio::select! {
                        response = self.dispatch(map, key.trim(), deadline) => response,
                        _ = ctx.shutdown.cancelled() => return,
                    };
                    let label = match map {
                        "alias" | "domain" | "mailbox" | "senders" => map,
                        _ => "unknown",
                    };
                    (label, response)
                }
            };

            let frame_out = netstring::encode(response.to_payload().as_bytes());
            let write_ok = match timeout(WRITE_TIMEOUT, write_half.write_all(&frame_out)).await {
                Err(_) => {
                    error!(map = map_label, "write deadline elapsed");
                    false
                }
                Ok(Err(e)) => {
                    error!(map = map_label, error = %e, "error writing response");
                    false
                }
                Ok(Ok(())) => true,
            };

            self.metrics.record_lookup_request(
                map_label,
                response.status_class(),
                started.elapsed(),
            );

            if !write_ok {
                return;
            }
        }
    }
}
