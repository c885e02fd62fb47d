//! HTTP client for the userli user-management API.
//!
//! All lookups are authenticated GETs against
//! `{base}/api/postfix/{resource}/{key}`. The underlying `reqwest` client is
//! held behind an [`ArcSwap`] so its transport or timeout can be replaced at
//! runtime: writers swap the snapshot atomically, in-flight requests keep
//! using the client they loaded.

use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::time::Instant;

use crate::error::UserliError;
use crate::metrics::AdapterMetrics;

/// User-agent header sent on every backend call.
pub const USER_AGENT: &str = "userli-postfix-adapter";

/// Per-call deadline applied when the caller does not supply one.
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Sending quota limits for a user. A field of 0 disables that window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Quota {
    /// Messages allowed per hour.
    pub per_hour: u32,
    /// Messages allowed per day.
    pub per_day: u32,
}

impl Quota {
    /// Both windows disabled means the sender is unlimited.
    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        self.per_hour == 0 && self.per_day == 0
    }
}

/// The backend lookups the protocol handlers depend on.
///
/// Abstracted as a trait so tests can substitute a mock backend without a
/// network. A deadline of `None` lets the client apply its 5 s default.
#[async_trait]
pub trait UserliApi: Send + Sync {
    /// Destination addresses for an alias.
    async fn get_aliases(
        &self,
        deadline: Option<Instant>,
        email: &str,
    ) -> Result<Vec<String>, UserliError>;

    /// Whether a domain is handled by this installation.
    async fn get_domain(&self, deadline: Option<Instant>, domain: &str)
    -> Result<bool, UserliError>;

    /// Whether a mailbox exists.
    async fn get_mailbox(
        &self,
        deadline: Option<Instant>,
        email: &str,
    ) -> Result<bool, UserliError>;

    /// Allowed envelope senders for an address.
    async fn get_senders(
        &self,
        deadline: Option<Instant>,
        email: &str,
    ) -> Result<Vec<String>, UserliError>;

    /// Sending quota for an address.
    async fn get_quota(&self, deadline: Option<Instant>, email: &str)
    -> Result<Quota, UserliError>;
}

/// Configuration for the backend client.
#[derive(Debug, Clone)]
pub struct UserliConfig {
    /// Base URL of the userli installation.
    pub base_url: String,
    /// Bearer token for the postfix API.
    pub token: String,
    /// Overall per-request timeout of the underlying client.
    pub timeout: Duration,
    /// TCP/TLS connection establishment timeout.
    pub connect_timeout: Duration,
    /// Maximum idle pooled connections kept per host.
    pub pool_max_idle_per_host: usize,
    /// How long idle pooled connections stay open.
    pub pool_idle_timeout: Duration,
}

impl Default for UserliConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            token: String::new(),
            timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            pool_max_idle_per_host: 30,
            pool_idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Authenticated client for the userli postfix API.
pub struct UserliClient {
    config: UserliConfig,
    client: ArcSwap<Client>,
    metrics: Arc<AdapterMetrics>,
}

impl UserliClient {
    /// Build a client with a pooled, keep-alive transport.
    ///
    /// # Errors
    ///
    /// Returns [`UserliError::Transport`] if the HTTP client cannot be built.
    pub fn new(config: UserliConfig, metrics: Arc<AdapterMetrics>) -> Result<Self, UserliError> {
        let client = build_client(&config)?;
        Ok(Self {
            config,
            client: ArcSwap::from_pointee(client),
            metrics,
        })
    }

    /// Atomically replace the HTTP client. In-flight requests keep using the
    /// snapshot they already loaded.
    pub fn set_client(&self, client: Client) {
        self.client.store(Arc::new(client));
    }

    /// Rebuild the client with a new overall timeout, keeping the standard
    /// pool settings.
    ///
    /// # Errors
    ///
    /// Returns [`UserliError::Transport`] if the HTTP client cannot be built.
    pub fn set_timeout(&self, timeout: Duration) -> Result<(), UserliError> {
        let config = UserliConfig {
            timeout,
            ..self.config.clone()
        };
        self.set_client(build_client(&config)?);
        Ok(())
    }

    async fn call<T: DeserializeOwned>(
        &self,
        deadline: Option<Instant>,
        resource: &str,
        key: &str,
    ) -> Result<T, UserliError> {
        let started = Instant::now();
        let timeout = match deadline {
            Some(deadline) => deadline.saturating_duration_since(started),
            None => DEFAULT_CALL_TIMEOUT,
        };

        let url = format!(
            "{}/api/postfix/{}/{}",
            self.config.base_url.trim_end_matches('/'),
            resource,
            key
        );

        let client = self.client.load_full();
        let result = client
            .get(&url)
            .bearer_auth(&self.config.token)
            .header(reqwest::header::ACCEPT, "application/json")
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .timeout(timeout)
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                self.metrics
                    .record_http_client_request(resource, "error", started.elapsed());
                return Err(classify_error(resource, &e));
            }
        };

        let status = response.status();
        self.metrics
            .record_http_client_request(resource, status.as_str(), started.elapsed());

        if !status.is_success() {
            // Drain the body so the pooled connection can be reused.
            let _ = response.bytes().await;
            return Err(UserliError::Status {
                status: status.as_u16(),
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| UserliError::Decode {
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl UserliApi for UserliClient {
    async fn get_aliases(
        &self,
        deadline: Option<Instant>,
        email: &str,
    ) -> Result<Vec<String>, UserliError> {
        self.call(deadline, "alias", email).await
    }

    async fn get_domain(
        &self,
        deadline: Option<Instant>,
        domain: &str,
    ) -> Result<bool, UserliError> {
        self.call(deadline, "domain", domain).await
    }

    async fn get_mailbox(
        &self,
        deadline: Option<Instant>,
        email: &str,
    ) -> Result<bool, UserliError> {
        self.call(deadline, "mailbox", email).await
    }

    async fn get_senders(
        &self,
        deadline: Option<Instant>,
        email: &str,
    ) -> Result<Vec<String>, UserliError> {
        self.call(deadline, "senders", email).await
    }

    async fn get_quota(
        &self,
        deadline: Option<Instant>,
        email: &str,
    ) -> Result<Quota, UserliError> {
        self.call(deadline, "quota", email).await
    }
}

fn build_client(config: &UserliConfig) -> Result<Client, UserliError> {
    Client::builder()
        .timeout(config.timeout)
        .connect_timeout(config.connect_timeout)
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .pool_idle_timeout(config.pool_idle_timeout)
        .tcp_keepalive(Duration::from_secs(60))
        .tcp_nodelay(true)
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| UserliError::Transport {
            reason: e.to_string(),
        })
}

fn classify_error(resource: &str, error: &reqwest::Error) -> UserliError {
    if error.is_timeout() {
        UserliError::Timeout {
            endpoint: resource.to_string(),
        }
    } else if error.is_connect() {
        UserliError::Connect {
            reason: error.to_string(),
        }
    } else {
        UserliError::Transport {
            reason: error.to_string(),
        }
    }
}
