//! Environment-driven configuration.
//!
//! Every setting can be supplied as a flag or an environment variable; the
//! deployment uses the environment exclusively. A missing backend token is
//! a startup failure.

use clap::Parser;

/// Runtime configuration for the adapter.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// API token for the userli backend.
    #[arg(long, env = "USERLI_TOKEN", hide_env_values = true)]
    pub userli_token: String,

    /// Base URL of the userli backend.
    #[arg(long, env = "USERLI_BASE_URL", default_value = "http://localhost:8000")]
    pub userli_base_url: String,

    /// Postfix recipient delimiter stripped from local parts before lookups.
    #[arg(long, env = "POSTFIX_RECIPIENT_DELIMITER")]
    pub recipient_delimiter: Option<String>,

    /// Listen address for the socketmap lookup server.
    #[arg(long, env = "SOCKETMAP_LISTEN_ADDR", default_value = "0.0.0.0:10001")]
    pub socketmap_listen_addr: String,

    /// Listen address for the policy delegation server.
    #[arg(long, env = "POLICY_LISTEN_ADDR", default_value = "0.0.0.0:10003")]
    pub policy_listen_addr: String,

    /// Listen address for metrics and probes.
    #[arg(long, env = "METRICS_LISTEN_ADDR", default_value = "0.0.0.0:10002")]
    pub metrics_listen_addr: String,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format.
    #[arg(long, env = "LOG_FORMAT", default_value = "json", value_parser = ["json", "text"])]
    pub log_format: String,
}
