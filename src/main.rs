//! userli-postfix-adapter - bridges a postfix MTA to the userli API.
//!
//! Startup sequence: observability, configuration, metrics registry,
//! backend client, rate limiter, then one TCP server per protocol plus the
//! metrics endpoint. SIGINT/SIGTERM cancel a shared token; every server
//! drains its in-flight connections before the process exits.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::sync::Arc;

use clap::Parser;
use prometheus_client::registry::Registry;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use userli_postfix_adapter::config::Config;
use userli_postfix_adapter::metrics::{self, AdapterMetrics};
use userli_postfix_adapter::policy::PolicyHandler;
use userli_postfix_adapter::ratelimit::RateLimiter;
use userli_postfix_adapter::server::{ServerConfig, ServerHooks, TcpServer};
use userli_postfix_adapter::socketmap::SocketmapHandler;
use userli_postfix_adapter::userli::{UserliApi, UserliClient, UserliConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();
    init_tracing(&config);

    let mut registry = Registry::default();
    let adapter_metrics = Arc::new(AdapterMetrics::new(&mut registry));

    let client = Arc::new(UserliClient::new(
        UserliConfig {
            base_url: config.userli_base_url.clone(),
            token: config.userli_token.clone(),
            ..Default::default()
        },
        Arc::clone(&adapter_metrics),
    )?);

    let shutdown = CancellationToken::new();
    install_signal_handlers(shutdown.clone());

    let limiter = Arc::new(RateLimiter::new());
    let cleanup = limiter.spawn_cleanup(shutdown.clone());

    // Bind all listeners before serving so address conflicts fail startup.
    let socketmap_server = TcpServer::bind(ServerConfig {
        name: "socketmap",
        addr: config.socketmap_listen_addr.clone(),
        max_connections: userli_postfix_adapter::server::MAX_CONCURRENT_CONNECTIONS,
        hooks: socketmap_hooks(&adapter_metrics),
    })
    .await?;

    let policy_server = TcpServer::bind(ServerConfig {
        name: "policy",
        addr: config.policy_listen_addr.clone(),
        max_connections: userli_postfix_adapter::server::MAX_CONCURRENT_CONNECTIONS,
        hooks: policy_hooks(&adapter_metrics),
    })
    .await?;

    let socketmap_handler = Arc::new(SocketmapHandler::new(
        Arc::clone(&client) as Arc<dyn UserliApi>,
        Arc::clone(&adapter_metrics),
        config.recipient_delimiter.clone(),
    ));
    let policy_handler = Arc::new(PolicyHandler::new(
        Arc::clone(&client) as Arc<dyn UserliApi>,
        Arc::clone(&limiter),
        Arc::clone(&adapter_metrics),
    ));

    info!(
        socketmap_addr = %config.socketmap_listen_addr,
        policy_addr = %config.policy_listen_addr,
        metrics_addr = %config.metrics_listen_addr,
        userli_base_url = %config.userli_base_url,
        "userli-postfix-adapter starting"
    );

    let socketmap_task = tokio::spawn(socketmap_server.run(shutdown.clone(), socketmap_handler));
    let policy_task = tokio::spawn(policy_server.run(shutdown.clone(), policy_handler));

    let metrics_task = {
        let shutdown = shutdown.clone();
        let addr = config.metrics_listen_addr.clone();
        let adapter_metrics = Arc::clone(&adapter_metrics);
        let client = Arc::clone(&client) as Arc<dyn UserliApi>;
        let limiter = Arc::clone(&limiter);
        tokio::spawn(async move {
            let result = metrics::serve(
                addr,
                registry,
                adapter_metrics,
                client,
                limiter,
                shutdown.clone(),
            )
            .await;
            if let Err(e) = &result {
                error!(error = %e, "metrics server failed");
                shutdown.cancel();
            }
            result
        })
    };

    let (socketmap_result, policy_result, metrics_result) =
        tokio::join!(socketmap_task, policy_task, metrics_task);
    socketmap_result?;
    policy_result?;
    metrics_result??;

    let _ = cleanup.await;
    info!("servers stopped");
    Ok(())
}

fn socketmap_hooks(metrics: &Arc<AdapterMetrics>) -> ServerHooks {
    let acquired = Arc::clone(metrics);
    let released = Arc::clone(metrics);
    let refused = Arc::clone(metrics);
    let pool = Arc::clone(metrics);
    ServerHooks {
        on_acquired: Some(Box::new(move || {
            acquired.active_connections.inc();
        })),
        on_released: Some(Box::new(move || {
            released.active_connections.dec();
        })),
        on_refused: Some(Box::new(move || {
            refused.connections_refused.inc();
        })),
        on_pool_size_changed: Some(Box::new(move |n| {
            pool.connection_pool_usage.set(n);
        })),
    }
}

fn policy_hooks(metrics: &Arc<AdapterMetrics>) -> ServerHooks {
    let acquired = Arc::clone(metrics);
    let released = Arc::clone(metrics);
    let refused = Arc::clone(metrics);
    ServerHooks {
        on_acquired: Some(Box::new(move || {
            acquired.policy_active_connections.inc();
        })),
        on_released: Some(Box::new(move || {
            released.policy_active_connections.dec();
        })),
        on_refused: Some(Box::new(move || {
            refused.connections_refused.inc();
        })),
        on_pool_size_changed: None,
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.log_format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Translate SIGINT and SIGTERM into the shared shutdown token.
fn install_signal_handlers(shutdown: CancellationToken) {
    let sigint = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received SIGINT, initiating graceful shutdown");
                sigint.cancel();
            }
            Err(e) => error!(error = %e, "failed to listen for SIGINT"),
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("received SIGTERM, initiating graceful shutdown");
                shutdown.cancel();
            }
            Err(e) => error!(error = %e, "failed to listen for SIGTERM"),
        }
    });
}
