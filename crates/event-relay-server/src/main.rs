// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod logger;

use std::{env, sync::Arc};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use event_relay::{
    config::RelayConfig,
    delivery::DeliveryClient,
    flusher::Flusher,
    http_utils::get_client,
    intake::IntakeServer,
    queue_store::{redis::RedisQueueStore, MemoryQueueStore, QueueStore},
    scheduler::FlushScheduler,
    tenant::TenantRegistry,
};
use tokio_util::sync::CancellationToken;

#[tokio::main]
pub async fn main() {
    let log_level = env::var("RELAY_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());
    init_logging(&log_level);

    let config = match RelayConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Error loading event relay configuration: {e}");
            return;
        }
    };
    debug!("Loaded configuration: {:?}", redacted(&config));

    let store: Arc<dyn QueueStore> = match config.redis_url.as_deref() {
        Some(redis_url) => match RedisQueueStore::connect(redis_url).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                error!("Unable to connect to the queue store: {e}");
                return;
            }
        },
        None => {
            warn!("RELAY_REDIS_URL is not set, queued events will not survive a restart");
            Arc::new(MemoryQueueStore::new())
        }
    };

    let registry = Arc::new(TenantRegistry::new(config.queue_prefix.clone()));
    match registry.restore(store.as_ref()).await {
        Ok(0) => {}
        Ok(restored) => info!("Restored {restored} tenants with pending events"),
        Err(e) => warn!("Unable to restore tenants from the queue store: {e}"),
    }

    if config.upstream_url.is_none() {
        warn!("RELAY_UPSTREAM_URL is not set, events will be queued but not delivered");
    }
    let client = get_client(config.https_proxy.as_deref(), config.request_timeout);
    let flusher = Arc::new(Flusher::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        DeliveryClient::new(client, config.upstream_url.clone()),
        config.flusher_config(),
    ));
    let scheduler = FlushScheduler::new(flusher, config.flush_interval);
    scheduler.start();

    let listener = match TcpListener::bind(config.intake_addr()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Unable to listen on {}: {e}", config.intake_addr());
            scheduler.shutdown().await;
            return;
        }
    };
    info!("Event relay listening on {}", config.intake_addr());

    let intake = Arc::new(IntakeServer::new(store, registry, &config));
    let cancel_token = CancellationToken::new();
    let mut intake_handle = tokio::spawn(intake.serve(listener, cancel_token.clone()));

    tokio::select! {
        () = shutdown_signal() => info!("Shutting down event relay"),
        result = &mut intake_handle => {
            error!("Intake server stopped unexpectedly: {result:?}");
        }
    }

    cancel_token.cancel();
    if !intake_handle.is_finished() {
        if let Err(e) = intake_handle.await {
            error!("Intake server did not stop cleanly: {e}");
        }
    }

    let summary = scheduler.shutdown().await;
    info!(
        "Final flush delivered {} events, {} left queued",
        summary.delivered_events, summary.requeued_events
    );
}

fn init_logging(log_level: &str) {
    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", log_level);
    let env_filter = EnvFilter::try_new(env_filter).unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .event_format(logger::Formatter)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Setting default subscriber failed: {e}");
    }
    debug!("Logging subsystem enabled");
}

/// Configuration with the default tenant credential and proxy removed.
fn redacted(config: &RelayConfig) -> RelayConfig {
    RelayConfig {
        api_key: config.default_api_key().map(|key| key.redacted()),
        https_proxy: config.https_proxy.as_ref().map(|_| "<set>".to_string()),
        redis_url: config.redis_url.as_ref().map(|_| "<set>".to_string()),
        ..config.clone()
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Unable to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Unable to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
