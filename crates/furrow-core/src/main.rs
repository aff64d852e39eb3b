// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Furrow Core - Gateway Coordination Backend
//!
//! Binary entry point: loads configuration, connects the store, starts the
//! gateway QUIC server, and spawns the liveness prober, correlation sweep,
//! and schedule driver.

use std::sync::Arc;

use anyhow::Result;
use furrow_protocol::{FieldServer, FieldServerConfig};
use tracing::{error, info, warn};

use furrow_core::config::Config;
use furrow_core::correlation::CorrelationTable;
use furrow_core::engine::CommandEngine;
use furrow_core::persistence::{PostgresStore, SqliteStore, Store};
use furrow_core::prober::{CorrelationSweep, LivenessProber, ProberConfig, SweepConfig};
use furrow_core::registry::ConnectionRegistry;
use furrow_core::scheduler::{ScheduleConfig, ScheduleDriver};
use furrow_core::session::{SessionState, run_gateway_server};
use furrow_core::watch::WatcherRegistry;
use furrow_core::zones::ZoneService;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("furrow_core=info".parse()?),
        )
        .init();

    info!("Starting Furrow Core");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        gateway_addr = %config.gateway_addr,
        ping_interval_secs = config.ping_interval.as_secs(),
        schedule_tick_secs = config.schedule_tick.as_secs(),
        "Configuration loaded"
    );

    info!("Connecting to database...");
    let store: Arc<dyn Store> = if config.database_url.starts_with("sqlite") {
        Arc::new(SqliteStore::connect(&config.database_url).await?)
    } else {
        Arc::new(PostgresStore::connect(&config.database_url).await?)
    };
    store.health_check_db().await?;
    info!("Database connection established, migrations applied");

    // Shared state: one registry + one correlation table for the process,
    // injected into every component that needs them.
    let registry = Arc::new(ConnectionRegistry::new());
    let table = Arc::new(CorrelationTable::new());
    let watchers = Arc::new(WatcherRegistry::new());
    let engine = Arc::new(CommandEngine::new(
        registry.clone(),
        table.clone(),
        config.auth_key.clone(),
    ));
    let zones = Arc::new(ZoneService::new(
        engine.clone(),
        store.clone(),
        config.command_timeout,
    ));

    let server = build_server(&config)?;
    let session_state = Arc::new(SessionState {
        registry: registry.clone(),
        engine: engine.clone(),
        watchers,
        store: store.clone(),
    });
    let server_handle = tokio::spawn(async move {
        if let Err(e) = run_gateway_server(server, session_state).await {
            error!("Gateway server error: {}", e);
        }
    });

    let prober = Arc::new(LivenessProber::new(
        engine.clone(),
        store.clone(),
        ProberConfig {
            ping_interval: config.ping_interval,
            ping_grace: config.ping_grace,
            peripheral_timeout: config.peripheral_timeout,
            ..Default::default()
        },
    ));
    let prober_shutdown = prober.shutdown_handle();
    let prober_task = {
        let prober = prober.clone();
        tokio::spawn(async move { prober.run().await })
    };

    let sweep = Arc::new(CorrelationSweep::new(
        table.clone(),
        store.clone(),
        SweepConfig {
            interval: config.sweep_interval,
        },
    ));
    let sweep_shutdown = sweep.shutdown_handle();
    let sweep_task = {
        let sweep = sweep.clone();
        tokio::spawn(async move { sweep.run().await })
    };

    let driver = Arc::new(ScheduleDriver::new(
        zones.clone(),
        store.clone(),
        ScheduleConfig {
            tick_interval: config.schedule_tick,
        },
    ));
    let driver_shutdown = driver.shutdown_handle();
    let driver_task = {
        let driver = driver.clone();
        tokio::spawn(async move { driver.run().await })
    };

    info!("Furrow Core initialized successfully");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    prober_shutdown.notify_one();
    sweep_shutdown.notify_one();
    driver_shutdown.notify_one();
    let _ = prober_task.await;
    let _ = sweep_task.await;
    let _ = driver_task.await;
    server_handle.abort();

    info!("Shutdown complete");
    Ok(())
}

/// Build the gateway QUIC server from configured TLS material, falling back
/// to a self-signed development certificate when none is configured.
fn build_server(config: &Config) -> Result<FieldServer> {
    match (&config.tls_cert_path, &config.tls_key_path) {
        (Some(cert_path), Some(key_path)) => {
            let server_config = FieldServerConfig {
                bind_addr: config.gateway_addr,
                cert_pem: std::fs::read(cert_path)?,
                key_pem: std::fs::read(key_path)?,
                ..Default::default()
            };
            Ok(FieldServer::new(server_config)?)
        }
        (None, None) => {
            warn!("no TLS material configured, using a self-signed certificate");
            Ok(FieldServer::localhost(config.gateway_addr)?)
        }
        _ => anyhow::bail!("FURROW_TLS_CERT_PEM and FURROW_TLS_KEY_PEM must be set together"),
    }
}
