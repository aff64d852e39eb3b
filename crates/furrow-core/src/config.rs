// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::net::SocketAddr;
use std::time::Duration;

/// Furrow Core configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// QUIC server address gateways connect to
    pub gateway_addr: SocketAddr,
    /// Path to a TLS certificate chain in PEM format (self-signed when unset)
    pub tls_cert_path: Option<String>,
    /// Path to the TLS private key in PEM format
    pub tls_key_path: Option<String>,
    /// Auth key embedded in zone commands
    pub auth_key: String,
    /// Liveness probe cycle period
    pub ping_interval: Duration,
    /// Grace window for gateway ping replies within one cycle
    pub ping_grace: Duration,
    /// Deadline for a relayed peripheral ping reply
    pub peripheral_timeout: Duration,
    /// Deadline for a zone command acknowledgment
    pub command_timeout: Duration,
    /// Correlation-table expiry sweep period
    pub sweep_interval: Duration,
    /// Schedule driver tick period
    pub schedule_tick: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `FURROW_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `FURROW_GATEWAY_PORT`: QUIC port gateways connect to (default: 8081)
    /// - `FURROW_TLS_CERT_PEM` / `FURROW_TLS_KEY_PEM`: PEM file paths; a
    ///   self-signed development certificate is generated when unset
    /// - `FURROW_AUTH_KEY`: auth key carried in zone commands (default: 123456)
    /// - `FURROW_PING_INTERVAL_SECS`: liveness cycle period (default: 60)
    /// - `FURROW_PING_GRACE_SECS`: gateway reply grace window (default: 10)
    /// - `FURROW_PERIPHERAL_TIMEOUT_SECS`: peripheral ping deadline (default: 20)
    /// - `FURROW_COMMAND_TIMEOUT_SECS`: zone command deadline (default: 5)
    /// - `FURROW_SWEEP_INTERVAL_SECS`: correlation sweep period (default: 60)
    /// - `FURROW_SCHEDULE_TICK_SECS`: schedule tick period (default: 300)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("FURROW_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("FURROW_DATABASE_URL"))?;

        let gateway_port: u16 = std::env::var("FURROW_GATEWAY_PORT")
            .unwrap_or_else(|_| "8081".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("FURROW_GATEWAY_PORT", "must be a valid port number")
            })?;

        let auth_key =
            std::env::var("FURROW_AUTH_KEY").unwrap_or_else(|_| "123456".to_string());

        Ok(Self {
            database_url,
            gateway_addr: SocketAddr::from(([0, 0, 0, 0], gateway_port)),
            tls_cert_path: std::env::var("FURROW_TLS_CERT_PEM").ok(),
            tls_key_path: std::env::var("FURROW_TLS_KEY_PEM").ok(),
            auth_key,
            ping_interval: secs_var("FURROW_PING_INTERVAL_SECS", 60)?,
            ping_grace: secs_var("FURROW_PING_GRACE_SECS", 10)?,
            peripheral_timeout: secs_var("FURROW_PERIPHERAL_TIMEOUT_SECS", 20)?,
            command_timeout: secs_var("FURROW_COMMAND_TIMEOUT_SECS", 5)?,
            sweep_interval: secs_var("FURROW_SWEEP_INTERVAL_SECS", 60)?,
            schedule_tick: secs_var("FURROW_SCHEDULE_TICK_SECS", 300)?,
        })
    }
}

fn secs_var(name: &'static str, default: u64) -> Result<Duration, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => {
            let secs: u64 = raw
                .parse()
                .map_err(|_| ConfigError::Invalid(name, "must be a number of seconds"))?;
            if secs == 0 {
                return Err(ConfigError::Invalid(name, "must be greater than zero"));
            }
            Ok(Duration::from_secs(secs))
        }
        Err(_) => Ok(Duration::from_secs(default)),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
