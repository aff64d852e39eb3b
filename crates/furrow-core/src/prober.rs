// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Periodic liveness probing and the correlation expiry sweep.
//!
//! Each prober cycle resolves gateway reachability before peripheral
//! reachability: every known gateway is pinged in parallel, the cycle waits
//! out a bounded grace window (polling the outstanding count so the wait
//! ends early once all replies are in), and any gateway still outstanding
//! is marked offline together with every peripheral attached to it. Only
//! gateways that are flagged online in the store AND have a live connection
//! in the registry get their peripherals pinged; a peripheral is never
//! pinged over a gateway already known to be offline.
//!
//! The sweep is an independent, coarser timer that removes correlation
//! entries past their deadline and reconciles their subjects offline. It is
//! the backstop for replies that never arrive at all.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::correlation::{CorrelationTable, RequestKind, Resolution};
use crate::engine::CommandEngine;
use crate::error::StoreError;
use crate::persistence::Store;

/// Configuration for the liveness prober.
///
/// The grace window bounds how long one cycle waits for gateway replies;
/// the peripheral timeout is intentionally much longer (a gateway relays
/// the ping over its LAN and the peripheral may be slow to wake), and the
/// zone-command timeout used elsewhere is much shorter than either.
#[derive(Debug, Clone)]
pub struct ProberConfig {
    /// How often a full cycle runs.
    pub ping_interval: Duration,
    /// Grace window for gateway replies within one cycle.
    pub ping_grace: Duration,
    /// How often the grace wait re-checks the outstanding count.
    pub grace_poll_interval: Duration,
    /// Deadline for each relayed peripheral ping.
    pub peripheral_timeout: Duration,
}

impl Default for ProberConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(60),
            ping_grace: Duration::from_secs(10),
            grace_poll_interval: Duration::from_millis(250),
            peripheral_timeout: Duration::from_secs(20),
        }
    }
}

/// Outcome counts for one prober cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleSummary {
    /// Gateways confirmed reachable this cycle.
    pub gateways_online: usize,
    /// Gateways marked offline this cycle (cascading to their peripherals).
    pub gateways_offline: usize,
    /// Peripheral pings dispatched this cycle.
    pub peripherals_pinged: usize,
}

/// Periodic worker that probes every known gateway and, for reachable ones,
/// their peripherals, reconciling non-responses into the store.
pub struct LivenessProber {
    engine: Arc<CommandEngine>,
    store: Arc<dyn Store>,
    config: ProberConfig,
    shutdown: Arc<Notify>,
}

impl LivenessProber {
    /// Create a new prober over the shared engine and store.
    pub fn new(engine: Arc<CommandEngine>, store: Arc<dyn Store>, config: ProberConfig) -> Self {
        Self {
            engine,
            store,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the prober loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            ping_interval_secs = self.config.ping_interval.as_secs(),
            ping_grace_secs = self.config.ping_grace.as_secs(),
            peripheral_timeout_secs = self.config.peripheral_timeout.as_secs(),
            "liveness prober started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("liveness prober received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.ping_interval) => {
                    match self.run_cycle().await {
                        Ok(summary) => debug!(?summary, "liveness cycle complete"),
                        Err(e) => error!(error = %e, "liveness cycle failed"),
                    }
                }
            }
        }

        info!("liveness prober stopped");
    }

    /// Run one full probe cycle.
    pub async fn run_cycle(&self) -> Result<CycleSummary, StoreError> {
        let mut summary = CycleSummary::default();
        let gateways = self.store.list_gateways().await?;
        if gateways.is_empty() {
            return Ok(summary);
        }

        // Step 1: fire one ping per gateway in parallel. An UNREACHABLE
        // begin (no registered connection) is an immediate offline verdict
        // and creates no correlation entry.
        let mut waits = Vec::new();
        let mut offline = Vec::new();
        for gw in &gateways {
            match self
                .engine
                .begin_gateway_ping(&gw.gateway_id, self.config.ping_grace)
            {
                Ok((request_id, rx)) => waits.push((gw.gateway_id.clone(), request_id, rx)),
                Err(_) => offline.push(gw.gateway_id.clone()),
            }
        }

        // Step 2: bounded grace wait. Poll the outstanding count so the
        // wait ends as soon as every reply is in, but never exceeds the
        // window.
        let ids: Vec<String> = waits.iter().map(|(_, id, _)| id.clone()).collect();
        let deadline = Instant::now() + self.config.ping_grace;
        while self.engine.table().outstanding(&ids) > 0 && Instant::now() < deadline {
            tokio::time::sleep(self.config.grace_poll_interval).await;
        }

        // Step 3: anything still outstanding is offline. Taking the entry
        // here is the resolution; a reply racing in later is stale.
        let mut online = Vec::new();
        for (gateway_id, request_id, mut rx) in waits {
            if self.engine.table().take(&request_id).is_some() {
                offline.push(gateway_id);
            } else {
                match rx.try_recv() {
                    Ok(Resolution::Reply { success: true }) => online.push(gateway_id),
                    _ => offline.push(gateway_id),
                }
            }
        }

        let now = Utc::now();
        for gateway_id in &offline {
            self.reconcile_gateway_offline(gateway_id).await;
            summary.gateways_offline += 1;
        }
        for gateway_id in &online {
            if let Err(e) = self.store.set_gateway_online(gateway_id, now).await {
                error!(%gateway_id, error = %e, "failed to flag gateway online");
            }
            summary.gateways_online += 1;
        }

        // Step 4: peripherals, but only over gateways that are flagged
        // online in the store AND still have a live connection. A stale
        // online flag with no socket must not trigger pings.
        for gateway_id in &online {
            let connected = self
                .engine
                .registry()
                .lookup(gateway_id)
                .map(|h| h.is_open())
                .unwrap_or(false);
            let flagged_online = matches!(
                self.store.find_gateway(gateway_id).await?,
                Some(gw) if gw.online
            );
            if !connected || !flagged_online {
                debug!(%gateway_id, connected, flagged_online, "skipping peripheral pings");
                continue;
            }

            for device in self.store.list_peripherals_for(gateway_id).await? {
                let Some(local_name) = device.local_name.clone() else {
                    continue;
                };
                summary.peripherals_pinged += 1;

                // Each peripheral ping gets its own correlation entry and
                // deadline; the waiter reconciles its outcome without
                // holding up the cycle.
                let engine = self.engine.clone();
                let store = self.store.clone();
                let gateway_id = gateway_id.clone();
                let timeout = self.config.peripheral_timeout;
                tokio::spawn(async move {
                    let outcome = engine
                        .ping_peripheral(&gateway_id, &device.device_id, &local_name, timeout)
                        .await;
                    let online = match outcome {
                        Ok(()) => true,
                        Err(e) => {
                            debug!(
                                device_id = %device.device_id,
                                code = e.error_code(),
                                "peripheral ping failed"
                            );
                            false
                        }
                    };
                    if let Err(e) = store
                        .set_device_online(&device.device_id, online, Utc::now())
                        .await
                    {
                        error!(device_id = %device.device_id, error = %e, "failed to reconcile peripheral");
                    }
                });
            }
        }

        Ok(summary)
    }

    /// Mark a gateway offline, cascade its peripherals offline, and purge
    /// its pending correlation entries so nothing leaks.
    async fn reconcile_gateway_offline(&self, gateway_id: &str) {
        warn!(gateway_id, "gateway unresponsive, marking offline with peripherals");
        if let Err(e) = self.store.mark_gateway_offline(gateway_id, Utc::now()).await {
            error!(gateway_id, error = %e, "failed to mark gateway offline");
        }
        let purged = self.engine.table().take_for_gateway(gateway_id);
        if !purged.is_empty() {
            debug!(gateway_id, count = purged.len(), "purged pending requests");
        }
        // dropping the entries resolves any waiters as unreachable
    }
}

/// Configuration for the expiry sweep.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// How often the sweep scans the table.
    pub interval: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

/// Background worker that removes correlation entries past their deadline
/// and reconciles their subjects offline.
pub struct CorrelationSweep {
    table: Arc<CorrelationTable>,
    store: Arc<dyn Store>,
    config: SweepConfig,
    shutdown: Arc<Notify>,
}

impl CorrelationSweep {
    /// Create a new sweep over the shared table and store.
    pub fn new(table: Arc<CorrelationTable>, store: Arc<dyn Store>, config: SweepConfig) -> Self {
        Self {
            table,
            store,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the sweep loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "correlation sweep started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("correlation sweep received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.interval) => {
                    let swept = self.run_sweep().await;
                    if swept > 0 {
                        info!(swept, "expired pending requests swept");
                    }
                }
            }
        }

        info!("correlation sweep stopped");
    }

    /// Remove every expired entry, resolve its waiter, and reconcile the
    /// associated gateway/peripheral offline. Returns how many entries were
    /// swept.
    pub async fn run_sweep(&self) -> usize {
        let expired = self.table.take_expired(Instant::now());
        let count = expired.len();
        let now = Utc::now();

        for (request_id, pending) in expired {
            let kind = pending.kind;
            let subject = pending.subject.clone();
            pending.resolve(Resolution::Expired);
            debug!(%request_id, ?kind, "pending request expired");

            match kind {
                RequestKind::GatewayPing => {
                    // Gateway silence cascades: peripherals offline in the
                    // same pass and their pending entries cleaned up too.
                    if let Err(e) = self
                        .store
                        .mark_gateway_offline(&subject.gateway_id, now)
                        .await
                    {
                        error!(gateway_id = %subject.gateway_id, error = %e, "sweep failed to mark gateway offline");
                    }
                    for (_, cascaded) in self.table.take_for_gateway(&subject.gateway_id) {
                        cascaded.resolve(Resolution::Expired);
                    }
                }
                RequestKind::PeripheralPing => {
                    if let Some(device_id) = &subject.device_id {
                        if let Err(e) = self.store.set_device_online(device_id, false, now).await {
                            error!(%device_id, error = %e, "sweep failed to mark peripheral offline");
                        }
                    }
                }
                RequestKind::ZoneCommand => {
                    // Persisted zone state stays untouched on a lost ack;
                    // the caller already saw TIMEOUT.
                }
            }
        }

        count
    }
}
