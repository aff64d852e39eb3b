// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Zone command execution with acknowledgment.
//!
//! A zone command only mutates persisted state after the peripheral
//! confirmed it. On UNREACHABLE/TIMEOUT/REJECTED nothing is written and the
//! last persisted state remains authoritative; the caller gets a distinct
//! error kind so "device offline" and "device rejected the command" stay
//! distinguishable.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::engine::CommandEngine;
use crate::error::CommandError;
use crate::persistence::{RunSource, Store};

/// Transient confirmation returned to a zone-command caller. Never
/// persisted; it carries what the caller needs to report the new state.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ZoneAck {
    /// The device that confirmed.
    pub device_id: String,
    /// The actuated zone (1-4).
    pub zone: u8,
    /// The confirmed state.
    pub on: bool,
}

/// Executes acknowledged zone commands against peripherals.
pub struct ZoneService {
    engine: Arc<CommandEngine>,
    store: Arc<dyn Store>,
    command_timeout: Duration,
}

impl ZoneService {
    /// Create a zone service. `command_timeout` is the ack deadline, on the
    /// order of seconds and much shorter than the liveness grace window.
    pub fn new(engine: Arc<CommandEngine>, store: Arc<dyn Store>, command_timeout: Duration) -> Self {
        Self {
            engine,
            store,
            command_timeout,
        }
    }

    /// Actuate one zone on a device as a direct (manual) caller.
    pub async fn set_zone_state(
        &self,
        device_id: &str,
        zone: u8,
        on: bool,
    ) -> Result<ZoneAck, CommandError> {
        self.set_zone_state_from(device_id, zone, on, RunSource::Manual, None)
            .await
    }

    /// Actuate one zone, attributing the resulting run record to `source`.
    ///
    /// Resolves the device's gateway and local name, sends the command,
    /// suspends for the ack, and only then persists the zone flags and
    /// run-history transition in one transaction.
    pub async fn set_zone_state_from(
        &self,
        device_id: &str,
        zone: u8,
        on: bool,
        source: RunSource,
        schedule_id: Option<&str>,
    ) -> Result<ZoneAck, CommandError> {
        if !(1..=4).contains(&zone) {
            return Err(CommandError::InvalidZone { zone });
        }

        let device = self
            .store
            .find_device(device_id)
            .await?
            .ok_or_else(|| CommandError::DeviceNotFound {
                device_id: device_id.to_string(),
            })?;
        let local_name = device
            .local_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| CommandError::NotAddressable {
                device_id: device_id.to_string(),
            })?;

        if let Err(e) = self
            .engine
            .zone_command(
                &device.gateway_id,
                device_id,
                local_name,
                zone,
                on,
                self.command_timeout,
            )
            .await
        {
            warn!(
                device_id,
                zone,
                on,
                code = e.error_code(),
                "zone command not confirmed, state untouched"
            );
            return Err(e);
        }

        let zone_mask = 1i32 << (zone - 1);
        self.store
            .record_zone_transition(device_id, zone_mask, on, Utc::now(), source, schedule_id)
            .await?;

        info!(device_id, zone, on, source = source.as_str(), "zone state confirmed and persisted");
        Ok(ZoneAck {
            device_id: device_id.to_string(),
            zone,
            on,
        })
    }
}
