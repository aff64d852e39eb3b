// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scheduled-activation driver.
//!
//! Every tick resolves the current weekday and 5-minute bucket, asserts ON
//! for every slot whose window covers the bucket, and asserts OFF for every
//! slot whose window ends exactly at it. Re-asserting ON each tick while
//! the window is open is intentional: a slot that should have started
//! earlier and is still within its duration is treated identically to one
//! starting now, and the transition transaction keeps run records from ever
//! overlapping. Zones within a slot are driven sequentially, and a zone
//! whose ack fails is skipped without aborting the pass.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Timelike, Utc};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::persistence::{RunSource, SlotRecord, Store};
use crate::zones::ZoneService;

/// Width of one schedule bucket in minutes.
pub const BUCKET_MINUTES: u32 = 5;

/// Configuration for the schedule driver.
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    /// How often a tick runs. One bucket width by default.
    pub tick_interval: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(300),
        }
    }
}

/// Outcome counts for one schedule tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    /// Zones asserted ON this tick.
    pub zones_on: usize,
    /// Zones asserted OFF this tick.
    pub zones_off: usize,
    /// Zone assertions that failed (skipped, state untouched).
    pub failures: usize,
}

/// Periodic driver that applies schedule slots through the zone service.
pub struct ScheduleDriver {
    zones: Arc<ZoneService>,
    store: Arc<dyn Store>,
    config: ScheduleConfig,
    shutdown: Arc<Notify>,
}

impl ScheduleDriver {
    /// Create a new driver.
    pub fn new(zones: Arc<ZoneService>, store: Arc<dyn Store>, config: ScheduleConfig) -> Self {
        Self {
            zones,
            store,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the tick loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            tick_secs = self.config.tick_interval.as_secs(),
            "schedule driver started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("schedule driver received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.tick_interval) => {
                    match self.run_tick().await {
                        Ok(summary) => debug!(?summary, "schedule tick complete"),
                        Err(e) => error!(error = %e, "schedule tick failed"),
                    }
                }
            }
        }

        info!("schedule driver stopped");
    }

    /// Run one tick at the current time.
    pub async fn run_tick(&self) -> Result<TickSummary, StoreError> {
        self.run_tick_at(Utc::now()).await
    }

    /// Run one tick as of `now`. Split out so tests can pin the clock.
    pub async fn run_tick_at(&self, now: DateTime<Utc>) -> Result<TickSummary, StoreError> {
        let dow = now.weekday().num_days_from_sunday() as i32;
        let bucket = ((now.hour() * 60 + now.minute()) / BUCKET_MINUTES) as i32;
        debug!(dow, bucket, "schedule tick");

        let mut summary = TickSummary::default();

        let on_slots = self.store.slots_on(dow, bucket).await?;
        for slot in &on_slots {
            self.drive_slot(slot, true, &mut summary).await;
        }

        let off_slots = self.store.slots_off(dow, bucket).await?;
        for slot in &off_slots {
            self.drive_slot(slot, false, &mut summary).await;
        }

        Ok(summary)
    }

    /// Drive every zone of one slot sequentially; a zone is only counted
    /// once its ack came back and the transition is persisted.
    async fn drive_slot(&self, slot: &SlotRecord, on: bool, summary: &mut TickSummary) {
        for zone in 1..=4u8 {
            if slot.zone_mask & (1 << (zone - 1)) == 0 {
                continue;
            }
            match self
                .zones
                .set_zone_state_from(
                    &slot.device_id,
                    zone,
                    on,
                    RunSource::Schedule,
                    Some(&slot.schedule_id),
                )
                .await
            {
                Ok(_) => {
                    if on {
                        summary.zones_on += 1;
                    } else {
                        summary.zones_off += 1;
                    }
                }
                Err(e) => {
                    warn!(
                        device_id = %slot.device_id,
                        zone,
                        on,
                        code = e.error_code(),
                        "schedule assertion failed, zone skipped"
                    );
                    summary.failures += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_bucket_math() {
        // 08:35 UTC on a Wednesday
        let now = Utc.with_ymd_and_hms(2025, 6, 4, 8, 35, 0).unwrap();
        assert_eq!(now.weekday().num_days_from_sunday(), 3);
        assert_eq!((now.hour() * 60 + now.minute()) / BUCKET_MINUTES, 103);

        // midnight is bucket 0, 23:55 is the last bucket of the day
        let midnight = Utc.with_ymd_and_hms(2025, 6, 4, 0, 0, 0).unwrap();
        assert_eq!((midnight.hour() * 60 + midnight.minute()) / BUCKET_MINUTES, 0);
        let last = Utc.with_ymd_and_hms(2025, 6, 4, 23, 55, 0).unwrap();
        assert_eq!((last.hour() * 60 + last.minute()) / BUCKET_MINUTES, 287);
    }
}
