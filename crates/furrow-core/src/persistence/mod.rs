//! Persistence interfaces and backends for furrow-core.
//!
//! This module defines the durable store abstraction and its PostgreSQL and
//! SQLite implementations. Availability flags are mutated only through the
//! reconciliation paths (prober, sweep, session registration), and compound
//! updates (offline cascade, zone transition + run history) run inside one
//! transaction so a crash mid-update never leaves an open run with no
//! matching state or vice versa.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresStore;
pub use self::sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Persisted availability record for a gateway.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct GatewayRecord {
    /// Stable gateway identifier (survives reconnects).
    pub gateway_id: String,
    /// Display name chosen at claim time.
    pub name: String,
    /// Last reconciled reachability.
    pub online: bool,
    /// When the last liveness reconciliation touched this gateway.
    pub last_ping_at: Option<DateTime<Utc>>,
}

/// Persisted record for a peripheral.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeviceRecord {
    /// Stable device identifier.
    pub device_id: String,
    /// The gateway this peripheral is reachable through.
    pub gateway_id: String,
    /// Display name.
    pub name: String,
    /// Device kind (e.g. "sprinkler").
    pub kind: String,
    /// Local network name on the gateway's LAN; peripherals without one are
    /// never pinged.
    pub local_name: Option<String>,
    /// Last reconciled reachability.
    pub online: bool,
    /// When the peripheral last confirmed a ping or command.
    pub last_seen_at: Option<DateTime<Utc>>,
}

/// Persisted zone flags for a peripheral (four independently actuatable
/// output channels).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ZoneStateRecord {
    /// The device these flags belong to.
    pub device_id: String,
    /// Zone 1 engaged.
    pub zone1: bool,
    /// Zone 2 engaged.
    pub zone2: bool,
    /// Zone 3 engaged.
    pub zone3: bool,
    /// Zone 4 engaged.
    pub zone4: bool,
}

impl ZoneStateRecord {
    /// Read one zone flag by number (1-4).
    pub fn zone(&self, zone: u8) -> bool {
        match zone {
            1 => self.zone1,
            2 => self.zone2,
            3 => self.zone3,
            4 => self.zone4,
            _ => false,
        }
    }
}

/// One durable run-history row: the interval during which a zone set was
/// actively engaged. `ended_at` is NULL while the run is open.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RunRecord {
    /// Database primary key.
    pub id: i64,
    /// The device that ran.
    pub device_id: String,
    /// Bitmask of engaged zones (bit 0 = zone 1).
    pub zone_mask: i32,
    /// When the run opened.
    pub started_at: DateTime<Utc>,
    /// When the run closed (NULL while open).
    pub ended_at: Option<DateTime<Utc>>,
    /// What initiated the run ("manual" or "schedule").
    pub source: String,
    /// The schedule that initiated the run, if any.
    pub schedule_id: Option<String>,
}

/// One schedule slot joined with its schedule and device, as consumed by
/// the schedule driver.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SlotRecord {
    /// Slot primary key.
    pub slot_id: i64,
    /// Owning schedule.
    pub schedule_id: String,
    /// Target device.
    pub device_id: String,
    /// Bitmask of active weekdays (bit 0 = Sunday).
    pub days_mask: i32,
    /// First active 5-minute bucket of the day.
    pub start_bucket: i32,
    /// Window length in 5-minute buckets.
    pub bucket_count: i32,
    /// Bitmask of zones this slot drives (bit 0 = zone 1).
    pub zone_mask: i32,
}

/// What initiated a zone transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunSource {
    /// A direct caller (HTTP handler, operator).
    Manual,
    /// The schedule driver.
    Schedule,
}

impl RunSource {
    /// The persisted representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunSource::Manual => "manual",
            RunSource::Schedule => "schedule",
        }
    }
}

/// Durable store interface used by the core.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a gateway or update its display name.
    async fn upsert_gateway(&self, gateway_id: &str, name: &str) -> Result<(), StoreError>;

    /// Look up one gateway.
    async fn find_gateway(&self, gateway_id: &str) -> Result<Option<GatewayRecord>, StoreError>;

    /// All known gateways.
    async fn list_gateways(&self) -> Result<Vec<GatewayRecord>, StoreError>;

    /// Mark a gateway reachable and stamp the reconciliation time.
    async fn set_gateway_online(
        &self,
        gateway_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Mark a gateway unreachable and, in the same transaction, mark every
    /// peripheral attached to it offline (a peripheral cannot be more
    /// online than its gateway).
    async fn mark_gateway_offline(
        &self,
        gateway_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Insert a peripheral or update its mutable fields.
    async fn upsert_device(&self, device: &DeviceRecord) -> Result<(), StoreError>;

    /// Look up one peripheral.
    async fn find_device(&self, device_id: &str) -> Result<Option<DeviceRecord>, StoreError>;

    /// Peripherals of one gateway that declare a reachable local name.
    async fn list_peripherals_for(
        &self,
        gateway_id: &str,
    ) -> Result<Vec<DeviceRecord>, StoreError>;

    /// Reconcile one peripheral's availability. `last_seen_at` is only
    /// advanced when the peripheral is confirmed online.
    async fn set_device_online(
        &self,
        device_id: &str,
        online: bool,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Current zone flags for a device, if any were ever recorded.
    async fn zone_state(&self, device_id: &str) -> Result<Option<ZoneStateRecord>, StoreError>;

    /// Apply one confirmed zone transition in a single transaction: close
    /// every open run overlapping `zone_mask`, open a new run when turning
    /// on, and flip the persisted zone flags covered by the mask.
    async fn record_zone_transition(
        &self,
        device_id: &str,
        zone_mask: i32,
        on: bool,
        at: DateTime<Utc>,
        source: RunSource,
        schedule_id: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Runs for a device that are currently open (`ended_at` NULL).
    async fn open_runs(&self, device_id: &str) -> Result<Vec<RunRecord>, StoreError>;

    /// Recent run history for a device, newest first.
    async fn run_history(&self, device_id: &str, limit: i64) -> Result<Vec<RunRecord>, StoreError>;

    /// Insert a schedule (enabled flag updatable through the same call).
    async fn upsert_schedule(
        &self,
        schedule_id: &str,
        device_id: &str,
        enabled: bool,
    ) -> Result<(), StoreError>;

    /// Add a slot to a schedule. Returns the slot id.
    async fn insert_slot(
        &self,
        schedule_id: &str,
        days_mask: i32,
        start_bucket: i32,
        bucket_count: i32,
        zone_mask: i32,
    ) -> Result<i64, StoreError>;

    /// Enabled slots whose window covers `bucket` on weekday `dow`
    /// (bit `dow` of the days mask set, start <= bucket < start + count).
    async fn slots_on(&self, dow: i32, bucket: i32) -> Result<Vec<SlotRecord>, StoreError>;

    /// Enabled slots whose window ends exactly at `bucket` on weekday `dow`.
    async fn slots_off(&self, dow: i32, bucket: i32) -> Result<Vec<SlotRecord>, StoreError>;

    /// Cheap connectivity check.
    async fn health_check_db(&self) -> Result<bool, StoreError>;
}
