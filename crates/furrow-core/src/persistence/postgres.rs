//! PostgreSQL-backed store implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::error::StoreError;

use super::{
    DeviceRecord, GatewayRecord, RunRecord, RunSource, SlotRecord, Store, ZoneStateRecord,
};

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a store from an existing pool. Migrations are the caller's
    /// responsibility (see [`crate::migrations::run_postgres`]).
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Connect to a PostgreSQL URL and apply all migrations.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await
            .map_err(|e| StoreError::db("connect", e))?;

        crate::migrations::run_postgres(&pool).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn upsert_gateway(&self, gateway_id: &str, name: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO gateways (gateway_id, name) VALUES ($1, $2)
            ON CONFLICT (gateway_id) DO UPDATE SET name = EXCLUDED.name
            "#,
        )
        .bind(gateway_id)
        .bind(name)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::db("upsert_gateway", e))?;
        Ok(())
    }

    async fn find_gateway(&self, gateway_id: &str) -> Result<Option<GatewayRecord>, StoreError> {
        sqlx::query_as::<_, GatewayRecord>(
            "SELECT gateway_id, name, online, last_ping_at FROM gateways WHERE gateway_id = $1",
        )
        .bind(gateway_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::db("find_gateway", e))
    }

    async fn list_gateways(&self) -> Result<Vec<GatewayRecord>, StoreError> {
        sqlx::query_as::<_, GatewayRecord>(
            "SELECT gateway_id, name, online, last_ping_at FROM gateways ORDER BY gateway_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::db("list_gateways", e))
    }

    async fn set_gateway_online(
        &self,
        gateway_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE gateways SET online = TRUE, last_ping_at = $1 WHERE gateway_id = $2")
            .bind(at)
            .bind(gateway_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::db("set_gateway_online", e))?;
        Ok(())
    }

    async fn mark_gateway_offline(
        &self,
        gateway_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::db("mark_gateway_offline", e))?;

        sqlx::query("UPDATE gateways SET online = FALSE, last_ping_at = $1 WHERE gateway_id = $2")
            .bind(at)
            .bind(gateway_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::db("mark_gateway_offline", e))?;

        sqlx::query("UPDATE devices SET online = FALSE WHERE gateway_id = $1")
            .bind(gateway_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::db("mark_gateway_offline", e))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::db("mark_gateway_offline", e))?;
        Ok(())
    }

    async fn upsert_device(&self, device: &DeviceRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO devices (device_id, gateway_id, name, kind, local_name, online, last_seen_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (device_id) DO UPDATE SET
                gateway_id = EXCLUDED.gateway_id,
                name = EXCLUDED.name,
                kind = EXCLUDED.kind,
                local_name = EXCLUDED.local_name
            "#,
        )
        .bind(&device.device_id)
        .bind(&device.gateway_id)
        .bind(&device.name)
        .bind(&device.kind)
        .bind(&device.local_name)
        .bind(device.online)
        .bind(device.last_seen_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::db("upsert_device", e))?;
        Ok(())
    }

    async fn find_device(&self, device_id: &str) -> Result<Option<DeviceRecord>, StoreError> {
        sqlx::query_as::<_, DeviceRecord>(
            r#"
            SELECT device_id, gateway_id, name, kind, local_name, online, last_seen_at
            FROM devices WHERE device_id = $1
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::db("find_device", e))
    }

    async fn list_peripherals_for(
        &self,
        gateway_id: &str,
    ) -> Result<Vec<DeviceRecord>, StoreError> {
        sqlx::query_as::<_, DeviceRecord>(
            r#"
            SELECT device_id, gateway_id, name, kind, local_name, online, last_seen_at
            FROM devices
            WHERE gateway_id = $1 AND local_name IS NOT NULL AND local_name <> ''
            ORDER BY device_id
            "#,
        )
        .bind(gateway_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::db("list_peripherals_for", e))
    }

    async fn set_device_online(
        &self,
        device_id: &str,
        online: bool,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        // last_seen_at is the last *confirmed* contact, so it only advances
        // on a successful reconciliation.
        let query = if online {
            sqlx::query("UPDATE devices SET online = TRUE, last_seen_at = $1 WHERE device_id = $2")
                .bind(at)
                .bind(device_id)
        } else {
            sqlx::query("UPDATE devices SET online = FALSE WHERE device_id = $1").bind(device_id)
        };
        query
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::db("set_device_online", e))?;
        Ok(())
    }

    async fn zone_state(&self, device_id: &str) -> Result<Option<ZoneStateRecord>, StoreError> {
        sqlx::query_as::<_, ZoneStateRecord>(
            "SELECT device_id, zone1, zone2, zone3, zone4 FROM zone_states WHERE device_id = $1",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::db("zone_state", e))
    }

    async fn record_zone_transition(
        &self,
        device_id: &str,
        zone_mask: i32,
        on: bool,
        at: DateTime<Utc>,
        source: RunSource,
        schedule_id: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::db("record_zone_transition", e))?;

        // Close every open run overlapping the commanded zones. This also
        // covers the restart case: an ON for already-running zones closes
        // the previous run before opening the next one.
        sqlx::query(
            r#"
            UPDATE run_history SET ended_at = $1
            WHERE device_id = $2 AND ended_at IS NULL AND (zone_mask & $3) <> 0
            "#,
        )
        .bind(at)
        .bind(device_id)
        .bind(zone_mask)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::db("record_zone_transition", e))?;

        if on {
            sqlx::query(
                r#"
                INSERT INTO run_history (device_id, zone_mask, started_at, source, schedule_id)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(device_id)
            .bind(zone_mask)
            .bind(at)
            .bind(source.as_str())
            .bind(schedule_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::db("record_zone_transition", e))?;
        }

        sqlx::query(
            "INSERT INTO zone_states (device_id) VALUES ($1) ON CONFLICT (device_id) DO NOTHING",
        )
        .bind(device_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::db("record_zone_transition", e))?;

        sqlx::query(
            r#"
            UPDATE zone_states SET
                zone1 = CASE WHEN ($2 & 1) <> 0 THEN $3 ELSE zone1 END,
                zone2 = CASE WHEN ($2 & 2) <> 0 THEN $3 ELSE zone2 END,
                zone3 = CASE WHEN ($2 & 4) <> 0 THEN $3 ELSE zone3 END,
                zone4 = CASE WHEN ($2 & 8) <> 0 THEN $3 ELSE zone4 END
            WHERE device_id = $1
            "#,
        )
        .bind(device_id)
        .bind(zone_mask)
        .bind(on)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::db("record_zone_transition", e))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::db("record_zone_transition", e))?;
        Ok(())
    }

    async fn open_runs(&self, device_id: &str) -> Result<Vec<RunRecord>, StoreError> {
        sqlx::query_as::<_, RunRecord>(
            r#"
            SELECT id, device_id, zone_mask, started_at, ended_at, source, schedule_id
            FROM run_history WHERE device_id = $1 AND ended_at IS NULL
            ORDER BY started_at
            "#,
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::db("open_runs", e))
    }

    async fn run_history(
        &self,
        device_id: &str,
        limit: i64,
    ) -> Result<Vec<RunRecord>, StoreError> {
        sqlx::query_as::<_, RunRecord>(
            r#"
            SELECT id, device_id, zone_mask, started_at, ended_at, source, schedule_id
            FROM run_history WHERE device_id = $1
            ORDER BY started_at DESC LIMIT $2
            "#,
        )
        .bind(device_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::db("run_history", e))
    }

    async fn upsert_schedule(
        &self,
        schedule_id: &str,
        device_id: &str,
        enabled: bool,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO schedules (id, device_id, enabled) VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET enabled = EXCLUDED.enabled
            "#,
        )
        .bind(schedule_id)
        .bind(device_id)
        .bind(enabled)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::db("upsert_schedule", e))?;
        Ok(())
    }

    async fn insert_slot(
        &self,
        schedule_id: &str,
        days_mask: i32,
        start_bucket: i32,
        bucket_count: i32,
        zone_mask: i32,
    ) -> Result<i64, StoreError> {
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO schedule_slots (schedule_id, days_mask, start_bucket, bucket_count, zone_mask)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(schedule_id)
        .bind(days_mask)
        .bind(start_bucket)
        .bind(bucket_count)
        .bind(zone_mask)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::db("insert_slot", e))?;
        Ok(id)
    }

    async fn slots_on(&self, dow: i32, bucket: i32) -> Result<Vec<SlotRecord>, StoreError> {
        sqlx::query_as::<_, SlotRecord>(
            r#"
            SELECT ss.id AS slot_id, ss.schedule_id, s.device_id,
                   ss.days_mask, ss.start_bucket, ss.bucket_count, ss.zone_mask
            FROM schedule_slots ss
            JOIN schedules s ON s.id = ss.schedule_id
            WHERE s.enabled = TRUE
              AND ((ss.days_mask >> $1) & 1) = 1
              AND ss.start_bucket <= $2
              AND ss.start_bucket + ss.bucket_count > $2
            "#,
        )
        .bind(dow)
        .bind(bucket)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::db("slots_on", e))
    }

    async fn slots_off(&self, dow: i32, bucket: i32) -> Result<Vec<SlotRecord>, StoreError> {
        sqlx::query_as::<_, SlotRecord>(
            r#"
            SELECT ss.id AS slot_id, ss.schedule_id, s.device_id,
                   ss.days_mask, ss.start_bucket, ss.bucket_count, ss.zone_mask
            FROM schedule_slots ss
            JOIN schedules s ON s.id = ss.schedule_id
            WHERE s.enabled = TRUE
              AND ((ss.days_mask >> $1) & 1) = 1
              AND ss.start_bucket + ss.bucket_count = $2
            "#,
        )
        .bind(dow)
        .bind(bucket)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::db("slots_off", e))
    }

    async fn health_check_db(&self) -> Result<bool, StoreError> {
        let row: (i32,) = sqlx::query_as("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::db("health_check", e))?;
        Ok(row.0 == 1)
    }
}
