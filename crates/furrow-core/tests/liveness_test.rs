// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Liveness prober and sweep behavior against a SQLite store, using
//! in-process gateway handles instead of real sockets.

use std::sync::Arc;
use std::time::Duration;

use furrow_core::correlation::{CorrelationTable, RequestKind, RequestSubject};
use furrow_core::engine::CommandEngine;
use furrow_core::persistence::{DeviceRecord, SqliteStore, Store};
use furrow_core::prober::{CorrelationSweep, LivenessProber, ProberConfig, SweepConfig};
use furrow_core::registry::{ConnectionRegistry, GatewayHandle};
use furrow_protocol::WireMessage;
use tokio::sync::mpsc;

struct Harness {
    registry: Arc<ConnectionRegistry>,
    table: Arc<CorrelationTable>,
    engine: Arc<CommandEngine>,
    store: Arc<SqliteStore>,
    _dir: tempfile::TempDir,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(
        SqliteStore::from_path(dir.path().join("liveness.db"))
            .await
            .unwrap(),
    );
    let registry = Arc::new(ConnectionRegistry::new());
    let table = Arc::new(CorrelationTable::new());
    let engine = Arc::new(CommandEngine::new(
        registry.clone(),
        table.clone(),
        "123456".to_string(),
    ));
    Harness {
        registry,
        table,
        engine,
        store,
        _dir: dir,
    }
}

fn prober_config() -> ProberConfig {
    ProberConfig {
        ping_interval: Duration::from_secs(60),
        ping_grace: Duration::from_millis(200),
        grace_poll_interval: Duration::from_millis(20),
        peripheral_timeout: Duration::from_millis(300),
    }
}

async fn seed_gateway(store: &SqliteStore, gateway_id: &str) {
    store.upsert_gateway(gateway_id, "Test gateway").await.unwrap();
}

async fn seed_peripheral(store: &SqliteStore, gateway_id: &str, device_id: &str, local: &str) {
    store
        .upsert_device(&DeviceRecord {
            device_id: device_id.to_string(),
            gateway_id: gateway_id.to_string(),
            name: device_id.to_string(),
            kind: "sprinkler".to_string(),
            local_name: Some(local.to_string()),
            online: false,
            last_seen_at: None,
        })
        .await
        .unwrap();
}

/// Connect a simulated gateway that answers every gateway ping and, when
/// `peripherals_reply` is set, every peripheral ping too.
fn connect_responder(
    registry: &ConnectionRegistry,
    engine: Arc<CommandEngine>,
    gateway_id: &str,
    peripherals_reply: bool,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<WireMessage>();
    registry.register(GatewayHandle::new(gateway_id, tx));
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match msg {
                WireMessage::PingGateway { request_id } => {
                    engine.resolve_reply(&WireMessage::PongGateway {
                        request_id,
                        online: true,
                    });
                }
                WireMessage::PingPeripheral { request_id, .. } if peripherals_reply => {
                    engine.resolve_reply(&WireMessage::PongPeripheral {
                        request_id,
                        online: true,
                    });
                }
                _ => {}
            }
        }
    });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disconnected_gateway_goes_offline_without_entry() {
    let h = harness().await;
    seed_gateway(&h.store, "hb-1").await;
    h.store
        .set_gateway_online("hb-1", chrono::Utc::now())
        .await
        .unwrap();

    let prober = LivenessProber::new(h.engine.clone(), h.store.clone(), prober_config());
    let summary = prober.run_cycle().await.unwrap();

    assert_eq!(summary.gateways_offline, 1);
    assert_eq!(summary.gateways_online, 0);
    assert!(!h.store.find_gateway("hb-1").await.unwrap().unwrap().online);
    assert!(h.table.is_empty(), "unreachable gateways create no entries");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_responding_gateway_confirmed_online() {
    let h = harness().await;
    seed_gateway(&h.store, "hb-1").await;
    connect_responder(&h.registry, h.engine.clone(), "hb-1", true);

    let prober = LivenessProber::new(h.engine.clone(), h.store.clone(), prober_config());
    let summary = prober.run_cycle().await.unwrap();

    assert_eq!(summary.gateways_online, 1);
    let gw = h.store.find_gateway("hb-1").await.unwrap().unwrap();
    assert!(gw.online);
    assert!(gw.last_ping_at.is_some());
}

/// Liveness cascade: the gateway times out on its ping while two of its
/// peripherals already have pending pings. After the cycle both peripherals
/// are offline and their pending entries are cleaned up, not leaked.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_gateway_timeout_cascades_to_peripherals() {
    let h = harness().await;
    seed_gateway(&h.store, "hb-1").await;
    seed_peripheral(&h.store, "hb-1", "p-1", "esp-1").await;
    seed_peripheral(&h.store, "hb-1", "p-2", "esp-2").await;
    let now = chrono::Utc::now();
    h.store.set_gateway_online("hb-1", now).await.unwrap();
    h.store.set_device_online("p-1", true, now).await.unwrap();
    h.store.set_device_online("p-2", true, now).await.unwrap();

    // a connection exists but the gateway never answers anything
    let (tx, _rx) = mpsc::unbounded_channel::<WireMessage>();
    h.registry.register(GatewayHandle::new("hb-1", tx));

    // peripheral pings from earlier traffic are still outstanding
    let (_id1, _rx1) = h.table.insert(
        RequestKind::PeripheralPing,
        RequestSubject::peripheral("hb-1", "p-1", "esp-1"),
        Duration::from_secs(60),
    );
    let (_id2, _rx2) = h.table.insert(
        RequestKind::PeripheralPing,
        RequestSubject::peripheral("hb-1", "p-2", "esp-2"),
        Duration::from_secs(60),
    );

    let prober = LivenessProber::new(h.engine.clone(), h.store.clone(), prober_config());
    let summary = prober.run_cycle().await.unwrap();

    assert_eq!(summary.gateways_offline, 1);
    assert_eq!(summary.peripherals_pinged, 0, "no pings over a dead gateway");
    assert!(!h.store.find_gateway("hb-1").await.unwrap().unwrap().online);
    assert!(!h.store.find_device("p-1").await.unwrap().unwrap().online);
    assert!(!h.store.find_device("p-2").await.unwrap().unwrap().online);
    assert!(h.table.is_empty(), "pending peripheral entries were purged");
}

/// The end-to-end liveness ordering: gateway replies and stays online, its
/// peripheral never replies within its deadline and goes offline alone.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_silent_peripheral_goes_offline_while_gateway_stays_online() {
    let h = harness().await;
    seed_gateway(&h.store, "hb-1").await;
    seed_peripheral(&h.store, "hb-1", "d-front", "esp-front").await;
    h.store
        .set_device_online("d-front", true, chrono::Utc::now())
        .await
        .unwrap();

    // answers gateway pings, never relays peripheral replies
    connect_responder(&h.registry, h.engine.clone(), "hb-1", false);

    let prober = LivenessProber::new(h.engine.clone(), h.store.clone(), prober_config());
    let summary = prober.run_cycle().await.unwrap();
    assert_eq!(summary.gateways_online, 1);
    assert_eq!(summary.peripherals_pinged, 1);

    // give the detached waiter its 300ms deadline plus margin
    tokio::time::sleep(Duration::from_millis(800)).await;

    assert!(h.store.find_gateway("hb-1").await.unwrap().unwrap().online);
    assert!(!h.store.find_device("d-front").await.unwrap().unwrap().online);
    assert!(h.table.is_empty(), "timed-out peripheral entry was removed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_responding_peripheral_confirmed_online() {
    let h = harness().await;
    seed_gateway(&h.store, "hb-1").await;
    seed_peripheral(&h.store, "hb-1", "d-front", "esp-front").await;
    connect_responder(&h.registry, h.engine.clone(), "hb-1", true);

    let prober = LivenessProber::new(h.engine.clone(), h.store.clone(), prober_config());
    let summary = prober.run_cycle().await.unwrap();
    assert_eq!(summary.peripherals_pinged, 1);

    tokio::time::sleep(Duration::from_millis(300)).await;

    let dev = h.store.find_device("d-front").await.unwrap().unwrap();
    assert!(dev.online);
    assert!(dev.last_seen_at.is_some());
}

/// A stale "online" flag with no live socket must not trigger peripheral
/// pings; the cycle corrects the flag instead.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stale_online_flag_without_socket() {
    let h = harness().await;
    seed_gateway(&h.store, "hb-1").await;
    seed_peripheral(&h.store, "hb-1", "d-1", "esp-1").await;
    h.store
        .set_gateway_online("hb-1", chrono::Utc::now())
        .await
        .unwrap();

    let prober = LivenessProber::new(h.engine.clone(), h.store.clone(), prober_config());
    let summary = prober.run_cycle().await.unwrap();

    assert_eq!(summary.peripherals_pinged, 0);
    assert!(!h.store.find_gateway("hb-1").await.unwrap().unwrap().online);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sweep_expires_peripheral_entry() {
    let h = harness().await;
    seed_gateway(&h.store, "hb-1").await;
    seed_peripheral(&h.store, "hb-1", "d-1", "esp-1").await;
    h.store
        .set_device_online("d-1", true, chrono::Utc::now())
        .await
        .unwrap();

    let (_id, _rx) = h.table.insert(
        RequestKind::PeripheralPing,
        RequestSubject::peripheral("hb-1", "d-1", "esp-1"),
        Duration::from_millis(0),
    );

    let sweep = CorrelationSweep::new(h.table.clone(), h.store.clone(), SweepConfig::default());
    tokio::time::sleep(Duration::from_millis(5)).await;
    let swept = sweep.run_sweep().await;

    assert_eq!(swept, 1);
    assert!(h.table.is_empty());
    assert!(!h.store.find_device("d-1").await.unwrap().unwrap().online);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sweep_gateway_expiry_cascades() {
    let h = harness().await;
    seed_gateway(&h.store, "hb-1").await;
    seed_peripheral(&h.store, "hb-1", "p-1", "esp-1").await;
    let now = chrono::Utc::now();
    h.store.set_gateway_online("hb-1", now).await.unwrap();
    h.store.set_device_online("p-1", true, now).await.unwrap();

    let (_gw_id, _gw_rx) = h.table.insert(
        RequestKind::GatewayPing,
        RequestSubject::gateway("hb-1"),
        Duration::from_millis(0),
    );
    // a still-live peripheral entry for the same gateway gets cascaded
    let (_p_id, _p_rx) = h.table.insert(
        RequestKind::PeripheralPing,
        RequestSubject::peripheral("hb-1", "p-1", "esp-1"),
        Duration::from_secs(60),
    );

    let sweep = CorrelationSweep::new(h.table.clone(), h.store.clone(), SweepConfig::default());
    tokio::time::sleep(Duration::from_millis(5)).await;
    let swept = sweep.run_sweep().await;

    assert_eq!(swept, 1, "only the gateway entry had expired");
    assert!(h.table.is_empty(), "the peripheral entry was cascaded away");
    assert!(!h.store.find_gateway("hb-1").await.unwrap().unwrap().online);
    assert!(!h.store.find_device("p-1").await.unwrap().unwrap().online);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sweep_leaves_zone_command_state_untouched() {
    let h = harness().await;
    seed_gateway(&h.store, "hb-1").await;
    seed_peripheral(&h.store, "hb-1", "d-1", "esp-1").await;
    h.store
        .record_zone_transition(
            "d-1",
            0b0001,
            true,
            chrono::Utc::now(),
            furrow_core::persistence::RunSource::Manual,
            None,
        )
        .await
        .unwrap();

    let (_id, _rx) = h.table.insert(
        RequestKind::ZoneCommand,
        RequestSubject::peripheral("hb-1", "d-1", "esp-1"),
        Duration::from_millis(0),
    );

    let sweep = CorrelationSweep::new(h.table.clone(), h.store.clone(), SweepConfig::default());
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(sweep.run_sweep().await, 1);

    // the persisted zone flag is still authoritative
    assert!(h.store.zone_state("d-1").await.unwrap().unwrap().zone1);
}
