// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Gateway session server.
//!
//! Accepts QUIC connections from gateways, runs the registration handshake,
//! and drives one read task + one write task per connection. The read task
//! is the single inbound-dispatch path for a connection: replies resolve
//! correlation entries, announcements go to watchers, and a malformed frame
//! closes that one connection without touching any other.

use std::sync::Arc;
use std::time::Duration;

use furrow_protocol::frame::{Frame, FrameError, read_frame, write_frame};
use furrow_protocol::server::ConnectionHandler;
use furrow_protocol::{FieldServer, WireMessage};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::engine::CommandEngine;
use crate::persistence::Store;
use crate::registry::{ConnectionRegistry, ConnectionState, GatewayHandle};
use crate::watch::WatcherRegistry;

/// How long a fresh connection has to open its control stream and send the
/// registration frame.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Close code for a protocol violation (wrong or malformed frame).
const CLOSE_PROTOCOL_VIOLATION: u32 = 2;

/// Shared state for gateway sessions.
pub struct SessionState {
    /// Registry of live gateway connections.
    pub registry: Arc<ConnectionRegistry>,
    /// Command/ack engine resolving inbound replies.
    pub engine: Arc<CommandEngine>,
    /// Device-announcement watchers.
    pub watchers: Arc<WatcherRegistry>,
    /// Durable store, used to flag claimed gateways online on registration.
    pub store: Arc<dyn Store>,
}

impl SessionState {
    /// Ask a gateway to put its local network into pairing mode. Devices it
    /// pairs arrive as announcements on the gateway's watcher (see
    /// [`WatcherRegistry::watch`]). Fire-and-forget: no reply is expected,
    /// the return value only says whether a live connection existed.
    pub fn start_provisioning(&self, gateway_id: &str) -> bool {
        self.engine
            .send_no_ack(gateway_id, WireMessage::StartProvisioning)
    }

    /// Take a gateway's local network out of pairing mode. Fire-and-forget,
    /// as [`SessionState::start_provisioning`].
    pub fn stop_provisioning(&self, gateway_id: &str) -> bool {
        self.engine
            .send_no_ack(gateway_id, WireMessage::StopProvisioning)
    }
}

/// Run the gateway QUIC server until the endpoint closes.
pub async fn run_gateway_server(
    server: FieldServer,
    state: Arc<SessionState>,
) -> anyhow::Result<()> {
    server
        .run(move |conn: ConnectionHandler| {
            let state = state.clone();
            async move {
                handle_connection(conn, state).await;
            }
        })
        .await?;
    Ok(())
}

/// Handle a single gateway connection from handshake to teardown.
pub async fn handle_connection(conn: ConnectionHandler, state: Arc<SessionState>) {
    let remote = conn.remote_address();

    // The gateway opens the control stream and speaks first.
    let accepted = tokio::time::timeout(HANDSHAKE_TIMEOUT, conn.accept_bi()).await;
    let (send, mut recv) = match accepted {
        Ok(Ok(streams)) => streams,
        Ok(Err(e)) => {
            debug!(%remote, error = %e, "connection dropped before control stream");
            return;
        }
        Err(_) => {
            warn!(%remote, "no control stream within handshake timeout");
            conn.close(CLOSE_PROTOCOL_VIOLATION, b"handshake timeout");
            return;
        }
    };

    let first = match tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut recv)).await {
        Ok(Ok(frame)) => frame,
        Ok(Err(e)) => {
            debug!(%remote, error = %e, "connection dropped during handshake");
            return;
        }
        Err(_) => {
            warn!(%remote, "no registration frame within handshake timeout");
            conn.close(CLOSE_PROTOCOL_VIOLATION, b"handshake timeout");
            return;
        }
    };

    let gateway_id = match first.decode::<WireMessage>() {
        Ok(WireMessage::Register { gateway_id }) if !gateway_id.is_empty() => gateway_id,
        Ok(other) => {
            warn!(%remote, msg = ?other, "expected register as first frame");
            conn.close(CLOSE_PROTOCOL_VIOLATION, b"expected register");
            return;
        }
        Err(e) => {
            warn!(%remote, error = %e, "malformed registration frame");
            conn.close(CLOSE_PROTOCOL_VIOLATION, b"malformed frame");
            return;
        }
    };

    // Register the connection; a reconnect simply replaces the old entry.
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<WireMessage>();
    let handle = GatewayHandle::new(&gateway_id, outbound_tx);
    let handle_id = handle.handle_id();
    state.registry.register(handle.clone());
    info!(%gateway_id, %remote, "gateway connected");

    // Registration from a claimed gateway is itself proof of reachability.
    match state.store.find_gateway(&gateway_id).await {
        Ok(Some(_)) => {
            if let Err(e) = state
                .store
                .set_gateway_online(&gateway_id, chrono::Utc::now())
                .await
            {
                warn!(%gateway_id, error = %e, "failed to flag gateway online");
            }
        }
        Ok(None) => {
            warn!(%gateway_id, "unclaimed gateway connected; liveness will skip it");
        }
        Err(e) => {
            warn!(%gateway_id, error = %e, "gateway lookup failed on registration");
        }
    }

    // Writer task: drains the handle's queue onto the stream.
    let writer_gateway = gateway_id.clone();
    let writer = tokio::spawn(async move {
        let mut send = send;
        while let Some(msg) = outbound_rx.recv().await {
            let frame = match Frame::from_message(&msg) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(gateway_id = %writer_gateway, error = %e, "dropped unencodable frame");
                    continue;
                }
            };
            if let Err(e) = write_frame(&mut send, &frame).await {
                debug!(gateway_id = %writer_gateway, error = %e, "write failed, stopping writer");
                break;
            }
        }
    });

    // Read loop: the one inbound-dispatch path for this connection.
    loop {
        match read_frame(&mut recv).await {
            Ok(frame) => match frame.decode::<WireMessage>() {
                Ok(msg) => dispatch_inbound(&state, &gateway_id, msg),
                Err(e) => {
                    // MALFORMED: close this connection, nothing else.
                    warn!(%gateway_id, error = %e, "malformed frame, closing connection");
                    handle.set_state(ConnectionState::Closing);
                    conn.close(CLOSE_PROTOCOL_VIOLATION, b"malformed frame");
                    break;
                }
            },
            Err(FrameError::ConnectionClosed) => {
                debug!(%gateway_id, "gateway closed the connection");
                break;
            }
            Err(e) => {
                warn!(%gateway_id, error = %e, "framing error, closing connection");
                handle.set_state(ConnectionState::Closing);
                conn.close(CLOSE_PROTOCOL_VIOLATION, b"framing error");
                break;
            }
        }
    }

    // Teardown. Removal is conditioned on handle identity so a reconnect
    // that already replaced us is left alone; only the canonical connection
    // purges the gateway's pending requests.
    handle.set_state(ConnectionState::Closed);
    let removed = state.registry.remove_if(&gateway_id, handle_id);
    if removed {
        let purged = state.engine.table().take_for_gateway(&gateway_id);
        if !purged.is_empty() {
            debug!(
                %gateway_id,
                count = purged.len(),
                "purged pending requests on disconnect"
            );
        }
        // dropping the entries resolves their waiters as unreachable
    }
    writer.abort();
    info!(%gateway_id, removed, "gateway connection closed");
}

/// Route one inbound message from a registered gateway.
fn dispatch_inbound(state: &SessionState, gateway_id: &str, msg: WireMessage) {
    match msg {
        ref reply if reply.is_reply() => {
            // Unknown identifiers are stale replies; resolve_reply logs and
            // drops them without surfacing anything.
            state.engine.resolve_reply(reply);
        }
        WireMessage::DeviceAnnounced { device } => {
            debug!(gateway_id, device_id = %device.id, "device announced");
            state.watchers.notify(gateway_id, device);
        }
        WireMessage::Register { .. } => {
            debug!(gateway_id, "duplicate register ignored");
        }
        other => {
            warn!(gateway_id, msg = ?other, "unexpected backend-bound message");
        }
    }
}
