// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Correlation table for in-flight requests awaiting asynchronous replies.
//!
//! Every outbound request that expects a reply registers an entry keyed by
//! a freshly minted request identifier; the reply (or a timeout, or the
//! expiry sweep) resolves it. Resolution happens exactly once because every
//! path goes through [`CorrelationTable::take`], which removes the entry
//! under the table lock: whichever of reply-arrival and timeout wins the
//! removal owns the entry, and the loser's action becomes a no-op.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use uuid::Uuid;

/// What kind of operation a pending request represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Gateway-level liveness probe.
    GatewayPing,
    /// Relayed liveness probe for a peripheral.
    PeripheralPing,
    /// Zone actuation command.
    ZoneCommand,
}

/// The entity a pending request is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSubject {
    /// The gateway the request was sent to.
    pub gateway_id: String,
    /// The peripheral involved, for peripheral pings and zone commands.
    pub device_id: Option<String>,
    /// The peripheral's local network name, when addressed.
    pub local_name: Option<String>,
}

impl RequestSubject {
    /// Subject for a gateway-level operation.
    pub fn gateway(gateway_id: &str) -> Self {
        Self {
            gateway_id: gateway_id.to_string(),
            device_id: None,
            local_name: None,
        }
    }

    /// Subject for a peripheral-level operation.
    pub fn peripheral(gateway_id: &str, device_id: &str, local_name: &str) -> Self {
        Self {
            gateway_id: gateway_id.to_string(),
            device_id: Some(device_id.to_string()),
            local_name: Some(local_name.to_string()),
        }
    }
}

/// How a pending request was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// A correlated reply arrived; `success` is its embedded indicator
    /// (`online` for pongs, `success` for command acks).
    Reply {
        /// The reply's embedded success indicator.
        success: bool,
    },
    /// The expiry sweep removed the entry after its deadline passed.
    Expired,
}

/// One in-flight request awaiting a correlated reply.
#[derive(Debug)]
pub struct PendingRequest {
    /// What operation this request performs.
    pub kind: RequestKind,
    /// The entity the request is about.
    pub subject: RequestSubject,
    /// When the entry was created.
    pub created_at: Instant,
    /// When the entry expires.
    pub deadline: Instant,
    responder: oneshot::Sender<Resolution>,
}

impl PendingRequest {
    /// Deliver the resolution to the waiting caller. Dropping the request
    /// without calling this resolves the waiter with a closed channel,
    /// which callers interpret as the connection having gone away.
    pub fn resolve(self, resolution: Resolution) {
        let _ = self.responder.send(resolution);
    }
}

/// Table of pending requests keyed by request identifier.
#[derive(Default)]
pub struct CorrelationTable {
    inner: Mutex<HashMap<String, PendingRequest>>,
}

impl CorrelationTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a fresh request identifier and insert a pending entry for it.
    /// The identifier is guaranteed unique among entries currently in the
    /// table. Returns the identifier and the receiver the caller suspends
    /// on.
    pub fn insert(
        &self,
        kind: RequestKind,
        subject: RequestSubject,
        ttl: Duration,
    ) -> (String, oneshot::Receiver<Resolution>) {
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        let pending = PendingRequest {
            kind,
            subject,
            created_at: now,
            deadline: now + ttl,
            responder: tx,
        };

        let mut inner = self.inner.lock().expect("correlation lock poisoned");
        let mut request_id = Uuid::new_v4().to_string();
        while inner.contains_key(&request_id) {
            request_id = Uuid::new_v4().to_string();
        }
        inner.insert(request_id.clone(), pending);
        (request_id, rx)
    }

    /// Remove and return the entry for `request_id`, if present. This is the
    /// single resolution point: exactly one of reply-dispatch, caller
    /// timeout, and sweep gets `Some`.
    pub fn take(&self, request_id: &str) -> Option<PendingRequest> {
        self.inner
            .lock()
            .expect("correlation lock poisoned")
            .remove(request_id)
    }

    /// Whether an entry for `request_id` is still pending.
    pub fn contains(&self, request_id: &str) -> bool {
        self.inner
            .lock()
            .expect("correlation lock poisoned")
            .contains_key(request_id)
    }

    /// How many of the given identifiers are still pending.
    pub fn outstanding(&self, request_ids: &[String]) -> usize {
        let inner = self.inner.lock().expect("correlation lock poisoned");
        request_ids
            .iter()
            .filter(|id| inner.contains_key(id.as_str()))
            .count()
    }

    /// Remove and return every entry whose deadline has passed.
    pub fn take_expired(&self, now: Instant) -> Vec<(String, PendingRequest)> {
        let mut inner = self.inner.lock().expect("correlation lock poisoned");
        let expired_ids: Vec<String> = inner
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        expired_ids
            .into_iter()
            .filter_map(|id| inner.remove(&id).map(|pending| (id, pending)))
            .collect()
    }

    /// Remove and return every entry addressed to `gateway_id`. Used when a
    /// gateway goes offline or its connection closes: its pending requests
    /// can never be answered.
    pub fn take_for_gateway(&self, gateway_id: &str) -> Vec<(String, PendingRequest)> {
        let mut inner = self.inner.lock().expect("correlation lock poisoned");
        let matching_ids: Vec<String> = inner
            .iter()
            .filter(|(_, pending)| pending.subject.gateway_id == gateway_id)
            .map(|(id, _)| id.clone())
            .collect();
        matching_ids
            .into_iter()
            .filter_map(|id| inner.remove(&id).map(|pending| (id, pending)))
            .collect()
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("correlation lock poisoned").len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
