// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Furrow Protocol - QUIC + JSON communication layer
//!
//! This crate provides the wire protocol for communication between field
//! gateways and the furrow backend.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    furrow-protocol                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Messages: type-tagged JSON, requestId correlation          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Framing: 4-byte length prefix per message                  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: QUIC (quinn), one control stream per gateway    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! A gateway opens a single bidirectional control stream after connecting
//! and sends a `register` frame. From then on the stream is fully duplex:
//! the backend pushes pings and zone commands at any time, and the gateway
//! pushes correlated replies plus unsolicited device announcements.
//!
//! # Usage (gateway side)
//!
//! ```ignore
//! use furrow_protocol::{GatewayClient, WireMessage};
//!
//! let client = GatewayClient::localhost("127.0.0.1:8081".parse()?)?;
//! let mut session = client.register("hb-1").await?;
//!
//! while let Ok(msg) = session.read_message().await {
//!     if let WireMessage::PingGateway { request_id } = msg {
//!         session
//!             .send_message(&WireMessage::PongGateway { request_id, online: true })
//!             .await?;
//!     }
//! }
//! ```

pub mod client;
pub mod frame;
pub mod message;
pub mod server;

pub use client::{ClientError, GatewayClient, GatewayClientConfig, GatewaySession};
pub use frame::{Frame, FrameError, FramedStream};
pub use message::{AnnouncedDevice, WireMessage};
pub use server::{ConnectionHandler, FieldServer, FieldServerConfig, ServerError};
