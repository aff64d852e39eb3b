// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed wire messages exchanged between the backend and gateways.
//!
//! Every message is a JSON object tagged by a `type` field with camelCase
//! keys, e.g. `{"type":"pingGateway","requestId":"..."}`. Replies echo the
//! `requestId` of the request that caused them; that identifier is the only
//! correlation mechanism on the wire.

use serde::{Deserialize, Serialize};

/// A peripheral announced by a gateway after local provisioning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnouncedDevice {
    pub name: String,
    pub id: String,
    pub kind: String,
}

/// All frames that travel on a gateway control stream, in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WireMessage {
    /// Gateway → backend: registration handshake, first frame on the stream.
    #[serde(rename_all = "camelCase")]
    Register { gateway_id: String },

    /// Backend → gateway: gateway-level liveness probe.
    #[serde(rename_all = "camelCase")]
    PingGateway { request_id: String },

    /// Gateway → backend: reply to [`WireMessage::PingGateway`].
    #[serde(rename_all = "camelCase")]
    PongGateway { request_id: String, online: bool },

    /// Backend → gateway: relayed liveness probe for one peripheral.
    #[serde(rename_all = "camelCase")]
    PingPeripheral {
        request_id: String,
        local_name: String,
    },

    /// Gateway → backend: reply to [`WireMessage::PingPeripheral`].
    #[serde(rename_all = "camelCase")]
    PongPeripheral { request_id: String, online: bool },

    /// Backend → gateway: actuate one zone on a peripheral.
    #[serde(rename_all = "camelCase")]
    Command {
        request_id: String,
        local_name: String,
        zone: u8,
        on: bool,
        auth_key: String,
    },

    /// Gateway → backend: reply to [`WireMessage::Command`].
    #[serde(rename_all = "camelCase")]
    CommandAck { request_id: String, success: bool },

    /// Gateway → backend, unsolicited: a peripheral finished provisioning.
    #[serde(rename_all = "camelCase")]
    DeviceAnnounced { device: AnnouncedDevice },

    /// Backend → gateway: put the local network into pairing mode. No
    /// reply is expected; paired devices arrive as
    /// [`WireMessage::DeviceAnnounced`].
    StartProvisioning,

    /// Backend → gateway: leave pairing mode. No reply is expected.
    StopProvisioning,
}

impl WireMessage {
    /// The correlation identifier carried by this message, if any.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            WireMessage::PingGateway { request_id }
            | WireMessage::PongGateway { request_id, .. }
            | WireMessage::PingPeripheral { request_id, .. }
            | WireMessage::PongPeripheral { request_id, .. }
            | WireMessage::Command { request_id, .. }
            | WireMessage::CommandAck { request_id, .. } => Some(request_id),
            WireMessage::Register { .. }
            | WireMessage::DeviceAnnounced { .. }
            | WireMessage::StartProvisioning
            | WireMessage::StopProvisioning => None,
        }
    }

    /// Whether this message is a reply that resolves a pending request.
    pub fn is_reply(&self) -> bool {
        matches!(
            self,
            WireMessage::PongGateway { .. }
                | WireMessage::PongPeripheral { .. }
                | WireMessage::CommandAck { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_wire_shape() {
        let msg = WireMessage::Register {
            gateway_id: "hb-1".to_string(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "register", "gatewayId": "hb-1"})
        );
    }

    #[test]
    fn test_ping_pong_gateway_wire_shape() {
        let ping = WireMessage::PingGateway {
            request_id: "r1".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&ping).unwrap(),
            serde_json::json!({"type": "pingGateway", "requestId": "r1"})
        );

        let pong: WireMessage = serde_json::from_str(
            r#"{"type":"pongGateway","requestId":"r1","online":true}"#,
        )
        .unwrap();
        assert_eq!(
            pong,
            WireMessage::PongGateway {
                request_id: "r1".to_string(),
                online: true
            }
        );
    }

    #[test]
    fn test_peripheral_ping_wire_shape() {
        let ping = WireMessage::PingPeripheral {
            request_id: "r2".to_string(),
            local_name: "esp-front".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&ping).unwrap(),
            serde_json::json!({
                "type": "pingPeripheral",
                "requestId": "r2",
                "localName": "esp-front"
            })
        );
    }

    #[test]
    fn test_command_wire_shape() {
        let cmd = WireMessage::Command {
            request_id: "r3".to_string(),
            local_name: "esp-front".to_string(),
            zone: 2,
            on: true,
            auth_key: "123456".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&cmd).unwrap(),
            serde_json::json!({
                "type": "command",
                "requestId": "r3",
                "localName": "esp-front",
                "zone": 2,
                "on": true,
                "authKey": "123456"
            })
        );

        let ack: WireMessage =
            serde_json::from_str(r#"{"type":"commandAck","requestId":"r3","success":false}"#)
                .unwrap();
        assert_eq!(
            ack,
            WireMessage::CommandAck {
                request_id: "r3".to_string(),
                success: false
            }
        );
    }

    #[test]
    fn test_device_announced_wire_shape() {
        let msg: WireMessage = serde_json::from_str(
            r#"{"type":"deviceAnnounced","device":{"name":"Front lawn","id":"d-9","kind":"sprinkler"}}"#,
        )
        .unwrap();
        match &msg {
            WireMessage::DeviceAnnounced { device } => {
                assert_eq!(device.name, "Front lawn");
                assert_eq!(device.id, "d-9");
                assert_eq!(device.kind, "sprinkler");
            }
            other => panic!("unexpected message: {:?}", other),
        }
        // round trip
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(serde_json::from_str::<WireMessage>(&json).unwrap(), msg);
    }

    #[test]
    fn test_request_id_accessor() {
        let ping = WireMessage::PingGateway {
            request_id: "r9".to_string(),
        };
        assert_eq!(ping.request_id(), Some("r9"));

        let register = WireMessage::Register {
            gateway_id: "hb-1".to_string(),
        };
        assert_eq!(register.request_id(), None);
    }

    #[test]
    fn test_is_reply() {
        assert!(
            WireMessage::PongPeripheral {
                request_id: "r".to_string(),
                online: false
            }
            .is_reply()
        );
        assert!(
            !WireMessage::PingPeripheral {
                request_id: "r".to_string(),
                local_name: "esp".to_string()
            }
            .is_reply()
        );
        assert!(
            !WireMessage::DeviceAnnounced {
                device: AnnouncedDevice {
                    name: "n".to_string(),
                    id: "i".to_string(),
                    kind: "k".to_string()
                }
            }
            .is_reply()
        );
    }

    #[test]
    fn test_provisioning_wire_shape() {
        assert_eq!(
            serde_json::to_value(&WireMessage::StartProvisioning).unwrap(),
            serde_json::json!({"type": "startProvisioning"})
        );
        let msg: WireMessage =
            serde_json::from_str(r#"{"type":"stopProvisioning"}"#).unwrap();
        assert_eq!(msg, WireMessage::StopProvisioning);
        assert_eq!(msg.request_id(), None);
        assert!(!msg.is_reply());
    }

    #[test]
    fn test_unknown_type_rejected() {
        let result = serde_json::from_str::<WireMessage>(r#"{"type":"mystery","requestId":"x"}"#);
        assert!(result.is_err());
    }
}
