// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for furrow-core.
//!
//! [`CommandError`] is the taxonomy surfaced to command and ping callers;
//! [`StoreError`] covers the persistence layer. A malformed inbound frame is
//! not represented here because it never reaches a caller: the session
//! closes the offending connection instead.

use thiserror::Error;

/// Failures surfaced to a caller of the command/ack engine.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CommandError {
    /// No live connection is registered for the target gateway.
    #[error("gateway '{gateway_id}' is not reachable")]
    Unreachable {
        /// The gateway that had no registered connection.
        gateway_id: String,
    },

    /// A connection existed but no correlated reply arrived within the deadline.
    #[error("no reply for request '{request_id}' within {timeout_ms}ms")]
    Timeout {
        /// The request identifier that went unanswered.
        request_id: String,
        /// The deadline that elapsed, in milliseconds.
        timeout_ms: u64,
    },

    /// A reply arrived carrying an explicit failure indicator.
    #[error("gateway '{gateway_id}' rejected request '{request_id}'")]
    Rejected {
        /// The gateway that answered.
        gateway_id: String,
        /// The request identifier the rejection correlates to.
        request_id: String,
    },

    /// The target device does not exist in the store.
    #[error("device '{device_id}' not found")]
    DeviceNotFound {
        /// The device identifier that was looked up.
        device_id: String,
    },

    /// The device exists but declares no reachable local network name.
    #[error("device '{device_id}' has no local network name")]
    NotAddressable {
        /// The device identifier that cannot be addressed.
        device_id: String,
    },

    /// The zone number is outside the supported range.
    #[error("zone {zone} is out of range (1-4)")]
    InvalidZone {
        /// The rejected zone number.
        zone: u8,
    },

    /// The persistence layer failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CommandError {
    /// Stable machine-readable code for this error, used in logs and by
    /// HTTP-facing callers to distinguish "device offline" from "device
    /// rejected the command".
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Unreachable { .. } => "UNREACHABLE",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Rejected { .. } => "REJECTED",
            Self::DeviceNotFound { .. } => "DEVICE_NOT_FOUND",
            Self::NotAddressable { .. } => "NOT_ADDRESSABLE",
            Self::InvalidZone { .. } => "INVALID_ZONE",
            Self::Store(_) => "STORE_ERROR",
        }
    }

    /// Whether the failure means the device did not confirm the operation
    /// (as opposed to a local lookup/validation problem).
    pub fn is_delivery_failure(&self) -> bool {
        matches!(
            self,
            Self::Unreachable { .. } | Self::Timeout { .. } | Self::Rejected { .. }
        )
    }
}

/// Failures from the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A query or transaction failed.
    #[error("database error during '{operation}': {details}")]
    Database {
        /// The operation that failed.
        operation: String,
        /// Error details from the driver.
        details: String,
    },

    /// Applying embedded migrations failed.
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    /// Wrap a driver error with the name of the failing operation.
    pub fn db(operation: &str, err: sqlx::Error) -> Self {
        Self::Database {
            operation: operation.to_string(),
            details: err.to_string(),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let cases: Vec<(CommandError, &str)> = vec![
            (
                CommandError::Unreachable {
                    gateway_id: "hb-1".to_string(),
                },
                "UNREACHABLE",
            ),
            (
                CommandError::Timeout {
                    request_id: "r1".to_string(),
                    timeout_ms: 5000,
                },
                "TIMEOUT",
            ),
            (
                CommandError::Rejected {
                    gateway_id: "hb-1".to_string(),
                    request_id: "r1".to_string(),
                },
                "REJECTED",
            ),
            (
                CommandError::DeviceNotFound {
                    device_id: "d-1".to_string(),
                },
                "DEVICE_NOT_FOUND",
            ),
            (
                CommandError::NotAddressable {
                    device_id: "d-1".to_string(),
                },
                "NOT_ADDRESSABLE",
            ),
            (CommandError::InvalidZone { zone: 9 }, "INVALID_ZONE"),
        ];

        for (error, expected) in cases {
            assert_eq!(error.error_code(), expected, "for {:?}", error);
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_delivery_failure_classification() {
        assert!(
            CommandError::Unreachable {
                gateway_id: "g".to_string()
            }
            .is_delivery_failure()
        );
        assert!(
            CommandError::Timeout {
                request_id: "r".to_string(),
                timeout_ms: 1
            }
            .is_delivery_failure()
        );
        assert!(
            !CommandError::DeviceNotFound {
                device_id: "d".to_string()
            }
            .is_delivery_failure()
        );
        assert!(!CommandError::InvalidZone { zone: 0 }.is_delivery_failure());
    }

    #[test]
    fn test_command_error_display() {
        let err = CommandError::Unreachable {
            gateway_id: "hb-1".to_string(),
        };
        assert_eq!(err.to_string(), "gateway 'hb-1' is not reachable");

        let err = CommandError::Timeout {
            request_id: "r1".to_string(),
            timeout_ms: 5000,
        };
        assert_eq!(err.to_string(), "no reply for request 'r1' within 5000ms");

        let err = CommandError::InvalidZone { zone: 7 };
        assert_eq!(err.to_string(), "zone 7 is out of range (1-4)");
    }

    #[test]
    fn test_store_error_from_sqlx() {
        let err: StoreError = sqlx::Error::RowNotFound.into();
        match &err {
            StoreError::Database { operation, .. } => assert_eq!(operation, "query"),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(
            CommandError::from(err).error_code(),
            "STORE_ERROR"
        );
    }
}
