use thiserror::Error;

/// Errors that can occur while bridging a KICKR trainer to MQTT
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// Device not found during scanning
    #[error("KICKR device not found: {address}")]
    DeviceNotFound {
        /// MAC address that was searched for
        address: String,
    },

    /// Device connection or service discovery failed
    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    /// Device disconnected
    #[error("Device disconnected")]
    Disconnected,

    /// Operation timed out
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Invalid command parameters
    #[error("Invalid command parameters: {0}")]
    InvalidParameters(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Notification length does not match the fields announced by its flags
    #[error("Payload length mismatch: flags imply {expected} bytes, got {actual}")]
    PayloadLength {
        /// Length implied by the flags field
        expected: usize,
        /// Actual payload length
        actual: usize,
    },

    /// Session is not ready for commands
    #[error("Session not ready: {reason}")]
    NotReady {
        /// Reason why the session is not ready
        reason: String,
    },

    /// MQTT client request failed
    #[error("MQTT client error: {0}")]
    MqttClient(#[from] rumqttc::ClientError),

    /// JSON serialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    /// Check if this error indicates a connection issue
    ///
    /// Connection errors end the current session; everything else is handled
    /// where it is detected.
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::ConnectionFailed(_)
                | Self::Disconnected
                | Self::DeviceNotFound { .. }
        )
    }

    /// Check if this error is recoverable
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::InvalidParameters(_)
                | Self::PayloadLength { .. }
                | Self::Protocol(_)
                | Self::NotReady { .. }
        )
    }
}
