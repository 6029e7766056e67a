use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{BridgeError, Result};

/// Lowest accepted resistance level
pub const RESISTANCE_MIN: u8 = 0;

/// Highest accepted resistance level
pub const RESISTANCE_MAX: u8 = 100;

/// Lowest incline the KICKR Climb accepts, in percent
pub const INCLINE_MIN: i16 = -10;

/// Highest incline the KICKR Climb accepts, in percent
pub const INCLINE_MAX: i16 = 19;

/// Control channel of the trainer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    /// FTMS target resistance level
    Resistance,
    /// Vendor incline control
    Incline,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resistance => write!(f, "resistance"),
            Self::Incline => write!(f, "incline"),
        }
    }
}

/// Incline in half-percent steps, always within [-10%, +19%]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Incline(i16);

impl Incline {
    /// Flat road, 0%
    pub const FLAT: Self = Self(0);
    /// Steepest descent, -10%
    pub const MIN: Self = Self(INCLINE_MIN * 2);
    /// Steepest climb, +19%
    pub const MAX: Self = Self(INCLINE_MAX * 2);

    /// Build an incline from a percentage
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidParameters`] if the value is outside
    /// [-10, 19] or is not a multiple of 0.5.
    pub fn from_percent(percent: f32) -> Result<Self> {
        if !percent.is_finite()
            || percent < f32::from(INCLINE_MIN)
            || percent > f32::from(INCLINE_MAX)
        {
            return Err(BridgeError::InvalidParameters(format!(
                "Incline {percent}% is out of range ({INCLINE_MIN}% - {INCLINE_MAX}%)"
            )));
        }

        let steps = percent * 2.0;
        if steps.fract() != 0.0 {
            return Err(BridgeError::InvalidParameters(format!(
                "Incline {percent}% is not a multiple of 0.5%"
            )));
        }

        #[allow(clippy::cast_possible_truncation)]
        Ok(Self(steps as i16))
    }

    /// Build an incline from a count of half-percent steps
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidParameters`] if the step count is outside
    /// the supported range.
    pub fn from_half_steps(steps: i16) -> Result<Self> {
        if (Self::MIN.0..=Self::MAX.0).contains(&steps) {
            Ok(Self(steps))
        } else {
            Err(BridgeError::InvalidParameters(format!(
                "Incline of {steps} half-steps is out of range ({INCLINE_MIN}% - {INCLINE_MAX}%)"
            )))
        }
    }

    /// Number of 0.5% steps away from flat
    #[must_use]
    pub const fn half_steps(self) -> i16 {
        self.0
    }

    /// Incline as a percentage
    #[must_use]
    pub fn percent(self) -> f32 {
        f32::from(self.0) / 2.0
    }
}

impl fmt::Display for Incline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1}%", self.percent())
    }
}

/// A control request for the trainer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Take FTMS control and reset the machine's control settings
    Reset,
    /// Set the FTMS target resistance level
    SetResistance(u8),
    /// Set the target incline through the vendor characteristic
    SetIncline(Incline),
}

impl Command {
    /// Channel whose confirmed state this command changes, if any
    #[must_use]
    pub const fn channel(&self) -> Option<Channel> {
        match self {
            Self::Reset => None,
            Self::SetResistance(_) => Some(Channel::Resistance),
            Self::SetIncline(_) => Some(Channel::Incline),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reset => write!(f, "reset"),
            Self::SetResistance(level) => write!(f, "resistance {level}"),
            Self::SetIncline(incline) => write!(f, "incline {incline}"),
        }
    }
}

/// Lifecycle state of a [`DeviceSession`](crate::session::DeviceSession)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No BLE connection
    Disconnected,
    /// Connection initiated
    Connecting,
    /// Connected, waiting for services to resolve
    Discovering,
    /// Idle and accepting commands
    Ready,
    /// FTMS request-control write issued for a command
    AwaitingControlAck(Command),
    /// Value write issued for a command
    AwaitingValueAck(Command),
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Discovering => write!(f, "Discovering"),
            Self::Ready => write!(f, "Ready"),
            Self::AwaitingControlAck(command) => write!(f, "AwaitingControlAck({command})"),
            Self::AwaitingValueAck(command) => write!(f, "AwaitingValueAck({command})"),
        }
    }
}

/// One decoded Indoor Bike Data notification
///
/// Fields are `None` when the notification's flags mark them absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    /// Instantaneous speed in m/s
    pub instantaneous_speed: Option<f64>,
    /// Average speed in m/s
    pub average_speed: Option<f64>,
    /// Instantaneous cadence in rpm
    pub instantaneous_cadence: Option<f64>,
    /// Average cadence in rpm
    pub average_cadence: Option<f64>,
    /// Total distance in meters
    pub total_distance: Option<u32>,
    /// Resistance level reported by the trainer
    pub resistance_level: Option<u16>,
    /// Instantaneous power in watts
    pub instantaneous_power: Option<u16>,
    /// Average power in watts
    pub average_power: Option<u16>,
    /// Total expended energy in kcal
    pub expended_energy_total: Option<u16>,
    /// Expended energy in kcal per hour
    pub expended_energy_per_hour: Option<u16>,
    /// Expended energy in kcal per minute
    pub expended_energy_per_minute: Option<u8>,
    /// Heart rate in bpm
    pub heart_rate: Option<u8>,
    /// Metabolic equivalent
    pub metabolic_equivalent: Option<f64>,
    /// Elapsed time in seconds
    pub elapsed_time: Option<u16>,
    /// Remaining time in seconds
    pub remaining_time: Option<u16>,
}

/// BLE connection parameters
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    /// Connection timeout in milliseconds
    pub timeout_ms: u64,
    /// Scan timeout in milliseconds
    pub scan_timeout_ms: u64,
    /// Reconnect attempts after a failure or disconnect
    pub retry_attempts: u32,
    /// Initial delay between reconnect attempts, doubled on each retry
    pub retry_delay_ms: u64,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            scan_timeout_ms: 10_000,
            retry_attempts: 3,
            retry_delay_ms: 1_000,
        }
    }
}

/// Timeouts for GATT operations
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Time allowed for a write acknowledgement before it counts as failed
    pub write_ack_timeout_ms: u64,
    /// Time allowed for a characteristic read
    pub read_timeout_ms: u64,
    /// Time allowed for enabling notifications
    pub subscribe_timeout_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            write_ack_timeout_ms: 2_000,
            read_timeout_ms: 2_000,
            subscribe_timeout_ms: 3_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incline_from_percent() {
        assert_eq!(Incline::from_percent(0.0).unwrap(), Incline::FLAT);
        assert_eq!(Incline::from_percent(-10.0).unwrap(), Incline::MIN);
        assert_eq!(Incline::from_percent(19.0).unwrap(), Incline::MAX);
        assert_eq!(Incline::from_percent(2.5).unwrap().half_steps(), 5);
        assert_eq!(Incline::from_percent(-0.5).unwrap().half_steps(), -1);
    }

    #[test]
    fn test_incline_rejects_invalid_values() {
        let invalid = [25.0, -20.0, 19.5, -10.5, 0.25, 3.7, f32::NAN, f32::INFINITY];

        for percent in invalid {
            assert!(
                matches!(
                    Incline::from_percent(percent),
                    Err(BridgeError::InvalidParameters(_))
                ),
                "{percent} should be rejected"
            );
        }
    }

    #[test]
    fn test_incline_half_steps_bounds() {
        assert!(Incline::from_half_steps(-20).is_ok());
        assert!(Incline::from_half_steps(38).is_ok());
        assert!(Incline::from_half_steps(-21).is_err());
        assert!(Incline::from_half_steps(39).is_err());
    }

    #[test]
    fn test_incline_display() {
        let incline = Incline::from_percent(-2.5).unwrap();
        assert_eq!(incline.to_string(), "-2.5%");
        assert!((incline.percent() + 2.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_command_channel() {
        assert_eq!(Command::Reset.channel(), None);
        assert_eq!(
            Command::SetResistance(40).channel(),
            Some(Channel::Resistance)
        );
        assert_eq!(
            Command::SetIncline(Incline::FLAT).channel(),
            Some(Channel::Incline)
        );
    }

    #[test]
    fn test_defaults() {
        let params = ConnectionParams::default();
        assert_eq!(params.timeout_ms, 30_000);
        assert_eq!(params.scan_timeout_ms, 10_000);
        assert_eq!(params.retry_attempts, 3);

        let timeouts = TimeoutConfig::default();
        assert_eq!(timeouts.write_ack_timeout_ms, 2_000);
    }
}
