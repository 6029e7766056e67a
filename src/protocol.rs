use crate::{
    error::{BridgeError, Result},
    types::Incline,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Op code that prefixes every write to the vendor incline characteristic
///
/// Found with a BLE sniffer; `0x66 0x6c 0x07` sets +19%.
pub const INCLINE_SET_TARGET_OP_CODE: u8 = 0x66;

/// Wire increment for one 0.5% incline step
pub const INCLINE_STEP_UNIT: u16 = 50;

/// Fitness Machine Control Point op codes
///
/// The bridge only issues `RequestControl`, `Reset` and
/// `SetTargetResistanceLevel`; the rest are decoded when the trainer echoes
/// them in a response indication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlOpCode {
    /// Request control of the machine
    RequestControl = 0x00,
    /// Reset control settings
    Reset = 0x01,
    /// Set target speed
    SetTargetSpeed = 0x02,
    /// Set target inclination
    SetTargetInclination = 0x03,
    /// Set target resistance level
    SetTargetResistanceLevel = 0x04,
    /// Set target power
    SetTargetPower = 0x05,
    /// Set target heart rate
    SetTargetHeartRate = 0x06,
    /// Start or resume
    StartOrResume = 0x07,
    /// Stop or pause
    StopOrPause = 0x08,
    /// Set targeted expended energy
    SetTargetedExpendedEnergy = 0x09,
    /// Set targeted number of steps
    SetTargetedNumberOfSteps = 0x0A,
    /// Set targeted number of strides
    SetTargetedNumberOfStrides = 0x0B,
    /// Set targeted distance
    SetTargetedDistance = 0x0C,
    /// Set targeted training time
    SetTargetedTrainingTime = 0x0D,
    /// Set targeted time in two heart rate zones
    SetTargetedTimeInTwoHeartRateZones = 0x0E,
    /// Set targeted time in three heart rate zones
    SetTargetedTimeInThreeHeartRateZones = 0x0F,
    /// Set targeted time in five heart rate zones
    SetTargetedTimeInFiveHeartRateZones = 0x10,
    /// Set indoor bike simulation parameters
    SetIndoorBikeSimulationParameters = 0x11,
    /// Set wheel circumference
    SetWheelCircumference = 0x12,
    /// Spin down control
    SpinDownControl = 0x13,
    /// Set targeted cadence
    SetTargetedCadence = 0x14,
    /// Response code prefix for control point indications
    ResponseCode = 0x80,
}

impl ControlOpCode {
    /// Convert from u8
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::RequestControl),
            0x01 => Some(Self::Reset),
            0x02 => Some(Self::SetTargetSpeed),
            0x03 => Some(Self::SetTargetInclination),
            0x04 => Some(Self::SetTargetResistanceLevel),
            0x05 => Some(Self::SetTargetPower),
            0x06 => Some(Self::SetTargetHeartRate),
            0x07 => Some(Self::StartOrResume),
            0x08 => Some(Self::StopOrPause),
            0x09 => Some(Self::SetTargetedExpendedEnergy),
            0x0A => Some(Self::SetTargetedNumberOfSteps),
            0x0B => Some(Self::SetTargetedNumberOfStrides),
            0x0C => Some(Self::SetTargetedDistance),
            0x0D => Some(Self::SetTargetedTrainingTime),
            0x0E => Some(Self::SetTargetedTimeInTwoHeartRateZones),
            0x0F => Some(Self::SetTargetedTimeInThreeHeartRateZones),
            0x10 => Some(Self::SetTargetedTimeInFiveHeartRateZones),
            0x11 => Some(Self::SetIndoorBikeSimulationParameters),
            0x12 => Some(Self::SetWheelCircumference),
            0x13 => Some(Self::SpinDownControl),
            0x14 => Some(Self::SetTargetedCadence),
            0x80 => Some(Self::ResponseCode),
            _ => None,
        }
    }
}

/// Result codes carried in control point response indications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    /// Operation succeeded
    Success,
    /// Op code not supported by the machine
    OpCodeNotSupported,
    /// Parameter outside the supported range
    InvalidParameter,
    /// Operation failed
    OperationFailed,
    /// Control has not been granted
    ControlNotPermitted,
    /// Reserved or unknown code
    Unknown(u8),
}

impl From<u8> for ResultCode {
    fn from(value: u8) -> Self {
        match value {
            0x01 => Self::Success,
            0x02 => Self::OpCodeNotSupported,
            0x03 => Self::InvalidParameter,
            0x04 => Self::OperationFailed,
            0x05 => Self::ControlNotPermitted,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "Success"),
            Self::OpCodeNotSupported => write!(f, "Op Code Not Supported"),
            Self::InvalidParameter => write!(f, "Invalid Parameter"),
            Self::OperationFailed => write!(f, "Operation Failed"),
            Self::ControlNotPermitted => write!(f, "Control Not Permitted"),
            Self::Unknown(code) => write!(f, "Unknown ({code:02X})"),
        }
    }
}

/// Write payload for the Fitness Machine Control Point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPointMessage {
    /// Op code
    pub op_code: ControlOpCode,
    /// Parameter bytes following the op code
    pub parameters: Vec<u8>,
}

impl ControlPointMessage {
    /// Create a message without parameters
    #[must_use]
    pub const fn command(op_code: ControlOpCode) -> Self {
        Self {
            op_code,
            parameters: Vec::new(),
        }
    }

    /// Create a request-control message
    #[must_use]
    pub const fn request_control() -> Self {
        Self::command(ControlOpCode::RequestControl)
    }

    /// Create a reset message
    #[must_use]
    pub const fn reset() -> Self {
        Self::command(ControlOpCode::Reset)
    }

    /// Create a set-target-resistance-level message
    ///
    /// The KICKR takes the level as a single unsigned byte.
    #[must_use]
    pub fn set_target_resistance_level(level: u8) -> Self {
        Self {
            op_code: ControlOpCode::SetTargetResistanceLevel,
            parameters: vec![level],
        }
    }

    /// Serialize message to bytes
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + self.parameters.len());
        buf.put_u8(self.op_code as u8);
        buf.extend_from_slice(&self.parameters);
        buf.freeze()
    }
}

/// Response indication from the Fitness Machine Control Point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlPointResponse {
    /// Op code of the request being answered
    pub request_op_code: u8,
    /// Outcome of the request
    pub result: ResultCode,
}

impl ControlPointResponse {
    /// Parse a response indication
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Protocol`] if the payload is shorter than three
    /// bytes or does not start with the response op code.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 3 {
            return Err(BridgeError::Protocol(format!(
                "Control point response too short: {} bytes",
                data.len()
            )));
        }

        let mut buf = data;
        let response = buf.get_u8();
        if response != ControlOpCode::ResponseCode as u8 {
            return Err(BridgeError::Protocol(format!(
                "Unexpected control point op code: {response:02X}"
            )));
        }

        let request_op_code = buf.get_u8();
        let result = ResultCode::from(buf.get_u8());

        Ok(Self {
            request_op_code,
            result,
        })
    }

    /// Request op code, if it is a known one
    #[must_use]
    pub const fn request(&self) -> Option<ControlOpCode> {
        ControlOpCode::from_u8(self.request_op_code)
    }

    /// Check whether the trainer accepted the request
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.result == ResultCode::Success
    }
}

/// Supported range read from a range characteristic
///
/// Resistance Level Range and Inclination Range share this layout:
/// sint16 minimum, sint16 maximum, uint16 minimum increment, all with a
/// resolution of 0.1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeSetting {
    /// Minimum supported value
    pub minimum: f64,
    /// Maximum supported value
    pub maximum: f64,
    /// Minimum increment
    pub increment: f64,
}

impl RangeSetting {
    /// Parse a range characteristic value
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Protocol`] if the value is not six bytes long.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() != 6 {
            return Err(BridgeError::Protocol(format!(
                "Range characteristic must be 6 bytes, got {}",
                data.len()
            )));
        }

        let mut buf = data;
        let minimum = f64::from(buf.get_i16_le()) / 10.0;
        let maximum = f64::from(buf.get_i16_le()) / 10.0;
        let increment = f64::from(buf.get_u16_le()) / 10.0;

        Ok(Self {
            minimum,
            maximum,
            increment,
        })
    }
}

impl fmt::Display for RangeSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.1} .. {:.1} (step {:.1})",
            self.minimum, self.maximum, self.increment
        )
    }
}

/// Encode an incline percentage into the two bytes the KICKR Climb expects
///
/// # Errors
///
/// Returns [`BridgeError::InvalidParameters`] if the percentage is outside
/// [-10, 19] or not a multiple of 0.5.
pub fn encode_incline(percent: f32) -> Result<[u8; 2]> {
    Ok(incline_to_wire(Incline::from_percent(percent)?))
}

/// Decode the two incline bytes back into a percentage
///
/// # Errors
///
/// Returns [`BridgeError::Protocol`] if the bytes are not an encoding the
/// Climb produces.
pub fn decode_incline(wire: [u8; 2]) -> Result<f32> {
    (Incline::MIN.half_steps()..=Incline::MAX.half_steps())
        .filter_map(|steps| Incline::from_half_steps(steps).ok())
        .find(|incline| incline_to_wire(*incline) == wire)
        .map(Incline::percent)
        .ok_or_else(|| {
            BridgeError::Protocol(format!(
                "Unknown incline encoding: {:02x} {:02x}",
                wire[0], wire[1]
            ))
        })
}

/// Stepped incline encoding, `[low, high]`
///
/// Climbing adds [`INCLINE_STEP_UNIT`] per half-percent with a carry into
/// the high byte. Descending borrows a whole block from the high byte and
/// counts down from `0xcf`; five half-steps exhaust a block, the last one
/// landing on `0x00`. This reproduces the values captured from the trainer
/// (`-0.5% = cf ff`, `-5% = 00 fe`, `-10% = 00 fc`).
#[must_use]
pub fn incline_to_wire(incline: Incline) -> [u8; 2] {
    let steps = incline.half_steps();
    let mut low: u16 = 0;
    let mut high: u8 = 0;

    if steps >= 0 {
        for _ in 0..steps {
            low += INCLINE_STEP_UNIT;
            if low >= 256 {
                low -= 256;
                high = high.wrapping_add(1);
            }
        }
    } else {
        for _ in 0..steps.unsigned_abs() {
            if low == 0 {
                high = high.wrapping_sub(1);
                low = 256 - INCLINE_STEP_UNIT + 1;
            } else if low < 2 * INCLINE_STEP_UNIT {
                low = 0;
            } else {
                low -= INCLINE_STEP_UNIT;
            }
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    [low as u8, high]
}

/// Build the vendor incline write: op code followed by the two incline bytes
#[must_use]
pub fn incline_command(incline: Incline) -> Bytes {
    let mut buf = BytesMut::with_capacity(3);
    buf.put_u8(INCLINE_SET_TARGET_OP_CODE);
    buf.extend_from_slice(&incline_to_wire(incline));
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_err;

    #[test]
    fn test_control_point_serialization() {
        assert_eq!(&ControlPointMessage::request_control().to_bytes()[..], &[0x00]);
        assert_eq!(&ControlPointMessage::reset().to_bytes()[..], &[0x01]);
        assert_eq!(
            &ControlPointMessage::set_target_resistance_level(50).to_bytes()[..],
            &[0x04, 50]
        );
    }

    #[test]
    fn test_op_code_from_u8() {
        assert_eq!(ControlOpCode::from_u8(0x00), Some(ControlOpCode::RequestControl));
        assert_eq!(
            ControlOpCode::from_u8(0x04),
            Some(ControlOpCode::SetTargetResistanceLevel)
        );
        assert_eq!(ControlOpCode::from_u8(0x80), Some(ControlOpCode::ResponseCode));
        assert_eq!(ControlOpCode::from_u8(0x15), None);
    }

    #[test]
    fn test_control_point_response() {
        let response = ControlPointResponse::from_bytes(&[0x80, 0x04, 0x01]).unwrap();
        assert_eq!(response.request(), Some(ControlOpCode::SetTargetResistanceLevel));
        assert!(response.is_success());

        let rejected = ControlPointResponse::from_bytes(&[0x80, 0x00, 0x05]).unwrap();
        assert_eq!(rejected.result, ResultCode::ControlNotPermitted);
        assert!(!rejected.is_success());

        assert_err!(ControlPointResponse::from_bytes(&[0x80, 0x04]));
        assert_err!(ControlPointResponse::from_bytes(&[0x04, 0x04, 0x01]));
    }

    #[test]
    fn test_range_setting() {
        // -10.0% .. 19.0% in 0.5% steps
        let data = [0x9C, 0xFF, 0xBE, 0x00, 0x05, 0x00];
        let range = RangeSetting::from_bytes(&data).unwrap();
        assert!((range.minimum + 10.0).abs() < 1e-9);
        assert!((range.maximum - 19.0).abs() < 1e-9);
        assert!((range.increment - 0.5).abs() < 1e-9);

        assert_err!(RangeSetting::from_bytes(&data[..4]));
    }

    #[test]
    fn test_encode_incline_captured_values() {
        let vectors: [(f32, [u8; 2]); 9] = [
            (0.0, [0x00, 0x00]),
            (0.5, [0x32, 0x00]),
            (1.0, [0x64, 0x00]),
            (10.0, [0xe8, 0x03]),
            (19.0, [0x6c, 0x07]),
            (-0.5, [0xcf, 0xff]),
            (-1.0, [0x9d, 0xff]),
            (-5.0, [0x00, 0xfe]),
            (-10.0, [0x00, 0xfc]),
        ];

        for (percent, expected) in vectors {
            assert_eq!(
                encode_incline(percent).unwrap(),
                expected,
                "encoding of {percent}%"
            );
        }
    }

    #[test]
    fn test_encode_incline_rejects_invalid() {
        assert!(matches!(
            encode_incline(25.0),
            Err(BridgeError::InvalidParameters(_))
        ));
        assert!(matches!(
            encode_incline(-20.0),
            Err(BridgeError::InvalidParameters(_))
        ));
        assert!(matches!(
            encode_incline(1.25),
            Err(BridgeError::InvalidParameters(_))
        ));
    }

    #[test]
    fn test_decode_incline() {
        assert!((decode_incline([0x6c, 0x07]).unwrap() - 19.0).abs() < f32::EPSILON);
        assert!((decode_incline([0x00, 0xfe]).unwrap() + 5.0).abs() < f32::EPSILON);
        assert!((decode_incline([0x9d, 0xff]).unwrap() + 1.0).abs() < f32::EPSILON);
        assert_err!(decode_incline([0x01, 0x00]));
    }

    #[test]
    fn test_incline_encoding_is_unique() {
        let mut seen = std::collections::HashSet::new();
        for steps in Incline::MIN.half_steps()..=Incline::MAX.half_steps() {
            let wire = incline_to_wire(Incline::from_half_steps(steps).unwrap());
            assert!(seen.insert(wire), "duplicate encoding for {steps} half-steps");
        }
    }

    #[test]
    fn test_incline_command() {
        let command = incline_command(Incline::MAX);
        assert_eq!(&command[..], &[0x66, 0x6c, 0x07]);
    }
}
