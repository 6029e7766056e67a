use bytes::Buf;
use tracing::debug;

use crate::{
    error::{BridgeError, Result},
    types::TelemetryRecord,
};

/// Consecutive zero-speed samples after which publication stops
pub const IDLE_SAMPLE_THRESHOLD: u32 = 10;

/// Sentinel for an unavailable 16-bit expended energy field
const ENERGY_UNAVAILABLE_U16: u16 = 0xFFFF;

/// Sentinel for an unavailable per-minute expended energy field
const ENERGY_UNAVAILABLE_U8: u8 = 0xFF;

/// Flags field at the start of every Indoor Bike Data notification
///
/// Bit 0 ("more data") has inverted sense: when it is clear, instantaneous
/// speed is present. All other bits mark their field as present when set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndoorBikeDataFlags(u16);

impl IndoorBikeDataFlags {
    /// More data; instantaneous speed is present when this bit is clear
    pub const MORE_DATA: u16 = 1 << 0;
    /// Average speed present
    pub const AVERAGE_SPEED: u16 = 1 << 1;
    /// Instantaneous cadence present
    pub const INSTANTANEOUS_CADENCE: u16 = 1 << 2;
    /// Average cadence present
    pub const AVERAGE_CADENCE: u16 = 1 << 3;
    /// Total distance present
    pub const TOTAL_DISTANCE: u16 = 1 << 4;
    /// Resistance level present
    pub const RESISTANCE_LEVEL: u16 = 1 << 5;
    /// Instantaneous power present
    pub const INSTANTANEOUS_POWER: u16 = 1 << 6;
    /// Average power present
    pub const AVERAGE_POWER: u16 = 1 << 7;
    /// Expended energy present
    pub const EXPENDED_ENERGY: u16 = 1 << 8;
    /// Heart rate present
    pub const HEART_RATE: u16 = 1 << 9;
    /// Metabolic equivalent present
    pub const METABOLIC_EQUIVALENT: u16 = 1 << 10;
    /// Elapsed time present
    pub const ELAPSED_TIME: u16 = 1 << 11;
    /// Remaining time present
    pub const REMAINING_TIME: u16 = 1 << 12;

    /// Wrap a raw flags value
    #[must_use]
    pub const fn new(bits: u16) -> Self {
        Self(bits)
    }

    /// Raw flags value
    #[must_use]
    pub const fn bits(self) -> u16 {
        self.0
    }

    const fn has(self, flag: u16) -> bool {
        self.0 & flag != 0
    }

    /// Instantaneous speed is present (bit 0 clear)
    #[must_use]
    pub const fn instantaneous_speed(self) -> bool {
        !self.has(Self::MORE_DATA)
    }

    /// Number of payload bytes, including the flags, the set fields occupy
    #[must_use]
    pub const fn payload_len(self) -> usize {
        let mut len = 2;
        if self.instantaneous_speed() {
            len += 2;
        }
        if self.has(Self::AVERAGE_SPEED) {
            len += 2;
        }
        if self.has(Self::INSTANTANEOUS_CADENCE) {
            len += 2;
        }
        if self.has(Self::AVERAGE_CADENCE) {
            len += 2;
        }
        if self.has(Self::TOTAL_DISTANCE) {
            len += 3;
        }
        if self.has(Self::RESISTANCE_LEVEL) {
            len += 2;
        }
        if self.has(Self::INSTANTANEOUS_POWER) {
            len += 2;
        }
        if self.has(Self::AVERAGE_POWER) {
            len += 2;
        }
        if self.has(Self::EXPENDED_ENERGY) {
            len += 5;
        }
        if self.has(Self::HEART_RATE) {
            len += 1;
        }
        if self.has(Self::METABOLIC_EQUIVALENT) {
            len += 1;
        }
        if self.has(Self::ELAPSED_TIME) {
            len += 2;
        }
        if self.has(Self::REMAINING_TIME) {
            len += 2;
        }
        len
    }
}

/// Speed field: 0.01 km/h units, reported in m/s
fn read_speed(buf: &mut &[u8]) -> f64 {
    f64::from(buf.get_u16_le()) / 100.0 * 5.0 / 18.0
}

/// Cadence field: 0.5 rpm units
fn read_cadence(buf: &mut &[u8]) -> f64 {
    f64::from(buf.get_u16_le()) / 10.0
}

fn read_u24_le(buf: &mut &[u8]) -> u32 {
    let low = u32::from(buf.get_u16_le());
    let high = u32::from(buf.get_u8());
    (high << 16) | low
}

/// Parse an Indoor Bike Data notification
///
/// The payload is a little-endian flags word followed by the fields the flags
/// announce, in fixed order. The payload length must equal exactly what the
/// flags imply.
///
/// # Errors
///
/// Returns [`BridgeError::PayloadLength`] when the payload is shorter than the
/// flags word or its length does not match the flagged fields.
pub fn parse_indoor_bike_data(data: &[u8]) -> Result<TelemetryRecord> {
    if data.len() < 2 {
        return Err(BridgeError::PayloadLength {
            expected: 2,
            actual: data.len(),
        });
    }

    let mut buf = data;
    let flags = IndoorBikeDataFlags::new(buf.get_u16_le());

    let expected = flags.payload_len();
    if expected != data.len() {
        return Err(BridgeError::PayloadLength {
            expected,
            actual: data.len(),
        });
    }

    let mut record = TelemetryRecord::default();

    if flags.instantaneous_speed() {
        record.instantaneous_speed = Some(read_speed(&mut buf));
    }
    if flags.has(IndoorBikeDataFlags::AVERAGE_SPEED) {
        record.average_speed = Some(read_speed(&mut buf));
    }
    if flags.has(IndoorBikeDataFlags::INSTANTANEOUS_CADENCE) {
        record.instantaneous_cadence = Some(read_cadence(&mut buf));
    }
    if flags.has(IndoorBikeDataFlags::AVERAGE_CADENCE) {
        record.average_cadence = Some(read_cadence(&mut buf));
    }
    if flags.has(IndoorBikeDataFlags::TOTAL_DISTANCE) {
        record.total_distance = Some(read_u24_le(&mut buf));
    }
    if flags.has(IndoorBikeDataFlags::RESISTANCE_LEVEL) {
        record.resistance_level = Some(buf.get_u16_le());
    }
    if flags.has(IndoorBikeDataFlags::INSTANTANEOUS_POWER) {
        record.instantaneous_power = Some(buf.get_u16_le());
    }
    if flags.has(IndoorBikeDataFlags::AVERAGE_POWER) {
        record.average_power = Some(buf.get_u16_le());
    }
    if flags.has(IndoorBikeDataFlags::EXPENDED_ENERGY) {
        let total = buf.get_u16_le();
        let per_hour = buf.get_u16_le();
        let per_minute = buf.get_u8();
        record.expended_energy_total = (total != ENERGY_UNAVAILABLE_U16).then_some(total);
        record.expended_energy_per_hour =
            (per_hour != ENERGY_UNAVAILABLE_U16).then_some(per_hour);
        record.expended_energy_per_minute =
            (per_minute != ENERGY_UNAVAILABLE_U8).then_some(per_minute);
    }
    if flags.has(IndoorBikeDataFlags::HEART_RATE) {
        record.heart_rate = Some(buf.get_u8());
    }
    if flags.has(IndoorBikeDataFlags::METABOLIC_EQUIVALENT) {
        record.metabolic_equivalent = Some(f64::from(buf.get_u8()) / 10.0);
    }
    if flags.has(IndoorBikeDataFlags::ELAPSED_TIME) {
        record.elapsed_time = Some(buf.get_u16_le());
    }
    if flags.has(IndoorBikeDataFlags::REMAINING_TIME) {
        record.remaining_time = Some(buf.get_u16_le());
    }

    debug!("Decoded indoor bike data: {:?}", record);
    Ok(record)
}

/// Zero-streak suppression of idle telemetry
///
/// Samples are published until [`IDLE_SAMPLE_THRESHOLD`] consecutive samples
/// report a speed of exactly zero. Publication then stops until a sample with
/// a positive speed arrives, which is published and restarts the count.
#[derive(Debug, Clone, Default)]
pub struct IdleFilter {
    zero_streak_count: u32,
}

impl IdleFilter {
    /// Create a filter with an empty streak
    #[must_use]
    pub const fn new() -> Self {
        Self {
            zero_streak_count: 0,
        }
    }

    /// Current number of consecutive zero-speed samples
    #[must_use]
    pub const fn zero_streak_count(&self) -> u32 {
        self.zero_streak_count
    }

    /// Check whether the bike is considered idle
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        self.zero_streak_count >= IDLE_SAMPLE_THRESHOLD
    }

    /// Feed one sample; returns whether it should be published
    pub fn should_publish(&mut self, record: &TelemetryRecord) -> bool {
        let speed = record.instantaneous_speed;

        if self.is_idle() {
            if speed.is_some_and(|s| s > 0.0) {
                self.zero_streak_count = 0;
                return true;
            }
            debug!("Bike currently idle, telemetry not published");
            return false;
        }

        if speed == Some(0.0) {
            self.zero_streak_count += 1;
        } else {
            self.zero_streak_count = 0;
        }
        true
    }
}
