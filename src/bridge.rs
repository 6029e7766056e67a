//! [`BridgeAdapter`] translates between MQTT and the session: it validates
//! inbound command payloads and turns [`Report`]s into JSON envelopes on the
//! right topics. [`SessionDriver`] runs a [`DeviceSession`] against a live
//! (or mocked) GATT client and publisher.

use bytes::Bytes;
use futures::{future::BoxFuture, stream::FuturesUnordered, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::{sync::mpsc, time::timeout};
use tracing::{debug, info, warn};

use crate::{
    ble::GattClient,
    config::Topics,
    error::{BridgeError, Result},
    mqtt::{InboundMessage, Publisher},
    protocol::RangeSetting,
    session::{BleEvent, DeviceSession, RangeKind, Report, SessionAction},
    types::{
        Channel, Command, Incline, TimeoutConfig, INCLINE_MAX, INCLINE_MIN, RESISTANCE_MAX,
        RESISTANCE_MIN,
    },
};

/// Unit names used in report envelopes
pub mod units {
    /// Speed
    pub const SPEED: &str = "m/s";
    /// Cadence
    pub const CADENCE: &str = "RPM";
    /// Power
    pub const POWER: &str = "W";
    /// Heart rate
    pub const HEART_RATE: &str = "BPM";
    /// Resistance
    pub const RESISTANCE: &str = "percentage";
    /// Incline
    pub const INCLINE: &str = "degree";
}

/// What to do with an inbound MQTT message
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    /// A valid command for the session
    Dispatch(Command),
    /// Out of range; report `message` and discard
    Rejected {
        /// Channel of the command topic
        channel: Channel,
        /// Message naming the value and the valid range
        message: String,
    },
    /// Not a command; logged and discarded
    Dropped,
}

#[derive(Serialize)]
struct Metadata<'a> {
    #[serde(rename = "deviceName")]
    device_name: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<'a> {
    value: Value,
    unit_name: &'a str,
    timestamp: f64,
    metadata: Metadata<'a>,
}

fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Whole-percent inclines are reported as integers
fn incline_value(incline: Incline) -> Value {
    let steps = incline.half_steps();
    if steps % 2 == 0 {
        Value::from(steps / 2)
    } else {
        Value::from(f64::from(incline.percent()))
    }
}

/// Maps MQTT topics and payloads to session commands and reports
#[derive(Debug, Clone)]
pub struct BridgeAdapter {
    topics: Topics,
    device_name: String,
}

impl BridgeAdapter {
    /// Create an adapter for a topic set and host identifier
    #[must_use]
    pub fn new(topics: Topics, device_name: impl Into<String>) -> Self {
        Self {
            topics,
            device_name: device_name.into(),
        }
    }

    /// Topic mapping in use
    #[must_use]
    pub const fn topics(&self) -> &Topics {
        &self.topics
    }

    /// Validate an inbound message
    ///
    /// The payload must be a signed decimal integer. Out-of-range values
    /// are rejected with a message for the channel's report topic.
    #[must_use]
    pub fn parse_command(&self, topic: &str, payload: &[u8]) -> CommandOutcome {
        let channel = if topic == self.topics.resistance_command {
            Channel::Resistance
        } else if topic == self.topics.incline_command {
            Channel::Incline
        } else {
            warn!("The command topic is not identified: {}", topic);
            return CommandOutcome::Dropped;
        };

        let text = String::from_utf8_lossy(payload);
        info!("MQTT message received for topic '{}': {}", topic, text);

        let Ok(value) = text.trim().parse::<i64>() else {
            warn!("Skip the invalid command payload: {}", text);
            return CommandOutcome::Dropped;
        };

        match channel {
            Channel::Resistance => match u8::try_from(value) {
                Ok(level) if level <= RESISTANCE_MAX => {
                    CommandOutcome::Dispatch(Command::SetResistance(level))
                }
                _ => CommandOutcome::Rejected {
                    channel,
                    message: format!(
                        "Skip invalid resistance value: {value} (the range has to be: {RESISTANCE_MIN} - {RESISTANCE_MAX})"
                    ),
                },
            },
            Channel::Incline => {
                let incline = i16::try_from(value)
                    .ok()
                    .filter(|v| (INCLINE_MIN..=INCLINE_MAX).contains(v))
                    .and_then(|v| Incline::from_percent(f32::from(v)).ok());
                incline.map_or_else(
                    || CommandOutcome::Rejected {
                        channel,
                        message: format!(
                            "Skip invalid incline value: {value} (the range has to be: {INCLINE_MIN}% - {INCLINE_MAX}%)"
                        ),
                    },
                    |incline| CommandOutcome::Dispatch(Command::SetIncline(incline)),
                )
            }
        }
    }

    /// Serialize a report envelope
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Json`] if serialization fails.
    pub fn envelope(&self, value: Value, unit_name: &str) -> Result<String> {
        let envelope = Envelope {
            value,
            unit_name,
            timestamp: unix_timestamp(),
            metadata: Metadata {
                device_name: &self.device_name,
            },
        };
        Ok(serde_json::to_string(&envelope)?)
    }

    fn report_topic(&self, channel: Channel) -> (&str, &'static str) {
        match channel {
            Channel::Resistance => (&self.topics.resistance_report, units::RESISTANCE),
            Channel::Incline => (&self.topics.incline_report, units::INCLINE),
        }
    }

    /// Topic and payload pairs to publish for a report
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Json`] if serialization fails.
    pub fn publications(&self, report: &Report) -> Result<Vec<(String, String)>> {
        let mut out = Vec::new();
        match report {
            Report::Resistance(level) => {
                let (topic, unit) = self.report_topic(Channel::Resistance);
                out.push((topic.to_string(), self.envelope(Value::from(*level), unit)?));
            }
            Report::Incline(incline) => {
                let (topic, unit) = self.report_topic(Channel::Incline);
                out.push((topic.to_string(), self.envelope(incline_value(*incline), unit)?));
            }
            Report::Rejected { channel, message } => {
                let (topic, unit) = self.report_topic(*channel);
                out.push((
                    topic.to_string(),
                    self.envelope(Value::from(message.as_str()), unit)?,
                ));
            }
            Report::Telemetry(record) => {
                if let Some(speed) = record.instantaneous_speed {
                    out.push((
                        self.topics.speed_report.clone(),
                        self.envelope(Value::from(speed), units::SPEED)?,
                    ));
                }
                if let Some(cadence) = record.instantaneous_cadence {
                    out.push((
                        self.topics.cadence_report.clone(),
                        self.envelope(Value::from(cadence), units::CADENCE)?,
                    ));
                }
                if let Some(power) = record.instantaneous_power {
                    out.push((
                        self.topics.power_report.clone(),
                        self.envelope(Value::from(power), units::POWER)?,
                    ));
                }
                if let (Some(topic), Some(heart_rate)) =
                    (&self.topics.heart_rate_report, record.heart_rate)
                {
                    out.push((
                        topic.clone(),
                        self.envelope(Value::from(heart_rate), units::HEART_RATE)?,
                    ));
                }
            }
        }
        Ok(out)
    }
}

/// Runs a [`DeviceSession`] against a GATT client and an MQTT publisher
pub struct SessionDriver<'a> {
    gatt: &'a dyn GattClient,
    publisher: &'a dyn Publisher,
    adapter: &'a BridgeAdapter,
    timeouts: &'a TimeoutConfig,
}

impl<'a> SessionDriver<'a> {
    /// Create a driver
    #[must_use]
    pub fn new(
        gatt: &'a dyn GattClient,
        publisher: &'a dyn Publisher,
        adapter: &'a BridgeAdapter,
        timeouts: &'a TimeoutConfig,
    ) -> Self {
        Self {
            gatt,
            publisher,
            adapter,
            timeouts,
        }
    }

    /// Process BLE events and MQTT commands until the session ends
    ///
    /// MQTT commands are only read once the session has started its reset
    /// sequence; until then they stay buffered in `inbound`. GATT writes run
    /// alongside event handling, so notifications keep flowing while a write
    /// waits for its acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns the connection-level error that ended the session, or
    /// [`BridgeError::Disconnected`] if the BLE event source goes away.
    pub async fn run(
        &self,
        session: &mut DeviceSession,
        events: &mut mpsc::UnboundedReceiver<BleEvent>,
        inbound: &mut mpsc::UnboundedReceiver<InboundMessage>,
    ) -> Result<()> {
        let mut accepting = false;
        let mut writes: FuturesUnordered<BoxFuture<'a, BleEvent>> = FuturesUnordered::new();

        loop {
            let actions = tokio::select! {
                biased;

                Some(event) = writes.next(), if !writes.is_empty() => session.handle(event)?,
                message = inbound.recv(), if accepting => match message {
                    Some(message) => self.dispatch(session, &message)?,
                    None => {
                        warn!("MQTT inbound channel closed, no longer accepting commands");
                        accepting = false;
                        continue;
                    }
                },
                event = events.recv() => {
                    let event = event.ok_or(BridgeError::Disconnected)?;
                    session.handle(event)?
                }
            };

            self.execute(actions, &mut writes, &mut accepting).await;
        }
    }

    fn dispatch(
        &self,
        session: &mut DeviceSession,
        message: &InboundMessage,
    ) -> Result<Vec<SessionAction>> {
        match self.adapter.parse_command(&message.topic, &message.payload) {
            CommandOutcome::Dispatch(command) => match session.submit(command) {
                Ok(actions) => Ok(actions),
                Err(e) if e.is_recoverable() => {
                    warn!("Command {} not accepted: {}", command, e);
                    Ok(Vec::new())
                }
                Err(e) => Err(e),
            },
            CommandOutcome::Rejected { channel, message } => {
                warn!("{}", message);
                Ok(vec![SessionAction::Report(Report::Rejected {
                    channel,
                    message,
                })])
            }
            CommandOutcome::Dropped => Ok(Vec::new()),
        }
    }

    /// Carry out actions; writes are handed to `writes` and complete as events
    async fn execute(
        &self,
        actions: Vec<SessionAction>,
        writes: &mut FuturesUnordered<BoxFuture<'a, BleEvent>>,
        accepting: &mut bool,
    ) {
        for action in actions {
            match action {
                SessionAction::Write {
                    characteristic,
                    payload,
                } => writes.push(self.write(characteristic, payload)),
                SessionAction::Subscribe { characteristic } => {
                    let limit = self.timeouts.subscribe_timeout_ms;
                    match timeout(
                        Duration::from_millis(limit),
                        self.gatt.subscribe(characteristic),
                    )
                    .await
                    {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            warn!("Cannot enable notification for {}: {}", characteristic, e);
                        }
                        Err(_) => warn!(
                            "Enabling notification for {} timed out after {}ms",
                            characteristic, limit
                        ),
                    }
                }
                SessionAction::ReadRange {
                    kind,
                    characteristic,
                } => self.read_range(kind, characteristic).await,
                SessionAction::Report(report) => self.publish(&report).await,
                SessionAction::AcceptCommands => {
                    info!("Accepting commands on MQTT");
                    *accepting = true;
                }
            }
        }
    }

    /// Write with response, resolving to the matching completion event
    fn write(&self, characteristic: uuid::Uuid, payload: Bytes) -> BoxFuture<'a, BleEvent> {
        let gatt = self.gatt;
        let limit = self.timeouts.write_ack_timeout_ms;

        Box::pin(async move {
            match timeout(
                Duration::from_millis(limit),
                gatt.write(characteristic, &payload),
            )
            .await
            {
                Ok(Ok(())) => BleEvent::WriteSucceeded {
                    uuid: characteristic,
                },
                Ok(Err(e)) => BleEvent::WriteFailed {
                    uuid: characteristic,
                    error: e.to_string(),
                },
                Err(_) => BleEvent::WriteFailed {
                    uuid: characteristic,
                    error: format!("no acknowledgement within {limit}ms"),
                },
            }
        })
    }

    async fn read_range(&self, kind: RangeKind, characteristic: uuid::Uuid) {
        let name = match kind {
            RangeKind::Resistance => "resistance level",
            RangeKind::Inclination => "inclination",
        };

        let limit = Duration::from_millis(self.timeouts.read_timeout_ms);
        match timeout(limit, self.gatt.read(characteristic)).await {
            Ok(Ok(value)) => match RangeSetting::from_bytes(&value) {
                Ok(range) => info!("Supported {} range: {}", name, range),
                Err(e) => warn!("Unreadable {} range {:02X?}: {}", name, value, e),
            },
            Ok(Err(e)) => warn!("Failed to read {} range: {}", name, e),
            Err(_) => warn!("Reading {} range timed out", name),
        }
    }

    async fn publish(&self, report: &Report) {
        let publications = match self.adapter.publications(report) {
            Ok(publications) => publications,
            Err(e) => {
                warn!("Failed to encode report {:?}: {}", report, e);
                return;
            }
        };

        for (topic, payload) in publications {
            if let Err(e) = self.publisher.publish(&topic, payload).await {
                warn!("Failed to publish to {}: {}", topic, e);
            } else {
                debug!("Published to {}", topic);
            }
        }
    }
}
