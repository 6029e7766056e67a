//! [`DeviceSession`] owns everything known about one trainer connection: the
//! discovered characteristic handles, the confirmed and pending control
//! values, the queue of commands waiting for the write sequencer and the idle
//! filter for telemetry. It performs no I/O. The BLE adapter feeds it
//! [`BleEvent`]s and carries out the [`SessionAction`]s it returns.

use bytes::Bytes;
use std::collections::VecDeque;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{BridgeError, Result},
    protocol::{
        decode_incline, incline_command, ControlPointMessage, ControlPointResponse,
        INCLINE_SET_TARGET_OP_CODE,
    },
    telemetry::{parse_indoor_bike_data, IdleFilter},
    types::{Channel, Command, Incline, SessionState, TelemetryRecord},
    FTMS_CONTROL_POINT_UUID, FTMS_SERVICE_UUID, INCLINATION_RANGE_UUID,
    INCLINE_CONTROL_CHARACTERISTIC_UUID, INCLINE_CONTROL_SERVICE_UUID, INDOOR_BIKE_DATA_UUID,
    RESISTANCE_LEVEL_RANGE_UUID,
};

/// A GATT service as reported by discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    /// Service UUID
    pub uuid: Uuid,
    /// UUIDs of the characteristics the service exposes
    pub characteristics: Vec<Uuid>,
}

/// Events delivered by the BLE adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BleEvent {
    /// The BLE connection was established
    Connected,
    /// The BLE connection could not be established
    ConnectFailed {
        /// Adapter-provided reason
        reason: String,
    },
    /// Service discovery finished
    ServicesResolved {
        /// Every service found on the device
        services: Vec<DiscoveredService>,
    },
    /// A notification or indication arrived
    CharacteristicUpdated {
        /// Characteristic that changed
        uuid: Uuid,
        /// New value
        value: Vec<u8>,
    },
    /// A write was acknowledged by the device
    WriteSucceeded {
        /// Characteristic that was written
        uuid: Uuid,
    },
    /// A write was rejected or never acknowledged
    WriteFailed {
        /// Characteristic that was written
        uuid: Uuid,
        /// Failure description
        error: String,
    },
    /// The device went away
    Disconnected,
}

/// Range characteristic to read after discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeKind {
    /// Supported resistance level range
    Resistance,
    /// Supported inclination range
    Inclination,
}

/// Something the session wants reported on MQTT
#[derive(Debug, Clone, PartialEq)]
pub enum Report {
    /// Resistance level confirmed by the device
    Resistance(u8),
    /// Incline confirmed by the device
    Incline(Incline),
    /// A command was refused or failed
    Rejected {
        /// Channel the command targeted
        channel: Channel,
        /// Human-readable reason
        message: String,
    },
    /// A telemetry sample passed the idle filter
    Telemetry(TelemetryRecord),
}

/// Work the session asks the BLE adapter or bridge to perform
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    /// Write with response; completion must come back as a write event
    Write {
        /// Target characteristic
        characteristic: Uuid,
        /// Bytes to write
        payload: Bytes,
    },
    /// Enable notifications or indications
    Subscribe {
        /// Target characteristic
        characteristic: Uuid,
    },
    /// Read and log a range characteristic
    ReadRange {
        /// Which range this is
        kind: RangeKind,
        /// Target characteristic
        characteristic: Uuid,
    },
    /// Publish a report
    Report(Report),
    /// Start handling inbound MQTT commands
    AcceptCommands,
}

/// Characteristic handles populated by service discovery
#[derive(Debug, Clone, Default)]
struct CapabilityHandles {
    ftms_service: Option<Uuid>,
    control_point: Option<Uuid>,
    indoor_bike_data: Option<Uuid>,
    resistance_range: Option<Uuid>,
    inclination_range: Option<Uuid>,
    incline_service: Option<Uuid>,
    incline_control: Option<Uuid>,
}

impl CapabilityHandles {
    fn from_services(services: &[DiscoveredService]) -> Self {
        let mut handles = Self::default();

        for service in services {
            if service.uuid == FTMS_SERVICE_UUID {
                handles.ftms_service = Some(service.uuid);
                for &uuid in &service.characteristics {
                    match uuid {
                        FTMS_CONTROL_POINT_UUID => handles.control_point = Some(uuid),
                        INDOOR_BIKE_DATA_UUID => handles.indoor_bike_data = Some(uuid),
                        RESISTANCE_LEVEL_RANGE_UUID => handles.resistance_range = Some(uuid),
                        INCLINATION_RANGE_UUID => handles.inclination_range = Some(uuid),
                        _ => {}
                    }
                }
            } else if service.uuid == INCLINE_CONTROL_SERVICE_UUID {
                handles.incline_service = Some(service.uuid);
                if service
                    .characteristics
                    .contains(&INCLINE_CONTROL_CHARACTERISTIC_UUID)
                {
                    handles.incline_control = Some(INCLINE_CONTROL_CHARACTERISTIC_UUID);
                }
            }
        }

        handles
    }

    fn missing(&self) -> Vec<&'static str> {
        let required = [
            (self.ftms_service, "fitness machine service"),
            (self.control_point, "fitness machine control point"),
            (self.indoor_bike_data, "indoor bike data"),
            (self.incline_service, "incline control service"),
            (self.incline_control, "incline control characteristic"),
        ];

        required
            .into_iter()
            .filter_map(|(handle, name)| handle.is_none().then_some(name))
            .collect()
    }
}

/// Commands that may wait behind the one in flight
pub const MAX_QUEUED_COMMANDS: usize = 16;

/// Commands queued by the reset sequence
const RESET_COMMANDS: usize = 3;

/// State of one trainer connection
#[derive(Debug)]
pub struct DeviceSession {
    address: String,
    state: SessionState,
    handles: CapabilityHandles,
    resistance_level: u8,
    inclination: Incline,
    pending_resistance: Option<u8>,
    pending_inclination: Option<Incline>,
    queue: VecDeque<Command>,
    /// Reset commands not yet resolved
    resetting: usize,
    idle: IdleFilter,
}

impl DeviceSession {
    /// Create a disconnected session for the device at `address`
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            state: SessionState::Disconnected,
            handles: CapabilityHandles::default(),
            resistance_level: 0,
            inclination: Incline::FLAT,
            pending_resistance: None,
            pending_inclination: None,
            queue: VecDeque::new(),
            resetting: 0,
            idle: IdleFilter::new(),
        }
    }

    /// MAC address of the device
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Current lifecycle state
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Last resistance level the device acknowledged
    #[must_use]
    pub const fn resistance_level(&self) -> u8 {
        self.resistance_level
    }

    /// Last incline the device acknowledged
    #[must_use]
    pub const fn inclination(&self) -> Incline {
        self.inclination
    }

    /// Resistance level written but not yet acknowledged
    #[must_use]
    pub const fn pending_resistance(&self) -> Option<u8> {
        self.pending_resistance
    }

    /// Incline written but not yet acknowledged
    #[must_use]
    pub const fn pending_inclination(&self) -> Option<Incline> {
        self.pending_inclination
    }

    /// Number of commands waiting behind the one in flight
    #[must_use]
    pub fn queued_commands(&self) -> usize {
        self.queue.len()
    }

    /// Consecutive zero-speed samples seen so far
    #[must_use]
    pub const fn zero_streak_count(&self) -> u32 {
        self.idle.zero_streak_count()
    }

    /// Mark the start of a connection attempt
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NotReady`] if the session is not disconnected.
    pub fn begin_connect(&mut self) -> Result<()> {
        if self.state != SessionState::Disconnected {
            return Err(BridgeError::NotReady {
                reason: format!("cannot connect while {}", self.state),
            });
        }

        info!("[{}] Connecting", self.address);
        self.state = SessionState::Connecting;
        Ok(())
    }

    /// Queue a command for the device
    ///
    /// Commands run one at a time in arrival order. A command submitted while
    /// another is awaiting acknowledgement waits in the queue and no write is
    /// issued for it until the earlier one resolves. Once
    /// [`MAX_QUEUED_COMMANDS`] are waiting, further commands are rejected
    /// with a report on their channel.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NotReady`] before discovery has completed.
    pub fn submit(&mut self, command: Command) -> Result<Vec<SessionAction>> {
        match self.state {
            SessionState::Disconnected | SessionState::Connecting | SessionState::Discovering => {
                Err(BridgeError::NotReady {
                    reason: format!("cannot accept {command} while {}", self.state),
                })
            }
            SessionState::Ready => {
                self.queue.push_back(command);
                Ok(self.start_next())
            }
            SessionState::AwaitingControlAck(_) | SessionState::AwaitingValueAck(_)
                if self.queue.len() >= MAX_QUEUED_COMMANDS =>
            {
                warn!(
                    "[{}] Skipping {}: {} commands already queued",
                    self.address,
                    command,
                    self.queue.len()
                );
                Ok(command
                    .channel()
                    .map(|channel| {
                        SessionAction::Report(Report::Rejected {
                            channel,
                            message: format!(
                                "Skip {command}: {MAX_QUEUED_COMMANDS} commands are already waiting"
                            ),
                        })
                    })
                    .into_iter()
                    .collect())
            }
            SessionState::AwaitingControlAck(_) | SessionState::AwaitingValueAck(_) => {
                debug!(
                    "[{}] Queued {} behind {}",
                    self.address, command, self.state
                );
                self.queue.push_back(command);
                Ok(Vec::new())
            }
        }
    }

    /// Apply an event from the BLE adapter
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::ConnectionFailed`] when the connection attempt
    /// or discovery fails and [`BridgeError::Disconnected`] when the device
    /// goes away. Both end the session; every other problem is handled here.
    pub fn handle(&mut self, event: BleEvent) -> Result<Vec<SessionAction>> {
        match event {
            BleEvent::Connected => {
                if self.state == SessionState::Connecting {
                    info!("[{}] Connected", self.address);
                    self.state = SessionState::Discovering;
                } else {
                    warn!("[{}] Unexpected connect event while {}", self.address, self.state);
                }
                Ok(Vec::new())
            }
            BleEvent::ConnectFailed { reason } => {
                self.reset_to_disconnected();
                Err(BridgeError::ConnectionFailed(reason))
            }
            BleEvent::ServicesResolved { services } => self.on_services_resolved(&services),
            BleEvent::CharacteristicUpdated { uuid, value } => Ok(self.on_update(uuid, &value)),
            BleEvent::WriteSucceeded { uuid } => Ok(self.on_write_succeeded(uuid)),
            BleEvent::WriteFailed { uuid, error } => Ok(self.on_write_failed(uuid, &error)),
            BleEvent::Disconnected => {
                info!("[{}] Disconnected", self.address);
                self.reset_to_disconnected();
                Err(BridgeError::Disconnected)
            }
        }
    }

    fn reset_to_disconnected(&mut self) {
        self.state = SessionState::Disconnected;
        self.handles = CapabilityHandles::default();
        self.pending_resistance = None;
        self.pending_inclination = None;
        self.queue.clear();
        self.resetting = 0;
    }

    fn on_services_resolved(&mut self, services: &[DiscoveredService]) -> Result<Vec<SessionAction>> {
        if self.state != SessionState::Discovering {
            warn!(
                "[{}] Ignoring service discovery while {}",
                self.address, self.state
            );
            return Ok(Vec::new());
        }

        info!("[{}] Resolved services", self.address);
        for service in services {
            info!("[{}]\tService [{}]", self.address, service.uuid);
            for characteristic in &service.characteristics {
                debug!("[{}]\t\tCharacteristic [{}]", self.address, characteristic);
            }
        }

        let handles = CapabilityHandles::from_services(services);
        let missing = handles.missing();
        if !missing.is_empty() {
            self.reset_to_disconnected();
            return Err(BridgeError::ConnectionFailed(format!(
                "device does not expose: {}",
                missing.join(", ")
            )));
        }

        self.handles = handles;
        Ok(self.enter_ready())
    }

    /// Reset sequence run once discovery succeeds
    fn enter_ready(&mut self) -> Vec<SessionAction> {
        self.state = SessionState::Ready;
        self.resistance_level = 0;
        self.inclination = Incline::FLAT;
        self.pending_resistance = None;
        self.pending_inclination = None;
        self.idle = IdleFilter::new();

        let mut actions = Vec::new();
        for characteristic in [
            self.handles.indoor_bike_data,
            self.handles.control_point,
            self.handles.incline_control,
        ]
        .into_iter()
        .flatten()
        {
            actions.push(SessionAction::Subscribe { characteristic });
        }

        if let Some(characteristic) = self.handles.resistance_range {
            actions.push(SessionAction::ReadRange {
                kind: RangeKind::Resistance,
                characteristic,
            });
        }
        if let Some(characteristic) = self.handles.inclination_range {
            actions.push(SessionAction::ReadRange {
                kind: RangeKind::Inclination,
                characteristic,
            });
        }

        self.queue.clear();
        self.queue.extend([
            Command::Reset,
            Command::SetResistance(0),
            Command::SetIncline(Incline::FLAT),
        ]);
        self.resetting = RESET_COMMANDS;
        actions.extend(self.start_next());
        actions.push(SessionAction::AcceptCommands);

        info!("[{}] Ready, resetting control settings", self.address);
        actions
    }

    /// Start the next queued command if nothing is in flight
    fn start_next(&mut self) -> Vec<SessionAction> {
        if self.state != SessionState::Ready {
            return Vec::new();
        }
        let Some(command) = self.queue.pop_front() else {
            return Vec::new();
        };
        let (Some(control_point), Some(incline_control)) =
            (self.handles.control_point, self.handles.incline_control)
        else {
            warn!("[{}] Dropping {}: handles missing", self.address, command);
            return Vec::new();
        };

        debug!("[{}] Starting {}", self.address, command);
        match command {
            Command::Reset | Command::SetResistance(_) => {
                self.state = SessionState::AwaitingControlAck(command);
                vec![SessionAction::Write {
                    characteristic: control_point,
                    payload: ControlPointMessage::request_control().to_bytes(),
                }]
            }
            Command::SetIncline(incline) => {
                self.pending_inclination = Some(incline);
                self.state = SessionState::AwaitingValueAck(command);
                vec![SessionAction::Write {
                    characteristic: incline_control,
                    payload: incline_command(incline),
                }]
            }
        }
    }

    /// Characteristic the in-flight command is waiting on
    fn awaited_characteristic(&self, command: Command) -> Option<Uuid> {
        match command {
            Command::Reset | Command::SetResistance(_) => self.handles.control_point,
            Command::SetIncline(_) => self.handles.incline_control,
        }
    }

    fn on_write_succeeded(&mut self, uuid: Uuid) -> Vec<SessionAction> {
        debug!("[{}] Write to {} acknowledged", self.address, uuid);

        match self.state {
            SessionState::AwaitingControlAck(command)
                if self.awaited_characteristic(command) == Some(uuid) =>
            {
                let payload = match command {
                    Command::Reset => ControlPointMessage::reset().to_bytes(),
                    Command::SetResistance(level) => {
                        self.pending_resistance = Some(level);
                        ControlPointMessage::set_target_resistance_level(level).to_bytes()
                    }
                    Command::SetIncline(_) => {
                        warn!("[{}] Incline commands do not request control", self.address);
                        return Vec::new();
                    }
                };
                self.state = SessionState::AwaitingValueAck(command);
                vec![SessionAction::Write {
                    characteristic: uuid,
                    payload,
                }]
            }
            SessionState::AwaitingValueAck(command)
                if self.awaited_characteristic(command) == Some(uuid) =>
            {
                self.resolve_command();
                let mut actions = Vec::new();
                match command {
                    Command::Reset => info!("[{}] Control settings reset", self.address),
                    Command::SetResistance(_) => {
                        if let Some(level) = self.pending_resistance.take() {
                            self.resistance_level = level;
                            info!("[{}] Resistance set to {}", self.address, level);
                            actions.push(SessionAction::Report(Report::Resistance(level)));
                        }
                    }
                    Command::SetIncline(_) => {
                        if let Some(incline) = self.pending_inclination.take() {
                            self.inclination = incline;
                            info!("[{}] Incline set to {}", self.address, incline);
                            actions.push(SessionAction::Report(Report::Incline(incline)));
                        }
                    }
                }
                self.state = SessionState::Ready;
                actions.extend(self.start_next());
                actions
            }
            _ => {
                debug!(
                    "[{}] Write acknowledgement for {} while {}",
                    self.address, uuid, self.state
                );
                Vec::new()
            }
        }
    }

    /// Count one command as resolved; true if it belonged to the reset sequence
    fn resolve_command(&mut self) -> bool {
        let resetting = self.resetting > 0;
        self.resetting = self.resetting.saturating_sub(1);
        resetting
    }

    fn on_write_failed(&mut self, uuid: Uuid, error: &str) -> Vec<SessionAction> {
        let command = match self.state {
            SessionState::AwaitingControlAck(command) | SessionState::AwaitingValueAck(command)
                if self.awaited_characteristic(command) == Some(uuid) =>
            {
                command
            }
            _ => {
                warn!(
                    "[{}] Write to {} failed while {}: {}",
                    self.address, uuid, self.state, error
                );
                return Vec::new();
            }
        };

        warn!("[{}] Failed to apply {}: {}", self.address, command, error);

        // a failed reset write still leaves the forced baseline to report
        let baseline = self.resolve_command();
        let mut actions = Vec::new();
        match command {
            Command::Reset => {}
            Command::SetResistance(level) => {
                self.pending_resistance = None;
                actions.push(SessionAction::Report(Report::Rejected {
                    channel: Channel::Resistance,
                    message: format!("Failed to set resistance to {level}: {error}"),
                }));
                if baseline {
                    actions.push(SessionAction::Report(Report::Resistance(
                        self.resistance_level,
                    )));
                }
            }
            Command::SetIncline(incline) => {
                self.pending_inclination = None;
                actions.push(SessionAction::Report(Report::Rejected {
                    channel: Channel::Incline,
                    message: format!("Failed to set incline to {incline}: {error}"),
                }));
                if baseline {
                    actions.push(SessionAction::Report(Report::Incline(self.inclination)));
                }
            }
        }

        self.state = SessionState::Ready;
        actions.extend(self.start_next());
        actions
    }

    fn on_update(&mut self, uuid: Uuid, value: &[u8]) -> Vec<SessionAction> {
        if matches!(
            self.state,
            SessionState::Disconnected | SessionState::Connecting | SessionState::Discovering
        ) {
            debug!("[{}] Ignoring update from {} while {}", self.address, uuid, self.state);
            return Vec::new();
        }

        if Some(uuid) == self.handles.indoor_bike_data {
            return match parse_indoor_bike_data(value) {
                Ok(record) if self.idle.should_publish(&record) => {
                    vec![SessionAction::Report(Report::Telemetry(record))]
                }
                Ok(_) => Vec::new(),
                Err(e) => {
                    warn!("[{}] Dropping indoor bike data sample: {}", self.address, e);
                    Vec::new()
                }
            };
        }

        if Some(uuid) == self.handles.control_point {
            match ControlPointResponse::from_bytes(value) {
                Ok(response) if response.is_success() => {
                    debug!("[{}] Control point: {:?} succeeded", self.address, response.request());
                }
                Ok(response) => warn!(
                    "[{}] Control point: {:?} returned {}",
                    self.address,
                    response.request(),
                    response.result
                ),
                Err(e) => debug!("[{}] Unrecognized control point indication: {}", self.address, e),
            }
        } else if Some(uuid) == self.handles.incline_control {
            match value {
                [INCLINE_SET_TARGET_OP_CODE, low, high] => match decode_incline([*low, *high]) {
                    Ok(percent) => debug!("[{}] Climb reports incline {}%", self.address, percent),
                    Err(e) => debug!("[{}] {}", self.address, e),
                },
                _ => debug!("[{}] Climb notification {:02X?}", self.address, value),
            }
        } else {
            debug!("[{}] The updated value for {} is {:02X?}", self.address, uuid, value);
        }

        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    const ADDRESS: &str = "F8:8E:4D:4B:D7:6C";

    fn kickr_services() -> Vec<DiscoveredService> {
        vec![
            DiscoveredService {
                uuid: FTMS_SERVICE_UUID,
                characteristics: vec![
                    INDOOR_BIKE_DATA_UUID,
                    FTMS_CONTROL_POINT_UUID,
                    RESISTANCE_LEVEL_RANGE_UUID,
                    INCLINATION_RANGE_UUID,
                ],
            },
            DiscoveredService {
                uuid: INCLINE_CONTROL_SERVICE_UUID,
                characteristics: vec![INCLINE_CONTROL_CHARACTERISTIC_UUID],
            },
        ]
    }

    fn writes(actions: &[SessionAction]) -> Vec<(Uuid, Vec<u8>)> {
        actions
            .iter()
            .filter_map(|action| match action {
                SessionAction::Write {
                    characteristic,
                    payload,
                } => Some((*characteristic, payload.to_vec())),
                _ => None,
            })
            .collect()
    }

    fn reports(actions: &[SessionAction]) -> Vec<Report> {
        actions
            .iter()
            .filter_map(|action| match action {
                SessionAction::Report(report) => Some(report.clone()),
                _ => None,
            })
            .collect()
    }

    fn ack(session: &mut DeviceSession, uuid: Uuid) -> Vec<SessionAction> {
        assert_ok!(session.handle(BleEvent::WriteSucceeded { uuid }))
    }

    /// Connect, discover and acknowledge the whole reset sequence
    fn ready_session() -> DeviceSession {
        let mut session = DeviceSession::new(ADDRESS);
        assert_ok!(session.begin_connect());
        assert_ok!(session.handle(BleEvent::Connected));
        assert_ok!(session.handle(BleEvent::ServicesResolved {
            services: kickr_services()
        }));

        // reset: request control + reset
        ack(&mut session, FTMS_CONTROL_POINT_UUID);
        ack(&mut session, FTMS_CONTROL_POINT_UUID);
        // resistance 0: request control + set level
        ack(&mut session, FTMS_CONTROL_POINT_UUID);
        ack(&mut session, FTMS_CONTROL_POINT_UUID);
        // incline flat
        ack(&mut session, INCLINE_CONTROL_CHARACTERISTIC_UUID);

        assert_eq!(session.state(), SessionState::Ready);
        session
    }

    fn bike_data(speed_raw: u16) -> BleEvent {
        let mut value = vec![0x44, 0x00];
        value.extend_from_slice(&speed_raw.to_le_bytes());
        value.extend_from_slice(&[0x84, 0x03, 0xD7, 0x00]);
        BleEvent::CharacteristicUpdated {
            uuid: INDOOR_BIKE_DATA_UUID,
            value,
        }
    }

    #[test]
    fn test_reset_sequence_on_ready() {
        let mut session = DeviceSession::new(ADDRESS);
        assert_ok!(session.begin_connect());
        assert_eq!(session.state(), SessionState::Connecting);
        assert_ok!(session.handle(BleEvent::Connected));
        assert_eq!(session.state(), SessionState::Discovering);

        let actions = assert_ok!(session.handle(BleEvent::ServicesResolved {
            services: kickr_services()
        }));

        assert_eq!(
            actions[..3],
            [
                SessionAction::Subscribe {
                    characteristic: INDOOR_BIKE_DATA_UUID
                },
                SessionAction::Subscribe {
                    characteristic: FTMS_CONTROL_POINT_UUID
                },
                SessionAction::Subscribe {
                    characteristic: INCLINE_CONTROL_CHARACTERISTIC_UUID
                },
            ]
        );
        assert!(actions.contains(&SessionAction::ReadRange {
            kind: RangeKind::Resistance,
            characteristic: RESISTANCE_LEVEL_RANGE_UUID,
        }));
        assert_eq!(
            writes(&actions),
            vec![(FTMS_CONTROL_POINT_UUID, vec![0x00])]
        );
        assert_eq!(actions.last(), Some(&SessionAction::AcceptCommands));
        assert_eq!(session.state(), SessionState::AwaitingControlAck(Command::Reset));

        let actions = ack(&mut session, FTMS_CONTROL_POINT_UUID);
        assert_eq!(writes(&actions), vec![(FTMS_CONTROL_POINT_UUID, vec![0x01])]);

        let actions = ack(&mut session, FTMS_CONTROL_POINT_UUID);
        assert!(reports(&actions).is_empty());
        assert_eq!(writes(&actions), vec![(FTMS_CONTROL_POINT_UUID, vec![0x00])]);

        let actions = ack(&mut session, FTMS_CONTROL_POINT_UUID);
        assert_eq!(
            writes(&actions),
            vec![(FTMS_CONTROL_POINT_UUID, vec![0x04, 0x00])]
        );

        let actions = ack(&mut session, FTMS_CONTROL_POINT_UUID);
        assert_eq!(reports(&actions), vec![Report::Resistance(0)]);
        assert_eq!(
            writes(&actions),
            vec![(INCLINE_CONTROL_CHARACTERISTIC_UUID, vec![0x66, 0x00, 0x00])]
        );

        let actions = ack(&mut session, INCLINE_CONTROL_CHARACTERISTIC_UUID);
        assert_eq!(reports(&actions), vec![Report::Incline(Incline::FLAT)]);
        assert!(writes(&actions).is_empty());
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[test]
    fn test_missing_incline_service_is_fatal() {
        let mut session = DeviceSession::new(ADDRESS);
        assert_ok!(session.begin_connect());
        assert_ok!(session.handle(BleEvent::Connected));

        let mut services = kickr_services();
        services.pop();
        let err = assert_err!(session.handle(BleEvent::ServicesResolved { services }));
        assert!(err.is_connection_error());
        assert!(err.to_string().contains("incline control service"));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_connect_failure_is_fatal() {
        let mut session = DeviceSession::new(ADDRESS);
        assert_ok!(session.begin_connect());
        let err = assert_err!(session.handle(BleEvent::ConnectFailed {
            reason: "le-connection-abort-by-local".to_string()
        }));
        assert!(matches!(err, BridgeError::ConnectionFailed(_)));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_commands_rejected_before_ready() {
        let mut session = DeviceSession::new(ADDRESS);
        assert!(matches!(
            session.submit(Command::SetResistance(10)),
            Err(BridgeError::NotReady { .. })
        ));

        assert_ok!(session.begin_connect());
        assert_err!(session.begin_connect());
    }

    #[test]
    fn test_resistance_command_writes_control_then_value() {
        let mut session = ready_session();

        let actions = assert_ok!(session.submit(Command::SetResistance(50)));
        assert_eq!(writes(&actions), vec![(FTMS_CONTROL_POINT_UUID, vec![0x00])]);
        assert_eq!(session.pending_resistance(), None);

        let actions = ack(&mut session, FTMS_CONTROL_POINT_UUID);
        assert_eq!(
            writes(&actions),
            vec![(FTMS_CONTROL_POINT_UUID, vec![0x04, 50])]
        );
        assert_eq!(session.pending_resistance(), Some(50));
        assert_eq!(session.resistance_level(), 0);

        let actions = ack(&mut session, FTMS_CONTROL_POINT_UUID);
        assert_eq!(reports(&actions), vec![Report::Resistance(50)]);
        assert!(writes(&actions).is_empty());
        assert_eq!(session.resistance_level(), 50);
        assert_eq!(session.pending_resistance(), None);
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[test]
    fn test_incline_commands_are_single_flight() {
        let mut session = ready_session();
        let first = Incline::from_percent(5.0).unwrap();
        let second = Incline::from_percent(-3.0).unwrap();

        let actions = assert_ok!(session.submit(Command::SetIncline(first)));
        assert_eq!(writes(&actions).len(), 1);
        assert_eq!(session.pending_inclination(), Some(first));
        assert_eq!(
            session.state(),
            SessionState::AwaitingValueAck(Command::SetIncline(first))
        );

        // queued, nothing written while the first is pending
        let actions = assert_ok!(session.submit(Command::SetIncline(second)));
        assert!(actions.is_empty());
        assert_eq!(session.pending_inclination(), Some(first));
        assert_eq!(session.queued_commands(), 1);

        let actions = ack(&mut session, INCLINE_CONTROL_CHARACTERISTIC_UUID);
        assert_eq!(reports(&actions), vec![Report::Incline(first)]);
        assert_eq!(
            writes(&actions),
            vec![(INCLINE_CONTROL_CHARACTERISTIC_UUID, incline_command(second).to_vec())]
        );
        assert_eq!(session.inclination(), first);
        assert_eq!(session.pending_inclination(), Some(second));

        let actions = ack(&mut session, INCLINE_CONTROL_CHARACTERISTIC_UUID);
        assert_eq!(reports(&actions), vec![Report::Incline(second)]);
        assert_eq!(session.queued_commands(), 0);
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[test]
    fn test_write_failure_rolls_back_and_reports() {
        let mut session = ready_session();
        let target = Incline::from_percent(12.0).unwrap();

        assert_ok!(session.submit(Command::SetIncline(target)));
        let actions = assert_ok!(session.handle(BleEvent::WriteFailed {
            uuid: INCLINE_CONTROL_CHARACTERISTIC_UUID,
            error: "no acknowledgement within 2000ms".to_string(),
        }));

        let reports = reports(&actions);
        assert_eq!(reports.len(), 1);
        assert!(matches!(
            &reports[0],
            Report::Rejected { channel: Channel::Incline, message } if message.contains("12.0%")
        ));
        assert_eq!(session.inclination(), Incline::FLAT);
        assert_eq!(session.pending_inclination(), None);
        assert_eq!(session.state(), SessionState::Ready);

        // the session stays usable
        let actions = assert_ok!(session.submit(Command::SetResistance(30)));
        assert_eq!(writes(&actions).len(), 1);
    }

    #[test]
    fn test_failure_starts_next_queued_command() {
        let mut session = ready_session();

        assert_ok!(session.submit(Command::SetResistance(20)));
        assert_ok!(session.submit(Command::SetResistance(40)));
        ack(&mut session, FTMS_CONTROL_POINT_UUID);

        let actions = assert_ok!(session.handle(BleEvent::WriteFailed {
            uuid: FTMS_CONTROL_POINT_UUID,
            error: "rejected".to_string(),
        }));
        assert_eq!(session.resistance_level(), 0);
        assert_eq!(writes(&actions), vec![(FTMS_CONTROL_POINT_UUID, vec![0x00])]);
        assert_eq!(
            session.state(),
            SessionState::AwaitingControlAck(Command::SetResistance(40))
        );
    }

    #[test]
    fn test_failed_reset_write_reports_baseline() {
        let mut session = DeviceSession::new(ADDRESS);
        assert_ok!(session.begin_connect());
        assert_ok!(session.handle(BleEvent::Connected));
        assert_ok!(session.handle(BleEvent::ServicesResolved {
            services: kickr_services()
        }));
        // reset, then request control for resistance 0
        for _ in 0..3 {
            ack(&mut session, FTMS_CONTROL_POINT_UUID);
        }

        let actions = assert_ok!(session.handle(BleEvent::WriteFailed {
            uuid: FTMS_CONTROL_POINT_UUID,
            error: "rejected".to_string(),
        }));
        let reports = reports(&actions);
        assert_eq!(reports.len(), 2);
        assert!(matches!(
            &reports[0],
            Report::Rejected { channel: Channel::Resistance, message } if message.contains("rejected")
        ));
        assert_eq!(reports[1], Report::Resistance(0));
        assert_eq!(
            writes(&actions),
            vec![(INCLINE_CONTROL_CHARACTERISTIC_UUID, vec![0x66, 0x00, 0x00])]
        );

        // the incline reset fails too
        let actions = assert_ok!(session.handle(BleEvent::WriteFailed {
            uuid: INCLINE_CONTROL_CHARACTERISTIC_UUID,
            error: "rejected".to_string(),
        }));
        let reports = self::reports(&actions);
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[1], Report::Incline(Incline::FLAT));

        // later failures only report the failure
        assert_ok!(session.submit(Command::SetIncline(Incline::MAX)));
        let actions = assert_ok!(session.handle(BleEvent::WriteFailed {
            uuid: INCLINE_CONTROL_CHARACTERISTIC_UUID,
            error: "rejected".to_string(),
        }));
        assert_eq!(self::reports(&actions).len(), 1);
    }

    #[test]
    fn test_queue_is_bounded() {
        let mut session = ready_session();
        assert_ok!(session.submit(Command::SetResistance(10)));
        for _ in 0..MAX_QUEUED_COMMANDS {
            assert!(assert_ok!(session.submit(Command::SetResistance(20))).is_empty());
        }
        assert_eq!(session.queued_commands(), MAX_QUEUED_COMMANDS);

        let actions = assert_ok!(session.submit(Command::SetIncline(Incline::MAX)));
        assert_eq!(session.queued_commands(), MAX_QUEUED_COMMANDS);
        assert!(writes(&actions).is_empty());
        assert!(matches!(
            reports(&actions).as_slice(),
            [Report::Rejected { channel: Channel::Incline, .. }]
        ));
    }

    #[test]
    fn test_stray_acknowledgement_is_ignored() {
        let mut session = ready_session();
        assert_ok!(session.submit(Command::SetResistance(20)));

        let actions = ack(&mut session, INCLINE_CONTROL_CHARACTERISTIC_UUID);
        assert!(actions.is_empty());
        assert_eq!(
            session.state(),
            SessionState::AwaitingControlAck(Command::SetResistance(20))
        );
    }

    #[test]
    fn test_telemetry_idle_suppression() {
        let mut session = ready_session();

        let published = (0..15)
            .map(|_| !assert_ok!(session.handle(bike_data(0))).is_empty())
            .filter(|published| *published)
            .count();
        assert_eq!(published, 10);
        assert_eq!(session.zero_streak_count(), 10);

        let actions = assert_ok!(session.handle(bike_data(2520)));
        assert_eq!(actions.len(), 1);
        assert_eq!(session.zero_streak_count(), 0);
    }

    #[test]
    fn test_malformed_telemetry_is_dropped() {
        let mut session = ready_session();
        let actions = assert_ok!(session.handle(BleEvent::CharacteristicUpdated {
            uuid: INDOOR_BIKE_DATA_UUID,
            value: vec![0x44, 0x00, 0x01],
        }));
        assert!(actions.is_empty());
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[test]
    fn test_telemetry_processed_while_command_in_flight() {
        let mut session = ready_session();
        assert_ok!(session.submit(Command::SetResistance(20)));

        let actions = assert_ok!(session.handle(bike_data(1000)));
        assert!(matches!(
            actions.as_slice(),
            [SessionAction::Report(Report::Telemetry(_))]
        ));
    }

    #[test]
    fn test_climb_notification_does_not_change_state() {
        let mut session = ready_session();
        let actions = assert_ok!(session.handle(BleEvent::CharacteristicUpdated {
            uuid: INCLINE_CONTROL_CHARACTERISTIC_UUID,
            value: vec![0x66, 0xe8, 0x03],
        }));
        assert!(actions.is_empty());
        assert_eq!(session.inclination(), Incline::FLAT);
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[test]
    fn test_disconnect_ends_session() {
        let mut session = ready_session();
        assert_ok!(session.submit(Command::SetResistance(20)));
        assert_ok!(session.submit(Command::SetResistance(30)));

        let err = assert_err!(session.handle(BleEvent::Disconnected));
        assert!(matches!(err, BridgeError::Disconnected));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(session.queued_commands(), 0);
        assert_eq!(session.pending_resistance(), None);
    }
}
