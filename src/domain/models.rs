use crate::domain::intent::IntentEnvelope;
use std::collections::BTreeMap;
use std::fmt;

/// Identifier handed out by the dispatcher for each robot it decides to connect.
pub type RobotId = u32;

/// Last-observed servo positions keyed by servo label.
pub type ServoSnapshot = BTreeMap<&'static str, i16>;

/// 48-bit Bluetooth device address stored the way WinRT reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BleAddress(pub u64);

impl fmt::Display for BleAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0.to_be_bytes();
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[2], b[3], b[4], b[5], b[6], b[7]
        )
    }
}

/// Robot product line, identified from the advertised device name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    OptimusPrimeFlagship,
    Grimlock,
    Megatron,
    Unknown,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::OptimusPrimeFlagship => "Optimus Prime Flagship",
            Self::Grimlock => "Grimlock",
            Self::Megatron => "Megatron",
            Self::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Robot,
    Vehicle,
    TransformingToRobot,
    TransformingToVehicle,
    Unknown,
}

impl Mode {
    /// The mode a transform from this mode ends in.
    pub fn complement(self) -> Option<Mode> {
        match self {
            Self::Robot => Some(Self::Vehicle),
            Self::Vehicle => Some(Self::Robot),
            _ => None,
        }
    }

    pub fn transforming_to(target: Mode) -> Option<Mode> {
        match target {
            Self::Robot => Some(Self::TransformingToRobot),
            Self::Vehicle => Some(Self::TransformingToVehicle),
            _ => None,
        }
    }

    pub fn transform_target(self) -> Option<Mode> {
        match self {
            Self::TransformingToRobot => Some(Self::Robot),
            Self::TransformingToVehicle => Some(Self::Vehicle),
            _ => None,
        }
    }

    pub fn is_transforming(self) -> bool {
        self.transform_target().is_some()
    }

    pub fn is_known(self) -> bool {
        matches!(self, Self::Robot | Self::Vehicle)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Robot => "robot",
            Self::Vehicle => "vehicle",
            Self::TransformingToRobot => "transforming to robot",
            Self::TransformingToVehicle => "transforming to vehicle",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Activity {
    Idle,
    Moving,
    Acting { slot: u8 },
    AwaitingConfirmation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MoveDirection {
    Forward,
    Reverse,
    ReverseLeft,
    ReverseRight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TurnDirection {
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Left,
    Right,
}

/// Identification strings a robot reports on request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InfoKind {
    Model,
    Version,
    FirmwareDate,
    SerialNumber,
}

impl InfoKind {
    pub const ALL: [InfoKind; 4] = [
        InfoKind::Model,
        InfoKind::Version,
        InfoKind::FirmwareDate,
        InfoKind::SerialNumber,
    ];
}

/// Status payload decoded from either a state or a position reply.
///
/// `mode` is `Unknown` when the payload did not carry a usable mode byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub mode: Mode,
    pub activity: Option<Activity>,
    pub battery: Option<u8>,
    pub fast_mode: Option<bool>,
    pub servos: ServoSnapshot,
}

/// Inbound notification after decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedEvent {
    StatusReport(StatusReport),
    ActionAck,
    ActionProgress { percent: u8 },
    TransformAck,
    DeviceInfo { kind: InfoKind, text: String },
    Unknown { tag: u8 },
}

/// A device that passed the advertised-name filter during a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredRobot {
    pub address: BleAddress,
    pub name: String,
    pub platform: Platform,
    pub signal_strength: i16,
}

impl StatusReport {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            activity: None,
            battery: None,
            fast_mode: None,
            servos: ServoSnapshot::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    MotionIdle,
    ActionElapsed,
    TransformGrace,
    ConfirmTimeout,
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

impl StatusMessage {
    pub fn new(severity: MessageSeverity, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}

/// Everything the engine task reacts to arrives as one of these.
#[derive(Debug)]
pub enum EngineEvent {
    Intent(IntentEnvelope),
    Discovered(DiscoveredRobot),
    ScanFinished { found: usize },
    Connected {
        robot: RobotId,
        device: DiscoveredRobot,
        attempts: u32,
    },
    ConnectFailed {
        robot: RobotId,
        device: DiscoveredRobot,
        attempts: u32,
        reason: String,
    },
    Inbound { robot: RobotId, event: DecodedEvent },
    LinkLost { robot: RobotId, reason: String },
    PollTick { robot: RobotId },
    Timer {
        robot: RobotId,
        kind: TimerKind,
        token: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_display() {
        let address = BleAddress(0x0000_C4DE_E2A1_0B3F);
        assert_eq!(address.to_string(), "C4:DE:E2:A1:0B:3F");
    }

    #[test]
    fn test_mode_complement() {
        assert_eq!(Mode::Robot.complement(), Some(Mode::Vehicle));
        assert_eq!(Mode::Vehicle.complement(), Some(Mode::Robot));
        assert_eq!(Mode::Unknown.complement(), None);
        assert_eq!(
            Mode::transforming_to(Mode::Vehicle).and_then(Mode::transform_target),
            Some(Mode::Vehicle)
        );
    }
}
