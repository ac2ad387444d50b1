//! Robosen Robot Protocol
//!
//! Pure encode/decode between [`Command`]/[`DecodedEvent`] values and the
//! byte frames exchanged over the shared `ffe1` characteristic.
//!
//! # Position payload (48 bytes)
//!
//! ```text
//! [0-9]   : leg servos, left then right (hip, thigh, calf/knee, ankle, foot)
//! [10-21] : arm servos, left then right (scapula .. wrist)
//! [22-24] : waist, abdomen, head
//! [25-26] : left/right wheel speed (two's complement)
//! [27-47] : unused
//! ```
//!
//! Each slot holds `value + calibration offset`. The offsets come from the
//! programming-mode handshake; without it the engine assumes `0x80`.

use crate::domain::command::Command;
use crate::domain::error::ProtocolError;
use crate::domain::models::{
    DecodedEvent, InfoKind, Mode, MoveDirection, ServoSnapshot, Side, StatusReport, TurnDirection,
};
use crate::domain::profile::{ActionPayload, RobotProfile};
use crate::domain::servo_map;
use crate::infrastructure::bluetooth::frame::Frame;
use tracing::trace;

/// Delay between consecutive writes in milliseconds
pub const COMMAND_DELAY_MS: u64 = 20;

/// Spacing of repeated frames (stop is sent several times)
pub const REPEAT_SPACING_MS: u64 = 100;

pub const POSE_LEN: usize = 48;

/// Byte appended after the 48 position slots of a set-position frame
pub const POSE_TRAILER: u8 = 40;

pub const DEFAULT_CALIBRATION_OFFSET: u8 = 0x80;

/// Argument byte selecting the speed toggle among the built-in actions
const SPEED_TOGGLE_ARG: u8 = 3;

/// Wire opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Forward = 1,
    TurnRight = 2,
    StepRight = 3,
    ReverseRight = 4,
    Reverse = 5,
    ReverseLeft = 6,
    StepLeft = 7,
    TurnLeft = 8,
    BuiltInAction = 9,
    Transform = 10,
    ActionComplete = 11,
    Stop = 12,
    GetState = 15,
    ActionProgress = 17,
    ReadDirectory = 22,
    ExecuteFile = 23,
    CreateFile = 220,
    Unlink = 221,
    ReadFile = 222,
    FileExists = 225,
    WriteFile = 227,
    EnterProgrammingMode = 230,
    ExitProgrammingMode = 231,
    SetPosition = 232,
    GetPosition = 233,
    UnlockAll = 234,
    LockAll = 235,
    Lock = 236,
    Locks = 237,
    SerialNumber = 241,
    EnterUsbMode = 245,
    Model = 246,
    Version = 247,
    FirmwareDate = 248,
    Shutdown = 250,
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let opcode = match value {
            1 => Self::Forward,
            2 => Self::TurnRight,
            3 => Self::StepRight,
            4 => Self::ReverseRight,
            5 => Self::Reverse,
            6 => Self::ReverseLeft,
            7 => Self::StepLeft,
            8 => Self::TurnLeft,
            9 => Self::BuiltInAction,
            10 => Self::Transform,
            11 => Self::ActionComplete,
            12 => Self::Stop,
            15 => Self::GetState,
            17 => Self::ActionProgress,
            22 => Self::ReadDirectory,
            23 => Self::ExecuteFile,
            220 => Self::CreateFile,
            221 => Self::Unlink,
            222 => Self::ReadFile,
            225 => Self::FileExists,
            227 => Self::WriteFile,
            230 => Self::EnterProgrammingMode,
            231 => Self::ExitProgrammingMode,
            232 => Self::SetPosition,
            233 => Self::GetPosition,
            234 => Self::UnlockAll,
            235 => Self::LockAll,
            236 => Self::Lock,
            237 => Self::Locks,
            241 => Self::SerialNumber,
            245 => Self::EnterUsbMode,
            246 => Self::Model,
            247 => Self::Version,
            248 => Self::FirmwareDate,
            250 => Self::Shutdown,
            other => return Err(other),
        };
        Ok(opcode)
    }
}

impl Opcode {
    fn for_move(direction: MoveDirection) -> Self {
        match direction {
            MoveDirection::Forward => Self::Forward,
            MoveDirection::Reverse => Self::Reverse,
            MoveDirection::ReverseLeft => Self::ReverseLeft,
            MoveDirection::ReverseRight => Self::ReverseRight,
        }
    }

    fn for_turn(direction: TurnDirection) -> Self {
        match direction {
            TurnDirection::Left => Self::TurnLeft,
            TurnDirection::Right => Self::TurnRight,
        }
    }

    fn for_step(side: Side) -> Self {
        match side {
            Side::Left => Self::StepLeft,
            Side::Right => Self::StepRight,
        }
    }

    fn for_info(kind: InfoKind) -> Self {
        match kind {
            InfoKind::Model => Self::Model,
            InfoKind::Version => Self::Version,
            InfoKind::FirmwareDate => Self::FirmwareDate,
            InfoKind::SerialNumber => Self::SerialNumber,
        }
    }
}

/// What a set-position frame is built from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoseContext {
    pub calibration: [u8; POSE_LEN],
    /// Last-observed positions; servos missing here hold their neutral
    pub pose: ServoSnapshot,
    pub mode: Mode,
}

impl PoseContext {
    pub fn new(mode: Mode, pose: ServoSnapshot) -> Self {
        Self {
            calibration: [DEFAULT_CALIBRATION_OFFSET; POSE_LEN],
            pose,
            mode,
        }
    }
}

fn frame(opcode: Opcode, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    Ok(Frame::new(opcode as u8, payload)?.to_bytes())
}

fn signed_byte(value: i16) -> u8 {
    (value.clamp(i8::MIN as i16, i8::MAX as i16) as i8) as u8
}

/// Encode a command that needs no pose context.
pub fn encode(command: &Command, profile: &RobotProfile) -> Result<Vec<u8>, ProtocolError> {
    encode_with_pose(command, profile, None)
}

/// Encode a command for the given robot profile.
///
/// `SetServo` writes a whole position frame and therefore needs `pose`.
pub fn encode_with_pose(
    command: &Command,
    profile: &RobotProfile,
    pose: Option<&PoseContext>,
) -> Result<Vec<u8>, ProtocolError> {
    let bytes = match *command {
        // gait frames carry no speed byte
        Command::Move { direction, .. } => frame(Opcode::for_move(direction), &[])?,
        Command::Turn { direction, .. } => frame(Opcode::for_turn(direction), &[])?,
        Command::Step { side } => frame(Opcode::for_step(side), &[])?,
        Command::Stop => frame(Opcode::Stop, &[])?,
        Command::Transform => {
            if !profile.capabilities.has_vehicle_mode {
                return Err(ProtocolError::unsupported(
                    command.name(),
                    format!("{} has no vehicle mode", profile.display_name),
                ));
            }
            frame(Opcode::Transform, &[0])?
        }
        Command::Action { slot } => encode_action(command, profile, slot)?,
        Command::SetServo { label, value } => {
            let pose = pose.ok_or_else(|| {
                ProtocolError::unsupported(command.name(), "no pose context for position frame")
            })?;
            frame(Opcode::SetPosition, &position_payload(profile, pose, label, value)?)?
        }
        Command::SetSpeedMode { fast } => {
            if !profile.capabilities.speed_toggle {
                return Err(ProtocolError::unsupported(
                    command.name(),
                    format!("{} has no speed toggle", profile.display_name),
                ));
            }
            frame(Opcode::BuiltInAction, &[SPEED_TOGGLE_ARG, u8::from(fast)])?
        }
        Command::QueryState => frame(Opcode::GetState, &[])?,
        Command::QueryPosition => frame(Opcode::GetPosition, &[])?,
        Command::QueryInfo(kind) => frame(Opcode::for_info(kind), &[])?,
        Command::ClearAction => frame(Opcode::ActionComplete, &[])?,
        Command::Shutdown => frame(Opcode::Shutdown, &[])?,
        Command::RunSequence { .. } => {
            return Err(ProtocolError::unsupported(
                command.name(),
                "not implemented: programming mode",
            ))
        }
        Command::Rescan | Command::DisconnectAll => {
            return Err(ProtocolError::unsupported(
                command.name(),
                "engine operation, not a wire command",
            ))
        }
    };

    trace!("Encoded {:?} as {:02X?}", command, bytes);
    Ok(bytes)
}

fn encode_action(
    command: &Command,
    profile: &RobotProfile,
    slot: u8,
) -> Result<Vec<u8>, ProtocolError> {
    let action = profile.action(slot).ok_or_else(|| {
        ProtocolError::unsupported(
            command.name(),
            format!("{} has no action in slot {}", profile.display_name, slot),
        )
    })?;
    if action.weapon && profile.capabilities.weapon_slots == 0 {
        return Err(ProtocolError::unsupported(
            command.name(),
            format!("{} has no weapon slots", profile.display_name),
        ));
    }

    match action.payload {
        ActionPayload::BuiltIn(args) => frame(Opcode::BuiltInAction, args),
        ActionPayload::ExecuteFile(path) => frame(Opcode::ExecuteFile, path.as_bytes()),
        ActionPayload::Horn(side) => frame(Opcode::for_step(side), &[]),
    }
}

fn position_payload(
    profile: &RobotProfile,
    context: &PoseContext,
    label: &str,
    value: i16,
) -> Result<Vec<u8>, ProtocolError> {
    let mut payload = vec![0u8; POSE_LEN + 1];
    payload[POSE_LEN] = POSE_TRAILER;

    let target = servo_map::find(profile.platform, label).map_err(|e| {
        ProtocolError::unsupported("set-servo", e.to_string())
    })?;

    for spec in profile.servos() {
        let limit = spec.limit(context.mode);
        let raw_value = if spec.label == target.label {
            value
        } else {
            context
                .pose
                .get(spec.label)
                .copied()
                .unwrap_or(limit.neutral)
        };
        let value = limit.clamp(raw_value);
        let offset = context.calibration[spec.index];

        payload[spec.index] = if spec.wheel {
            signed_byte(value).wrapping_add(offset)
        } else {
            (value + offset as i16).clamp(0, u8::MAX as i16) as u8
        };
    }

    Ok(payload)
}

/// Decode a position payload into a servo snapshot.
pub fn decode_positions(
    profile: &RobotProfile,
    payload: &[u8],
    calibration: &[u8; POSE_LEN],
) -> ServoSnapshot {
    profile
        .servos()
        .iter()
        .filter_map(|spec| {
            let raw = *payload.get(spec.index)?;
            let offset = calibration[spec.index];
            let value = if spec.wheel {
                raw.wrapping_sub(offset) as i8 as i16
            } else {
                raw as i16 - offset as i16
            };
            let (min, max) = spec.envelope();
            Some((spec.label, value.clamp(min, max)))
        })
        .collect()
}

/// Decode one complete inbound frame.
pub fn decode(bytes: &[u8], profile: &RobotProfile) -> Result<DecodedEvent, ProtocolError> {
    decode_with_calibration(bytes, profile, &[DEFAULT_CALIBRATION_OFFSET; POSE_LEN])
}

pub fn decode_with_calibration(
    bytes: &[u8],
    profile: &RobotProfile,
    calibration: &[u8; POSE_LEN],
) -> Result<DecodedEvent, ProtocolError> {
    let frame = Frame::parse(bytes)?;
    let opcode = Opcode::try_from(frame.opcode).map_err(|tag| ProtocolError::UnrecognizedEvent {
        tag,
        raw: bytes.to_vec(),
    })?;
    let payload = frame.payload.as_slice();

    let event = match opcode {
        Opcode::GetState => DecodedEvent::StatusReport(decode_state(payload)),
        Opcode::GetPosition => {
            if payload.len() < POSE_LEN {
                return Err(ProtocolError::malformed(
                    format!("position reply has {} bytes, need {}", payload.len(), POSE_LEN),
                    bytes,
                ));
            }
            DecodedEvent::StatusReport(StatusReport {
                servos: decode_positions(profile, payload, calibration),
                ..StatusReport::new(Mode::Unknown)
            })
        }
        Opcode::ActionComplete => DecodedEvent::ActionAck,
        Opcode::ActionProgress | Opcode::ExecuteFile => {
            let percent = *payload
                .first()
                .ok_or_else(|| ProtocolError::malformed("progress reply without percent", bytes))?;
            DecodedEvent::ActionProgress {
                percent: percent.min(100),
            }
        }
        Opcode::Transform => DecodedEvent::TransformAck,
        Opcode::Model => info(InfoKind::Model, payload),
        Opcode::Version => info(InfoKind::Version, payload),
        Opcode::FirmwareDate => info(InfoKind::FirmwareDate, payload),
        Opcode::SerialNumber => info(InfoKind::SerialNumber, payload),
        other => DecodedEvent::Unknown { tag: other as u8 },
    };

    trace!("Decoded {:02X?} as {:?}", bytes, event);
    Ok(event)
}

/// ```text
/// [0] : 0 = robot, 1 = vehicle
/// [1] : battery percent
/// [5] : 1 = fast mode
/// ```
fn decode_state(payload: &[u8]) -> StatusReport {
    if payload.len() < 2 {
        return StatusReport::new(Mode::Unknown);
    }
    let mode = match payload[0] {
        0 => Mode::Robot,
        1 => Mode::Vehicle,
        _ => Mode::Unknown,
    };
    StatusReport {
        battery: Some(payload[1]),
        fast_mode: payload.get(5).map(|b| *b == 1),
        ..StatusReport::new(mode)
    }
}

fn info(kind: InfoKind, payload: &[u8]) -> DecodedEvent {
    let text = String::from_utf8_lossy(payload)
        .trim_end_matches('\0')
        .trim()
        .to_string();
    DecodedEvent::DeviceInfo { kind, text }
}

/// Parse an outbound frame back into the command that produced it.
pub fn decode_command(bytes: &[u8], profile: &RobotProfile) -> Result<Command, ProtocolError> {
    let frame = Frame::parse(bytes)?;
    let opcode = Opcode::try_from(frame.opcode).map_err(|tag| ProtocolError::UnrecognizedEvent {
        tag,
        raw: bytes.to_vec(),
    })?;
    let payload = frame.payload.as_slice();

    let command = match opcode {
        // gait frames carry no speed, so they decode at zero
        Opcode::Forward => Command::Move {
            direction: MoveDirection::Forward,
            speed: 0,
        },
        Opcode::Reverse => Command::Move {
            direction: MoveDirection::Reverse,
            speed: 0,
        },
        Opcode::ReverseLeft => Command::Move {
            direction: MoveDirection::ReverseLeft,
            speed: 0,
        },
        Opcode::ReverseRight => Command::Move {
            direction: MoveDirection::ReverseRight,
            speed: 0,
        },
        Opcode::TurnLeft => Command::Turn {
            direction: TurnDirection::Left,
            rate: 0,
        },
        Opcode::TurnRight => Command::Turn {
            direction: TurnDirection::Right,
            rate: 0,
        },
        Opcode::StepLeft => Command::Step { side: Side::Left },
        Opcode::StepRight => Command::Step { side: Side::Right },
        Opcode::Stop => Command::Stop,
        Opcode::Transform => Command::Transform,
        Opcode::BuiltInAction => {
            let slot = profile.actions.iter().find_map(|a| match a.payload {
                ActionPayload::BuiltIn(args) if args == payload => Some(a.slot),
                _ => None,
            });
            match (slot, payload) {
                (Some(slot), _) => Command::Action { slot },
                (None, [SPEED_TOGGLE_ARG, fast]) if profile.capabilities.speed_toggle => {
                    Command::SetSpeedMode { fast: *fast != 0 }
                }
                _ => {
                    return Err(ProtocolError::malformed(
                        "built-in action matches no profile slot",
                        bytes,
                    ))
                }
            }
        }
        Opcode::ExecuteFile => {
            let path = String::from_utf8_lossy(payload);
            let slot = profile.actions.iter().find_map(|a| match a.payload {
                ActionPayload::ExecuteFile(p) if p == path => Some(a.slot),
                _ => None,
            });
            Command::Action {
                slot: slot.ok_or_else(|| {
                    ProtocolError::malformed(format!("no action plays '{path}'"), bytes)
                })?,
            }
        }
        Opcode::GetState => Command::QueryState,
        Opcode::GetPosition => Command::QueryPosition,
        Opcode::Model => Command::QueryInfo(InfoKind::Model),
        Opcode::Version => Command::QueryInfo(InfoKind::Version),
        Opcode::FirmwareDate => Command::QueryInfo(InfoKind::FirmwareDate),
        Opcode::SerialNumber => Command::QueryInfo(InfoKind::SerialNumber),
        Opcode::ActionComplete => Command::ClearAction,
        Opcode::Shutdown => Command::Shutdown,
        other => {
            return Err(ProtocolError::unsupported(
                "decode-command",
                format!("{other:?} frames are not produced by this engine"),
            ))
        }
    };
    Ok(command)
}

/// Build the inbound frame a robot would send for `event`.
pub fn encode_event(event: &DecodedEvent, profile: &RobotProfile) -> Result<Vec<u8>, ProtocolError> {
    match event {
        DecodedEvent::StatusReport(report) if !report.servos.is_empty() => {
            let mut payload = vec![0u8; POSE_LEN];
            for spec in profile.servos() {
                if let Some(value) = report.servos.get(spec.label) {
                    payload[spec.index] = if spec.wheel {
                        signed_byte(*value).wrapping_add(DEFAULT_CALIBRATION_OFFSET)
                    } else {
                        (*value + DEFAULT_CALIBRATION_OFFSET as i16).clamp(0, u8::MAX as i16)
                            as u8
                    };
                }
            }
            frame(Opcode::GetPosition, &payload)
        }
        DecodedEvent::StatusReport(report) => {
            let mode = match report.mode {
                Mode::Robot => 0,
                Mode::Vehicle => 1,
                _ => 0xFF,
            };
            let fast = u8::from(report.fast_mode.unwrap_or(false));
            frame(
                Opcode::GetState,
                &[mode, report.battery.unwrap_or(100), 0, 0, 0, fast],
            )
        }
        DecodedEvent::ActionAck => frame(Opcode::ActionComplete, &[]),
        DecodedEvent::ActionProgress { percent } => frame(Opcode::ActionProgress, &[*percent]),
        DecodedEvent::TransformAck => frame(Opcode::Transform, &[0]),
        DecodedEvent::DeviceInfo { kind, text } => frame(Opcode::for_info(*kind), text.as_bytes()),
        DecodedEvent::Unknown { tag } => Ok(Frame::empty(*tag).to_bytes()),
    }
}
