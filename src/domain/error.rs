//! Error taxonomy shared by the codec, the state machine and the connection layer.
//!
//! Application plumbing (settings, logging, startup) keeps using `anyhow`;
//! these types exist where callers need to match on what went wrong.

use crate::domain::models::{BleAddress, Platform};
use crate::domain::robot_state::Phase;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Bad header, length or checksum. The raw bytes are kept for the log.
    #[error("malformed payload ({reason}): {raw:02X?}")]
    MalformedPayload { reason: String, raw: Vec<u8> },

    /// Well-formed frame whose opcode is not in the protocol table
    #[error("unrecognized event tag {tag:#04X}: {raw:02X?}")]
    UnrecognizedEvent { tag: u8, raw: Vec<u8> },

    #[error("unsupported command {command}: {reason}")]
    UnsupportedCommand {
        command: &'static str,
        reason: String,
    },
}

impl ProtocolError {
    pub fn malformed(reason: impl Into<String>, raw: &[u8]) -> Self {
        Self::MalformedPayload {
            reason: reason.into(),
            raw: raw.to_vec(),
        }
    }

    pub fn unsupported(command: &'static str, reason: impl Into<String>) -> Self {
        Self::UnsupportedCommand {
            command,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServoError {
    #[error("{platform} has no servo labelled '{label}'")]
    UnknownServo { platform: Platform, label: String },
}

/// A command the robot's current phase does not allow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StateViolation {
    #[error("{command} is not allowed while {phase}")]
    NotAllowed { command: &'static str, phase: Phase },

    #[error("a transform is already in progress")]
    AlreadyTransforming,

    #[error("an action is already in progress")]
    AlreadyActing,

    #[error("{command} needs a known robot/vehicle mode")]
    ModeUnknown { command: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("device {address} is not reachable: {reason}")]
    Unreachable { address: BleAddress, reason: String },

    #[error("GATT error: {0}")]
    Gatt(String),

    #[error("write failed: {0}")]
    Write(String),

    #[error("scan failed: {0}")]
    Scan(String),

    #[error("link closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Servo(#[from] ServoError),

    #[error(transparent)]
    State(#[from] StateViolation),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("connection to {address} failed after {attempts} attempt(s): {source}")]
    ConnectionFailed {
        address: BleAddress,
        attempts: u32,
        #[source]
        source: TransportError,
    },
}
