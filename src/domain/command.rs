use crate::domain::models::{InfoKind, MoveDirection, Side, TurnDirection};

/// A single robot command, before encoding
///
/// `Rescan` and `DisconnectAll` are engine-level operations; they never reach
/// the wire and the codec refuses to encode them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Move { direction: MoveDirection, speed: i16 },
    Turn { direction: TurnDirection, rate: i16 },
    Step { side: Side },
    Stop,
    Transform,
    Action { slot: u8 },
    SetServo { label: &'static str, value: i16 },
    SetSpeedMode { fast: bool },
    QueryState,
    QueryPosition,
    QueryInfo(InfoKind),
    /// Clears any action the robot still thinks is running
    ClearAction,
    Shutdown,
    /// Stored programming-mode sequence
    RunSequence { id: u16 },
    Rescan,
    DisconnectAll,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Move { .. } => "move",
            Self::Turn { .. } => "turn",
            Self::Step { .. } => "step",
            Self::Stop => "stop",
            Self::Transform => "transform",
            Self::Action { .. } => "action",
            Self::SetServo { .. } => "set-servo",
            Self::SetSpeedMode { .. } => "set-speed-mode",
            Self::QueryState => "query-state",
            Self::QueryPosition => "query-position",
            Self::QueryInfo(_) => "query-info",
            Self::ClearAction => "clear-action",
            Self::Shutdown => "shutdown",
            Self::RunSequence { .. } => "run-sequence",
            Self::Rescan => "rescan",
            Self::DisconnectAll => "disconnect-all",
        }
    }

    /// Status queries must never be sent while a transform or action runs.
    pub fn is_status_query(&self) -> bool {
        matches!(self, Self::QueryState | Self::QueryPosition)
    }
}
