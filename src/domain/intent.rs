//! Control intents
//!
//! Intents are platform-independent requests produced by input sources
//! (controllers, scripts). The dispatcher resolves each one against the
//! target robot's profile and current state.

use crate::domain::models::{EngineEvent, MoveDirection, RobotId, Side, TurnDirection};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    /// `speed == 0` is treated as a stop
    Move { direction: MoveDirection, speed: i16 },
    Turn { direction: TurnDirection, rate: i16 },
    Step { side: Side },
    Stop,
    Transform,
    /// Action bound to a controller button, see `profile::button`
    Action(u8),
    ToggleSpeed,
    SetServo { label: String, value: i16 },
    QueryPosition,
    QueryInfo,
    Shutdown,
    RunSequence { id: u16 },
    Rescan,
    DisconnectAll,
}

impl Intent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Move { .. } => "move",
            Self::Turn { .. } => "turn",
            Self::Step { .. } => "step",
            Self::Stop => "stop",
            Self::Transform => "transform",
            Self::Action(_) => "action",
            Self::ToggleSpeed => "toggle-speed",
            Self::SetServo { .. } => "set-servo",
            Self::QueryPosition => "query-position",
            Self::QueryInfo => "query-info",
            Self::Shutdown => "shutdown",
            Self::RunSequence { .. } => "run-sequence",
            Self::Rescan => "rescan",
            Self::DisconnectAll => "disconnect-all",
        }
    }

    /// Intents that act on the whole fleet rather than on individual robots
    pub fn is_fleet_wide(&self) -> bool {
        matches!(self, Self::Rescan | Self::DisconnectAll)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentTarget {
    All,
    Robot(RobotId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntentEnvelope {
    pub intent: Intent,
    pub target: IntentTarget,
}

impl IntentEnvelope {
    pub fn all(intent: Intent) -> Self {
        Self {
            intent,
            target: IntentTarget::All,
        }
    }

    pub fn robot(robot: RobotId, intent: Intent) -> Self {
        Self {
            intent,
            target: IntentTarget::Robot(robot),
        }
    }
}

/// Cloneable handle input sources use to feed the engine
#[derive(Debug, Clone)]
pub struct IntentSender {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl IntentSender {
    pub fn new(tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self { tx }
    }

    pub fn send(&self, envelope: IntentEnvelope) -> anyhow::Result<()> {
        self.tx
            .send(EngineEvent::Intent(envelope))
            .map_err(|_| anyhow::anyhow!("Engine is no longer running"))
    }

    pub fn broadcast(&self, intent: Intent) -> anyhow::Result<()> {
        self.send(IntentEnvelope::all(intent))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A producer of intents, run until exhausted or cancelled
#[async_trait]
pub trait IntentSource: Send {
    async fn run(&mut self, sender: IntentSender, cancel: CancellationToken)
        -> anyhow::Result<()>;
}
