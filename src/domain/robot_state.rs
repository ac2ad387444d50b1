//! Per-robot mode/activity state machine
//!
//! ```text
//!             move/turn/step                 transform
//!   Idle ─────────────────────▶ Moving    Idle/Moving ───▶ Transforming{target}
//!    ▲  ◀──── stop / idle timeout ───┘       ▲                 │ 2nd ack
//!    │                                       └─────────────────┘
//!    │  action            ack / progress 100 / duration
//!    ├──────────▶ Acting{slot} ─────────────────────────▶ Idle
//!    │
//!    │  status query      report / timeout
//!    └──────────▶ AwaitingConfirmation ─────────────────▶ Idle
//! ```
//!
//! A transform whose second acknowledgement never arrives leaves
//! `Transforming` through the grace-period path: the machine moves to
//! `AwaitingConfirmation` with the mode unknown, and the next report that
//! resolves a mode completes it.
//!
//! The machine is pure. Timers and outbound commands belong to the caller.

use crate::domain::error::StateViolation;
use crate::domain::models::{Activity, DecodedEvent, Mode, Platform, StatusReport};
use crate::domain::servo_map;
use std::fmt;

/// Combined view of mode and activity used for legality checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Idle,
    Moving,
    Transforming { target: Mode },
    Acting { slot: u8 },
    AwaitingConfirmation,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Moving => f.write_str("moving"),
            Self::Transforming { target } => write!(f, "transforming to {target}"),
            Self::Acting { slot } => write!(f, "acting (slot {slot})"),
            Self::AwaitingConfirmation => f.write_str("awaiting confirmation"),
        }
    }
}

/// Something that finished as a result of an inbound event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    TransformFinished { mode: Mode },
    /// Transform resolved by a status report after the grace period
    TransformConfirmed { expected: Mode, mode: Mode },
    ActionFinished { slot: u8 },
    Confirmed { mode: Mode },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RobotState {
    mode: Mode,
    activity: Activity,
    transform_acks: u8,
    pending_target: Option<Mode>,
    battery: Option<u8>,
    fast_mode: bool,
}

impl Default for RobotState {
    fn default() -> Self {
        Self::new()
    }
}

impl RobotState {
    pub fn new() -> Self {
        Self {
            mode: Mode::Unknown,
            activity: Activity::Idle,
            transform_acks: 0,
            pending_target: None,
            battery: None,
            fast_mode: false,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn activity(&self) -> Activity {
        self.activity
    }

    pub fn battery(&self) -> Option<u8> {
        self.battery
    }

    pub fn fast_mode(&self) -> bool {
        self.fast_mode
    }

    pub fn set_fast_mode(&mut self, fast: bool) {
        self.fast_mode = fast;
    }

    pub fn phase(&self) -> Phase {
        if let Some(target) = self.mode.transform_target() {
            return Phase::Transforming { target };
        }
        match self.activity {
            Activity::Idle => Phase::Idle,
            Activity::Moving => Phase::Moving,
            Activity::Acting { slot } => Phase::Acting { slot },
            Activity::AwaitingConfirmation => Phase::AwaitingConfirmation,
        }
    }

    /// Transforming or acting. No status query may be issued.
    pub fn is_busy(&self) -> bool {
        matches!(
            self.phase(),
            Phase::Transforming { .. } | Phase::Acting { .. }
        )
    }

    /// Periodic polling only happens from a quiet idle robot.
    pub fn can_poll(&self) -> bool {
        self.phase() == Phase::Idle
    }

    pub fn begin_motion(&mut self) -> Result<(), StateViolation> {
        match self.phase() {
            Phase::Idle | Phase::Moving | Phase::AwaitingConfirmation => {
                self.activity = Activity::Moving;
                Ok(())
            }
            phase => Err(StateViolation::NotAllowed {
                command: "motion",
                phase,
            }),
        }
    }

    /// Stop is always accepted. Returns the phase that was interrupted.
    ///
    /// Stopping a transform part-way leaves the mode unknown.
    pub fn stop(&mut self) -> Phase {
        let previous = self.phase();
        if self.mode.is_transforming() {
            self.mode = Mode::Unknown;
        }
        self.transform_acks = 0;
        self.pending_target = None;
        self.activity = Activity::Idle;
        previous
    }

    pub fn motion_timed_out(&mut self) -> bool {
        if self.phase() == Phase::Moving {
            self.activity = Activity::Idle;
            return true;
        }
        false
    }

    /// Returns the mode the robot is heading for.
    pub fn begin_transform(&mut self) -> Result<Mode, StateViolation> {
        match self.phase() {
            Phase::Transforming { .. } => Err(StateViolation::AlreadyTransforming),
            Phase::Idle | Phase::Moving | Phase::AwaitingConfirmation => {
                let target = self
                    .mode
                    .complement()
                    .ok_or(StateViolation::ModeUnknown {
                        command: "transform",
                    })?;
                // complement() only yields Robot or Vehicle
                self.mode = Mode::transforming_to(target).unwrap_or(Mode::Unknown);
                self.activity = Activity::Idle;
                self.transform_acks = 0;
                self.pending_target = None;
                Ok(target)
            }
            phase => Err(StateViolation::NotAllowed {
                command: "transform",
                phase,
            }),
        }
    }

    /// Grace period over without the finishing acknowledgement.
    ///
    /// Returns true when the caller should issue the single fallback status query.
    pub fn transform_grace_elapsed(&mut self) -> bool {
        let Some(target) = self.mode.transform_target() else {
            return false;
        };
        self.pending_target = Some(target);
        self.mode = Mode::Unknown;
        self.activity = Activity::AwaitingConfirmation;
        self.transform_acks = 0;
        true
    }

    pub fn begin_action(&mut self, slot: u8) -> Result<(), StateViolation> {
        match self.phase() {
            Phase::Acting { .. } => Err(StateViolation::AlreadyActing),
            Phase::Idle | Phase::AwaitingConfirmation => {
                self.activity = Activity::Acting { slot };
                Ok(())
            }
            phase => Err(StateViolation::NotAllowed {
                command: "action",
                phase,
            }),
        }
    }

    pub fn action_elapsed(&mut self, slot: u8) -> bool {
        if self.activity == (Activity::Acting { slot }) {
            self.activity = Activity::Idle;
            return true;
        }
        false
    }

    /// Called right before a status query goes out.
    pub fn begin_query(&mut self) -> Result<(), StateViolation> {
        match self.phase() {
            Phase::Transforming { .. } | Phase::Acting { .. } => Err(StateViolation::NotAllowed {
                command: "status query",
                phase: self.phase(),
            }),
            Phase::Idle => {
                self.activity = Activity::AwaitingConfirmation;
                Ok(())
            }
            Phase::Moving | Phase::AwaitingConfirmation => Ok(()),
        }
    }

    pub fn confirmation_timed_out(&mut self) -> bool {
        if self.activity == Activity::AwaitingConfirmation {
            self.activity = Activity::Idle;
            self.pending_target = None;
            return true;
        }
        false
    }

    /// Servo and speed changes need a settled robot in a known mode.
    pub fn check_configurable(&self, command: &'static str) -> Result<(), StateViolation> {
        match self.phase() {
            Phase::Idle | Phase::AwaitingConfirmation if self.mode.is_known() => Ok(()),
            Phase::Idle | Phase::AwaitingConfirmation => {
                Err(StateViolation::ModeUnknown { command })
            }
            phase => Err(StateViolation::NotAllowed { command, phase }),
        }
    }

    /// Fold an inbound event into the state.
    pub fn apply(&mut self, event: &DecodedEvent, platform: Platform) -> Option<Completion> {
        match event {
            DecodedEvent::StatusReport(report) => self.apply_report(report, platform),
            DecodedEvent::TransformAck => {
                let target = self.mode.transform_target()?;
                self.transform_acks += 1;
                if self.transform_acks < 2 {
                    return None;
                }
                self.mode = target;
                self.activity = Activity::Idle;
                self.transform_acks = 0;
                Some(Completion::TransformFinished { mode: target })
            }
            DecodedEvent::ActionAck => self.finish_action(),
            DecodedEvent::ActionProgress { percent } if *percent >= 100 => self.finish_action(),
            DecodedEvent::ActionProgress { .. }
            | DecodedEvent::DeviceInfo { .. }
            | DecodedEvent::Unknown { .. } => None,
        }
    }

    fn finish_action(&mut self) -> Option<Completion> {
        match self.activity {
            Activity::Acting { slot } => {
                self.activity = Activity::Idle;
                Some(Completion::ActionFinished { slot })
            }
            _ => None,
        }
    }

    fn apply_report(&mut self, report: &StatusReport, platform: Platform) -> Option<Completion> {
        if let Some(battery) = report.battery {
            self.battery = Some(battery);
        }
        if let Some(fast) = report.fast_mode {
            self.fast_mode = fast;
        }

        // mid-transform reports say nothing reliable about the final mode
        if self.mode.is_transforming() {
            return None;
        }

        let inferred = if report.mode.is_known() {
            Some(report.mode)
        } else {
            servo_map::infer_mode(platform, &report.servos)
        };
        let resolved = inferred?;

        self.mode = resolved;
        if self.activity != Activity::AwaitingConfirmation {
            return None;
        }
        self.activity = Activity::Idle;
        match self.pending_target.take() {
            Some(expected) => Some(Completion::TransformConfirmed {
                expected,
                mode: resolved,
            }),
            None => Some(Completion::Confirmed { mode: resolved }),
        }
    }
}
