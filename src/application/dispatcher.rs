//! Dispatch core
//!
//! Translates every [`EngineEvent`] into a list of [`Effect`]s. The
//! dispatcher owns all per-robot state but performs no I/O, which keeps the
//! ordering and legality rules testable without a runtime. The engine applies
//! the effects to the connection manager and the timer registry.

use crate::domain::command::Command;
use crate::domain::intent::{Intent, IntentEnvelope, IntentTarget};
use crate::domain::models::{
    Activity, BleAddress, DecodedEvent, DiscoveredRobot, EngineEvent, InfoKind, MessageSeverity,
    Mode, RobotId, ServoSnapshot, StatusMessage, TimerKind,
};
use crate::domain::profile::{ProfileRegistry, RobotProfile};
use crate::domain::robot_state::{Completion, Phase, RobotState};
use crate::domain::servo_map;
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::protocol::{self, PoseContext};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Commands sent to every robot right after it connects
const HANDSHAKE: [Command; 6] = [
    Command::ClearAction,
    Command::QueryInfo(InfoKind::Model),
    Command::QueryInfo(InfoKind::Version),
    Command::QueryInfo(InfoKind::FirmwareDate),
    Command::QueryInfo(InfoKind::SerialNumber),
    Command::QueryState,
];

#[derive(Debug, Clone)]
pub enum Effect {
    Send {
        robot: RobotId,
        command: Command,
        frame: Vec<u8>,
        repeat: u8,
    },
    Schedule {
        robot: RobotId,
        kind: TimerKind,
        token: u64,
        after: Duration,
    },
    CancelTimers { robot: RobotId },
    Connect { robot: RobotId, device: DiscoveredRobot },
    Reconnect { robot: RobotId, device: DiscoveredRobot },
    Disconnect { robot: RobotId },
    Rescan,
    DisconnectAll,
    Notice(StatusMessage),
}

fn notice(severity: MessageSeverity, message: impl Into<String>) -> Effect {
    Effect::Notice(StatusMessage::new(severity, message))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    Reconnecting,
}

/// Everything the dispatcher knows about one robot
#[derive(Debug, Clone)]
pub struct RobotConnection {
    pub id: RobotId,
    pub device: DiscoveredRobot,
    pub profile: Arc<RobotProfile>,
    pub state: RobotState,
    pub link: LinkState,
    pub servos: ServoSnapshot,
    pub info: HashMap<InfoKind, String>,
    pub last_activity: Instant,
    /// Attempts the most recent successful connect needed
    pub connect_attempts: u32,
    shutting_down: bool,
    timers: HashMap<TimerKind, u64>,
    cooldowns: HashMap<u8, Instant>,
}

impl RobotConnection {
    fn new(id: RobotId, device: DiscoveredRobot, profile: Arc<RobotProfile>, now: Instant) -> Self {
        Self {
            id,
            device,
            profile,
            state: RobotState::new(),
            link: LinkState::Connecting,
            servos: ServoSnapshot::new(),
            info: HashMap::new(),
            last_activity: now,
            connect_attempts: 0,
            shutting_down: false,
            timers: HashMap::new(),
            cooldowns: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.device.name
    }

    pub fn is_connected(&self) -> bool {
        self.link == LinkState::Connected
    }

    fn schedule(&mut self, kind: TimerKind, after: Duration, tokens: &mut u64) -> Effect {
        *tokens += 1;
        let token = *tokens;
        self.timers.insert(kind, token);
        Effect::Schedule {
            robot: self.id,
            kind,
            token,
            after,
        }
    }

    fn clear_timer(&mut self, kind: TimerKind) {
        self.timers.remove(&kind);
    }

    /// Drops all timer tokens and returns the effect cancelling the tasks.
    fn cancel_timers(&mut self) -> Effect {
        self.timers.clear();
        Effect::CancelTimers { robot: self.id }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Motion with no follow-up intent for this long is stopped
    pub motion_idle: Duration,
    pub confirm_timeout: Duration,
    pub max_robots: Option<usize>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            motion_idle: Duration::from_secs(2),
            confirm_timeout: Duration::from_secs(3),
            max_robots: None,
        }
    }
}

impl DispatcherConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            motion_idle: Duration::from_millis(settings.motion_idle_ms),
            confirm_timeout: Duration::from_millis(settings.confirm_timeout_ms),
            max_robots: settings.max_robots,
        }
    }
}

pub struct Dispatcher {
    profiles: Arc<ProfileRegistry>,
    config: DispatcherConfig,
    robots: BTreeMap<RobotId, RobotConnection>,
    /// Ids are only ever reused for the same device
    ids: HashMap<BleAddress, RobotId>,
    next_id: RobotId,
    next_token: u64,
}

impl Dispatcher {
    pub fn new(profiles: Arc<ProfileRegistry>, config: DispatcherConfig) -> Self {
        Self {
            profiles,
            config,
            robots: BTreeMap::new(),
            ids: HashMap::new(),
            next_id: 1,
            next_token: 0,
        }
    }

    pub fn robot(&self, id: RobotId) -> Option<&RobotConnection> {
        self.robots.get(&id)
    }

    pub fn robots(&self) -> impl Iterator<Item = &RobotConnection> {
        self.robots.values()
    }

    pub fn connected_ids(&self) -> Vec<RobotId> {
        self.robots
            .values()
            .filter(|r| r.is_connected())
            .map(|r| r.id)
            .collect()
    }

    pub fn handle(&mut self, event: EngineEvent, now: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();
        match event {
            EngineEvent::Intent(envelope) => self.on_intent(envelope, now, &mut effects),
            EngineEvent::Discovered(device) => self.on_discovered(device, now, &mut effects),
            EngineEvent::ScanFinished { found } => {
                if found == 0 && self.robots.is_empty() {
                    effects.push(notice(
                        MessageSeverity::Warning,
                        "No robots found. Make sure the robot is powered on and in range.",
                    ));
                } else {
                    effects.push(notice(
                        MessageSeverity::Info,
                        format!("Scan finished, {} robot(s) found", found),
                    ));
                }
            }
            EngineEvent::Connected {
                robot,
                device,
                attempts,
            } => self.on_connected(robot, device, attempts, now, &mut effects),
            EngineEvent::ConnectFailed {
                robot,
                device,
                attempts,
                reason,
            } => {
                if let Some(mut conn) = self.robots.remove(&robot) {
                    error!("Giving up on {} after {} attempt(s): {}", device.name, attempts, reason);
                    effects.push(conn.cancel_timers());
                    effects.push(notice(
                        MessageSeverity::Error,
                        format!(
                            "Could not connect to {} after {} attempt(s). Rescan to try again.",
                            device.name, attempts
                        ),
                    ));
                }
            }
            EngineEvent::Inbound { robot, event } => self.on_inbound(robot, event, &mut effects),
            EngineEvent::LinkLost { robot, reason } => {
                self.on_link_lost(robot, reason, &mut effects)
            }
            EngineEvent::PollTick { robot } => {
                let Self {
                    robots,
                    next_token,
                    config,
                    ..
                } = self;
                if let Some(conn) = robots.get_mut(&robot) {
                    if conn.is_connected() && conn.state.can_poll() {
                        execute(conn, Command::QueryState, now, next_token, config, &mut effects);
                    } else {
                        trace!("Skipping poll of {} while {}", conn.name(), conn.state.phase());
                    }
                }
            }
            EngineEvent::Timer { robot, kind, token } => {
                self.on_timer(robot, kind, token, now, &mut effects)
            }
        }
        effects
    }

    fn on_intent(&mut self, envelope: IntentEnvelope, now: Instant, effects: &mut Vec<Effect>) {
        let IntentEnvelope { intent, target } = envelope;
        debug!("Intent {} for {:?}", intent.name(), target);

        if intent.is_fleet_wide() {
            self.tear_down(effects);
            effects.push(Effect::DisconnectAll);
            if intent == Intent::Rescan {
                effects.push(notice(MessageSeverity::Info, "Scanning for robots..."));
                effects.push(Effect::Rescan);
            } else {
                effects.push(notice(MessageSeverity::Info, "Disconnected all robots"));
            }
            return;
        }

        let targets = match target {
            IntentTarget::All => {
                let ids = self.connected_ids();
                if ids.is_empty() {
                    effects.push(notice(MessageSeverity::Info, "No robots connected"));
                }
                ids
            }
            IntentTarget::Robot(id) => match self.robots.get(&id) {
                Some(conn) if conn.is_connected() => vec![id],
                _ => {
                    effects.push(notice(
                        MessageSeverity::Warning,
                        format!("Robot {} is not connected", id),
                    ));
                    Vec::new()
                }
            },
        };

        let Self {
            robots,
            next_token,
            config,
            ..
        } = self;
        for id in targets {
            let Some(conn) = robots.get_mut(&id) else {
                continue;
            };
            match translate(conn, &intent) {
                Ok(commands) => {
                    for command in commands {
                        execute(conn, command, now, next_token, config, effects);
                    }
                }
                Err(reason) => {
                    debug!("{}: {} dropped: {}", conn.name(), intent.name(), reason);
                    effects.push(notice(
                        MessageSeverity::Warning,
                        format!("{}: {}", conn.name(), reason),
                    ));
                }
            }
        }
    }

    /// Forget every robot. In-flight connects and timers go with them.
    fn tear_down(&mut self, effects: &mut Vec<Effect>) {
        for (_, mut conn) in std::mem::take(&mut self.robots) {
            effects.push(conn.cancel_timers());
        }
    }

    fn on_discovered(&mut self, device: DiscoveredRobot, now: Instant, effects: &mut Vec<Effect>) {
        if let Some(id) = self.ids.get(&device.address) {
            if self.robots.contains_key(id) {
                trace!("{} already known as robot {}", device.name, id);
                return;
            }
        }
        if let Some(max) = self.config.max_robots {
            if self.robots.len() >= max {
                info!("Ignoring {}, already at {} robot(s)", device.name, max);
                return;
            }
        }

        let id = match self.ids.get(&device.address) {
            Some(id) => *id,
            None => {
                let id = self.next_id;
                self.next_id += 1;
                self.ids.insert(device.address, id);
                id
            }
        };

        let profile = self.profiles.get(device.platform);
        info!(
            "Found {} '{}' at {} ({} dBm), robot {}",
            profile.display_name, device.name, device.address, device.signal_strength, id
        );
        effects.push(notice(
            MessageSeverity::Info,
            format!("Found {} '{}', connecting...", profile.display_name, device.name),
        ));
        self.robots
            .insert(id, RobotConnection::new(id, device.clone(), profile, now));
        effects.push(Effect::Connect { robot: id, device });
    }

    fn on_connected(
        &mut self,
        robot: RobotId,
        device: DiscoveredRobot,
        attempts: u32,
        now: Instant,
        effects: &mut Vec<Effect>,
    ) {
        let Self {
            robots,
            next_token,
            config,
            ..
        } = self;
        let Some(conn) = robots.get_mut(&robot) else {
            warn!("Connected to {} but robot {} is no longer tracked", device.name, robot);
            effects.push(Effect::Disconnect { robot });
            return;
        };

        let reconnected = conn.link == LinkState::Reconnecting;
        conn.device = device;
        conn.link = LinkState::Connected;
        conn.state = RobotState::new();
        conn.connect_attempts = attempts;
        conn.shutting_down = false;
        conn.timers.clear();

        info!("Robot {} connected: {} ({} attempt(s))", robot, conn.name(), attempts);
        let message = if reconnected {
            format!("Reconnected to {}", conn.name())
        } else {
            format!("Connected to {} as robot {}", conn.name(), robot)
        };
        effects.push(notice(MessageSeverity::Success, message));

        for command in HANDSHAKE {
            execute(conn, command, now, next_token, config, effects);
        }
    }

    fn on_link_lost(&mut self, robot: RobotId, reason: String, effects: &mut Vec<Effect>) {
        let Some(conn) = self.robots.get_mut(&robot) else {
            return;
        };
        if !conn.is_connected() {
            trace!("Ignoring duplicate link loss for {}", conn.name());
            return;
        }

        effects.push(conn.cancel_timers());
        effects.push(Effect::Disconnect { robot });

        if conn.shutting_down {
            info!("{} powered off", conn.name());
            effects.push(notice(
                MessageSeverity::Info,
                format!("{} powered off", conn.name()),
            ));
            self.robots.remove(&robot);
            return;
        }

        warn!("Lost link to {}: {}", conn.name(), reason);
        conn.link = LinkState::Reconnecting;
        conn.state = RobotState::new();
        effects.push(notice(
            MessageSeverity::Warning,
            format!("Lost connection to {}, reconnecting...", conn.name()),
        ));
        effects.push(Effect::Reconnect {
            robot,
            device: conn.device.clone(),
        });
    }

    fn on_inbound(&mut self, robot: RobotId, event: DecodedEvent, effects: &mut Vec<Effect>) {
        let Some(conn) = self.robots.get_mut(&robot) else {
            return;
        };

        match &event {
            DecodedEvent::DeviceInfo { kind, text } => {
                info!("{}: {:?} = {}", conn.name(), kind, text);
                conn.info.insert(*kind, text.clone());
            }
            DecodedEvent::StatusReport(report) => {
                conn.servos
                    .extend(report.servos.iter().map(|(label, value)| (*label, *value)));
            }
            DecodedEvent::ActionProgress { percent } => {
                trace!("{}: action at {}%", conn.name(), percent);
            }
            DecodedEvent::Unknown { tag } => {
                debug!("{}: unhandled event {:#04X}", conn.name(), tag);
            }
            DecodedEvent::ActionAck | DecodedEvent::TransformAck => {}
        }

        let previous = conn.state.mode();
        let Some(completion) = conn.state.apply(&event, conn.profile.platform) else {
            return;
        };
        match completion {
            Completion::TransformFinished { mode } => {
                conn.clear_timer(TimerKind::TransformGrace);
                info!("{} finished transforming to {}", conn.name(), mode);
                effects.push(notice(
                    MessageSeverity::Success,
                    format!("{} is now in {} mode", conn.name(), mode),
                ));
            }
            Completion::TransformConfirmed { expected, mode } => {
                conn.clear_timer(TimerKind::ConfirmTimeout);
                if expected == mode {
                    effects.push(notice(
                        MessageSeverity::Success,
                        format!("{} is now in {} mode", conn.name(), mode),
                    ));
                } else {
                    warn!("{} expected {} after transform, found {}", conn.name(), expected, mode);
                    effects.push(notice(
                        MessageSeverity::Warning,
                        format!(
                            "{} did not transform, still in {} mode",
                            conn.name(),
                            mode
                        ),
                    ));
                }
            }
            Completion::ActionFinished { slot } => {
                conn.clear_timer(TimerKind::ActionElapsed);
                debug!("{}: action slot {} finished", conn.name(), slot);
            }
            Completion::Confirmed { mode } => {
                conn.clear_timer(TimerKind::ConfirmTimeout);
                if previous != mode {
                    effects.push(notice(
                        MessageSeverity::Info,
                        format!("{} is in {} mode", conn.name(), mode),
                    ));
                }
            }
        }
    }

    fn on_timer(
        &mut self,
        robot: RobotId,
        kind: TimerKind,
        token: u64,
        now: Instant,
        effects: &mut Vec<Effect>,
    ) {
        let Self {
            robots,
            next_token,
            config,
            ..
        } = self;
        let Some(conn) = robots.get_mut(&robot) else {
            return;
        };
        if conn.timers.get(&kind) != Some(&token) {
            trace!("Stale {:?} timer #{} for {}", kind, token, conn.name());
            return;
        }
        conn.timers.remove(&kind);

        match kind {
            TimerKind::MotionIdle => {
                if conn.state.motion_timed_out() {
                    debug!("{}: no motion input, stopping", conn.name());
                    execute(conn, Command::Stop, now, next_token, config, effects);
                }
            }
            TimerKind::ActionElapsed => {
                if let Activity::Acting { slot } = conn.state.activity() {
                    conn.state.action_elapsed(slot);
                    debug!("{}: action slot {} assumed finished", conn.name(), slot);
                }
            }
            TimerKind::TransformGrace => {
                if conn.state.transform_grace_elapsed() {
                    warn!("{}: transform not acknowledged, querying state", conn.name());
                    effects.push(notice(
                        MessageSeverity::Warning,
                        format!("{} did not confirm the transform, checking...", conn.name()),
                    ));
                    execute(conn, Command::QueryState, now, next_token, config, effects);
                }
            }
            TimerKind::ConfirmTimeout => {
                if conn.state.confirmation_timed_out() {
                    debug!("{}: status query went unanswered", conn.name());
                }
            }
        }
    }
}

/// A released stick only matters if something is moving.
fn release(conn: &RobotConnection) -> Vec<Command> {
    if conn.state.phase() == Phase::Moving {
        vec![Command::Stop]
    } else {
        Vec::new()
    }
}

/// Resolve an intent against the robot's profile and current mode.
fn translate(conn: &RobotConnection, intent: &Intent) -> Result<Vec<Command>, String> {
    let mode = conn.state.mode();
    let profile = &conn.profile;

    let commands = match intent {
        Intent::Move { direction, speed } => {
            match servo_map::clamp_speed(profile.platform, mode, *speed) {
                0 => release(conn),
                speed => vec![Command::Move {
                    direction: *direction,
                    speed,
                }],
            }
        }
        Intent::Turn { direction, rate } => {
            match servo_map::clamp_speed(profile.platform, mode, *rate) {
                0 => release(conn),
                rate => vec![Command::Turn {
                    direction: *direction,
                    rate,
                }],
            }
        }
        Intent::Step { side } => match profile.horn(*side) {
            Some(horn) if mode == Mode::Vehicle => vec![Command::Action { slot: horn.slot }],
            _ => vec![Command::Step { side: *side }],
        },
        Intent::Stop => vec![Command::Stop],
        Intent::Transform => vec![Command::Transform],
        Intent::Action(button) => {
            let action = profile
                .action_for_button(*button, mode)
                .ok_or_else(|| format!("no action on button {} in {} mode", button, mode))?;
            vec![Command::Action { slot: action.slot }]
        }
        Intent::ToggleSpeed => vec![Command::SetSpeedMode {
            fast: !conn.state.fast_mode(),
        }],
        Intent::SetServo { label, value } => {
            let spec = servo_map::find(profile.platform, label).map_err(|e| e.to_string())?;
            vec![Command::SetServo {
                label: spec.label,
                value: *value,
            }]
        }
        Intent::QueryPosition => vec![Command::QueryPosition],
        Intent::QueryInfo => InfoKind::ALL.map(Command::QueryInfo).to_vec(),
        Intent::Shutdown => vec![Command::Shutdown],
        Intent::RunSequence { id } => vec![Command::RunSequence { id: *id }],
        Intent::Rescan | Intent::DisconnectAll => Vec::new(),
    };
    Ok(commands)
}

/// Encode one command, run its state transition and emit the send.
///
/// Nothing is sent when encoding fails or the transition is refused, so the
/// state machine and the wire never disagree.
fn execute(
    conn: &mut RobotConnection,
    command: Command,
    now: Instant,
    tokens: &mut u64,
    config: &DispatcherConfig,
    effects: &mut Vec<Effect>,
) {
    let encoded = match command {
        Command::SetServo { .. } => {
            let pose = PoseContext::new(conn.state.mode(), conn.servos.clone());
            protocol::encode_with_pose(&command, &conn.profile, Some(&pose))
        }
        _ => protocol::encode(&command, &conn.profile),
    };
    let frame = match encoded {
        Ok(frame) => frame,
        Err(e) => {
            warn!("{}: {}", conn.name(), e);
            effects.push(notice(
                MessageSeverity::Warning,
                format!("{}: {}", conn.name(), e),
            ));
            return;
        }
    };

    let mut repeat = 1;
    let mut timer = None;
    let transition = match command {
        Command::Move { .. } | Command::Turn { .. } | Command::Step { .. } => conn
            .state
            .begin_motion()
            .map(|()| timer = Some((TimerKind::MotionIdle, config.motion_idle))),
        Command::Stop => {
            effects.push(conn.cancel_timers());
            if let Phase::Transforming { target } = conn.state.stop() {
                warn!("{}: transform to {} interrupted", conn.name(), target);
                effects.push(notice(
                    MessageSeverity::Warning,
                    format!("{} stopped mid-transform, mode unknown", conn.name()),
                ));
            }
            repeat = conn.profile.timings.stop_repeats.max(1);
            Ok(())
        }
        Command::Transform => conn.state.begin_transform().map(|target| {
            info!("{} transforming to {}", conn.name(), target);
            effects.push(notice(
                MessageSeverity::Info,
                format!("{} transforming to {} mode...", conn.name(), target),
            ));
            timer = Some((
                TimerKind::TransformGrace,
                conn.profile.timings.transform_grace,
            ));
        }),
        Command::Action { slot } => {
            let Some(action) = conn.profile.action(slot).copied() else {
                return;
            };
            if let Some(until) = conn.cooldowns.get(&slot) {
                if now < *until {
                    debug!("{}: {} is cooling down", conn.name(), action.name);
                    return;
                }
            }
            conn.state.begin_action(slot).map(|()| {
                if let Some(cooldown) = action.cooldown {
                    conn.cooldowns.insert(slot, now + cooldown);
                }
                timer = Some((TimerKind::ActionElapsed, action.duration));
            })
        }
        Command::SetServo { label, value } => {
            conn.state.check_configurable(command.name()).map(|()| {
                let mode = conn.state.mode();
                if let Ok(resolved) =
                    servo_map::resolve(conn.profile.platform, mode, label, value)
                {
                    conn.servos.insert(label, resolved);
                }
            })
        }
        Command::SetSpeedMode { fast } => conn
            .state
            .check_configurable(command.name())
            .map(|()| conn.state.set_fast_mode(fast)),
        Command::QueryState | Command::QueryPosition => conn
            .state
            .begin_query()
            .map(|()| timer = Some((TimerKind::ConfirmTimeout, config.confirm_timeout))),
        Command::Shutdown => {
            conn.shutting_down = true;
            Ok(())
        }
        Command::QueryInfo(_)
        | Command::ClearAction
        | Command::RunSequence { .. }
        | Command::Rescan
        | Command::DisconnectAll => Ok(()),
    };

    if let Err(violation) = transition {
        debug!("{}: {} refused: {}", conn.name(), command.name(), violation);
        if !matches!(
            command,
            Command::Move { .. }
                | Command::Turn { .. }
                | Command::Step { .. }
                | Command::QueryState
        ) {
            effects.push(notice(
                MessageSeverity::Warning,
                format!("{}: {}", conn.name(), violation),
            ));
        }
        return;
    }

    conn.last_activity = now;
    effects.push(Effect::Send {
        robot: conn.id,
        command,
        frame,
        repeat,
    });
    if let Some((kind, after)) = timer {
        effects.push(conn.schedule(kind, after, tokens));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{MoveDirection, Platform, Side, StatusReport, TurnDirection};
    use crate::domain::profile::button;
    use proptest::prelude::*;

    fn device(platform: Platform, address: u64) -> DiscoveredRobot {
        let name = match platform {
            Platform::Grimlock => "GSEG-0001",
            Platform::Megatron => "MEG-0001",
            _ => "OP-M-0001",
        };
        DiscoveredRobot {
            address: BleAddress(address),
            name: name.to_string(),
            platform,
            signal_strength: -60,
        }
    }

    fn sent(effects: &[Effect]) -> Vec<Command> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Send { command, .. } => Some(*command),
                _ => None,
            })
            .collect()
    }

    fn timer(effects: &[Effect], wanted: TimerKind) -> Option<u64> {
        effects.iter().find_map(|e| match e {
            Effect::Schedule { kind, token, .. } if *kind == wanted => Some(*token),
            _ => None,
        })
    }

    fn report(mode: Mode) -> EngineEvent {
        EngineEvent::Inbound {
            robot: 1,
            event: DecodedEvent::StatusReport(StatusReport::new(mode)),
        }
    }

    fn intent(intent: Intent) -> EngineEvent {
        EngineEvent::Intent(IntentEnvelope::robot(1, intent))
    }

    /// Robot 1 connected and confirmed in `mode`.
    fn connected(platform: Platform, mode: Mode) -> (Dispatcher, Instant) {
        let now = Instant::now();
        let mut dispatcher =
            Dispatcher::new(Arc::new(ProfileRegistry::builtin()), DispatcherConfig::default());
        let dev = device(platform, 0xA1);
        dispatcher.handle(EngineEvent::Discovered(dev.clone()), now);
        dispatcher.handle(
            EngineEvent::Connected {
                robot: 1,
                device: dev,
                attempts: 1,
            },
            now,
        );
        dispatcher.handle(report(mode), now);
        assert_eq!(dispatcher.robot(1).map(|r| r.state.phase()), Some(Phase::Idle));
        (dispatcher, now)
    }

    #[test]
    fn test_discovery_connect_and_handshake() {
        let now = Instant::now();
        let mut dispatcher =
            Dispatcher::new(Arc::new(ProfileRegistry::builtin()), DispatcherConfig::default());
        let dev = device(Platform::OptimusPrimeFlagship, 0xA1);

        let effects = dispatcher.handle(EngineEvent::Discovered(dev.clone()), now);
        assert!(matches!(effects.last(), Some(Effect::Connect { robot: 1, .. })));
        // a second sighting of the same device is ignored
        assert!(dispatcher
            .handle(EngineEvent::Discovered(dev.clone()), now)
            .is_empty());

        let effects = dispatcher.handle(
            EngineEvent::Connected {
                robot: 1,
                device: dev,
                attempts: 2,
            },
            now,
        );
        assert_eq!(sent(&effects), HANDSHAKE.to_vec());
        assert!(timer(&effects, TimerKind::ConfirmTimeout).is_some());
        assert_eq!(dispatcher.robot(1).map(|r| r.connect_attempts), Some(2));
        assert_eq!(
            dispatcher.robot(1).map(|r| r.state.phase()),
            Some(Phase::AwaitingConfirmation)
        );

        let effects = dispatcher.handle(report(Mode::Robot), now);
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Notice(StatusMessage { message, .. }) if message.contains("robot mode")
        )));
    }

    #[test]
    fn test_second_transform_sends_nothing() {
        let (mut dispatcher, now) = connected(Platform::OptimusPrimeFlagship, Mode::Robot);
        let effects = dispatcher.handle(intent(Intent::Transform), now);
        assert_eq!(sent(&effects), vec![Command::Transform]);

        let effects = dispatcher.handle(intent(Intent::Transform), now);
        assert!(sent(&effects).is_empty());
    }

    #[test]
    fn test_transform_while_acting_sends_nothing() {
        let (mut dispatcher, now) = connected(Platform::OptimusPrimeFlagship, Mode::Robot);
        let effects = dispatcher.handle(intent(Intent::Action(button::MELEE)), now);
        assert_eq!(sent(&effects), vec![Command::Action { slot: 0 }]);

        let effects = dispatcher.handle(intent(Intent::Transform), now);
        assert!(sent(&effects).is_empty());
        let effects = dispatcher.handle(EngineEvent::PollTick { robot: 1 }, now);
        assert!(sent(&effects).is_empty());
    }

    #[test]
    fn test_two_acks_finish_transform() {
        let (mut dispatcher, now) = connected(Platform::OptimusPrimeFlagship, Mode::Robot);
        let effects = dispatcher.handle(intent(Intent::Transform), now);
        let grace = timer(&effects, TimerKind::TransformGrace);

        let ack = || EngineEvent::Inbound {
            robot: 1,
            event: DecodedEvent::TransformAck,
        };
        dispatcher.handle(ack(), now);
        assert!(dispatcher.robot(1).is_some_and(|r| r.state.is_busy()));
        dispatcher.handle(ack(), now);
        assert_eq!(dispatcher.robot(1).map(|r| r.state.mode()), Some(Mode::Vehicle));

        // the grace timer is now stale
        let effects = dispatcher.handle(
            EngineEvent::Timer {
                robot: 1,
                kind: TimerKind::TransformGrace,
                token: grace.unwrap_or_default(),
            },
            now,
        );
        assert!(effects.is_empty());
    }

    #[test]
    fn test_grace_fallback_queries_once() {
        let (mut dispatcher, now) = connected(Platform::OptimusPrimeFlagship, Mode::Robot);
        let effects = dispatcher.handle(intent(Intent::Transform), now);
        let grace = timer(&effects, TimerKind::TransformGrace).unwrap_or_default();
        let fire = EngineEvent::Timer {
            robot: 1,
            kind: TimerKind::TransformGrace,
            token: grace,
        };

        let effects = dispatcher.handle(fire, now);
        assert_eq!(sent(&effects), vec![Command::QueryState]);

        // refiring the same token and polling do not add queries
        let refire = EngineEvent::Timer {
            robot: 1,
            kind: TimerKind::TransformGrace,
            token: grace,
        };
        assert!(sent(&dispatcher.handle(refire, now)).is_empty());
        assert!(sent(&dispatcher.handle(EngineEvent::PollTick { robot: 1 }, now)).is_empty());

        // a mode-less reply whose servos show the vehicle pose resolves it
        let mut vehicle = StatusReport::new(Mode::Unknown);
        vehicle.servos =
            servo_map::default_neutral(Platform::OptimusPrimeFlagship, Mode::Vehicle);
        let effects = dispatcher.handle(
            EngineEvent::Inbound {
                robot: 1,
                event: DecodedEvent::StatusReport(vehicle),
            },
            now,
        );
        let robot = dispatcher.robot(1);
        assert_eq!(robot.map(|r| r.state.mode()), Some(Mode::Vehicle));
        assert_eq!(robot.map(|r| r.state.phase()), Some(Phase::Idle));
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Notice(StatusMessage { severity: MessageSeverity::Success, .. })
        )));
    }

    #[test]
    fn test_motion_idle_sends_stop() {
        let (mut dispatcher, now) = connected(Platform::OptimusPrimeFlagship, Mode::Robot);
        let first = dispatcher.handle(
            intent(Intent::Move {
                direction: MoveDirection::Forward,
                speed: 60,
            }),
            now,
        );
        let stale = timer(&first, TimerKind::MotionIdle).unwrap_or_default();
        let second = dispatcher.handle(
            intent(Intent::Move {
                direction: MoveDirection::Forward,
                speed: 80,
            }),
            now,
        );
        let current = timer(&second, TimerKind::MotionIdle).unwrap_or_default();

        let fire = |token| EngineEvent::Timer {
            robot: 1,
            kind: TimerKind::MotionIdle,
            token,
        };
        assert!(dispatcher.handle(fire(stale), now).is_empty());

        let effects = dispatcher.handle(fire(current), now);
        assert_eq!(sent(&effects), vec![Command::Stop]);
        let repeat = effects.iter().find_map(|e| match e {
            Effect::Send { repeat, .. } => Some(*repeat),
            _ => None,
        });
        assert_eq!(repeat, Some(3));
    }

    #[test]
    fn test_zero_speed_only_stops_motion() {
        let (mut dispatcher, now) = connected(Platform::OptimusPrimeFlagship, Mode::Robot);
        let zero = || {
            intent(Intent::Move {
                direction: MoveDirection::Forward,
                speed: 0,
            })
        };
        assert!(sent(&dispatcher.handle(zero(), now)).is_empty());

        dispatcher.handle(
            intent(Intent::Move {
                direction: MoveDirection::Reverse,
                speed: 30,
            }),
            now,
        );
        assert_eq!(sent(&dispatcher.handle(zero(), now)), vec![Command::Stop]);
    }

    #[test]
    fn test_forward_from_idle_starts_moving() {
        let (mut dispatcher, now) = connected(Platform::OptimusPrimeFlagship, Mode::Robot);
        let effects = dispatcher.handle(
            intent(Intent::Move {
                direction: MoveDirection::Forward,
                speed: 50,
            }),
            now,
        );
        assert_eq!(
            sent(&effects),
            vec![Command::Move {
                direction: MoveDirection::Forward,
                speed: 50
            }]
        );
        assert!(timer(&effects, TimerKind::MotionIdle).is_some());
        assert_eq!(dispatcher.robot(1).map(|r| r.state.phase()), Some(Phase::Moving));
    }

    #[test]
    fn test_gait_speed_is_clamped_to_platform_range() {
        let (mut dispatcher, now) = connected(Platform::Megatron, Mode::Robot);
        let effects = dispatcher.handle(
            intent(Intent::Move {
                direction: MoveDirection::Reverse,
                speed: 250,
            }),
            now,
        );
        let limit = servo_map::clamp_speed(Platform::Megatron, Mode::Robot, i16::MAX);
        assert_eq!(limit, servo_map::DEFAULT_SPEED_LIMIT);
        assert_eq!(
            sent(&effects),
            vec![Command::Move {
                direction: MoveDirection::Reverse,
                speed: limit
            }]
        );

        let effects = dispatcher.handle(
            intent(Intent::Turn {
                direction: TurnDirection::Left,
                rate: -400,
            }),
            now,
        );
        assert_eq!(
            sent(&effects),
            vec![Command::Turn {
                direction: TurnDirection::Left,
                rate: -limit
            }]
        );
    }

    #[test]
    fn test_vehicle_step_is_horn_with_cooldown() {
        let (mut dispatcher, now) = connected(Platform::OptimusPrimeFlagship, Mode::Vehicle);
        let honk = || intent(Intent::Step { side: Side::Left });

        let effects = dispatcher.handle(honk(), now);
        assert_eq!(sent(&effects), vec![Command::Action { slot: 3 }]);
        let elapsed = timer(&effects, TimerKind::ActionElapsed).unwrap_or_default();
        dispatcher.handle(
            EngineEvent::Timer {
                robot: 1,
                kind: TimerKind::ActionElapsed,
                token: elapsed,
            },
            now,
        );

        assert!(sent(&dispatcher.handle(honk(), now + Duration::from_secs(2))).is_empty());
        assert_eq!(
            sent(&dispatcher.handle(honk(), now + Duration::from_secs(6))),
            vec![Command::Action { slot: 3 }]
        );
    }

    #[test]
    fn test_action_button_follows_mode() {
        let (mut dispatcher, now) = connected(Platform::Grimlock, Mode::Vehicle);
        let effects = dispatcher.handle(intent(Intent::Action(button::MELEE)), now);
        assert_eq!(sent(&effects), vec![Command::Action { slot: 3 }]);
    }

    #[test]
    fn test_unsupported_command_becomes_notice() {
        let (mut dispatcher, now) = connected(Platform::OptimusPrimeFlagship, Mode::Robot);
        let effects = dispatcher.handle(intent(Intent::RunSequence { id: 1 }), now);
        assert!(sent(&effects).is_empty());
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Notice(StatusMessage { severity: MessageSeverity::Warning, .. })
        )));
        assert_eq!(dispatcher.robot(1).map(|r| r.state.phase()), Some(Phase::Idle));
    }

    #[test]
    fn test_set_servo_needs_known_mode() {
        let (mut dispatcher, now) = connected(Platform::OptimusPrimeFlagship, Mode::Robot);
        let effects = dispatcher.handle(
            intent(Intent::SetServo {
                label: "leftThigh".to_string(),
                value: 20,
            }),
            now,
        );
        assert_eq!(
            sent(&effects),
            vec![Command::SetServo {
                label: "leftThigh",
                value: 20
            }]
        );
        assert_eq!(
            dispatcher.robot(1).and_then(|r| r.servos.get("leftThigh").copied()),
            Some(20)
        );

        let effects = dispatcher.handle(
            intent(Intent::SetServo {
                label: "tail".to_string(),
                value: 20,
            }),
            now,
        );
        assert!(sent(&effects).is_empty());
    }

    #[test]
    fn test_link_loss_reconnects_under_same_id() {
        let (mut dispatcher, now) = connected(Platform::OptimusPrimeFlagship, Mode::Robot);
        let effects = dispatcher.handle(
            EngineEvent::LinkLost {
                robot: 1,
                reason: "gone".to_string(),
            },
            now,
        );
        assert!(effects.iter().any(|e| matches!(e, Effect::Reconnect { robot: 1, .. })));
        assert_eq!(
            dispatcher.robot(1).map(|r| r.link),
            Some(LinkState::Reconnecting)
        );
        // the reader and writer both report the loss; only the first counts
        let again = dispatcher.handle(
            EngineEvent::LinkLost {
                robot: 1,
                reason: "gone".to_string(),
            },
            now,
        );
        assert!(again.is_empty());

        let dev = device(Platform::OptimusPrimeFlagship, 0xA1);
        dispatcher.handle(
            EngineEvent::ConnectFailed {
                robot: 1,
                device: dev.clone(),
                attempts: 5,
                reason: "unreachable".to_string(),
            },
            now,
        );
        assert!(dispatcher.robot(1).is_none());

        // rediscovery reuses the id, a new device gets a fresh one
        dispatcher.handle(EngineEvent::Discovered(dev), now);
        dispatcher.handle(
            EngineEvent::Discovered(device(Platform::Grimlock, 0xB2)),
            now,
        );
        let ids: Vec<_> = dispatcher.robots().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_shutdown_forgets_robot_on_link_loss() {
        let (mut dispatcher, now) = connected(Platform::OptimusPrimeFlagship, Mode::Robot);
        let effects = dispatcher.handle(intent(Intent::Shutdown), now);
        assert_eq!(sent(&effects), vec![Command::Shutdown]);

        let effects = dispatcher.handle(
            EngineEvent::LinkLost {
                robot: 1,
                reason: "powered off".to_string(),
            },
            now,
        );
        assert!(!effects.iter().any(|e| matches!(e, Effect::Reconnect { .. })));
        assert!(dispatcher.robot(1).is_none());
    }

    #[test]
    fn test_rescan_tears_everything_down() {
        let (mut dispatcher, now) = connected(Platform::OptimusPrimeFlagship, Mode::Robot);
        let effects = dispatcher.handle(EngineEvent::Intent(IntentEnvelope::all(Intent::Rescan)), now);

        let cancel = effects
            .iter()
            .position(|e| matches!(e, Effect::CancelTimers { robot: 1 }));
        let disconnect = effects
            .iter()
            .position(|e| matches!(e, Effect::DisconnectAll));
        let rescan = effects.iter().position(|e| matches!(e, Effect::Rescan));
        assert!(cancel < disconnect && disconnect < rescan);
        assert_eq!(dispatcher.robots().count(), 0);
    }

    #[test]
    fn test_max_robots_limits_connects() {
        let now = Instant::now();
        let config = DispatcherConfig {
            max_robots: Some(1),
            ..DispatcherConfig::default()
        };
        let mut dispatcher = Dispatcher::new(Arc::new(ProfileRegistry::builtin()), config);
        dispatcher.handle(
            EngineEvent::Discovered(device(Platform::OptimusPrimeFlagship, 1)),
            now,
        );
        let effects = dispatcher.handle(EngineEvent::Discovered(device(Platform::Grimlock, 2)), now);
        assert!(effects.is_empty());
    }

    #[test]
    fn test_intent_for_unknown_robot() {
        let (mut dispatcher, now) = connected(Platform::OptimusPrimeFlagship, Mode::Robot);
        let effects = dispatcher.handle(
            EngineEvent::Intent(IntentEnvelope::robot(9, Intent::Stop)),
            now,
        );
        assert!(sent(&effects).is_empty());
        assert_eq!(effects.len(), 1);
    }

    fn event_for(op: u8, pending: &mut Vec<(TimerKind, u64)>) -> EngineEvent {
        match op {
            0 => intent(Intent::Move {
                direction: MoveDirection::Forward,
                speed: 50,
            }),
            1 => intent(Intent::Stop),
            2 => intent(Intent::Transform),
            3 => intent(Intent::Action(button::MELEE)),
            4 => intent(Intent::Action(button::RANDOM)),
            5 => intent(Intent::QueryPosition),
            6 => intent(Intent::Step { side: Side::Right }),
            7 => EngineEvent::Inbound {
                robot: 1,
                event: DecodedEvent::TransformAck,
            },
            8 => EngineEvent::Inbound {
                robot: 1,
                event: DecodedEvent::ActionAck,
            },
            9 => report(Mode::Robot),
            10 => report(Mode::Vehicle),
            11 => report(Mode::Unknown),
            12 => EngineEvent::PollTick { robot: 1 },
            13 => intent(Intent::ToggleSpeed),
            _ => match pending.pop() {
                Some((kind, token)) => EngineEvent::Timer {
                    robot: 1,
                    kind,
                    token,
                },
                None => EngineEvent::PollTick { robot: 1 },
            },
        }
    }

    proptest! {
        #[test]
        fn prop_no_status_query_while_busy(ops in proptest::collection::vec(0u8..16, 1..80)) {
            let (mut dispatcher, start) = connected(Platform::OptimusPrimeFlagship, Mode::Robot);
            let mut pending = Vec::new();

            for (step, op) in ops.into_iter().enumerate() {
                let now = start + Duration::from_millis(step as u64 * 700);
                let before = dispatcher.robot(1).map(|r| r.state.phase());
                let is_transform = op == 2;
                let event = event_for(op, &mut pending);
                let grace_fallback = matches!(
                    event,
                    EngineEvent::Timer { kind: TimerKind::TransformGrace, .. }
                );
                let effects = dispatcher.handle(event, now);
                let queries = sent(&effects).iter().filter(|c| c.is_status_query()).count();

                for effect in &effects {
                    if let Effect::Schedule { kind, token, .. } = effect {
                        pending.insert(0, (*kind, *token));
                    }
                }

                // only the grace fallback may query a robot that was busy
                let started_busy = matches!(
                    before,
                    Some(Phase::Transforming { .. } | Phase::Acting { .. })
                );
                if started_busy && !grace_fallback {
                    prop_assert_eq!(queries, 0, "query sent from {:?}", before);
                }
                let after = dispatcher.robot(1).map(|r| r.state.clone());
                if let Some(state) = after {
                    prop_assert!(!(state.is_busy() && queries > 0));
                }
                if is_transform && matches!(before, Some(Phase::Transforming { .. })) {
                    prop_assert!(sent(&effects).is_empty());
                }
            }
        }
    }
}
