//! In-process robot fleet
//!
//! Implements [`BleTransport`] without a radio. Each simulated robot decodes
//! the frames written to it and answers the way the firmware does: state and
//! position replies, the two-stage transform acknowledgement, action progress
//! and device info. Fault hooks let tests drop links, refuse connections and
//! fail writes.

use crate::domain::command::Command;
use crate::domain::error::TransportError;
use crate::domain::models::{BleAddress, DecodedEvent, InfoKind, Mode, Platform, StatusReport};
use crate::domain::profile::{GattProfile, ProfileRegistry, RobotProfile};
use crate::domain::servo_map;
use crate::domain::settings::{Settings, SimulatedRobotSettings};
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::{
    Advertisement, AdvertisementStream, BleLink, BleTransport, EstablishedLink, LinkEvent,
    ScanHandle,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulatedTiming {
    pub advertise_interval: Duration,
    /// Time between the first and second transform acknowledgement
    pub transform_duration: Duration,
    pub action_duration: Duration,
}

impl Default for SimulatedTiming {
    fn default() -> Self {
        Self {
            advertise_interval: Duration::from_millis(250),
            transform_duration: Duration::from_secs(3),
            action_duration: Duration::from_secs(1),
        }
    }
}

#[derive(Debug)]
struct SimulatedRobot {
    name: String,
    profile: Arc<RobotProfile>,
    mode: Mode,
    battery: u8,
    fast_mode: bool,
    reachable: bool,
    fail_writes: bool,
    /// Never send the finishing transform acknowledgement
    silent_transform: bool,
    written: Vec<Vec<u8>>,
    link: Option<mpsc::UnboundedSender<LinkEvent>>,
}

impl SimulatedRobot {
    fn notify(&self, event: &DecodedEvent) {
        let Some(link) = &self.link else {
            return;
        };
        match protocol::encode_event(event, &self.profile) {
            Ok(bytes) => {
                let _ = link.send(LinkEvent::Notification(bytes));
            }
            Err(e) => debug!("{}: cannot encode {:?}: {}", self.name, event, e),
        }
    }

    fn info(&self, kind: InfoKind) -> String {
        match kind {
            InfoKind::Model => self.profile.display_name.to_string(),
            InfoKind::Version => "V1.0.0-sim".to_string(),
            InfoKind::FirmwareDate => "2023-01-01".to_string(),
            InfoKind::SerialNumber => self
                .profile
                .serial_from_name(&self.name)
                .unwrap_or(&self.name)
                .to_string(),
        }
    }
}

type Fleet = Arc<Mutex<HashMap<BleAddress, SimulatedRobot>>>;

fn lock(fleet: &Fleet) -> MutexGuard<'_, HashMap<BleAddress, SimulatedRobot>> {
    fleet.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SimulatedTransport {
    fleet: Fleet,
    profiles: Arc<ProfileRegistry>,
    timing: SimulatedTiming,
}

impl SimulatedTransport {
    pub fn new(profiles: Arc<ProfileRegistry>) -> Self {
        Self::with_timing(profiles, SimulatedTiming::default())
    }

    pub fn with_timing(profiles: Arc<ProfileRegistry>, timing: SimulatedTiming) -> Self {
        Self {
            fleet: Arc::new(Mutex::new(HashMap::new())),
            profiles,
            timing,
        }
    }

    pub fn from_settings(settings: &Settings, profiles: Arc<ProfileRegistry>) -> Self {
        let transport = Self::new(profiles);
        for robot in &settings.simulated_robots {
            transport.add_robot(robot);
        }
        transport
    }

    pub fn add_robot(&self, robot: &SimulatedRobotSettings) {
        let profile = self
            .profiles
            .match_name(&robot.name)
            .unwrap_or_else(|| self.profiles.get(Platform::Unknown));
        let mode = if robot.vehicle_mode {
            Mode::Vehicle
        } else {
            Mode::Robot
        };
        info!(
            "Simulating {} '{}' at {}",
            profile.display_name,
            robot.name,
            BleAddress(robot.address)
        );
        lock(&self.fleet).insert(
            BleAddress(robot.address),
            SimulatedRobot {
                name: robot.name.clone(),
                profile,
                mode,
                battery: robot.battery,
                fast_mode: false,
                reachable: true,
                fail_writes: false,
                silent_transform: false,
                written: Vec::new(),
                link: None,
            },
        );
    }

    fn with_robot<T>(&self, address: BleAddress, f: impl FnOnce(&mut SimulatedRobot) -> T) -> Option<T> {
        lock(&self.fleet).get_mut(&address).map(f)
    }

    pub fn set_reachable(&self, address: BleAddress, reachable: bool) {
        self.with_robot(address, |r| r.reachable = reachable);
    }

    pub fn set_fail_writes(&self, address: BleAddress, fail: bool) {
        self.with_robot(address, |r| r.fail_writes = fail);
    }

    pub fn set_silent_transform(&self, address: BleAddress, silent: bool) {
        self.with_robot(address, |r| r.silent_transform = silent);
    }

    /// Drop the link as if the robot went out of range.
    pub fn drop_link(&self, address: BleAddress, reason: &str) {
        self.with_robot(address, |r| {
            if let Some(link) = r.link.take() {
                let _ = link.send(LinkEvent::Disconnected(reason.to_string()));
            }
        });
    }

    pub fn mode(&self, address: BleAddress) -> Option<Mode> {
        self.with_robot(address, |r| r.mode)
    }

    /// Every frame written to the robot, in order
    pub fn written(&self, address: BleAddress) -> Vec<Vec<u8>> {
        self.with_robot(address, |r| r.written.clone())
            .unwrap_or_default()
    }

    pub fn written_commands(&self, address: BleAddress) -> Vec<Command> {
        self.with_robot(address, |r| {
            r.written
                .iter()
                .filter_map(|frame| protocol::decode_command(frame, &r.profile).ok())
                .collect()
        })
        .unwrap_or_default()
    }

    pub fn clear_written(&self, address: BleAddress) {
        self.with_robot(address, |r| r.written.clear());
    }
}

struct CancelOnStop(CancellationToken);

impl ScanHandle for CancelOnStop {
    fn stop(&self) {
        self.0.cancel();
    }
}

#[async_trait]
impl BleTransport for SimulatedTransport {
    async fn start_scan(&self, _gatt: &GattProfile) -> Result<AdvertisementStream, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let fleet = self.fleet.clone();
        let interval = self.timing.advertise_interval;
        let stop = cancel.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let adverts: Vec<Advertisement> = lock(&fleet)
                    .iter()
                    .filter(|(_, r)| r.reachable)
                    .map(|(address, r)| Advertisement {
                        address: *address,
                        name: r.name.clone(),
                        signal_strength: -50,
                    })
                    .collect();
                for advert in adverts {
                    if tx.send(advert).is_err() {
                        return;
                    }
                }
            }
        });

        Ok(AdvertisementStream::new(rx, Box::new(CancelOnStop(cancel))))
    }

    async fn connect(
        &self,
        address: BleAddress,
        _gatt: &GattProfile,
    ) -> Result<EstablishedLink, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut fleet = lock(&self.fleet);
        let robot = fleet.get_mut(&address).ok_or_else(|| TransportError::Unreachable {
            address,
            reason: "no such device".to_string(),
        })?;
        if !robot.reachable {
            return Err(TransportError::Unreachable {
                address,
                reason: "device did not respond".to_string(),
            });
        }
        robot.link = Some(tx);

        Ok(EstablishedLink {
            link: Arc::new(SimulatedLink {
                address,
                fleet: self.fleet.clone(),
                timing: self.timing,
            }),
            events: rx,
        })
    }
}

struct SimulatedLink {
    address: BleAddress,
    fleet: Fleet,
    timing: SimulatedTiming,
}

impl SimulatedLink {
    fn respond(&self, robot: &mut SimulatedRobot, command: Command) {
        match command {
            Command::QueryState => {
                let report = StatusReport {
                    battery: Some(robot.battery),
                    fast_mode: Some(robot.fast_mode),
                    ..StatusReport::new(robot.mode)
                };
                robot.notify(&DecodedEvent::StatusReport(report));
            }
            Command::QueryPosition => {
                let report = StatusReport {
                    servos: servo_map::default_neutral(robot.profile.platform, robot.mode),
                    ..StatusReport::new(Mode::Unknown)
                };
                robot.notify(&DecodedEvent::StatusReport(report));
            }
            Command::QueryInfo(kind) => {
                let text = robot.info(kind);
                robot.notify(&DecodedEvent::DeviceInfo { kind, text });
            }
            Command::Transform => {
                robot.notify(&DecodedEvent::TransformAck);
                let target = robot.mode.complement().unwrap_or(Mode::Robot);
                let silent = robot.silent_transform;
                let fleet = self.fleet.clone();
                let address = self.address;
                let delay = self.timing.transform_duration;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(robot) = lock(&fleet).get_mut(&address) {
                        robot.mode = target;
                        if !silent {
                            robot.notify(&DecodedEvent::TransformAck);
                        }
                    }
                });
            }
            Command::Action { .. } => {
                robot.notify(&DecodedEvent::ActionProgress { percent: 0 });
                let fleet = self.fleet.clone();
                let address = self.address;
                let delay = self.timing.action_duration;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(robot) = lock(&fleet).get_mut(&address) {
                        robot.notify(&DecodedEvent::ActionProgress { percent: 100 });
                    }
                });
            }
            Command::SetSpeedMode { fast } => robot.fast_mode = fast,
            Command::Shutdown => {
                if let Some(link) = robot.link.take() {
                    let _ = link.send(LinkEvent::Disconnected("robot powered off".to_string()));
                }
            }
            _ => {}
        }
    }
}

#[async_trait]
impl BleLink for SimulatedLink {
    async fn write(&self, frame: &[u8]) -> Result<(), TransportError> {
        let mut fleet = lock(&self.fleet);
        let robot = fleet.get_mut(&self.address).ok_or(TransportError::Closed)?;
        if robot.link.is_none() {
            return Err(TransportError::Closed);
        }
        if robot.fail_writes {
            return Err(TransportError::Write("simulated write failure".to_string()));
        }
        robot.written.push(frame.to_vec());

        match protocol::decode_command(frame, &robot.profile) {
            Ok(command) => self.respond(robot, command),
            Err(e) => debug!("{} ignores frame {:02X?}: {}", robot.name, frame, e),
        }
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(robot) = lock(&self.fleet).get_mut(&self.address) {
            robot.link = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grimlock() -> (SimulatedTransport, Arc<RobotProfile>) {
        let profiles = Arc::new(ProfileRegistry::builtin());
        let transport = SimulatedTransport::new(profiles.clone());
        transport.add_robot(&SimulatedRobotSettings {
            name: "GSEG-TEST".to_string(),
            address: 7,
            vehicle_mode: false,
            battery: 42,
        });
        (transport, profiles.get(Platform::Grimlock))
    }

    async fn next_event(link: &mut EstablishedLink, profile: &RobotProfile) -> DecodedEvent {
        match link.events.recv().await {
            Some(LinkEvent::Notification(bytes)) => protocol::decode(&bytes, profile).unwrap(),
            other => panic!("unexpected link event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transform_sends_two_acks() {
        let (transport, profile) = grimlock();
        let mut link = transport
            .connect(BleAddress(7), &GattProfile::default())
            .await
            .unwrap();

        let frame = protocol::encode(&Command::Transform, &profile).unwrap();
        link.link.write(&frame).await.unwrap();
        assert_eq!(next_event(&mut link, &profile).await, DecodedEvent::TransformAck);
        assert_eq!(transport.mode(BleAddress(7)), Some(Mode::Robot));

        assert_eq!(next_event(&mut link, &profile).await, DecodedEvent::TransformAck);
        assert_eq!(transport.mode(BleAddress(7)), Some(Mode::Vehicle));
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_and_info_replies() {
        let (transport, profile) = grimlock();
        let mut link = transport
            .connect(BleAddress(7), &GattProfile::default())
            .await
            .unwrap();

        let query = protocol::encode(&Command::QueryState, &profile).unwrap();
        link.link.write(&query).await.unwrap();
        match next_event(&mut link, &profile).await {
            DecodedEvent::StatusReport(report) => {
                assert_eq!(report.mode, Mode::Robot);
                assert_eq!(report.battery, Some(42));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let serial = protocol::encode(&Command::QueryInfo(InfoKind::SerialNumber), &profile).unwrap();
        link.link.write(&serial).await.unwrap();
        assert_eq!(
            next_event(&mut link, &profile).await,
            DecodedEvent::DeviceInfo {
                kind: InfoKind::SerialNumber,
                text: "TEST".to_string()
            }
        );
        assert_eq!(
            transport.written_commands(BleAddress(7)),
            vec![Command::QueryState, Command::QueryInfo(InfoKind::SerialNumber)]
        );
    }

    #[tokio::test]
    async fn test_unreachable_robot() {
        let (transport, _) = grimlock();
        transport.set_reachable(BleAddress(7), false);
        let err = transport
            .connect(BleAddress(7), &GattProfile::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Unreachable { .. }));
        assert!(transport
            .connect(BleAddress(99), &GattProfile::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_shutdown_drops_link() {
        let (transport, profile) = grimlock();
        let mut link = transport
            .connect(BleAddress(7), &GattProfile::default())
            .await
            .unwrap();
        let frame = protocol::encode(&Command::Shutdown, &profile).unwrap();
        link.link.write(&frame).await.unwrap();
        assert!(matches!(
            link.events.recv().await,
            Some(LinkEvent::Disconnected(_))
        ));
        assert_eq!(
            link.link.write(&frame).await,
            Err(TransportError::Closed)
        );
    }
}
