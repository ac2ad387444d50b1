//! Connection manager
//!
//! Owns every live link. Each connected robot gets three tasks:
//!
//! - a writer draining that robot's outbound FIFO
//! - a reader assembling and decoding notifications
//! - a poller emitting periodic `PollTick`s
//!
//! A slow or dead link therefore never stalls another robot. Everything the
//! tasks observe is reported back to the engine as an [`EngineEvent`].

use crate::domain::error::{EngineError, ProtocolError, TransportError};
use crate::domain::models::{DiscoveredRobot, EngineEvent, RobotId};
use crate::domain::profile::{ProfileRegistry, RobotProfile};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::connection::{connect_with_backoff, BackoffPolicy};
use crate::infrastructure::bluetooth::frame::FrameAssembler;
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::scanner::Scanner;
use crate::infrastructure::bluetooth::transport::{
    BleLink, BleTransport, EstablishedLink, LinkEvent,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerConfig {
    pub scan_window: Duration,
    pub poll_interval: Duration,
    /// Gap after every outbound command
    pub command_delay: Duration,
    /// Gap between repeats of the same frame
    pub repeat_spacing: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            scan_window: Duration::from_secs(10),
            poll_interval: Duration::from_secs(1),
            command_delay: Duration::from_millis(protocol::COMMAND_DELAY_MS),
            repeat_spacing: Duration::from_millis(protocol::REPEAT_SPACING_MS),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl ManagerConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            scan_window: Duration::from_millis(settings.scan_window_ms),
            poll_interval: Duration::from_millis(settings.poll_interval_ms.max(1)),
            command_delay: Duration::from_millis(settings.command_delay_ms),
            repeat_spacing: Duration::from_millis(settings.repeat_spacing_ms),
            backoff: BackoffPolicy::from_settings(settings),
        }
    }
}

/// Result of a background connect, handed back through [`ConnectionManager::next_ready`]
pub enum ConnectOutcome {
    Ready {
        robot: RobotId,
        device: DiscoveredRobot,
        link: EstablishedLink,
        attempts: u32,
    },
    Failed {
        robot: RobotId,
        device: DiscoveredRobot,
        attempts: u32,
        error: EngineError,
    },
}

struct Outbound {
    frame: Vec<u8>,
    repeat: u8,
}

struct LinkHandle {
    outbound: mpsc::UnboundedSender<Outbound>,
    link: Arc<dyn BleLink>,
    tasks: Vec<AbortHandle>,
}

impl LinkHandle {
    fn close(self) {
        for task in &self.tasks {
            task.abort();
        }
        let link = self.link;
        tokio::spawn(async move { link.disconnect().await });
    }
}

pub struct ConnectionManager {
    transport: Arc<dyn BleTransport>,
    profiles: Arc<ProfileRegistry>,
    config: ManagerConfig,
    events: mpsc::UnboundedSender<EngineEvent>,
    links: HashMap<RobotId, LinkHandle>,
    pending: HashMap<RobotId, AbortHandle>,
    scan: Option<AbortHandle>,
    ready_tx: mpsc::UnboundedSender<ConnectOutcome>,
    ready_rx: mpsc::UnboundedReceiver<ConnectOutcome>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn BleTransport>,
        profiles: Arc<ProfileRegistry>,
        config: ManagerConfig,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            profiles,
            config,
            events,
            links: HashMap::new(),
            pending: HashMap::new(),
            scan: None,
            ready_tx,
            ready_rx,
        }
    }

    /// Start a discovery window, replacing any scan still running.
    pub fn start_scan(&mut self) {
        self.stop_scan();

        let scanner = Scanner::new(self.transport.clone(), self.profiles.clone());
        let events = self.events.clone();
        let window = self.config.scan_window;
        let task = tokio::spawn(async move {
            match scanner.scan(window).await {
                Ok(mut session) => {
                    while let Some(robot) = session.next().await {
                        if events.send(EngineEvent::Discovered(robot)).is_err() {
                            return;
                        }
                    }
                    info!("Scan window closed, {} robot(s) found", session.found());
                    let _ = events.send(EngineEvent::ScanFinished {
                        found: session.found(),
                    });
                }
                Err(e) => {
                    error!("Failed to start scan: {}", e);
                    let _ = events.send(EngineEvent::ScanFinished { found: 0 });
                }
            }
        });
        self.scan = Some(task.abort_handle());
    }

    pub fn stop_scan(&mut self) {
        if let Some(scan) = self.scan.take() {
            debug!("Stopping BLE scan");
            scan.abort();
        }
    }

    /// Connect in the background. `reconnect` waits one backoff step first.
    pub fn connect(&mut self, robot: RobotId, device: DiscoveredRobot, reconnect: bool) {
        if let Some(previous) = self.pending.remove(&robot) {
            previous.abort();
        }

        let transport = self.transport.clone();
        let profile = self.profiles.get(device.platform);
        let policy = self.config.backoff;
        let initial_delay = if reconnect {
            policy.base
        } else {
            Duration::ZERO
        };
        let ready = self.ready_tx.clone();

        let task = tokio::spawn(async move {
            let outcome = match connect_with_backoff(
                transport.as_ref(),
                &device,
                &profile.gatt,
                policy,
                initial_delay,
            )
            .await
            {
                Ok((link, attempts)) => ConnectOutcome::Ready {
                    robot,
                    device,
                    link,
                    attempts,
                },
                Err(error) => {
                    let attempts = match &error {
                        EngineError::ConnectionFailed { attempts, .. } => *attempts,
                        _ => policy.max_attempts,
                    };
                    ConnectOutcome::Failed {
                        robot,
                        device,
                        attempts,
                        error,
                    }
                }
            };
            let _ = ready.send(outcome);
        });
        self.pending.insert(robot, task.abort_handle());
    }

    /// Wait for the next background connect to finish.
    pub async fn next_ready(&mut self) -> Option<ConnectOutcome> {
        self.ready_rx.recv().await
    }

    /// Attach a finished connect and translate it into an engine event.
    ///
    /// Returns `None` for connects that were cancelled while in flight.
    pub fn register(&mut self, outcome: ConnectOutcome) -> Option<EngineEvent> {
        match outcome {
            ConnectOutcome::Ready {
                robot,
                device,
                link,
                attempts,
            } => {
                if self.pending.remove(&robot).is_none() {
                    debug!("Dropping link to {}, no longer wanted", device.name);
                    let link = link.link;
                    tokio::spawn(async move { link.disconnect().await });
                    return None;
                }
                let profile = self.profiles.get(device.platform);
                self.attach(robot, profile, link);
                Some(EngineEvent::Connected {
                    robot,
                    device,
                    attempts,
                })
            }
            ConnectOutcome::Failed {
                robot,
                device,
                attempts,
                error,
            } => {
                self.pending.remove(&robot)?;
                Some(EngineEvent::ConnectFailed {
                    robot,
                    device,
                    attempts,
                    reason: error.to_string(),
                })
            }
        }
    }

    fn attach(&mut self, robot: RobotId, profile: Arc<RobotProfile>, established: EstablishedLink) {
        if let Some(stale) = self.links.remove(&robot) {
            stale.close();
        }

        let EstablishedLink { link, events: inbound } = established;
        let (outbound, queue) = mpsc::unbounded_channel();

        let writer = tokio::spawn(write_loop(
            robot,
            link.clone(),
            queue,
            self.events.clone(),
            self.config.command_delay,
            self.config.repeat_spacing,
        ));
        let reader = tokio::spawn(read_loop(robot, profile, inbound, self.events.clone()));
        let poller = tokio::spawn(poll_loop(
            robot,
            self.config.poll_interval,
            self.events.clone(),
        ));

        self.links.insert(
            robot,
            LinkHandle {
                outbound,
                link,
                tasks: vec![
                    writer.abort_handle(),
                    reader.abort_handle(),
                    poller.abort_handle(),
                ],
            },
        );
    }

    /// Queue a frame on the robot's FIFO. `repeat` copies go out spaced apart.
    pub fn send(&self, robot: RobotId, frame: Vec<u8>, repeat: u8) -> Result<(), TransportError> {
        let handle = self.links.get(&robot).ok_or(TransportError::Closed)?;
        handle
            .outbound
            .send(Outbound {
                frame,
                repeat: repeat.max(1),
            })
            .map_err(|_| TransportError::Closed)
    }

    /// Tear down the robot's link and cancel any connect in flight.
    pub fn disconnect(&mut self, robot: RobotId) -> bool {
        let pending = self.pending.remove(&robot).map(|task| task.abort()).is_some();
        match self.links.remove(&robot) {
            Some(handle) => {
                info!("Disconnecting robot {}", robot);
                handle.close();
                true
            }
            None => pending,
        }
    }

    pub fn disconnect_all(&mut self) {
        let robots: Vec<RobotId> = self
            .links
            .keys()
            .chain(self.pending.keys())
            .copied()
            .collect();
        for robot in robots {
            self.disconnect(robot);
        }
    }

    /// Stop everything and wait for each link to close.
    pub async fn close_all(&mut self) {
        self.stop_scan();
        for (_, task) in self.pending.drain() {
            task.abort();
        }
        for (robot, handle) in self.links.drain() {
            for task in &handle.tasks {
                task.abort();
            }
            debug!("Closing link to robot {}", robot);
            handle.link.disconnect().await;
        }
    }

    pub fn is_connected(&self, robot: RobotId) -> bool {
        self.links.contains_key(&robot)
    }

    pub fn connected_count(&self) -> usize {
        self.links.len()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(scan) = self.scan.take() {
            scan.abort();
        }
        for task in self.pending.values() {
            task.abort();
        }
        for handle in self.links.values() {
            for task in &handle.tasks {
                task.abort();
            }
        }
    }
}

async fn write_loop(
    robot: RobotId,
    link: Arc<dyn BleLink>,
    mut queue: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<EngineEvent>,
    command_delay: Duration,
    repeat_spacing: Duration,
) {
    while let Some(outbound) = queue.recv().await {
        for copy in 0..outbound.repeat {
            if copy > 0 {
                tokio::time::sleep(repeat_spacing).await;
            }
            if let Err(e) = link.write(&outbound.frame).await {
                warn!("Write to robot {} failed: {}", robot, e);
                let _ = events.send(EngineEvent::LinkLost {
                    robot,
                    reason: e.to_string(),
                });
                return;
            }
        }
        tokio::time::sleep(command_delay).await;
    }
}

async fn read_loop(
    robot: RobotId,
    profile: Arc<RobotProfile>,
    mut inbound: mpsc::UnboundedReceiver<LinkEvent>,
    events: mpsc::UnboundedSender<EngineEvent>,
) {
    let mut assembler = FrameAssembler::new();

    while let Some(event) = inbound.recv().await {
        match event {
            LinkEvent::Notification(bytes) => {
                assembler.push(&bytes);
                while let Some(frame) = assembler.next_frame() {
                    match frame.and_then(|frame| protocol::decode(&frame, &profile)) {
                        Ok(event) => {
                            if events.send(EngineEvent::Inbound { robot, event }).is_err() {
                                return;
                            }
                        }
                        Err(e @ ProtocolError::UnrecognizedEvent { .. }) => {
                            debug!("Robot {}: {}", robot, e);
                        }
                        Err(e) => {
                            warn!("Robot {}: {}", robot, e);
                        }
                    }
                }
            }
            LinkEvent::Disconnected(reason) => {
                let _ = events.send(EngineEvent::LinkLost { robot, reason });
                return;
            }
        }
    }

    let _ = events.send(EngineEvent::LinkLost {
        robot,
        reason: "notification stream closed".to_string(),
    });
}

async fn poll_loop(
    robot: RobotId,
    period: Duration,
    events: mpsc::UnboundedSender<EngineEvent>,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if events.send(EngineEvent::PollTick { robot }).is_err() {
            return;
        }
    }
}
