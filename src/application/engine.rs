//! Engine task
//!
//! Single owner of the dispatcher. Everything that can change robot state
//! (intents, discoveries, inbound notifications, link loss, timers) arrives
//! on one channel, so events are handled strictly one at a time.

use crate::application::dispatcher::{Dispatcher, DispatcherConfig, Effect};
use crate::application::scheduler::TimerRegistry;
use crate::domain::intent::{Intent, IntentEnvelope, IntentSender};
use crate::domain::models::{EngineEvent, MessageSeverity, StatusMessage};
use crate::domain::profile::ProfileRegistry;
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::service::{ConnectionManager, ManagerConfig};
use crate::infrastructure::bluetooth::transport::BleTransport;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

pub struct Engine {
    dispatcher: Dispatcher,
    manager: ConnectionManager,
    timers: TimerRegistry,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    events_rx: mpsc::UnboundedReceiver<EngineEvent>,
    cancel: CancellationToken,
    notices: Option<mpsc::UnboundedSender<StatusMessage>>,
    /// Time given to queued stop frames before links are closed
    drain: Duration,
}

impl Engine {
    pub fn new(
        settings: &Settings,
        profiles: Arc<ProfileRegistry>,
        transport: Arc<dyn BleTransport>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let manager_config = ManagerConfig::from_settings(settings);
        let drain = manager_config.repeat_spacing * u32::from(settings.stop_repeats.max(1))
            + manager_config.command_delay;

        Self {
            dispatcher: Dispatcher::new(profiles.clone(), DispatcherConfig::from_settings(settings)),
            manager: ConnectionManager::new(transport, profiles, manager_config, events_tx.clone()),
            timers: TimerRegistry::new(events_tx.clone()),
            events_tx,
            events_rx,
            cancel: CancellationToken::new(),
            notices: None,
            drain,
        }
    }

    /// Forward user-facing status messages to `tx` as well as the log.
    pub fn with_notices(mut self, tx: mpsc::UnboundedSender<StatusMessage>) -> Self {
        self.notices = Some(tx);
        self
    }

    pub fn intent_sender(&self) -> IntentSender {
        IntentSender::new(self.events_tx.clone())
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        info!("Engine started");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = self.events_rx.recv() => match event {
                    Some(event) => self.dispatch(event),
                    None => break,
                },
                Some(outcome) = self.manager.next_ready() => {
                    if let Some(event) = self.manager.register(outcome) {
                        self.dispatch(event);
                    }
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    fn dispatch(&mut self, event: EngineEvent) {
        trace!("Dispatching {:?}", event);
        let effects = self.dispatcher.handle(event, Instant::now());
        for effect in effects {
            self.apply(effect);
        }
    }

    fn apply(&mut self, effect: Effect) {
        match effect {
            Effect::Send {
                robot,
                command,
                frame,
                repeat,
            } => {
                debug!("Robot {} <- {} {:02X?} x{}", robot, command.name(), frame, repeat);
                if let Err(e) = self.manager.send(robot, frame, repeat) {
                    warn!("Dropped {} for robot {}: {}", command.name(), robot, e);
                }
            }
            Effect::Schedule {
                robot,
                kind,
                token,
                after,
            } => self.timers.schedule(robot, kind, token, after),
            Effect::CancelTimers { robot } => self.timers.cancel_robot(robot),
            Effect::Connect { robot, device } => self.manager.connect(robot, device, false),
            Effect::Reconnect { robot, device } => self.manager.connect(robot, device, true),
            Effect::Disconnect { robot } => {
                self.manager.disconnect(robot);
            }
            Effect::Rescan => self.manager.start_scan(),
            Effect::DisconnectAll => {
                self.manager.stop_scan();
                self.manager.disconnect_all();
            }
            Effect::Notice(message) => self.notify(message),
        }
    }

    fn notify(&self, message: StatusMessage) {
        match message.severity {
            MessageSeverity::Info | MessageSeverity::Success => info!("{}", message.message),
            MessageSeverity::Warning => warn!("{}", message.message),
            MessageSeverity::Error => error!("{}", message.message),
        }
        if let Some(notices) = &self.notices {
            let _ = notices.send(message);
        }
    }

    /// Stop every connected robot, let the stop frames drain, then close links.
    async fn shutdown(&mut self) {
        info!("Engine shutting down");
        let connected = self.dispatcher.connected_ids();
        if !connected.is_empty() {
            self.dispatch(EngineEvent::Intent(IntentEnvelope::all(Intent::Stop)));
            tokio::time::sleep(self.drain).await;
        }
        self.timers.cancel_all();
        self.manager.close_all().await;
        info!("Engine stopped, {} robot(s) released", connected.len());
    }
}
