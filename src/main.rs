use robosen_controller::application::Engine;
use robosen_controller::domain::intent::{Intent, IntentSource};
use robosen_controller::domain::models::{MessageSeverity, StatusMessage};
use robosen_controller::domain::profile::ProfileRegistry;
use robosen_controller::domain::settings::{Settings, SettingsService, TransportKind};
use robosen_controller::infrastructure::bluetooth::simulated::SimulatedTransport;
use robosen_controller::infrastructure::bluetooth::transport::BleTransport;
use robosen_controller::infrastructure::logging::init_logger;
use robosen_controller::presentation::script::ScriptIntentSource;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

fn build_transport(
    settings: &Settings,
    profiles: Arc<ProfileRegistry>,
) -> Arc<dyn BleTransport> {
    match settings.transport {
        TransportKind::WinRt => match winrt_transport() {
            Some(transport) => transport,
            None => {
                warn!("WinRT Bluetooth is only available on Windows, using simulated robots");
                Arc::new(SimulatedTransport::from_settings(settings, profiles))
            }
        },
        TransportKind::Simulated => {
            info!(
                "Using {} simulated robot(s)",
                settings.simulated_robots.len()
            );
            Arc::new(SimulatedTransport::from_settings(settings, profiles))
        }
    }
}

#[cfg(windows)]
fn winrt_transport() -> Option<Arc<dyn BleTransport>> {
    use robosen_controller::infrastructure::bluetooth::winrt::WinRtTransport;
    Some(Arc::new(WinRtTransport::new()))
}

#[cfg(not(windows))]
fn winrt_transport() -> Option<Arc<dyn BleTransport>> {
    None
}

fn print_notices(mut notices: mpsc::UnboundedReceiver<StatusMessage>) {
    tokio::spawn(async move {
        while let Some(notice) = notices.recv().await {
            let tag = match notice.severity {
                MessageSeverity::Info => "info",
                MessageSeverity::Success => " ok ",
                MessageSeverity::Warning => "warn",
                MessageSeverity::Error => "FAIL",
            };
            println!("[{}] {}", tag, notice.message);
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings_service = SettingsService::new()?;
    let settings = settings_service.get().clone();
    let logging_guard = init_logger(&settings.log_settings)?;

    info!("Starting Robosen Controller");
    info!("Settings file: {}", settings_service.path().display());
    if !settings_service.path().exists() {
        if let Err(e) = settings_service.save() {
            warn!("Could not write default settings: {}", e);
        }
    }

    let profiles = Arc::new(ProfileRegistry::from_settings(&settings));
    let transport = build_transport(&settings, profiles.clone());

    let (notice_tx, notice_rx) = mpsc::unbounded_channel();
    print_notices(notice_rx);

    let engine = Engine::new(&settings, profiles, transport).with_notices(notice_tx);
    let intents = engine.intent_sender();
    let cancel = engine.cancellation_token();
    let engine_task = tokio::spawn(engine.run());

    intents.broadcast(Intent::Rescan)?;

    let mut script = ScriptIntentSource::stdin();
    tokio::select! {
        result = script.run(intents.clone(), cancel.child_token()) => {
            result?;
            info!("Input finished");
        }
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    cancel.cancel();
    engine_task.await??;
    info!("Goodbye");

    // The runtime would otherwise wait on the blocking stdin read.
    drop(logging_guard);
    std::process::exit(0);
}
