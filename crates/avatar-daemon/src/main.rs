mod backend;
mod catalog;
mod core;
mod display;
mod feed;
mod http;
mod mpv;
mod queue;
mod session;
mod socket;
#[cfg(test)]
mod testing;

use std::sync::Arc;
use std::time::Duration;

use avatar_proto::config::{Config, DisplayMode};
use avatar_proto::protocol::LoggedEvent;
use avatar_proto::state::StateManager;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::display::{Display, DisplaySignal, ExternalDisplay};

#[derive(Debug, Clone)]
pub enum BroadcastMessage {
    StateUpdated,
    /// A feed event as it was appended to the event log.
    Feed(LoggedEvent),
    Log(String),
    /// A command was refused or failed.
    Error(String),
}

/// A custom tracing layer that forwards log messages to the broadcast channel
struct BroadcastLayer {
    sender: broadcast::Sender<BroadcastMessage>,
}

impl BroadcastLayer {
    fn new(sender: broadcast::Sender<BroadcastMessage>) -> Self {
        Self { sender }
    }
}

impl<S> tracing_subscriber::Layer<S> for BroadcastLayer
where
    S: tracing::Subscriber,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        // Only WARN and ERROR reach clients
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut message = format!("{} [{}] ", chrono::Local::now().format("%H:%M:%S"), level);
        let mut visitor = MessageVisitor(&mut message);
        event.record(&mut visitor);

        // No receivers is fine
        let _ = self.sender.send(BroadcastMessage::Log(message));
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl<'a> tracing::field::Visit for MessageVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

fn write_pid_file(config: &Config) {
    let pid_file = &config.daemon.pid_file;
    if let Some(parent) = pid_file.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Err(e) = std::fs::write(pid_file, std::process::id().to_string()) {
        warn!("Failed to write pid file {:?}: {}", pid_file, e);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Broadcast channel first so logging can use it
    let (broadcast_tx, _) = broadcast::channel::<BroadcastMessage>(100);

    let data_dir = avatar_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("daemon.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(BroadcastLayer::new(broadcast_tx.clone()))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,avatar_daemon=debug")),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());
    write_pid_file(&config);

    // All external inputs funnel into PanelCore
    let (event_tx, event_rx) = mpsc::channel::<core::PanelEvent>(256);

    let backend: Arc<dyn backend::Backend> = Arc::new(backend::HttpBackend::new(&config.backend)?);
    let state_manager = Arc::new(StateManager::new(config.daemon.state_file.clone()));

    let display: Box<dyn Display> = match config.display.mode {
        DisplayMode::External => {
            info!("Display: external overlay (HTTP callbacks)");
            Box::new(ExternalDisplay)
        }
        DisplayMode::Mpv => {
            info!("Display: mpv window");
            let (signal_tx, mut signal_rx) = mpsc::channel::<DisplaySignal>(64);
            let core_tx = event_tx.clone();
            tokio::spawn(async move {
                while let Some(signal) = signal_rx.recv().await {
                    if core_tx.send(signal.into()).await.is_err() {
                        break;
                    }
                }
            });
            Box::new(mpv::MpvDisplay::new(signal_tx))
        }
    };

    let panel_core = core::PanelCore::new(
        config.clone(),
        state_manager.clone(),
        backend.clone(),
        display,
        event_tx.clone(),
        broadcast_tx.clone(),
    )?;

    let _socket_handle = socket::start_server(
        config.http.bind_address.clone(),
        avatar_proto::platform::DAEMON_TCP_PORT,
        state_manager.clone(),
        event_tx.clone(),
        broadcast_tx.clone(),
    );

    if config.http.enabled {
        let _http_handle = http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            http::HttpState {
                state_manager: state_manager.clone(),
                event_tx: event_tx.clone(),
                backend,
                archive_limit: config.backend.archive_limit,
                reply_timeout: Duration::from_secs(config.backend.request_timeout_secs + 5),
            },
        );
    }

    let shutdown_tx = event_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            let _ = shutdown_tx.send(core::PanelEvent::Shutdown).await;
        }
    });
    drop(event_tx);

    info!("Daemon initialised, running event loop");
    panel_core.run(event_rx).await?;

    let _ = std::fs::remove_file(&config.daemon.pid_file);
    Ok(())
}
