mod catalog;
mod core;
mod engine;
mod http;
mod mpv;
mod queue;
mod socket;

use deepcut_proto::config::Config;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Clone)]
pub enum BroadcastMessage {
    StateUpdated,
    /// User-facing failure, e.g. a track that could not be loaded.
    Notice(String),
    Log(String),
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

        let now = chrono::Local::now();
        let mut message = format!("{} [{}] ", now.format("%H:%M:%S"), level);
        let mut visitor = MessageVisitor(&mut message);
        event.record(&mut visitor);

        // no receivers is fine
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

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Broadcast channel first so the logging layer can use it
    let (broadcast_tx, _) = broadcast::channel::<BroadcastMessage>(100);

    let data_dir = deepcut_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("daemon.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    let broadcast_layer = BroadcastLayer::new(broadcast_tx.clone());

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(broadcast_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info,deepcut_daemon=debug,reqwest=warn,hyper=warn")
            }),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());
    deepcut_proto::platform::set_use_system_deps(config.mpv.use_system_binary);

    // Event channel: all external inputs funnel into PlayerCore
    let (event_tx, event_rx) = tokio::sync::mpsc::channel::<core::PlayerEvent>(256);

    let engine = mpv::MpvEngine::new(
        deepcut_proto::platform::mpv_socket_name(),
        config.mpv.position_granularity_ms,
    );
    let player = core::PlayerCore::new(
        engine,
        std::sync::Arc::new(deepcut_proto::state::StateManager::new()),
        broadcast_tx.clone(),
        config.player.tick_interval_ms,
    );
    let state_manager = player.state_manager();

    let _socket_handle = socket::start_server(
        config.socket.bind_address.clone(),
        config.socket.port,
        state_manager.clone(),
        event_tx.clone(),
        broadcast_tx.clone(),
    );

    if config.http.enabled {
        let _http_handle = http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            state_manager.clone(),
            event_tx.clone(),
            catalog::CatalogClient::new(&config.catalog),
        );
    }

    // Ctrl-C stops the player loop so the mpv session is released
    let shutdown_tx = event_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received");
            let _ = shutdown_tx.send(core::PlayerEvent::Shutdown).await;
        }
    });

    info!("Daemon initialised, running event loop");
    player.run(event_rx).await?;

    Ok(())
}
