mod core;
mod mpv;

use hearthis_core::{platform, Config};
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let data_dir = platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("daemon.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    // stdout carries the notice stream, so the console only gets problems
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(LevelFilter::WARN);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(
                    "info,hearthis_daemon=debug,hearthis_core=debug",
                )
            }),
        )
        .init();

    info!(
        "hearthis-daemon {} started at {}, log file {:?}",
        env!("CARGO_PKG_VERSION"),
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        log_path
    );

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    let (event_tx, event_rx) = tokio::sync::mpsc::channel::<core::CoreEvent>(256);
    let daemon_core = core::DaemonCore::new(&config, event_tx)?;

    info!("Daemon initialised, running event loop");
    daemon_core.run(event_rx).await?;

    info!("Daemon exiting");
    Ok(())
}
