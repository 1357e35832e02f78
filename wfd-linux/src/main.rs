// Wi-Fi Direct session host: serialized session loop over a simulated P2P backend.

mod config;
mod observer;
mod platform;
mod runtime;

use std::path::PathBuf;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let mut config_path: Option<PathBuf> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("wfd-linux {} (wire v{})", VERSION, wfd_core::WIRE_VERSION);
                return Ok(());
            }
            "--config" | "-c" => {
                let p = args.next().context("--config needs a path")?;
                config_path = Some(PathBuf::from(p));
            }
            other => anyhow::bail!("unknown argument: {}", other),
        }
    }

    let cfg = config::load(config_path.as_deref())?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.log_filter))
        .context("invalid log filter")?;
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let running = runtime::spawn_session(&cfg)?;
        info!(
            queue = cfg.queue_capacity,
            auto_discover = cfg.auto_discover,
            "wfd-linux started"
        );
        shutdown_signal().await?;
        info!(phase = ?running.handle.state().phase, "shutting down");
        // Session may already be gone; nothing left to stop then.
        let _ = running.handle.shutdown().await;
        running.driver.await.context("session task panicked")?;
        running.backend.abort();
        Ok::<(), anyhow::Error>(())
    })
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
