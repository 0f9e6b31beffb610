// NDRT monitor: polls the gaze and vehicle-status feeds and logs transitions.

mod config;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use ndrt_link::{ConnectError, Session};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_LOG_FILTER: &str = "ndrt_monitor=info,ndrt_link=info";

fn main() -> anyhow::Result<()> {
    let mut config_path: Option<PathBuf> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("ndrt-monitor {}", VERSION);
                return Ok(());
            }
            "--config" | "-c" => {
                let path = args.next().context("--config needs a path")?;
                config_path = Some(PathBuf::from(path));
            }
            other => anyhow::bail!("unknown argument `{}`", other),
        }
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .init();

    let cfg = config::load(config_path.as_deref())?;
    info!(version = VERSION, tick_ms = cfg.tick_ms, "ndrt-monitor starting");

    // Channels block on their own runtimes, so polling runs on a plain thread.
    let stop = Arc::new(AtomicBool::new(false));
    let poller = {
        let stop = stop.clone();
        std::thread::Builder::new()
            .name("ndrt-poll".into())
            .spawn(move || run_poll_loop(cfg, &stop))
            .context("spawning poll thread")?
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(shutdown_signal())?;
    info!("shutdown requested");
    stop.store(true, Ordering::Relaxed);
    poller
        .join()
        .map_err(|_| anyhow::anyhow!("poll thread panicked"))?;
    Ok(())
}

fn run_poll_loop(cfg: config::Config, stop: &AtomicBool) {
    let tick = Duration::from_millis(cfg.tick_ms.max(1));
    let mut session = Session::new(cfg.session);
    let mut looking = false;
    let mut status = session.status_snapshot();

    while !stop.load(Ordering::Relaxed) {
        let started = Instant::now();
        for (feed, polled) in [
            ("gaze", session.poll_gaze_feed()),
            ("status", session.poll_status_feed()),
        ] {
            match polled {
                Ok(_) | Err(ConnectError::Backoff { .. }) => {}
                Err(e) => debug!(feed, "poll skipped: {}", e),
            }
        }

        if session.is_looking_at_target() != looking {
            looking = !looking;
            let [x, y] = session.current_gaze_position();
            info!(looking, x, y, "gaze on HUD changed");
        }
        let snapshot = session.status_snapshot();
        if snapshot != status {
            status = snapshot;
            info!(
                previous = %snapshot.previous,
                current = %snapshot.current,
                "vehicle status changed"
            );
        }

        if let Some(rest) = tick.checked_sub(started.elapsed()) {
            std::thread::sleep(rest);
        }
    }
    session.shutdown();
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
