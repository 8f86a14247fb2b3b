//! OS termination signals.
//!
//! SIGINT, SIGTERM and SIGHUP all resolve the same future; the caller runs the one
//! graceful shutdown path. On non-Unix targets only Ctrl-C is awaited.

use tracing::info;

#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;

    let received = tokio::select! {
        _ = tokio::signal::ctrl_c() => "ctrl-c",
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
        _ = sighup.recv() => "SIGHUP",
    };
    info!(signal = received, "🛑 LIFECYCLE: Shutdown signal received");
    Ok(())
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!(signal = "ctrl-c", "🛑 LIFECYCLE: Shutdown signal received");
    Ok(())
}
