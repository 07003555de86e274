//! Process lifecycle: single-instance lock, shutdown signals, self-restart.

use crate::error::ConfigError;
use axum::Router;
use std::time::Duration;

/// Fixed loopback port doubling as the single-instance lock.
pub const LOCK_PORT: u16 = 48572;

/// Exit code telling the outer restart wrapper not to respawn.
pub const EXIT_NO_RESTART: i32 = 64;

/// How the process was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// SIGINT/SIGTERM: clean up and exit.
    Exit,
    /// SIGUSR2: clean up and re-exec with the original argv.
    Restart,
}

/// Probe the lock port and, if free, bind it for the process lifetime.
///
/// The bound socket answers any HTTP request with a 200 identifying the
/// service, so a human can see what is holding the port.
pub async fn acquire_instance_lock() -> Result<tokio::task::JoinHandle<()>, ConfigError> {
    let address = ("127.0.0.1", LOCK_PORT);

    let probe = tokio::time::timeout(
        Duration::from_millis(500),
        tokio::net::TcpStream::connect(address),
    )
    .await;
    if matches!(probe, Ok(Ok(_))) {
        return Err(ConfigError::AlreadyRunning(LOCK_PORT));
    }

    let listener = tokio::net::TcpListener::bind(address)
        .await
        .map_err(|error| {
            ConfigError::Invalid(format!("failed to bind instance lock port {LOCK_PORT}: {error}"))
        })?;

    let app = Router::new().fallback(|| async { "remote-vibe bridge is running\n" });
    let handle = tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, app).await {
            tracing::warn!(%error, "instance lock responder stopped");
        }
    });
    Ok(handle)
}

/// Wait for the first shutdown-worthy signal.
#[cfg(unix)]
pub async fn wait_for_shutdown() -> Shutdown {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt()).expect("SIGINT handler");
    let mut terminate = signal(SignalKind::terminate()).expect("SIGTERM handler");
    let mut restart = signal(SignalKind::user_defined2()).expect("SIGUSR2 handler");

    tokio::select! {
        _ = interrupt.recv() => Shutdown::Exit,
        _ = terminate.recv() => Shutdown::Exit,
        _ = restart.recv() => Shutdown::Restart,
    }
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown() -> Shutdown {
    let _ = tokio::signal::ctrl_c().await;
    Shutdown::Exit
}

/// Replace the current process image with a fresh copy of itself, keeping
/// argv and environment. Only returns on failure.
#[cfg(unix)]
pub fn reexec() -> std::io::Error {
    use std::os::unix::process::CommandExt as _;

    let mut args = std::env::args_os();
    let Some(program) = args.next() else {
        return std::io::Error::new(std::io::ErrorKind::NotFound, "missing argv[0]");
    };
    tracing::info!(program = %program.to_string_lossy(), "re-executing");
    std::process::Command::new(program).args(args).exec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_lock_acquisition_fails() {
        // Both acquisitions race the same fixed port; only one may win.
        let first = acquire_instance_lock().await;
        let second = acquire_instance_lock().await;
        match (&first, &second) {
            (Ok(_), Err(ConfigError::AlreadyRunning(port))) => {
                assert_eq!(*port, LOCK_PORT);
            }
            // Another process on the machine already holds the port; the
            // probe still has to report the conflict both times.
            (Err(ConfigError::AlreadyRunning(_)), Err(ConfigError::AlreadyRunning(_))) => {}
            other => panic!("unexpected lock outcome: {other:?}"),
        }
        if let Ok(handle) = first {
            handle.abort();
        }
    }
}
