//! OS signals that ask a consumer to stop.
//!
//! On Unix the consumer stops on SIGINT, SIGTERM and SIGQUIT, so a supervisor's
//! `kill` gets the same graceful path as Ctrl-C: in-flight work goes back to
//! `pending` before exit. Elsewhere only Ctrl-C is available.

use tracing::info;

use crate::error::Result;

/// Installed shutdown signal handlers. Await [`recv`](Self::recv) for the first one.
pub struct ShutdownSignal {
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
    #[cfg(unix)]
    quit: tokio::signal::unix::Signal,
}

impl ShutdownSignal {
    /// Register the handlers now. From this point on these signals no longer
    /// terminate the process; they only resolve [`recv`](Self::recv).
    ///
    /// Must be called from within a tokio runtime.
    #[cfg(unix)]
    pub fn install() -> Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};

        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            quit: signal(SignalKind::quit())?,
        })
    }

    #[cfg(not(unix))]
    pub fn install() -> Result<Self> {
        Ok(Self {})
    }

    /// Resolve with the name of the first signal received.
    #[cfg(unix)]
    pub async fn recv(mut self) -> &'static str {
        let name = tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
            _ = self.quit.recv() => "SIGQUIT",
        };
        info!(signal = name, "received shutdown signal");
        name
    }

    #[cfg(not(unix))]
    pub async fn recv(self) -> &'static str {
        if tokio::signal::ctrl_c().await.is_err() {
            return std::future::pending().await;
        }
        info!(signal = "ctrl-c", "received shutdown signal");
        "ctrl-c"
    }
}
