//! Process signal handling.

use std::io;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Cancel `token` on Ctrl+C or SIGTERM.
///
/// A failure to install a handler cancels too, so the process never keeps
/// running without a way to stop it cleanly.
pub fn cancel_on_shutdown(token: CancellationToken) {
    tokio::spawn(async move {
        let received = tokio::select! {
            res = signal::ctrl_c() => res.map(|()| "ctrl-c"),
            res = sigterm() => res.map(|()| "sigterm"),
        };
        match received {
            Ok(name) => {
                tracing::info!(signal = name, "Shutdown signal received, initiating graceful shutdown");
            }
            Err(e) => tracing::error!(error = %e, "Signal handling failed, shutting down"),
        }
        token.cancel();
    });
}

#[cfg(unix)]
async fn sigterm() -> io::Result<()> {
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    terminate.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn sigterm() -> io::Result<()> {
    std::future::pending().await
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn token_stays_live_until_a_signal_arrives() {
        let token = CancellationToken::new();
        cancel_on_shutdown(token.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!token.is_cancelled());
    }
}
