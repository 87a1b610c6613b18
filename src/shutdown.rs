use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// Returns a `CancellationToken` that is cancelled when either signal is
/// received or when `parent` is cancelled. Every task of every node watches
/// a child of this token.
pub fn install_shutdown_handler(parent: &CancellationToken) -> std::io::Result<CancellationToken> {
    let token = parent.child_token();
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let token_clone = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, stopping nodes");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, stopping nodes");
            }
            _ = token_clone.cancelled() => return,
        }

        token_clone.cancel();
    });

    Ok(token)
}
