use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Install a handler for SIGTERM and SIGINT.
///
/// The returned token is cancelled when either signal arrives. The worker
/// loop observes it between deliveries, so an in-flight job still reaches its
/// ack or nack before the process exits.
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let token = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::warn!("Received SIGTERM, finishing current job");
            }
            _ = sigint.recv() => {
                tracing::warn!("Received SIGINT, finishing current job");
            }
        }
        trigger.cancel();
    });

    Ok(token)
}
