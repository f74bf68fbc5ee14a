use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Wait for shutdown signals and cancel `token` on the first one so the
/// rest of the process can drain. A repeated SIGINT/SIGTERM, or SIGQUIT
/// at any point, skips the drain and exits on the spot.
pub async fn signal_handler(token: CancellationToken) {
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigquit = signal(SignalKind::quit()).expect("failed to install SIGQUIT handler");

    loop {
        let name = tokio::select! {
            _ = sigquit.recv() => {
                info!("received SIGQUIT, exiting immediately");
                std::process::exit(2);
            }
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };

        if token.is_cancelled() {
            info!("received {name} during shutdown, exiting immediately");
            std::process::exit(2);
        }
        info!("received {name}, shutting down gracefully");
        token.cancel();
    }
}
