use tokio::sync::broadcast;
use tracing::{error, info};

/// Forward SIGINT and SIGTERM to the shutdown channel
pub fn setup_shutdown_hooks(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("[PIPELINE] Received shutdown signal");
                let _ = ctrl_c_tx.send(());
            }
            Err(e) => error!("[PIPELINE] Failed to listen for Ctrl-C: {}", e),
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        tokio::spawn(async move {
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    error!("[PIPELINE] Failed to register SIGTERM handler: {}", e);
                    return;
                }
            };
            sigterm.recv().await;
            info!("[PIPELINE] Received SIGTERM");
            let _ = shutdown_tx.send(());
        });
    }
}
