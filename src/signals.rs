/// Signal handling for shutdown.
///
/// SIGINT (Ctrl-C) and SIGTERM both request a stop of the whole run. The
/// in-flight cycle is abandoned; its child is killed when the handle drops.
use std::sync::Arc;
use tokio::sync::watch;

/// Cloneable view of the shutdown flag, handed to the run loop.
#[derive(Debug, Clone)]
pub struct ShutdownToken {
    rx: watch::Receiver<bool>,
}

impl ShutdownToken {
    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown has been requested.
    pub async fn requested(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|stop| *stop).await.is_err() {
            // Handler gone without a request: never resolve.
            std::future::pending::<()>().await;
        }
    }
}

/// Owns the shutdown flag.
pub struct SignalHandler {
    tx: Arc<watch::Sender<bool>>,
}

impl SignalHandler {
    /// Handler with no OS signal listeners; stop via [`SignalHandler::request_shutdown`].
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Install listeners for SIGINT and SIGTERM.
    pub fn install() -> Self {
        let handler = Self::new();
        let tx = Arc::clone(&handler.tx);
        tokio::spawn(async move {
            wait_for_stop_signal().await;
            tracing::info!("stop signal received, shutting down");
            tx.send_replace(true);
        });
        handler
    }

    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            rx: self.tx.subscribe(),
        }
    }

    pub fn request_shutdown(&self) {
        self.tx.send_replace(true);
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_stop_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let ctrl_c = tokio::signal::ctrl_c();
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to install SIGTERM handler, listening for Ctrl-C only");
            let _ = ctrl_c.await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_stop_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}
