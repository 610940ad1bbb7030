use tokio::sync::watch;
use tracing::{error, info};

/// Cloneable view of a stop request. Every long running loop selects on [`Shutdown::requested`].
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn channel() -> (watch::Sender<bool>, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (tx, Shutdown { rx })
    }

    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once a stop has been requested. Never resolves if the sender is gone without asking.
    pub async fn requested(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                futures::future::pending::<()>().await;
            }
        }
    }
}

/// Requests a stop on the first Ctrl+C
pub fn on_interrupt() -> Shutdown {
    let (tx, shutdown) = Shutdown::channel();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, shutting down...");
                let _ = tx.send(true);
            }
            Err(e) => {
                error!("Unable to listen for interrupt signal: {}", e);
                // Keep the sender alive so the process can still stop on end of input
                futures::future::pending::<()>().await;
            }
        }
    });
    shutdown
}
