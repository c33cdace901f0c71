pub mod http;
pub mod ws;

use tokio::sync::watch;

pub use http::{AppState, router, serve};

/// Cloneable stop signal for long-lived connections (WebSocket sessions,
/// SSE streams) so graceful shutdown does not wait on them forever.
#[derive(Clone, Debug)]
pub struct ShutdownSignal(watch::Receiver<bool>);

impl ShutdownSignal {
    pub fn new() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self(rx))
    }

    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once shutdown is requested or the sender is gone.
    pub async fn wait(mut self) {
        let _ = self.0.wait_for(|stop| *stop).await;
    }
}
