use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Operator request to stop the worker.
///
/// Holds `None` until termination is requested, then `Some(finish_tasks)`.
/// A request that lets running tasks finish can be escalated to one that
/// aborts them, never the other way round.
#[derive(Debug, Clone)]
pub struct GracefulTermination {
    tx: Arc<watch::Sender<Option<bool>>>,
}

impl Default for GracefulTermination {
    fn default() -> Self {
        Self::new()
    }
}

impl GracefulTermination {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn request(&self, finish_tasks: bool) {
        self.tx.send_if_modified(|current| match *current {
            Some(false) => false,
            Some(true) if finish_tasks => false,
            _ => {
                *current = Some(finish_tasks);
                true
            }
        });
    }

    pub fn requested(&self) -> Option<bool> {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<bool>> {
        self.tx.subscribe()
    }
}

/// Install handlers for SIGTERM and SIGINT.
///
/// The first SIGTERM asks the worker to stop once running tasks finish, a
/// second one aborts them. SIGINT cancels `interrupt`, which stops the
/// worker at its next wait.
pub fn install_signal_handlers(
    termination: GracefulTermination,
    interrupt: CancellationToken,
) -> std::io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    let finish_tasks = termination.requested().is_none();
                    if finish_tasks {
                        tracing::info!("Received SIGTERM, finishing running tasks before shutdown");
                    } else {
                        tracing::warn!("Received second SIGTERM, aborting running tasks");
                    }
                    termination.request(finish_tasks);
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT, stopping worker");
                    interrupt.cancel();
                    return;
                }
            }
        }
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_request_can_escalate_to_abort() {
        let termination = GracefulTermination::new();
        assert_eq!(termination.requested(), None);
        termination.request(true);
        assert_eq!(termination.requested(), Some(true));
        termination.request(false);
        assert_eq!(termination.requested(), Some(false));
        termination.request(true);
        assert_eq!(termination.requested(), Some(false));
    }

    #[tokio::test]
    async fn subscribers_see_requests() {
        let termination = GracefulTermination::new();
        let mut rx = termination.subscribe();
        termination.request(false);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Some(false));
    }
}
