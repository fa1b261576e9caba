use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::supervisor::Supervisor;

/// Periodically reconciles recorded status against the OS so crashed
/// applications are noticed without anyone calling `check_status`.
#[derive(Clone)]
pub struct StatusPoller {
    supervisor: Supervisor,
    interval: Duration,
}

impl StatusPoller {
    pub fn new(supervisor: Supervisor, interval: Duration) -> Self {
        Self {
            supervisor,
            interval,
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                self.tick().await;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.interval) => {}
                }
            }
            tracing::debug!("status poller stopped");
        })
    }

    async fn tick(&self) {
        let changed = self.supervisor.reconcile_all().await;
        if changed > 0 {
            tracing::info!(changed, "reconciled application status");
        }
    }
}
