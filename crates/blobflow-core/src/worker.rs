//! Background cascade worker
//!
//! With `auto_cascade` on, every accepted delta pushes a trigger into a
//! bounded queue. One worker drains it, one cascade at a time, so appends
//! made by providers during a cascade queue up behind it instead of
//! recursing.

use crate::engine::CascadeRunner;
use blobflow_cascade::Trigger;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub(crate) struct CascadeWorker {
    handle: JoinHandle<()>,
}

impl CascadeWorker {
    pub(crate) fn spawn(mut queue: mpsc::Receiver<Trigger>, runner: CascadeRunner) -> Self {
        let handle = tokio::spawn(async move {
            info!("cascade worker started");
            while let Some(trigger) = queue.recv().await {
                let root = trigger.root;
                let report = runner.run(trigger).await;
                debug!(
                    root = %root,
                    nodes = report.nodes.len(),
                    status = ?report.status(),
                    "queued cascade done"
                );
            }
            debug!("cascade queue closed");
        });
        Self { handle }
    }

    /// Abort the worker and wait for it to unwind
    pub(crate) async fn stop(mut self) {
        self.handle.abort();
        let _ = (&mut self.handle).await;
    }
}

impl Drop for CascadeWorker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
