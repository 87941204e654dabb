//! The single consumer of the execution queue.

use std::sync::Arc;

use tracing::info;

use super::CodeMutationPipeline;
use crate::cancel::CancelSignal;
use crate::domain::error::ErrorKind;
use crate::domain::result::ChangeResult;

pub struct Worker {
    pipeline: Arc<CodeMutationPipeline>,
    cancel: CancelSignal,
}

impl Worker {
    pub fn new(pipeline: Arc<CodeMutationPipeline>) -> Self {
        Self {
            pipeline,
            cancel: CancelSignal::new(),
        }
    }

    /// Handle that aborts the task currently running. A cancellation raised
    /// while no task runs aborts the next one.
    pub fn cancel_handle(&self) -> CancelSignal {
        self.cancel.clone()
    }

    /// Process tasks one at a time until the queue is closed and drained,
    /// handing each result to `on_result`.
    pub async fn run<F>(&self, mut on_result: F)
    where
        F: FnMut(ChangeResult) + Send,
    {
        while let Some(task) = self.pipeline.queue().dequeue().await {
            let result = self.pipeline.process(task, &self.cancel).await;
            // Cleared only once a run has reported the cancellation.
            let kind = result.failed_phase().and_then(|p| p.error_kind);
            if kind == Some(ErrorKind::Cancelled) {
                self.cancel.reset();
            }
            on_result(result);
        }
        info!(event = "worker.stopped", "execution queue closed");
    }

    /// Drain the queue and collect every result in processing order.
    pub async fn drain(&self) -> Vec<ChangeResult> {
        let mut results = Vec::new();
        self.run(|r| results.push(r)).await;
        results
    }
}
