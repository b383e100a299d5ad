//! Dependency-driven scheduling of one execution.
//!
//! The scheduler repeatedly scans the steps in topological order. Steps whose
//! dependencies have all completed (or been skipped) are claimed and handed to
//! the dispatcher concurrently; steps downstream of a failure, a
//! cancellation, or an entirely skipped branch are marked SKIPPED. The run
//! ends when nothing is in flight and nothing more can start.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::definition::WorkflowStep;
use crate::dispatcher::StepDispatcher;
use crate::engine::RegisteredWorkflow;
use crate::events::{EventBus, WorkflowEvent};
use crate::execution::{ExecutionStatus, StepStatus, WorkflowExecution};

/// Shared state of one live execution.
pub(crate) struct ExecutionHandle {
    pub(crate) record: Mutex<WorkflowExecution>,
    pub(crate) cancellation: CancellationToken,
    pub(crate) workflow: Arc<RegisteredWorkflow>,
    events: EventBus,
    done: watch::Sender<bool>,
}

impl ExecutionHandle {
    pub(crate) fn new(
        record: WorkflowExecution,
        workflow: Arc<RegisteredWorkflow>,
        events: EventBus,
    ) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            record: Mutex::new(record),
            cancellation: CancellationToken::new(),
            workflow,
            events,
            done,
        }
    }

    pub(crate) fn snapshot(&self) -> WorkflowExecution {
        self.record.lock().clone()
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Mark the execution and its unfinished steps CANCELLED and stop all
    /// in-flight work. Returns `false` if the execution had already ended.
    pub(crate) fn cancel(&self, reason: Option<String>) -> bool {
        let mut exec = self.record.lock();
        let unfinished: Vec<String> = exec
            .steps
            .iter()
            .filter(|s| !s.status.is_terminal())
            .map(|s| s.step_id.clone())
            .collect();
        if !exec.cancel(reason) {
            return false;
        }
        self.cancellation.cancel();

        for step_id in unfinished {
            self.events.publish(WorkflowEvent::StepFinished {
                execution_id: exec.execution_id.clone(),
                step_id,
                status: StepStatus::Cancelled,
            });
        }
        true
    }

    /// Wait until the scheduler has finalized the execution.
    pub(crate) async fn wait(&self) -> WorkflowExecution {
        let mut rx = self.done.subscribe();
        // The sender lives as long as `self`
        let _ = rx.wait_for(|done| *done).await;
        self.snapshot()
    }

    fn mark_done(&self) {
        self.done.send_replace(true);
    }
}

/// Drives one execution from RUNNING to a terminal state.
pub(crate) struct ExecutionScheduler {
    handle: Arc<ExecutionHandle>,
    dispatcher: Arc<StepDispatcher>,
    events: EventBus,
}

impl ExecutionScheduler {
    pub(crate) fn new(handle: Arc<ExecutionHandle>, dispatcher: Arc<StepDispatcher>, events: EventBus) -> Self {
        Self {
            handle,
            dispatcher,
            events,
        }
    }

    pub(crate) async fn run(self) {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let mut in_flight = 0usize;
        let deadline = self
            .handle
            .workflow
            .definition
            .timeout_secs
            .map(|secs| (secs, Instant::now() + Duration::from_secs(secs)));

        loop {
            for step in self.advance() {
                in_flight += 1;
                let dispatcher = self.dispatcher.clone();
                let handle = self.handle.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let record = dispatcher.dispatch(&step, &handle).await;
                    let _ = tx.send(record.step_id);
                });
            }

            if in_flight == 0 {
                break;
            }

            let timed_out = async {
                match deadline {
                    Some((_, at)) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = self.handle.cancellation.cancelled() => break,
                _ = timed_out => {
                    if let Some((secs, _)) = deadline {
                        let reason = format!("workflow timed out after {}s", secs);
                        let execution_id = self.handle.record.lock().execution_id.clone();
                        warn!(execution_id = %execution_id, "{}", reason);
                        self.handle.cancel(Some(reason));
                    }
                    break;
                }
                Some(step_id) = rx.recv() => {
                    in_flight -= 1;
                    debug!(step_id = %step_id, in_flight, "Step dispatch returned");
                }
            }
        }

        self.finalize();
    }

    /// Skip what can no longer run and claim what is ready.
    fn advance(&self) -> Vec<WorkflowStep> {
        let mut exec = self.handle.record.lock();
        if exec.is_terminal() || self.handle.is_cancelled() {
            return Vec::new();
        }

        let workflow = &self.handle.workflow;
        let mut ready = Vec::new();

        // Topological order lets a skip cascade through a chain in one pass
        for &index in &workflow.order {
            if exec.steps.get(index).map(|s| s.status) != Some(StepStatus::Pending) {
                continue;
            }

            let deps: Vec<StepStatus> = workflow
                .dependencies
                .get(index)
                .into_iter()
                .flatten()
                .filter_map(|&dep| exec.steps.get(dep).map(|s| s.status))
                .collect();

            let upstream_broken = deps
                .iter()
                .any(|s| matches!(s, StepStatus::Failed | StepStatus::Cancelled));
            let branch_skipped = !deps.is_empty() && deps.iter().all(|s| *s == StepStatus::Skipped);
            let execution_id = exec.execution_id.clone();
            let Some(record) = exec.steps.get_mut(index) else {
                continue;
            };

            if upstream_broken || branch_skipped {
                record.finish(StepStatus::Skipped);
                debug!(execution_id = %execution_id, step_id = %record.step_id, "Skipping step");
                self.events.publish(WorkflowEvent::StepFinished {
                    execution_id,
                    step_id: record.step_id.clone(),
                    status: StepStatus::Skipped,
                });
                continue;
            }

            if !deps.iter().all(|s| s.satisfies_dependency()) {
                continue;
            }

            let Some(step) = workflow.definition.steps.get(index) else {
                continue;
            };
            record.start();
            self.events.publish(WorkflowEvent::StepStarted {
                execution_id,
                step_id: step.id.clone(),
            });
            ready.push(step.clone());
        }

        ready
    }

    fn finalize(&self) {
        let (execution_id, status) = {
            let mut exec = self.handle.record.lock();
            if !exec.is_terminal() {
                let failure = exec
                    .steps
                    .iter()
                    .filter(|s| s.status == StepStatus::Failed)
                    .min_by_key(|s| s.end_time)
                    .map(|s| {
                        format!(
                            "Step '{}' failed: {}",
                            s.step_id,
                            s.error.as_deref().unwrap_or("unknown error")
                        )
                    });
                match failure {
                    Some(error) => exec.finish(ExecutionStatus::Failed, Some(error)),
                    None => exec.finish(ExecutionStatus::Completed, None),
                }
            }
            info!(
                execution_id = %exec.execution_id,
                workflow_id = %exec.workflow_id,
                status = %exec.status,
                execution_time_ms = exec.execution_time_ms,
                "Workflow execution finished"
            );
            (exec.execution_id.clone(), exec.status)
        };

        self.events.publish(WorkflowEvent::ExecutionFinished {
            execution_id,
            status,
        });
        self.handle.mark_done();
    }
}
