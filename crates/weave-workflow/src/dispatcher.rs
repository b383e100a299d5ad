//! Single-step execution.
//!
//! The dispatcher runs one step of one execution: it evaluates gates and
//! CONDITION rules against the shared context, and for ACTION steps calls the
//! agent under a hard timeout, retrying failures with backoff. Every state
//! change happens under the execution's lock and is skipped once the
//! execution has been cancelled.

use std::time::Duration;

use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::agent::{AgentRequest, SharedAgentClient};
use crate::condition::evaluate_detailed;
use crate::definition::{ConditionRule, StepType, WorkflowStep};
use crate::events::{EventBus, WorkflowEvent};
use crate::execution::{StepExecution, StepStatus, WorkflowExecution};
use crate::retry::RetryPolicy;
use crate::scheduler::ExecutionHandle;
use crate::template::resolve_parameters;

/// Why an ACTION step stopped trying.
enum CallOutcome {
    Succeeded(Value),
    Failed(String),
    /// The execution was cancelled; nothing may be recorded.
    Abandoned,
}

/// Executes individual steps against an agent client.
pub(crate) struct StepDispatcher {
    agent: SharedAgentClient,
    retry: RetryPolicy,
    default_timeout: Duration,
    events: EventBus,
}

impl StepDispatcher {
    pub(crate) fn new(
        agent: SharedAgentClient,
        retry: RetryPolicy,
        default_timeout: Duration,
        events: EventBus,
    ) -> Self {
        Self {
            agent,
            retry,
            default_timeout,
            events,
        }
    }

    /// Run `step` to a terminal state and return a copy of its record.
    ///
    /// If the scheduler already claimed the step (RUNNING) its start time is
    /// kept. If the execution is cancelled at any point, the record is left
    /// as the cancellation wrote it.
    pub(crate) async fn dispatch(&self, step: &WorkflowStep, handle: &ExecutionHandle) -> StepExecution {
        let (execution_id, user_id, parameters) = {
            let mut exec = handle.record.lock();
            if handle.is_cancelled() || exec.is_terminal() {
                return snapshot(&exec, &step.id);
            }
            let Some(record) = exec.step_mut(&step.id) else {
                return StepExecution::pending(&step.id, step.agent.clone());
            };
            if record.status.is_terminal() {
                return record.clone();
            }
            if record.status == StepStatus::Pending {
                record.start();
            }

            match step.step_type {
                StepType::Condition => return self.run_condition(step, &mut exec),
                StepType::Action => {
                    if let Some(rule) = &step.condition
                        && !self.check(rule, step, &mut exec)
                    {
                        info!(
                            execution_id = %exec.execution_id,
                            step_id = %step.id,
                            "Step condition not met, skipping"
                        );
                        return self.finish(&mut exec, &step.id, StepStatus::Skipped);
                    }
                }
            }

            match resolve_parameters(&step.parameters, &exec.context) {
                Ok(parameters) => (exec.execution_id.clone(), exec.user_id.clone(), parameters),
                Err(e) => {
                    error!(
                        execution_id = %exec.execution_id,
                        step_id = %step.id,
                        error = %e,
                        "Step parameters could not be resolved"
                    );
                    if let Some(record) = exec.step_mut(&step.id) {
                        record.error = Some(e.to_string());
                    }
                    return self.finish(&mut exec, &step.id, StepStatus::Failed);
                }
            }
        };

        let outcome = self
            .call_with_retry(step, handle, &execution_id, &user_id, parameters)
            .await;

        let mut exec = handle.record.lock();
        let late = handle.is_cancelled()
            || exec
                .step(&step.id)
                .is_none_or(|record| record.status.is_terminal());
        if late || matches!(outcome, CallOutcome::Abandoned) {
            if !matches!(outcome, CallOutcome::Abandoned) {
                warn!(
                    execution_id = %execution_id,
                    step_id = %step.id,
                    "Discarding agent result for cancelled execution"
                );
            }
            return snapshot(&exec, &step.id);
        }

        match outcome {
            CallOutcome::Succeeded(data) => {
                exec.context.insert(step.result_key(), data.clone());
                if let Some(record) = exec.step_mut(&step.id) {
                    record.result = data;
                }
                info!(execution_id = %execution_id, step_id = %step.id, "Action step completed");
                self.finish(&mut exec, &step.id, StepStatus::Completed)
            }
            CallOutcome::Failed(message) => {
                error!(
                    execution_id = %execution_id,
                    step_id = %step.id,
                    error = %message,
                    "Action step failed"
                );
                if let Some(record) = exec.step_mut(&step.id) {
                    record.error = Some(message);
                }
                self.finish(&mut exec, &step.id, StepStatus::Failed)
            }
            CallOutcome::Abandoned => snapshot(&exec, &step.id),
        }
    }

    /// Evaluate a CONDITION step and publish its boolean into the context.
    fn run_condition(&self, step: &WorkflowStep, exec: &mut WorkflowExecution) -> StepExecution {
        let matched = match &step.condition {
            Some(rule) => self.check(rule, step, exec),
            None => {
                if let Some(record) = exec.step_mut(&step.id) {
                    record.error = Some("condition step has no rule".to_string());
                }
                return self.finish(exec, &step.id, StepStatus::Failed);
            }
        };

        exec.context.insert(step.condition_key(), Value::Bool(matched));
        if let Some(record) = exec.step_mut(&step.id) {
            record.result = json!({ "condition_result": matched });
        }
        debug!(
            execution_id = %exec.execution_id,
            step_id = %step.id,
            result = matched,
            "Condition evaluated"
        );
        self.finish(exec, &step.id, StepStatus::Completed)
    }

    /// Evaluate a rule, recording any type-mismatch warning on the execution.
    fn check(&self, rule: &ConditionRule, step: &WorkflowStep, exec: &mut WorkflowExecution) -> bool {
        let outcome = evaluate_detailed(rule, &exec.context);
        if let Some(warning) = outcome.warning {
            warn!(
                execution_id = %exec.execution_id,
                step_id = %step.id,
                "{}", warning
            );
            exec.warnings.push(format!("step '{}': {}", step.id, warning));
        }
        outcome.matched
    }

    fn finish(&self, exec: &mut WorkflowExecution, step_id: &str, status: StepStatus) -> StepExecution {
        let Some(record) = exec.step_mut(step_id) else {
            return StepExecution::pending(step_id, None);
        };
        record.finish(status);
        let record = record.clone();
        self.events.publish(WorkflowEvent::StepFinished {
            execution_id: exec.execution_id.clone(),
            step_id: step_id.to_string(),
            status,
        });
        record
    }

    async fn call_with_retry(
        &self,
        step: &WorkflowStep,
        handle: &ExecutionHandle,
        execution_id: &str,
        user_id: &str,
        parameters: std::collections::HashMap<String, Value>,
    ) -> CallOutcome {
        let timeout = step
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);
        let max_retries = step.retry_count.unwrap_or(0);
        let mut retries = 0u32;

        loop {
            if handle.is_cancelled() {
                return CallOutcome::Abandoned;
            }

            let request = AgentRequest {
                agent_id: step.agent.clone().unwrap_or_default(),
                action: step.action.clone().unwrap_or_default(),
                parameters: parameters.clone(),
                request_id: format!("{}_{}", execution_id, step.id),
                user_id: user_id.to_string(),
                timeout_secs: timeout.as_secs(),
            };
            debug!(
                execution_id = %execution_id,
                step_id = %step.id,
                agent_id = %request.agent_id,
                action = %request.action,
                attempt = retries + 1,
                "Sending agent request"
            );

            let call = self
                .agent
                .send_request(request, handle.cancellation.child_token());
            let attempt = tokio::select! {
                _ = handle.cancellation.cancelled() => return CallOutcome::Abandoned,
                attempt = tokio::time::timeout(timeout, call) => attempt,
            };
            let error = match attempt {
                Ok(Ok(response)) if response.success => return CallOutcome::Succeeded(response.data),
                Ok(Ok(response)) => response
                    .error
                    .unwrap_or_else(|| "agent reported failure".to_string()),
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("agent call timed out after {}s", timeout.as_secs()),
            };

            if retries >= max_retries {
                return CallOutcome::Failed(error);
            }
            retries += 1;

            {
                let mut exec = handle.record.lock();
                if handle.is_cancelled() {
                    return CallOutcome::Abandoned;
                }
                match exec.step_mut(&step.id) {
                    Some(record) if !record.status.is_terminal() => record.retry_count = retries,
                    _ => return CallOutcome::Abandoned,
                }
            }

            let delay = self.retry.backoff(retries);
            warn!(
                execution_id = %execution_id,
                step_id = %step.id,
                attempt = retries,
                max_retries,
                backoff_ms = delay.as_millis() as u64,
                error = %error,
                "Action step failed, retrying"
            );
            self.events.publish(WorkflowEvent::StepRetrying {
                execution_id: execution_id.to_string(),
                step_id: step.id.clone(),
                attempt: retries,
                error,
            });

            tokio::select! {
                _ = handle.cancellation.cancelled() => return CallOutcome::Abandoned,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

fn snapshot(exec: &WorkflowExecution, step_id: &str) -> StepExecution {
    exec.step(step_id)
        .cloned()
        .unwrap_or_else(|| StepExecution::pending(step_id, None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use crate::agent::{MockAgentClient, MockReply};
    use crate::definition::{ConditionOperator, WorkflowDefinition};
    use crate::engine::RegisteredWorkflow;

    fn handle_for(definition: WorkflowDefinition, params: HashMap<String, Value>) -> ExecutionHandle {
        let workflow = Arc::new(RegisteredWorkflow::new(definition, 30).unwrap());
        let mut exec = WorkflowExecution::new(&workflow.definition, params, "u1", HashMap::new());
        exec.start();
        ExecutionHandle::new(exec, workflow, EventBus::default())
    }

    fn dispatcher(mock: Arc<MockAgentClient>) -> StepDispatcher {
        StepDispatcher::new(
            mock,
            RetryPolicy::new(Duration::from_millis(100), Duration::from_secs(1)),
            Duration::from_secs(30),
            EventBus::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_action_success_stores_result() {
        let mock = Arc::new(
            MockAgentClient::new().script("xiaoai", "analyze", [MockReply::ok(json!({"severity": 6}))]),
        );
        let step = WorkflowStep::action("init", "xiaoai", "analyze");
        let handle = handle_for(WorkflowDefinition::new("wf", "wf").with_step(step), HashMap::new());
        let step = handle.workflow.definition.steps[0].clone();

        let record = dispatcher(mock.clone()).dispatch(&step, &handle).await;
        assert_eq!(record.status, StepStatus::Completed);
        assert_eq!(record.result, json!({"severity": 6}));
        assert!(record.end_time.is_some());

        let exec = handle.record.lock();
        assert_eq!(exec.context["step_init_result"]["severity"], json!(6));
        let request = &mock.calls()[0].request;
        assert_eq!(request.request_id, format!("{}_init", exec.execution_id));
        assert_eq!(request.user_id, "u1");
        assert_eq!(request.timeout_secs, 30);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_success() {
        let mock = Arc::new(MockAgentClient::new().script(
            "xiaoai",
            "analyze",
            [
                MockReply::fail("busy"),
                MockReply::transport_error("reset"),
                MockReply::ok(json!("done")),
            ],
        ));
        let step = WorkflowStep::action("init", "xiaoai", "analyze").with_retry_count(2);
        let handle = handle_for(WorkflowDefinition::new("wf", "wf").with_step(step), HashMap::new());
        let step = handle.workflow.definition.steps[0].clone();

        let started = tokio::time::Instant::now();
        let record = dispatcher(mock.clone()).dispatch(&step, &handle).await;
        assert_eq!(record.status, StepStatus::Completed);
        assert_eq!(record.retry_count, 2);
        assert_eq!(mock.call_count(), 3);
        // 100ms + 200ms of backoff
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted() {
        let mock = Arc::new(MockAgentClient::with_fallback(MockReply::fail("unavailable")));
        let step = WorkflowStep::action("init", "xiaoai", "analyze").with_retry_count(1);
        let handle = handle_for(WorkflowDefinition::new("wf", "wf").with_step(step), HashMap::new());
        let step = handle.workflow.definition.steps[0].clone();

        let record = dispatcher(mock.clone()).dispatch(&step, &handle).await;
        assert_eq!(record.status, StepStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("unavailable"));
        assert_eq!(record.retry_count, 1);
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let mock = Arc::new(MockAgentClient::with_fallback(
            MockReply::ok(json!(null)).after(Duration::from_secs(10)),
        ));
        let step = WorkflowStep::action("slow", "xiaoai", "analyze").with_timeout_secs(2);
        let handle = handle_for(WorkflowDefinition::new("wf", "wf").with_step(step), HashMap::new());
        let step = handle.workflow.definition.steps[0].clone();

        let record = dispatcher(mock).dispatch(&step, &handle).await;
        assert_eq!(record.status, StepStatus::Failed);
        assert!(record.error.unwrap().contains("timed out after 2s"));
    }

    #[tokio::test]
    async fn test_condition_step_records_boolean() {
        let rule = ConditionRule::new("severity", ConditionOperator::GreaterThan, json!(5));
        let step = WorkflowStep::condition("check", rule);
        let handle = handle_for(
            WorkflowDefinition::new("wf", "wf").with_step(step),
            HashMap::from([("severity".to_string(), json!(6))]),
        );
        let step = handle.workflow.definition.steps[0].clone();

        let mock = Arc::new(MockAgentClient::new());
        let record = dispatcher(mock.clone()).dispatch(&step, &handle).await;
        assert_eq!(record.status, StepStatus::Completed);
        assert_eq!(record.result, json!({"condition_result": true}));
        assert_eq!(handle.record.lock().context["step_check_condition"], json!(true));
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn test_gate_false_skips_without_agent_call() {
        let step = WorkflowStep::action("advice", "xiaoai", "advise").when(ConditionRule::new(
            "flag",
            ConditionOperator::Equals,
            json!(true),
        ));
        let handle = handle_for(
            WorkflowDefinition::new("wf", "wf").with_step(step),
            HashMap::from([("flag".to_string(), json!(false))]),
        );
        let step = handle.workflow.definition.steps[0].clone();

        let mock = Arc::new(MockAgentClient::new());
        let record = dispatcher(mock.clone()).dispatch(&step, &handle).await;
        assert_eq!(record.status, StepStatus::Skipped);
        assert_eq!(record.retry_count, 0);
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn test_gate_type_mismatch_records_warning() {
        let step = WorkflowStep::action("a", "xiaoai", "run").when(ConditionRule::new(
            "label",
            ConditionOperator::GreaterThan,
            json!(1),
        ));
        let handle = handle_for(
            WorkflowDefinition::new("wf", "wf").with_step(step),
            HashMap::from([("label".to_string(), json!("high"))]),
        );
        let step = handle.workflow.definition.steps[0].clone();

        let record = dispatcher(Arc::new(MockAgentClient::new()))
            .dispatch(&step, &handle)
            .await;
        assert_eq!(record.status, StepStatus::Skipped);
        let warnings = handle.record.lock().warnings.clone();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].starts_with("step 'a':"));
    }

    #[tokio::test]
    async fn test_templates_resolved_into_request() {
        let step = WorkflowStep::action("a", "xiaoai", "run")
            .with_parameter("patient", json!("{{patient_id}}"))
            .with_parameter("note", json!("for {{patient_id}}"));
        let handle = handle_for(
            WorkflowDefinition::new("wf", "wf").with_step(step),
            HashMap::from([("patient_id".to_string(), json!(42))]),
        );
        let step = handle.workflow.definition.steps[0].clone();

        let mock = Arc::new(MockAgentClient::new());
        dispatcher(mock.clone()).dispatch(&step, &handle).await;
        let request = &mock.calls()[0].request;
        assert_eq!(request.parameters["patient"], json!(42));
        assert_eq!(request.parameters["note"], json!("for 42"));
    }

    #[tokio::test]
    async fn test_unresolved_template_fails_step() {
        let step = WorkflowStep::action("a", "xiaoai", "run")
            .with_parameter("input", json!("{{step_missing_result}}"))
            .with_retry_count(3);
        let handle = handle_for(WorkflowDefinition::new("wf", "wf").with_step(step), HashMap::new());
        let step = handle.workflow.definition.steps[0].clone();

        let mock = Arc::new(MockAgentClient::new());
        let record = dispatcher(mock.clone()).dispatch(&step, &handle).await;
        assert_eq!(record.status, StepStatus::Failed);
        assert!(record.error.unwrap().contains("step_missing_result"));
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_call_discards_result() {
        let mock = Arc::new(MockAgentClient::with_fallback(
            MockReply::ok(json!("late")).after(Duration::from_secs(5)),
        ));
        let step = WorkflowStep::action("a", "xiaoai", "run");
        let handle = Arc::new(handle_for(
            WorkflowDefinition::new("wf", "wf").with_step(step),
            HashMap::new(),
        ));
        let step = handle.workflow.definition.steps[0].clone();

        let task = {
            let handle = handle.clone();
            let dispatcher = dispatcher(mock);
            tokio::spawn(async move { dispatcher.dispatch(&step, &handle).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.cancel(None);

        let record = task.await.unwrap();
        assert_eq!(record.status, StepStatus::Cancelled);
        let exec = handle.record.lock();
        assert!(!exec.context.contains_key("step_a_result"));
        assert_eq!(exec.step("a").unwrap().result, Value::Null);
    }
}
