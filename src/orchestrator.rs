use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditStore};
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::draft::{DraftGenerator, DraftRepairer};
use crate::error::StepError;
use crate::gateway::ResourceGateway;
use crate::state_machine::{
    RetryConfig, RunId, RunResult, RunState, State, StateMachine, StepName, Transition,
};

/// Longest document excerpt kept in an audit input summary.
const SUMMARY_TEXT_LIMIT: usize = 500;

/// Drives one referral run through the state machine, auditing every step.
///
/// The engine owns its adapters; the audit and checkpoint stores are shared
/// by every run in the process.
pub struct WorkflowEngine<G, R, W> {
    generator: G,
    repairer: R,
    gateway: W,
    audit: Arc<dyn AuditStore>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    retry: RetryConfig,
}

/// What a completed step contributes to its audit record.
struct StepReport {
    success: bool,
    output: Value,
    error: Option<String>,
}

impl StepReport {
    fn ok(output: Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
        }
    }
}

/// Per-invocation bookkeeping.
struct Execution {
    id: Uuid,
    audit_failures: u32,
}

impl<G, R, W> WorkflowEngine<G, R, W>
where
    G: DraftGenerator,
    R: DraftRepairer,
    W: ResourceGateway,
{
    pub fn new(generator: G, repairer: R, gateway: W, audit: Arc<dyn AuditStore>) -> Self {
        Self {
            generator,
            repairer,
            gateway,
            audit,
            checkpoints: None,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry_ceiling(mut self, max_retries: u32) -> Self {
        self.retry = RetryConfig { max_retries };
        self
    }

    pub fn with_checkpoints(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn retry_config(&self) -> RetryConfig {
        self.retry
    }

    /// Run the workflow to a terminal state.
    ///
    /// Never fails: step errors end the run as `Aborted` and are reported in
    /// the result. A non-terminal checkpoint for the same run id takes
    /// precedence over `initial`.
    pub async fn run(&self, initial: RunState) -> RunResult {
        let mut exec = Execution {
            id: Uuid::new_v4(),
            audit_failures: 0,
        };
        let (mut state, mut run) = self.resume(initial);
        info!(run_id = %run.run_id, execution_id = %exec.id, %state, "run started");

        loop {
            match StateMachine::next(state, &run, &self.retry) {
                Transition::Execute(step) => {
                    match self.execute(step, &mut run, &mut exec).await {
                        Ok(()) => match StateMachine::advance(state, step) {
                            Some(next) => {
                                debug!(run_id = %run.run_id, from = %state, to = %next, "transition");
                                state = next;
                            }
                            None => run.fail(&StepError::Precondition(format!(
                                "step {step} is not legal from {state}"
                            ))),
                        },
                        Err(err) => {
                            error!(run_id = %run.run_id, %step, error = %err, "step failed");
                            run.fail(&err);
                        }
                    }
                    if !run.is_failed() {
                        self.save_checkpoint(state, &run);
                    }
                }
                Transition::Finish(terminal) => {
                    let mut result = RunResult::from_run(&run, terminal, exec.id, 0);
                    self.record(&run, &result, &mut exec);
                    self.clear_checkpoint(&run.run_id);
                    result.audit_failures = exec.audit_failures;
                    info!(
                        run_id = %run.run_id,
                        state = %terminal,
                        success = result.success,
                        retry_count = run.retry_count,
                        "run finished"
                    );
                    return result;
                }
            }
        }
    }

    fn resume(&self, initial: RunState) -> (State, RunState) {
        let Some(store) = &self.checkpoints else {
            return (State::Start, initial);
        };
        match store.load(&initial.run_id) {
            Ok(Some(cp)) if !cp.run.same_source(&initial) => {
                warn!(
                    run_id = %initial.run_id,
                    checkpoint_document = %cp.run.source_document_ref,
                    document = %initial.source_document_ref,
                    "checkpoint belongs to another document, starting fresh"
                );
                (State::Start, initial)
            }
            Ok(Some(cp)) if !cp.state.is_terminal() => {
                info!(
                    run_id = %cp.run_id,
                    state = %cp.state,
                    retry_count = cp.run.retry_count,
                    "resuming from checkpoint"
                );
                (cp.state, cp.run)
            }
            Ok(_) => (State::Start, initial),
            Err(err) => {
                warn!(run_id = %initial.run_id, error = %err, "could not load checkpoint, starting fresh");
                (State::Start, initial)
            }
        }
    }

    /// Execute one step and append exactly one audit record for the attempt.
    async fn execute(
        &self,
        step: StepName,
        run: &mut RunState,
        exec: &mut Execution,
    ) -> Result<(), StepError> {
        info!(run_id = %run.run_id, %step, retry_count = run.retry_count, "executing step");
        let retry_count_at_time = run.retry_count;
        let input_summary = input_summary(step, run);

        let outcome = match step {
            StepName::Generate => self.generate(run).await,
            StepName::Validate => self.validate(run).await,
            StepName::Repair => self.repair(run).await,
            StepName::Submit => self.submit(run).await,
            StepName::Record => Err(StepError::Precondition(
                "record only runs on terminal transitions".to_string(),
            )),
        };

        let (success, output_summary, error_message) = match &outcome {
            Ok(report) => (report.success, report.output.clone(), report.error.clone()),
            Err(err) => (false, Value::Null, Some(err.to_string())),
        };
        self.append(
            exec,
            AuditEntry {
                run_id: run.run_id.clone(),
                execution_id: exec.id,
                step,
                input_summary,
                output_summary,
                success,
                error_message,
                retry_count_at_time,
            },
        );

        outcome.map(|_| ())
    }

    async fn generate(&self, run: &mut RunState) -> Result<StepReport, StepError> {
        let resource = self
            .generator
            .generate(&run.extracted_content, &run.identity_context)
            .await?;
        let output = json!({ "resource": resource });
        run.set_candidate(resource);
        Ok(StepReport::ok(output))
    }

    async fn validate(&self, run: &mut RunState) -> Result<StepReport, StepError> {
        let candidate = run
            .candidate_resource
            .as_ref()
            .ok_or_else(|| StepError::Precondition("no candidate resource to validate".into()))?;
        let outcome = self.gateway.validate(candidate).await?;

        // No judgment was made, so there is nothing to repair against.
        if let Some(detail) = outcome.transport_error.clone() {
            run.record_validation(outcome);
            return Err(StepError::ValidationTransport(detail));
        }
        if !outcome.valid {
            warn!(run_id = %run.run_id, errors = outcome.errors.len(), "candidate failed validation");
        }
        let report = StepReport {
            success: outcome.valid,
            output: json!({ "valid": outcome.valid, "errors": outcome.errors }),
            error: (!outcome.valid).then(|| outcome.errors.join("; ")),
        };
        run.record_validation(outcome);
        Ok(report)
    }

    async fn repair(&self, run: &mut RunState) -> Result<StepReport, StepError> {
        let candidate = run
            .candidate_resource
            .as_ref()
            .ok_or_else(|| StepError::Precondition("no candidate resource to repair".into()))?;
        let repaired = self
            .repairer
            .repair(candidate, run.validation_errors())
            .await?;
        let output = json!({ "resource": repaired });
        run.apply_repair(repaired);
        Ok(StepReport::ok(output))
    }

    async fn submit(&self, run: &mut RunState) -> Result<StepReport, StepError> {
        if run.submission_outcome.is_some() {
            return Err(StepError::Precondition(
                "resource was already submitted for this run".into(),
            ));
        }
        if run.submission_in_doubt() {
            return Err(StepError::Submission(
                "outcome of an interrupted submission is unknown, not resubmitting".into(),
            ));
        }
        let Some(resource) = run.final_resource.clone() else {
            return Err(StepError::Precondition("no validated resource to submit".into()));
        };

        // Submit is not idempotent: the marker must be durable before the call.
        run.begin_submission();
        self.save_checkpoint(State::Validated, run);

        let outcome = self.gateway.submit(&resource).await?;

        let report = StepReport {
            success: outcome.success,
            output: json!({
                "success": outcome.success,
                "status_code": outcome.status_code,
                "resource_id": outcome.resource_id,
            }),
            error: outcome.error.clone(),
        };
        run.record_submission(outcome);
        Ok(report)
    }

    /// The closing record written on every terminal path.
    fn record(&self, run: &RunState, result: &RunResult, exec: &mut Execution) {
        let entry = AuditEntry {
            run_id: run.run_id.clone(),
            execution_id: exec.id,
            step: StepName::Record,
            input_summary: json!({
                "source_document": run.source_document_ref,
                "final_state": result.final_state,
            }),
            output_summary: json!({
                "success": result.success,
                "retry_count": result.retry_count,
                "resource_id": result.submission.as_ref().and_then(|s| s.resource_id.clone()),
                "failure_kind": result.failure.as_ref().map(|f| f.kind),
            }),
            success: result.success,
            error_message: result.failure.as_ref().map(|f| f.message.clone()),
            retry_count_at_time: run.retry_count,
        };
        self.append(exec, entry);
    }

    fn append(&self, exec: &mut Execution, entry: AuditEntry) {
        let (run_id, step) = (entry.run_id.clone(), entry.step);
        if let Err(err) = self.audit.append(entry) {
            exec.audit_failures += 1;
            warn!(%run_id, %step, error = %err, "audit record could not be persisted");
        }
    }

    fn save_checkpoint(&self, state: State, run: &RunState) {
        if let Some(store) = &self.checkpoints
            && let Err(err) = store.save(&Checkpoint::new(state, run))
        {
            warn!(run_id = %run.run_id, %state, error = %err, "checkpoint could not be saved");
        }
    }

    fn clear_checkpoint(&self, run_id: &RunId) {
        if let Some(store) = &self.checkpoints
            && let Err(err) = store.clear(run_id)
        {
            warn!(%run_id, error = %err, "checkpoint could not be cleared");
        }
    }
}

fn input_summary(step: StepName, run: &RunState) -> Value {
    match step {
        StepName::Generate => json!({
            "source_document": run.source_document_ref,
            "text_content": truncate(&run.extracted_content.text_content, SUMMARY_TEXT_LIMIT),
            "identity_context": run.identity_context,
        }),
        StepName::Validate => json!({ "resource": run.candidate_resource }),
        StepName::Repair => json!({
            "resource": run.candidate_resource,
            "errors": run.validation_errors(),
        }),
        StepName::Submit => json!({ "resource": run.final_resource }),
        StepName::Record => Value::Null,
    }
}

fn truncate(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}
