use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::state::State;
use crate::error::{FailureKind, StepError};

/// A candidate or final clinical resource, kept as a JSON object.
pub type Resource = Map<String, Value>;

/// Patient/requester context gathered before the run. May be empty.
pub type IdentityContext = Map<String, Value>;

/// Identifies a run across restarts. Derived from the source document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// `referral_<stem>`, with anything outside `[A-Za-z0-9_-]` replaced by `_`.
    pub fn from_document(path: &Path) -> Self {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_string());
        let cleaned: String = stem
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        Self(format!("referral_{cleaned}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Output of the text-extraction service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedContent {
    pub text_content: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub extraction_method: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ExtractedContent {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            text_content: text.into(),
            ..Default::default()
        }
    }
}

/// The registry's pass/fail judgment on a candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub errors: Vec<String>,
    /// Set when no judgment could be obtained from the registry. The outcome
    /// is then invalid with one synthetic error, and the run must not repair.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport_error: Option<String>,
}

impl ValidationOutcome {
    pub fn valid() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            transport_error: None,
        }
    }

    pub fn invalid(errors: Vec<String>) -> Self {
        Self {
            valid: false,
            errors,
            transport_error: None,
        }
    }

    /// The endpoint could not be reached or answered without a judgment.
    pub fn unreachable(detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Self {
            valid: false,
            errors: vec![StepError::ValidationTransport(detail.clone()).to_string()],
            transport_error: Some(detail),
        }
    }
}

/// Result of the single submit call of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubmissionOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SubmissionOutcome {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Why a run ended without success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl From<&StepError> for RunFailure {
    fn from(err: &StepError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl std::fmt::Display for RunFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Configuration for the repair loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of repair cycles before the run is aborted.
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

/// The record threaded through one workflow execution.
///
/// Owned by exactly one engine run. The workflow fields are only written
/// through the methods below so the invariants between them hold:
/// `final_resource` is set only when the latest validation passed, and
/// `retry_count` only moves when a repair is applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: RunId,
    pub source_document_ref: String,
    pub extracted_content: ExtractedContent,
    pub identity_context: IdentityContext,
    pub(crate) candidate_resource: Option<Resource>,
    pub(crate) validation_outcome: Option<ValidationOutcome>,
    pub(crate) final_resource: Option<Resource>,
    /// A submit call was started. Persisted before the call goes out.
    #[serde(default)]
    pub(crate) submission_attempted: bool,
    pub(crate) submission_outcome: Option<SubmissionOutcome>,
    pub(crate) retry_count: u32,
    pub(crate) failure: Option<RunFailure>,
}

impl RunState {
    pub fn new(
        source_document: &Path,
        extracted_content: ExtractedContent,
        identity_context: IdentityContext,
    ) -> Self {
        Self {
            run_id: RunId::from_document(source_document),
            source_document_ref: source_document.display().to_string(),
            extracted_content,
            identity_context,
            candidate_resource: None,
            validation_outcome: None,
            final_resource: None,
            submission_attempted: false,
            submission_outcome: None,
            retry_count: 0,
            failure: None,
        }
    }

    pub fn candidate_resource(&self) -> Option<&Resource> {
        self.candidate_resource.as_ref()
    }

    pub fn validation_outcome(&self) -> Option<&ValidationOutcome> {
        self.validation_outcome.as_ref()
    }

    pub fn final_resource(&self) -> Option<&Resource> {
        self.final_resource.as_ref()
    }

    pub fn submission_outcome(&self) -> Option<&SubmissionOutcome> {
        self.submission_outcome.as_ref()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Whether `other` was built from the same document and text.
    pub fn same_source(&self, other: &RunState) -> bool {
        self.source_document_ref == other.source_document_ref
            && self.extracted_content.text_content == other.extracted_content.text_content
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure.as_ref().map(|f| f.message.as_str())
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    pub fn set_candidate(&mut self, resource: Resource) {
        self.candidate_resource = Some(resource);
    }

    /// Store a validation outcome. A passing outcome freezes the current
    /// candidate as the final resource; a failing one withdraws it.
    pub fn record_validation(&mut self, outcome: ValidationOutcome) {
        if !outcome.valid {
            self.final_resource = None;
        } else if self.final_resource.is_none() {
            self.final_resource = self.candidate_resource.clone();
        }
        self.validation_outcome = Some(outcome);
    }

    pub fn is_valid(&self) -> bool {
        self.validation_outcome.as_ref().is_some_and(|v| v.valid)
    }

    pub fn validation_errors(&self) -> &[String] {
        self.validation_outcome
            .as_ref()
            .map(|v| v.errors.as_slice())
            .unwrap_or(&[])
    }

    /// Replace the candidate with a repaired one and count the cycle.
    pub fn apply_repair(&mut self, repaired: Resource) {
        self.candidate_resource = Some(repaired);
        self.retry_count += 1;
    }

    /// Mark a submit call as in flight.
    pub fn begin_submission(&mut self) {
        self.submission_attempted = true;
    }

    /// A submit call was started but its result never got recorded.
    pub fn submission_in_doubt(&self) -> bool {
        self.submission_attempted && self.submission_outcome.is_none()
    }

    pub fn record_submission(&mut self, outcome: SubmissionOutcome) {
        if self.submission_outcome.is_none() {
            self.submission_outcome = Some(outcome);
        }
    }

    /// Mark the run failed. The first failure wins.
    pub fn fail(&mut self, err: &StepError) {
        if self.failure.is_none() {
            self.failure = Some(RunFailure::from(err));
        }
    }

    pub fn submitted_successfully(&self) -> bool {
        self.submission_outcome.as_ref().is_some_and(|s| s.success)
    }
}

/// Terminal output of a run handed back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: RunId,
    pub execution_id: Uuid,
    pub success: bool,
    pub final_state: State,
    pub final_resource: Option<Resource>,
    pub submission: Option<SubmissionOutcome>,
    pub validation: Option<ValidationOutcome>,
    pub retry_count: u32,
    /// Set only when a step raised an error.
    pub failure_reason: Option<String>,
    /// Why the run did not succeed, including non-raised endings such as an
    /// exhausted retry ceiling or a rejected submission.
    pub failure: Option<RunFailure>,
    /// Audit appends that could not be persisted during this execution.
    pub audit_failures: u32,
}

impl RunResult {
    pub fn from_run(
        run: &RunState,
        final_state: State,
        execution_id: Uuid,
        audit_failures: u32,
    ) -> Self {
        let success = run.failure.is_none() && run.submitted_successfully();
        Self {
            run_id: run.run_id.clone(),
            execution_id,
            success,
            final_state,
            final_resource: run.final_resource.clone(),
            submission: run.submission_outcome.clone(),
            validation: run.validation_outcome.clone(),
            retry_count: run.retry_count,
            failure_reason: run.failure_reason().map(str::to_string),
            failure: if success { None } else { describe_failure(run) },
            audit_failures,
        }
    }
}

fn describe_failure(run: &RunState) -> Option<RunFailure> {
    if let Some(failure) = &run.failure {
        return Some(failure.clone());
    }
    if let Some(submission) = &run.submission_outcome {
        let detail = submission
            .error
            .clone()
            .unwrap_or_else(|| "registry rejected the resource".to_string());
        let message = match submission.status_code {
            Some(status) => format!("HTTP {status}: {detail}"),
            None => detail,
        };
        return Some(RunFailure {
            kind: FailureKind::Submission,
            message,
        });
    }
    if run.validation_outcome.as_ref().is_some_and(|v| !v.valid) {
        return Some(RunFailure {
            kind: FailureKind::RetriesExhausted,
            message: format!(
                "resource still invalid after {} repair attempts: {}",
                run.retry_count,
                run.validation_errors().join("; ")
            ),
        });
    }
    Some(RunFailure {
        kind: FailureKind::Precondition,
        message: "run ended before a resource could be submitted".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resource(value: Value) -> Resource {
        value.as_object().cloned().unwrap()
    }

    fn make_run() -> RunState {
        RunState::new(
            Path::new("/data/referrals/cardiology referral.pdf"),
            ExtractedContent::from_text("Refer to cardiology"),
            IdentityContext::new(),
        )
    }

    #[test]
    fn run_id_is_derived_from_document_stem() {
        let run = make_run();
        assert_eq!(run.run_id.as_str(), "referral_cardiology_referral");
        assert_eq!(
            RunId::from_document(Path::new("a/b/ref-01.pdf")).to_string(),
            "referral_ref-01"
        );
    }

    #[test]
    fn new_run_starts_empty() {
        let run = make_run();
        assert_eq!(run.retry_count, 0);
        assert!(run.candidate_resource.is_none());
        assert!(run.final_resource.is_none());
        assert!(run.submission_outcome.is_none());
        assert!(!run.is_failed());
        assert!(run.validation_errors().is_empty());
    }

    #[test]
    fn valid_outcome_freezes_final_resource() {
        let mut run = make_run();
        run.set_candidate(resource(json!({"resourceType": "ServiceRequest"})));
        run.record_validation(ValidationOutcome::invalid(vec!["missing intent".into()]));
        assert!(run.final_resource.is_none());

        run.apply_repair(resource(
            json!({"resourceType": "ServiceRequest", "intent": "order"}),
        ));
        run.record_validation(ValidationOutcome::valid());
        assert_eq!(run.final_resource, run.candidate_resource);
        assert_eq!(run.retry_count, 1);
    }

    #[test]
    fn invalid_outcome_withdraws_final_resource() {
        let mut run = make_run();
        run.set_candidate(resource(json!({"resourceType": "ServiceRequest"})));
        run.record_validation(ValidationOutcome::valid());
        assert!(run.final_resource().is_some());

        run.record_validation(ValidationOutcome::invalid(vec!["late error".into()]));
        assert!(run.final_resource().is_none());
        assert!(!run.is_valid());
    }

    #[test]
    fn unreachable_outcome_carries_transport_detail() {
        let outcome = ValidationOutcome::unreachable("request timed out");
        assert!(!outcome.valid);
        assert_eq!(outcome.transport_error.as_deref(), Some("request timed out"));
        assert_eq!(
            outcome.errors,
            vec!["validation endpoint unavailable: request timed out"]
        );
    }

    #[test]
    fn submission_in_doubt_until_recorded() {
        let mut run = make_run();
        assert!(!run.submission_in_doubt());
        run.begin_submission();
        assert!(run.submission_in_doubt());
        run.record_submission(SubmissionOutcome::failed("refused"));
        assert!(!run.submission_in_doubt());
    }

    #[test]
    fn same_source_compares_path_and_text() {
        let run = make_run();
        assert!(run.same_source(&make_run()));

        let other_dir = RunState::new(
            Path::new("/other/inbox/cardiology referral.pdf"),
            ExtractedContent::from_text("Refer to cardiology"),
            IdentityContext::new(),
        );
        assert_eq!(other_dir.run_id, run.run_id);
        assert!(!run.same_source(&other_dir));

        let mut other_text = make_run();
        other_text.extracted_content.text_content = "Refer to neurology".into();
        assert!(!run.same_source(&other_text));
    }

    #[test]
    fn checkpoint_without_attempt_flag_still_loads() {
        let run = make_run();
        let mut value = serde_json::to_value(&run).unwrap();
        value.as_object_mut().unwrap().remove("submission_attempted");
        let back: RunState = serde_json::from_value(value).unwrap();
        assert!(!back.submission_attempted);
    }

    #[test]
    fn first_failure_wins() {
        let mut run = make_run();
        run.fail(&StepError::Generation("bad json".into()));
        run.fail(&StepError::Submission("late".into()));
        assert_eq!(run.failure_reason(), Some("generation failed: bad json"));
        assert_eq!(run.failure.unwrap().kind, FailureKind::Generation);
    }

    #[test]
    fn result_reports_exhausted_retries() {
        let mut run = make_run();
        run.set_candidate(resource(json!({})));
        run.record_validation(ValidationOutcome::invalid(vec!["still wrong".into()]));
        let result = RunResult::from_run(&run, State::Aborted, Uuid::new_v4(), 0);
        assert!(!result.success);
        assert!(result.failure_reason.is_none());
        let failure = result.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::RetriesExhausted);
        assert!(failure.message.contains("still wrong"));
    }

    #[test]
    fn result_reports_rejected_submission() {
        let mut run = make_run();
        run.record_submission(SubmissionOutcome {
            success: false,
            status_code: Some(422),
            error: Some("duplicate".into()),
            ..Default::default()
        });
        let result = RunResult::from_run(&run, State::Recorded, Uuid::new_v4(), 0);
        assert!(!result.success);
        let failure = result.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::Submission);
        assert_eq!(failure.message, "HTTP 422: duplicate");
    }

    #[test]
    fn run_state_serialization_roundtrip() {
        let mut run = make_run();
        run.set_candidate(resource(json!({"resourceType": "ServiceRequest"})));
        let json = serde_json::to_string(&run).unwrap();
        let back: RunState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, run);
    }
}
