//! Pure routing decisions at the workflow's branch points.
//!
//! Nothing here performs I/O or mutates state, so the same run state always
//! yields the same decision.

use crate::state_machine::{RetryConfig, RunState};

/// Decision taken after a validation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterValidate {
    Submit,
    Repair,
    Abort,
}

/// Decision taken after a submission step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterSubmit {
    Record,
    Abort,
}

/// Validity is checked before the retry count, so a candidate that becomes
/// valid exactly at the ceiling is still submitted. A missing outcome counts
/// as invalid.
pub fn decide_after_validate(run: &RunState, retry: &RetryConfig) -> AfterValidate {
    if run.is_valid() {
        AfterValidate::Submit
    } else if run.retry_count < retry.max_retries {
        AfterValidate::Repair
    } else {
        AfterValidate::Abort
    }
}

/// Any submission result, accepted or rejected, is recorded. Abort only when
/// no submission could be attempted.
pub fn decide_after_submit(run: &RunState) -> AfterSubmit {
    if run.submission_outcome.is_some() {
        AfterSubmit::Record
    } else {
        AfterSubmit::Abort
    }
}
