use std::fmt;

use serde::{Deserialize, Serialize};

use super::run::{RetryConfig, RunState};
use crate::router::{self, AfterSubmit, AfterValidate};

/// The states of the referral workflow.
///
/// START → GENERATED → VALIDATED ⇄ REPAIRED, then VALIDATED → SUBMITTED →
/// RECORDED on the happy path. ABORTED is reachable from VALIDATED when the
/// retry ceiling is exhausted, or from anywhere when a step raises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    Start,
    Generated,
    Validated,
    Repaired,
    Submitted,
    Recorded,
    Aborted,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Recorded | State::Aborted)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Start => write!(f, "START"),
            State::Generated => write!(f, "GENERATED"),
            State::Validated => write!(f, "VALIDATED"),
            State::Repaired => write!(f, "REPAIRED"),
            State::Submitted => write!(f, "SUBMITTED"),
            State::Recorded => write!(f, "RECORDED"),
            State::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// The steps the engine can execute. Each attempt yields one audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    Generate,
    Validate,
    Repair,
    Submit,
    Record,
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepName::Generate => write!(f, "generate"),
            StepName::Validate => write!(f, "validate"),
            StepName::Repair => write!(f, "repair"),
            StepName::Submit => write!(f, "submit"),
            StepName::Record => write!(f, "record"),
        }
    }
}

/// What the engine should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Run the given step.
    Execute(StepName),
    /// Write the terminal record and stop in the given state.
    Finish(State),
}

/// Transition table of the workflow.
pub struct StateMachine;

impl StateMachine {
    /// Compute the next transition from the current state and run data.
    ///
    /// A failed run always finishes as `Aborted`. The branch points
    /// (`Validated`, `Submitted`) defer to the router.
    pub fn next(state: State, run: &RunState, retry: &RetryConfig) -> Transition {
        if run.is_failed() {
            return Transition::Finish(State::Aborted);
        }

        match state {
            State::Start => Transition::Execute(StepName::Generate),
            State::Generated | State::Repaired => Transition::Execute(StepName::Validate),
            State::Validated => match router::decide_after_validate(run, retry) {
                AfterValidate::Submit => Transition::Execute(StepName::Submit),
                AfterValidate::Repair => Transition::Execute(StepName::Repair),
                AfterValidate::Abort => Transition::Finish(State::Aborted),
            },
            State::Submitted => match router::decide_after_submit(run) {
                AfterSubmit::Record => Transition::Finish(State::Recorded),
                AfterSubmit::Abort => Transition::Finish(State::Aborted),
            },
            State::Recorded | State::Aborted => Transition::Finish(state),
        }
    }

    /// State reached after `step` completes without raising, or `None` when
    /// the step is not legal from `from`.
    pub fn advance(from: State, step: StepName) -> Option<State> {
        match (from, step) {
            (State::Start, StepName::Generate) => Some(State::Generated),
            (State::Generated | State::Repaired, StepName::Validate) => Some(State::Validated),
            (State::Validated, StepName::Repair) => Some(State::Repaired),
            (State::Validated, StepName::Submit) => Some(State::Submitted),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use serde_json::json;

    use super::*;
    use crate::error::StepError;
    use crate::state_machine::{ExtractedContent, IdentityContext, SubmissionOutcome, ValidationOutcome};

    fn make_run() -> RunState {
        let mut run = RunState::new(
            Path::new("referral.pdf"),
            ExtractedContent::from_text("text"),
            IdentityContext::new(),
        );
        run.set_candidate(json!({"resourceType": "ServiceRequest"}).as_object().cloned().unwrap());
        run
    }

    #[test]
    fn happy_path_walks_all_states() {
        let retry = RetryConfig::default();
        let mut run = make_run();

        assert_eq!(
            StateMachine::next(State::Start, &run, &retry),
            Transition::Execute(StepName::Generate)
        );
        assert_eq!(
            StateMachine::next(State::Generated, &run, &retry),
            Transition::Execute(StepName::Validate)
        );

        run.record_validation(ValidationOutcome::valid());
        assert_eq!(
            StateMachine::next(State::Validated, &run, &retry),
            Transition::Execute(StepName::Submit)
        );

        run.record_submission(SubmissionOutcome {
            success: true,
            resource_id: Some("sr-1".into()),
            ..Default::default()
        });
        assert_eq!(
            StateMachine::next(State::Submitted, &run, &retry),
            Transition::Finish(State::Recorded)
        );
    }

    #[test]
    fn invalid_outcome_repairs_then_aborts_at_ceiling() {
        let retry = RetryConfig { max_retries: 1 };
        let mut run = make_run();
        run.record_validation(ValidationOutcome::invalid(vec!["bad code".into()]));

        assert_eq!(
            StateMachine::next(State::Validated, &run, &retry),
            Transition::Execute(StepName::Repair)
        );

        run.apply_repair(run.candidate_resource.clone().unwrap());
        assert_eq!(
            StateMachine::next(State::Repaired, &run, &retry),
            Transition::Execute(StepName::Validate)
        );
        run.record_validation(ValidationOutcome::invalid(vec!["bad code".into()]));
        assert_eq!(
            StateMachine::next(State::Validated, &run, &retry),
            Transition::Finish(State::Aborted)
        );
    }

    #[test]
    fn zero_retries_aborts_immediately() {
        let retry = RetryConfig { max_retries: 0 };
        let mut run = make_run();
        run.record_validation(ValidationOutcome::invalid(vec!["bad".into()]));
        assert_eq!(
            StateMachine::next(State::Validated, &run, &retry),
            Transition::Finish(State::Aborted)
        );
    }

    #[test]
    fn failed_run_always_aborts() {
        let retry = RetryConfig::default();
        let mut run = make_run();
        run.fail(&StepError::Generation("unparseable".into()));
        for state in [State::Start, State::Generated, State::Validated, State::Submitted] {
            assert_eq!(
                StateMachine::next(state, &run, &retry),
                Transition::Finish(State::Aborted)
            );
        }
    }

    #[test]
    fn terminal_states_stay_put() {
        let retry = RetryConfig::default();
        let run = make_run();
        assert_eq!(
            StateMachine::next(State::Recorded, &run, &retry),
            Transition::Finish(State::Recorded)
        );
        assert!(State::Recorded.is_terminal());
        assert!(State::Aborted.is_terminal());
        assert!(!State::Validated.is_terminal());
    }

    #[test]
    fn advance_follows_transition_table() {
        assert_eq!(
            StateMachine::advance(State::Start, StepName::Generate),
            Some(State::Generated)
        );
        assert_eq!(
            StateMachine::advance(State::Repaired, StepName::Validate),
            Some(State::Validated)
        );
        assert_eq!(
            StateMachine::advance(State::Validated, StepName::Repair),
            Some(State::Repaired)
        );
        assert_eq!(
            StateMachine::advance(State::Validated, StepName::Submit),
            Some(State::Submitted)
        );
        assert_eq!(StateMachine::advance(State::Start, StepName::Submit), None);
        assert_eq!(StateMachine::advance(State::Generated, StepName::Repair), None);
    }

    #[test]
    fn display_names() {
        assert_eq!(State::Start.to_string(), "START");
        assert_eq!(State::Validated.to_string(), "VALIDATED");
        assert_eq!(State::Aborted.to_string(), "ABORTED");
        assert_eq!(StepName::Repair.to_string(), "repair");
    }
}
