mod run;
mod state;

pub use run::{
    ExtractedContent, IdentityContext, Resource, RetryConfig, RunFailure, RunId, RunResult,
    RunState, SubmissionOutcome, ValidationOutcome,
};
pub use state::{State, StateMachine, StepName, Transition};
