//! Referral routing: turn a referral document into a FHIR ServiceRequest that
//! the registry accepts, by generating a draft with an LLM and repairing it
//! against the registry's validation errors.
//!
//! The workflow is an explicit state machine ([`state_machine`]) driven by
//! [`orchestrator::WorkflowEngine`]; every step attempt is written to an
//! append-only [`audit`] trail.

pub mod anthropic;
pub mod audit;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod draft;
pub mod error;
pub mod fhir;
pub mod gateway;
pub mod intake;
pub mod logging;
pub mod orchestrator;
pub mod router;
pub mod state_machine;
pub mod ui;
