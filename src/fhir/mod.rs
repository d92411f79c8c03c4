pub mod client;
pub mod error;
pub mod types;

pub use client::{FhirClient, FhirResponse};
pub use error::FhirError;
pub use types::{Bundle, Issue, OperationOutcome};
