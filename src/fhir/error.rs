use thiserror::Error;

/// Failures talking to the FHIR server.
#[derive(Debug, Error)]
pub enum FhirError {
    #[error("FHIR request timed out")]
    Timeout,

    #[error("FHIR server unreachable: {0}")]
    Network(reqwest::Error),

    #[error("FHIR server returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unexpected FHIR response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for FhirError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FhirError::Timeout
        } else {
            FhirError::Network(err)
        }
    }
}
