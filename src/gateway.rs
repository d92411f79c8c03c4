//! Registry-facing capabilities used by the workflow: resource validation,
//! submission and identity resolution.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::StepError;
use crate::fhir::{FhirClient, FhirError, FhirResponse, OperationOutcome};
use crate::state_machine::{Resource, SubmissionOutcome, ValidationOutcome};

const SERVICE_REQUEST: &str = "ServiceRequest";

/// Validates and submits candidate resources against a registry.
pub trait ResourceGateway {
    /// Judge a candidate. Transport problems come back as an invalid outcome
    /// with one synthetic error and `transport_error` set, not as `Err`.
    async fn validate(&self, resource: &Resource) -> Result<ValidationOutcome, StepError>;

    /// Create the resource in the registry. Not idempotent.
    async fn submit(&self, resource: &Resource) -> Result<SubmissionOutcome, StepError>;
}

/// The kinds of identity a generated order must reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdentityKind {
    Patient,
    Practitioner,
}

impl IdentityKind {
    pub fn resource_type(self) -> &'static str {
        match self {
            IdentityKind::Patient => "Patient",
            IdentityKind::Practitioner => "Practitioner",
        }
    }
}

impl fmt::Display for IdentityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.resource_type())
    }
}

/// An identity that exists in the registry right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    pub kind: IdentityKind,
    pub id: String,
}

impl ResolvedIdentity {
    /// Relative reference such as `Patient/123`.
    pub fn reference(&self) -> String {
        format!("{}/{}", self.kind.resource_type(), self.id)
    }
}

/// Live lookup of identities in the registry. Zero or one match.
pub trait IdentityResolver {
    async fn resolve(&self, kind: IdentityKind) -> Result<Option<ResolvedIdentity>, FhirError>;
}

impl ResourceGateway for FhirClient {
    async fn validate(&self, resource: &Resource) -> Result<ValidationOutcome, StepError> {
        let resource_type = resource.get("resourceType").and_then(Value::as_str);
        if resource_type != Some(SERVICE_REQUEST) {
            return Ok(ValidationOutcome::invalid(vec![
                "Only ServiceRequest resources supported".to_string(),
            ]));
        }

        match self.validate_resource(SERVICE_REQUEST, resource).await {
            Ok(response) => Ok(validation_from_response(&response)),
            Err(err) => {
                warn!(error = %err, "validation endpoint unreachable");
                Ok(transport_failure(err.to_string()))
            }
        }
    }

    async fn submit(&self, resource: &Resource) -> Result<SubmissionOutcome, StepError> {
        match self.create_resource(SERVICE_REQUEST, resource).await {
            Ok(response) => Ok(submission_from_response(response)),
            Err(err) => {
                warn!(error = %err, "submission endpoint unreachable");
                Ok(SubmissionOutcome::failed(err.to_string()))
            }
        }
    }
}

impl IdentityResolver for FhirClient {
    async fn resolve(&self, kind: IdentityKind) -> Result<Option<ResolvedIdentity>, FhirError> {
        let id = self.search_first_id(kind.resource_type()).await?;
        debug!(%kind, ?id, "identity lookup");
        Ok(id.map(|id| ResolvedIdentity { kind, id }))
    }
}

/// Map a `$validate` response to an outcome.
///
/// An OperationOutcome body is authoritative whatever the status (HAPI
/// answers 412 with the itemized issues). A 2xx with another body passes.
/// Anything else is a transport failure.
pub fn validation_from_response(response: &FhirResponse) -> ValidationOutcome {
    if let Some(outcome) = OperationOutcome::parse(&response.body) {
        let errors = outcome.blocking_messages();
        if errors.is_empty() {
            return ValidationOutcome::valid();
        }
        return ValidationOutcome::invalid(errors);
    }
    if response.is_success() {
        return ValidationOutcome::valid();
    }
    transport_failure(format!("HTTP {}: {}", response.status, response.body))
}

fn transport_failure(detail: String) -> ValidationOutcome {
    ValidationOutcome::unreachable(detail)
}

fn submission_from_response(response: FhirResponse) -> SubmissionOutcome {
    if matches!(response.status, 200 | 201) {
        let body: Option<Value> = serde_json::from_str(&response.body).ok();
        let resource_id = body
            .as_ref()
            .and_then(|b| b.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string);
        SubmissionOutcome {
            success: true,
            status_code: Some(response.status),
            resource_id,
            raw_response: body,
            error: None,
        }
    } else {
        SubmissionOutcome {
            success: false,
            status_code: Some(response.status),
            resource_id: None,
            raw_response: serde_json::from_str(&response.body).ok(),
            error: Some(response.body),
        }
    }
}
