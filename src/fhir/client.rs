use std::time::Duration;

use reqwest::Client;
use reqwest::header::{ACCEPT, CONTENT_TYPE};

use super::error::FhirError;
use super::types::Bundle;
use crate::state_machine::Resource;

const FHIR_JSON: &str = "application/fhir+json";

/// Raw status and body of a FHIR write or operation call.
#[derive(Debug, Clone)]
pub struct FhirResponse {
    pub status: u16,
    pub body: String,
}

impl FhirResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Thin HTTP client for a FHIR REST endpoint.
///
/// Interpreting responses is left to the callers in [`crate::gateway`].
#[derive(Clone)]
pub struct FhirClient {
    client: Client,
    base_url: String,
}

impl FhirClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, FhirError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `POST [base]/[type]/$validate`.
    pub async fn validate_resource(
        &self,
        resource_type: &str,
        resource: &Resource,
    ) -> Result<FhirResponse, FhirError> {
        let url = format!("{}/{resource_type}/$validate", self.base_url);
        self.post_resource(&url, resource).await
    }

    /// `POST [base]/[type]`, the FHIR create interaction.
    pub async fn create_resource(
        &self,
        resource_type: &str,
        resource: &Resource,
    ) -> Result<FhirResponse, FhirError> {
        let url = format!("{}/{resource_type}", self.base_url);
        self.post_resource(&url, resource).await
    }

    /// Logical id of the first `resource_type` on the server, if there is one.
    pub async fn search_first_id(&self, resource_type: &str) -> Result<Option<String>, FhirError> {
        let url = format!("{}/{resource_type}", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("_count", "1")])
            .header(ACCEPT, FHIR_JSON)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FhirError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bundle = response
            .json::<Bundle>()
            .await
            .map_err(|e| FhirError::InvalidResponse(e.to_string()))?;
        Ok(bundle.first_id())
    }

    async fn post_resource(&self, url: &str, resource: &Resource) -> Result<FhirResponse, FhirError> {
        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, FHIR_JSON)
            .header(ACCEPT, FHIR_JSON)
            .json(resource)
            .send()
            .await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(FhirResponse { status, body })
    }
}
