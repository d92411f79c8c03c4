//! Everything that happens before a run exists: extracting the document text
//! and looking the patient up in the EMPI.

use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Client;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::state_machine::{ExtractedContent, IdentityContext};

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("document not found: {}", .0.display())]
    DocumentNotFound(PathBuf),

    #[error("could not read document: {0}")]
    Io(#[from] std::io::Error),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The service answered, but not with a usable result.
    #[error("{0}")]
    Service(String),
}

#[derive(Debug, Deserialize)]
struct ExtractionResponse {
    success: bool,
    #[serde(default)]
    data: Option<ExtractedContent>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PatientResponse {
    success: bool,
    #[serde(default)]
    patient: Option<IdentityContext>,
    #[serde(default)]
    error: Option<String>,
}

fn build_client(timeout: Duration) -> Result<Client, IntakeError> {
    Ok(Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(timeout)
        .build()?)
}

async fn service_error(response: reqwest::Response) -> IntakeError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    IntakeError::Service(format!("HTTP {status}: {body}"))
}

/// Client for the text-extraction service (`POST /extract`).
#[derive(Clone)]
pub struct DocumentExtractor {
    client: Client,
    base_url: String,
}

impl DocumentExtractor {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, IntakeError> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Upload the document and return its extracted text.
    pub async fn extract(&self, path: &Path) -> Result<ExtractedContent, IntakeError> {
        if !path.is_file() {
            return Err(IntakeError::DocumentNotFound(path.to_path_buf()));
        }
        let bytes = tokio::fs::read(path).await?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document.pdf".to_string());
        info!(document = %path.display(), size = bytes.len(), "extracting document text");

        let part = Part::bytes(bytes)
            .file_name(filename)
            .mime_str("application/pdf")?;
        let response = self
            .client
            .post(format!("{}/extract", self.base_url))
            .multipart(Form::new().part("file", part))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(service_error(response).await);
        }

        let body: ExtractionResponse = response
            .json()
            .await
            .map_err(|e| IntakeError::Service(format!("invalid extraction response: {e}")))?;
        match body {
            ExtractionResponse {
                success: true,
                data: Some(content),
                ..
            } => {
                debug!(chars = content.text_content.len(), "document text extracted");
                Ok(content)
            }
            ExtractionResponse { error, .. } => Err(IntakeError::Service(
                error.unwrap_or_else(|| "extraction service returned no data".to_string()),
            )),
        }
    }
}

/// Client for the enterprise patient index (`GET /patient?email=`).
#[derive(Clone)]
pub struct EmpiClient {
    client: Client,
    base_url: String,
}

impl EmpiClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, IntakeError> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Patient record for `email`, or `None` when the index has no match.
    pub async fn lookup(&self, email: &str) -> Result<Option<IdentityContext>, IntakeError> {
        let response = self
            .client
            .get(format!("{}/patient", self.base_url))
            .query(&[("email", email)])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(service_error(response).await);
        }

        let body: PatientResponse = response
            .json()
            .await
            .map_err(|e| IntakeError::Service(format!("invalid EMPI response: {e}")))?;
        if !body.success {
            return Err(IntakeError::Service(
                body.error.unwrap_or_else(|| "EMPI lookup unsuccessful".to_string()),
            ));
        }
        Ok(body.patient)
    }

    /// Like [`lookup`](Self::lookup), but a failure only costs the run its
    /// identity context.
    pub async fn lookup_or_empty(&self, email: &str) -> IdentityContext {
        match self.lookup(email).await {
            Ok(Some(patient)) => patient,
            Ok(None) => IdentityContext::new(),
            Err(err) => {
                warn!(%email, error = %err, "EMPI lookup failed, continuing without identity context");
                IdentityContext::new()
            }
        }
    }
}
