//! The slice of FHIR R5 wire types the router reads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `OperationOutcome` returned by `$validate` and by rejected writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationOutcome {
    #[serde(rename = "resourceType")]
    pub resource_type: String,
    #[serde(default)]
    pub issue: Vec<Issue>,
}

impl OperationOutcome {
    /// Parse `body` as an OperationOutcome, or `None` when it is some other
    /// payload (or not JSON at all).
    pub fn parse(body: &str) -> Option<Self> {
        serde_json::from_str::<OperationOutcome>(body)
            .ok()
            .filter(|o| o.resource_type == "OperationOutcome")
    }

    /// Messages of the issues that make a resource invalid.
    pub fn blocking_messages(&self) -> Vec<String> {
        self.issue
            .iter()
            .filter(|i| i.is_blocking())
            .map(Issue::message)
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub severity: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub diagnostics: Option<String>,
    #[serde(default)]
    pub details: Option<CodeableText>,
}

impl Issue {
    /// Only `error` and `fatal` fail validation; `warning` and
    /// `information` are advisory.
    pub fn is_blocking(&self) -> bool {
        matches!(self.severity.as_str(), "error" | "fatal")
    }

    pub fn message(&self) -> String {
        self.diagnostics
            .clone()
            .or_else(|| self.details.as_ref().and_then(|d| d.text.clone()))
            .unwrap_or_else(|| "Unknown error".to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeableText {
    #[serde(default)]
    pub text: Option<String>,
}

/// Search result `Bundle`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Bundle {
    #[serde(default)]
    pub entry: Vec<BundleEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleEntry {
    #[serde(default)]
    pub resource: Value,
}

impl Bundle {
    /// Logical id of the first entry, if any.
    pub fn first_id(&self) -> Option<String> {
        self.entry
            .first()
            .and_then(|e| e.resource.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocking_messages_skip_warnings() {
        let body = r#"{
            "resourceType": "OperationOutcome",
            "issue": [
                {"severity": "warning", "diagnostics": "narrative missing"},
                {"severity": "error", "diagnostics": "ServiceRequest.intent: minimum required = 1"},
                {"severity": "fatal", "details": {"text": "unparseable reference"}},
                {"severity": "error"}
            ]
        }"#;
        let outcome = OperationOutcome::parse(body).unwrap();
        assert_eq!(
            outcome.blocking_messages(),
            vec![
                "ServiceRequest.intent: minimum required = 1".to_string(),
                "unparseable reference".to_string(),
                "Unknown error".to_string(),
            ]
        );
    }

    #[test]
    fn parse_rejects_other_payloads() {
        assert!(OperationOutcome::parse("<html>bad gateway</html>").is_none());
        assert!(OperationOutcome::parse(r#"{"resourceType": "ServiceRequest"}"#).is_none());
    }

    #[test]
    fn bundle_first_id() {
        let bundle: Bundle = serde_json::from_str(
            r#"{"resourceType": "Bundle", "entry": [{"resource": {"resourceType": "Patient", "id": "p-7"}}]}"#,
        )
        .unwrap();
        assert_eq!(bundle.first_id().as_deref(), Some("p-7"));

        let empty: Bundle = serde_json::from_str(r#"{"resourceType": "Bundle", "total": 0}"#).unwrap();
        assert_eq!(empty.first_id(), None);
    }
}
