use serde_json::Value;
use tracing::{debug, warn};

use super::prompt::repair_prompt;
use super::{CompletionSettings, DraftRepairer, complete_resource, pin_reference};
use crate::anthropic::MessageSender;
use crate::error::StepError;
use crate::state_machine::Resource;

/// References the repaired resource must keep from the candidate.
const PINNED_FIELDS: [&str; 2] = ["subject", "requester"];

/// Asks the model to correct a candidate given the registry's errors.
///
/// The model never gets to move an order to another patient or requester:
/// whatever references the candidate carried are written back afterwards.
pub struct LlmDraftRepairer<S> {
    sender: S,
    settings: CompletionSettings,
}

impl<S: MessageSender> LlmDraftRepairer<S> {
    pub fn new(sender: S, settings: CompletionSettings) -> Self {
        Self { sender, settings }
    }
}

impl<S: MessageSender> DraftRepairer for LlmDraftRepairer<S> {
    async fn repair(&self, resource: &Resource, errors: &[String]) -> Result<Resource, StepError> {
        if errors.is_empty() {
            debug!("repair requested without errors, returning candidate unchanged");
            return Ok(resource.clone());
        }
        let prompt = repair_prompt(resource, errors);
        let mut repaired = complete_resource(&self.sender, &self.settings, prompt).await?;
        for field in PINNED_FIELDS {
            let Some(reference) = reference_of(resource, field) else {
                continue;
            };
            if reference_of(&repaired, field) != Some(reference) {
                warn!(field, reference, "repair changed a pinned reference, restoring it");
            }
            pin_reference(&mut repaired, field, reference.to_string());
        }
        Ok(repaired)
    }
}

fn reference_of<'a>(resource: &'a Resource, field: &str) -> Option<&'a str> {
    resource.get(field)?.get("reference").and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::draft::test_support::ScriptedSender;

    fn candidate() -> Resource {
        json!({"resourceType": "ServiceRequest", "status": "active"})
            .as_object()
            .cloned()
            .unwrap()
    }

    #[tokio::test]
    async fn empty_errors_is_a_no_op() {
        let repairer = LlmDraftRepairer::new(ScriptedSender::ok("{}"), CompletionSettings::default());
        let repaired = repairer.repair(&candidate(), &[]).await.unwrap();
        assert_eq!(repaired, candidate());
        assert_eq!(repairer.sender.calls(), 0);
    }

    #[tokio::test]
    async fn returns_corrected_resource() {
        let repairer = LlmDraftRepairer::new(
            ScriptedSender::ok(
                "```json\n{\"resourceType\": \"ServiceRequest\", \"status\": \"active\", \"intent\": \"order\"}\n```",
            ),
            CompletionSettings::default(),
        );
        let repaired = repairer
            .repair(&candidate(), &["ServiceRequest.intent: minimum required = 1".into()])
            .await
            .unwrap();
        assert_eq!(repaired["intent"], "order");

        let prompts = repairer.sender.prompts.lock();
        assert!(prompts[0].contains("ServiceRequest.intent: minimum required = 1"));
    }

    #[tokio::test]
    async fn repair_keeps_subject_and_requester() {
        let mut pinned = candidate();
        pinned.insert("subject".into(), json!({"reference": "Patient/p-1"}));
        pinned.insert("requester".into(), json!({"reference": "Practitioner/dr-1"}));
        let repairer = LlmDraftRepairer::new(
            ScriptedSender::ok(
                r#"{"resourceType": "ServiceRequest", "status": "active", "intent": "order",
                    "subject": {"reference": "Patient/invented", "display": "Jane"}}"#,
            ),
            CompletionSettings::default(),
        );

        let repaired = repairer
            .repair(&pinned, &["ServiceRequest.intent: minimum required = 1".into()])
            .await
            .unwrap();

        assert_eq!(repaired["intent"], "order");
        assert_eq!(repaired["subject"]["reference"], "Patient/p-1");
        assert_eq!(repaired["subject"]["display"], "Jane");
        assert_eq!(repaired["requester"]["reference"], "Practitioner/dr-1");
    }

    #[tokio::test]
    async fn unpinned_candidate_is_left_to_the_model() {
        let repairer = LlmDraftRepairer::new(
            ScriptedSender::ok(r#"{"resourceType": "ServiceRequest", "intent": "order"}"#),
            CompletionSettings::default(),
        );
        let repaired = repairer.repair(&candidate(), &["bad".into()]).await.unwrap();
        assert!(repaired.get("subject").is_none());
        assert!(repaired.get("requester").is_none());
    }

    #[tokio::test]
    async fn unparseable_reply_is_generation_error() {
        let repairer = LlmDraftRepairer::new(
            ScriptedSender::ok("I fixed it for you."),
            CompletionSettings::default(),
        );
        let err = repairer
            .repair(&candidate(), &["bad".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Generation(_)));
    }
}
