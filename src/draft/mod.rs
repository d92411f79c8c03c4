//! Turning referral text into candidate resources, and fixing candidates
//! the registry rejected.

mod generator;
mod prompt;
mod repairer;

pub use generator::LlmDraftGenerator;
pub use repairer::LlmDraftRepairer;

use std::time::Duration;

use serde_json::{Value, json};
use tokio::time::sleep;
use tracing::warn;

use crate::anthropic::{AnthropicError, Message, MessageSender, MessagesRequest};
use crate::error::StepError;
use crate::state_machine::{ExtractedContent, IdentityContext, Resource};

/// Produces a first candidate resource for a run.
pub trait DraftGenerator {
    async fn generate(
        &self,
        content: &ExtractedContent,
        identity: &IdentityContext,
    ) -> Result<Resource, StepError>;
}

/// Produces a corrected candidate from validation errors.
pub trait DraftRepairer {
    async fn repair(&self, resource: &Resource, errors: &[String]) -> Result<Resource, StepError>;
}

/// Model parameters shared by the generator and the repairer.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionSettings {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for CompletionSettings {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-5-20250929".to_string(),
            max_tokens: 4096,
            temperature: 0.1,
        }
    }
}

/// Rate-limited completions are retried this many times before giving up.
const RATE_LIMIT_RETRIES: u32 = 3;
/// Upper bound on a single `retry-after` wait.
const MAX_RATE_LIMIT_WAIT_MS: u64 = 30_000;

/// Send one user prompt and parse the reply as a resource.
///
/// HTTP 429 is waited out (honouring `retry-after`, capped) a bounded number
/// of times. Every other failure is returned on the first attempt.
async fn complete_resource(
    sender: &impl MessageSender,
    settings: &CompletionSettings,
    prompt: String,
) -> Result<Resource, StepError> {
    let req = MessagesRequest {
        model: settings.model.clone(),
        max_tokens: settings.max_tokens,
        temperature: Some(settings.temperature),
        messages: vec![Message::user(prompt)],
    };

    let mut attempt = 0;
    let response = loop {
        match sender.send_message(&req).await {
            Ok(response) => break response,
            Err(AnthropicError::RateLimited { retry_after_ms }) if attempt < RATE_LIMIT_RETRIES => {
                attempt += 1;
                let delay_ms = retry_after_ms.min(MAX_RATE_LIMIT_WAIT_MS);
                warn!(attempt, max = RATE_LIMIT_RETRIES, delay_ms, "completion rate limited, waiting");
                sleep(Duration::from_millis(delay_ms)).await;
            }
            Err(err) => return Err(completion_error(err)),
        }
    };
    parse_resource(&response.text())
}

/// Point `field` at `reference`, whatever the model wrote there.
fn pin_reference(resource: &mut Resource, field: &str, reference: String) {
    match resource.get_mut(field).and_then(Value::as_object_mut) {
        Some(existing) => {
            existing.insert("reference".into(), Value::String(reference));
        }
        None => {
            resource.insert(field.into(), json!({ "reference": reference }));
        }
    }
}

fn completion_error(err: AnthropicError) -> StepError {
    StepError::Generation(format!("completion request failed: {err}"))
}

/// Parse model output as a JSON object.
///
/// The whole reply is tried first, then the contents of the first fenced
/// block (```` ```json ```` or a bare ```` ``` ````).
pub fn parse_resource(text: &str) -> Result<Resource, StepError> {
    let trimmed = text.trim();
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(trimmed) {
        return Ok(map);
    }

    let Some(block) = fenced_block(trimmed) else {
        return Err(StepError::Generation(
            "could not parse JSON from model response".to_string(),
        ));
    };

    match serde_json::from_str::<Value>(block) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(StepError::Generation(
            "fenced block does not contain a JSON object".to_string(),
        )),
        Err(e) => Err(StepError::Generation(format!(
            "could not parse JSON from fenced block: {e}"
        ))),
    }
}

fn fenced_block(text: &str) -> Option<&str> {
    let (start, fence_len) = match text.find("```json") {
        Some(i) => (i, "```json".len()),
        None => (text.find("```")?, "```".len()),
    };
    let body = &text[start + fence_len..];
    let end = body.find("```").unwrap_or(body.len());
    Some(body[..end].trim())
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::VecDeque;

    use parking_lot::Mutex;

    use crate::anthropic::types::{ContentBlock, Usage};
    use crate::anthropic::{AnthropicError, MessageSender, MessagesRequest, MessagesResponse};

    /// Replays canned replies and remembers every prompt it was sent.
    pub struct ScriptedSender {
        replies: Mutex<VecDeque<Result<String, AnthropicError>>>,
        pub prompts: Mutex<Vec<String>>,
    }

    impl ScriptedSender {
        pub fn new(replies: Vec<Result<String, AnthropicError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                prompts: Mutex::new(Vec::new()),
            }
        }

        pub fn ok(text: &str) -> Self {
            Self::new(vec![Ok(text.to_string())])
        }

        pub fn calls(&self) -> usize {
            self.prompts.lock().len()
        }
    }

    impl MessageSender for ScriptedSender {
        async fn send_message(
            &self,
            req: &MessagesRequest,
        ) -> Result<MessagesResponse, AnthropicError> {
            self.prompts.lock().push(
                req.messages
                    .first()
                    .map(|m| m.content.clone())
                    .unwrap_or_default(),
            );
            let reply = self
                .replies
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(AnthropicError::InvalidResponse("no scripted reply".into())));
            reply.map(|text| MessagesResponse {
                id: "mock".into(),
                content: vec![ContentBlock {
                    content_type: "text".into(),
                    text,
                }],
                model: "mock".into(),
                stop_reason: Some("end_turn".into()),
                usage: Usage {
                    input_tokens: 0,
                    output_tokens: 0,
                },
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::ScriptedSender;
    use super::*;

    fn rate_limited() -> Result<String, AnthropicError> {
        Err(AnthropicError::RateLimited { retry_after_ms: 0 })
    }

    #[tokio::test]
    async fn rate_limit_is_waited_out() {
        let sender = ScriptedSender::new(vec![
            rate_limited(),
            rate_limited(),
            Ok(r#"{"resourceType": "ServiceRequest"}"#.to_string()),
        ]);

        let resource = complete_resource(&sender, &CompletionSettings::default(), "draft".into())
            .await
            .unwrap();

        assert_eq!(resource["resourceType"], "ServiceRequest");
        assert_eq!(sender.calls(), 3);
    }

    #[tokio::test]
    async fn rate_limit_gives_up_after_bounded_retries() {
        let replies = (0..=RATE_LIMIT_RETRIES).map(|_| rate_limited()).collect();
        let sender = ScriptedSender::new(replies);

        let err = complete_resource(&sender, &CompletionSettings::default(), "draft".into())
            .await
            .unwrap_err();

        assert!(matches!(err, StepError::Generation(ref m) if m.contains("rate limited")));
        assert_eq!(sender.calls(), RATE_LIMIT_RETRIES as usize + 1);
    }

    #[tokio::test]
    async fn other_completion_errors_are_not_retried() {
        let sender = ScriptedSender::new(vec![Err(AnthropicError::Timeout)]);

        let err = complete_resource(&sender, &CompletionSettings::default(), "draft".into())
            .await
            .unwrap_err();

        assert!(matches!(err, StepError::Generation(_)));
        assert_eq!(sender.calls(), 1);
    }

    #[tokio::test]
    async fn http_429_then_success_through_the_client() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        use crate::anthropic::AnthropicClient;

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "msg_2",
                "content": [{"type": "text", "text": "{\"resourceType\": \"ServiceRequest\"}"}],
                "model": "claude-sonnet-4-5-20250929",
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 3, "output_tokens": 5}
            })))
            .mount(&server)
            .await;

        let client = AnthropicClient::with_base_url(
            "sk-test".into(),
            format!("{}/v1/messages", server.uri()),
            Duration::from_secs(5),
        )
        .unwrap();

        let resource = complete_resource(&client, &CompletionSettings::default(), "draft".into())
            .await
            .unwrap();

        assert_eq!(resource["resourceType"], "ServiceRequest");
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[test]
    fn parses_bare_json() {
        let resource = parse_resource(r#"  {"resourceType": "ServiceRequest"}  "#).unwrap();
        assert_eq!(resource["resourceType"], "ServiceRequest");
    }

    #[test]
    fn falls_back_to_json_fence() {
        let text = "Here is the resource:\n```json\n{\"resourceType\": \"ServiceRequest\", \"intent\": \"order\"}\n```\nLet me know.";
        let resource = parse_resource(text).unwrap();
        assert_eq!(resource["intent"], "order");
    }

    #[test]
    fn falls_back_to_bare_fence() {
        let text = "```\n{\"status\": \"active\"}\n```";
        let resource = parse_resource(text).unwrap();
        assert_eq!(resource["status"], "active");
    }

    #[test]
    fn prose_is_a_generation_error() {
        let err = parse_resource("I cannot help with that.").unwrap_err();
        assert!(matches!(err, StepError::Generation(_)));
    }

    #[test]
    fn broken_fence_is_a_generation_error() {
        let err = parse_resource("```json\n{\"status\": \n```").unwrap_err();
        assert!(matches!(err, StepError::Generation(ref m) if m.contains("fenced block")));
    }

    #[test]
    fn non_object_json_is_rejected() {
        assert!(parse_resource("[1, 2, 3]").is_err());
        assert!(parse_resource("```json\n\"text\"\n```").is_err());
    }
}
