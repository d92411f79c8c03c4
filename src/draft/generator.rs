use serde_json::Value;
use tracing::{info, warn};

use super::prompt::generation_prompt;
use super::{CompletionSettings, DraftGenerator, complete_resource, pin_reference};
use crate::anthropic::MessageSender;
use crate::error::StepError;
use crate::gateway::{IdentityKind, IdentityResolver, ResolvedIdentity};
use crate::state_machine::{ExtractedContent, IdentityContext, Resource};

/// Generates a ServiceRequest with an LLM, anchored to identities that exist
/// in the registry at generation time.
pub struct LlmDraftGenerator<S, I> {
    sender: S,
    resolver: I,
    settings: CompletionSettings,
}

impl<S: MessageSender, I: IdentityResolver> LlmDraftGenerator<S, I> {
    pub fn new(sender: S, resolver: I, settings: CompletionSettings) -> Self {
        Self {
            sender,
            resolver,
            settings,
        }
    }

    async fn resolve(&self, kind: IdentityKind) -> Result<ResolvedIdentity, StepError> {
        match self.resolver.resolve(kind).await {
            Ok(Some(identity)) => Ok(identity),
            Ok(None) => Err(StepError::MissingIdentity(kind)),
            Err(err) => {
                warn!(%kind, error = %err, "identity lookup failed");
                Err(StepError::MissingIdentity(kind))
            }
        }
    }
}

impl<S: MessageSender, I: IdentityResolver> DraftGenerator for LlmDraftGenerator<S, I> {
    async fn generate(
        &self,
        content: &ExtractedContent,
        identity: &IdentityContext,
    ) -> Result<Resource, StepError> {
        // Both identities must exist before the model is asked anything.
        let patient = self.resolve(IdentityKind::Patient).await?;
        let practitioner = self.resolve(IdentityKind::Practitioner).await?;
        info!(
            patient = %patient.reference(),
            practitioner = %practitioner.reference(),
            "identities resolved"
        );

        let mut context = identity.clone();
        context.insert("id".into(), Value::String(patient.id.clone()));
        context.insert("reference".into(), Value::String(patient.reference()));

        let prompt = generation_prompt(
            &content.text_content,
            &context,
            &patient.reference(),
            &practitioner.reference(),
        );
        let mut resource = complete_resource(&self.sender, &self.settings, prompt).await?;

        pin_reference(&mut resource, "subject", patient.reference());
        pin_reference(&mut resource, "requester", practitioner.reference());
        Ok(resource)
    }
}
