use crate::state_machine::{IdentityContext, Resource};

pub(crate) fn generation_prompt(
    document_text: &str,
    identity: &IdentityContext,
    patient_ref: &str,
    practitioner_ref: &str,
) -> String {
    let identity_json =
        serde_json::to_string_pretty(identity).unwrap_or_else(|_| "{}".to_string());
    format!(
        "You are a healthcare data specialist. Convert the following referral document \
         into a FHIR R5 ServiceRequest resource.\n\
         \n\
         Referral document:\n\
         {document_text}\n\
         \n\
         Patient information (use this patient reference):\n\
         {identity_json}\n\
         \n\
         Create a valid FHIR R5 ServiceRequest JSON object. Include:\n\
         - resourceType: \"ServiceRequest\"\n\
         - status: \"active\" or \"draft\"\n\
         - intent: \"order\"\n\
         - subject: reference to the patient (use \"{patient_ref}\")\n\
         - code: SNOMED CT code for the requested service\n\
         - priority: \"routine\", \"urgent\" or \"asap\"\n\
         - reason: SNOMED CT code for the reason\n\
         - requester: reference to the requesting practitioner (use \"{practitioner_ref}\")\n\
         \n\
         Do not include an encounter reference unless the referral names a valid encounter id.\n\
         \n\
         Return ONLY the JSON object, no additional text."
    )
}

pub(crate) fn repair_prompt(resource: &Resource, errors: &[String]) -> String {
    let resource_json =
        serde_json::to_string_pretty(resource).unwrap_or_else(|_| "{}".to_string());
    let error_text = errors.join("\n");
    format!(
        "The following FHIR ServiceRequest has validation errors. Fix them and return \
         a corrected JSON object.\n\
         \n\
         Original JSON:\n\
         {resource_json}\n\
         \n\
         Validation errors:\n\
         {error_text}\n\
         \n\
         Return ONLY the corrected JSON object, no additional text."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn generation_prompt_embeds_references() {
        let mut identity = IdentityContext::new();
        identity.insert("name".into(), json!("John Doe"));
        let prompt = generation_prompt("Refer to cardiology", &identity, "Patient/p1", "Practitioner/d1");
        assert!(prompt.contains("Refer to cardiology"));
        assert!(prompt.contains("John Doe"));
        assert!(prompt.contains("\"Patient/p1\""));
        assert!(prompt.contains("\"Practitioner/d1\""));
    }

    #[test]
    fn repair_prompt_lists_errors_one_per_line() {
        let resource = json!({"resourceType": "ServiceRequest"}).as_object().cloned().unwrap();
        let prompt = repair_prompt(&resource, &["missing intent".into(), "missing subject".into()]);
        assert!(prompt.contains("missing intent\nmissing subject"));
        assert!(prompt.contains("\"resourceType\": \"ServiceRequest\""));
    }
}
