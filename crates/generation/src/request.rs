use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use genledger_core::{DomainError, DomainResult};

/// Parameters of a generation request, kept on the job and echoed back by the
/// worker's completion event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    /// Upper bound on generated tokens; part of the reservation estimate.
    pub max_output_tokens: u64,
    /// Caller-supplied dedup key, unique per owner.
    pub client_request_id: Option<String>,
    /// Free-form model parameters (temperature, template, source documents...).
    pub parameters: JsonValue,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, max_output_tokens: u64) -> Self {
        Self {
            prompt: prompt.into(),
            max_output_tokens,
            client_request_id: None,
            parameters: JsonValue::Null,
        }
    }

    pub fn with_client_request_id(mut self, id: impl Into<String>) -> Self {
        self.client_request_id = Some(id.into());
        self
    }

    pub fn with_parameters(mut self, parameters: JsonValue) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.prompt.trim().is_empty() {
            return Err(DomainError::validation("prompt must not be empty"));
        }
        if matches!(&self.client_request_id, Some(id) if id.trim().is_empty()) {
            return Err(DomainError::validation("client request id must not be blank"));
        }
        Ok(())
    }
}

/// Output produced by the generator for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedContent {
    pub text: String,
    pub metadata: JsonValue,
}

impl GeneratedContent {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: JsonValue::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = metadata;
        self
    }
}
