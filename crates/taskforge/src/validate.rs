//! JSON-Schema payload validation
//!
//! Handlers may register a schema for their payloads; submissions are
//! checked before persistence so malformed work never reaches a worker.

use jsonschema::Validator;
use serde_json::Value;

/// Error type for payload validation
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    /// The schema document itself is invalid
    #[error("invalid payload schema: {0}")]
    InvalidSchema(String),

    /// The payload violates the registered schema
    #[error("invalid task payload: {0}")]
    InvalidPayload(String),
}

/// A compiled payload schema
///
/// Compilation validates the schema document; [`check`](Self::check)
/// validates payloads against it.
pub struct PayloadSchema {
    document: Value,
    validator: Validator,
}

impl PayloadSchema {
    /// Compile a JSON-Schema document.
    pub fn compile(document: Value) -> Result<Self, ValidationError> {
        let validator =
            Validator::new(&document).map_err(|e| ValidationError::InvalidSchema(e.to_string()))?;
        Ok(Self {
            document,
            validator,
        })
    }

    /// Validate a payload, reporting the first violation.
    pub fn check(&self, payload: &Value) -> Result<(), ValidationError> {
        self.validator
            .validate(payload)
            .map_err(|e| ValidationError::InvalidPayload(e.to_string()))
    }

    /// The schema document as registered.
    pub fn document(&self) -> &Value {
        &self.document
    }
}

impl std::fmt::Debug for PayloadSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadSchema")
            .field("document", &self.document)
            .finish()
    }
}
