//! Strips server-managed fields from a policy fetched from the cluster.
//!
//! The result is the editable starting point of a session, so it must be stable
//! across fetches of the same policy: `status`, `metadata.managedFields` and the
//! kubectl last-applied annotation change independently of the rules themselves.

use serde_json::Value;
use thiserror::Error;

/// Annotation written by `kubectl apply` holding the previous manifest.
pub const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// The source object cannot be turned into an editable policy document.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SanitizeError {
    #[error("Malformed source: {0}")]
    MalformedSource(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Return a copy of `object` without server-managed fields.
///
/// Fails with [`SanitizeError::MalformedSource`] when the object has no
/// `metadata` mapping.
pub fn sanitize(object: &Value) -> Result<Value, SanitizeError> {
    let Value::Object(source) = object else {
        return Err(SanitizeError::MalformedSource(
            "policy object is not a mapping".to_string(),
        ));
    };

    let mut cleaned = source.clone();
    cleaned.remove("status");

    let Some(Value::Object(metadata)) = cleaned.get_mut("metadata") else {
        return Err(SanitizeError::MalformedSource(
            "policy object has no metadata".to_string(),
        ));
    };
    metadata.remove("managedFields");
    if let Some(Value::Object(annotations)) = metadata.get_mut("annotations") {
        annotations.remove(LAST_APPLIED_ANNOTATION);
    }

    Ok(Value::Object(cleaned))
}

/// Sanitize and render as the YAML text of a policy document.
pub fn sanitize_to_yaml(object: &Value) -> Result<String, SanitizeError> {
    let cleaned = sanitize(object)?;
    serde_yaml::to_string(&cleaned).map_err(|e| SanitizeError::Serialization(e.to_string()))
}
