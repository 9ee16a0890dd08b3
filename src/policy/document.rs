//! Editable documents and their parsed forms.
//!
//! Every document is kept as raw YAML text. The structured form is re-derived
//! from the text on each edit; a document whose text does not parse is invalid
//! and must never reach the evaluation engine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The three documents a session edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Policy,
    Resource,
    Params,
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentKind::Policy => write!(f, "policy"),
            DocumentKind::Resource => write!(f, "resource"),
            DocumentKind::Params => write!(f, "params"),
        }
    }
}

impl FromStr for DocumentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "policy" => Ok(DocumentKind::Policy),
            "resource" => Ok(DocumentKind::Resource),
            "params" => Ok(DocumentKind::Params),
            _ => Err(format!("Unknown document kind: {}", s)),
        }
    }
}

/// Why a document's text could not be turned into its structured form.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocumentError {
    #[error("{kind} document is empty")]
    Empty { kind: DocumentKind },

    #[error("{kind} document is not valid YAML: {message}")]
    Syntax { kind: DocumentKind, message: String },

    #[error("{kind} document must be a mapping")]
    NotAMapping { kind: DocumentKind },

    #[error("{kind} document is missing required field {field}")]
    MissingField {
        kind: DocumentKind,
        field: &'static str,
    },
}

/// Reference to the auxiliary object a policy needs at evaluation time
/// (`spec.paramKind`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParamKindRef {
    pub api_version: String,
    pub kind: String,
}

/// A single validation rule of a policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Validation {
    pub expression: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_expression: Option<String>,
}

/// Structured form of a ValidatingAdmissionPolicy document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedPolicy {
    pub name: String,
    pub validations: Vec<Validation>,
    pub param_kind: Option<ParamKindRef>,
}

#[derive(Deserialize)]
struct RawPolicy {
    metadata: Option<RawMetadata>,
    #[serde(default)]
    spec: RawSpec,
}

#[derive(Deserialize)]
struct RawMetadata {
    name: Option<String>,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSpec {
    #[serde(default)]
    validations: Vec<Validation>,
    param_kind: Option<RawParamKind>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawParamKind {
    api_version: Option<String>,
    kind: Option<String>,
}

impl ParsedPolicy {
    /// Parse policy YAML text.
    pub fn parse(text: &str) -> Result<Self, DocumentError> {
        let value = parse_mapping(DocumentKind::Policy, text)?;
        Self::from_yaml(value)
    }

    /// Build the structured form from an already-decoded cluster object.
    pub fn from_object(object: &serde_json::Value) -> Result<Self, DocumentError> {
        let raw: RawPolicy =
            serde_json::from_value(object.clone()).map_err(|e| DocumentError::Syntax {
                kind: DocumentKind::Policy,
                message: e.to_string(),
            })?;
        Self::from_raw(raw)
    }

    fn from_yaml(value: serde_yaml::Value) -> Result<Self, DocumentError> {
        let raw: RawPolicy = serde_yaml::from_value(value).map_err(|e| DocumentError::Syntax {
            kind: DocumentKind::Policy,
            message: e.to_string(),
        })?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawPolicy) -> Result<Self, DocumentError> {
        let name = raw
            .metadata
            .and_then(|m| m.name)
            .filter(|n| !n.is_empty())
            .ok_or(DocumentError::MissingField {
                kind: DocumentKind::Policy,
                field: "metadata.name",
            })?;

        // A paramKind without an apiVersion declares nothing to fetch
        let param_kind = match raw.spec.param_kind {
            Some(RawParamKind {
                api_version: Some(api_version),
                kind,
            }) if !api_version.is_empty() => {
                let kind = kind
                    .filter(|k| !k.is_empty())
                    .ok_or(DocumentError::MissingField {
                        kind: DocumentKind::Policy,
                        field: "spec.paramKind.kind",
                    })?;
                Some(ParamKindRef { api_version, kind })
            }
            _ => None,
        };

        Ok(Self {
            name,
            validations: raw.spec.validations,
            param_kind,
        })
    }

    /// Human-readable messages of all validations, joined for display.
    pub fn messages(&self) -> String {
        self.validations
            .iter()
            .filter_map(|v| v.message.as_deref())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Check that resource text is a YAML mapping.
pub fn parse_resource(text: &str) -> Result<(), DocumentError> {
    parse_mapping(DocumentKind::Resource, text).map(|_| ())
}

/// Check that params text is valid YAML. `null` is accepted.
pub fn parse_params(text: &str) -> Result<(), DocumentError> {
    serde_yaml::from_str::<serde_yaml::Value>(text)
        .map(|_| ())
        .map_err(|e| DocumentError::Syntax {
            kind: DocumentKind::Params,
            message: e.to_string(),
        })
}

fn parse_mapping(kind: DocumentKind, text: &str) -> Result<serde_yaml::Value, DocumentError> {
    let value: serde_yaml::Value =
        serde_yaml::from_str(text).map_err(|e| DocumentError::Syntax {
            kind,
            message: e.to_string(),
        })?;
    match value {
        serde_yaml::Value::Null => Err(DocumentError::Empty { kind }),
        serde_yaml::Value::Mapping(_) => Ok(value),
        _ => Err(DocumentError::NotAMapping { kind }),
    }
}
