//! Interpretation of engine output.
//!
//! The evaluator answers with a JSON document describing the outcome of every
//! variable, match condition, validation and audit annotation. It is shown to
//! the user re-rendered as YAML, unknown fields included. Output that is not
//! JSON is kept verbatim.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of one named expression.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
}

/// Structured engine output.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<EvalEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_conditions: Vec<EvalEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validations: Vec<EvalEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audit_annotations: Vec<EvalEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_checking: Option<Value>,
}

impl EvaluationResults {
    /// Whether every validation evaluated to `true`.
    ///
    /// `None` when there is nothing to judge: no validations, or a validation
    /// that errored or produced a non-boolean.
    pub fn allowed(&self) -> Option<bool> {
        if self.validations.is_empty() {
            return None;
        }
        let mut allowed = true;
        for entry in &self.validations {
            if entry.error.is_some() {
                return None;
            }
            match entry.result.as_ref().and_then(Value::as_bool) {
                Some(passed) => allowed &= passed,
                None => return None,
            }
        }
        Some(allowed)
    }
}

/// A successful engine answer, ready for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    /// Output exactly as the engine returned it.
    pub raw: String,
    /// Display form: YAML when the output was structured, else `raw`.
    pub rendered: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<EvaluationResults>,
}

impl Verdict {
    /// Interpret engine output.
    ///
    /// A top-level `error` in structured output is an engine error and is
    /// returned as `Err` with its message.
    pub fn interpret(output: &str) -> Result<Self, String> {
        let Ok(value) = serde_json::from_str::<Value>(output) else {
            return Ok(Self::verbatim(output));
        };
        if let Some(error) = value
            .as_object()
            .and_then(|object| object.get("error"))
            .and_then(Value::as_str)
            .filter(|e| !e.is_empty())
        {
            return Err(error.to_string());
        }
        let results = value
            .is_object()
            .then(|| serde_json::from_value::<EvaluationResults>(value.clone()).ok())
            .flatten();
        let rendered = match serde_yaml::to_string(&value) {
            Ok(yaml) => yaml,
            Err(_) => output.to_string(),
        };
        Ok(Self {
            raw: output.to_string(),
            rendered,
            results,
        })
    }

    fn verbatim(output: &str) -> Self {
        Self {
            raw: output.to_string(),
            rendered: output.to_string(),
            results: None,
        }
    }

    pub fn allowed(&self) -> Option<bool> {
        self.results.as_ref().and_then(EvaluationResults::allowed)
    }
}
