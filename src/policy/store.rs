//! Document store for a single session.
//!
//! Owns the policy, resource and params documents together with their parsed
//! forms and the params resolution state. Parsed forms are refreshed on every
//! edit so readers never see text and structure out of sync.

use serde::Serialize;
use thiserror::Error;

use super::document::{DocumentError, DocumentKind, ParamKindRef, ParsedPolicy, parse_resource};
use super::samples::SAMPLE_DEPLOYMENT;

/// Params text handed to the engine when the policy declares no param kind.
pub const ABSENT_PARAMS: &str = "null\n";

/// Identifies one params resolution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ResolutionToken(pub u64);

/// Editable text with the baseline it was loaded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    baseline: String,
    text: String,
    revision: u64,
}

impl Document {
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            baseline: text.clone(),
            text,
            revision: 0,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Number of edits applied since load.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Whether the text differs from what was loaded.
    pub fn is_dirty(&self) -> bool {
        self.text != self.baseline
    }

    /// Replace the text. Returns false when the text is unchanged.
    fn edit(&mut self, text: String) -> bool {
        if self.text == text {
            return false;
        }
        self.text = text;
        self.revision += 1;
        true
    }
}

/// Resolution state of the params document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamsState {
    /// The policy declares no param kind.
    Absent,
    /// A resolution for `reference` is in flight.
    Fetching {
        reference: ParamKindRef,
        token: ResolutionToken,
    },
    /// The params object was fetched and can be edited.
    Resolved {
        reference: ParamKindRef,
        document: Document,
    },
    /// The last resolution for `reference` failed.
    FetchFailed {
        reference: ParamKindRef,
        reason: String,
    },
}

impl ParamsState {
    pub fn name(&self) -> &'static str {
        match self {
            ParamsState::Absent => "absent",
            ParamsState::Fetching { .. } => "fetching",
            ParamsState::Resolved { .. } => "resolved",
            ParamsState::FetchFailed { .. } => "fetchFailed",
        }
    }

    pub fn reference(&self) -> Option<&ParamKindRef> {
        match self {
            ParamsState::Absent => None,
            ParamsState::Fetching { reference, .. }
            | ParamsState::Resolved { reference, .. }
            | ParamsState::FetchFailed { reference, .. } => Some(reference),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("params document cannot be edited while it is {state}")]
    ParamsNotEditable { state: &'static str },
}

/// Texts of all three documents taken at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub policy: String,
    pub resource: String,
    pub params: String,
}

/// Holds the documents of one session.
#[derive(Debug, Clone)]
pub struct DocumentStore {
    policy: Document,
    parsed_policy: Result<ParsedPolicy, DocumentError>,
    resource: Document,
    resource_check: Result<(), DocumentError>,
    params: ParamsState,
}

impl DocumentStore {
    /// Create a store from policy text and an optional resource.
    ///
    /// Without a resource the built-in sample Deployment is used.
    pub fn new(policy: impl Into<String>, resource: Option<String>) -> Self {
        let policy = Document::new(policy);
        let resource = Document::new(resource.unwrap_or_else(|| SAMPLE_DEPLOYMENT.to_string()));
        Self {
            parsed_policy: ParsedPolicy::parse(policy.text()),
            resource_check: parse_resource(resource.text()),
            policy,
            resource,
            params: ParamsState::Absent,
        }
    }

    pub fn policy(&self) -> &Document {
        &self.policy
    }

    pub fn resource(&self) -> &Document {
        &self.resource
    }

    pub fn params(&self) -> &ParamsState {
        &self.params
    }

    /// Structured policy, or why the current text does not parse.
    pub fn parsed_policy(&self) -> Result<&ParsedPolicy, &DocumentError> {
        self.parsed_policy.as_ref()
    }

    /// Whether the current resource text parses.
    pub fn resource_check(&self) -> Result<(), &DocumentError> {
        self.resource_check.as_ref().map(|_| ())
    }

    /// Apply an edit. Returns false when the text is unchanged.
    ///
    /// The params document is only editable once resolved.
    pub fn edit(&mut self, kind: DocumentKind, text: String) -> Result<bool, StoreError> {
        match kind {
            DocumentKind::Policy => {
                if !self.policy.edit(text) {
                    return Ok(false);
                }
                self.parsed_policy = ParsedPolicy::parse(self.policy.text());
                Ok(true)
            }
            DocumentKind::Resource => {
                if !self.resource.edit(text) {
                    return Ok(false);
                }
                self.resource_check = parse_resource(self.resource.text());
                Ok(true)
            }
            DocumentKind::Params => match &mut self.params {
                ParamsState::Resolved { document, .. } => Ok(document.edit(text)),
                other => Err(StoreError::ParamsNotEditable {
                    state: other.name(),
                }),
            },
        }
    }

    /// Start a resolution for `reference`, superseding any earlier one.
    pub fn begin_fetch(&mut self, reference: ParamKindRef, token: ResolutionToken) {
        self.params = ParamsState::Fetching { reference, token };
    }

    /// Record the outcome of a resolution.
    ///
    /// Returns false (and changes nothing) when `token` is not the resolution
    /// currently in flight.
    pub fn complete_fetch(
        &mut self,
        token: ResolutionToken,
        outcome: Result<String, String>,
    ) -> bool {
        let reference = match &self.params {
            ParamsState::Fetching {
                reference,
                token: current,
            } if *current == token => reference.clone(),
            _ => return false,
        };
        self.params = match outcome {
            Ok(text) => ParamsState::Resolved {
                reference,
                document: Document::new(text),
            },
            Err(reason) => ParamsState::FetchFailed { reference, reason },
        };
        true
    }

    /// Drop params once the policy no longer declares a param kind.
    pub fn clear_params(&mut self) {
        self.params = ParamsState::Absent;
    }

    /// Texts to hand to the engine.
    pub fn snapshot(&self) -> Snapshot {
        let params = match &self.params {
            ParamsState::Resolved { document, .. } => document.text().to_string(),
            _ => ABSENT_PARAMS.to_string(),
        };
        Snapshot {
            policy: self.policy.text().to_string(),
            resource: self.resource.text().to_string(),
            params,
        }
    }
}
