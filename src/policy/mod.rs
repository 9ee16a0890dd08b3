//! Policy, resource and params documents.
//!
//! - `document`: parsed forms and parse errors
//! - `sanitizer`: cleanup of policies fetched from the cluster
//! - `store`: per-session document store
//! - `samples`: built-in sample resource

pub mod document;
pub mod samples;
pub mod sanitizer;
pub mod store;

pub use document::{
    DocumentError, DocumentKind, ParamKindRef, ParsedPolicy, Validation, parse_params,
    parse_resource,
};
pub use samples::SAMPLE_DEPLOYMENT;
pub use sanitizer::{LAST_APPLIED_ANNOTATION, SanitizeError, sanitize, sanitize_to_yaml};
pub use store::{
    ABSENT_PARAMS, Document, DocumentStore, ParamsState, ResolutionToken, Snapshot, StoreError,
};
