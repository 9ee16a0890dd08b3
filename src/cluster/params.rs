//! Param-kind resolution.
//!
//! A policy that declares `spec.paramKind` is evaluated against a concrete
//! object of that kind. The playground picks the first object of the matching
//! collection; there is no binding to say which one a real admission would use.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, instrument};

use super::{ClusterError, ClusterSource};
use crate::policy::ParamKindRef;

/// Errors resolving a params object. All of them block evaluation.
#[derive(Error, Debug)]
pub enum ParamsError {
    #[error("failed to read {target}: {source}")]
    Cluster {
        target: ParamsTarget,
        #[source]
        source: ClusterError,
    },

    #[error("no {target} objects found in the cluster")]
    EmptyCollection { target: ParamsTarget },

    #[error("failed to render params object: {0}")]
    Serialization(String),
}

/// API group, version and collection a param kind lives in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParamsTarget {
    /// API group, empty for the core group.
    pub group: String,
    pub version: String,
    pub kind: String,
    /// Collection name derived from the kind.
    pub plural: String,
}

impl ParamsTarget {
    /// Derive the collection from a param-kind reference.
    ///
    /// The plural is the lower-cased kind with an `s` appended; irregular
    /// plurals are not handled.
    pub fn from_reference(reference: &ParamKindRef) -> Self {
        let (group, version) = match reference.api_version.split_once('/') {
            Some((group, version)) => (group.to_string(), version.to_string()),
            None => (String::new(), reference.api_version.clone()),
        };
        Self {
            group,
            version,
            kind: reference.kind.clone(),
            plural: format!("{}s", reference.kind.to_lowercase()),
        }
    }

    /// `group/version`, or just `version` for the core group.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// REST path of the collection.
    pub fn path(&self) -> String {
        if self.group.is_empty() {
            format!("/api/{}/{}", self.version, self.plural)
        } else {
            format!("/apis/{}/{}/{}", self.group, self.version, self.plural)
        }
    }
}

impl fmt::Display for ParamsTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.plural, self.api_version())
    }
}

/// Fetches params objects through a [`ClusterSource`].
#[derive(Clone)]
pub struct ParamsResolver {
    cluster: Arc<dyn ClusterSource>,
}

impl ParamsResolver {
    pub fn new(cluster: Arc<dyn ClusterSource>) -> Self {
        Self { cluster }
    }

    /// Resolve the params object for a policy.
    ///
    /// Returns `Ok(None)` without touching the cluster when the policy declares
    /// no param kind. Otherwise issues exactly one read and returns the first
    /// object of the collection as YAML.
    #[instrument(skip(self))]
    pub async fn resolve(
        &self,
        reference: Option<&ParamKindRef>,
    ) -> Result<Option<String>, ParamsError> {
        let Some(reference) = reference else {
            return Ok(None);
        };
        let target = ParamsTarget::from_reference(reference);
        debug!(path = %target.path(), "Resolving params object");

        let item = match self.cluster.first_item(&target).await {
            Ok(Some(item)) => item,
            Ok(None) => return Err(ParamsError::EmptyCollection { target }),
            Err(source) => return Err(ParamsError::Cluster { target, source }),
        };

        serde_yaml::to_string(&item)
            .map(Some)
            .map_err(|e| ParamsError::Serialization(e.to_string()))
    }
}
