//! Read-only access to the cluster.
//!
//! The playground only ever reads: a single policy, the list of policies, and
//! the first object of a params collection. `ClusterSource` is the seam between
//! the orchestration logic and the Kubernetes API so tests can substitute a
//! canned cluster.
//!
//! - `kube_source`: production implementation over `kube::Api<DynamicObject>`
//! - `params`: param-kind resolution

pub mod kube_source;
pub mod params;

pub use kube_source::KubeClusterSource;
pub use params::{ParamsError, ParamsResolver, ParamsTarget};

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use tabled::Tabled;
use thiserror::Error;

/// Label carrying the compliance control a policy implements.
pub const CONTROL_LABEL: &str = "controlId";

/// Errors from cluster reads.
#[derive(Error, Debug)]
pub enum ClusterError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Object could not be converted to JSON
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ClusterError {
    /// Check if this error indicates a not-found condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::Kube(kube::Error::Api(e)) if e.code == 404)
    }
}

/// Read operations the playground needs from the cluster.
pub trait ClusterSource: Send + Sync {
    /// Fetch a single ValidatingAdmissionPolicy by name.
    fn get_policy<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Value, ClusterError>>;

    /// List all ValidatingAdmissionPolicies.
    fn list_policies(&self) -> BoxFuture<'_, Result<Vec<Value>, ClusterError>>;

    /// Fetch the first object of a collection, if the collection has any.
    fn first_item<'a>(
        &'a self,
        target: &'a ParamsTarget,
    ) -> BoxFuture<'a, Result<Option<Value>, ClusterError>>;
}

/// One row of the policy list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Tabled)]
pub struct PolicySummary {
    #[tabled(rename = "NAME")]
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[tabled(rename = "CONTROL", display_with = "display_control")]
    pub control: Option<String>,
}

fn display_control(control: &Option<String>) -> String {
    control.as_deref().unwrap_or("-").to_string()
}

impl PolicySummary {
    /// Summarize a policy object. Objects without a name are skipped.
    pub fn from_object(object: &Value) -> Option<Self> {
        let metadata = object.get("metadata")?;
        let name = metadata.get("name")?.as_str()?.to_string();
        let control = metadata
            .get("labels")
            .and_then(|labels| labels.get(CONTROL_LABEL))
            .and_then(Value::as_str)
            .map(str::to_string);
        Some(Self { name, control })
    }
}
