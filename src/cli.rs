//! One-shot command line operations.
//!
//! `eval` drives the same session machinery the HTTP API uses and waits for
//! the session to settle.

use std::path::Path;

use tabled::Table;
use tabled::settings::Style;
use tracing::{info, warn};

use crate::cluster::{ClusterSource, PolicySummary};
use crate::error::Result;
use crate::orchestrator::{SessionContext, SessionView, open_policy_session};
use crate::policy::DocumentKind;

/// Policies in the cluster, sorted by name.
pub async fn list_policies(cluster: &dyn ClusterSource) -> Result<Vec<PolicySummary>> {
    let mut summaries: Vec<_> = cluster
        .list_policies()
        .await?
        .iter()
        .filter_map(PolicySummary::from_object)
        .collect();
    summaries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(summaries)
}

/// Render the policy list as a borderless table.
pub fn format_policy_table(policies: &[PolicySummary]) -> String {
    let mut table = Table::new(policies);
    table.with(Style::blank());
    format!("{table}\n")
}

/// Evaluate a cluster policy once.
///
/// `params` replaces the resolved params object; it only applies when the
/// policy declares a param kind and resolution succeeded.
pub async fn evaluate_once(
    ctx: &SessionContext,
    cluster: &dyn ClusterSource,
    policy: &str,
    resource: Option<String>,
    params: Option<String>,
) -> Result<SessionView> {
    let session = open_policy_session(ctx, cluster, policy, resource).await?;
    let mut view = session.wait_quiescent().await?;

    if let Some(params) = params {
        if view.params.document.is_some() {
            info!("Replacing resolved params object");
            session.edit(DocumentKind::Params, params).await?;
            view = session.wait_quiescent().await?;
        } else {
            warn!(state = view.params.state, "Params override ignored");
        }
    }
    Ok(view)
}

/// Read a document from disk.
pub async fn read_document(path: &Path) -> Result<String> {
    Ok(tokio::fs::read_to_string(path).await?)
}
