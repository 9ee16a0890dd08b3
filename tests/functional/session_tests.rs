//! End-to-end session scenarios.

use std::sync::Arc;
use std::time::Duration;

use crate::common::{FakeCluster, FakeEngine, PolicyBuilder, echo, session_context};
use vap_playground::engine::{EngineError, EngineState};
use vap_playground::orchestrator::{
    BlockReason, OrchestratorState, ResultOutcome, SessionView, open_policy_session,
};
use vap_playground::policy::{ABSENT_PARAMS, DocumentKind, LAST_APPLIED_ANNOTATION, SAMPLE_DEPLOYMENT};

const EDITED_RESOURCE: &str = "apiVersion: v1\nkind: Pod\nmetadata:\n  name: edited\n";
const SECOND_RESOURCE: &str = "apiVersion: v1\nkind: Pod\nmetadata:\n  name: second\n";

fn demo_cluster() -> FakeCluster {
    FakeCluster::new().with_policy(
        PolicyBuilder::new("demo")
            .validation("object.spec.replicas <= 5", Some("too many replicas"))
            .with_server_fields()
            .build(),
    )
}

fn settled_result(view: &SessionView) -> (u64, String) {
    match &view.state {
        OrchestratorState::Settled { result } => {
            (result.seq, result.outcome.display_text().to_string())
        }
        other => panic!("expected Settled, got {:?}", other),
    }
}

// ============================================================================
// Opening sessions
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_initial_evaluation_uses_sample_resource() {
    let engine = Arc::new(FakeEngine::new());
    let cluster = Arc::new(demo_cluster());
    let (ctx, _health) = session_context(engine.clone(), cluster.clone());
    assert!(ctx.gateway.load().await.is_ok());

    let session = open_policy_session(&ctx, cluster.as_ref(), "demo", None)
        .await
        .unwrap();
    let view = session.wait_quiescent().await.unwrap();

    let calls = engine.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].resource, SAMPLE_DEPLOYMENT);
    assert_eq!(calls[0].params, ABSENT_PARAMS);
    assert_eq!(view.last_issued, 1);
    assert_eq!(view.last_accepted, Some(1));
    assert_eq!(settled_result(&view), (1, echo(SAMPLE_DEPLOYMENT)));
    assert!(cluster.reads().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_session_policy_is_sanitized() {
    let engine = Arc::new(FakeEngine::new());
    let cluster = Arc::new(demo_cluster());
    let (ctx, _health) = session_context(engine.clone(), cluster.clone());

    let session = open_policy_session(&ctx, cluster.as_ref(), "demo", None)
        .await
        .unwrap();
    let view = session.wait_quiescent().await.unwrap();

    let policy = &view.policy.text;
    assert!(!policy.contains("managedFields"));
    assert!(!policy.contains("status"));
    assert!(!policy.contains(LAST_APPLIED_ANNOTATION));
    assert!(policy.contains("team: platform"));
    assert!(!view.policy.dirty);

    let metadata = view.metadata.unwrap();
    assert_eq!(metadata.name, "demo");
    assert_eq!(metadata.messages, "too many replicas");
    assert_eq!(engine.calls()[0].policy, *policy);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_policy_is_not_found() {
    let engine = Arc::new(FakeEngine::new());
    let cluster = Arc::new(demo_cluster());
    let (ctx, _health) = session_context(engine, cluster.clone());

    let err = open_policy_session(&ctx, cluster.as_ref(), "missing", None)
        .await
        .err()
        .unwrap();
    assert!(err.is_not_found());
}

#[tokio::test(start_paused = true)]
async fn test_first_request_waits_for_engine() {
    let engine = Arc::new(FakeEngine::new().with_load_delay(Duration::from_millis(200)));
    let cluster = Arc::new(demo_cluster());
    let (ctx, _health) = session_context(engine.clone(), cluster.clone());

    let session = open_policy_session(&ctx, cluster.as_ref(), "demo", None)
        .await
        .unwrap();

    // Edits while the engine loads do not issue requests
    session
        .edit(DocumentKind::Resource, EDITED_RESOURCE.to_string())
        .await
        .unwrap();
    let view = session.view();
    assert_eq!(view.state.phase().to_string(), "AwaitingPrerequisites");
    assert_eq!(view.engine, EngineState::Loading);
    assert!(engine.calls().is_empty());

    let view = session.wait_quiescent().await.unwrap();
    assert_eq!(engine.calls().len(), 1);
    assert_eq!(settled_result(&view), (1, echo(EDITED_RESOURCE)));
}

// ============================================================================
// Edits and triggers
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_only_latest_edit_is_displayed() {
    let engine = Arc::new(FakeEngine::new().with_delay(Duration::from_millis(50)));
    let cluster = Arc::new(demo_cluster());
    let (ctx, health) = session_context(engine.clone(), cluster.clone());

    let session = open_policy_session(&ctx, cluster.as_ref(), "demo", None)
        .await
        .unwrap();
    let initial = session.wait_quiescent().await.unwrap();
    assert_eq!(initial.last_accepted, Some(1));

    // Record every result the session displays from here on
    let mut views = session.subscribe();
    let _ = views.borrow_and_update();
    let observer = tokio::spawn(async move {
        let mut displayed = Vec::new();
        while views.changed().await.is_ok() {
            let view = views.borrow_and_update().clone();
            displayed.push(view.result.as_ref().map(|r| r.seq));
            if view.is_quiescent() {
                break;
            }
        }
        displayed
    });

    session
        .edit(DocumentKind::Resource, EDITED_RESOURCE.to_string())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    session
        .edit(DocumentKind::Resource, SECOND_RESOURCE.to_string())
        .await
        .unwrap();

    let view = session.wait_quiescent().await.unwrap();
    assert_eq!(view.last_issued, 3);
    assert_eq!(settled_result(&view), (3, echo(SECOND_RESOURCE)));

    let displayed = observer.await.unwrap();
    assert!(!displayed.contains(&Some(2)), "stale result shown: {displayed:?}");
    assert_eq!(displayed.last(), Some(&Some(3)));

    assert_eq!(engine.calls().len(), 3);
    assert_eq!(health.metrics.stale_results_total.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_previous_result_stays_visible_while_evaluating() {
    let engine = Arc::new(FakeEngine::new().with_delay(Duration::from_millis(50)));
    let cluster = Arc::new(demo_cluster());
    let (ctx, _health) = session_context(engine, cluster.clone());

    let session = open_policy_session(&ctx, cluster.as_ref(), "demo", None)
        .await
        .unwrap();
    session.wait_quiescent().await.unwrap();

    session
        .edit(DocumentKind::Resource, EDITED_RESOURCE.to_string())
        .await
        .unwrap();
    let view = session.view();
    assert!(matches!(view.state, OrchestratorState::Evaluating { seq: 2 }));
    assert_eq!(view.result.map(|r| r.seq), Some(1));
    assert!(view.resource.dirty);
}

#[tokio::test(start_paused = true)]
async fn test_unchanged_edit_issues_no_request() {
    let engine = Arc::new(FakeEngine::new());
    let cluster = Arc::new(demo_cluster());
    let (ctx, _health) = session_context(engine.clone(), cluster.clone());

    let session = open_policy_session(&ctx, cluster.as_ref(), "demo", None)
        .await
        .unwrap();
    session.wait_quiescent().await.unwrap();

    session
        .edit(DocumentKind::Resource, SAMPLE_DEPLOYMENT.to_string())
        .await
        .unwrap();
    let view = session.wait_quiescent().await.unwrap();
    assert_eq!(view.last_issued, 1);
    assert_eq!(engine.calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_trigger_reevaluates_same_documents() {
    let engine = Arc::new(FakeEngine::new());
    let cluster = Arc::new(demo_cluster());
    let (ctx, _health) = session_context(engine.clone(), cluster.clone());

    let session = open_policy_session(&ctx, cluster.as_ref(), "demo", None)
        .await
        .unwrap();
    session.wait_quiescent().await.unwrap();

    session.evaluate().await.unwrap();
    let view = session.wait_quiescent().await.unwrap();

    let calls = engine.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0], calls[1]);
    assert_eq!(settled_result(&view).0, 2);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_resource_blocks_and_recovers() {
    let engine = Arc::new(FakeEngine::new().with_delay(Duration::from_millis(50)));
    let cluster = Arc::new(demo_cluster());
    let (ctx, health) = session_context(engine.clone(), cluster.clone());

    let session = open_policy_session(&ctx, cluster.as_ref(), "demo", None)
        .await
        .unwrap();
    session.wait_quiescent().await.unwrap();

    // Valid edit issues seq 2, then an invalid edit blocks before it returns
    session
        .edit(DocumentKind::Resource, EDITED_RESOURCE.to_string())
        .await
        .unwrap();
    session
        .edit(DocumentKind::Resource, "kind: [unclosed".to_string())
        .await
        .unwrap();

    let view = session.wait_quiescent().await.unwrap();
    assert!(matches!(
        view.state,
        OrchestratorState::Blocked {
            reason: BlockReason::InvalidResource { .. }
        }
    ));

    // The late answer to seq 2 is dropped
    tokio::time::sleep(Duration::from_millis(100)).await;
    let view = session.view();
    assert!(matches!(view.state, OrchestratorState::Blocked { .. }));
    assert_eq!(view.last_accepted, Some(1));
    assert_eq!(health.metrics.stale_results_total.get(), 1);

    session
        .edit(DocumentKind::Resource, SECOND_RESOURCE.to_string())
        .await
        .unwrap();
    let view = session.wait_quiescent().await.unwrap();
    assert_eq!(settled_result(&view), (3, echo(SECOND_RESOURCE)));
    assert_eq!(engine.calls().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_policy_edit_blocks() {
    let engine = Arc::new(FakeEngine::new());
    let cluster = Arc::new(demo_cluster());
    let (ctx, _health) = session_context(engine.clone(), cluster.clone());

    let session = open_policy_session(&ctx, cluster.as_ref(), "demo", None)
        .await
        .unwrap();
    session.wait_quiescent().await.unwrap();

    session
        .edit(DocumentKind::Policy, "spec: {}\n".to_string())
        .await
        .unwrap();
    let view = session.wait_quiescent().await.unwrap();

    assert!(matches!(
        view.state,
        OrchestratorState::Blocked {
            reason: BlockReason::InvalidPolicy { .. }
        }
    ));
    assert!(view.metadata.is_none());
    assert_eq!(engine.calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_params_edit_rejected_without_param_kind() {
    let engine = Arc::new(FakeEngine::new());
    let cluster = Arc::new(demo_cluster());
    let (ctx, _health) = session_context(engine, cluster.clone());

    let session = open_policy_session(&ctx, cluster.as_ref(), "demo", None)
        .await
        .unwrap();
    session.wait_quiescent().await.unwrap();

    let err = session
        .edit(DocumentKind::Params, "data: {}\n".to_string())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("absent"));
}

// ============================================================================
// Engine outcomes
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_engine_error_is_displayed_as_result() {
    let engine = Arc::new(
        FakeEngine::new()
            .responding(|_| Ok(r#"{"error":"undeclared reference to 'objec'"}"#.to_string())),
    );
    let cluster = Arc::new(demo_cluster());
    let (ctx, health) = session_context(engine, cluster.clone());

    let session = open_policy_session(&ctx, cluster.as_ref(), "demo", None)
        .await
        .unwrap();
    let view = session.wait_quiescent().await.unwrap();

    match &view.state {
        OrchestratorState::Settled { result } => {
            assert!(result.outcome.is_error());
            assert_eq!(
                result.outcome,
                ResultOutcome::Error {
                    message: "undeclared reference to 'objec'".to_string()
                }
            );
        }
        other => panic!("expected Settled, got {:?}", other),
    }
    assert!(health.metrics.encode().contains("outcome=\"error\""));
}

#[tokio::test(start_paused = true)]
async fn test_engine_failure_is_displayed_as_result() {
    let engine = Arc::new(
        FakeEngine::new().responding(|_| Err(EngineError::Evaluation("exit status 2".to_string()))),
    );
    let cluster = Arc::new(demo_cluster());
    let (ctx, _health) = session_context(engine, cluster.clone());

    let session = open_policy_session(&ctx, cluster.as_ref(), "demo", None)
        .await
        .unwrap();
    let view = session.wait_quiescent().await.unwrap();

    assert_eq!(settled_result(&view), (1, "exit status 2".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_engine_load_failure_blocks_every_session() {
    let engine = Arc::new(FakeEngine::new().failing_load("evaluator not found"));
    let cluster = Arc::new(demo_cluster());
    let (ctx, _health) = session_context(engine.clone(), cluster.clone());

    let first = open_policy_session(&ctx, cluster.as_ref(), "demo", None)
        .await
        .unwrap();
    let view = first.wait_quiescent().await.unwrap();
    match &view.state {
        OrchestratorState::Blocked {
            reason: BlockReason::EngineUnavailable { message },
        } => assert!(message.contains("evaluator not found")),
        other => panic!("expected EngineUnavailable, got {:?}", other),
    }
    assert!(matches!(ctx.gateway.state(), EngineState::LoadFailed(_)));

    let second = open_policy_session(&ctx, cluster.as_ref(), "demo", None)
        .await
        .unwrap();
    let view = second.wait_quiescent().await.unwrap();
    assert!(matches!(
        view.state,
        OrchestratorState::Blocked {
            reason: BlockReason::EngineUnavailable { .. }
        }
    ));

    // Edits and triggers cannot get past a failed engine
    second.evaluate().await.unwrap();
    assert!(matches!(second.view().state, OrchestratorState::Blocked { .. }));
    assert!(engine.calls().is_empty());
    assert_eq!(engine.load_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_sessions_share_one_engine_load() {
    let engine = Arc::new(FakeEngine::new().with_load_delay(Duration::from_millis(100)));
    let cluster = Arc::new(demo_cluster());
    let (ctx, health) = session_context(engine.clone(), cluster.clone());

    let first = open_policy_session(&ctx, cluster.as_ref(), "demo", None)
        .await
        .unwrap();
    let second = open_policy_session(&ctx, cluster.as_ref(), "demo", None)
        .await
        .unwrap();
    assert_eq!(health.metrics.active_sessions.get(), 2);

    first.wait_quiescent().await.unwrap();
    second.wait_quiescent().await.unwrap();
    assert_eq!(engine.load_count(), 1);
    assert_eq!(engine.calls().len(), 2);

    drop(first);
    assert_eq!(health.metrics.active_sessions.get(), 1);
}
