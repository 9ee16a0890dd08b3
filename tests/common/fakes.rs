//! In-memory collaborators for tests.
//!
//! `FakeEngine` and `FakeCluster` stand in for the evaluator executable and the
//! Kubernetes API. Both record every call so tests can assert on what the
//! orchestrator asked for, and both can be slowed down with tokio sleeps so
//! paused-time tests control completion order.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;

use vap_playground::cluster::{ClusterError, ClusterSource, ParamsTarget};
use vap_playground::engine::{EngineError, EvaluationEngine};

/// One call made to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCall {
    pub policy: String,
    pub resource: String,
    pub params: String,
}

type Responder = Box<dyn Fn(&EngineCall) -> Result<String, EngineError> + Send + Sync>;

/// Evaluation engine answering with `evaluated:<resource>` unless told otherwise.
pub struct FakeEngine {
    load_delay: Duration,
    load_error: Option<String>,
    delay: Duration,
    delays: Mutex<VecDeque<Duration>>,
    responder: Responder,
    calls: Mutex<Vec<EngineCall>>,
    loads: AtomicUsize,
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            load_delay: Duration::ZERO,
            load_error: None,
            delay: Duration::ZERO,
            delays: Mutex::new(VecDeque::new()),
            responder: Box::new(|call| Ok(echo(&call.resource))),
            calls: Mutex::new(Vec::new()),
            loads: AtomicUsize::new(0),
        }
    }

    /// Every evaluation takes `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// The first evaluations take these delays, in order; later ones the default.
    pub fn with_delays(self, delays: impl IntoIterator<Item = Duration>) -> Self {
        *self.delays.lock().unwrap() = delays.into_iter().collect();
        self
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    pub fn failing_load(mut self, message: &str) -> Self {
        self.load_error = Some(message.to_string());
        self
    }

    pub fn responding(
        mut self,
        responder: impl Fn(&EngineCall) -> Result<String, EngineError> + Send + Sync + 'static,
    ) -> Self {
        self.responder = Box::new(responder);
        self
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

/// Output of the default responder for a resource.
pub fn echo(resource: &str) -> String {
    format!("evaluated:{resource}")
}

impl EvaluationEngine for FakeEngine {
    fn load(&self) -> BoxFuture<'_, Result<(), EngineError>> {
        async move {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if !self.load_delay.is_zero() {
                tokio::time::sleep(self.load_delay).await;
            }
            match &self.load_error {
                Some(message) => Err(EngineError::Load(message.clone())),
                None => Ok(()),
            }
        }
        .boxed()
    }

    fn evaluate<'a>(
        &'a self,
        policy: &'a str,
        resource: &'a str,
        params: &'a str,
    ) -> BoxFuture<'a, Result<String, EngineError>> {
        async move {
            let call = EngineCall {
                policy: policy.to_string(),
                resource: resource.to_string(),
                params: params.to_string(),
            };
            self.calls.lock().unwrap().push(call.clone());

            let delay = self.delays.lock().unwrap().pop_front().unwrap_or(self.delay);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            (self.responder)(&call)
        }
        .boxed()
    }
}

/// Cluster holding policies and params collections in memory.
#[derive(Default)]
pub struct FakeCluster {
    policies: Mutex<BTreeMap<String, Value>>,
    collections: Mutex<BTreeMap<String, Vec<Value>>>,
    failing: Mutex<HashSet<String>>,
    reads: Mutex<Vec<ParamsTarget>>,
    read_delay: Duration,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a policy object, keyed by `metadata.name`.
    pub fn with_policy(self, policy: Value) -> Self {
        let name = policy["metadata"]["name"].as_str().unwrap().to_string();
        self.policies.lock().unwrap().insert(name, policy);
        self
    }

    /// Add objects to the collection at a REST path such as `/api/v1/foos`.
    pub fn with_items(self, path: &str, items: Vec<Value>) -> Self {
        self.collections
            .lock()
            .unwrap()
            .insert(path.to_string(), items);
        self
    }

    /// Reads of the collection at `path` fail with a server error.
    pub fn failing_collection(self, path: &str) -> Self {
        self.failing.lock().unwrap().insert(path.to_string());
        self
    }

    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = delay;
        self
    }

    /// Every params collection read, in order.
    pub fn reads(&self) -> Vec<ParamsTarget> {
        self.reads.lock().unwrap().clone()
    }
}

fn api_error(code: u16, reason: &str, message: String) -> ClusterError {
    ClusterError::Kube(kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    }))
}

impl ClusterSource for FakeCluster {
    fn get_policy<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Value, ClusterError>> {
        async move {
            self.policies
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .ok_or_else(|| api_error(404, "NotFound", format!("policy {name} not found")))
        }
        .boxed()
    }

    fn list_policies(&self) -> BoxFuture<'_, Result<Vec<Value>, ClusterError>> {
        async move { Ok(self.policies.lock().unwrap().values().cloned().collect()) }.boxed()
    }

    fn first_item<'a>(
        &'a self,
        target: &'a ParamsTarget,
    ) -> BoxFuture<'a, Result<Option<Value>, ClusterError>> {
        async move {
            self.reads.lock().unwrap().push(target.clone());
            if !self.read_delay.is_zero() {
                tokio::time::sleep(self.read_delay).await;
            }

            let path = target.path();
            if self.failing.lock().unwrap().contains(&path) {
                return Err(api_error(500, "InternalError", format!("{path} unavailable")));
            }
            Ok(self
                .collections
                .lock()
                .unwrap()
                .get(&path)
                .and_then(|items| items.first().cloned()))
        }
        .boxed()
    }
}
