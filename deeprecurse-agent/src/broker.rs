//! # Broker
//!
//! Resolves the sub-requests one executor's sandbox sends. Each prompt is
//! answered either by a direct backend call or by a child executor one
//! level deeper; this is the only place children are created, so the depth
//! limit is enforced here and nowhere else.
//!
//! Requests are served concurrently. Within a request every prompt is an
//! independent resolution; results keep prompt order and failures stay in
//! their own slot.

use crate::executor::{Executor, ExecutorState, FinalResult, Outcome, Runtime};
use deeprecurse_vm::error::{self, Result};
use deeprecurse_vm::{
    complete_with_retry, BrokerEndpoint, ChatMessage, CompletionRequest, CompletionResponse,
    SlotResult, SubRequest, SubResponse, UsageTracker,
};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;
use uuid::Uuid;

/// Summary of a child executor kept by its parent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildRecord {
    pub executor_id: Uuid,
    pub depth: usize,
    pub state: ExecutorState,
    pub iterations: usize,
    /// Executors below this child
    pub descendants: usize,
}

impl ChildRecord {
    fn from_result(result: &FinalResult) -> Self {
        Self {
            executor_id: result.executor_id,
            depth: result.depth,
            state: result.state,
            iterations: result.iterations,
            descendants: result
                .stats
                .children
                .iter()
                .map(|child| 1 + child.descendants)
                .sum(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct BrokerStats {
    pub(crate) direct_calls: usize,
    pub(crate) children: Vec<ChildRecord>,
    pub(crate) usage: UsageTracker,
}

/// Counters the broker updates while its executor is still running
#[derive(Debug, Clone, Default)]
pub(crate) struct SharedBrokerStats(Arc<Mutex<BrokerStats>>);

impl SharedBrokerStats {
    fn lock(&self) -> MutexGuard<'_, BrokerStats> {
        match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn record_direct(&self, response: &CompletionResponse) {
        let mut stats = self.lock();
        stats.direct_calls += 1;
        stats.usage.track(&response.model, &response.usage);
    }

    fn record_child(&self, result: &FinalResult) {
        let mut stats = self.lock();
        stats.children.push(ChildRecord::from_result(result));
        stats.usage.merge(&result.stats.usage);
    }

    pub(crate) fn snapshot(&self) -> BrokerStats {
        self.lock().clone()
    }
}

pub(crate) struct Broker {
    /// Depth of the executor this broker serves
    depth: usize,
    runtime: Runtime,
    permits: Arc<Semaphore>,
    stats: SharedBrokerStats,
}

impl Broker {
    pub(crate) fn new(depth: usize, runtime: Runtime) -> Self {
        let permits = Arc::new(Semaphore::new(runtime.config.max_concurrent_subcalls.max(1)));
        Self {
            depth,
            runtime,
            permits,
            stats: SharedBrokerStats::default(),
        }
    }

    pub(crate) fn stats(&self) -> SharedBrokerStats {
        self.stats.clone()
    }

    /// Whether prompts from this level go straight to a backend
    fn resolves_directly(&self) -> bool {
        self.depth + 1 >= self.runtime.config.max_depth
    }

    /// Serve requests until the sandbox side hangs up. Requests still in
    /// flight at that point are dropped with the task set.
    pub(crate) async fn serve(self, mut endpoint: BrokerEndpoint) {
        let pending = endpoint.pending();
        let broker = Arc::new(self);
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                request = endpoint.recv() => {
                    let Some(request) = request else { break };
                    let broker = broker.clone();
                    let pending = pending.clone();
                    in_flight.spawn(async move {
                        let request_id = request.request_id;
                        let response = broker.resolve(request).await;
                        if !pending.complete(response) {
                            debug!(request_id, "late broker response dropped");
                        }
                    });
                }
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
            }
        }
        debug!(depth = broker.depth, "broker stopped");
    }

    async fn resolve(&self, request: SubRequest) -> SubResponse {
        let max_depth = self.runtime.config.max_depth;
        if request.depth != self.depth || request.depth >= max_depth {
            let err = error::depth_exceeded(request.depth, max_depth)
                .with_context("request_id", request.request_id.to_string());
            return SubResponse::failed(request.request_id, &err);
        }

        debug!(
            request_id = request.request_id,
            kind = request.kind.as_str(),
            prompts = request.prompts.len(),
            depth = self.depth,
            direct = self.resolves_directly(),
            "resolving sub-request"
        );

        let model = request.model_id;
        let slots = request
            .prompts
            .into_iter()
            .map(|prompt| self.resolve_prompt(prompt, model.clone()));
        let results = join_all(slots).await;
        SubResponse::results(request.request_id, results)
    }

    async fn resolve_prompt(&self, prompt: String, model: Option<String>) -> SlotResult {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| "broker is shutting down".to_string())?;

        if self.resolves_directly() {
            let model = model.unwrap_or_else(|| self.runtime.config.sub_model.clone());
            return self
                .direct_call(prompt, model)
                .await
                .map_err(|err| format!("{}: {}", err.kind(), err.message()));
        }

        let child = Executor::child(self.runtime.clone(), prompt, self.depth + 1, model);
        let result = child.run().await;
        self.stats.record_child(&result);
        match result.outcome {
            Outcome::Answer(answer) => Ok(answer),
            Outcome::Error(payload) => Err(payload.to_string()),
        }
    }

    async fn direct_call(&self, prompt: String, model: String) -> Result<String> {
        let request = CompletionRequest::new(vec![ChatMessage::user(prompt)]).with_model(model);
        let policy = self.runtime.config.backend.retry_policy();
        let response = complete_with_retry(&self.runtime.backend, request, &policy).await?;
        self.stats.record_direct(&response);
        Ok(response.content)
    }
}
