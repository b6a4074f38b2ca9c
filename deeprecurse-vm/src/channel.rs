//! # Broker Channel
//!
//! Sandbox-side half of the broker protocol. Sub-requests travel to the
//! broker over an mpsc queue; each one is registered in a pending table
//! under its `request_id`, and the broker completes it through the same
//! table. The sandbox blocks on a oneshot receiver with a timeout instead
//! of polling.

use crate::error::{self, Error, ErrorKind, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Outcome of one prompt slot: the response text or an error message
pub type SlotResult = std::result::Result<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Single,
    Batch,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Single => "single",
            RequestKind::Batch => "batch",
        }
    }
}

/// Envelope sent from a sandbox to its broker
#[derive(Debug, Clone, PartialEq)]
pub struct SubRequest {
    pub request_id: u64,
    pub kind: RequestKind,
    pub prompts: Vec<String>,
    pub model_id: Option<String>,
    /// Depth of the issuing executor
    pub depth: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubOutcome {
    /// One entry per prompt, in prompt order
    Results(Vec<SlotResult>),
    /// The whole request failed
    Failed { kind: ErrorKind, message: String },
}

/// Envelope sent from a broker back to a sandbox
#[derive(Debug, Clone, PartialEq)]
pub struct SubResponse {
    pub request_id: u64,
    pub outcome: SubOutcome,
}

impl SubResponse {
    pub fn results(request_id: u64, results: Vec<SlotResult>) -> Self {
        Self {
            request_id,
            outcome: SubOutcome::Results(results),
        }
    }

    pub fn failed(request_id: u64, err: &Error) -> Self {
        Self {
            request_id,
            outcome: SubOutcome::Failed {
                kind: err.kind(),
                message: err.message().to_string(),
            },
        }
    }
}

/// In-flight requests keyed by correlation id
#[derive(Debug, Default)]
pub struct PendingTable {
    next_id: AtomicU64,
    waiters: Mutex<HashMap<u64, oneshot::Sender<SubResponse>>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn waiters(&self) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<SubResponse>>> {
        match self.waiters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Allocate a fresh id and its completion slot
    pub fn register(&self) -> (u64, oneshot::Receiver<SubResponse>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.waiters().insert(id, tx);
        (id, rx)
    }

    /// Deliver a response. Returns false when nobody is waiting any more.
    pub fn complete(&self, response: SubResponse) -> bool {
        let waiter = self.waiters().remove(&response.request_id);
        match waiter {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    pub fn cancel(&self, request_id: u64) -> bool {
        self.waiters().remove(&request_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.waiters().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle the sandbox uses to issue sub-requests
#[derive(Debug, Clone)]
pub struct BrokerClient {
    requests: mpsc::Sender<SubRequest>,
    pending: Arc<PendingTable>,
    depth: usize,
    timeout: Duration,
}

impl BrokerClient {
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// `query(prompt, model?)`: one prompt, one response
    pub async fn query(&self, prompt: String, model: Option<String>) -> Result<String> {
        let mut results = self
            .submit(RequestKind::Single, vec![prompt], model)
            .await?;
        match results.pop() {
            Some(Ok(text)) => Ok(text),
            Some(Err(message)) => Err(error::backend_failed(format!("query failed: {}", message), false)),
            None => Err(error::channel_closed("broker").with_context("reason", "empty response")),
        }
    }

    /// `batched_query(prompts, model?)`: per-slot outcomes in input order
    pub async fn batched_query(&self, prompts: Vec<String>, model: Option<String>) -> Result<Vec<SlotResult>> {
        if prompts.is_empty() {
            return Ok(Vec::new());
        }
        self.submit(RequestKind::Batch, prompts, model).await
    }

    async fn submit(&self, kind: RequestKind, prompts: Vec<String>, model_id: Option<String>) -> Result<Vec<SlotResult>> {
        let expected = prompts.len();
        let (request_id, rx) = self.pending.register();
        let request = SubRequest {
            request_id,
            kind,
            prompts,
            model_id,
            depth: self.depth,
        };

        debug!(request_id, kind = kind.as_str(), prompts = expected, depth = self.depth, "sub-request sent");
        if self.requests.send(request).await.is_err() {
            self.pending.cancel(request_id);
            return Err(error::channel_closed("broker"));
        }

        let response = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(error::channel_closed("broker")),
            Err(_) => {
                self.pending.cancel(request_id);
                return Err(error::timeout("broker::submit", self.timeout.as_secs_f64())
                    .with_context("request_id", request_id.to_string()));
            }
        };

        match response.outcome {
            SubOutcome::Results(results) if results.len() == expected => Ok(results),
            SubOutcome::Results(results) => Err(Error::unexpected(format!(
                "broker returned {} results for {} prompts",
                results.len(),
                expected
            ))),
            SubOutcome::Failed { kind, message } => Err(Error::new(kind, message)
                .with_context("request_id", request_id.to_string())),
        }
    }
}

/// Broker-side half: incoming requests plus the table to complete them
#[derive(Debug)]
pub struct BrokerEndpoint {
    requests: mpsc::Receiver<SubRequest>,
    pending: Arc<PendingTable>,
}

impl BrokerEndpoint {
    pub async fn recv(&mut self) -> Option<SubRequest> {
        self.requests.recv().await
    }

    pub fn pending(&self) -> Arc<PendingTable> {
        self.pending.clone()
    }
}

/// Create a connected client/endpoint pair for an executor at `depth`
pub fn broker_channel(depth: usize, capacity: usize, timeout: Duration) -> (BrokerClient, BrokerEndpoint) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let pending = Arc::new(PendingTable::new());
    let client = BrokerClient {
        requests: tx,
        pending: pending.clone(),
        depth,
        timeout,
    };
    let endpoint = BrokerEndpoint { requests: rx, pending };
    (client, endpoint)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Answers every prompt with its upper-case form
    fn spawn_echo(mut endpoint: BrokerEndpoint) -> tokio::task::JoinHandle<Vec<SubRequest>> {
        tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(request) = endpoint.recv().await {
                let results = request
                    .prompts
                    .iter()
                    .map(|p| if p == "fail" { Err("boom".to_string()) } else { Ok(p.to_uppercase()) })
                    .collect();
                endpoint.pending().complete(SubResponse::results(request.request_id, results));
                seen.push(request);
            }
            seen
        })
    }

    #[tokio::test]
    async fn test_query_round_trip() {
        let (client, endpoint) = broker_channel(2, 8, Duration::from_secs(5));
        let pending = endpoint.pending();
        let server = spawn_echo(endpoint);

        assert_eq!(client.query("hi".into(), None).await.unwrap(), "HI");
        let batch = client
            .batched_query(vec!["a".into(), "fail".into(), "c".into()], Some("m".into()))
            .await
            .unwrap();
        assert_eq!(batch, vec![Ok("A".to_string()), Err("boom".to_string()), Ok("C".to_string())]);
        assert!(pending.is_empty());

        drop(client);
        let seen = server.await.unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].kind, RequestKind::Single);
        assert_eq!(seen[1].kind, RequestKind::Batch);
        assert_eq!(seen[1].model_id.as_deref(), Some("m"));
        assert!(seen.iter().all(|r| r.depth == 2));
        assert_ne!(seen[0].request_id, seen[1].request_id);
    }

    #[tokio::test]
    async fn test_failed_slot_is_query_error() {
        let (client, endpoint) = broker_channel(0, 8, Duration::from_secs(5));
        let _server = spawn_echo(endpoint);
        let err = client.query("fail".into(), None).await.unwrap_err();
        assert!(err.message().contains("boom"));
    }

    #[tokio::test]
    async fn test_whole_request_failure_keeps_kind() {
        let (client, mut endpoint) = broker_channel(0, 8, Duration::from_secs(5));
        tokio::spawn(async move {
            while let Some(request) = endpoint.recv().await {
                let err = Error::depth_exceeded(3, 3);
                endpoint.pending().complete(SubResponse::failed(request.request_id, &err));
            }
        });
        let err = client.query("x".into(), None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DepthExceeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cancels_pending_entry() {
        let (client, mut endpoint) = broker_channel(0, 8, Duration::from_secs(2));
        let pending = endpoint.pending();
        let holder = tokio::spawn(async move {
            // receive but never answer
            let request = endpoint.recv().await;
            tokio::time::sleep(Duration::from_secs(10)).await;
            request
        });

        let err = client.query("slow".into(), None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(pending.is_empty());

        let late = holder.await.unwrap().unwrap();
        assert!(!pending.complete(SubResponse::results(late.request_id, vec![Ok("late".into())])));
    }

    #[tokio::test]
    async fn test_closed_broker() {
        let (client, endpoint) = broker_channel(0, 8, Duration::from_secs(5));
        drop(endpoint);
        let err = client.query("x".into(), None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChannelClosed);
    }

    #[test]
    fn test_pending_ids_are_unique() {
        let table = PendingTable::new();
        let (a, _ra) = table.register();
        let (b, _rb) = table.register();
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
        assert!(table.cancel(a));
        assert!(!table.cancel(a));
        assert_eq!(table.len(), 1);
    }
}
