//! # Executor
//!
//! The recursive reasoning loop. One executor owns one sandbox and alternates
//! between asking its model for a code block and running that block, until
//! a finalize, the iteration budget, or an unrecoverable fault ends it.
//!
//! ```text
//! INITIALIZING -> RUNNING <-> AWAITING_SANDBOX -> TERMINATED_FINAL
//!                                              -> TERMINATED_MAX_ITER
//!                                              -> FAILED
//! ```
//!
//! Child executors are only ever created by the broker.

use crate::broker::{Broker, ChildRecord};
use crate::config::EngineConfig;
use crate::response::{extract_code_blocks, find_text_final, TextFinal};
use chrono::{DateTime, Utc};
use deeprecurse_vm::namespace::value_to_text;
use deeprecurse_vm::opcode::truncate;
use deeprecurse_vm::{
    broker_channel, build_sandbox, complete_with_retry, ChatMessage, CompletionRequest,
    ContextHandle, Error, ExecutionResult, Interpreter, LlmBackend, Result, Sandbox,
    SandboxSchema, TaskPrompt, UsageTracker,
};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Longest query shown verbatim in the first prompt. Longer child prompts are
/// still fully readable through the child's context.
const INLINE_QUERY_CHARS: usize = 4_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutorState {
    Initializing,
    Running,
    AwaitingSandbox,
    TerminatedFinal,
    TerminatedMaxIter,
    Failed,
}

impl ExecutorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutorState::Initializing => "INITIALIZING",
            ExecutorState::Running => "RUNNING",
            ExecutorState::AwaitingSandbox => "AWAITING_SANDBOX",
            ExecutorState::TerminatedFinal => "TERMINATED_FINAL",
            ExecutorState::TerminatedMaxIter => "TERMINATED_MAX_ITER",
            ExecutorState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutorState::TerminatedFinal | ExecutorState::TerminatedMaxIter | ExecutorState::Failed
        )
    }
}

impl fmt::Display for ExecutorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error reported by a failed executor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: String,
    pub message: String,
}

impl From<&Error> for ErrorPayload {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.message().to_string(),
        }
    }
}

impl fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Answer(String),
    Error(ErrorPayload),
}

/// One turn: the model's reply and what its code blocks did
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub iteration: usize,
    pub reply: String,
    pub code: Vec<String>,
    pub results: Vec<ExecutionResult>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionStats {
    /// Calls this executor made to its own model
    pub model_calls: usize,
    pub sandbox_runs: usize,
    /// Sub-queries its broker sent straight to a backend
    pub direct_calls: usize,
    /// Children its broker spawned
    pub children: Vec<ChildRecord>,
    /// Tokens used here and by every descendant
    pub usage: UsageTracker,
}

/// Result of one executor, produced exactly once
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalResult {
    pub executor_id: Uuid,
    pub depth: usize,
    pub state: ExecutorState,
    pub outcome: Outcome,
    pub variable_snapshot: BTreeMap<String, Value>,
    pub iterations: usize,
    pub transcript: Vec<TranscriptEntry>,
    pub stats: ExecutionStats,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl FinalResult {
    pub fn answer(&self) -> Option<&str> {
        match &self.outcome {
            Outcome::Answer(answer) => Some(answer),
            Outcome::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&ErrorPayload> {
        match &self.outcome {
            Outcome::Answer(_) => None,
            Outcome::Error(payload) => Some(payload),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.state == ExecutorState::Failed
    }
}

/// What every executor in one tree shares
#[derive(Clone)]
pub(crate) struct Runtime {
    pub(crate) config: Arc<EngineConfig>,
    pub(crate) backend: Arc<dyn LlmBackend>,
}

/// How the loop ended
enum Termination {
    Final(String),
    MaxIterations,
    Failed(Error),
}

pub struct Executor {
    id: Uuid,
    depth: usize,
    max_depth: usize,
    max_iterations: usize,
    iteration_count: usize,
    model_id: String,
    state: ExecutorState,
    query: String,
    context: ContextHandle,
    runtime: Runtime,
    transcript: Vec<TranscriptEntry>,
    stats: ExecutionStats,
    started_at: DateTime<Utc>,
}

impl Executor {
    /// Depth-0 executor answering `query` over `context`
    pub fn root(
        config: Arc<EngineConfig>,
        backend: Arc<dyn LlmBackend>,
        context: ContextHandle,
        query: impl Into<String>,
    ) -> Self {
        let model_id = config.model.clone();
        let runtime = Runtime { config, backend };
        Self::new(runtime, context, query.into(), 0, model_id)
    }

    /// Executor resolving one sub-query prompt. The prompt is both the
    /// question and the context its sandbox holds.
    pub(crate) fn child(runtime: Runtime, prompt: String, depth: usize, model: Option<String>) -> Self {
        let model_id = model.unwrap_or_else(|| runtime.config.sub_model.clone());
        let context = ContextHandle::from_text(prompt.as_str());
        Self::new(runtime, context, prompt, depth, model_id)
    }

    fn new(runtime: Runtime, context: ContextHandle, query: String, depth: usize, model_id: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            depth,
            max_depth: runtime.config.max_depth,
            max_iterations: runtime.config.max_iterations,
            iteration_count: 0,
            model_id,
            state: ExecutorState::Initializing,
            query,
            context,
            runtime,
            transcript: Vec::new(),
            stats: ExecutionStats::default(),
            started_at: Utc::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn state(&self) -> ExecutorState {
        self.state
    }

    /// Drive the loop to a terminal state.
    ///
    /// Boxed because a run may, through its broker, await child runs.
    pub fn run(self) -> BoxFuture<'static, FinalResult> {
        Box::pin(self.execute())
    }

    async fn execute(mut self) -> FinalResult {
        info!(executor_id = %self.id, depth = self.depth, model = %self.model_id, "executor started");

        if self.max_iterations == 0 {
            let answer = self.best_effort(&BTreeMap::new());
            return self.finish(ExecutorState::TerminatedMaxIter, Outcome::Answer(answer), BTreeMap::new());
        }

        let context_length = match self.context.length().await {
            Ok(length) => length,
            Err(err) => {
                warn!(executor_id = %self.id, error = %err, "context unavailable");
                return self.finish(ExecutorState::Failed, Outcome::Error((&err).into()), BTreeMap::new());
            }
        };

        let config = self.runtime.config.clone();
        let (client, endpoint) = broker_channel(
            self.depth,
            config.max_concurrent_subcalls * 2,
            config.subcall_timeout(),
        );
        let broker = Broker::new(self.depth, self.runtime.clone());
        let broker_stats = broker.stats();
        let broker_task = tokio::spawn(broker.serve(endpoint));

        let interpreter = Interpreter::new(self.context.clone(), client, config.sandbox.limits());
        let mut sandbox = build_sandbox(config.sandbox.kind, interpreter, config.sandbox.run_timeout());

        let termination = self.drive(sandbox.as_mut(), context_length).await;

        let snapshot = match sandbox.bindings().await {
            Ok(bindings) => bindings,
            Err(err) => {
                debug!(executor_id = %self.id, error = %err, "no bindings snapshot");
                BTreeMap::new()
            }
        };
        sandbox.shutdown().await;
        drop(sandbox);
        broker_task.abort();

        let from_broker = broker_stats.snapshot();
        self.stats.direct_calls = from_broker.direct_calls;
        self.stats.children = from_broker.children;
        self.stats.usage.merge(&from_broker.usage);

        match termination {
            Termination::Final(answer) => {
                self.finish(ExecutorState::TerminatedFinal, Outcome::Answer(answer), snapshot)
            }
            Termination::MaxIterations => {
                let answer = self.best_effort(&snapshot);
                self.finish(ExecutorState::TerminatedMaxIter, Outcome::Answer(answer), snapshot)
            }
            Termination::Failed(err) => {
                warn!(executor_id = %self.id, depth = self.depth, error = %err, "executor failed");
                self.finish(ExecutorState::Failed, Outcome::Error((&err).into()), snapshot)
            }
        }
    }

    async fn drive(&mut self, sandbox: &mut dyn Sandbox, context_length: usize) -> Termination {
        let task = TaskPrompt {
            query: self.shown_query(),
            context_kind: self.context.kind().as_str().to_string(),
            context_length,
            depth: self.depth,
            max_depth: self.max_depth,
            max_iterations: self.max_iterations,
        };
        let schema = SandboxSchema::new();
        let mut messages = vec![
            ChatMessage::system(task.system_prompt(&schema)),
            ChatMessage::user(task.first_prompt()),
        ];
        self.state = ExecutorState::Running;

        while self.iteration_count < self.max_iterations {
            let iteration = self.iteration_count + 1;
            debug!(executor_id = %self.id, depth = self.depth, iteration, "asking for next block");

            let reply = match self.ask_model(&messages).await {
                Ok(reply) => reply,
                Err(err) => return Termination::Failed(err),
            };
            messages.push(ChatMessage::assistant(reply.clone()));

            let blocks = extract_code_blocks(&reply);
            if blocks.is_empty() {
                self.iteration_count = iteration;
                let next = match find_text_final(&reply) {
                    Some(text_final) => match Self::resolve_text_final(sandbox, text_final).await {
                        Ok(Ok(answer)) => {
                            self.record(iteration, reply, blocks, Vec::new());
                            return Termination::Final(answer);
                        }
                        Ok(Err(observation)) => task.continue_prompt(iteration, &observation),
                        Err(err) => return Termination::Failed(err),
                    },
                    None => task.no_code_prompt(iteration),
                };
                self.record(iteration, reply, blocks, Vec::new());
                messages.push(ChatMessage::user(next));
                continue;
            }

            self.state = ExecutorState::AwaitingSandbox;
            let mut results = Vec::with_capacity(blocks.len());
            let mut answer = None;
            for code in &blocks {
                let result = match sandbox.run(code).await {
                    Ok(result) => result,
                    Err(err) => {
                        self.iteration_count = iteration;
                        self.record(iteration, reply, blocks.clone(), results);
                        return Termination::Failed(err);
                    }
                };
                self.stats.sandbox_runs += 1;
                answer = result.final_answer.as_ref().map(|a| a.text().to_string());
                let stop = answer.is_some() || !result.is_ok();
                results.push(result);
                if stop {
                    break;
                }
            }
            self.iteration_count = iteration;
            self.state = ExecutorState::Running;

            let observation = results
                .iter()
                .map(ExecutionResult::to_observation)
                .collect::<Vec<_>>()
                .join("\n");
            self.record(iteration, reply, blocks, results);

            if let Some(answer) = answer {
                info!(executor_id = %self.id, depth = self.depth, iteration, "finalized");
                return Termination::Final(answer);
            }
            messages.push(ChatMessage::user(task.continue_prompt(iteration, &observation)));
        }

        info!(executor_id = %self.id, depth = self.depth, iterations = self.iteration_count, "iteration budget spent");
        Termination::MaxIterations
    }

    async fn ask_model(&mut self, messages: &[ChatMessage]) -> Result<String> {
        let config = &self.runtime.config;
        let request = CompletionRequest::new(messages.to_vec()).with_model(self.model_id.clone());
        let response = complete_with_retry(&self.runtime.backend, request, &config.backend.retry_policy()).await?;
        self.stats.model_calls += 1;
        self.stats.usage.track(&response.model, &response.usage);
        Ok(response.content)
    }

    /// `Ok(Ok(answer))` to stop, `Ok(Err(observation))` to keep going
    async fn resolve_text_final(
        sandbox: &mut dyn Sandbox,
        text_final: TextFinal,
    ) -> Result<std::result::Result<String, String>> {
        match text_final {
            TextFinal::Value(value) => Ok(Ok(value)),
            TextFinal::Variable(name) => {
                let bindings = sandbox.bindings().await?;
                match bindings.get(&name) {
                    Some(value) => Ok(Ok(value_to_text(value))),
                    None => {
                        let available: Vec<&str> = bindings.keys().map(String::as_str).collect();
                        Ok(Err(format!(
                            "[error]\nFINAL_VAR: variable '{}' not found; available: {}\n",
                            name,
                            if available.is_empty() { "(none)".to_string() } else { available.join(", ") }
                        )))
                    }
                }
            }
        }
    }

    fn record(&mut self, iteration: usize, reply: String, code: Vec<String>, results: Vec<ExecutionResult>) {
        self.transcript.push(TranscriptEntry {
            iteration,
            reply,
            code,
            results,
        });
    }

    fn shown_query(&self) -> String {
        if self.query.chars().count() <= INLINE_QUERY_CHARS {
            return self.query.clone();
        }
        format!(
            "{}\n(request truncated; the full text is the context)",
            truncate(&self.query, INLINE_QUERY_CHARS)
        )
    }

    /// Answer for a run that never finalized, taken from what it left behind
    fn best_effort(&self, bindings: &BTreeMap<String, Value>) -> String {
        for name in ["final_answer", "answer"] {
            if let Some(text) = bindings.get(name).map(value_to_text) {
                if !text.trim().is_empty() {
                    return text;
                }
            }
        }

        let last_stdout = self
            .transcript
            .iter()
            .rev()
            .flat_map(|entry| entry.results.iter().rev())
            .map(|result| result.stdout.trim())
            .find(|stdout| !stdout.is_empty());
        if let Some(stdout) = last_stdout {
            return stdout.to_string();
        }

        let last_reply = self
            .transcript
            .iter()
            .rev()
            .map(|entry| entry.reply.trim())
            .find(|reply| !reply.is_empty());
        if let Some(reply) = last_reply {
            return reply.to_string();
        }

        format!("No answer was reached within {} iterations.", self.max_iterations)
    }

    fn finish(
        mut self,
        state: ExecutorState,
        outcome: Outcome,
        variable_snapshot: BTreeMap<String, Value>,
    ) -> FinalResult {
        self.state = state;
        info!(
            executor_id = %self.id,
            depth = self.depth,
            state = %state,
            iterations = self.iteration_count,
            "executor finished"
        );
        FinalResult {
            executor_id: self.id,
            depth: self.depth,
            state,
            outcome,
            variable_snapshot,
            iterations: self.iteration_count,
            transcript: self.transcript,
            stats: self.stats,
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}
