//! End-to-end recursion behaviour with a scripted in-process backend.

use async_trait::async_trait;
use deeprecurse_agent::{EngineConfig, Executor, ExecutorState, FinalResult};
use deeprecurse_vm::error::{self, Result};
use deeprecurse_vm::{
    CompletionRequest, CompletionResponse, ContextHandle, CorpusWriter, LlmBackend,
    MemoryObjectStore, SegmentedConfig,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const ROOT_MODEL: &str = "root-model";
const SUB_MODEL: &str = "sub-model";

/// What a scripted call looks like to the script
struct Call<'a> {
    model: &'a str,
    /// Earlier assistant turns in this conversation
    turn: usize,
    /// Full text of the conversation
    transcript: String,
    /// Content of the last message
    last: &'a str,
}

type Script = dyn Fn(&Call<'_>) -> Result<(String, Duration)> + Send + Sync;

struct ScriptedBackend {
    script: Box<Script>,
    calls: AtomicUsize,
    completed: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    fn new(script: impl Fn(&Call<'_>) -> Result<(String, Duration)> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            calls: AtomicUsize::new(0),
            completed: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn completed(&self) -> Vec<String> {
        self.completed.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn default_model(&self) -> &str {
        ROOT_MODEL
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let model = request.model.clone().unwrap_or_else(|| ROOT_MODEL.to_string());
        let last = request.messages.last().map(|m| m.content.as_str()).unwrap_or("");
        let call = Call {
            model: &model,
            turn: request
                .messages
                .iter()
                .filter(|m| m.role == deeprecurse_vm::Role::Assistant)
                .count(),
            transcript: request
                .messages
                .iter()
                .map(|m| m.content.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
            last,
        };
        let (reply, delay) = (self.script)(&call)?;
        let last = last.to_string();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.completed.lock().unwrap().push(last);
        Ok(CompletionResponse::text(model, reply))
    }
}

fn config(max_depth: usize, max_iterations: usize) -> Arc<EngineConfig> {
    Arc::new(EngineConfig {
        model: ROOT_MODEL.to_string(),
        sub_model: SUB_MODEL.to_string(),
        max_depth,
        max_iterations,
        ..EngineConfig::default()
    })
}

fn repl(code: &str) -> String {
    format!("Working on it.\n```repl\n{}\n```\n", code)
}

fn now(reply: impl Into<String>) -> Result<(String, Duration)> {
    Ok((reply.into(), Duration::ZERO))
}

async fn run_root(config: Arc<EngineConfig>, backend: Arc<ScriptedBackend>, context: &str, query: &str) -> FinalResult {
    Executor::root(config, backend, ContextHandle::from_text(context), query)
        .run()
        .await
}

#[tokio::test(start_paused = true)]
async fn test_batched_results_keep_input_order() {
    let backend = ScriptedBackend::new(|call| match call.model {
        ROOT_MODEL => now(repl(
            r#"[{"op": "QUERY_BATCHED", "prompts": ["p1", "p2", "p3"], "store_to": "r"},
                {"op": "FINAL_VAR", "name": "r"}]"#,
        )),
        _ => {
            let delay = match call.last {
                "p1" => 30,
                "p2" => 10,
                _ => 1,
            };
            Ok((format!("a{}", &call.last[1..]), Duration::from_millis(delay)))
        }
    });

    let result = run_root(config(1, 3), backend.clone(), "ctx", "q").await;

    assert_eq!(result.state, ExecutorState::TerminatedFinal);
    let answer: Vec<String> = serde_json::from_str(result.answer().unwrap()).unwrap();
    assert_eq!(answer, vec!["a1", "a2", "a3"]);

    // sub-calls settled in reverse, the root call first
    let completed = backend.completed();
    assert_eq!(&completed[1..], &["p3", "p2", "p1"]);
}

#[tokio::test]
async fn test_last_level_resolves_directly() {
    let backend = ScriptedBackend::new(|call| match call.model {
        ROOT_MODEL if call.turn == 0 => now(repl(
            r#"[{"op": "QUERY", "prompt": "summarize", "store_to": "s"},
                {"op": "QUERY", "prompt": "again", "store_to": "t"},
                {"op": "PRINT", "value": "{s} / {t}"}]"#,
        )),
        ROOT_MODEL => now("FINAL(done)"),
        _ => now(format!("direct {}", call.last)),
    });

    // depth 0 with max_depth 1 is the last level
    let result = run_root(config(1, 5), backend, "ctx", "q").await;

    assert_eq!(result.state, ExecutorState::TerminatedFinal);
    assert_eq!(result.stats.direct_calls, 2);
    assert!(result.stats.children.is_empty());
    assert_eq!(result.transcript[0].results[0].stdout, "direct summarize / direct again\n");
}

#[tokio::test]
async fn test_query_spawns_one_child_one_level_down() {
    let backend = ScriptedBackend::new(|call| match call.model {
        ROOT_MODEL => now(repl(
            r#"[{"op": "QUERY", "prompt": "what is in the attic?", "store_to": "r"},
                {"op": "FINAL_VAR", "name": "r"}]"#,
        )),
        SUB_MODEL if call.transcript.contains("what is in the attic?") => now("FINAL(boxes)"),
        _ => Err(error::backend_failed("unexpected call", false)),
    });

    let result = run_root(config(3, 5), backend.clone(), "ctx", "q").await;

    assert_eq!(result.state, ExecutorState::TerminatedFinal);
    assert_eq!(result.answer(), Some("boxes"));
    assert_eq!(result.stats.children.len(), 1);
    let child = &result.stats.children[0];
    assert_eq!(child.depth, 1);
    assert_eq!(child.state, ExecutorState::TerminatedFinal);
    assert_eq!(child.descendants, 0);
    assert_eq!(result.stats.direct_calls, 0);
    // one root turn, one child turn
    assert_eq!(backend.calls(), 2);
}

#[tokio::test]
async fn test_zero_iterations_never_runs() {
    let backend = ScriptedBackend::new(|_| now(repl(r#"{"op": "FINAL", "value": "x"}"#)));

    let result = run_root(config(3, 0), backend.clone(), "ctx", "q").await;

    assert_eq!(result.state, ExecutorState::TerminatedMaxIter);
    assert_eq!(result.iterations, 0);
    assert!(result.transcript.is_empty());
    assert_eq!(result.stats.sandbox_runs, 0);
    assert_eq!(backend.calls(), 0);
    assert!(!result.answer().unwrap().is_empty());
}

#[tokio::test]
async fn test_finalize_stops_the_loop() {
    let backend = ScriptedBackend::new(|_| now(repl(r#"{"op": "FINAL", "value": "42"}"#)));

    let result = run_root(config(3, 10), backend.clone(), "ctx", "q").await;

    assert_eq!(result.state, ExecutorState::TerminatedFinal);
    assert_eq!(result.answer(), Some("42"));
    assert_eq!(result.iterations, 1);
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn test_finalize_conflict_is_an_observation() {
    let backend = ScriptedBackend::new(|call| match call.turn {
        0 => now(repl(
            r#"[{"op": "SET", "name": "x", "value": "v"},
                {"op": "FINAL", "value": "a"},
                {"op": "FINAL_VAR", "name": "x"}]"#,
        )),
        _ if call.last.contains("FinalizeConflict") => now(repl(r#"{"op": "FINAL", "value": "b"}"#)),
        _ => Err(error::backend_failed("conflict was not reported", false)),
    });

    let result = run_root(config(3, 5), backend, "ctx", "q").await;

    assert_eq!(result.state, ExecutorState::TerminatedFinal);
    assert_eq!(result.answer(), Some("b"));
    let first = &result.transcript[0].results[0];
    assert!(first.final_answer.is_none());
    assert!(first.error.as_deref().unwrap().contains("FinalizeConflict"));
}

#[tokio::test]
async fn test_failed_child_is_a_slot_error() {
    let backend = ScriptedBackend::new(|call| match call.model {
        ROOT_MODEL => now(repl(
            r#"[{"op": "QUERY_BATCHED", "prompts": ["good", "bad"], "store_to": "r"},
                {"op": "FINAL_VAR", "name": "r"}]"#,
        )),
        _ if call.transcript.contains("## Question\nbad") => Err(error::backend_failed("model refused", false)),
        _ => now("FINAL(fine)"),
    });

    // children at depth 1 are the last level of max_depth 2
    let result = run_root(config(2, 3), backend, "ctx", "q").await;

    assert_eq!(result.state, ExecutorState::TerminatedFinal);
    let slots: Vec<String> = serde_json::from_str(result.answer().unwrap()).unwrap();
    assert_eq!(slots[0], "fine");
    assert!(slots[1].starts_with("ERROR: "));
    assert!(slots[1].contains("model refused"));

    let states: Vec<ExecutorState> = result.stats.children.iter().map(|c| c.state).collect();
    assert_eq!(states.len(), 2);
    assert!(states.contains(&ExecutorState::TerminatedFinal));
    assert!(states.contains(&ExecutorState::Failed));
}

#[tokio::test]
async fn test_root_backend_failure_is_structured() {
    let backend = ScriptedBackend::new(|_| Err(error::backend_failed("invalid api key", false)));

    let result = run_root(config(3, 5), backend, "ctx", "q").await;

    assert!(result.is_failed());
    let payload = result.error().unwrap();
    assert_eq!(payload.kind, "BackendFailed");
    assert!(payload.message.contains("invalid api key"));
}

#[tokio::test]
async fn test_segmented_context_reads_like_a_buffer() {
    let store = Arc::new(MemoryObjectStore::new());
    CorpusWriter::new(store.clone(), "team")
        .with_segment_chars(16)
        .append("[USER] which database?\n[ASSISTANT] postgres, for jsonb\n")
        .await
        .unwrap();

    let backend = ScriptedBackend::new(|call| match call.turn {
        0 => now(repl(
            r#"[{"op": "CONTEXT_LEN", "store_to": "n"},
                {"op": "SLICE", "start": 0, "store_to": "all"}]"#,
        )),
        _ => now(repl(
            r#"[{"op": "GREP", "source": "all", "pattern": "postgres", "store_to": "hits"},
                {"op": "FINAL_VAR", "name": "hits"}]"#,
        )),
    });

    let context = ContextHandle::segmented(store, "team", SegmentedConfig::default());
    let result = Executor::root(config(3, 5), backend, context, "which database?")
        .run()
        .await;

    assert_eq!(result.state, ExecutorState::TerminatedFinal);
    let hits: Vec<String> = serde_json::from_str(result.answer().unwrap()).unwrap();
    assert_eq!(hits, vec!["[ASSISTANT] postgres, for jsonb"]);
    assert_eq!(result.variable_snapshot["n"], serde_json::json!(55));
}
