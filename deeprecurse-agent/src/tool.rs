//! # Tool Surface
//!
//! Two tools for an assistant host: `chat_rlm_query` starts a root executor
//! over a corpus or inline text, `upload_context` appends a session
//! transcript to a corpus. Transport framing belongs to the caller.

use crate::config::EngineConfig;
use crate::executor::{Executor, FinalResult};
use chrono::Utc;
use deeprecurse_vm::error::{self, Error, Result};
use deeprecurse_vm::{ContextHandle, CorpusWriter, LlmBackend, Manifest, ObjectStore, SessionHeader};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::info;
use uuid::Uuid;

pub const QUERY_TOOL: &str = "chat_rlm_query";
pub const UPLOAD_TOOL: &str = "upload_context";

/// Corpus used when a call names none
pub const DEFAULT_CORPUS: &str = "default";

/// Tool definition in function-calling form
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments
    pub parameters: Value,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ToolCall {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ToolResult {
    /// Correlates with `ToolCall::id`
    pub tool_call_id: String,
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    fn ok(id: &str, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: id.to_string(),
            content: content.into(),
            is_error: false,
        }
    }

    fn error(id: &str, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: id.to_string(),
            content: content.into(),
            is_error: true,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct QueryArgs {
    pub query: String,
    #[serde(default)]
    pub corpus: Option<String>,
    /// Inline context text; takes precedence over `corpus`
    #[serde(default)]
    pub context: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct UploadArgs {
    pub transcript: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub corpus: Option<String>,
    #[serde(default)]
    pub developer: Option<String>,
}

pub struct QueryTool {
    config: Arc<EngineConfig>,
    store: Arc<dyn ObjectStore>,
    backend: Option<Arc<dyn LlmBackend>>,
    /// One writer at a time per corpus; an append rewrites the manifest
    append_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl QueryTool {
    pub fn new(config: Arc<EngineConfig>, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            config,
            store,
            backend: None,
            append_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Use `backend` instead of building one from the configuration
    pub fn with_backend(mut self, backend: Arc<dyn LlmBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn definitions() -> Vec<ToolDefinition> {
        vec![
            ToolDefinition {
                name: QUERY_TOOL.to_string(),
                description: "Answer a question over a large corpus of past sessions by recursive \
                              code execution. Use for questions the corpus can answer."
                    .to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "query": {"type": "string", "description": "The question to answer"},
                        "corpus": {"type": "string", "description": "Corpus name (default: \"default\")"},
                        "context": {"type": "string", "description": "Inline text to use instead of a corpus"}
                    },
                    "required": ["query"]
                }),
            },
            ToolDefinition {
                name: UPLOAD_TOOL.to_string(),
                description: "Append a session transcript to a corpus so later queries can see it.".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "transcript": {"type": "string", "description": "Role-tagged transcript text"},
                        "session_id": {"type": "string"},
                        "corpus": {"type": "string"},
                        "developer": {"type": "string"}
                    },
                    "required": ["transcript"]
                }),
            },
        ]
    }

    /// Dispatch one call. Failures come back as error results, never panics.
    pub async fn call(&self, call: ToolCall) -> ToolResult {
        let id = call.id.as_str();
        match call.name.as_str() {
            QUERY_TOOL => {
                let args: QueryArgs = match parse_args(call.arguments) {
                    Ok(args) => args,
                    Err(err) => return ToolResult::error(id, err.message()),
                };
                match self.query(args).await {
                    Ok(result) => match result.answer() {
                        Some(answer) => ToolResult::ok(id, answer),
                        None => {
                            let payload = result
                                .error()
                                .map(|p| serde_json::to_string(p).unwrap_or_else(|_| p.to_string()))
                                .unwrap_or_default();
                            ToolResult::error(id, payload)
                        }
                    },
                    Err(err) => ToolResult::error(id, format!("{}: {}", err.kind(), err.message())),
                }
            }
            UPLOAD_TOOL => {
                let args: UploadArgs = match parse_args(call.arguments) {
                    Ok(args) => args,
                    Err(err) => return ToolResult::error(id, err.message()),
                };
                let corpus = args.corpus.clone().unwrap_or_else(|| DEFAULT_CORPUS.to_string());
                let chars = args.transcript.chars().count();
                match self.upload(args).await {
                    Ok(manifest) => ToolResult::ok(
                        id,
                        format!(
                            "uploaded {} characters to corpus '{}' ({} segments, {} characters total)",
                            chars,
                            corpus,
                            manifest.len(),
                            manifest.total_length()
                        ),
                    ),
                    Err(err) => ToolResult::error(id, format!("{}: {}", err.kind(), err.message())),
                }
            }
            other => ToolResult::error(id, format!("unknown tool '{}'", other)),
        }
    }

    /// Run a root executor for `args`
    pub async fn query(&self, args: QueryArgs) -> Result<FinalResult> {
        if args.query.trim().is_empty() {
            return Err(error::invalid_argument("query must not be empty"));
        }

        let context = match args.context {
            Some(text) => ContextHandle::from_text(text),
            None => {
                let corpus = args.corpus.as_deref().unwrap_or(DEFAULT_CORPUS);
                ContextHandle::segmented(self.store.clone(), corpus, self.config.context.segmented_config())
            }
        };
        let backend = self.backend()?;

        info!(query_chars = args.query.len(), context = context.kind().as_str(), "tool query");
        Ok(Executor::root(self.config.clone(), backend, context, args.query).run().await)
    }

    /// Append a transcript, framed with a session header
    pub async fn upload(&self, args: UploadArgs) -> Result<Manifest> {
        if args.transcript.trim().is_empty() {
            return Err(error::invalid_argument("transcript must not be empty"));
        }
        let corpus = args.corpus.unwrap_or_else(|| DEFAULT_CORPUS.to_string());
        let session = args.session_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let developer = args.developer.unwrap_or_else(|| "unknown".to_string());

        let text = format!(
            "{}\n{}\n",
            upload_header(&session, &developer),
            args.transcript.trim_end()
        );
        let lock = self.append_lock(&corpus);
        let _writing = lock.lock().await;
        let writer = CorpusWriter::new(self.store.clone(), corpus)
            .with_segment_chars(self.config.context.segment_chars);
        writer.append(&text).await
    }

    fn append_lock(&self, corpus: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.append_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(locks.entry(corpus.to_string()).or_default())
    }

    fn backend(&self) -> Result<Arc<dyn LlmBackend>> {
        match &self.backend {
            Some(backend) => Ok(backend.clone()),
            None => self.config.backend.provider_config(&self.config.model)?.build(),
        }
    }
}

/// `[SESSION UPLOAD] <session> | developer=<name> | <timestamp>`
pub fn upload_header(session: &str, developer: &str) -> String {
    SessionHeader {
        session: session.to_string(),
        developer: Some(developer.to_string()),
        uploaded_at: Some(Utc::now().to_rfc3339()),
    }
    .render()
}

fn parse_args<T: for<'de> Deserialize<'de>>(arguments: Value) -> Result<T> {
    serde_json::from_value(arguments)
        .map_err(|e| Error::parse_failed(format!("invalid tool arguments: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use deeprecurse_vm::{CompletionRequest, CompletionResponse, MemoryObjectStore};
    use std::time::Duration;

    /// Finalizes with the number of characters in the context
    struct LengthReporter;

    #[async_trait]
    impl LlmBackend for LengthReporter {
        fn name(&self) -> &str {
            "length"
        }

        fn default_model(&self) -> &str {
            "length"
        }

        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
            let seen_length = request.messages.iter().any(|m| m.content.contains("[stdout]"));
            let reply = if seen_length {
                "```repl\n{\"op\": \"FINAL_VAR\", \"name\": \"n\"}\n```"
            } else {
                "```repl\n[{\"op\": \"CONTEXT_LEN\", \"store_to\": \"n\"}, {\"op\": \"PRINT\", \"value\": \"{n}\"}]\n```"
            };
            Ok(CompletionResponse::text("length", reply))
        }
    }

    fn tool(store: Arc<MemoryObjectStore>) -> QueryTool {
        QueryTool::new(Arc::new(EngineConfig::default()), store).with_backend(Arc::new(LengthReporter))
    }

    fn call(name: &str, arguments: Value) -> ToolCall {
        ToolCall {
            id: "call-1".into(),
            name: name.into(),
            arguments,
        }
    }

    #[tokio::test]
    async fn test_upload_then_query() {
        let store = Arc::new(MemoryObjectStore::new());
        let tool = tool(store.clone());

        let uploaded = tool
            .call(call(
                UPLOAD_TOOL,
                json!({"transcript": "[USER] hi\n[ASSISTANT] hello", "session_id": "s1", "developer": "sam"}),
            ))
            .await;
        assert!(!uploaded.is_error, "{}", uploaded.content);
        assert!(uploaded.content.contains("corpus 'default'"));

        let writer = CorpusWriter::new(store.clone(), DEFAULT_CORPUS);
        let total = writer.manifest().await.unwrap().total_length();

        let answer = tool.call(call(QUERY_TOOL, json!({"query": "how long?"}))).await;
        assert!(!answer.is_error, "{}", answer.content);
        assert_eq!(answer.content, total.to_string());
        assert_eq!(answer.tool_call_id, "call-1");
    }

    #[tokio::test]
    async fn test_inline_context() {
        let tool = tool(Arc::new(MemoryObjectStore::new()));
        let answer = tool
            .call(call(QUERY_TOOL, json!({"query": "len", "context": "abcde"})))
            .await;
        assert_eq!(answer.content, "5");
    }

    #[tokio::test]
    async fn test_errors_are_results() {
        let tool = tool(Arc::new(MemoryObjectStore::new()));

        let empty = tool.call(call(QUERY_TOOL, json!({"query": "  "}))).await;
        assert!(empty.is_error);

        let missing = tool.call(call(UPLOAD_TOOL, json!({}))).await;
        assert!(missing.is_error);

        let unknown = tool.call(call("shell", json!({}))).await;
        assert!(unknown.is_error);

        // nothing uploaded yet: the corpus has no manifest
        let failed = tool.call(call(QUERY_TOOL, json!({"query": "anything"}))).await;
        assert!(failed.is_error);
        assert!(failed.content.contains("ManifestCorrupt"));
    }

    /// Holds every manifest read open long enough for another writer to start
    struct SlowManifestStore {
        inner: MemoryObjectStore,
    }

    #[async_trait]
    impl ObjectStore for SlowManifestStore {
        fn name(&self) -> &'static str {
            "slow-manifest"
        }

        async fn get(&self, key: &str) -> Result<Vec<u8>> {
            if key.ends_with("manifest.json") {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
            self.inner.put(key, bytes).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_uploads_keep_both_transcripts() {
        let store = Arc::new(SlowManifestStore {
            inner: MemoryObjectStore::new(),
        });
        let tool = QueryTool::new(Arc::new(EngineConfig::default()), store.clone());

        let upload = |session: &str, transcript: &str| UploadArgs {
            transcript: transcript.to_string(),
            session_id: Some(session.to_string()),
            corpus: Some("team".to_string()),
            developer: Some("sam".to_string()),
        };
        let (first, second) = tokio::join!(
            tool.upload(upload("s1", "[USER] first")),
            tool.upload(upload("s2", "[USER] second"))
        );
        first.unwrap();
        let manifest = second.unwrap();
        assert_eq!(manifest.len(), 2);

        let mut text = String::new();
        for segment in &manifest.segments {
            text.push_str(&String::from_utf8(store.inner.get(&segment.key).await.unwrap()).unwrap());
        }
        assert_eq!(text.chars().count(), manifest.total_length());
        assert!(text.contains("[SESSION UPLOAD] s1 | developer=sam"));
        assert!(text.contains("[USER] first"));
        assert!(text.contains("[SESSION UPLOAD] s2 | developer=sam"));
        assert!(text.contains("[USER] second"));
    }

    #[test]
    fn test_header_and_definitions() {
        let header = upload_header("s1", "sam");
        assert!(header.starts_with("[SESSION UPLOAD] s1 | developer=sam | "));

        let names: Vec<String> = QueryTool::definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec![QUERY_TOOL, UPLOAD_TOOL]);
    }
}
