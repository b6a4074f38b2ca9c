//! # deeprecurse VM
//!
//! Leaf machinery of the recursive execution engine.
//!
//! ## Core Concepts
//! - **Context handles**: `length()`/`slice()` over an in-memory buffer or a segmented object store
//! - **Sandbox**: a stateful interpreter for model-written code blocks
//! - **Broker channel**: correlation-id envelopes between a sandbox and its broker
//! - **Backends**: trait-based model communication (OpenAI-compatible)
//! - **Retry**: bounded, timed, exponential backoff for every remote call

pub mod channel;
pub mod context;
pub mod corpus;
pub mod error;
pub mod interpreter;
pub mod namespace;
pub mod opcode;
pub mod provider;
pub mod retry;
pub mod sandbox;
pub mod schema;
pub mod store;

pub use channel::{
    broker_channel, BrokerClient, BrokerEndpoint, PendingTable, RequestKind, SlotResult,
    SubOutcome, SubRequest, SubResponse,
};
pub use context::{
    manifest_key, segment_key, ContextHandle, ContextKind, Manifest, PrefetchPolicy,
    SegmentDescriptor, SegmentedConfig, SegmentedContext, TextBlock,
};
pub use corpus::{split_segments, CorpusWriter, SessionHeader, DEFAULT_SEGMENT_CHARS, SESSION_HEADER_PREFIX};
pub use error::{Error, ErrorKind, ErrorStatus, Result};
pub use interpreter::{ExecutionResult, FinalAnswer, Interpreter, InterpreterLimits};
pub use namespace::{BindingsDiff, Namespace};
pub use opcode::{Opcode, Program};
pub use provider::{
    complete_with_retry, ChatMessage, CompletionRequest, CompletionResponse, FinishReason,
    LlmBackend, OpenAIBackend, ProviderConfig, ProviderType, Role, Usage, UsageTracker,
};
pub use retry::{retry, RetryPolicy};
pub use sandbox::{build_sandbox, HostedSandbox, InProcessSandbox, Sandbox, SandboxKind};
pub use schema::{SandboxSchema, TaskPrompt};
pub use store::{FileObjectStore, HttpObjectStore, MemoryObjectStore, ObjectStore};
