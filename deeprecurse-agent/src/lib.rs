//! # deeprecurse Agent
//!
//! The recursive reasoning loop on top of the VM:
//! 1. A root executor receives a question and a context handle
//! 2. Its model writes code blocks; the sandbox runs them
//! 3. Sub-queries go to the executor's broker
//! 4. The broker answers them directly or with child executors, by depth
//! 5. The loop ends on a finalize, the iteration budget, or a fault
//!
//! The model plans, the sandbox reads, the broker delegates.

mod broker;
mod config;
mod executor;
mod response;
mod tool;

pub use broker::ChildRecord;
pub use config::{BackendConfig, ContextConfig, EngineConfig, SandboxConfig, StoreConfig, StoreKind};
pub use executor::{
    ErrorPayload, ExecutionStats, Executor, ExecutorState, FinalResult, Outcome, TranscriptEntry,
};
pub use response::{extract_code_blocks, find_text_final, TextFinal};
pub use tool::{
    upload_header, QueryArgs, QueryTool, ToolCall, ToolDefinition, ToolResult, UploadArgs,
    DEFAULT_CORPUS, QUERY_TOOL, UPLOAD_TOOL,
};
