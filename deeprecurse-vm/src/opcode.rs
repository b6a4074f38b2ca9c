//! # Sandbox Instruction Set
//!
//! Code blocks the controlling model writes are JSON programs over this
//! instruction set. Instructions run in order against the sandbox
//! namespace and the context handle.
//!
//! ## Groups
//! - Context access: `CONTEXT_LEN`, `SLICE`, `CHUNK`, `SESSIONS`, `READ_SESSION`
//! - Binding manipulation: `SET`, `LEN`, `SUBSTR`, `SPLIT`, `JOIN`, `GREP`, `INDEX`, `DELETE`
//!
//! `GREP` without a `source` searches the context itself, one segment at a time.
//! - Output: `PRINT`, `SHOW_VARS`
//! - Primitives: `QUERY`, `QUERY_BATCHED`, `FINAL`, `FINAL_VAR`

use crate::error::{self, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One sandbox instruction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Opcode {
    // =========================================================================
    // CONTEXT ACCESS
    // =========================================================================

    /// Bind the context length in characters
    ContextLen { store_to: String },

    /// Bind `context[start..end]`; `end` defaults to the context length
    Slice {
        start: usize,
        #[serde(default)]
        end: Option<usize>,
        store_to: String,
    },

    /// Split a binding (or the whole context) into a list of chunks
    Chunk {
        /// Binding to chunk; absent means the whole context
        #[serde(default)]
        source: Option<String>,
        /// Chunk size in characters
        size: usize,
        /// Characters shared by consecutive chunks
        #[serde(default)]
        overlap: usize,
        store_to: String,
    },

    /// Bind the uploaded sessions found in the context, in corpus order
    Sessions { store_to: String },

    /// Bind the full text of one session (every upload of it, in order)
    ReadSession { session: String, store_to: String },

    // =========================================================================
    // BINDINGS
    // =========================================================================

    Set { name: String, value: Value },

    /// Length of a string (characters) or list (items)
    Len { source: String, store_to: String },

    Substr {
        source: String,
        start: usize,
        #[serde(default)]
        end: Option<usize>,
        store_to: String,
    },

    Split {
        source: String,
        separator: String,
        store_to: String,
    },

    Join {
        source: String,
        separator: String,
        store_to: String,
    },

    /// Lines matching a regex, from a binding or from the whole context
    Grep {
        #[serde(default)]
        source: Option<String>,
        pattern: String,
        #[serde(default)]
        ignore_case: bool,
        store_to: String,
    },

    /// List element; negative indexes count from the end
    Index {
        source: String,
        index: i64,
        store_to: String,
    },

    Delete { name: String },

    // =========================================================================
    // OUTPUT
    // =========================================================================

    Print { value: Value },

    ShowVars,

    // =========================================================================
    // PRIMITIVES
    // =========================================================================

    /// Single sub-request through the broker
    Query {
        prompt: String,
        #[serde(default)]
        model: Option<String>,
        store_to: String,
    },

    /// Concurrent sub-requests; results keep input order
    QueryBatched {
        #[serde(default)]
        prompts: Vec<String>,
        /// List binding mapped through `template`
        #[serde(default)]
        over: Option<String>,
        /// Prompt template with `{item}` and `{index}` placeholders
        #[serde(default)]
        template: Option<String>,
        #[serde(default)]
        model: Option<String>,
        store_to: String,
    },

    /// Finish with a literal value
    Final { value: Value },

    /// Finish with the current value of a binding
    FinalVar { name: String },
}

impl Opcode {
    /// Check if this opcode finishes the executor loop
    pub fn is_terminal(&self) -> bool {
        matches!(self, Opcode::Final { .. } | Opcode::FinalVar { .. })
    }

    /// Check if this opcode goes through the broker
    pub fn is_query(&self) -> bool {
        matches!(self, Opcode::Query { .. } | Opcode::QueryBatched { .. })
    }

    /// Check if this opcode reads the context handle
    pub fn reads_context(&self) -> bool {
        matches!(
            self,
            Opcode::ContextLen { .. }
                | Opcode::Slice { .. }
                | Opcode::Chunk { source: None, .. }
                | Opcode::Grep { source: None, .. }
                | Opcode::Sessions { .. }
                | Opcode::ReadSession { .. }
        )
    }

    /// Binding this opcode writes, if any
    pub fn writes(&self) -> Option<&str> {
        match self {
            Opcode::ContextLen { store_to }
            | Opcode::Slice { store_to, .. }
            | Opcode::Chunk { store_to, .. }
            | Opcode::Sessions { store_to }
            | Opcode::ReadSession { store_to, .. }
            | Opcode::Len { store_to, .. }
            | Opcode::Substr { store_to, .. }
            | Opcode::Split { store_to, .. }
            | Opcode::Join { store_to, .. }
            | Opcode::Grep { store_to, .. }
            | Opcode::Index { store_to, .. }
            | Opcode::Query { store_to, .. }
            | Opcode::QueryBatched { store_to, .. } => Some(store_to.as_str()),
            Opcode::Set { name, .. } => Some(name.as_str()),
            _ => None,
        }
    }

    /// Format opcode into (name, details) for listings
    pub fn format_parts(&self) -> (&'static str, String) {
        match self {
            Opcode::ContextLen { store_to } => ("CONTEXT_LEN", format!("→ {}", store_to)),
            Opcode::Slice { start, end, store_to } => {
                let end = end.map(|e| e.to_string()).unwrap_or_default();
                ("SLICE", format!("[{}..{}] → {}", start, end, store_to))
            }
            Opcode::Chunk { source, size, overlap, store_to } => {
                let source = source.as_deref().unwrap_or("context");
                ("CHUNK", format!("{} / {} (+{}) → {}", source, size, overlap, store_to))
            }
            Opcode::Sessions { store_to } => ("SESSIONS", format!("→ {}", store_to)),
            Opcode::ReadSession { session, store_to } => {
                ("READ_SESSION", format!("{} → {}", truncate(session, 25), store_to))
            }
            Opcode::Set { name, value } => ("SET", format!("{} = {}", name, format_value_brief(value))),
            Opcode::Len { source, store_to } => ("LEN", format!("{} → {}", source, store_to)),
            Opcode::Substr { source, start, end, store_to } => {
                let end = end.map(|e| e.to_string()).unwrap_or_default();
                ("SUBSTR", format!("{}[{}..{}] → {}", source, start, end, store_to))
            }
            Opcode::Split { source, separator, store_to } => {
                ("SPLIT", format!("{} by {:?} → {}", source, separator, store_to))
            }
            Opcode::Join { source, separator, store_to } => {
                ("JOIN", format!("{} with {:?} → {}", source, separator, store_to))
            }
            Opcode::Grep { source, pattern, ignore_case, store_to } => {
                let flag = if *ignore_case { "/i" } else { "" };
                let source = source.as_deref().unwrap_or("context");
                ("GREP", format!("/{}/{} in {} → {}", truncate(pattern, 25), flag, source, store_to))
            }
            Opcode::Index { source, index, store_to } => {
                ("INDEX", format!("{}[{}] → {}", source, index, store_to))
            }
            Opcode::Delete { name } => ("DELETE", name.clone()),
            Opcode::Print { value } => ("PRINT", format_value_brief(value)),
            Opcode::ShowVars => ("SHOW_VARS", String::new()),
            Opcode::Query { prompt, model, store_to } => {
                let model = model.as_ref().map(|m| format!(" @{}", m)).unwrap_or_default();
                ("QUERY", format!("\"{}\"{} → {}", truncate(prompt, 25), model, store_to))
            }
            Opcode::QueryBatched { prompts, over, template, store_to, .. } => {
                let what = match (over, template) {
                    (Some(over), Some(template)) => format!("\"{}\" over {}", truncate(template, 20), over),
                    (Some(over), None) => format!("over {}", over),
                    _ => format!("{} prompts", prompts.len()),
                };
                ("QUERY_BATCHED", format!("{} → {}", what, store_to))
            }
            Opcode::Final { value } => ("FINAL", format_value_brief(value)),
            Opcode::FinalVar { name } => ("FINAL_VAR", name.clone()),
        }
    }
}

/// A parsed code block
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub code: Vec<Opcode>,
}

impl Program {
    pub fn new(code: Vec<Opcode>) -> Self {
        Self { code }
    }

    /// Parse a code block: a JSON array of instructions, a single
    /// instruction object, or `{"code": [...]}`.
    pub fn parse(source: &str) -> Result<Self> {
        let source = source.trim();
        if source.is_empty() {
            return Err(error::parse_error("empty code block"));
        }

        let value: Value = serde_json::from_str(source)
            .map_err(|e| error::parse_error(format!("code block is not valid JSON: {}", e)))?;

        let code = match value {
            Value::Array(items) => items
                .into_iter()
                .enumerate()
                .map(|(i, item)| parse_opcode(item, i))
                .collect::<Result<Vec<_>>>()?,
            Value::Object(mut map) => match map.remove("code") {
                Some(Value::Array(items)) => items
                    .into_iter()
                    .enumerate()
                    .map(|(i, item)| parse_opcode(item, i))
                    .collect::<Result<Vec<_>>>()?,
                Some(_) => return Err(error::parse_error("\"code\" must be an array of instructions")),
                None => vec![parse_opcode(Value::Object(map), 0)?],
            },
            _ => return Err(error::parse_error("code block must be an instruction or a list of instructions")),
        };

        Ok(Self { code })
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Numbered listing, one instruction per line
    pub fn listing(&self) -> String {
        self.code
            .iter()
            .enumerate()
            .map(|(i, op)| {
                let (name, details) = op.format_parts();
                if details.is_empty() {
                    format!("{:3} | {}", i, name)
                } else {
                    format!("{:3} | {} {}", i, name, details)
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn parse_opcode(item: Value, position: usize) -> Result<Opcode> {
    let name = item
        .get("op")
        .and_then(Value::as_str)
        .unwrap_or("?")
        .to_string();
    serde_json::from_value(item).map_err(|e| {
        error::parse_error(format!("instruction {} ({}): {}", position, name, e))
            .with_context("instruction", position.to_string())
    })
}

/// Shorten `s` to at most `max` characters
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", kept)
    }
}

fn format_value_brief(v: &Value) -> String {
    match v {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("\"{}\"", truncate(s, 20)),
        Value::Array(a) => format!("[{} items]", a.len()),
        Value::Object(o) => {
            let keys: Vec<_> = o.keys().take(3).cloned().collect();
            if keys.len() < o.len() {
                format!("{{{}, …}}", keys.join(", "))
            } else {
                format!("{{{}}}", keys.join(", "))
            }
        }
    }
}
