//! # Sandbox Interpreter
//!
//! Executes code blocks against a persistent namespace and a context
//! handle. Primitives (`QUERY`, `QUERY_BATCHED`) go through the broker
//! client; `FINAL` and `FINAL_VAR` signal the executor.
//!
//! Faults in user code never escape `run`: they come back as
//! `ExecutionResult.error` so the reasoning loop can see them. Only a dead
//! broker channel or a depth violation is returned as `Err`.

use crate::channel::BrokerClient;
use crate::context::{clamp_range, ContextHandle, TextBlock};
use crate::corpus::SessionHeader;
use crate::error::{self, Error, ErrorKind, Result};
use crate::namespace::{is_valid_name, value_to_text, BindingsDiff, Namespace};
use crate::opcode::{truncate, Opcode, Program};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

/// Largest list `CHUNK` may produce
pub const MAX_CHUNKS: usize = 10_000;

/// Matching lines a context-wide `GREP` keeps before it stops scanning
pub const MAX_GREP_HITS: usize = 10_000;

/// Session names listed in a `READ_SESSION` fault
const LISTED_SESSIONS: usize = 20;

/// One upload of a session: header line through the next header
#[derive(Debug, Clone)]
struct SessionSpan {
    header: SessionHeader,
    start: usize,
    end: usize,
}

impl SessionSpan {
    fn to_value(&self) -> Value {
        serde_json::json!({
            "session": self.header.session,
            "developer": self.header.developer,
            "uploaded_at": self.header.uploaded_at,
            "start": self.start,
            "end": self.end,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterpreterLimits {
    /// Stdout kept per run, in characters
    pub max_output_chars: usize,
}

impl Default for InterpreterLimits {
    fn default() -> Self {
        Self {
            max_output_chars: 20_000,
        }
    }
}

/// Answer signalled by a code block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "form", rename_all = "snake_case")]
pub enum FinalAnswer {
    Value { value: String },
    Variable { name: String, value: String },
}

impl FinalAnswer {
    pub fn text(&self) -> &str {
        match self {
            FinalAnswer::Value { value } | FinalAnswer::Variable { value, .. } => value,
        }
    }

    fn form(&self) -> &'static str {
        match self {
            FinalAnswer::Value { .. } => "FINAL",
            FinalAnswer::Variable { .. } => "FINAL_VAR",
        }
    }
}

/// Outcome of one `run`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: String,
    /// Fault text when an instruction failed
    pub error: Option<String>,
    pub bindings_diff: BindingsDiff,
    /// Set only for a fault-free block with exactly one finalize
    pub final_answer: Option<FinalAnswer>,
    pub ops_executed: usize,
    pub truncated: bool,
}

impl ExecutionResult {
    /// Result for code that could not run at all
    pub fn fault(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Text fed back to the controlling model
    pub fn to_observation(&self) -> String {
        let mut out = String::new();
        if self.stdout.is_empty() {
            out.push_str("[stdout]\n(no output)\n");
        } else {
            out.push_str("[stdout]\n");
            out.push_str(&self.stdout);
            if !self.stdout.ends_with('\n') {
                out.push('\n');
            }
        }
        if let Some(error) = &self.error {
            out.push_str("[error]\n");
            out.push_str(error);
            out.push('\n');
        }
        if !self.bindings_diff.is_empty() {
            out.push_str("[bindings changed] ");
            out.push_str(&self.bindings_diff.names().join(", "));
            out.push('\n');
        }
        out
    }
}

/// Capped stdout
#[derive(Debug)]
struct Output {
    text: String,
    chars: usize,
    max_chars: usize,
    truncated: bool,
}

impl Output {
    fn new(max_chars: usize) -> Self {
        Self {
            text: String::new(),
            chars: 0,
            max_chars,
            truncated: false,
        }
    }

    fn line(&mut self, line: &str) {
        if self.truncated {
            return;
        }
        let needed = line.chars().count() + 1;
        if self.chars + needed <= self.max_chars {
            self.text.push_str(line);
            self.text.push('\n');
            self.chars += needed;
            return;
        }
        let room = self.max_chars.saturating_sub(self.chars);
        self.text.extend(line.chars().take(room));
        self.text.push_str(&format!("\n... [output truncated at {} chars]\n", self.max_chars));
        self.truncated = true;
    }
}

pub struct Interpreter {
    context: ContextHandle,
    broker: BrokerClient,
    namespace: Namespace,
    limits: InterpreterLimits,
    /// Built on first use; the context never changes under a handle
    sessions: Option<Vec<SessionSpan>>,
}

impl Interpreter {
    pub fn new(context: ContextHandle, broker: BrokerClient, limits: InterpreterLimits) -> Self {
        Self {
            context,
            broker,
            namespace: Namespace::new(),
            limits,
            sessions: None,
        }
    }

    pub fn context(&self) -> &ContextHandle {
        &self.context
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn bindings(&self) -> BTreeMap<String, Value> {
        self.namespace.snapshot()
    }

    /// Execute one code block
    pub async fn run(&mut self, code: &str) -> Result<ExecutionResult> {
        let program = match Program::parse(code) {
            Ok(program) => program,
            Err(err) => return Ok(ExecutionResult::fault(fault_text(&err))),
        };

        let mut out = Output::new(self.limits.max_output_chars);
        let mut finals: Vec<FinalAnswer> = Vec::new();
        let mut fault: Option<String> = None;
        let mut executed = 0;

        for (i, op) in program.code.iter().enumerate() {
            match self.step(op, &mut out).await {
                Ok(answer) => {
                    executed += 1;
                    finals.extend(answer);
                }
                Err(err) if is_fatal(&err) => return Err(err),
                Err(err) => {
                    let (name, _) = op.format_parts();
                    fault = Some(format!("instruction {} ({}): {}", i, name, fault_text(&err)));
                    break;
                }
            }
        }

        let final_answer = match (fault.is_some(), finals.len()) {
            (true, _) | (false, 0) => None,
            (false, 1) => finals.pop(),
            (false, _) => {
                let forms: Vec<&str> = finals.iter().map(FinalAnswer::form).collect();
                let err = error::finalize_conflict(format!(
                    "a code block may finalize only once, got {}",
                    forms.join(" and ")
                ));
                fault = Some(fault_text(&err));
                None
            }
        };

        debug!(
            ops = executed,
            failed = fault.is_some(),
            finalized = final_answer.is_some(),
            "code block executed"
        );

        Ok(ExecutionResult {
            stdout: out.text,
            error: fault,
            bindings_diff: self.namespace.take_diff(),
            final_answer,
            ops_executed: executed,
            truncated: out.truncated,
        })
    }

    async fn step(&mut self, op: &Opcode, out: &mut Output) -> Result<Option<FinalAnswer>> {
        match op {
            Opcode::ContextLen { store_to } => {
                let length = self.context.length().await?;
                self.namespace.set(store_to.as_str(), Value::from(length))?;
            }

            Opcode::Slice { start, end, store_to } => {
                let end = match end {
                    Some(end) => *end,
                    None => self.context.length().await?,
                };
                let text = self.context.slice(*start, end).await?;
                self.namespace.set(store_to.as_str(), Value::String(text))?;
            }

            Opcode::Chunk { source, size, overlap, store_to } => {
                let chunks = match source {
                    None => self.chunk_context(*size, *overlap).await?,
                    Some(name) => {
                        let text = self.text_of(name)?;
                        let chars: Vec<char> = text.chars().collect();
                        chunk_ranges(chars.len(), *size, *overlap)?
                            .into_iter()
                            .map(|(a, b)| chars[a..b].iter().collect::<String>())
                            .collect()
                    }
                };
                let list = chunks.into_iter().map(Value::String).collect();
                self.namespace.set(store_to.as_str(), Value::Array(list))?;
            }

            Opcode::Sessions { store_to } => {
                let sessions: Vec<Value> = self.sessions().await?.iter().map(SessionSpan::to_value).collect();
                self.namespace.set(store_to.as_str(), Value::Array(sessions))?;
            }

            Opcode::ReadSession { session, store_to } => {
                let session = self.interpolate(session);
                let spans: Vec<(usize, usize)> = self
                    .sessions()
                    .await?
                    .iter()
                    .filter(|span| span.header.session == session)
                    .map(|span| (span.start, span.end))
                    .collect();
                if spans.is_empty() {
                    return Err(self.unknown_session(&session));
                }
                let mut text = String::new();
                for (start, end) in spans {
                    text.push_str(&self.context.slice(start, end).await?);
                }
                self.namespace.set(store_to.as_str(), Value::String(text))?;
            }

            Opcode::Set { name, value } => {
                let value = self.interpolate_value(value);
                self.namespace.set(name.as_str(), value)?;
            }

            Opcode::Len { source, store_to } => {
                let length = match self.namespace.require(source)? {
                    Value::String(s) => s.chars().count(),
                    Value::Array(items) => items.len(),
                    Value::Object(map) => map.len(),
                    other => {
                        return Err(error::sandbox_fault(format!(
                            "'{}' has no length ({})",
                            source,
                            type_name(other)
                        )))
                    }
                };
                self.namespace.set(store_to.as_str(), Value::from(length))?;
            }

            Opcode::Substr { source, start, end, store_to } => {
                let text = self.text_of(source)?;
                let length = text.chars().count();
                let (a, b) = clamp_range(*start, end.unwrap_or(length), length);
                let piece: String = text.chars().skip(a).take(b - a).collect();
                self.namespace.set(store_to.as_str(), Value::String(piece))?;
            }

            Opcode::Split { source, separator, store_to } => {
                if separator.is_empty() {
                    return Err(error::sandbox_fault("SPLIT separator must not be empty"));
                }
                let parts = self
                    .text_of(source)?
                    .split(separator.as_str())
                    .map(|p| Value::String(p.to_string()))
                    .collect();
                self.namespace.set(store_to.as_str(), Value::Array(parts))?;
            }

            Opcode::Join { source, separator, store_to } => {
                let items = self.list_of(source)?;
                let joined = items.iter().map(value_to_text).collect::<Vec<_>>().join(separator);
                self.namespace.set(store_to.as_str(), Value::String(joined))?;
            }

            Opcode::Grep { source, pattern, ignore_case, store_to } => {
                let re = RegexBuilder::new(pattern)
                    .case_insensitive(*ignore_case)
                    .build()
                    .map_err(|e| error::sandbox_fault(format!("invalid pattern: {}", e)))?;
                let matches: Vec<Value> = match source {
                    Some(name) => self
                        .text_of(name)?
                        .lines()
                        .filter(|line| re.is_match(line))
                        .map(|line| Value::String(line.to_string()))
                        .collect(),
                    None => {
                        let hits = self.grep_context(&re).await?;
                        if hits.len() >= MAX_GREP_HITS {
                            out.line(&format!(
                                "GREP: stopped after {} matching lines; narrow the pattern",
                                MAX_GREP_HITS
                            ));
                        }
                        hits.into_iter().map(Value::String).collect()
                    }
                };
                self.namespace.set(store_to.as_str(), Value::Array(matches))?;
            }

            Opcode::Index { source, index, store_to } => {
                let items = self.list_of(source)?;
                let len = items.len() as i64;
                let position = if *index < 0 { len + index } else { *index };
                if position < 0 || position >= len {
                    return Err(error::sandbox_fault(format!(
                        "index {} out of range for '{}' ({} items)",
                        index, source, len
                    )));
                }
                let item = items[position as usize].clone();
                self.namespace.set(store_to.as_str(), item)?;
            }

            Opcode::Delete { name } => {
                self.namespace.remove(name)?;
            }

            Opcode::Print { value } => {
                let text = value_to_text(&self.interpolate_value(value));
                for line in text.split('\n') {
                    out.line(line);
                }
            }

            Opcode::ShowVars => {
                if self.namespace.is_empty() {
                    out.line("(no variables)");
                }
                for (name, value) in self.namespace.snapshot() {
                    out.line(&format!("{}: {}", name, describe(&value)));
                }
            }

            Opcode::Query { prompt, model, store_to } => {
                let prompt = self.interpolate(prompt);
                let text = self.broker.query(prompt, model.clone()).await?;
                self.namespace.set(store_to.as_str(), Value::String(text))?;
            }

            Opcode::QueryBatched { prompts, over, template, model, store_to } => {
                let prompts = self.batch_prompts(prompts, over.as_deref(), template.as_deref())?;
                let total = prompts.len();
                let results = self.broker.batched_query(prompts, model.clone()).await?;

                let mut failed = 0;
                let slots = results
                    .into_iter()
                    .map(|slot| match slot {
                        Ok(text) => Value::String(text),
                        Err(message) => {
                            failed += 1;
                            Value::String(format!("ERROR: {}", message))
                        }
                    })
                    .collect();
                self.namespace.set(store_to.as_str(), Value::Array(slots))?;
                if failed > 0 {
                    out.line(&format!(
                        "QUERY_BATCHED: {} of {} prompts failed (see '{}')",
                        failed, total, store_to
                    ));
                }
            }

            Opcode::Final { value } => {
                let value = value_to_text(&self.interpolate_value(value));
                return Ok(Some(FinalAnswer::Value { value }));
            }

            Opcode::FinalVar { name } => {
                let value = value_to_text(self.namespace.require(name)?);
                return Ok(Some(FinalAnswer::Variable {
                    name: name.clone(),
                    value,
                }));
            }
        }
        Ok(None)
    }

    /// One read of the context, cut in memory; every segment is fetched once
    async fn chunk_context(&self, size: usize, overlap: usize) -> Result<Vec<String>> {
        let length = self.context.length().await?;
        let ranges = chunk_ranges(length, size, overlap)?;
        let text = TextBlock::new(self.context.slice(0, length).await?);
        Ok(ranges
            .into_iter()
            .map(|(a, b)| text.slice_chars(a, b).to_string())
            .collect())
    }

    /// Visit every line of the context with its character offset, reading
    /// one window at a time. `visit` returns false to stop early.
    async fn scan_context<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(usize, &str) -> bool,
    {
        let mut carry = String::new();
        let mut carry_start = 0;
        for (start, end) in self.context.windows().await? {
            carry.push_str(&self.context.slice(start, end).await?);

            let mut offset = carry_start;
            let mut consumed = 0;
            while let Some(newline) = carry[consumed..].find('\n') {
                let line = &carry[consumed..consumed + newline];
                if !visit(offset, line) {
                    return Ok(());
                }
                offset += line.chars().count() + 1;
                consumed += newline + 1;
            }
            carry.drain(..consumed);
            carry_start = offset;
        }
        if !carry.is_empty() {
            visit(carry_start, &carry);
        }
        Ok(())
    }

    async fn grep_context(&self, re: &Regex) -> Result<Vec<String>> {
        let mut hits = Vec::new();
        self.scan_context(|_, line| {
            if re.is_match(line) {
                hits.push(line.to_string());
            }
            hits.len() < MAX_GREP_HITS
        })
        .await?;
        Ok(hits)
    }

    async fn sessions(&mut self) -> Result<&[SessionSpan]> {
        if self.sessions.is_none() {
            let length = self.context.length().await?;
            let mut spans: Vec<SessionSpan> = Vec::new();
            self.scan_context(|offset, line| {
                if let Some(header) = SessionHeader::parse(line) {
                    if let Some(previous) = spans.last_mut() {
                        previous.end = offset;
                    }
                    spans.push(SessionSpan {
                        header,
                        start: offset,
                        end: length,
                    });
                }
                true
            })
            .await?;
            debug!(sessions = spans.len(), "session index built");
            self.sessions = Some(spans);
        }
        Ok(self.sessions.as_deref().unwrap_or(&[]))
    }

    fn unknown_session(&self, session: &str) -> Error {
        let mut names: Vec<&str> = Vec::new();
        for span in self.sessions.as_deref().unwrap_or(&[]) {
            if !names.contains(&span.header.session.as_str()) {
                names.push(&span.header.session);
            }
        }
        let listed = if names.is_empty() {
            "(none)".to_string()
        } else if names.len() > LISTED_SESSIONS {
            format!("{}, ... ({} in all)", names[..LISTED_SESSIONS].join(", "), names.len())
        } else {
            names.join(", ")
        };
        error::sandbox_fault(format!("session '{}' not found; sessions: {}", session, listed))
    }

    fn batch_prompts(&self, prompts: &[String], over: Option<&str>, template: Option<&str>) -> Result<Vec<String>> {
        match over {
            Some(_) if !prompts.is_empty() => Err(error::sandbox_fault(
                "QUERY_BATCHED takes either 'prompts' or 'over', not both",
            )),
            Some(name) => {
                let template = template.unwrap_or("{item}");
                let items = self.list_of(name)?;
                Ok(items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| {
                        let filled = template
                            .replace("{item}", &value_to_text(item))
                            .replace("{index}", &i.to_string());
                        self.interpolate(&filled)
                    })
                    .collect())
            }
            None => Ok(prompts.iter().map(|p| self.interpolate(p)).collect()),
        }
    }

    fn text_of(&self, name: &str) -> Result<String> {
        match self.namespace.require(name)? {
            Value::String(s) => Ok(s.clone()),
            other => Err(error::sandbox_fault(format!(
                "'{}' is {}, expected a string",
                name,
                type_name(other)
            ))),
        }
    }

    fn list_of(&self, name: &str) -> Result<Vec<Value>> {
        match self.namespace.require(name)? {
            Value::Array(items) => Ok(items.clone()),
            other => Err(error::sandbox_fault(format!(
                "'{}' is {}, expected a list",
                name,
                type_name(other)
            ))),
        }
    }

    /// Replace `{name}` with the text of bound names; unknown names stay literal
    fn interpolate(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let close = match after.find('}') {
                Some(close) => close,
                None => {
                    rest = &rest[open..];
                    break;
                }
            };
            let name = &after[..close];
            match self.namespace.get(name).filter(|_| is_valid_name(name)) {
                Some(value) => {
                    out.push_str(&value_to_text(value));
                    rest = &after[close + 1..];
                }
                None => {
                    out.push('{');
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        out
    }

    fn interpolate_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.interpolate(s)),
            other => other.clone(),
        }
    }
}

/// `[start, end)` windows of `size` characters, consecutive windows sharing `overlap`
pub fn chunk_ranges(length: usize, size: usize, overlap: usize) -> Result<Vec<(usize, usize)>> {
    if size == 0 {
        return Err(error::sandbox_fault("chunk size must be positive"));
    }
    if overlap >= size {
        return Err(error::sandbox_fault(format!(
            "overlap {} must be smaller than chunk size {}",
            overlap, size
        )));
    }

    let stride = size - overlap;
    let mut ranges = Vec::new();
    let mut start = 0;
    while start < length {
        if ranges.len() >= MAX_CHUNKS {
            return Err(error::sandbox_fault(format!(
                "more than {} chunks; use a larger size",
                MAX_CHUNKS
            )));
        }
        let end = (start + size).min(length);
        ranges.push((start, end));
        if end == length {
            break;
        }
        start += stride;
    }
    Ok(ranges)
}

/// Errors that end the executor rather than becoming observations
fn is_fatal(err: &Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::ChannelClosed | ErrorKind::DepthExceeded | ErrorKind::SandboxUnavailable
    )
}

fn fault_text(err: &Error) -> String {
    format!("{}: {}", err.kind(), err.message())
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a bool",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::String(s) => format!("str({} chars) \"{}\"", s.chars().count(), truncate(s, 40)),
        Value::Array(items) => format!("list({} items)", items.len()),
        Value::Object(map) => format!("object({} keys)", map.len()),
        other => other.to_string(),
    }
}
