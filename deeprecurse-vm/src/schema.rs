//! # Sandbox Schema for Code Generation
//!
//! Structured description of the sandbox instruction set, rendered into the
//! prompts the controlling model sees. The model reads this to write code
//! blocks that inspect the context through slices and sub-queries instead
//! of reading it whole.

use serde::{Deserialize, Serialize};

/// Everything a model needs to know to write code blocks
#[derive(Debug, Clone, Serialize)]
pub struct SandboxSchema {
    pub version: &'static str,
    pub description: &'static str,
    pub opcodes: Vec<OpcodeCategory>,
    pub execution: ExecutionModel,
    pub guidelines: Vec<Guideline>,
}

impl Default for SandboxSchema {
    fn default() -> Self {
        Self::new()
    }
}

impl SandboxSchema {
    pub fn new() -> Self {
        Self {
            version: "0.1.0",
            description: "A stateful sandbox holding a (possibly huge) text context. You never \
                         see the context directly: write code blocks that slice it, search it, \
                         and delegate reading to sub-queries, then finalize an answer.",
            opcodes: Self::define_opcodes(),
            execution: ExecutionModel::default(),
            guidelines: Self::define_guidelines(),
        }
    }

    /// Render as a prompt-friendly string
    pub fn to_prompt(&self) -> String {
        let mut out = String::new();

        out.push_str("# Sandbox Reference\n\n");
        out.push_str(self.description);
        out.push_str("\n\n## Execution\n\n");
        out.push_str(self.execution.description);
        out.push('\n');
        for step in &self.execution.flow {
            out.push_str(step);
            out.push('\n');
        }
        out.push('\n');

        out.push_str("## Instructions\n\n");
        for category in &self.opcodes {
            out.push_str(&format!("### {}\n", category.name));
            out.push_str(&format!("{}\n\n", category.description));
            for op in &category.opcodes {
                out.push_str(&format!("- **{}**: {}\n", op.name, op.description));
                if !op.params.is_empty() {
                    out.push_str(&format!("  - Params: {}\n", op.params.join(", ")));
                }
                if let Some(example) = &op.example {
                    out.push_str(&format!("  - Example: `{}`\n", example));
                }
            }
            out.push('\n');
        }

        out.push_str("## Guidelines\n\n");
        for g in &self.guidelines {
            out.push_str(&format!("### {}\n{}\n\n", g.title, g.content));
        }

        out
    }

    /// Render as JSON for structured consumption
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    fn define_opcodes() -> Vec<OpcodeCategory> {
        vec![
            OpcodeCategory {
                name: "Context",
                description: "Read the context by character offsets. Out-of-range offsets are clamped.",
                opcodes: vec![
                    OpcodeSpec {
                        name: "CONTEXT_LEN",
                        description: "Bind the context length in characters",
                        params: vec!["store_to: string"],
                        example: Some(r#"{"op": "CONTEXT_LEN", "store_to": "n"}"#),
                    },
                    OpcodeSpec {
                        name: "SLICE",
                        description: "Bind context[start..end] (end defaults to the end)",
                        params: vec!["start: number", "end?: number", "store_to: string"],
                        example: Some(r#"{"op": "SLICE", "start": 0, "end": 2000, "store_to": "head"}"#),
                    },
                    OpcodeSpec {
                        name: "CHUNK",
                        description: "Split a binding, or the whole context when source is absent, into a list",
                        params: vec!["source?: string", "size: number", "overlap?: number", "store_to: string"],
                        example: Some(r#"{"op": "CHUNK", "size": 50000, "store_to": "chunks"}"#),
                    },
                    OpcodeSpec {
                        name: "SESSIONS",
                        description: "List uploaded sessions as {session, developer, uploaded_at, start, end}",
                        params: vec!["store_to: string"],
                        example: Some(r#"{"op": "SESSIONS", "store_to": "sessions"}"#),
                    },
                    OpcodeSpec {
                        name: "READ_SESSION",
                        description: "Bind the full text of one session's uploads",
                        params: vec!["session: string", "store_to: string"],
                        example: Some(r#"{"op": "READ_SESSION", "session": "auth-rework", "store_to": "transcript"}"#),
                    },
                ],
            },
            OpcodeCategory {
                name: "Bindings",
                description: "Variables persist across code blocks. Strings interpolate {name}.",
                opcodes: vec![
                    OpcodeSpec {
                        name: "SET",
                        description: "Bind a value",
                        params: vec!["name: string", "value: any"],
                        example: Some(r#"{"op": "SET", "name": "question", "value": "Why {topic}?"}"#),
                    },
                    OpcodeSpec {
                        name: "LEN",
                        description: "Length of a string or list",
                        params: vec!["source: string", "store_to: string"],
                        example: Some(r#"{"op": "LEN", "source": "chunks", "store_to": "count"}"#),
                    },
                    OpcodeSpec {
                        name: "SUBSTR",
                        description: "Characters of a string binding",
                        params: vec!["source: string", "start: number", "end?: number", "store_to: string"],
                        example: Some(r#"{"op": "SUBSTR", "source": "head", "start": 0, "end": 100, "store_to": "intro"}"#),
                    },
                    OpcodeSpec {
                        name: "SPLIT",
                        description: "Split a string into a list",
                        params: vec!["source: string", "separator: string", "store_to: string"],
                        example: Some(r#"{"op": "SPLIT", "source": "head", "separator": "\n---\n", "store_to": "turns"}"#),
                    },
                    OpcodeSpec {
                        name: "JOIN",
                        description: "Join a list into a string",
                        params: vec!["source: string", "separator: string", "store_to: string"],
                        example: Some(r#"{"op": "JOIN", "source": "notes", "separator": "\n", "store_to": "all_notes"}"#),
                    },
                    OpcodeSpec {
                        name: "GREP",
                        description: "Lines matching a regex, from a string binding or the whole context when source is absent",
                        params: vec!["source?: string", "pattern: string", "ignore_case?: bool", "store_to: string"],
                        example: Some(r#"{"op": "GREP", "source": "head", "pattern": "postgres|redis", "ignore_case": true, "store_to": "hits"}"#),
                    },
                    OpcodeSpec {
                        name: "INDEX",
                        description: "One list element; negative counts from the end",
                        params: vec!["source: string", "index: number", "store_to: string"],
                        example: Some(r#"{"op": "INDEX", "source": "chunks", "index": -1, "store_to": "last"}"#),
                    },
                    OpcodeSpec {
                        name: "DELETE",
                        description: "Remove a binding",
                        params: vec!["name: string"],
                        example: Some(r#"{"op": "DELETE", "name": "head"}"#),
                    },
                ],
            },
            OpcodeCategory {
                name: "Output",
                description: "Printed text is returned to you after the block runs (truncated when long).",
                opcodes: vec![
                    OpcodeSpec {
                        name: "PRINT",
                        description: "Print a value",
                        params: vec!["value: any"],
                        example: Some(r#"{"op": "PRINT", "value": "found {count} chunks"}"#),
                    },
                    OpcodeSpec {
                        name: "SHOW_VARS",
                        description: "List current bindings",
                        params: vec![],
                        example: Some(r#"{"op": "SHOW_VARS"}"#),
                    },
                ],
            },
            OpcodeCategory {
                name: "Sub-queries",
                description: "Delegate reading to sub-models. Batched prompts run concurrently and keep their order; \
                             failed slots hold \"ERROR: ...\".",
                opcodes: vec![
                    OpcodeSpec {
                        name: "QUERY",
                        description: "Ask a sub-model one prompt",
                        params: vec!["prompt: string", "model?: string", "store_to: string"],
                        example: Some(r#"{"op": "QUERY", "prompt": "Summarize:\n{head}", "store_to": "summary"}"#),
                    },
                    OpcodeSpec {
                        name: "QUERY_BATCHED",
                        description: "Ask many prompts at once, or map a template over a list with {item} and {index}",
                        params: vec!["prompts?: string[]", "over?: string", "template?: string", "model?: string", "store_to: string"],
                        example: Some(r#"{"op": "QUERY_BATCHED", "over": "chunks", "template": "Chunk {index}: what database decisions are made?\n{item}", "store_to": "notes"}"#),
                    },
                ],
            },
            OpcodeCategory {
                name: "Finish",
                description: "Use exactly one of these, once, in the block that answers.",
                opcodes: vec![
                    OpcodeSpec {
                        name: "FINAL",
                        description: "Answer with a literal value",
                        params: vec!["value: any"],
                        example: Some(r#"{"op": "FINAL", "value": "They chose Postgres for jsonb."}"#),
                    },
                    OpcodeSpec {
                        name: "FINAL_VAR",
                        description: "Answer with the value of a binding",
                        params: vec!["name: string"],
                        example: Some(r#"{"op": "FINAL_VAR", "name": "summary"}"#),
                    },
                ],
            },
        ]
    }

    fn define_guidelines() -> Vec<Guideline> {
        vec![
            Guideline {
                title: "Code Blocks",
                content: "Write each block as a JSON array of instructions inside a ```repl fence. \
                         One block per reply. You see its output before writing the next one.",
            },
            Guideline {
                title: "Context Window Management",
                content: "Never print the whole context. Check CONTEXT_LEN first, look at small \
                         SLICEs, and use CHUNK with QUERY_BATCHED to read large ranges through sub-models.",
            },
            Guideline {
                title: "Searching Transcripts",
                content: "An uploaded corpus starts each session with a [SESSION UPLOAD] line. Use SESSIONS \
                         to see what exists, GREP without a source to find lines anywhere, and READ_SESSION \
                         to pull one session in full.",
            },
            Guideline {
                title: "Errors",
                content: "A failing instruction stops the block, keeps earlier effects, and reports \
                         the fault. Fix the cause and continue.",
            },
            Guideline {
                title: "Finishing",
                content: "Finish with FINAL or FINAL_VAR in a block that otherwise succeeds. A plain \
                         line FINAL(answer) or FINAL_VAR(name) outside code fences also finishes.",
            },
        ]
    }
}

/// A category of instructions
#[derive(Debug, Clone, Serialize)]
pub struct OpcodeCategory {
    pub name: &'static str,
    pub description: &'static str,
    pub opcodes: Vec<OpcodeSpec>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OpcodeSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub params: Vec<&'static str>,
    pub example: Option<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionModel {
    pub description: &'static str,
    pub flow: Vec<&'static str>,
}

impl Default for ExecutionModel {
    fn default() -> Self {
        Self {
            description: "You work in turns. Each turn you reply with one code block; the sandbox runs it and \
                         shows you what happened.",
            flow: vec![
                "1. Reply with a ```repl block",
                "2. Instructions run in order against persistent bindings",
                "3. You receive stdout, any fault, and the changed bindings",
                "4. Repeat until FINAL or FINAL_VAR",
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Guideline {
    pub title: &'static str,
    pub content: &'static str,
}

// ============================================================================
// Task Prompt - what the executor asks
// ============================================================================

/// The question plus what the executor knows about its situation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPrompt {
    pub query: String,
    /// `buffer` or `segmented`
    pub context_kind: String,
    pub context_length: usize,
    pub depth: usize,
    pub max_depth: usize,
    pub max_iterations: usize,
}

impl TaskPrompt {
    /// System message: the sandbox reference
    pub fn system_prompt(&self, schema: &SandboxSchema) -> String {
        let mut out = String::new();
        out.push_str("You answer questions about a large context by writing code for a sandbox.\n\n");
        out.push_str(&schema.to_prompt());
        if self.depth + 1 >= self.max_depth {
            out.push_str("Sub-queries from this level go straight to a model without a sandbox.\n");
        } else {
            out.push_str("Each sub-query is answered by another instance with its own sandbox.\n");
        }
        out
    }

    /// First user message
    pub fn first_prompt(&self) -> String {
        format!(
            "## Question\n{}\n\n## Context\nA {} context of {} characters is loaded in the sandbox.\n\
             You have {} turns. Start by exploring the context; do not answer yet.\n",
            self.query, self.context_kind, self.context_length, self.max_iterations
        )
    }

    /// User message after a block ran
    pub fn continue_prompt(&self, iteration: usize, observation: &str) -> String {
        let left = self.max_iterations.saturating_sub(iteration);
        format!(
            "## Result of turn {}\n{}\n{} turns left. Continue, or finish with FINAL / FINAL_VAR \
             once you can answer: {}\n",
            iteration, observation, left, self.query
        )
    }

    /// User message when a reply had no code block
    pub fn no_code_prompt(&self, iteration: usize) -> String {
        format!(
            "Turn {} had no ```repl block and no FINAL line. Reply with a code block.\n",
            iteration
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::Program;

    #[test]
    fn test_schema_generation() {
        let schema = SandboxSchema::new();
        let prompt = schema.to_prompt();

        assert!(prompt.contains("QUERY_BATCHED"));
        assert!(prompt.contains("FINAL_VAR"));
        assert!(prompt.contains("Context Window Management"));
    }

    #[test]
    fn test_examples_parse() {
        let schema = SandboxSchema::new();
        for category in &schema.opcodes {
            for op in &category.opcodes {
                let example = op.example.unwrap_or_default();
                let program = Program::parse(example)
                    .unwrap_or_else(|e| panic!("{} example does not parse: {}", op.name, e));
                assert_eq!(program.len(), 1, "{}", op.name);
            }
        }
    }

    #[test]
    fn test_task_prompts() {
        let task = TaskPrompt {
            query: "Why Postgres?".into(),
            context_kind: "segmented".into(),
            context_length: 1_234_567,
            depth: 2,
            max_depth: 3,
            max_iterations: 10,
        };
        let schema = SandboxSchema::new();
        assert!(task.system_prompt(&schema).contains("straight to a model"));

        let first = task.first_prompt();
        assert!(first.contains("Why Postgres?"));
        assert!(first.contains("1234567 characters"));

        let next = task.continue_prompt(3, "[stdout]\nok\n");
        assert!(next.contains("7 turns left"));
    }

    #[test]
    fn test_schema_json() {
        let json = SandboxSchema::new().to_json();
        let _: serde_json::Value = serde_json::from_str(&json).unwrap();
    }
}
