//! # Sandboxes
//!
//! One capability, two placements. `InProcessSandbox` owns its interpreter
//! directly; `HostedSandbox` keeps the interpreter in a long-lived task and
//! talks to it over a command channel. Callers only see [`Sandbox`].
//!
//! Faults inside user code come back inside `ExecutionResult`. An `Err`
//! from `run` means the sandbox itself is gone or stuck.

use crate::error::{self, Result};
use crate::interpreter::{ExecutionResult, Interpreter};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxKind {
    #[default]
    InProcess,
    Hosted,
}

impl SandboxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxKind::InProcess => "in_process",
            SandboxKind::Hosted => "hosted",
        }
    }
}

impl fmt::Display for SandboxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SandboxKind {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "in_process" | "local" => Ok(SandboxKind::InProcess),
            "hosted" => Ok(SandboxKind::Hosted),
            other => Err(error::invalid_argument(format!(
                "unknown sandbox kind '{}' (expected in_process or hosted)",
                other
            ))),
        }
    }
}

/// Stateful code-execution environment
#[async_trait]
pub trait Sandbox: Send {
    fn kind(&self) -> SandboxKind;

    /// Execute one code block against the persistent namespace
    async fn run(&mut self, code: &str) -> Result<ExecutionResult>;

    /// Current bindings
    async fn bindings(&mut self) -> Result<BTreeMap<String, Value>>;

    /// Release the sandbox; later calls fail
    async fn shutdown(&mut self);
}

/// Build the sandbox variant named by `kind` around `interpreter`
pub fn build_sandbox(kind: SandboxKind, interpreter: Interpreter, run_timeout: Duration) -> Box<dyn Sandbox> {
    match kind {
        SandboxKind::InProcess => Box::new(InProcessSandbox::new(interpreter, run_timeout)),
        SandboxKind::Hosted => Box::new(HostedSandbox::spawn(interpreter, run_timeout)),
    }
}

// ============================================================================
// In-process
// ============================================================================

pub struct InProcessSandbox {
    interpreter: Option<Interpreter>,
    run_timeout: Duration,
}

impl InProcessSandbox {
    pub fn new(interpreter: Interpreter, run_timeout: Duration) -> Self {
        Self {
            interpreter: Some(interpreter),
            run_timeout,
        }
    }

    fn interpreter(&mut self) -> Result<&mut Interpreter> {
        self.interpreter
            .as_mut()
            .ok_or_else(|| error::sandbox_unavailable("sandbox was shut down"))
    }
}

#[async_trait]
impl Sandbox for InProcessSandbox {
    fn kind(&self) -> SandboxKind {
        SandboxKind::InProcess
    }

    async fn run(&mut self, code: &str) -> Result<ExecutionResult> {
        let run_timeout = self.run_timeout;
        let interpreter = self.interpreter()?;
        match tokio::time::timeout(run_timeout, interpreter.run(code)).await {
            Ok(result) => result,
            Err(_) => Err(error::timeout("sandbox::run", run_timeout.as_secs_f64())),
        }
    }

    async fn bindings(&mut self) -> Result<BTreeMap<String, Value>> {
        Ok(self.interpreter()?.bindings())
    }

    async fn shutdown(&mut self) {
        self.interpreter = None;
    }
}

// ============================================================================
// Hosted
// ============================================================================

enum HostCommand {
    Run {
        code: String,
        reply: oneshot::Sender<Result<ExecutionResult>>,
    },
    Bindings {
        reply: oneshot::Sender<BTreeMap<String, Value>>,
    },
}

/// Interpreter running in its own task
pub struct HostedSandbox {
    commands: Option<mpsc::Sender<HostCommand>>,
    host: Option<JoinHandle<()>>,
    run_timeout: Duration,
}

impl HostedSandbox {
    pub fn spawn(interpreter: Interpreter, run_timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel(4);
        let host = tokio::spawn(host_loop(interpreter, rx));
        Self {
            commands: Some(tx),
            host: Some(host),
            run_timeout,
        }
    }

    fn commands(&self) -> Result<&mpsc::Sender<HostCommand>> {
        self.commands
            .as_ref()
            .ok_or_else(|| error::sandbox_unavailable("sandbox host is not running"))
    }

    /// Tear the host down after it stopped answering
    fn kill(&mut self) {
        self.commands = None;
        if let Some(host) = self.host.take() {
            host.abort();
        }
    }
}

async fn host_loop(mut interpreter: Interpreter, mut commands: mpsc::Receiver<HostCommand>) {
    debug!("sandbox host started");
    while let Some(command) = commands.recv().await {
        match command {
            HostCommand::Run { code, reply } => {
                let result = interpreter.run(&code).await;
                let _ = reply.send(result);
            }
            HostCommand::Bindings { reply } => {
                let _ = reply.send(interpreter.bindings());
            }
        }
    }
    debug!("sandbox host stopped");
}

#[async_trait]
impl Sandbox for HostedSandbox {
    fn kind(&self) -> SandboxKind {
        SandboxKind::Hosted
    }

    async fn run(&mut self, code: &str) -> Result<ExecutionResult> {
        let (reply, rx) = oneshot::channel();
        let command = HostCommand::Run {
            code: code.to_string(),
            reply,
        };
        if self.commands()?.send(command).await.is_err() {
            self.kill();
            return Err(error::sandbox_unavailable("sandbox host exited"));
        }

        match tokio::time::timeout(self.run_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                self.kill();
                Err(error::sandbox_unavailable("sandbox host dropped the run"))
            }
            Err(_) => {
                warn!(timeout_secs = self.run_timeout.as_secs_f64(), "sandbox run timed out, stopping host");
                self.kill();
                Err(error::timeout("sandbox::run", self.run_timeout.as_secs_f64()))
            }
        }
    }

    async fn bindings(&mut self) -> Result<BTreeMap<String, Value>> {
        let (reply, rx) = oneshot::channel();
        if self.commands()?.send(HostCommand::Bindings { reply }).await.is_err() {
            self.kill();
            return Err(error::sandbox_unavailable("sandbox host exited"));
        }
        rx.await
            .map_err(|_| error::sandbox_unavailable("sandbox host dropped the request"))
    }

    async fn shutdown(&mut self) {
        self.commands = None;
        if let Some(host) = self.host.take() {
            let _ = host.await;
        }
    }
}

impl Drop for HostedSandbox {
    fn drop(&mut self) {
        if let Some(host) = self.host.take() {
            host.abort();
        }
    }
}
