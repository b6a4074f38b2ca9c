//! # deeprecurse CLI
//!
//! Ask questions over large corpora with recursive language-model execution.
//!
//! Usage:
//!   deeprecurse query <question> [--corpus C | --context-file F]
//!   deeprecurse ingest <file|-> --corpus C
//!   deeprecurse manifest --corpus C
//!   deeprecurse schema
//!   deeprecurse tool
//!
//! Examples:
//!   deeprecurse ingest session.txt --corpus team --developer sam
//!   deeprecurse query "Why did we pick Postgres?" --corpus team
//!   deeprecurse -v query "What does this log say?" --context-file build.log --max-depth 2

use clap::{Parser, Subcommand};
use deeprecurse_agent::{
    EngineConfig, Executor, FinalResult, QueryTool, ToolCall, ToolResult, UploadArgs, DEFAULT_CORPUS,
};
use deeprecurse_vm::error::{self, Error, Result};
use deeprecurse_vm::{ContextHandle, CorpusWriter, SandboxKind, SandboxSchema};
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "deeprecurse")]
#[command(author, version, about = "deeprecurse - recursive code execution over large context")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only warnings and errors on stderr
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a question over a corpus or a file
    Query {
        #[arg(required = true, num_args = 1..)]
        question: Vec<String>,

        /// Corpus in the configured store
        #[arg(long, conflicts_with = "context_file")]
        corpus: Option<String>,

        /// Plain text file held in memory as the context
        #[arg(long)]
        context_file: Option<PathBuf>,

        #[arg(long)]
        model: Option<String>,

        #[arg(long)]
        sub_model: Option<String>,

        #[arg(long)]
        max_iterations: Option<usize>,

        #[arg(long)]
        max_depth: Option<usize>,

        /// in_process or hosted
        #[arg(long)]
        sandbox: Option<String>,

        /// Print the whole result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Append a transcript to a corpus
    Ingest {
        /// Transcript file, or - for stdin
        file: String,

        #[arg(long, default_value = DEFAULT_CORPUS)]
        corpus: String,

        #[arg(long)]
        session: Option<String>,

        #[arg(long)]
        developer: Option<String>,
    },
    /// Show a corpus manifest
    Manifest {
        #[arg(long, default_value = DEFAULT_CORPUS)]
        corpus: String,
    },
    /// Show the sandbox instruction set
    Schema {
        #[arg(long)]
        json: bool,
    },
    /// Serve the tools as newline-delimited JSON on stdin/stdout
    Tool,
}

fn init_logging(verbose: bool, quiet: bool) {
    let level = if verbose {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn fail(err: &Error) -> ! {
    eprintln!("Error: {}: {}", err.kind(), err.message());
    debug!("{:?}", err);
    std::process::exit(1);
}

fn read_input(file: &str) -> Result<String> {
    if file == "-" {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .map_err(|e| error::io_error(format!("Failed to read stdin: {}", e)).set_source(e))?;
        return Ok(text);
    }
    std::fs::read_to_string(file)
        .map_err(|e| error::io_error(format!("Failed to read {}: {}", file, e)).set_source(e))
}

fn print_result(result: &FinalResult, json: bool) {
    if json {
        match serde_json::to_string_pretty(result) {
            Ok(text) => println!("{}", text),
            Err(e) => eprintln!("Error: failed to render result: {}", e),
        }
    }

    match (result.answer(), result.error()) {
        (Some(answer), _) => {
            if !json {
                println!("{}", answer);
            }
            info!(
                state = %result.state,
                iterations = result.iterations,
                children = result.stats.children.len(),
                direct_calls = result.stats.direct_calls,
                tokens = result.stats.usage.total_tokens(),
                "done"
            );
        }
        (None, Some(payload)) => {
            let text = serde_json::to_string(payload).unwrap_or_else(|_| payload.to_string());
            eprintln!("{}", text);
            std::process::exit(1);
        }
        (None, None) => std::process::exit(1),
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_query(
    mut config: EngineConfig,
    question: String,
    corpus: Option<String>,
    context_file: Option<PathBuf>,
    model: Option<String>,
    sub_model: Option<String>,
    max_iterations: Option<usize>,
    max_depth: Option<usize>,
    sandbox: Option<String>,
    json: bool,
) -> Result<()> {
    if let Some(model) = model {
        config.model = model;
    }
    if let Some(sub_model) = sub_model {
        config.sub_model = sub_model;
    }
    if let Some(n) = max_iterations {
        config.max_iterations = n;
    }
    if let Some(n) = max_depth {
        config.max_depth = n;
    }
    if let Some(kind) = sandbox {
        config.sandbox.kind = kind.parse::<SandboxKind>()?;
    }
    config.validate()?;

    let context = match context_file {
        Some(path) => {
            let text = std::fs::read_to_string(&path).map_err(|e| {
                error::io_error(format!("Failed to read {}: {}", path.display(), e)).set_source(e)
            })?;
            ContextHandle::from_text(text)
        }
        None => {
            let store = config.store.build()?;
            let corpus = corpus.unwrap_or_else(|| DEFAULT_CORPUS.to_string());
            ContextHandle::segmented(store, &corpus, config.context.segmented_config())
        }
    };
    let backend = config.backend.provider_config(&config.model)?.build()?;

    info!(model = %config.model, max_depth = config.max_depth, context = context.kind().as_str(), "query started");
    let result = Executor::root(Arc::new(config), backend, context, question).run().await;
    print_result(&result, json);
    Ok(())
}

async fn run_ingest(
    config: EngineConfig,
    file: String,
    corpus: String,
    session: Option<String>,
    developer: Option<String>,
) -> Result<()> {
    let transcript = read_input(&file)?;
    let store = config.store.build()?;
    let tool = QueryTool::new(Arc::new(config), store);
    let manifest = tool
        .upload(UploadArgs {
            transcript,
            session_id: session,
            corpus: Some(corpus.clone()),
            developer,
        })
        .await?;
    println!(
        "corpus '{}': {} segments, {} characters",
        corpus,
        manifest.len(),
        manifest.total_length()
    );
    Ok(())
}

async fn show_manifest(config: EngineConfig, corpus: String) -> Result<()> {
    let writer = CorpusWriter::new(config.store.build()?, corpus);
    let manifest = writer.manifest().await?;
    let text = serde_json::to_string_pretty(&manifest)
        .map_err(|e| error::serialization_error(format!("Failed to render manifest: {}", e)))?;
    println!("{}", text);
    Ok(())
}

fn show_schema(json: bool) {
    let schema = SandboxSchema::new();
    if json {
        println!("{}", schema.to_json());
    } else {
        println!("{}", schema.to_prompt());
    }
}

/// One JSON object per line in, one per line out. `{"name": "list_tools"}`
/// returns the definitions.
async fn serve_tools(config: EngineConfig) -> Result<()> {
    let store = config.store.build()?;
    let tool = QueryTool::new(Arc::new(config), store);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    info!("serving tools on stdio");
    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| error::io_error(format!("Failed to read stdin: {}", e)).set_source(e))?
    {
        if line.trim().is_empty() {
            continue;
        }
        let reply = match serde_json::from_str::<ToolCall>(&line) {
            Ok(call) if call.name == "list_tools" => serde_json::to_string(&QueryTool::definitions()),
            Ok(call) => serde_json::to_string(&tool.call(call).await),
            Err(e) => serde_json::to_string(&ToolResult {
                tool_call_id: String::new(),
                content: format!("invalid request: {}", e),
                is_error: true,
            }),
        }
        .map_err(|e| error::serialization_error(format!("Failed to render reply: {}", e)))?;

        stdout
            .write_all(format!("{}\n", reply).as_bytes())
            .await
            .map_err(|e| error::io_error(format!("Failed to write stdout: {}", e)).set_source(e))?;
        stdout
            .flush()
            .await
            .map_err(|e| error::io_error(format!("Failed to flush stdout: {}", e)).set_source(e))?;
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    if let Commands::Schema { json } = cli.command {
        show_schema(json);
        return;
    }

    let config = match EngineConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => fail(&err),
    };

    let outcome = match cli.command {
        Commands::Query {
            question,
            corpus,
            context_file,
            model,
            sub_model,
            max_iterations,
            max_depth,
            sandbox,
            json,
        } => {
            run_query(
                config,
                question.join(" "),
                corpus,
                context_file,
                model,
                sub_model,
                max_iterations,
                max_depth,
                sandbox,
                json,
            )
            .await
        }
        Commands::Ingest {
            file,
            corpus,
            session,
            developer,
        } => run_ingest(config, file, corpus, session, developer).await,
        Commands::Manifest { corpus } => show_manifest(config, corpus).await,
        Commands::Tool => serve_tools(config).await,
        Commands::Schema { .. } => Ok(()),
    };

    if let Err(err) = outcome {
        fail(&err);
    }
}
