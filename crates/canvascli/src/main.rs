use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use canvascore::{ExecutionEvent, Graph, GraphDocument, NodeEvent, Value, WorkflowError};
use canvasnodes::Settings;
use canvasruntime::{ExecutionResult, FlowRuntime};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "canvas")]
#[command(about = "Canvas workflow engine CLI", long_about = None)]
struct Cli {
    /// Settings file (TOML) with runtime options and providers
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Show debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Where a graph comes from.
#[derive(Args)]
#[group(required = true, multiple = false)]
struct Source {
    /// Path to a saved graph document (JSON)
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Name of a template to instantiate
    #[arg(short, long)]
    template: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate and execute a graph
    Run {
        #[command(flatten)]
        source: Source,

        /// Initial values as a JSON object
        #[arg(short, long)]
        input: Option<String>,
    },

    /// Validate a graph without running it
    Validate {
        #[command(flatten)]
        source: Source,
    },

    /// List available node types
    NodeTypes,

    /// List available templates
    Templates,

    /// Write a template out as an editable graph document
    Init {
        #[arg(short, long)]
        template: String,

        /// Output file path
        #[arg(short, long, default_value = "workflow.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let settings = match &cli.config {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    let runtime = settings
        .build_runtime()
        .context("failed to set up the runtime")?;

    match cli.command {
        Commands::Run { source, input } => run_graph(&runtime, &source, input).await?,
        Commands::Validate { source } => validate_graph(&runtime, &source)?,
        Commands::NodeTypes => list_node_types(&runtime),
        Commands::Templates => list_templates(&runtime),
        Commands::Init { template, output } => init_graph(&runtime, &template, &output)?,
    }

    Ok(())
}

fn load_graph(runtime: &FlowRuntime, source: &Source) -> Result<Graph> {
    match (&source.file, &source.template) {
        (Some(file), _) => {
            let json = std::fs::read_to_string(file)
                .with_context(|| format!("cannot read {}", file.display()))?;
            let document: GraphDocument = serde_json::from_str(&json)
                .with_context(|| format!("{} is not a graph document", file.display()))?;
            Ok(runtime.load_document(&document)?)
        }
        (None, Some(name)) => Ok(runtime.graph_from_template(name)?),
        (None, None) => Err(anyhow!("either --file or --template is required")),
    }
}

fn parse_inputs(input: Option<String>) -> Result<BTreeMap<String, Value>> {
    let Some(raw) = input else {
        return Ok(BTreeMap::new());
    };
    let json: serde_json::Value = serde_json::from_str(&raw).context("--input is not valid JSON")?;
    match Value::from(json) {
        Value::Object(map) => Ok(map),
        _ => Err(anyhow!("Input must be a JSON object")),
    }
}

fn print_issues(err: &WorkflowError) {
    for issue in err.issues() {
        println!("  ✗ {}", issue);
    }
}

async fn run_graph(runtime: &FlowRuntime, source: &Source, input: Option<String>) -> Result<()> {
    let graph = load_graph(runtime, source)?;
    let inputs = parse_inputs(input)?;

    println!(
        "🚀 Running graph: {} nodes, {} connections",
        graph.node_count(),
        graph.connection_count()
    );

    let mut events = runtime.subscribe_events();
    let event_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let finished = matches!(event, ExecutionEvent::WorkflowCompleted { .. });
                    print_event(event);
                    if finished {
                        break;
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    println!("  … {} event(s) dropped", missed);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let result = match runtime.run(&graph, inputs).await {
        Ok(result) => result,
        Err(err) => {
            event_task.abort();
            println!("❌ Graph was not run:");
            print_issues(&err);
            return Err(err.into());
        }
    };
    let _ = event_task.await;

    print_summary(&result);
    if result.is_success() {
        Ok(())
    } else {
        Err(anyhow!("{} node(s) failed", result.failures.len()))
    }
}

fn print_event(event: ExecutionEvent) {
    match event {
        ExecutionEvent::WorkflowStarted { node_count, .. } => {
            println!("▶️  Workflow started ({} nodes)", node_count);
        }
        ExecutionEvent::NodeStarted { node_id, kind, .. } => {
            println!("  ⚡ Starting node: {} ({})", node_id, kind);
        }
        ExecutionEvent::NodeCompleted {
            node_id,
            duration_ms,
            ..
        } => {
            println!("  ✅ Node {} completed in {}ms", node_id, duration_ms);
        }
        ExecutionEvent::NodeFailed { node_id, error, .. } => {
            println!("  ❌ Node {} failed: {}", node_id, error);
        }
        ExecutionEvent::NodeSkipped {
            node_id, reason, ..
        } => {
            println!("  ⏭  Node {} skipped: {}", node_id, reason);
        }
        ExecutionEvent::NodeEvent { node_id, event, .. } => match event {
            NodeEvent::Info { message } => println!("     ℹ️  [{}] {}", node_id, message),
            NodeEvent::Warning { message } => println!("     ⚠️  [{}] {}", node_id, message),
            NodeEvent::Progress { percent, message } => match message {
                Some(msg) => println!("     📊 [{}] {}% - {}", node_id, percent, msg),
                None => println!("     📊 [{}] {}%", node_id, percent),
            },
        },
        ExecutionEvent::WorkflowCompleted {
            success,
            duration_ms,
            ..
        } => {
            if success {
                println!("✨ Workflow completed successfully in {}ms", duration_ms);
            } else {
                println!("💥 Workflow finished with failures after {}ms", duration_ms);
            }
        }
    }
}

fn print_summary(result: &ExecutionResult) {
    println!();
    println!("📊 Execution Summary:");
    println!("   Execution ID: {}", result.execution_id);
    println!(
        "   Executed: {}/{} nodes",
        result.executed_count(),
        result.statuses.len()
    );
    if result.cancelled {
        println!("   Cancelled");
    }

    if !result.outputs.is_empty() {
        println!();
        println!("📤 Outputs:");
        for (name, value) in &result.outputs {
            let json = serde_json::to_string_pretty(&value.to_json()).unwrap_or_default();
            println!("   {}: {}", name, json);
        }
    }

    if !result.failures.is_empty() {
        println!();
        println!("❌ Failures:");
        for failure in &result.failures {
            println!("   {}: {}", failure.node_id, failure.error);
        }
    }
}

fn validate_graph(runtime: &FlowRuntime, source: &Source) -> Result<()> {
    let graph = load_graph(runtime, source)?;
    let report = runtime.validate(&graph);

    for warning in &report.warnings {
        println!("  ⚠️  {}", warning.message);
    }
    if report.is_valid {
        println!(
            "✅ Graph is valid: {} nodes, {} connections",
            graph.node_count(),
            graph.connection_count()
        );
        Ok(())
    } else {
        println!("❌ Graph is invalid:");
        for issue in &report.errors {
            println!("  ✗ {}", issue);
        }
        Err(anyhow!("{} validation error(s)", report.errors.len()))
    }
}

fn list_node_types(runtime: &FlowRuntime) {
    println!("📦 Available Node Types:");
    println!();
    for ty in runtime.registry().list() {
        println!("  • {} ({})", ty.id, ty.kind);
        if !ty.description.is_empty() {
            println!("    {}", ty.description);
        }
        println!(
            "    in: [{}]  out: [{}]",
            ty.inputs.join(", "),
            ty.outputs.join(", ")
        );
    }
}

fn list_templates(runtime: &FlowRuntime) {
    println!("📚 Available Templates:");
    println!();
    for template in runtime.templates().list() {
        println!("  • {} ({} nodes)", template.name, template.nodes.len());
        if !template.description.is_empty() {
            println!("    {}", template.description);
        }
    }
}

fn init_graph(runtime: &FlowRuntime, template: &str, output: &Path) -> Result<()> {
    let graph = runtime.graph_from_template(template)?;
    let json = serde_json::to_string_pretty(&graph.save())?;
    std::fs::write(output, json)?;

    println!("✨ Created graph from '{}': {}", template, output.display());
    println!();
    println!("Run it with:");
    println!("  canvas run --file {}", output.display());
    Ok(())
}
