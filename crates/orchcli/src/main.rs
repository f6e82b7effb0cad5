// crates/orchcli/src/main.rs

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use orchcore::storage::StoreSnapshot;
use orchcore::{
    EngineConfig, ExecutionEvent, InstanceStatus, LifecycleStatus, MemoryStore, NodeEvent,
    NodeKind, NodeSpec, StartRequest, Storage, WorkflowDefinition, WorkflowInstance,
};
use orchnodes::{ExecutionTreeNode, ReqwestClient};
use orchruntime::WorkflowEngine;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "orch")]
#[command(about = "Workflow orchestration engine CLI", long_about = None)]
struct Cli {
    /// Engine configuration (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Show debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an instance of a workflow file
    Run {
        /// Path to workflow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Additional workflow files available as subprocesses
        #[arg(short, long = "with")]
        with: Vec<PathBuf>,

        /// Input variables as a JSON object
        #[arg(short, long)]
        input: Option<String>,

        /// Version token to pin (latest, published or an exact version)
        #[arg(long)]
        version: Option<String>,

        /// State file holding definitions and instances between invocations
        #[arg(short, long, default_value = "orch-state.json")]
        state: PathBuf,
    },

    /// Resume a waiting or paused instance past a node
    Resume {
        #[arg(long)]
        instance: String,

        /// Node the instance is waiting on
        #[arg(long)]
        node: String,

        /// Result data as JSON
        #[arg(short, long)]
        data: Option<String>,

        #[arg(short, long, default_value = "orch-state.json")]
        state: PathBuf,
    },

    /// Show an instance
    Status {
        #[arg(long)]
        instance: String,

        #[arg(short, long, default_value = "orch-state.json")]
        state: PathBuf,
    },

    /// Show the parent/child execution tree of an instance
    Tree {
        #[arg(long)]
        instance: String,

        #[arg(long, default_value_t = 10)]
        depth: u32,

        #[arg(short, long, default_value = "orch-state.json")]
        state: PathBuf,
    },

    /// Pause an instance
    Pause {
        #[arg(long)]
        instance: String,

        #[arg(short, long, default_value = "orch-state.json")]
        state: PathBuf,
    },

    /// Cancel an instance
    Cancel {
        #[arg(long)]
        instance: String,

        #[arg(short, long, default_value = "orch-state.json")]
        state: PathBuf,
    },

    /// Validate a workflow file
    Validate {
        /// Path to workflow JSON file
        file: PathBuf,
    },

    /// List available node types
    Nodes,

    /// Create a new example workflow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "workflow.json")]
        output: PathBuf,
    },
}

/// Engine backed by a state file
struct Session {
    store: Arc<MemoryStore>,
    engine: WorkflowEngine,
    path: PathBuf,
}

impl Session {
    fn open(path: &Path, config: EngineConfig) -> Result<Self> {
        let snapshot = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read state file {}", path.display()))?;
            serde_json::from_str::<StoreSnapshot>(&raw)
                .with_context(|| format!("invalid state file {}", path.display()))?
        } else {
            StoreSnapshot::default()
        };

        let store = Arc::new(MemoryStore::from_snapshot(snapshot));
        let engine = WorkflowEngine::new(store.clone(), Arc::new(ReqwestClient::new()), config);
        Ok(Self {
            store,
            engine,
            path: path.to_path_buf(),
        })
    }

    async fn save(&self) -> Result<()> {
        save_snapshot(&self.store, &self.path).await
    }

    /// Print events while `action` runs, then persist the store
    async fn observe<F, T>(self, action: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a WorkflowEngine) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<T>> + 'a>>,
    {
        let mut events = self.engine.subscribe_events();
        let printer = tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                print_event(event);
            }
        });

        let outcome = action(&self.engine).await;
        let Session { store, engine, path } = self;
        // the printer exits once every sender is gone
        drop(engine);
        let _ = printer.await;

        save_snapshot(&store, &path).await?;
        outcome
    }
}

async fn save_snapshot(store: &MemoryStore, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(&store.snapshot().await)?;
    std::fs::write(path, json).with_context(|| format!("cannot write state file {}", path.display()))?;
    Ok(())
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

    let config = match &cli.config {
        Some(path) => {
            tracing::debug!("Loading engine config from {}", path.display());
            EngineConfig::from_toml_file(path)?
        }
        None => EngineConfig::default(),
    };

    match cli.command {
        Commands::Run {
            file,
            with,
            input,
            version,
            state,
        } => {
            run_workflow(config, file, with, input, version, state).await?;
        }

        Commands::Resume {
            instance,
            node,
            data,
            state,
        } => {
            let data = data.map(|raw| serde_json::from_str::<Value>(&raw)).transpose()?;
            let session = Session::open(&state, config)?;
            let id = instance.clone();
            session
                .observe(move |engine| {
                    Box::pin(async move {
                        engine.resume(&id, &node, data).await?;
                        Ok(())
                    })
                })
                .await?;
            show_instance(&state, &instance).await?;
        }

        Commands::Status { instance, state } => {
            show_instance(&state, &instance).await?;
        }

        Commands::Tree {
            instance,
            depth,
            state,
        } => {
            let session = Session::open(&state, config)?;
            let tree = session.engine.execution_tree(&instance, depth).await?;
            print_tree(&tree, 0);
        }

        Commands::Pause { instance, state } => {
            let session = Session::open(&state, config)?;
            session.engine.pause(&instance).await?;
            session.save().await?;
            println!("⏸️  Instance {} paused", instance);
        }

        Commands::Cancel { instance, state } => {
            let session = Session::open(&state, config)?;
            let id = instance.clone();
            session
                .observe(move |engine| {
                    Box::pin(async move {
                        engine.cancel(&id).await?;
                        Ok(())
                    })
                })
                .await?;
            println!("🛑 Instance {} cancelled", instance);
        }

        Commands::Validate { file } => {
            validate_workflow(file)?;
        }

        Commands::Nodes => {
            list_nodes();
        }

        Commands::Init { output } => {
            create_example_workflow(output)?;
        }
    }

    Ok(())
}

fn load_workflow(file: &Path) -> Result<WorkflowDefinition> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("cannot read workflow {}", file.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid workflow {}", file.display()))
}

async fn run_workflow(
    config: EngineConfig,
    file: PathBuf,
    with: Vec<PathBuf>,
    input: Option<String>,
    version: Option<String>,
    state: PathBuf,
) -> Result<()> {
    println!("🚀 Loading workflow from: {}", file.display());

    let workflow = load_workflow(&file)?;
    println!("📋 Workflow: {} ({})", workflow.name, workflow.id);
    println!("   Nodes: {}", workflow.nodes.len());
    println!("   Edges: {}", workflow.edges.len());
    println!();

    let inputs: HashMap<String, Value> = match input {
        Some(raw) => match serde_json::from_str(&raw)? {
            Value::Object(obj) => obj.into_iter().collect(),
            _ => bail!("Input must be a JSON object"),
        },
        None => HashMap::new(),
    };

    let session = Session::open(&state, config)?;
    session.store.save_workflow(&workflow).await?;
    for extra in &with {
        let definition = load_workflow(extra)?;
        println!("   + subprocess workflow {}", definition.id);
        session.store.save_workflow(&definition).await?;
    }

    let mut request = StartRequest::new(workflow.id.clone())
        .triggered_by("cli")
        .with_inputs(inputs);
    if let Some(version) = version {
        request = request.with_version(version);
    }

    let instance_id = session
        .observe(move |engine| Box::pin(async move { Ok(engine.start(request).await?) }))
        .await?;

    println!();
    show_instance(&state, &instance_id).await
}

async fn show_instance(state: &Path, instance_id: &str) -> Result<()> {
    let session = Session::open(state, EngineConfig::default())?;
    let instance = session.engine.get_instance(instance_id).await?;
    print_summary(&instance);
    Ok(())
}

fn print_event(event: ExecutionEvent) {
    match event {
        ExecutionEvent::InstanceStarted {
            instance_id,
            workflow_id,
            nesting_level,
            ..
        } => {
            let indent = "  ".repeat(nesting_level as usize);
            println!("{}▶️  Instance {} of {} started", indent, instance_id, workflow_id);
        }
        ExecutionEvent::InstanceStatusChanged {
            instance_id,
            status,
            error,
            ..
        } => match (status, error) {
            (InstanceStatus::Completed, _) => println!("✨ Instance {} completed", instance_id),
            (InstanceStatus::Failed, Some(error)) => {
                println!("💥 Instance {} failed: {}", instance_id, error)
            }
            (status, _) => println!("🔸 Instance {} is {}", instance_id, status),
        },
        ExecutionEvent::NodeStarted {
            node_id, node_type, ..
        } => {
            println!("  ⚡ Starting node: {} ({})", node_id, node_type);
        }
        ExecutionEvent::NodeCompleted {
            node_id, duration_ms, ..
        } => {
            println!("  ✅ Node {} completed in {}ms", node_id, duration_ms);
        }
        ExecutionEvent::NodeWaiting { node_id, wait, .. } => {
            println!("  ⏳ Node {} waiting on {:?} {}", node_id, wait.kind, wait.id);
        }
        ExecutionEvent::NodeFailed { node_id, error, .. } => {
            println!("  ❌ Node {} failed: {}", node_id, error);
        }
        ExecutionEvent::NodeRetrying {
            node_id,
            attempt,
            error,
            ..
        } => {
            println!("  🔁 Node {} attempt {} failed, retrying: {}", node_id, attempt, error);
        }
        ExecutionEvent::NodeEvent { node_id, event, .. } => match event {
            NodeEvent::Info { message } => println!("     ℹ️  [{}] {}", node_id, message),
            NodeEvent::Warning { message } => println!("     ⚠️  [{}] {}", node_id, message),
        },
    }
}

fn print_summary(instance: &WorkflowInstance) {
    println!("📊 Instance Summary:");
    println!("   Instance ID: {}", instance.id);
    println!("   Workflow: {}", instance.workflow_id);
    if let Some(version) = &instance.workflow_version {
        println!("   Version: {}", version);
    }
    println!("   Status: {}", instance.status);
    if let Some(node) = &instance.current_node_id {
        println!("   Current node: {}", node);
    }
    if let Some(wait) = &instance.waiting_for {
        println!("   Waiting for: {:?} {}", wait.kind, wait.id);
        if let Some(deadline) = wait.deadline {
            println!("   Deadline: {}", deadline.to_rfc3339());
        }
    }
    if let Some(error) = &instance.error {
        println!("   Error: {}", error);
    }
    if let Some(friendly) = &instance.friendly_error {
        println!("   {}", friendly);
    }
    println!("   Executed: {} node runs", instance.execution_log.len());

    if !instance.variables.is_empty() {
        println!();
        println!("📤 Variables:");
        let mut names: Vec<&String> = instance.variables.keys().collect();
        names.sort();
        for name in names {
            println!("   {}: {}", name, instance.variables[name]);
        }
    }
    if !instance.children.is_empty() {
        println!();
        println!("🌳 Children:");
        for child in &instance.children {
            println!(
                "   {} via {} ({}): {}",
                child.instance_id, child.node_id, child.workflow_id, child.status
            );
        }
    }
}

fn print_tree(node: &ExecutionTreeNode, depth: usize) {
    let marker = if node.has_error { "❌" } else { "•" };
    println!(
        "{}{} {} [{}] {} {:.1}s",
        "  ".repeat(depth),
        marker,
        node.workflow_id,
        node.instance_id,
        node.status,
        node.duration_seconds
    );
    if let Some(error) = &node.error {
        println!("{}    {}", "  ".repeat(depth), error);
    }
    for child in &node.children {
        print_tree(child, depth + 1);
    }
}

fn validate_workflow(file: PathBuf) -> Result<()> {
    println!("🔍 Validating workflow: {}", file.display());

    let workflow = load_workflow(&file)?;
    let mut problems = Vec::new();
    let mut warnings = Vec::new();

    if workflow.start_node().is_none() {
        problems.push("no start node".to_string());
    }
    if !workflow.has_end_node() {
        warnings.push("no end node".to_string());
    }
    for edge in workflow.dangling_edges() {
        problems.push(format!("edge {} references a missing node", edge.id));
    }
    for node in &workflow.nodes {
        if let NodeKind::Unknown(name) = &node.kind {
            problems.push(format!("node {} has unknown type {}", node.id, name));
        }
    }
    let unreachable = workflow.unreachable_nodes();
    if !unreachable.is_empty() {
        warnings.push(format!("unreachable nodes: {}", unreachable.join(", ")));
    }

    for warning in &warnings {
        println!("   ⚠️  {}", warning);
    }
    if !problems.is_empty() {
        for problem in &problems {
            println!("   ❌ {}", problem);
        }
        bail!("Workflow {} is invalid", workflow.id);
    }

    println!("✅ Workflow is valid:");
    println!("   Name: {}", workflow.name);
    println!("   Status: {}", workflow.status);
    println!("   Nodes: {}", workflow.nodes.len());
    println!("   Edges: {}", workflow.edges.len());

    Ok(())
}

fn list_nodes() {
    println!("📦 Available Node Types:");
    println!();

    for kind in NodeKind::KNOWN {
        let note = if kind.is_retryable() { " (retried on transient errors)" } else { "" };
        println!("  • {}{}", kind, note);
    }
}

fn create_example_workflow(output: PathBuf) -> Result<()> {
    let mut workflow = WorkflowDefinition::new("expense-approval", "Expense Approval")
        .with_status(LifecycleStatus::Published);
    workflow.description = Some("Routes large expenses to a manager, small ones straight through".to_string());

    workflow.add_node(NodeSpec::new("start", NodeKind::Start));
    workflow.add_node(
        NodeSpec::new("check", NodeKind::Decision)
            .with_name("Over limit?")
            .with_data(serde_json::json!({ "condition": "amount > 500" })),
    );
    workflow.add_node(
        NodeSpec::new("review", NodeKind::Task)
            .with_name("Manager review")
            .with_data(serde_json::json!({
                "title": "Review expense of ${amount}",
                "assignee": "manager",
                "dueInHours": 24,
            })),
    );
    workflow.add_node(NodeSpec::new("end", NodeKind::End));

    workflow.connect("start", "check");
    workflow.connect("check", "review").with_label("Yes");
    workflow.connect("check", "end").with_label("No");
    workflow.connect("review", "end");

    let json = serde_json::to_string_pretty(&workflow)?;
    std::fs::write(&output, json)?;

    println!("✨ Created example workflow: {}", output.display());
    println!();
    println!("Run it with:");
    println!("  orch run --file {} --input '{{\"amount\": 900}}'", output.display());

    Ok(())
}
