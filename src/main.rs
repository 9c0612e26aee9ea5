use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cortex_core::config::RuntimeConfig;
use cortex_core::error::Result;
use cortex_core::state::QueryInput;
use cortex_core::traits::{ConfigStore, NeuronSource, SharedCache, ToolRouter};
use cortex_core::types::{
    StreamEvent, SYSTEM_DEFAULT_GRAPH_ID, SYSTEM_DEFAULT_NEURON_ID, SYSTEM_SIMPLE_GRAPH_ID,
    SYSTEM_WORKER_NEURON_ID,
};
use cortex_pool::ToolPool;
use cortex_registry::{GraphRegistry, NeuronRegistry};
use cortex_runtime::{Orchestrator, Reply, RespondOptions, TransportItem};
use cortex_store::SqliteStore;
use cortex_stream::MemorySharedCache;

#[derive(Parser)]
#[command(name = "cortex", version, about = "Graph-driven orchestration runtime for LM agents")]
struct Cli {
    /// User id requests run as
    #[arg(short, long, default_value = "local")]
    user: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a single query, streaming to stdout
    Run {
        /// Workflow graph to use (defaults to the user's configured graph)
        #[arg(long)]
        graph: Option<String>,
        /// The message to send
        #[arg(trailing_var_arg = true, required = true)]
        message: Vec<String>,
    },
    /// Interactive conversation loop
    Repl,
    /// Seed the store with the system default graphs and neurons
    Init,
    /// Print the resolved configuration
    Config,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let config = RuntimeConfig::from_env();

    let outcome = match cli.command {
        Commands::Run { graph, message } => {
            run_once(&config, &cli.user, graph, message.join(" ")).await
        }
        Commands::Repl => repl(&config, &cli.user).await,
        Commands::Init => seed_defaults(&config),
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config).unwrap_or_default());
            Ok(())
        }
    };

    if let Err(e) = outcome {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

struct Runtime {
    orchestrator: Orchestrator,
    pool: Arc<ToolPool>,
}

async fn build_runtime(config: &RuntimeConfig) -> Result<Runtime> {
    let store: Arc<SqliteStore> = Arc::new(SqliteStore::open(Path::new(&config.store_path))?);

    let pool = Arc::new(ToolPool::new());
    pool.start(&config.tool_servers).await;

    let graphs = Arc::new(GraphRegistry::new(store.clone() as Arc<dyn ConfigStore>));
    let neurons = Arc::new(NeuronRegistry::new(store.clone() as Arc<dyn ConfigStore>));
    let cache = Arc::new(MemorySharedCache::new());

    let orchestrator = Orchestrator::new(
        config.clone(),
        store as Arc<dyn ConfigStore>,
        graphs,
        neurons as Arc<dyn NeuronSource>,
        pool.clone() as Arc<dyn ToolRouter>,
        cache as Arc<dyn SharedCache>,
    );

    Ok(Runtime { orchestrator, pool })
}

async fn run_once(
    config: &RuntimeConfig,
    user: &str,
    graph: Option<String>,
    message: String,
) -> Result<()> {
    let runtime = build_runtime(config).await?;

    let mut options = RespondOptions::for_user(user);
    options.graph_id = graph;
    options.stream = true;
    options.source = Some("cli".into());

    stream_to_stdout(&runtime.orchestrator, QueryInput { message }, options).await?;
    runtime.pool.stop().await;
    Ok(())
}

async fn repl(config: &RuntimeConfig, user: &str) -> Result<()> {
    let runtime = build_runtime(config).await?;
    let mut conversation_id: Option<String> = None;

    println!("cortex repl — empty line exits");
    loop {
        print!("> ");
        io::stdout().flush().ok();

        let mut line = String::new();
        if io::stdin().lock().read_line(&mut line).unwrap_or(0) == 0 {
            break;
        }
        let message = line.trim().to_string();
        if message.is_empty() {
            break;
        }

        let mut options = RespondOptions::for_user(user);
        options.conversation_id = conversation_id.clone();
        options.stream = true;
        options.source = Some("repl".into());

        match stream_to_stdout(&runtime.orchestrator, QueryInput { message }, options).await {
            Ok(conv) => conversation_id = Some(conv),
            Err(e) => eprintln!("error: {}", e),
        }
    }

    runtime.pool.stop().await;
    Ok(())
}

/// Print a streamed response; returns the conversation id for follow-ups.
async fn stream_to_stdout(
    orchestrator: &Orchestrator,
    query: QueryInput,
    options: RespondOptions,
) -> Result<String> {
    let reply = orchestrator.respond(query, options).await?;
    let mut conversation = String::new();

    match reply {
        Reply::Message(message) => println!("{}", message.content),
        Reply::Stream(mut items) => {
            while let Some(item) = items.next().await {
                match item {
                    TransportItem::Metadata {
                        conversation_id, ..
                    } => conversation = conversation_id,
                    TransportItem::Event(StreamEvent::Chunk { content }) => {
                        print!("{}", content);
                        io::stdout().flush().ok();
                    }
                    TransportItem::Event(StreamEvent::Status { action, .. }) => {
                        info!(action = %action, "status");
                    }
                    TransportItem::Event(StreamEvent::ToolEvent { event }) => {
                        info!(tool = %event.tool_name, kind = ?event.kind, "tool");
                    }
                    TransportItem::Event(StreamEvent::Error { error }) => {
                        warn!(error = %error, "stream error");
                    }
                    TransportItem::Event(_) => {}
                    TransportItem::Final(_) => println!(),
                }
            }
        }
    }

    Ok(conversation)
}

/// Seed the store with a usable out-of-the-box setup: two system neurons and
/// the default and simple graphs.
fn seed_defaults(config: &RuntimeConfig) -> Result<()> {
    let store = SqliteStore::open(Path::new(&config.store_path))?;

    let chat_endpoint = config
        .chat_lm_url
        .clone()
        .unwrap_or_else(|| "http://localhost:8080/v1".to_string());
    let worker_endpoint = config
        .worker_lm_url
        .clone()
        .unwrap_or_else(|| chat_endpoint.clone());

    for (id, role, endpoint) in [
        (SYSTEM_DEFAULT_NEURON_ID, "chat", &chat_endpoint),
        (SYSTEM_WORKER_NEURON_ID, "worker", &worker_endpoint),
    ] {
        let neuron = serde_json::from_value(json!({
            "neuronId": id,
            "ownerId": "system",
            "tier": 4,
            "name": id,
            "role": role,
            "provider": "local",
            "endpoint": endpoint,
            "model": "default",
        }))?;
        store.upsert_neuron(&neuron)?;
    }

    let default_graph = serde_json::from_value(json!({
        "graphId": SYSTEM_DEFAULT_GRAPH_ID,
        "ownerId": "system",
        "tier": 4,
        "isDefault": true,
        "name": "Default assistant",
        "description": "Greeting fastpath, then a streamed single-neuron answer",
        "nodes": [
            {"id": "precheck", "type": "precheck", "config": {"steps": [
                {"type": "conditional", "config": {
                    "condition": "state.query.message === 'hello' || state.query.message === 'hi'",
                    "setField": "nextRoute",
                    "trueValue": "fastpath",
                    "falseValue": "continue"
                }},
                {"type": "transform", "config": {
                    "operation": "set",
                    "outputField": "finalResponse",
                    "value": "Hello! What can I help you with?"
                }, "condition": "data.nextRoute === 'fastpath'"}
            ]}},
            {"id": "context", "type": "context", "config": {"type": "transform", "config": {
                "operation": "build-messages",
                "outputField": "prompt",
                "messages": [
                    {"role": "system", "content": "{{state.systemPrompt}} Today is {{state.currentDate}}."},
                    {"role": "user", "content": "{{state.query.message}}"}
                ]
            }}},
            {"id": "respond", "type": "responder", "config": {"type": "neuron", "config": {
                "userPrompt": "{{state.prompt}}",
                "outputField": "response",
                "stream": true
            }}}
        ],
        "edges": [
            {"from": "__start__", "to": "precheck"},
            {"from": "precheck", "condition": "state.data.nextRoute",
             "targets": {"fastpath": "__end__", "continue": "context"}, "fallback": "context"},
            {"from": "context", "to": "respond"},
            {"from": "respond", "to": "__end__"}
        ]
    }))?;
    store.upsert_graph(&default_graph)?;

    let simple_graph = serde_json::from_value(json!({
        "graphId": SYSTEM_SIMPLE_GRAPH_ID,
        "ownerId": "system",
        "tier": 4,
        "name": "Simple responder",
        "nodes": [
            {"id": "respond", "type": "responder", "config": {"type": "neuron", "config": {
                "systemPrompt": "{{state.systemPrompt}}",
                "userPrompt": "{{state.query.message}}",
                "outputField": "response",
                "stream": true
            }}}
        ],
        "edges": [
            {"from": "__start__", "to": "respond"},
            {"from": "respond", "to": "__end__"}
        ]
    }))?;
    store.upsert_graph(&simple_graph)?;

    println!(
        "seeded {} and {} into {}",
        SYSTEM_DEFAULT_GRAPH_ID, SYSTEM_SIMPLE_GRAPH_ID, config.store_path
    );
    Ok(())
}
