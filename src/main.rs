use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use taskwing::{
    agents::BootstrapKind,
    api,
    bootstrap::BootstrapRequest,
    clarify::{ClarifyRequest, ClarifyResult},
    config::{Config, LogFormat},
    error::AppError,
    events::{BusCloser, EventBus, EventProducer, NodeKind, StreamEvent},
    pipeline::{Pipeline, SearchRequest},
    planner::GenerateRequest,
    storage::{NodeType, Storage},
};

#[derive(Parser)]
#[command(
    name = "taskwing",
    version,
    about = "Turn ambiguous goals into grounded implementation plans"
)]
struct Cli {
    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP API
    Serve,
    /// Mine a project for architectural knowledge
    Bootstrap(BootstrapArgs),
    /// Clarify a goal and generate a plan
    Plan(PlanArgs),
    /// Search the knowledge graph
    #[command(alias = "ask")]
    Search(SearchArgs),
    /// List knowledge nodes
    List {
        /// Only nodes of this type
        #[arg(long = "type")]
        node_type: Option<NodeType>,
    },
    /// List plans
    Plans,
}

#[derive(Args)]
struct BootstrapArgs {
    #[arg(long, default_value = ".")]
    project_path: PathBuf,
    /// Replace existing knowledge
    #[arg(long)]
    clear: bool,
    /// Agents to run (docs, deps, structure); all by default
    #[arg(long, value_delimiter = ',')]
    agents: Vec<BootstrapKind>,
}

#[derive(Args)]
struct PlanArgs {
    goal: String,
    /// Let the model answer clarifying questions
    #[arg(long)]
    auto_answer: bool,
    #[arg(long)]
    max_rounds: Option<u32>,
    /// Plan without waiting for the goal to be ready
    #[arg(short, long)]
    yes: bool,
}

#[derive(Args)]
struct SearchArgs {
    query: String,
    #[arg(long)]
    limit: Option<usize>,
    /// Ask the model to answer from the results
    #[arg(long)]
    answer: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return ExitCode::from(1);
        }
    };

    init_logging(&config, cli.verbose);

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted");
            interrupt.cancel();
        }
    });

    match run(cli.command, config, &cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = match e.downcast_ref::<AppError>() {
                Some(AppError::Cancelled) => {
                    eprintln!("cancelled");
                    130
                }
                Some(err) => {
                    eprintln!("error: {}", err.user_message());
                    err.kind().exit_code()
                }
                None => {
                    eprintln!("error: {:#}", e);
                    2
                }
            };
            let code = if cancel.is_cancelled() { 130 } else { code };
            ExitCode::from(code as u8)
        }
    }
}

async fn run(command: Command, config: Config, cancel: &CancellationToken) -> anyhow::Result<()> {
    let pipeline = Pipeline::from_config(config).await?;
    info!(version = env!("CARGO_PKG_VERSION"), "TaskWing ready");

    match command {
        Command::Serve => api::serve(pipeline, cancel.clone()).await?,
        Command::Bootstrap(args) => bootstrap(&pipeline, args, cancel).await?,
        Command::Plan(args) => plan(&pipeline, args, cancel).await?,
        Command::Search(args) => search(&pipeline, args, cancel).await?,
        Command::List { node_type } => {
            let nodes = pipeline
                .storage()
                .list_nodes(node_type)
                .await
                .map_err(AppError::from)?;
            for node in &nodes {
                let short_id: String = node.id.chars().take(8).collect();
                println!("{:<12} {}  {}", node.node_type, short_id, node.summary);
            }
            println!("{} node(s)", nodes.len());
        }
        Command::Plans => {
            let plans = pipeline
                .storage()
                .list_plans()
                .await
                .map_err(AppError::from)?;
            for plan in &plans {
                println!("{}  [{}]  {}", plan.id, plan.status, plan.goal_summary);
            }
            println!("{} plan(s)", plans.len());
        }
    }
    Ok(())
}

async fn bootstrap(
    pipeline: &Pipeline,
    args: BootstrapArgs,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let (bus, producer, renderer) = progress_bus("bootstrap");
    let request = BootstrapRequest::new(args.project_path)
        .with_agents(args.agents)
        .with_clear(args.clear);
    let result = pipeline.bootstrap().run(request, Arc::new(producer), cancel).await;
    finish_progress(bus, renderer).await;
    let report = result?;

    for agent in &report.agents {
        match (&agent.error, &agent.warning) {
            (Some(error), _) => println!("  {:<10} failed: {}", agent.agent, error),
            (None, Some(warning)) => println!(
                "  {:<10} {} finding(s) ({})",
                agent.agent, agent.findings, warning
            ),
            (None, None) => println!("  {:<10} {} finding(s)", agent.agent, agent.findings),
        }
    }
    for (node_type, count) in &report.counts {
        println!("  {:<12} {}", node_type, count);
    }
    println!(
        "Stored {} node(s) and {} edge(s){}",
        report.nodes_created,
        report.edges_created,
        if report.architecture {
            ", including the architecture overview"
        } else {
            ""
        }
    );
    Ok(())
}

async fn plan(
    pipeline: &Pipeline,
    args: PlanArgs,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let (bus, producer, renderer) = progress_bus("plan");
    let outcome = plan_with_sink(pipeline, args, &producer, cancel).await;
    drop(producer);
    finish_progress(bus, renderer).await;
    outcome
}

async fn plan_with_sink(
    pipeline: &Pipeline,
    args: PlanArgs,
    sink: &EventProducer,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut request = ClarifyRequest::new(&args.goal);
    if let Some(max_rounds) = args.max_rounds {
        request = request.with_max_rounds(max_rounds);
    }
    if args.auto_answer {
        request = request.with_auto_answer();
    }

    let result = loop {
        let result = pipeline.clarify().clarify(request, sink, cancel).await?;
        print_round(&result);
        if !result.success {
            anyhow::bail!("{}", result.message);
        }
        if result.is_ready_to_plan || args.yes {
            break result;
        }

        request = ClarifyRequest::for_session(&result.clarify_session_id);
        if args.auto_answer {
            request = request.with_auto_answer();
            continue;
        }
        let mut answers = Vec::with_capacity(result.questions.len());
        for question in &result.questions {
            answers.push(prompt(&mut stdin, question, cancel).await?);
        }
        request = request.with_answers(answers);
    };

    let mut generate = GenerateRequest::from_session(&result.clarify_session_id);
    if !result.is_ready_to_plan {
        generate = generate.bypassing_readiness();
    }
    let generated = pipeline.planner().generate(generate, sink, cancel).await?;
    if !generated.success {
        anyhow::bail!("{}", generated.message);
    }

    println!("\n{}", generated.message);
    for (i, task) in generated.tasks.iter().enumerate() {
        println!("{:>2}. [p{}] {}", i + 1, task.priority, task.title);
    }
    for warning in &generated.semantic_warnings {
        println!("  warning: {}", warning);
    }
    for error in &generated.semantic_errors {
        println!("  error: {}", error);
    }
    if let Some(plan_id) = &generated.plan_id {
        println!("Plan {}", plan_id);
    }
    Ok(())
}

async fn search(
    pipeline: &Pipeline,
    args: SearchArgs,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let mut request = SearchRequest::new(args.query).with_answer(args.answer);
    if let Some(limit) = args.limit {
        request = request.with_limit(limit);
    }
    let response = pipeline.search(request, cancel).await?;

    if response.results.is_empty() {
        println!("No relevant knowledge found.");
        return Ok(());
    }
    for hit in &response.results {
        println!("{:.2}  [{}] {}", hit.score, hit.node.node_type, hit.node.summary);
    }
    if !response.answer.is_empty() {
        println!("\n{}", response.answer);
    }
    Ok(())
}

fn print_round(result: &ClarifyResult) {
    println!("\nRound {}/{}: {}", result.round, result.max_rounds, result.goal_summary);
    if !result.success {
        return;
    }
    if result.is_ready_to_plan {
        println!("{}", result.enriched_goal);
    }
    println!("{}", result.message);
}

/// Ask one question on stdin; empty input skips it.
async fn prompt(
    lines: &mut Lines<BufReader<Stdin>>,
    question: &str,
    cancel: &CancellationToken,
) -> anyhow::Result<String> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(format!("? {}\n> ", question).as_bytes()).await?;
    stdout.flush().await?;

    let line = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(AppError::Cancelled.into()),
        line = lines.next_line() => line?,
    };
    Ok(line.unwrap_or_default().trim().to_string())
}

/// A bus with one producer and a task rendering its events to stderr.
fn progress_bus(source: &str) -> (BusCloser, EventProducer, JoinHandle<()>) {
    let mut bus = EventBus::new();
    let producer = bus.producer(source);
    let closer = bus.closer();
    let renderer = tokio::spawn(async move {
        while let Some(envelope) = bus.recv().await {
            render_event(&envelope.event);
        }
    });
    (closer, producer, renderer)
}

async fn finish_progress(closer: BusCloser, renderer: JoinHandle<()>) {
    closer.close();
    if let Err(e) = renderer.await {
        warn!(error = %e, "Progress renderer failed");
    }
}

fn render_event(event: &StreamEvent) {
    match event {
        StreamEvent::NodeStart {
            agent,
            node: NodeKind::Model,
        } => eprintln!("  {} …", agent),
        StreamEvent::Retry {
            agent,
            attempt,
            reason,
        } => eprintln!("  {} retry {} ({})", agent, attempt, reason),
        StreamEvent::AgentComplete {
            agent,
            warning: Some(warning),
        } => eprintln!("  {} done: {}", agent, warning),
        StreamEvent::AgentError { agent, message } => eprintln!("  {} failed: {}", agent, message),
        _ => {}
    }
}

/// Initialize tracing/logging
fn init_logging(config: &Config, verbose: bool) {
    let level = if verbose { "debug" } else { config.logging.level.as_str() };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
