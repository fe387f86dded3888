use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use research_core::stub::{StubLanguageModel, StubSearchProvider, StubTransport};
use research_core::{
    ConfigLoader, EventCollector, PipelineEvent, PipelineOrchestrator, Question, ResearchConfig,
    ResearchOptions, ResearchOutcome, TelemetryOptions, init_metrics_from_env, init_telemetry,
    persist_trace,
};
use tokio::runtime::Runtime;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "research",
    version,
    about = "Research a question on the web and write a cited report"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Research a question and print the report.
    Run(RunArgs),
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ExplainFormat {
    Markdown,
    Mermaid,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Question to research.
    #[arg(long)]
    question: String,

    /// Configuration file (defaults to $RESEARCH_CONFIG or ./research.toml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of sub-queries to generate.
    #[arg(long = "sub-queries")]
    sub_queries: Option<usize>,

    /// Search results researched per sub-query.
    #[arg(long)]
    results_per_query: Option<usize>,

    /// Print the research trace after the report.
    #[arg(long, value_enum)]
    explain: Option<ExplainFormat>,

    /// Write the trace as JSON into this directory.
    #[arg(long)]
    trace_dir: Option<PathBuf>,

    /// Print the full outcome as JSON instead of markdown.
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Report progress on stderr while the request runs.
    #[arg(long, default_value_t = false)]
    progress: bool,

    /// Use built-in stand-ins instead of the network and language model.
    #[arg(long, default_value_t = false)]
    offline: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let rt = Runtime::new()?;
    rt.block_on(async move {
        match cli.command {
            Command::Run(args) => run_command(args).await,
        }
    })
}

async fn run_command(args: RunArgs) -> Result<()> {
    let config = ConfigLoader::load(args.config.clone()).context("failed to load configuration")?;
    init_telemetry(TelemetryOptions {
        env_filter: Some(config.logging.level.clone()),
        ..TelemetryOptions::default()
    })?;
    init_metrics_from_env("research-cli");

    let question = Question::new(args.question.as_str())?;
    info!(question = %question, offline = args.offline, "starting research");

    let (events, receiver) = if args.progress {
        let (events, receiver) = EventCollector::new();
        (events, Some(receiver))
    } else {
        (EventCollector::disabled(), None)
    };
    let progress = receiver.map(|receiver| tokio::spawn(print_progress(receiver)));

    let pipeline = build_pipeline(config, args.offline, events)?;
    let options = ResearchOptions {
        sub_query_count: args.sub_queries,
        results_per_query: args.results_per_query,
    };
    let result = pipeline.research_with_options(&question, options).await;
    drop(pipeline);
    if let Some(progress) = progress {
        let _ = progress.await;
    }
    let outcome = result?;

    if let Some(dir) = &args.trace_dir {
        let path = persist_trace(dir, &outcome.request_id, outcome.trace.events())?;
        info!(path = %path.display(), "trace written");
    }

    print_outcome(&outcome, &args)
}

fn build_pipeline(
    config: ResearchConfig,
    offline: bool,
    events: EventCollector,
) -> Result<PipelineOrchestrator> {
    let builder = PipelineOrchestrator::builder(config).events(events);
    let builder = if offline {
        builder
            .language_model(Arc::new(StubLanguageModel::offline()))
            .search_provider(Arc::new(StubSearchProvider::new()))
            .transport(Arc::new(StubTransport::new()))
    } else {
        builder
    };
    Ok(builder.build()?)
}

fn print_outcome(outcome: &ResearchOutcome, args: &RunArgs) -> Result<()> {
    if args.json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
        return Ok(());
    }

    println!("{}", outcome.report.to_markdown());
    let stats = &outcome.stats;
    eprintln!(
        "{} sub-queries, {} hits, {} summarized, {} fetch failures, {} summary failures, {} failed searches in {} ms",
        stats.sub_queries,
        stats.hits,
        stats.evidence_ok,
        stats.fetch_failed,
        stats.summarize_failed,
        stats.failed_searches,
        stats.elapsed_ms
    );

    if let Some(format) = args.explain {
        let summary = outcome.trace.summary();
        let rendered = match format {
            ExplainFormat::Markdown => summary.render_markdown(),
            ExplainFormat::Mermaid => summary.render_mermaid(),
        };
        println!("\n{rendered}");
    }
    Ok(())
}

async fn print_progress(mut receiver: UnboundedReceiver<PipelineEvent>) {
    while let Some(event) = receiver.recv().await {
        match event {
            PipelineEvent::StageStarted { stage, .. } => {
                eprintln!("[stage] {}", stage.as_str());
            }
            PipelineEvent::SubQueriesGenerated { sub_queries, .. } => {
                for query in sub_queries {
                    eprintln!("[query] {query}");
                }
            }
            PipelineEvent::SearchCompleted {
                sub_query,
                hits,
                error,
                ..
            } => match error {
                Some(error) => eprintln!("[search] {sub_query}: failed ({error})"),
                None => eprintln!("[search] {sub_query}: {hits} hits"),
            },
            PipelineEvent::EvidenceCollected {
                source_url, status, ..
            } => {
                eprintln!("[page] {source_url}: {}", status.as_str());
            }
            PipelineEvent::ReportReady {
                sources,
                duration_ms,
                ..
            } => {
                eprintln!("[done] {sources} sources in {duration_ms} ms");
            }
        }
    }
}
