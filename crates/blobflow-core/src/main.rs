use anyhow::{bail, Context, Result};
use blobflow_cascade::{
    CascadeReport, NodeOutcome, Provider, ProviderError, ProviderOutput, TransformInput,
};
use blobflow_core::{logging, ContentEngine, EngineConfig, EngineError, LogFormat};
use blobflow_delta::{BlobId, Delta, DeltaOperation, Materializer};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

fn cli() -> Command {
    Command::new("blobflow")
        .version(blobflow_core::VERSION)
        .about("Event-sourced blob materialization with DAG cascades")
        .subcommand_required(true)
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .global(true)
                .default_value("pretty")
                .value_parser(value_parser!(LogFormat))
                .help("Log output format"),
        )
        .subcommand(
            Command::new("simulate")
                .about("Create X, transform it into child Y, and cascade")
                .arg(
                    Arg::new("config")
                        .long("config")
                        .value_parser(value_parser!(PathBuf))
                        .help("Engine configuration (TOML)"),
                )
                .arg(
                    Arg::new("fail")
                        .long("fail")
                        .action(ArgAction::SetTrue)
                        .help("Make the expander provider fail"),
                ),
        )
        .subcommand(
            Command::new("replay")
                .about("Materialize a JSON delta chain twice and compare fingerprints")
                .arg(
                    Arg::new("file")
                        .long("file")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("JSON array of deltas in version order"),
                ),
        )
        .subcommand(Command::new("config").about("Print the default configuration as TOML"))
}

/// Appends ", expanded" to the text of the source blob
struct Expander {
    fail: bool,
}

#[async_trait::async_trait]
impl Provider for Expander {
    async fn transform(&self, input: TransformInput) -> Result<ProviderOutput, ProviderError> {
        if self.fail {
            return Err(ProviderError::Fatal(format!(
                "expander refused {}",
                input.blob_id
            )));
        }
        let source = input
            .source
            .as_ref()
            .and_then(|s| s.content.as_str())
            .unwrap_or_default();
        Ok(ProviderOutput::Content {
            content: json!(format!("{source}, expanded")),
            content_type: "text/plain".into(),
        })
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let matches = cli().get_matches();
    let format = matches
        .get_one::<LogFormat>("log-format")
        .copied()
        .unwrap_or_default();
    logging::init(format);

    match matches.subcommand() {
        Some(("simulate", args)) => simulate(args).await,
        Some(("replay", args)) => replay(args),
        Some(("config", _)) => {
            print!("{}", EngineConfig::default().to_toml_string()?);
            Ok(ExitCode::SUCCESS)
        }
        _ => Ok(ExitCode::FAILURE),
    }
}

async fn simulate(args: &ArgMatches) -> Result<ExitCode> {
    let config = match args.get_one::<PathBuf>("config") {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let mut engine = ContentEngine::builder()
        .config(config.with_auto_cascade(false))
        .provider(
            "expander",
            Arc::new(Expander {
                fail: args.get_flag("fail"),
            }),
        )
        .build()?;

    let x = BlobId::new();
    let y = BlobId::new();

    let created = engine
        .append(
            Delta::builder(x, DeltaOperation::Create)
                .user("alice")
                .init(json!("draft"), "text/plain")
                .build()?,
        )
        .await?;
    println!("X {x}");
    println!("  v{} {}", created.state.version, created.state.content);

    let transformed = engine
        .append(
            Delta::builder(x, DeltaOperation::Transform)
                .user("alice")
                .provider("expander")
                .replace(json!("draft"))
                .child(y)
                .version(2)
                .build()?,
        )
        .await?;
    println!("  v{} declares child {y}", transformed.state.version);
    for rejected in &transformed.rejected_edges {
        println!("  rejected: {rejected}");
    }

    let report = engine.cascade(x).await?;
    print_report(&report);

    match engine.get_blob(y, None).await {
        Ok(state) => {
            println!("Y {y}");
            println!("  v{} {}", state.version, state.content);
        }
        Err(err) => println!("Y {y}: {err}"),
    }

    engine.shutdown().await;
    Ok(if report.partial_failure() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn print_report(report: &CascadeReport) {
    println!();
    println!(
        "Cascade from {} ({} {})",
        report.trigger.root, report.trigger.event, report.trigger.delta_id
    );
    for (i, level) in report.levels.iter().enumerate() {
        println!("  level {}: {} node(s)", i + 1, level.len());
    }
    for node in &report.nodes {
        let provider = node
            .provider_id
            .as_ref()
            .map_or_else(|| "-".to_string(), ToString::to_string);
        let outcome = match &node.outcome {
            NodeOutcome::Completed(delta) => format!("completed, delta {delta}"),
            NodeOutcome::Skipped(reason) => format!("skipped ({reason:?})"),
            NodeOutcome::Failed(err) => format!("failed: {err}"),
        };
        println!("  [{}] {} via {provider}: {outcome}", node.level, node.blob_id);
    }
    for err in EngineError::from_report(report) {
        let hint = if err.is_retryable() { ", retryable" } else { "" };
        println!("  error ({}{hint}): {err}", err.kind());
    }
    println!(
        "  status {:?}, {} failure(s), {:?}",
        report.status(),
        report.failures().len(),
        report.elapsed
    );
    println!();
}

fn replay(args: &ArgMatches) -> Result<ExitCode> {
    let path = args
        .get_one::<PathBuf>("file")
        .context("--file is required")?;
    let input = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let chain: Vec<Delta> = serde_json::from_str(&input).context("invalid delta chain")?;

    let first = Materializer::materialize(&chain)?;
    let second = Materializer::materialize(&chain)?;
    let (a, b) = (first.fingerprint()?, second.fingerprint()?);

    println!("{}", serde_json::to_string_pretty(&first)?);
    println!("fingerprint {a}");
    if a != b {
        bail!("replay diverged: {a} != {b}");
    }
    Ok(ExitCode::SUCCESS)
}
