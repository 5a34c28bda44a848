use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use deckfit_contracts::deck::ContentSpec;
use deckfit_contracts::decisions::{write_decision_log, write_json_pretty};
use deckfit_contracts::error::ContractViolation;
use deckfit_contracts::events::EventWriter;
use deckfit_contracts::summary::{write_summary, RunSummary};
use deckfit_engine::{CancelFlag, LayoutEngine, PipelineConfig};
use serde_json::json;

const EXIT_CONTRACT_VIOLATION: i32 = 2;

#[derive(Debug, Parser)]
#[command(name = "deckfit", version, about = "Fit slide content to templates and review the deck")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Plan, fit and review a content spec, writing the effective spec and decision log.
    Run(RunArgs),
    /// Validate a content spec without running the pipeline.
    Check(CheckArgs),
    /// List the template catalog with computed zone capacities.
    Templates(TemplatesArgs),
}

#[derive(Debug, Parser)]
struct RunArgs {
    #[arg(long)]
    spec: PathBuf,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    provider: Option<String>,
    #[arg(long)]
    max_rounds: Option<u32>,
    #[arg(long)]
    deterministic: bool,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct CheckArgs {
    #[arg(long)]
    spec: PathBuf,
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct TemplatesArgs {
    #[arg(long)]
    category: Option<String>,
    #[arg(long)]
    config: Option<PathBuf>,
}

/// Flag values layered over the file and environment configuration.
#[derive(Debug, Default)]
struct ConfigOverrides {
    provider: Option<String>,
    max_rounds: Option<u32>,
    deterministic: bool,
    seed: Option<u64>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("deckfit error: {err:#}");
            std::process::exit(exit_code_for(&err));
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run_pipeline(args),
        Command::Check(args) => run_check(args),
        Command::Templates(args) => run_templates(args),
    }
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<ContractViolation>() {
        Some(violation) => {
            for row in violation.violations() {
                eprintln!("  {}: {}", row.path, row.message);
            }
            EXIT_CONTRACT_VIOLATION
        }
        None => 1,
    }
}

/// File, then `DECKFIT_*` environment, then flags.
fn resolve_config<F>(
    path: Option<&Path>,
    lookup: F,
    overrides: &ConfigOverrides,
) -> Result<PipelineConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = match path {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    config.apply_env_from(lookup)?;
    if let Some(provider) = &overrides.provider {
        config.provider = Some(provider.clone());
    }
    if let Some(max_rounds) = overrides.max_rounds {
        config.max_review_rounds = max_rounds;
    }
    if overrides.deterministic {
        config.deterministic = true;
    }
    if let Some(seed) = overrides.seed {
        config.seed = seed;
    }
    config.validate()?;
    Ok(config)
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn run_pipeline(args: RunArgs) -> Result<i32> {
    let overrides = ConfigOverrides {
        provider: args.provider.clone(),
        max_rounds: args.max_rounds,
        deterministic: args.deterministic,
        seed: args.seed,
    };
    let config = resolve_config(args.config.as_deref(), env_lookup, &overrides)?;
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    let summary = execute_run(config, &args.spec, &args.out, events_path, &CancelFlag::new())?;
    println!(
        "{}: {} after {} round(s), {} repair(s), {} unresolved, {} fallback(s)",
        summary.run_id,
        summary.review_state,
        summary.review_rounds,
        summary.repairs,
        summary.unresolved.len(),
        summary.fallbacks
    );
    Ok(0)
}

/// Runs the pipeline and writes every output file under `out`. Nothing but the event log is
/// written when the run fails.
fn execute_run(
    config: PipelineConfig,
    spec_path: &Path,
    out: &Path,
    events_path: PathBuf,
    cancel: &CancelFlag,
) -> Result<RunSummary> {
    let spec = ContentSpec::load(spec_path)?;
    let engine = LayoutEngine::new(config)?;
    engine.validate(&spec)?;
    std::fs::create_dir_all(out)
        .with_context(|| format!("failed creating output directory {}", out.display()))?;

    let deterministic = engine.config().deterministic;
    let events = EventWriter::new(
        Some(events_path.clone()),
        engine.run_id_for(&spec),
        !deterministic,
    );
    let output = engine.run(&spec, &events, cancel)?;

    write_json_pretty(&out.join("effective_spec.json"), &output.effective)?;
    write_decision_log(&out.join("decision_log.json"), &output.decision_log)?;
    let extra = json!({
        "provider": output.decision_log.provider,
        "spec": spec_path.display().to_string(),
        "events": events_path.display().to_string(),
    });
    write_summary(
        &out.join("summary.json"),
        &output.summary,
        extra.as_object(),
    )?;
    log::info!("outputs written to {}", out.display());
    Ok(output.summary)
}

fn run_check(args: CheckArgs) -> Result<i32> {
    let config = resolve_config(args.config.as_deref(), env_lookup, &ConfigOverrides::default())?;
    let engine = LayoutEngine::new(config)?;
    let spec = ContentSpec::load(&args.spec)?;
    let validated = engine.validate(&spec)?;
    let claims = validated
        .slides
        .iter()
        .map(|slide| slide.claims.len())
        .sum::<usize>();
    println!(
        "ok: {} slide(s), {claims} claim(s)",
        validated.slides.len()
    );
    for (original, slide) in spec.slides.iter().zip(&validated.slides) {
        if original.category != slide.category {
            println!("  {}: category '{}' -> '{}'", slide.id, original.category, slide.category);
        }
    }
    Ok(0)
}

fn run_templates(args: TemplatesArgs) -> Result<i32> {
    let config = resolve_config(args.config.as_deref(), env_lookup, &ConfigOverrides::default())?;
    let engine = LayoutEngine::new(config)?;
    for line in template_lines(&engine, args.category.as_deref())? {
        println!("{line}");
    }
    Ok(0)
}

fn template_lines(engine: &LayoutEngine, category: Option<&str>) -> Result<Vec<String>> {
    let catalog = engine.catalog();
    let rows = match category {
        Some(raw) => {
            let resolved = catalog
                .resolve_category(raw)
                .with_context(|| format!("unknown category '{raw}'"))?;
            catalog.candidates(&resolved)
        }
        None => catalog.list().collect(),
    };
    Ok(rows
        .into_iter()
        .map(|template| {
            let capacities = template.zone_capacities;
            let visuals = template.expected_visual_count_range;
            let claims = template.expected_claim_count_range;
            format!(
                "{:<24} {:<14} title={:<4} message={:<4} body={:<5} visuals={}..{} claims={}..{} kinds={}",
                template.name,
                template.category,
                capacities.title,
                capacities.message,
                capacities.body,
                visuals.min,
                visuals.max,
                claims.min,
                claims.max,
                if template.visual_kinds.is_empty() {
                    "-".to_string()
                } else {
                    template.visual_kinds.join(",")
                }
            )
        })
        .collect())
}
