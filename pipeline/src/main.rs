use anyhow::Context;
use chrono::Local;
use clap::Parser;
use env_logger::Env;
use log::info;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tomocore::record::ingest::ingest_new_stacks;
use tomocore::record::RecordStore;
use tomocore::stages::CommandRunner;
use workflow::config::{BatchMode, WorkflowConfig};
use workflow::runner::{RunSummary, Runner};

mod generator;
mod workflow;

#[derive(Parser)]
#[command(author, version, about = "Resumable tilt-series preprocessing driver")]
struct Args {
    /// Load a workflow config from YAML
    #[arg(long)]
    workflow: Option<PathBuf>,
    /// Project root, overriding the workflow's root_dir
    #[arg(long)]
    root: Option<PathBuf>,
    /// Register new metadata documents before running
    #[arg(long, default_value_t = false)]
    ingest: bool,
    /// Generate synthetic tilt series before running
    #[arg(long, default_value_t = false)]
    synthetic: bool,
    #[arg(long, value_enum)]
    batch_mode: Option<BatchMode>,
    /// Stop at the first failing stage
    #[arg(long, default_value_t = false)]
    halt_on_error: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = if let Some(path) = args.workflow {
        WorkflowConfig::load(path)?
    } else {
        WorkflowConfig::from_args(PathBuf::from("."))
    };
    if let Some(root) = args.root {
        config.root_dir = root;
    }
    if let Some(mode) = args.batch_mode {
        config.batch_mode = mode;
    }
    config.halt_on_error |= args.halt_on_error;

    let mut store = RecordStore::open(config.store_path())
        .with_context(|| format!("opening record store {}", config.store_path().display()))?;

    if args.ingest {
        let added = ingest_new_stacks(&config.root_dir, &config.ingest, &config.stack, &mut store)
            .context("ingesting metadata documents")?;
        info!("ingested {} new tilt series", added.len());
    }
    if args.synthetic {
        let added =
            generator::synthetic::generate(&config.root_dir, &config.synthetic, &config.stack, &mut store)
                .context("generating synthetic tilt series")?;
        info!("generated {} synthetic tilt series", added.len());
    }

    let mut runner = Runner::new(config.clone(), Arc::new(CommandRunner));
    let summary = runner.execute(&mut store)?;

    println!(
        "Run finished -> records {}, executed {}, skipped {}, failed {}",
        store.len(),
        summary.metrics.executed,
        summary.metrics.skipped,
        summary.metrics.errors
    );
    for failure in &summary.failures {
        println!(
            "  tomogram {} failed at {}: {}",
            failure.tomo_num, failure.stage, failure.message
        );
    }

    append_report(&config, &store, &summary).context("writing run report")?;
    Ok(())
}

fn append_report(config: &WorkflowConfig, store: &RecordStore, summary: &RunSummary) -> anyhow::Result<()> {
    let mut report = format!(
        "{} mode={:?} records={} executed={} skipped={} failed={}\n",
        Local::now().format("%Y-%m-%d %H:%M:%S"),
        config.batch_mode,
        store.len(),
        summary.metrics.executed,
        summary.metrics.skipped,
        summary.metrics.errors
    );
    for failure in &summary.failures {
        report.push_str(&format!(
            "  tomo={} stage={} error={}\n",
            failure.tomo_num, failure.stage, failure.message
        ));
    }
    let report_path = config.log_path();
    if let Some(parent) = report_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(report_path)?;
    file.write_all(report.as_bytes())?;
    Ok(())
}
