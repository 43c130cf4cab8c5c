mod classify;
mod config;
mod customs;
mod error;
mod inference;
mod ledger;
mod llm_client;
mod locale;
mod logging;
mod model;
mod normalize;
mod output;
mod pdf_extract;
mod pipeline;
mod reconcile;
mod reference;
mod report;
mod targets;

use classify::ItemClassifier;
use config::Config;
use inference::Throttled;
use ledger::ProcessingLedger;
use llm_client::LlmClient;
use pipeline::{InvoiceProcessor, ReferenceData};
use std::path::{Path, PathBuf};
use std::time::Duration;
use targets::PromptTargets;
use tracing::{error, info, warn};

const USAGE: &str = "usage: intrastat-assist [process | report <invoice.csv> [summary.csv] | codes | validate | stats]";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let cfg = Config::load(Config::default_path())?;

    let result = match args.first().map(String::as_str) {
        None | Some("process") => process(&cfg).await,
        Some("report") => match args.get(1) {
            Some(csv) => report(&cfg, Path::new(csv), args.get(2).map(PathBuf::from)),
            None => {
                eprintln!("{USAGE}");
                return Err("report needs an invoice CSV path".into());
            }
        },
        Some("codes") => codes(&cfg),
        Some("validate") => validate(&cfg),
        Some("stats") => stats(&cfg),
        Some(other) => {
            eprintln!("{USAGE}");
            return Err(format!("unknown command '{other}'").into());
        }
    };

    if let Err(e) = &result {
        error!(error = %e, fatal = e.is_fatal(), "Run aborted");
    }
    Ok(result?)
}

fn open_ledger(cfg: &Config) -> error::Result<ProcessingLedger> {
    if let Some(parent) = cfg.paths.ledger_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    ProcessingLedger::new(&cfg.paths.ledger_path)
}

async fn process(cfg: &Config) -> error::Result<()> {
    // reference data and credentials first: both abort before any PDF is touched
    let reference = ReferenceData::load(cfg)?;
    let classifier = ItemClassifier::new(&cfg.classify)?;
    let client = LlmClient::connect(&cfg.llm).await?;
    let service = Throttled::new(client, Duration::from_millis(cfg.llm.min_call_interval_ms));
    let ledger = open_ledger(cfg)?;

    info!(
        weights = reference.weights.len(),
        tariff_codes = reference.catalog.len(),
        customs_overrides = cfg.overrides.customs.len(),
        "Reference data ready"
    );

    let processor = InvoiceProcessor::new(cfg, &reference, &classifier, &service, &ledger);
    let mut targets = PromptTargets::stdin();
    let summary = processor.process_directory(&mut targets).await?;

    println!(
        "Processed {} invoice(s), skipped {}, failed {}.",
        summary.processed, summary.skipped, summary.failed
    );
    Ok(())
}

fn report(cfg: &Config, csv: &Path, out: Option<PathBuf>) -> error::Result<()> {
    let classifier = ItemClassifier::new(&cfg.classify)?;
    let ledger = open_ledger(cfg)?;
    let out = out.unwrap_or_else(|| report::default_report_path(&cfg.paths.reports_dir, csv));

    let summary = pipeline::summarize_csv(csv, &out, &classifier, &ledger)?;
    println!(
        "{} group(s), net {} kg, gross {} kg -> {}",
        summary.groups.len(),
        summary.total.net_weight,
        summary.total.gross_weight,
        out.display()
    );
    Ok(())
}

fn codes(cfg: &Config) -> error::Result<()> {
    let catalog = reference::load_tariff_catalog(cfg.paths.tariff_catalog_path())?;
    for (code, description) in catalog.iter() {
        println!("{code}  {description}");
    }
    Ok(())
}

fn validate(cfg: &Config) -> error::Result<()> {
    let reference = ReferenceData::load(cfg)?;
    ItemClassifier::new(&cfg.classify)?;
    if reference.weights.is_empty() {
        warn!(path = %cfg.paths.product_weights_path().display(), "Product weight table has no rows");
    }
    if reference.catalog.is_empty() {
        warn!(path = %cfg.paths.tariff_catalog_path().display(), "Tariff catalog has no codes");
    }
    println!(
        "{}: {} item weights\n{}: {} tariff codes",
        cfg.paths.product_weights_path().display(),
        reference.weights.len(),
        cfg.paths.tariff_catalog_path().display(),
        reference.catalog.len()
    );
    Ok(())
}

fn stats(cfg: &Config) -> error::Result<()> {
    let ledger = open_ledger(cfg)?;
    let counts = ledger.get_counts()?;
    info!(
        processed = counts.processed,
        reported = counts.reported,
        failed = counts.failed,
        "Ledger statistics"
    );
    println!(
        "processed: {}\nreported:  {}\nfailed:    {}",
        counts.processed, counts.reported, counts.failed
    );
    for entry in ledger.failures()? {
        println!("  {}: {}", entry.filename, entry.error.unwrap_or_default());
    }
    Ok(())
}
