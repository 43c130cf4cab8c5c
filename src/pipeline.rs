// src/pipeline.rs

use crate::classify::ItemClassifier;
use crate::config::Config;
use crate::customs::CustomsAssigner;
use crate::error::{IntrastatError, Result};
use crate::inference::InferenceService;
use crate::ledger::ProcessingLedger;
use crate::model::Invoice;
use crate::normalize::{apply_country_overrides, normalize};
use crate::output::{output_file_name, read_invoice_csv, write_invoice_csv};
use crate::pdf_extract::{PageContent, load_pages, read_pdf};
use crate::reconcile::{ReconcileOutcome, reconcile};
use crate::reference::{ProductWeightTable, TariffCatalog, load_product_weights, load_tariff_catalog};
use crate::report::{Report, aggregate, write_report};
use crate::targets::TargetSource;
use std::path::{Path, PathBuf};
use tracing::{error, info, instrument, warn};

/// Read-only lookup tables, loaded once per run.
#[derive(Debug, Clone, Default)]
pub struct ReferenceData {
    pub weights: ProductWeightTable,
    pub catalog: TariffCatalog,
}

impl ReferenceData {
    /// Both files are mandatory; a missing one is a configuration error.
    pub fn load(config: &Config) -> Result<Self> {
        Ok(ReferenceData {
            weights: load_product_weights(config.paths.product_weights_path())?,
            catalog: load_tariff_catalog(config.paths.tariff_catalog_path())?,
        })
    }
}

/// What one successfully processed PDF produced.
#[derive(Debug, Clone)]
pub struct ProcessedInvoice {
    pub invoice_number: String,
    pub csv_path: PathBuf,
    pub item_count: usize,
    pub reconciled: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// One pass over the input directory: every new PDF becomes one invoice CSV.
pub struct InvoiceProcessor<'a> {
    config: &'a Config,
    reference: &'a ReferenceData,
    classifier: &'a ItemClassifier,
    service: &'a dyn InferenceService,
    ledger: &'a ProcessingLedger,
}

impl<'a> InvoiceProcessor<'a> {
    pub fn new(
        config: &'a Config,
        reference: &'a ReferenceData,
        classifier: &'a ItemClassifier,
        service: &'a dyn InferenceService,
        ledger: &'a ProcessingLedger,
    ) -> Self {
        InvoiceProcessor {
            config,
            reference,
            classifier,
            service,
            ledger,
        }
    }

    /// Process every PDF in the input directory, in file-name order.
    ///
    /// A failing invoice is recorded and skipped; only configuration errors
    /// end the run.
    pub async fn process_directory(&self, targets: &mut dyn TargetSource) -> Result<RunSummary> {
        let input_dir = &self.config.paths.input_pdf_dir;
        let pdfs = list_pdfs(input_dir)?;
        info!(dir = %input_dir.display(), count = pdfs.len(), "PDFs to process");

        let mut summary = RunSummary::default();
        for path in &pdfs {
            let filename = file_name(path);
            let bytes = read_pdf(path, self.config.limits.max_pdf_size_mb);
            let uid = match &bytes {
                Ok(bytes) => ProcessingLedger::content_uid(bytes),
                Err(_) => ProcessingLedger::content_uid(filename.as_bytes()),
            };

            if self.ledger.is_processed(&uid)? {
                info!(file = %filename, "Already processed, skipping");
                summary.skipped += 1;
                continue;
            }

            let outcome = match bytes {
                Ok(bytes) => self.process_pdf(&filename, &bytes, targets).await,
                Err(e) => Err(e),
            };

            match outcome {
                Ok(done) => {
                    self.ledger.record_success(
                        &uid,
                        &filename,
                        &done.invoice_number,
                        &done.csv_path.display().to_string(),
                        done.item_count,
                    )?;
                    summary.processed += 1;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    error!(file = %filename, error = %e, "Invoice failed");
                    self.ledger.record_failure(&uid, &filename, &e.to_string())?;
                    summary.failed += 1;
                }
            }
        }

        info!(
            processed = summary.processed,
            skipped = summary.skipped,
            failed = summary.failed,
            "Run finished"
        );
        Ok(summary)
    }

    /// Pages → items → customs codes → targets → reconciled weights → CSV.
    #[instrument(skip_all, fields(file = %filename))]
    pub async fn process_pdf(
        &self,
        filename: &str,
        pdf_bytes: &[u8],
        targets: &mut dyn TargetSource,
    ) -> Result<ProcessedInvoice> {
        let pages = load_pages(pdf_bytes).map_err(|e| IntrastatError::InvoiceFailed {
            file: filename.to_string(),
            message: e.to_string(),
        })?;
        if pages.is_empty() {
            return Err(IntrastatError::InvoiceFailed {
                file: filename.to_string(),
                message: "PDF has no pages".into(),
            });
        }

        let stem = Path::new(filename)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| filename.to_string());
        let mut invoice = Invoice::new(filename, &stem);
        let mut extracted_number: Option<String> = None;

        for (idx, page) in pages.iter().enumerate() {
            let page_number = idx as u32 + 1;
            let raw = match page {
                PageContent::Unreadable(reason) => Err(IntrastatError::Extraction {
                    page: page_number,
                    message: reason.clone(),
                }),
                readable => self.service.extract_page(readable, page_number).await,
            };

            let extraction = normalize(
                &raw,
                page_number,
                &invoice.number,
                &self.reference.weights,
                self.classifier,
            );
            if let Some(number) = extraction.invoice_number {
                match extracted_number.as_deref() {
                    None => {
                        info!(invoice = %number, page = page_number, "Invoice number found");
                        extracted_number = Some(number);
                    }
                    Some(first) if first != number => {
                        warn!(kept = %first, seen = %number, page = page_number, "Conflicting invoice numbers");
                    }
                    Some(_) => {}
                }
            }
            invoice.push_page(extraction.items);
        }

        let number = extracted_number.unwrap_or_else(|| invoice.number.clone());
        invoice.set_number(&number);
        apply_country_overrides(&mut invoice.items, &self.config.overrides.country);

        CustomsAssigner::new(&self.config.overrides.customs, &self.reference.catalog)
            .assign_all(&mut invoice.items, self.service)
            .await;

        invoice.targets = targets.targets_for(&invoice)?;
        let reconciled = match invoice.targets {
            Some(t) => matches!(
                reconcile(&mut invoice.items, t, self.service).await,
                ReconcileOutcome::Reconciled { .. }
            ),
            None => false,
        };

        let csv_path = self.config.paths.output_csv_dir.join(output_file_name(&invoice.number));
        write_invoice_csv(&csv_path, &invoice.items)?;

        let mut placeholders = 0;
        for item in invoice.items.iter().filter(|i| i.is_placeholder()) {
            placeholders += 1;
            warn!(
                page = item.page_number,
                reason = item.error.as_deref().unwrap_or_default(),
                "Page written as placeholder row"
            );
        }
        info!(
            invoice = %invoice.number,
            pages = pages.len(),
            items = invoice.items.len(),
            placeholders,
            reconciled,
            "Invoice processed"
        );

        Ok(ProcessedInvoice {
            invoice_number: invoice.number,
            csv_path,
            item_count: invoice.items.len(),
            reconciled,
        })
    }
}

/// Summarize one invoice CSV and mark it reported in the ledger.
pub fn summarize_csv(
    csv_path: &Path,
    report_path: &Path,
    classifier: &ItemClassifier,
    ledger: &ProcessingLedger,
) -> Result<Report> {
    let items = read_invoice_csv(csv_path)?;
    let report = aggregate(&items, classifier);
    write_report(report_path, &report)?;
    ledger.mark_reported(&csv_path.display().to_string())?;
    Ok(report)
}

fn list_pdfs(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(IntrastatError::Configuration(format!(
            "input directory not found: {}",
            dir.display()
        )));
    }
    let mut pdfs: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
        })
        .collect();
    pdfs.sort();
    Ok(pdfs)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
