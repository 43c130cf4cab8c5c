use crate::error::{IntrastatError, Result};
use rusqlite::{Connection, OptionalExtension, params};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::{info, warn};

/// Where a PDF stands in the workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceStatus {
    /// CSV written, not yet summarized.
    Processed,
    /// Aborted for this PDF; it is retried on the next run.
    Failed,
    /// Its CSV went into a summary report.
    Reported,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Processed => "processed",
            InvoiceStatus::Failed => "failed",
            InvoiceStatus::Reported => "reported",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "processed" => Some(InvoiceStatus::Processed),
            "failed" => Some(InvoiceStatus::Failed),
            "reported" => Some(InvoiceStatus::Reported),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    pub uid: String,
    pub filename: String,
    pub invoice_number: Option<String>,
    pub csv_path: Option<String>,
    pub status: InvoiceStatus,
    pub error: Option<String>,
    pub item_count: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerCounts {
    pub processed: usize,
    pub failed: usize,
    pub reported: usize,
}

/// SQLite record of every PDF the pipeline has seen.
pub struct ProcessingLedger {
    conn: Connection,
}

impl ProcessingLedger {
    /// Open (or create) the ledger. `":memory:"` gives a throwaway one.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS invoices (
                uid TEXT PRIMARY KEY,
                filename TEXT NOT NULL,
                invoice_number TEXT,
                csv_path TEXT,
                status TEXT NOT NULL,
                error TEXT,
                item_count INTEGER NOT NULL DEFAULT 0,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_invoices_status ON invoices(status)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_invoices_csv_path ON invoices(csv_path)",
            [],
        )?;

        info!("Ledger initialized");
        Ok(Self { conn })
    }

    /// Content hash of a PDF, so renamed copies are still recognized.
    pub fn content_uid(pdf_bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(pdf_bytes);
        format!("{:x}", hasher.finalize())
    }

    /// True once a PDF has produced its CSV (reported or not).
    pub fn is_processed(&self, uid: &str) -> Result<bool> {
        Ok(matches!(
            self.get_entry(uid)?.map(|e| e.status),
            Some(InvoiceStatus::Processed | InvoiceStatus::Reported)
        ))
    }

    pub fn record_success(
        &self,
        uid: &str,
        filename: &str,
        invoice_number: &str,
        csv_path: &str,
        item_count: usize,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO invoices (uid, filename, invoice_number, csv_path, status, error, item_count)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6)
             ON CONFLICT(uid) DO UPDATE SET
                filename = excluded.filename,
                invoice_number = excluded.invoice_number,
                csv_path = excluded.csv_path,
                status = excluded.status,
                error = NULL,
                item_count = excluded.item_count,
                updated_at = CURRENT_TIMESTAMP",
            params![
                uid,
                filename,
                invoice_number,
                csv_path,
                InvoiceStatus::Processed.as_str(),
                item_count as i64,
            ],
        )?;
        info!(filename, invoice_number, items = item_count, "Invoice recorded as processed");
        Ok(())
    }

    pub fn record_failure(&self, uid: &str, filename: &str, error: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO invoices (uid, filename, status, error)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(uid) DO UPDATE SET
                filename = excluded.filename,
                status = excluded.status,
                error = excluded.error,
                updated_at = CURRENT_TIMESTAMP",
            params![uid, filename, InvoiceStatus::Failed.as_str(), error],
        )?;
        warn!(filename, error, "Invoice recorded as failed");
        Ok(())
    }

    /// Mark every invoice whose CSV is `csv_path` as reported. Returns how
    /// many rows changed.
    pub fn mark_reported(&self, csv_path: &str) -> Result<usize> {
        let changed = self.conn.execute(
            "UPDATE invoices SET status = ?1, updated_at = CURRENT_TIMESTAMP
             WHERE csv_path = ?2 AND status = ?3",
            params![
                InvoiceStatus::Reported.as_str(),
                csv_path,
                InvoiceStatus::Processed.as_str()
            ],
        )?;
        info!(csv_path, changed, "Invoices marked as reported");
        Ok(changed)
    }

    pub fn get_entry(&self, uid: &str) -> Result<Option<LedgerEntry>> {
        self.conn
            .query_row(
                "SELECT uid, filename, invoice_number, csv_path, status, error, item_count
                 FROM invoices WHERE uid = ?1",
                params![uid],
                Self::row_to_entry,
            )
            .optional()?
            .transpose()
    }

    /// Failed invoices, oldest first.
    pub fn failures(&self) -> Result<Vec<LedgerEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT uid, filename, invoice_number, csv_path, status, error, item_count
             FROM invoices WHERE status = ?1 ORDER BY updated_at, filename",
        )?;
        let rows = stmt.query_map(params![InvoiceStatus::Failed.as_str()], Self::row_to_entry)?;
        rows.map(|row| row?).collect()
    }

    fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<LedgerEntry>> {
        let status: String = row.get(4)?;
        let item_count: i64 = row.get(6)?;
        let entry = InvoiceStatus::parse(&status)
            .map(|status| -> rusqlite::Result<LedgerEntry> {
                Ok(LedgerEntry {
                    uid: row.get(0)?,
                    filename: row.get(1)?,
                    invoice_number: row.get(2)?,
                    csv_path: row.get(3)?,
                    status,
                    error: row.get(5)?,
                    item_count: item_count.max(0) as usize,
                })
            })
            .transpose()?
            .ok_or_else(|| IntrastatError::validation("ledger", 0, format!("unknown status '{status}'")));
        Ok(entry)
    }

    pub fn get_counts(&self) -> Result<LedgerCounts> {
        let count = |status: InvoiceStatus| -> Result<usize> {
            let n: i64 = self.conn.query_row(
                "SELECT COUNT(*) FROM invoices WHERE status = ?1",
                params![status.as_str()],
                |row| row.get(0),
            )?;
            Ok(n as usize)
        };

        Ok(LedgerCounts {
            processed: count(InvoiceStatus::Processed)?,
            failed: count(InvoiceStatus::Failed)?,
            reported: count(InvoiceStatus::Reported)?,
        })
    }
}
