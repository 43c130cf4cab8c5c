// src/error.rs

use thiserror::Error;

/// Every failure the pipeline can record or propagate.
///
/// Only `Configuration` aborts a run. Per-page, per-item and per-invoice
/// failures are contained by the caller and written as marker strings.
#[derive(Error, Debug)]
pub enum IntrastatError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("extraction failed on page {page}: {message}")]
    Extraction { page: u32, message: String },

    #[error("customs code assignment failed: {0}")]
    Assignment(String),

    #[error("weight proposal unusable: {0}")]
    Reconciliation(String),

    #[error("{file} line {line}: {message}")]
    Validation {
        file: String,
        line: u64,
        message: String,
    },

    #[error("inference service error: {0}")]
    Inference(String),

    #[error("invoice {file} failed: {message}")]
    InvoiceFailed { file: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Pdf(#[from] lopdf::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl IntrastatError {
    /// Whether this error must abort the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, IntrastatError::Configuration(_))
    }

    pub fn validation(file: impl Into<String>, line: u64, message: impl Into<String>) -> Self {
        IntrastatError::Validation {
            file: file.into(),
            line,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, IntrastatError>;
