// src/inference.rs

use crate::error::{IntrastatError, Result};
use crate::pdf_extract::PageContent;
use crate::reference::TariffCatalog;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// One item as sent in a weight-proposal request.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProposalItem {
    pub item_code: String,
    pub description: String,
    pub quantity: Option<f64>,
    /// kg; `None` when the preliminary weight is a marker.
    pub preliminary_net_weight: Option<f64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WeightProposalRequest {
    pub items: Vec<ProposalItem>,
    pub target_net_weight: f64,
    pub target_gross_weight: f64,
}

/// The external model that reads invoices and proposes codes and weights.
///
/// Every method returns the raw reply text. Parsing and validation belong to
/// the component that asked, so a misbehaving model can never bypass them.
#[async_trait]
pub trait InferenceService: Send + Sync {
    /// Read one invoice page. Expected reply: a JSON object
    /// `{invoice_number, items: [...]}`, possibly fenced.
    async fn extract_page(&self, page: &PageContent, page_number: u32) -> Result<String>;

    /// Pick one tariff code for `description` out of `catalog`.
    async fn assign_customs_code(
        &self,
        item_code: &str,
        description: &str,
        catalog: &TariffCatalog,
    ) -> Result<String>;

    /// Propose final per-item weights. Expected reply: a JSON array in the
    /// request's item order.
    async fn propose_weights(&self, request: &WeightProposalRequest) -> Result<String>;
}

/// Enforces a minimum interval between consecutive calls of the wrapped
/// service, whichever method is called.
pub struct Throttled<S> {
    inner: S,
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl<S> Throttled<S> {
    pub fn new(inner: S, min_interval: Duration) -> Self {
        Throttled {
            inner,
            min_interval,
            last_call: Mutex::new(None),
        }
    }

    async fn wait_turn(&self) {
        let mut last = self.last_call.lock().await;
        if let Some(prev) = *last {
            let ready_at = prev + self.min_interval;
            let now = Instant::now();
            if ready_at > now {
                debug!(wait_ms = (ready_at - now).as_millis() as u64, "Rate limiting inference call");
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[async_trait]
impl<S: InferenceService> InferenceService for Throttled<S> {
    async fn extract_page(&self, page: &PageContent, page_number: u32) -> Result<String> {
        self.wait_turn().await;
        self.inner.extract_page(page, page_number).await
    }

    async fn assign_customs_code(
        &self,
        item_code: &str,
        description: &str,
        catalog: &TariffCatalog,
    ) -> Result<String> {
        self.wait_turn().await;
        self.inner.assign_customs_code(item_code, description, catalog).await
    }

    async fn propose_weights(&self, request: &WeightProposalRequest) -> Result<String> {
        self.wait_turn().await;
        self.inner.propose_weights(request).await
    }
}

/// Strip markdown fences a model may add despite instructions.
pub fn strip_fences(reply: &str) -> &str {
    reply
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

/// Outermost `open ... close` span of a reply that may carry surrounding
/// text (e.g. reasoning tokens).
pub fn extract_json_span(reply: &str, open: char, close: char) -> Result<&str> {
    let s = strip_fences(reply);
    let start = s
        .find(open)
        .ok_or_else(|| IntrastatError::Inference(format!("no '{open}' in model reply")))?;
    let end = s
        .rfind(close)
        .ok_or_else(|| IntrastatError::Inference(format!("no '{close}' in model reply")))?;
    if end <= start {
        return Err(IntrastatError::Inference("malformed JSON in model reply".into()));
    }
    Ok(&s[start..=end])
}
