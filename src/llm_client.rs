// src/llm_client.rs

use crate::config::{LlmBackend, LlmSection};
use crate::error::{IntrastatError, Result};
use crate::inference::{InferenceService, WeightProposalRequest};
use crate::pdf_extract::PageContent;
use crate::reference::TariffCatalog;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Instructions for reading one invoice page.
const EXTRACTION_PROMPT: &str = r#"You are an invoice data extraction assistant.
You receive ONE page of a supplier invoice, either as text extracted from the PDF or as a scanned image.
Return ONLY valid JSON matching this schema exactly:
{
  "invoice_number": "string, or \"N/A\" if not printed on this page",
  "items": [
    {
      "item_code": "string (product / registration number)",
      "description": "string",
      "location": "2-letter country of origin, or null",
      "quantity": "number as printed",
      "unit_price": "number as printed",
      "total_price": "number as printed"
    }
  ]
}

Notes:
- Include every invoice row on the page: goods, discounts, shipping and fees.
- Keep numbers exactly as printed, including decimal commas.
- Use null for a country of origin you cannot find. Never guess it.
- Return ONLY the JSON object, no markdown fences, no commentary."#;

const CUSTOMS_PROMPT: &str = r#"You are a customs classification assistant for Intrastat declarations.
Choose exactly ONE 8-digit tariff code for the product below. The code MUST come from the catalog that follows.
Answer on the last line in the form
RESULT_CODE: XXXXXXXX
or, when no catalog entry fits,
RESULT_CODE: UNDETERMINED"#;

const WEIGHTS_PROMPT: &str = r#"You distribute shipment weights across invoice items for an Intrastat declaration.
You receive the items (code, description, quantity, preliminary net weight in kg, possibly null) and the
target total net and gross weights in kg.
Propose a final net and gross weight for every item so that:
- the net weights sum to the net target and the gross weights sum to the gross target,
- every gross weight is at least the item's net weight,
- packaging (gross minus net) reflects the items: heavier or bulkier goods carry more packaging.
Return ONLY a JSON array with one object per item, in the same order and count as the input:
[{"item_code": "...", "final_net_weight": 0.000, "final_gross_weight": 0.000}]
No markdown fences, no commentary."#;

/// Cap on text sent per page, in characters.
const MAX_PAGE_CHARS: usize = 12_000;

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f64,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: MessageContent,
}

impl ChatMessage {
    fn system(text: &str) -> Self {
        ChatMessage {
            role: "system",
            content: MessageContent::Text(text.to_string()),
        }
    }

    fn user(content: MessageContent) -> Self {
        ChatMessage { role: "user", content }
    }
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(untagged)]
enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize, PartialEq)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ReplyMessage,
}

#[derive(Debug, Deserialize)]
struct ReplyMessage {
    content: Option<String>,
}

/// Resolved endpoint configuration ready to make API calls.
#[derive(Debug, Clone, PartialEq)]
struct ResolvedEndpoint {
    base_url: String,
    model: String,
    api_key: String,
}

/// Resolve the LLM config section into a concrete endpoint. `remote_key` is
/// the value of `LLM_API_KEY`, if set.
fn resolve_endpoint(llm: &LlmSection, remote_key: Option<String>) -> Result<ResolvedEndpoint> {
    let (endpoint, api_key) = match llm.backend {
        LlmBackend::Ollama => (&llm.ollama, "ollama".to_string()), // required by API but ignored
        LlmBackend::Cliproxy => (&llm.cliproxy, "cliproxy".to_string()), // CLIProxyAPI uses OAuth
        LlmBackend::Remote => {
            let key = remote_key.filter(|k| !k.trim().is_empty()).ok_or_else(|| {
                IntrastatError::Configuration("LLM_API_KEY env var required for remote backend".into())
            })?;
            (&llm.remote, key)
        }
    };
    info!(backend = ?llm.backend, url = %endpoint.base_url, model = %endpoint.model, "LLM endpoint resolved");
    Ok(ResolvedEndpoint {
        base_url: endpoint.base_url.trim_end_matches('/').to_string(),
        model: endpoint.model.clone(),
        api_key,
    })
}

/// Check if the Ollama server is reachable.
async fn check_ollama_health(client: &Client, base_url: &str) -> bool {
    // Ollama's health endpoint is at the root (not under /v1)
    let health_url = base_url.trim_end_matches('/').trim_end_matches("/v1");

    match client
        .get(health_url)
        .timeout(Duration::from_secs(3))
        .send()
        .await
    {
        Ok(resp) if resp.status().is_success() => {
            info!("Ollama server is reachable");
            true
        }
        Ok(resp) => {
            warn!(status = %resp.status(), "Ollama server returned non-OK status");
            false
        }
        Err(e) => {
            warn!(error = %e, "Ollama server not reachable");
            false
        }
    }
}

/// OpenAI-compatible chat client serving all three inference requests.
pub struct LlmClient {
    client: Client,
    endpoint: ResolvedEndpoint,
    max_retries: u32,
}

impl LlmClient {
    /// Build the client and make sure the backend can be used at all.
    /// Failures here are configuration errors.
    pub async fn connect(llm: &LlmSection) -> Result<Self> {
        let endpoint = resolve_endpoint(llm, std::env::var("LLM_API_KEY").ok())?;
        let client = Client::builder()
            .timeout(Duration::from_secs(llm.timeout_secs))
            .build()?;

        if llm.backend == LlmBackend::Ollama && !check_ollama_health(&client, &endpoint.base_url).await {
            return Err(IntrastatError::Configuration(format!(
                "Ollama is not running at {}. Start it with: ollama serve",
                endpoint.base_url
            )));
        }

        Ok(LlmClient {
            client,
            endpoint,
            max_retries: llm.max_retries,
        })
    }

    /// One chat completion, retried with linear backoff on transient failures.
    async fn chat(&self, messages: Vec<ChatMessage>) -> Result<String> {
        let request = ChatRequest {
            model: self.endpoint.model.clone(),
            messages,
            temperature: 0.0,
        };

        let mut attempt = 0;
        loop {
            match self.chat_once(&request).await {
                Ok(content) => return Ok(content),
                Err((retryable, e)) if retryable && attempt < self.max_retries => {
                    attempt += 1;
                    let backoff = Duration::from_secs(2 * u64::from(attempt));
                    warn!(attempt, max = self.max_retries, backoff_s = backoff.as_secs(), error = %e, "LLM call failed, retrying");
                    tokio::time::sleep(backoff).await;
                }
                Err((_, e)) => return Err(e),
            }
        }
    }

    /// Returns the error together with whether another attempt may help.
    async fn chat_once(&self, request: &ChatRequest) -> std::result::Result<String, (bool, IntrastatError)> {
        let url = format!("{}/chat/completions", self.endpoint.base_url);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.endpoint.api_key))
            .json(request)
            .send()
            .await
            .map_err(|e| (true, IntrastatError::from(e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let retryable = status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS;
            return Err((retryable, IntrastatError::Inference(format!("LLM API error {status}: {body}"))));
        }

        let chat: ChatResponse = response.json().await.map_err(|e| (true, IntrastatError::from(e)))?;
        let content = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| (true, IntrastatError::Inference("empty response from LLM".into())))?;
        debug!(chars = content.len(), "LLM reply received");
        Ok(content)
    }
}

/// User message for one page: text as text, scans as a data URL.
fn page_message(page: &PageContent, page_number: u32) -> Result<MessageContent> {
    match page {
        PageContent::Text(text) => {
            let text: String = text.chars().take(MAX_PAGE_CHARS).collect();
            Ok(MessageContent::Text(format!(
                "Extract invoice data from page {page_number} (PDF text follows):\n\n{text}"
            )))
        }
        PageContent::Image { mime, data } => Ok(MessageContent::Parts(vec![
            ContentPart::Text {
                text: format!("Extract invoice data from page {page_number} (scanned image)."),
            },
            ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: format!("data:{mime};base64,{}", BASE64.encode(data)),
                },
            },
        ])),
        PageContent::Unreadable(reason) => Err(IntrastatError::Extraction {
            page: page_number,
            message: reason.clone(),
        }),
    }
}

fn customs_message(item_code: &str, description: &str, catalog: &TariffCatalog) -> String {
    let listing: Vec<String> = catalog.iter().map(|(code, desc)| format!("{code};{desc}")).collect();
    format!(
        "Product code: {item_code}\nProduct description: {description}\n\nCatalog (code;description):\n{}",
        listing.join("\n")
    )
}

fn weights_message(request: &WeightProposalRequest) -> Result<String> {
    Ok(format!(
        "Target total net weight: {:.3} kg\nTarget total gross weight: {:.3} kg\nItems:\n{}",
        request.target_net_weight,
        request.target_gross_weight,
        serde_json::to_string_pretty(&request.items)?
    ))
}

#[async_trait]
impl InferenceService for LlmClient {
    async fn extract_page(&self, page: &PageContent, page_number: u32) -> Result<String> {
        let content = page_message(page, page_number)?;
        self.chat(vec![ChatMessage::system(EXTRACTION_PROMPT), ChatMessage::user(content)])
            .await
    }

    async fn assign_customs_code(
        &self,
        item_code: &str,
        description: &str,
        catalog: &TariffCatalog,
    ) -> Result<String> {
        let content = customs_message(item_code, description, catalog);
        self.chat(vec![
            ChatMessage::system(CUSTOMS_PROMPT),
            ChatMessage::user(MessageContent::Text(content)),
        ])
        .await
    }

    async fn propose_weights(&self, request: &WeightProposalRequest) -> Result<String> {
        let content = weights_message(request)?;
        self.chat(vec![
            ChatMessage::system(WEIGHTS_PROMPT),
            ChatMessage::user(MessageContent::Text(content)),
        ])
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::ProposalItem;

    #[test]
    fn test_remote_backend_requires_key() {
        let llm = LlmSection::default();
        let err = resolve_endpoint(&llm, None).unwrap_err();
        assert!(err.is_fatal());
        assert!(resolve_endpoint(&llm, Some("  ".into())).is_err());

        let endpoint = resolve_endpoint(&llm, Some("secret".into())).unwrap();
        assert_eq!(endpoint.api_key, "secret");
        assert_eq!(endpoint.model, "gemini-2.0-flash-lite");
    }

    #[test]
    fn test_local_backends_need_no_key() {
        let mut llm = LlmSection::default();
        llm.backend = LlmBackend::Ollama;
        llm.ollama.base_url = "http://localhost:11434/v1/".into();
        let endpoint = resolve_endpoint(&llm, None).unwrap();
        assert_eq!(endpoint.base_url, "http://localhost:11434/v1");

        llm.backend = LlmBackend::Cliproxy;
        assert_eq!(resolve_endpoint(&llm, None).unwrap().api_key, "cliproxy");
    }

    #[test]
    fn test_image_page_becomes_data_url() {
        let page = PageContent::Image {
            mime: "image/jpeg",
            data: vec![0xFF, 0xD8, 0xFF],
        };
        let message = page_message(&page, 2).unwrap();
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json[0]["type"], "text");
        assert_eq!(json[1]["type"], "image_url");
        assert_eq!(json[1]["image_url"]["url"], "data:image/jpeg;base64,/9j/");
    }

    #[test]
    fn test_text_page_is_truncated_by_chars() {
        let page = PageContent::Text("č".repeat(MAX_PAGE_CHARS + 50));
        let MessageContent::Text(text) = page_message(&page, 1).unwrap() else {
            panic!("text page must produce a text message");
        };
        assert_eq!(text.matches('č').count(), MAX_PAGE_CHARS);
    }

    #[test]
    fn test_unreadable_page_is_extraction_error() {
        let err = page_message(&PageContent::Unreadable("blank".into()), 4).unwrap_err();
        assert!(matches!(err, IntrastatError::Extraction { page: 4, .. }));
    }

    #[test]
    fn test_customs_message_lists_catalog() {
        let catalog: TariffCatalog = [
            ("85311030".to_string(), "Poplachové systémy".to_string()),
            ("85176200".to_string(), "Prenosové prístroje".to_string()),
        ]
        .into_iter()
        .collect();
        let message = customs_message("JA-100K", "Detektor pohybu", &catalog);
        assert!(message.contains("Product description: Detektor pohybu"));
        assert!(message.contains("85176200;Prenosové prístroje\n85311030;Poplachové systémy"));
    }

    #[test]
    fn test_weights_message_carries_targets_and_nulls() {
        let request = WeightProposalRequest {
            items: vec![ProposalItem {
                item_code: "A".into(),
                description: "Siréna".into(),
                quantity: Some(2.0),
                preliminary_net_weight: None,
            }],
            target_net_weight: 18.0,
            target_gross_weight: 20.5,
        };
        let message = weights_message(&request).unwrap();
        assert!(message.contains("Target total net weight: 18.000 kg"));
        assert!(message.contains("Target total gross weight: 20.500 kg"));
        assert!(message.contains("\"preliminary_net_weight\": null"));
    }
}
