use crate::error::{IntrastatError, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::{fs, path::Path, path::PathBuf};
use tracing::info;

pub const DEFAULT_CONFIG_PATH: &str = "intrastat.toml";

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub llm: LlmSection,
    pub overrides: OverridesConfig,
    pub classify: ClassifyConfig,
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub input_pdf_dir: PathBuf,
    pub output_csv_dir: PathBuf,
    pub data_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub ledger_path: PathBuf,
    pub product_weights_file: String,
    pub tariff_catalog_file: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        PathsConfig {
            input_pdf_dir: PathBuf::from("faktury_na_spracovanie"),
            output_csv_dir: PathBuf::from("data_output"),
            data_dir: PathBuf::from("data"),
            reports_dir: PathBuf::from("dovozy"),
            ledger_path: PathBuf::from("data_output/ledger.db"),
            product_weights_file: "product_weight.csv".to_string(),
            tariff_catalog_file: "col_sadz.csv".to_string(),
        }
    }
}

impl PathsConfig {
    pub fn product_weights_path(&self) -> PathBuf {
        self.data_dir.join(&self.product_weights_file)
    }

    pub fn tariff_catalog_path(&self) -> PathBuf {
        self.data_dir.join(&self.tariff_catalog_file)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LlmBackend {
    Ollama,
    Cliproxy,
    #[default]
    Remote,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub base_url: String,
    pub model: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub backend: LlmBackend,
    pub ollama: EndpointConfig,
    pub cliproxy: EndpointConfig,
    pub remote: EndpointConfig,
    pub timeout_secs: u64,
    pub max_retries: u32,
    /// Minimum gap between two consecutive inference calls.
    pub min_call_interval_ms: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        LlmSection {
            backend: LlmBackend::default(),
            ollama: EndpointConfig {
                base_url: "http://localhost:11434/v1".to_string(),
                model: "qwen2.5vl:7b".to_string(),
            },
            cliproxy: EndpointConfig {
                base_url: "http://localhost:8317/v1".to_string(),
                model: "gemini-2.5-flash".to_string(),
            },
            remote: EndpointConfig {
                base_url: "https://generativelanguage.googleapis.com/v1beta/openai".to_string(),
                model: "gemini-2.0-flash-lite".to_string(),
            },
            timeout_secs: 120,
            max_retries: 3,
            min_call_interval_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OverridesConfig {
    /// item_code → tariff code, consulted before any inference call.
    pub customs: HashMap<String, String>,
    /// item_code → country of origin.
    pub country: HashMap<String, String>,
}

impl Default for OverridesConfig {
    fn default() -> Self {
        let customs = ["CZ-1263.1", "JA-196J", "JA-165A", "JA-192Y", "JA-194Y"]
            .into_iter()
            .map(|code| (code.to_string(), "85311030".to_string()))
            .collect();
        OverridesConfig {
            customs,
            country: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClassifyConfig {
    pub non_product_keywords: Vec<String>,
    pub discount_patterns: Vec<String>,
    pub fee_patterns: Vec<String>,
}

impl Default for ClassifyConfig {
    fn default() -> Self {
        let owned = |words: &[&str]| words.iter().map(|w| w.to_string()).collect();
        ClassifyConfig {
            non_product_keywords: owned(&[
                "sleva",
                "zľava",
                "doprava",
                "preprava",
                "poplatek",
                "manipulační",
                "discount",
                "shipping",
                "fee",
                "handling",
            ]),
            discount_patterns: owned(&["Sleva zákazníkovi"]),
            fee_patterns: owned(&["Manipulační poplatek"]),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_pdf_size_mb: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        LimitsConfig { max_pdf_size_mb: 50 }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!(path = %path.display(), "No config file, using defaults");
            return Ok(Config::default());
        }
        let content = fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| IntrastatError::Configuration(format!("{}: {e}", path.display())))
    }

    /// Config path from `INTRASTAT_CONFIG`, else the default file name.
    pub fn default_path() -> PathBuf {
        std::env::var("INTRASTAT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
    }
}
