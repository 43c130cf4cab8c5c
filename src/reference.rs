// src/reference.rs

use crate::error::{IntrastatError, Result};
use crate::locale::parse_decimal;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{debug, info, warn};

/// item_code → unit weight in kg. Loaded once, read-only for the run.
#[derive(Debug, Clone, Default)]
pub struct ProductWeightTable {
    weights: HashMap<String, f64>,
}

impl ProductWeightTable {
    pub fn get(&self, item_code: &str) -> Option<f64> {
        self.weights.get(item_code).copied()
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

impl FromIterator<(String, f64)> for ProductWeightTable {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        ProductWeightTable {
            weights: iter.into_iter().collect(),
        }
    }
}

/// 8-digit tariff code → description. Ordered so prompts list it stably.
#[derive(Debug, Clone, Default)]
pub struct TariffCatalog {
    codes: BTreeMap<String, String>,
}

impl TariffCatalog {
    pub fn description(&self, code: &str) -> Option<&str> {
        self.codes.get(code).map(String::as_str)
    }

    pub fn contains(&self, code: &str) -> bool {
        self.codes.contains_key(code)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.codes.iter().map(|(c, d)| (c.as_str(), d.as_str()))
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

impl FromIterator<(String, String)> for TariffCatalog {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        TariffCatalog {
            codes: iter.into_iter().collect(),
        }
    }
}

/// Load `item_code;unit_weight` rows.
///
/// A missing file is a configuration error. Malformed rows are skipped with
/// a warning; a duplicate code keeps its last value.
pub fn load_product_weights(path: impl AsRef<Path>) -> Result<ProductWeightTable> {
    let path = path.as_ref();
    let mut weights = HashMap::new();

    let skipped = for_each_row(path, |code, raw_weight| {
        let weight = parse_decimal(raw_weight)
            .ok_or_else(|| format!("unparseable weight '{raw_weight}' for '{code}'"))?;
        if weight < 0.0 {
            return Err(format!("negative weight {weight} for '{code}'"));
        }
        if let Some(previous) = weights.insert(code.to_string(), weight) {
            warn!(file = %path.display(), code, previous, weight, "Duplicate item code, keeping last");
        }
        debug!(code, weight, "Unit weight loaded");
        Ok(())
    })?;

    info!(file = %path.display(), loaded = weights.len(), skipped, "Product weights loaded");
    Ok(ProductWeightTable { weights })
}

/// Load `tariff_code;description` rows. Codes are stripped of spaces and must
/// be exactly 8 digits.
pub fn load_tariff_catalog(path: impl AsRef<Path>) -> Result<TariffCatalog> {
    let path = path.as_ref();
    let mut codes = BTreeMap::new();

    let skipped = for_each_row(path, |raw_code, description| {
        let code: String = raw_code.chars().filter(|c| !c.is_whitespace()).collect();
        if !is_tariff_code(&code) {
            return Err(format!("invalid tariff code '{raw_code}'"));
        }
        if description.is_empty() {
            return Err(format!("missing description for '{code}'"));
        }
        if codes.insert(code.clone(), description.to_string()).is_some() {
            warn!(file = %path.display(), code = %code, "Duplicate tariff code, keeping last");
        }
        Ok(())
    })?;

    info!(file = %path.display(), loaded = codes.len(), skipped, "Tariff catalog loaded");
    Ok(TariffCatalog { codes })
}

pub fn is_tariff_code(code: &str) -> bool {
    code.len() == 8 && code.bytes().all(|b| b.is_ascii_digit())
}

/// Drive `handle` over every two-column data row of a `;`-delimited file and
/// return how many rows were skipped.
///
/// The first row is treated as a header unless its second column parses as a
/// number or a non-empty code, so header-less files lose nothing.
fn for_each_row<F>(path: &Path, mut handle: F) -> Result<usize>
where
    F: FnMut(&str, &str) -> std::result::Result<(), String>,
{
    if !path.exists() {
        return Err(IntrastatError::Configuration(format!(
            "reference file not found: {}",
            path.display()
        )));
    }

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b';')
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let file = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut skipped = 0;

    for (idx, record) in reader.records().enumerate() {
        let line = idx as u64 + 1;
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                warn!("{}", IntrastatError::validation(&file, line, e.to_string()));
                skipped += 1;
                continue;
            }
        };

        if record.iter().all(|f| f.is_empty()) {
            continue;
        }
        if record.len() != 2 {
            warn!("{}", IntrastatError::validation(&file, line, format!("wrong column count ({})", record.len())));
            skipped += 1;
            continue;
        }

        let key = record[0].trim_start_matches('\u{feff}');
        let value = &record[1];

        if line == 1 && looks_like_header(key, value) {
            debug!(file = %file, key, value, "Skipping header row");
            continue;
        }
        if key.is_empty() {
            warn!("{}", IntrastatError::validation(&file, line, "missing key"));
            skipped += 1;
            continue;
        }
        if let Err(message) = handle(key, value) {
            warn!("{}", IntrastatError::validation(&file, line, message));
            skipped += 1;
        }
    }

    Ok(skipped)
}

fn looks_like_header(key: &str, value: &str) -> bool {
    let key_is_code: String = key.chars().filter(|c| !c.is_whitespace()).collect();
    parse_decimal(value).is_none() && !is_tariff_code(&key_is_code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(dir: &tempfile::TempDir, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_load_product_weights() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            "product_weight.csv",
            "\u{feff}Registrační číslo;JV Váha komplet SK\n\
             JA-100K;0,245\n\
             JA-150P;0,09\n\
             BROKEN;abc\n\
             TOO;MANY;COLUMNS\n\
             NEG;-1\n\
             JA-100K;0,250\n",
        );

        let table = load_product_weights(&path).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.get("JA-100K"), Some(0.25));
        assert_eq!(table.get("JA-150P"), Some(0.09));
        assert_eq!(table.get("BROKEN"), None);
        assert_eq!(table.get("NEG"), None);
    }

    #[test]
    fn test_headerless_file_keeps_first_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "w.csv", "JA-1;1,5\nJA-2;2\n");

        let table = load_product_weights(&path).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.get("JA-1"), Some(1.5));
    }

    #[test]
    fn test_header_only_files_are_empty() {
        let dir = tempfile::tempdir().unwrap();
        let weights = write(&dir, "w.csv", "Registrační číslo;JV Váha komplet SK\n");
        let catalog = write(&dir, "c.csv", "col_sadz;Popis\n");

        assert!(load_product_weights(&weights).unwrap().is_empty());
        assert!(load_tariff_catalog(&catalog).unwrap().is_empty());
        assert!(!TariffCatalog::from_iter([("85311030".to_string(), "x".to_string())]).is_empty());
    }

    #[test]
    fn test_missing_reference_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_product_weights(dir.path().join("nope.csv")).unwrap_err();
        assert!(matches!(err, IntrastatError::Configuration(_)));
        assert!(err.is_fatal());

        let err = load_tariff_catalog(dir.path().join("nope.csv")).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_load_tariff_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            "col_sadz.csv",
            "col_sadz;Popis\n\
             8531 10 30;Poplachové systémy\n\
             85176200;Prístroje na príjem a prenos hlasu\n\
             1234;Príliš krátky\n\
             39269097;\n",
        );

        let catalog = load_tariff_catalog(&path).unwrap();
        assert_eq!(catalog.len(), 2);
        assert!(catalog.contains("85311030"));
        assert_eq!(catalog.description("85176200"), Some("Prístroje na príjem a prenos hlasu"));
        let codes: Vec<&str> = catalog.iter().map(|(c, _)| c).collect();
        assert_eq!(codes, vec!["85176200", "85311030"]);
    }
}
