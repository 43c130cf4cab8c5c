// src/classify.rs

use crate::config::ClassifyConfig;
use crate::error::{IntrastatError, Result};
use regex::{RegexSet, RegexSetBuilder};

/// Keyword-based recognition of rows that are not physical goods.
#[derive(Debug, Clone)]
pub struct ItemClassifier {
    non_product: RegexSet,
    discount: RegexSet,
    fee: RegexSet,
}

impl ItemClassifier {
    pub fn new(cfg: &ClassifyConfig) -> Result<Self> {
        Ok(ItemClassifier {
            non_product: build_set(&cfg.non_product_keywords)?,
            discount: build_set(&cfg.discount_patterns)?,
            fee: build_set(&cfg.fee_patterns)?,
        })
    }

    /// Discounts, shipping and fees: no weight lookup, no customs inference,
    /// no share of the reconciled weight.
    pub fn is_non_product(&self, item_code: &str, description: &str) -> bool {
        self.non_product.is_match(item_code) || self.non_product.is_match(description)
    }

    pub fn is_discount(&self, description: &str) -> bool {
        self.discount.is_match(description)
    }

    pub fn is_fee(&self, description: &str) -> bool {
        self.fee.is_match(description)
    }
}

#[cfg(test)]
impl Default for ItemClassifier {
    fn default() -> Self {
        ItemClassifier::new(&ClassifyConfig::default()).expect("default keyword lists compile")
    }
}

/// Case-insensitive literal substring matching for each pattern.
fn build_set(patterns: &[String]) -> Result<RegexSet> {
    RegexSetBuilder::new(patterns.iter().map(|p| regex::escape(p.trim())))
        .case_insensitive(true)
        .build()
        .map_err(|e| IntrastatError::Configuration(format!("invalid classify pattern: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_product_keywords() {
        let c = ItemClassifier::default();
        assert!(c.is_non_product("", "Doprava DPD"));
        assert!(c.is_non_product("SHIPPING", "Shipment"));
        assert!(c.is_non_product("", "Manipulační poplatek"));
        assert!(!c.is_non_product("JA-100K", "Bezdrôtový detektor pohybu"));
    }

    #[test]
    fn test_discount_and_fee_patterns() {
        let c = ItemClassifier::default();
        assert!(c.is_discount("SLEVA ZÁKAZNÍKOVI 5%"));
        assert!(!c.is_discount("Manipulační poplatek"));
        assert!(c.is_fee("manipulační POPLATEK"));
        assert!(!c.is_fee("Sleva zákazníkovi"));
    }

    #[test]
    fn test_patterns_are_literal() {
        let cfg = ClassifyConfig {
            non_product_keywords: vec!["fee (flat)".to_string()],
            discount_patterns: vec![],
            fee_patterns: vec![],
        };
        let c = ItemClassifier::new(&cfg).unwrap();
        assert!(c.is_non_product("", "Service fee (flat) 10 EUR"));
        assert!(!c.is_discount("anything"));
    }
}
