// src/normalize.rs

use crate::classify::ItemClassifier;
use crate::error::{IntrastatError, Result};
use crate::inference::extract_json_span;
use crate::locale::parse_decimal;
use crate::model::{LineItem, PreliminaryWeight, Weight};
use crate::reference::ProductWeightTable;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Typed result of one page.
#[derive(Debug, Clone, PartialEq)]
pub struct PageExtraction {
    /// `None` when the page does not print one (or says "N/A").
    pub invoice_number: Option<String>,
    pub items: Vec<LineItem>,
}

/// Turn the raw reply for one page into line items.
///
/// `raw` is the service reply, or the error the call ended with. An error or
/// a reply without the expected shape yields a single placeholder row, never
/// an `Err`. Items are stamped with the page's invoice number, falling back
/// to `current_invoice`.
pub fn normalize(
    raw: &Result<String>,
    page_number: u32,
    current_invoice: &str,
    weights: &ProductWeightTable,
    classifier: &ItemClassifier,
) -> PageExtraction {
    let parsed = raw
        .as_ref()
        .map_err(|e| e.to_string())
        .and_then(|reply| parse_page(reply, page_number).map_err(|e| e.to_string()));

    let (invoice_number, raw_items) = match parsed {
        Ok(page) => page,
        Err(message) => {
            warn!(page = page_number, error = %message, "Page extraction failed, recording placeholder");
            return PageExtraction {
                invoice_number: None,
                items: vec![LineItem::placeholder(current_invoice, page_number, &message)],
            };
        }
    };

    let stamp = invoice_number.as_deref().unwrap_or(current_invoice);
    let items: Vec<LineItem> = raw_items
        .iter()
        .filter_map(|raw_item| normalize_item(raw_item, stamp, page_number, weights, classifier))
        .collect();

    debug!(page = page_number, invoice = stamp, items = items.len(), "Page normalized");
    PageExtraction { invoice_number, items }
}

/// Check the reply's shape: an object with an `items` array.
fn parse_page(reply: &str, page_number: u32) -> Result<(Option<String>, Vec<Value>)> {
    let shape_error = |message: &str| IntrastatError::Extraction {
        page: page_number,
        message: message.to_string(),
    };

    let json = extract_json_span(reply, '{', '}').map_err(|e| shape_error(&e.to_string()))?;
    let value: Value = serde_json::from_str(json).map_err(|e| shape_error(&format!("invalid JSON: {e}")))?;

    let items = match value.get("items") {
        Some(Value::Array(items)) => items.clone(),
        Some(_) => return Err(shape_error("'items' is not a list")),
        None => return Err(shape_error("reply has no 'items'")),
    };

    let invoice_number = text_field(&value, &["invoice_number"])
        .filter(|n| !n.eq_ignore_ascii_case("n/a"));
    Ok((invoice_number, items))
}

fn normalize_item(
    raw: &Value,
    invoice_number: &str,
    page_number: u32,
    weights: &ProductWeightTable,
    classifier: &ItemClassifier,
) -> Option<LineItem> {
    if !raw.is_object() {
        warn!(page = page_number, item = %raw, "Skipping item that is not an object");
        return None;
    }

    let item_code = text_field(raw, &["item_code", "code", "item_name"]).unwrap_or_default();
    let description = text_field(raw, &["description", "item_name"]).unwrap_or_default();
    if item_code.is_empty() && description.is_empty() {
        warn!(page = page_number, item = %raw, "Skipping item with neither code nor description");
        return None;
    }

    let mut item = LineItem::new(invoice_number, page_number);
    item.is_product = !classifier.is_non_product(&item_code, &description);
    item.country_of_origin = text_field(raw, &["location", "country_of_origin"]).and_then(|c| country_code(&c));
    item.quantity = number_field(raw, "quantity");
    item.unit_price = number_field(raw, "unit_price");
    item.total_price = number_field(raw, "total_price");

    if raw.get("total_price").is_some_and(|v| !v.is_null()) && item.total_price.is_none() {
        warn!(page = page_number, item_code = %item_code, "Total price unparseable");
    }

    item.preliminary_net_weight = if !item.is_product {
        PreliminaryWeight::NotApplicable
    } else {
        match (weights.get(&item_code), item.quantity) {
            (None, _) => {
                warn!(page = page_number, item_code = %item_code, "No weight data for item code");
                PreliminaryWeight::NoWeightData
            }
            (Some(_), None) => {
                warn!(page = page_number, item_code = %item_code, "Quantity unparseable");
                PreliminaryWeight::QuantityUnparseable
            }
            (Some(unit), Some(qty)) => match Weight::from_kg(qty * unit) {
                Some(weight) => PreliminaryWeight::Known(weight),
                None => PreliminaryWeight::QuantityUnparseable,
            },
        }
    };

    item.item_code = item_code;
    item.description = description;
    Some(item)
}

/// Replace the extracted country for items with a configured origin.
pub fn apply_country_overrides(items: &mut [LineItem], overrides: &HashMap<String, String>) {
    for item in items.iter_mut() {
        if let Some(country) = overrides.get(&item.item_code).and_then(|c| country_code(c)) {
            if item.country_of_origin.as_deref() != Some(country.as_str()) {
                debug!(item_code = %item.item_code, from = ?item.country_of_origin, to = %country, "Country override");
            }
            item.country_of_origin = Some(country);
        }
    }
}

/// Two ASCII letters, upper-cased; anything else is treated as absent.
fn country_code(raw: &str) -> Option<String> {
    let code = raw.trim();
    (code.len() == 2 && code.bytes().all(|b| b.is_ascii_alphabetic())).then(|| code.to_ascii_uppercase())
}

/// First non-empty field among `keys`, with numbers rendered as text.
fn text_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match value.get(*key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn number_field(value: &Value, key: &str) -> Option<f64> {
    match value.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_decimal(s),
        _ => None,
    }
}
