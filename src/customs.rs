// src/customs.rs

use crate::error::IntrastatError;
use crate::inference::{InferenceService, strip_fences};
use crate::model::{LineItem, markers};
use crate::reference::{TariffCatalog, is_tariff_code};
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;
use tracing::{debug, info, warn};

/// Where an item's code came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentSource {
    Override,
    Inference,
    /// No in-catalog code was obtained; the item carries `UNDETERMINED`.
    Undetermined,
    /// The inference call itself failed; the item carries `UNASSIGNED`.
    Unassigned,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub code: String,
    pub description: String,
    pub source: AssignmentSource,
}

impl Assignment {
    fn marker(code: &str, description: impl Into<String>, source: AssignmentSource) -> Self {
        Assignment {
            code: code.to_string(),
            description: description.into(),
            source,
        }
    }
}

/// Per-item tariff code policy: override table, then inference validated
/// against the catalog.
pub struct CustomsAssigner<'a> {
    overrides: &'a HashMap<String, String>,
    catalog: &'a TariffCatalog,
}

impl<'a> CustomsAssigner<'a> {
    pub fn new(overrides: &'a HashMap<String, String>, catalog: &'a TariffCatalog) -> Self {
        CustomsAssigner { overrides, catalog }
    }

    /// Fixed code for `item_code`, if the override table has one.
    pub fn lookup_override(&self, item_code: &str) -> Option<Assignment> {
        let code = self.overrides.get(item_code)?;
        let description = self
            .catalog
            .description(code)
            .unwrap_or("description not found")
            .to_string();
        Some(Assignment {
            code: code.clone(),
            description,
            source: AssignmentSource::Override,
        })
    }

    pub async fn assign(&self, item: &LineItem, service: &dyn InferenceService) -> Assignment {
        if let Some(assignment) = self.lookup_override(&item.item_code) {
            debug!(item_code = %item.item_code, code = %assignment.code, "Customs code from override table");
            return assignment;
        }

        if !item.is_product {
            return Assignment::marker(markers::UNDETERMINED, "not a product", AssignmentSource::Undetermined);
        }

        let unresolved = |marker: &str, source: AssignmentSource, message: String| {
            let e = IntrastatError::Assignment(format!("{}: {message}", item.item_code));
            warn!(error = %e, marker, "Customs code not assigned");
            Assignment::marker(marker, message, source)
        };

        let reply = match service
            .assign_customs_code(&item.item_code, &item.description, self.catalog)
            .await
        {
            Ok(reply) => reply,
            Err(e) => return unresolved(markers::UNASSIGNED, AssignmentSource::Unassigned, e.to_string()),
        };

        let Some(code) = parse_customs_reply(&reply) else {
            debug!(reply = %reply.trim(), "Unusable customs reply");
            return unresolved(
                markers::UNDETERMINED,
                AssignmentSource::Undetermined,
                "no valid code in reply".into(),
            );
        };

        match self.catalog.description(&code) {
            Some(description) => Assignment {
                description: description.to_string(),
                code,
                source: AssignmentSource::Inference,
            },
            None => unresolved(
                markers::UNDETERMINED,
                AssignmentSource::Undetermined,
                format!("proposed code {code} not in catalog"),
            ),
        }
    }

    /// Assign codes to every item of an invoice, in row order. Placeholder
    /// rows are left alone.
    pub async fn assign_all(&self, items: &mut [LineItem], service: &dyn InferenceService) {
        let mut inferred = 0;
        let mut unresolved = 0;
        for item in items.iter_mut().filter(|i| !i.is_placeholder()) {
            let assignment = self.assign(item, service).await;
            match assignment.source {
                AssignmentSource::Inference => inferred += 1,
                AssignmentSource::Undetermined | AssignmentSource::Unassigned if item.is_product => unresolved += 1,
                _ => {}
            }
            item.customs_code = Some(assignment.code);
            item.customs_code_description = Some(assignment.description);
        }
        info!(items = items.len(), inferred, unresolved, "Customs codes assigned");
    }
}

static RESULT_CODE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)RESULT_CODE\s*:\s*\**\s*([0-9][0-9 ]{6,12}[0-9]|UNDETERMINED)")
        .expect("invalid RESULT_CODE regex")
});

/// The 8-digit code named in a reply, if any.
///
/// Accepts a `RESULT_CODE: ...` line (the last one wins) or a reply that is
/// nothing but the code. `UNDETERMINED` and anything else yield `None`.
pub fn parse_customs_reply(reply: &str) -> Option<String> {
    let cleaned = strip_fences(reply);
    let candidate = match RESULT_CODE_RE.captures_iter(cleaned).last() {
        Some(caps) => caps.get(1)?.as_str().to_string(),
        None => cleaned.to_string(),
    };

    let code: String = candidate.chars().filter(|c| !c.is_whitespace()).collect();
    is_tariff_code(&code).then_some(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::testing::{Call, ScriptedService};

    fn catalog() -> TariffCatalog {
        [
            ("85311030".to_string(), "Poplachové systémy".to_string()),
            ("85176200".to_string(), "Prenosové prístroje".to_string()),
        ]
        .into_iter()
        .collect()
    }

    fn overrides() -> HashMap<String, String> {
        [
            ("JA-196J".to_string(), "85311030".to_string()),
            ("XY-9".to_string(), "99999999".to_string()),
        ]
        .into_iter()
        .collect()
    }

    fn item(code: &str, description: &str) -> LineItem {
        let mut item = LineItem::new("F1", 1);
        item.item_code = code.into();
        item.description = description.into();
        item
    }

    #[test]
    fn test_parse_customs_reply() {
        assert_eq!(parse_customs_reply("85311030").as_deref(), Some("85311030"));
        assert_eq!(
            parse_customs_reply("Looks like an alarm.\nRESULT_CODE: 8531 10 30").as_deref(),
            Some("85311030")
        );
        assert_eq!(
            parse_customs_reply("RESULT_CODE: 85176200\nrevised\nresult_code: **85311030**").as_deref(),
            Some("85311030")
        );
        assert_eq!(parse_customs_reply("RESULT_CODE: UNDETERMINED"), None);
        assert_eq!(parse_customs_reply("probably 8531 or 8517"), None);
        assert_eq!(parse_customs_reply("853110301"), None);
    }

    #[test]
    fn test_result_code_pattern_is_shared() {
        assert!(RESULT_CODE_RE.is_match("result_code: 85311030"));
        for _ in 0..3 {
            assert_eq!(parse_customs_reply("RESULT_CODE: 85176200").as_deref(), Some("85176200"));
        }
    }

    #[tokio::test]
    async fn test_override_skips_inference() {
        let service = ScriptedService::new();
        let (overrides, catalog) = (overrides(), catalog());
        let assigner = CustomsAssigner::new(&overrides, &catalog);

        let a = assigner.assign(&item("JA-196J", "Klávesnica"), &service).await;
        assert_eq!(a.source, AssignmentSource::Override);
        assert_eq!(a.code, "85311030");
        assert_eq!(a.description, "Poplachové systémy");

        let b = assigner.assign(&item("XY-9", "Iné"), &service).await;
        assert_eq!(b.code, "99999999");
        assert_eq!(b.description, "description not found");

        assert!(service.calls().is_empty());
    }

    #[tokio::test]
    async fn test_inferred_code_must_be_in_catalog() {
        let service = ScriptedService::new()
            .on_customs(Ok("RESULT_CODE: 85176200".into()))
            .on_customs(Ok("RESULT_CODE: 12345678".into()))
            .on_customs(Ok("I don't know".into()))
            .on_customs(Err(IntrastatError::Inference("HTTP 503".into())));
        let (overrides, catalog) = (overrides(), catalog());
        let assigner = CustomsAssigner::new(&overrides, &catalog);

        let a = assigner.assign(&item("GSM-1", "Komunikátor"), &service).await;
        assert_eq!((a.code.as_str(), a.source), ("85176200", AssignmentSource::Inference));

        let b = assigner.assign(&item("X-2", "Niečo"), &service).await;
        assert_eq!((b.code.as_str(), b.source), (markers::UNDETERMINED, AssignmentSource::Undetermined));

        let c = assigner.assign(&item("X-3", "Niečo"), &service).await;
        assert_eq!(c.code, markers::UNDETERMINED);

        let d = assigner.assign(&item("X-4", "Niečo"), &service).await;
        assert_eq!((d.code.as_str(), d.source), (markers::UNASSIGNED, AssignmentSource::Unassigned));
    }

    #[tokio::test]
    async fn test_assign_all_skips_placeholders_and_non_products() {
        let service = ScriptedService::new().on_customs(Ok("85311030".into()));
        let (overrides, catalog) = (overrides(), catalog());
        let assigner = CustomsAssigner::new(&overrides, &catalog);

        let mut shipping = item("", "Doprava");
        shipping.is_product = false;
        let mut items = vec![
            item("JA-100K", "Detektor"),
            shipping,
            LineItem::placeholder("F1", 2, "timeout"),
        ];
        assigner.assign_all(&mut items, &service).await;

        assert_eq!(service.calls(), vec![Call::Customs("JA-100K".into())]);
        assert_eq!(items[0].customs_code.as_deref(), Some("85311030"));
        assert_eq!(items[1].customs_code.as_deref(), Some(markers::UNDETERMINED));
        assert_eq!(items[2].customs_code, None);
    }
}
