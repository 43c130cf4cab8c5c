// src/report.rs

use crate::classify::ItemClassifier;
use crate::error::Result;
use crate::locale::{format_decimal, round_to};
use crate::model::{LineItem, Weight, markers};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

pub const DISCOUNT_KEY: &str = "DISCOUNT";

const DISCOUNT_LABEL: &str = "Zľava";
const TOTAL_LABEL: &str = "Spolu";
const UNSPECIFIED_COUNTRY: &str = "NEŠPECIFIKOVANÁ";

const HEADERS: [&str; 6] = [
    "Colná sadzba",
    "Krajina Pôvodu",
    "Súčet Hrubá Hmotnosť",
    "Súčet Čistá Hmotnosť",
    "Súčet Počet Kusov",
    "Súčet Celková Cena",
];

/// Sums for one (customs code, country) group. Values are unrounded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupTotals {
    pub customs_code: String,
    pub country: String,
    pub gross_weight: Weight,
    pub net_weight: Weight,
    pub pieces: f64,
    pub total_price: f64,
}

impl GroupTotals {
    fn is_empty(&self) -> bool {
        self.gross_weight == Weight::ZERO
            && self.net_weight == Weight::ZERO
            && self.pieces == 0.0
            && self.total_price == 0.0
    }

    fn add(&mut self, other: &GroupTotals) {
        self.gross_weight = self.gross_weight + other.gross_weight;
        self.net_weight = self.net_weight + other.net_weight;
        self.pieces += other.pieces;
        self.total_price += other.total_price;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    /// Ordered by (customs code, country).
    pub groups: Vec<GroupTotals>,
    pub total: GroupTotals,
}

/// Group finalized items by (customs code, country of origin).
///
/// Discount rows (by description, or a negative total price) are regrouped
/// under the `DISCOUNT` key and do not count as pieces. Fee rows count
/// neither as pieces nor towards the price. Groups under `UNDETERMINED`
/// whose sums are all zero are dropped.
pub fn aggregate(items: &[LineItem], classifier: &ItemClassifier) -> Report {
    let mut groups: BTreeMap<(String, String), GroupTotals> = BTreeMap::new();

    for item in items {
        let is_discount =
            classifier.is_discount(&item.description) || item.total_price.is_some_and(|p| p < 0.0);
        let is_fee = !is_discount && classifier.is_fee(&item.description);

        let key = if is_discount {
            (DISCOUNT_KEY.to_string(), DISCOUNT_KEY.to_string())
        } else {
            (
                item.customs_code
                    .clone()
                    .unwrap_or_else(|| markers::UNDETERMINED.to_string()),
                item.country_of_origin
                    .clone()
                    .unwrap_or_else(|| UNSPECIFIED_COUNTRY.to_string()),
            )
        };

        let contribution = GroupTotals {
            customs_code: key.0.clone(),
            country: key.1.clone(),
            gross_weight: item.final_gross_weight.unwrap_or(Weight::ZERO),
            net_weight: item.final_net_weight.unwrap_or(Weight::ZERO),
            pieces: if is_discount || is_fee { 0.0 } else { item.quantity.unwrap_or(0.0) },
            total_price: if is_fee { 0.0 } else { item.total_price.unwrap_or(0.0) },
        };
        debug!(row = item.row_number, code = %key.0, country = %key.1, is_discount, is_fee, "Aggregating row");

        groups
            .entry(key)
            .or_insert_with(|| GroupTotals {
                customs_code: contribution.customs_code.clone(),
                country: contribution.country.clone(),
                ..GroupTotals::default()
            })
            .add(&contribution);
    }

    let groups: Vec<GroupTotals> = groups
        .into_values()
        .filter(|g| !(g.customs_code == markers::UNDETERMINED && g.is_empty()))
        .collect();

    let mut total = GroupTotals {
        customs_code: TOTAL_LABEL.to_string(),
        ..GroupTotals::default()
    };
    for group in &groups {
        total.add(group);
    }

    Report { groups, total }
}

fn render_row(group: &GroupTotals) -> [String; 6] {
    let code = if group.customs_code == DISCOUNT_KEY {
        DISCOUNT_LABEL.to_string()
    } else {
        group.customs_code.clone()
    };
    let country = if group.country == DISCOUNT_KEY {
        String::new()
    } else {
        group.country.clone()
    };
    [
        code,
        country,
        format_decimal(hundredths_of_kg(group.gross_weight), 2),
        format_decimal(hundredths_of_kg(group.net_weight), 2),
        format_decimal(round_to(group.pieces, 1), 1),
        format_decimal(round_to(group.total_price, 2), 2),
    ]
}

/// Round to 10 g from the integer grams, half away from zero.
fn hundredths_of_kg(weight: Weight) -> f64 {
    (weight.grams() as f64 / 10.0).round() / 100.0
}

/// Write the summary CSV: one row per group, then the total row.
pub fn write_report(path: &Path, report: &Report) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::WriterBuilder::new().delimiter(b';').from_path(path)?;
    writer.write_record(HEADERS)?;
    for group in &report.groups {
        writer.write_record(render_row(group))?;
    }
    writer.write_record(render_row(&report.total))?;
    writer.flush()?;

    info!(
        path = %path.display(),
        groups = report.groups.len(),
        net = %report.total.net_weight,
        gross = %report.total.gross_weight,
        "Summary report written"
    );
    Ok(())
}

/// `summary_<input stem>.csv` inside `reports_dir`.
pub fn default_report_path(reports_dir: &Path, input: &Path) -> std::path::PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "report".to_string());
    reports_dir.join(format!("summary_{stem}.csv"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(code: Option<&str>, country: Option<&str>, description: &str, qty: f64, price: f64, net: i64, gross: i64) -> LineItem {
        let mut item = LineItem::new("F1", 1);
        item.description = description.into();
        item.customs_code = code.map(String::from);
        item.country_of_origin = country.map(String::from);
        item.quantity = Some(qty);
        item.total_price = Some(price);
        item.final_net_weight = Some(Weight::from_grams(net));
        item.final_gross_weight = Some(Weight::from_grams(gross));
        item
    }

    fn items() -> Vec<LineItem> {
        vec![
            row(Some("85311030"), Some("CZ"), "Detektor", 4.0, 102.0, 1_004, 1_255),
            row(Some("85311030"), Some("CZ"), "Siréna", 1.0, 40.333, 2_001, 2_502),
            row(Some("85176200"), None, "Komunikátor", 2.0, 80.0, 500, 600),
            row(Some(markers::UNDETERMINED), None, "Sleva zákazníkovi 5%", 1.0, -11.1, 0, 0),
            row(Some(markers::UNDETERMINED), None, "Manipulační poplatek", 1.0, 3.5, 0, 0),
            row(Some("85311030"), Some("CZ"), "Kábel", 3.0, -1.0, 0, 0),
        ]
    }

    #[test]
    fn test_grouping_and_special_rows() {
        let report = aggregate(&items(), &ItemClassifier::default());
        let keys: Vec<(&str, &str)> = report
            .groups
            .iter()
            .map(|g| (g.customs_code.as_str(), g.country.as_str()))
            .collect();
        assert_eq!(
            keys,
            vec![("85176200", UNSPECIFIED_COUNTRY), ("85311030", "CZ"), (DISCOUNT_KEY, DISCOUNT_KEY)]
        );

        let alarms = &report.groups[1];
        assert_eq!(alarms.pieces, 5.0);
        assert_eq!(alarms.net_weight, Weight::from_grams(3_005));
        assert_eq!(alarms.gross_weight, Weight::from_grams(3_757));

        let discount = &report.groups[2];
        assert_eq!(discount.pieces, 0.0);
        assert!((discount.total_price - (-12.1)).abs() < 1e-9);

        assert_eq!(report.total.pieces, 7.0);
        assert_eq!(report.total.net_weight, Weight::from_grams(3_505));
        assert!((report.total.total_price - (102.0 + 40.333 + 80.0 - 12.1)).abs() < 1e-9);
    }

    #[test]
    fn test_aggregate_is_idempotent() {
        let classifier = ItemClassifier::default();
        let items = items();
        assert_eq!(aggregate(&items, &classifier), aggregate(&items, &classifier));
    }

    #[test]
    fn test_undetermined_group_with_values_is_kept() {
        let items = vec![row(Some(markers::UNDETERMINED), Some("DE"), "Držiak", 2.0, 8.0, 100, 120)];
        let report = aggregate(&items, &ItemClassifier::default());
        assert_eq!(report.groups.len(), 1);
        assert_eq!(report.groups[0].customs_code, markers::UNDETERMINED);
    }

    #[test]
    fn test_write_report_rounds_and_labels() {
        let dir = tempfile::tempdir().unwrap();
        let path = default_report_path(&dir.path().join("dovozy"), Path::new("data_output/processed_invoice_data_F1.csv"));
        assert!(path.ends_with("summary_processed_invoice_data_F1.csv"));

        let report = aggregate(&items(), &ItemClassifier::default());
        write_report(&path, &report).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            "Colná sadzba;Krajina Pôvodu;Súčet Hrubá Hmotnosť;Súčet Čistá Hmotnosť;Súčet Počet Kusov;Súčet Celková Cena"
        );
        assert_eq!(lines[1], "85176200;NEŠPECIFIKOVANÁ;0,60;0,50;2,0;80,00");
        assert_eq!(lines[2], "85311030;CZ;3,76;3,01;5,0;142,33");
        assert_eq!(lines[3], "Zľava;;0,00;0,00;0,0;-12,10");
        assert_eq!(lines[4], "Spolu;;4,36;3,51;7,0;210,23");
        assert_eq!(lines.len(), 5);
    }
}
