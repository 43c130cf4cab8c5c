// src/output.rs

use crate::error::Result;
use crate::locale::{format_decimal, format_trimmed, parse_decimal};
use crate::model::{LineItem, PreliminaryWeight, Weight, markers};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// One output row. Every cell is text so markers can stand in for numbers.
#[derive(Debug, Serialize, Deserialize)]
struct CsvRow {
    #[serde(rename = "Invoice Number")]
    invoice_number: String,
    #[serde(rename = "Page Number")]
    page_number: u32,
    #[serde(rename = "Row Number")]
    row_number: u32,
    #[serde(rename = "Item Code")]
    item_code: String,
    #[serde(rename = "Description")]
    description: String,
    #[serde(rename = "Country of Origin")]
    country_of_origin: String,
    #[serde(rename = "Quantity")]
    quantity: String,
    #[serde(rename = "Unit Price")]
    unit_price: String,
    #[serde(rename = "Total Price")]
    total_price: String,
    #[serde(rename = "Preliminary Net Weight")]
    preliminary_net_weight: String,
    #[serde(rename = "Final Net Weight")]
    final_net_weight: String,
    #[serde(rename = "Final Gross Weight")]
    final_gross_weight: String,
    #[serde(rename = "Customs Code")]
    customs_code: String,
    #[serde(rename = "Customs Code Description")]
    customs_code_description: String,
}

/// `processed_invoice_data_<invoice>.csv`, with the invoice number reduced
/// to characters safe in a file name.
pub fn output_file_name(invoice_number: &str) -> String {
    let safe: String = invoice_number
        .trim()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let safe = if safe.is_empty() { "unknown".to_string() } else { safe };
    format!("processed_invoice_data_{safe}.csv")
}

impl CsvRow {
    fn from_item(item: &LineItem) -> Self {
        let placeholder = item.is_placeholder();
        let or_marker = |value: Option<f64>, places: usize, marker: &str| {
            if placeholder {
                markers::EXTRACTION_FAILED.to_string()
            } else {
                value.map_or_else(|| marker.to_string(), |v| format_trimmed(v, places))
            }
        };
        let final_weight = |weight: Option<Weight>| match weight {
            Some(w) => w.to_csv(),
            None if placeholder => markers::EXTRACTION_FAILED.to_string(),
            None => markers::NOT_RECONCILED.to_string(),
        };

        CsvRow {
            invoice_number: item.invoice_number.clone(),
            page_number: item.page_number,
            row_number: item.row_number,
            item_code: item.item_code.clone(),
            description: item.description.clone(),
            country_of_origin: item.country_of_origin.clone().unwrap_or_default(),
            quantity: or_marker(item.quantity, 3, markers::QTY_UNPARSEABLE),
            unit_price: or_marker(item.unit_price, 4, markers::PRICE_UNPARSEABLE),
            total_price: item
                .total_price
                .filter(|_| !placeholder)
                .map_or_else(|| or_marker(None, 2, markers::PRICE_UNPARSEABLE), |v| format_decimal(v, 2)),
            preliminary_net_weight: item.preliminary_net_weight.to_csv(),
            final_net_weight: final_weight(item.final_net_weight),
            final_gross_weight: final_weight(item.final_gross_weight),
            customs_code: item
                .customs_code
                .clone()
                .unwrap_or_else(|| markers::NOT_APPLICABLE.to_string()),
            customs_code_description: item.customs_code_description.clone().unwrap_or_default(),
        }
    }

    fn into_item(self) -> LineItem {
        let preliminary_net_weight = PreliminaryWeight::from_csv(&self.preliminary_net_weight);
        let customs_code = Some(self.customs_code).filter(|c| !c.is_empty() && c != markers::NOT_APPLICABLE);
        LineItem {
            invoice_number: self.invoice_number,
            page_number: self.page_number,
            row_number: self.row_number,
            item_code: self.item_code,
            description: self.description,
            country_of_origin: Some(self.country_of_origin).filter(|c| !c.is_empty()),
            quantity: parse_decimal(&self.quantity),
            unit_price: parse_decimal(&self.unit_price),
            total_price: parse_decimal(&self.total_price),
            final_net_weight: Weight::parse(&self.final_net_weight),
            final_gross_weight: Weight::parse(&self.final_gross_weight),
            customs_code,
            customs_code_description: Some(self.customs_code_description).filter(|d| !d.is_empty()),
            is_product: !matches!(
                preliminary_net_weight,
                PreliminaryWeight::NotApplicable | PreliminaryWeight::ExtractionFailed
            ),
            error: None,
            preliminary_net_weight,
        }
    }
}

/// Write one invoice's rows, semicolon-delimited with decimal commas.
pub fn write_invoice_csv(path: &Path, items: &[LineItem]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::WriterBuilder::new().delimiter(b';').from_path(path)?;
    for item in items {
        writer.serialize(CsvRow::from_item(item))?;
    }
    writer.flush()?;
    info!(path = %path.display(), rows = items.len(), "Invoice CSV written");
    Ok(())
}

/// Read rows written by [`write_invoice_csv`]. Markers come back as `None`
/// numbers; non-product rows are recognised by their `N/A` preliminary weight.
pub fn read_invoice_csv(path: &Path) -> Result<Vec<LineItem>> {
    let mut reader = csv::ReaderBuilder::new().delimiter(b';').from_path(path)?;
    let mut items = Vec::new();
    for row in reader.deserialize::<CsvRow>() {
        items.push(row?.into_item());
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_items() -> Vec<LineItem> {
        let mut detector = LineItem::new("FV-117", 1);
        detector.row_number = 1;
        detector.item_code = "JA-100K".into();
        detector.description = "Detektor; bezdrôtový".into();
        detector.country_of_origin = Some("CZ".into());
        detector.quantity = Some(4.0);
        detector.unit_price = Some(25.5);
        detector.total_price = Some(102.0);
        detector.preliminary_net_weight = PreliminaryWeight::Known(Weight::from_grams(980));
        detector.final_net_weight = Some(Weight::from_grams(1_012));
        detector.final_gross_weight = Some(Weight::from_grams(1_250));
        detector.customs_code = Some("85311030".into());
        detector.customs_code_description = Some("Poplachové systémy".into());

        let mut unknown = LineItem::new("FV-117", 1);
        unknown.row_number = 2;
        unknown.item_code = "ZZ-1".into();
        unknown.preliminary_net_weight = PreliminaryWeight::NoWeightData;

        let mut shipping = LineItem::new("FV-117", 1);
        shipping.row_number = 3;
        shipping.description = "Doprava".into();
        shipping.is_product = false;
        shipping.total_price = Some(5.0);
        shipping.quantity = Some(1.0);

        let mut failed = LineItem::placeholder("FV-117", 2, "timeout");
        failed.row_number = 4;

        vec![detector, unknown, shipping, failed]
    }

    #[test]
    fn test_output_file_name() {
        assert_eq!(output_file_name("FV 2024/117"), "processed_invoice_data_FV_2024_117.csv");
        assert_eq!(output_file_name("  "), "processed_invoice_data_unknown.csv");
    }

    #[test]
    fn test_markers_fill_numeric_cells() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join(output_file_name("FV-117"));
        write_invoice_csv(&path, &sample_items()).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            "Invoice Number;Page Number;Row Number;Item Code;Description;Country of Origin;Quantity;\
             Unit Price;Total Price;Preliminary Net Weight;Final Net Weight;Final Gross Weight;\
             Customs Code;Customs Code Description"
        );
        assert_eq!(
            lines[1],
            "FV-117;1;1;JA-100K;\"Detektor; bezdrôtový\";CZ;4;25,5;102,00;0,980;1,012;1,250;85311030;Poplachové systémy"
        );
        assert!(lines[2].contains("QTY_UNPARSEABLE;PRICE_UNPARSEABLE;PRICE_UNPARSEABLE;NO_WEIGHT_DATA;NOT_RECONCILED"));
        assert!(lines[4].contains("EXTRACTION_FAILED;EXTRACTION_FAILED;EXTRACTION_FAILED;EXTRACTION_FAILED"));
        for line in &lines[2..] {
            let cells: Vec<&str> = line.split(';').collect();
            assert!(cells[6..12].iter().all(|c| !c.is_empty()), "blank numeric cell in {line}");
        }
    }

    #[test]
    fn test_read_back_keeps_report_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.csv");
        let items = sample_items();
        write_invoice_csv(&path, &items).unwrap();

        let back = read_invoice_csv(&path).unwrap();
        assert_eq!(back.len(), 4);
        assert_eq!(back[0].final_gross_weight, Some(Weight::from_grams(1_250)));
        assert_eq!(back[0].total_price, Some(102.0));
        assert_eq!(back[0].customs_code.as_deref(), Some("85311030"));
        assert_eq!(back[1].quantity, None);
        assert_eq!(back[1].final_net_weight, None);
        assert!(back[1].is_product);
        assert!(!back[2].is_product);
        assert!(back[3].is_placeholder());
        assert_eq!(back[3].customs_code, None);
    }
}
