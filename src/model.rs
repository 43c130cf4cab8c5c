// src/model.rs

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, Sub};

/// Literal strings written into CSV cells in place of numbers or codes.
pub mod markers {
    pub const NO_WEIGHT_DATA: &str = "NO_WEIGHT_DATA";
    pub const QTY_UNPARSEABLE: &str = "QTY_UNPARSEABLE";
    pub const PRICE_UNPARSEABLE: &str = "PRICE_UNPARSEABLE";
    pub const EXTRACTION_FAILED: &str = "EXTRACTION_FAILED";
    pub const NOT_RECONCILED: &str = "NOT_RECONCILED";
    pub const NOT_APPLICABLE: &str = "N/A";
    pub const UNDETERMINED: &str = "UNDETERMINED";
    pub const UNASSIGNED: &str = "UNASSIGNED";
}

/// A weight in thousandths of a kilogram.
///
/// Reconciliation works on these integers so that sums at three decimals
/// are exact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Weight(i64);

impl Weight {
    pub const ZERO: Weight = Weight(0);

    pub const fn from_grams(grams: i64) -> Self {
        Weight(grams)
    }

    pub const fn grams(self) -> i64 {
        self.0
    }

    /// Round a kilogram value to the nearest gram. `None` for NaN/inf.
    pub fn from_kg(kg: f64) -> Option<Self> {
        if !kg.is_finite() {
            return None;
        }
        Some(Weight((kg * 1000.0).round() as i64))
    }

    pub fn as_kg(self) -> f64 {
        self.0 as f64 / 1000.0
    }

    /// Parse a kilogram value written with a decimal comma or dot.
    pub fn parse(raw: &str) -> Option<Self> {
        crate::locale::parse_decimal(raw).and_then(Weight::from_kg)
    }

    /// Three decimals with a decimal comma, as written to CSV.
    pub fn to_csv(self) -> String {
        self.to_string().replace('.', ",")
    }
}

impl fmt::Display for Weight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:03}", abs / 1000, abs % 1000)
    }
}

impl Add for Weight {
    type Output = Weight;
    fn add(self, rhs: Weight) -> Weight {
        Weight(self.0 + rhs.0)
    }
}

impl Sub for Weight {
    type Output = Weight;
    fn sub(self, rhs: Weight) -> Weight {
        Weight(self.0 - rhs.0)
    }
}

impl Sum for Weight {
    fn sum<I: Iterator<Item = Weight>>(iter: I) -> Weight {
        Weight(iter.map(|w| w.0).sum())
    }
}

/// Quantity × unit weight, or the reason it could not be computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreliminaryWeight {
    Known(Weight),
    /// The item code is not in the product weight table.
    NoWeightData,
    QuantityUnparseable,
    /// Discounts, fees, shipping: no physical goods.
    NotApplicable,
    /// Placeholder row for a page that could not be read.
    ExtractionFailed,
}

impl PreliminaryWeight {
    pub fn known(&self) -> Option<Weight> {
        match self {
            PreliminaryWeight::Known(w) => Some(*w),
            _ => None,
        }
    }

    pub fn to_csv(&self) -> String {
        match self {
            PreliminaryWeight::Known(w) => w.to_csv(),
            PreliminaryWeight::NoWeightData => markers::NO_WEIGHT_DATA.to_string(),
            PreliminaryWeight::QuantityUnparseable => markers::QTY_UNPARSEABLE.to_string(),
            PreliminaryWeight::NotApplicable => markers::NOT_APPLICABLE.to_string(),
            PreliminaryWeight::ExtractionFailed => markers::EXTRACTION_FAILED.to_string(),
        }
    }

    pub fn from_csv(cell: &str) -> Self {
        match cell.trim() {
            markers::NO_WEIGHT_DATA => PreliminaryWeight::NoWeightData,
            markers::QTY_UNPARSEABLE => PreliminaryWeight::QuantityUnparseable,
            markers::EXTRACTION_FAILED => PreliminaryWeight::ExtractionFailed,
            other => Weight::parse(other)
                .map(PreliminaryWeight::Known)
                .unwrap_or(PreliminaryWeight::NotApplicable),
        }
    }
}

/// One row of an invoice.
#[derive(Debug, Clone, PartialEq)]
pub struct LineItem {
    pub invoice_number: String,
    pub page_number: u32,
    /// 1-based, contiguous within one invoice.
    pub row_number: u32,
    pub item_code: String,
    pub description: String,
    pub country_of_origin: Option<String>,
    pub quantity: Option<f64>,
    pub unit_price: Option<f64>,
    pub total_price: Option<f64>,
    pub preliminary_net_weight: PreliminaryWeight,
    pub final_net_weight: Option<Weight>,
    pub final_gross_weight: Option<Weight>,
    pub customs_code: Option<String>,
    pub customs_code_description: Option<String>,
    /// Set by the normalizer; never persisted.
    pub is_product: bool,
    /// Reason text for placeholder rows.
    pub error: Option<String>,
}

impl LineItem {
    pub fn new(invoice_number: &str, page_number: u32) -> Self {
        LineItem {
            invoice_number: invoice_number.to_string(),
            page_number,
            row_number: 0,
            item_code: String::new(),
            description: String::new(),
            country_of_origin: None,
            quantity: None,
            unit_price: None,
            total_price: None,
            preliminary_net_weight: PreliminaryWeight::NotApplicable,
            final_net_weight: None,
            final_gross_weight: None,
            customs_code: None,
            customs_code_description: None,
            is_product: true,
            error: None,
        }
    }

    /// Row standing in for a page whose extraction failed.
    pub fn placeholder(invoice_number: &str, page_number: u32, error: &str) -> Self {
        LineItem {
            description: format!("PAGE ANALYSIS FAILED: {error}"),
            preliminary_net_weight: PreliminaryWeight::ExtractionFailed,
            is_product: false,
            error: Some(error.to_string()),
            ..LineItem::new(invoice_number, page_number)
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.preliminary_net_weight == PreliminaryWeight::ExtractionFailed
    }

    /// Whether this row takes part in weight reconciliation.
    pub fn is_weighable(&self) -> bool {
        self.is_product && !self.is_placeholder()
    }
}

/// Target totals entered for one invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Targets {
    net: Weight,
    gross: Weight,
}

impl Targets {
    pub fn new(net: Weight, gross: Weight) -> crate::error::Result<Self> {
        if net < Weight::ZERO || gross < Weight::ZERO {
            return Err(crate::error::IntrastatError::validation(
                "targets",
                0,
                format!("negative target weight (net={net}, gross={gross})"),
            ));
        }
        if gross < net {
            return Err(crate::error::IntrastatError::validation(
                "targets",
                0,
                format!("gross target {gross} kg is below net target {net} kg"),
            ));
        }
        Ok(Targets { net, gross })
    }

    pub fn net(&self) -> Weight {
        self.net
    }

    pub fn gross(&self) -> Weight {
        self.gross
    }
}

/// The unit of reconciliation: all items of one PDF.
#[derive(Debug, Clone)]
pub struct Invoice {
    pub number: String,
    pub source_file: String,
    pub items: Vec<LineItem>,
    pub targets: Option<Targets>,
}

impl Invoice {
    pub fn new(source_file: &str, default_number: &str) -> Self {
        Invoice {
            number: default_number.to_string(),
            source_file: source_file.to_string(),
            items: Vec::new(),
            targets: None,
        }
    }

    /// Append one page worth of items, continuing the row numbering.
    pub fn push_page(&mut self, items: Vec<LineItem>) {
        for mut item in items {
            item.row_number = self.items.len() as u32 + 1;
            self.items.push(item);
        }
    }

    /// Adopt a newly seen invoice number for every row collected so far.
    pub fn set_number(&mut self, number: &str) {
        self.number = number.to_string();
        for item in &mut self.items {
            item.invoice_number = number.to_string();
        }
    }
}
