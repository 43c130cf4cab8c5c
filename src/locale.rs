// src/locale.rs
//
// Invoice and reference data use a decimal comma inside semicolon-delimited
// files. These helpers are the single place that knows about it.

/// Parse a decimal number written with either `,` or `.` as the decimal
/// separator. Spaces (including no-break spaces) are ignored. When both
/// separators appear, the last one is the decimal separator and the other
/// is treated as a thousands separator.
pub fn parse_decimal(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\u{a0}')
        .collect();
    if cleaned.is_empty() {
        return None;
    }

    let normalized = match (cleaned.rfind(','), cleaned.rfind('.')) {
        (Some(comma), Some(dot)) if comma > dot => cleaned.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        (Some(_), None) => cleaned.replace(',', "."),
        _ => cleaned,
    };

    normalized.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Render `value` with a fixed number of decimals and a decimal comma.
pub fn format_decimal(value: f64, places: usize) -> String {
    format!("{value:.places$}").replace('.', ",")
}

/// Like [`format_decimal`], without trailing zeros (`4` rather than `4,000`).
pub fn format_trimmed(value: f64, max_places: usize) -> String {
    let fixed = format!("{value:.max_places$}");
    let trimmed = if fixed.contains('.') {
        fixed.trim_end_matches('0').trim_end_matches('.')
    } else {
        fixed.as_str()
    };
    match trimmed {
        "-0" => "0".to_string(),
        other => other.replace('.', ","),
    }
}

/// Round half away from zero to `places` decimals.
pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}
