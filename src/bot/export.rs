//! CSV and JSON exports of a user's processed numbers.

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::bot::numbers::{DecimalSeparator, ExtractedNumber, numeric_value};
use crate::error::ExportError;

const FILE_PREFIX: &str = "decimal_stripper_export";

/// Amounts and charges as displayed to the user, in collection order.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportTable {
    pub amounts: Vec<String>,
    pub charges: Vec<String>,
    separator: DecimalSeparator,
}

#[derive(Serialize)]
struct JsonExport<'a> {
    #[serde(rename = "Amounts")]
    amounts: &'a [String],
    #[serde(rename = "Charges")]
    charges: &'a [String],
    #[serde(rename = "Total Sum")]
    total_sum: f64,
}

impl ExportTable {
    pub fn build(
        numbers: &[ExtractedNumber],
        include_currency: bool,
        separator: DecimalSeparator,
    ) -> Result<Self, ExportError> {
        if numbers.is_empty() {
            return Err(ExportError::Empty);
        }
        let (amounts, charges): (Vec<_>, Vec<_>) = numbers.iter().partition(|n| n.is_amount());
        let shown = |list: Vec<&ExtractedNumber>| {
            list.into_iter()
                .map(|n| n.display(include_currency))
                .collect::<Vec<_>>()
        };
        Ok(Self {
            amounts: shown(amounts),
            charges: shown(charges),
            separator,
        })
    }

    fn value(&self, display: &str) -> f64 {
        numeric_value(display, self.separator).unwrap_or(0.0)
    }

    /// Sum of every amount and charge. Unparseable values count as zero.
    pub fn total_sum(&self) -> f64 {
        self.amounts
            .iter()
            .chain(&self.charges)
            .map(|v| self.value(v))
            .sum()
    }

    /// Three columns: the i-th amount, the i-th charge and their sum.
    pub fn to_csv(&self) -> Vec<u8> {
        let mut out = String::new();
        write_row(&mut out, ["Amounts", "Charges", "Row Sum"]);

        let rows = self.amounts.len().max(self.charges.len());
        for i in 0..rows {
            let amount = self.amounts.get(i).map(String::as_str).unwrap_or("");
            let charge = self.charges.get(i).map(String::as_str).unwrap_or("");
            let sum: f64 = [amount, charge]
                .into_iter()
                .filter(|v| !v.is_empty())
                .map(|v| self.value(v))
                .sum();
            let sum = float_str(sum);
            write_row(&mut out, [amount, charge, sum.as_str()]);
        }
        out.into_bytes()
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ExportError> {
        let export = JsonExport {
            amounts: &self.amounts,
            charges: &self.charges,
            total_sum: self.total_sum(),
        };
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        export.serialize(&mut ser)?;
        Ok(buf)
    }

    pub fn csv_caption(&self) -> String {
        format!(
            "📊 CSV export with {} amounts, {} charges, and row-by-row sums.",
            self.amounts.len(),
            self.charges.len()
        )
    }

    pub fn json_caption(&self) -> String {
        format!(
            "📊 JSON export with {} amounts, {} charges, and their sum.",
            self.amounts.len(),
            self.charges.len()
        )
    }
}

pub fn csv_filename(user_id: i64, at: DateTime<Local>) -> String {
    filename(user_id, at, "csv")
}

pub fn json_filename(user_id: i64, at: DateTime<Local>) -> String {
    filename(user_id, at, "json")
}

fn filename(user_id: i64, at: DateTime<Local>, ext: &str) -> String {
    format!("{FILE_PREFIX}_{user_id}_{}.{ext}", at.format("%Y%m%d_%H%M%S"))
}

fn write_row<'a>(out: &mut String, fields: impl IntoIterator<Item = &'a str>) {
    let cells: Vec<String> = fields.into_iter().map(csv_field).collect();
    out.push_str(&cells.join(","));
    out.push_str("\r\n");
}

fn csv_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Float rendering with a trailing `.0` on whole numbers, so sums read
/// `1250.0` rather than `1250`.
fn float_str(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e16 {
        format!("{value:.1}")
    } else {
        value.to_string()
    }
}
