//! Number extraction and amount/charge classification.
//!
//! Values whose integer part exceeds [`AMOUNT_THRESHOLD`] are amounts and
//! lose their decimal part. Everything else is a charge and is kept
//! exactly as written.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

pub const AMOUNT_THRESHOLD: f64 = 50.0;

/// Currency symbols recognised in front of a number.
pub const CURRENCY_SYMBOLS: [char; 4] = ['€', '$', '£', '¥'];

static DOT_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([€$£¥])?(-?\d+(?:\.\d+)?)").expect("valid dot-separated number regex")
});

static COMMA_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([€$£¥])?(-?\d+(?:,\d+)?)").expect("valid comma-separated number regex")
});

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecimalSeparator {
    #[default]
    Dot,
    Comma,
}

impl DecimalSeparator {
    pub fn as_char(self) -> char {
        match self {
            Self::Dot => '.',
            Self::Comma => ',',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '.' => Some(Self::Dot),
            ',' => Some(Self::Comma),
            _ => None,
        }
    }

    fn pattern(self) -> &'static Regex {
        match self {
            Self::Dot => &*DOT_NUMBER,
            Self::Comma => &*COMMA_NUMBER,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Amount,
    Charge,
}

/// One number found in a message.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedNumber {
    pub currency: Option<char>,
    /// The digits as they appeared, sign and decimals included.
    pub original: String,
    /// `original` with the decimal part removed for amounts.
    pub processed: String,
    /// Integer part, used for classification.
    pub value: f64,
    pub has_decimal: bool,
    pub category: Category,
}

impl ExtractedNumber {
    /// Currency symbol and original digits.
    pub fn full_match(&self) -> String {
        match self.currency {
            Some(c) => format!("{c}{}", self.original),
            None => self.original.clone(),
        }
    }

    /// The processed value, with the currency symbol when requested.
    pub fn display(&self, include_currency: bool) -> String {
        match self.currency {
            Some(c) if include_currency => format!("{c}{}", self.processed),
            _ => self.processed.clone(),
        }
    }

    pub fn is_amount(&self) -> bool {
        self.category == Category::Amount
    }
}

/// Find every number in `text`.
pub fn extract(text: &str, separator: DecimalSeparator) -> Vec<ExtractedNumber> {
    let sep = separator.as_char();
    separator
        .pattern()
        .captures_iter(text)
        .filter_map(|caps| {
            let original = caps.get(2)?.as_str().to_string();
            let currency = caps.get(1).and_then(|m| m.as_str().chars().next());
            let (integer_part, has_decimal) = match original.split_once(sep) {
                Some((int, _)) => (int.to_string(), true),
                None => (original.clone(), false),
            };
            let value = integer_part.parse::<f64>().unwrap_or(0.0);
            let (category, processed) = if value > AMOUNT_THRESHOLD {
                (Category::Amount, integer_part)
            } else {
                (Category::Charge, original.clone())
            };
            Some(ExtractedNumber {
                currency,
                original,
                processed,
                value,
                has_decimal,
                category,
            })
        })
        .collect()
}

/// Numbers from several messages, in message order.
pub fn extract_all<'a, I>(texts: I, separator: DecimalSeparator) -> Vec<ExtractedNumber>
where
    I: IntoIterator<Item = &'a str>,
{
    texts
        .into_iter()
        .flat_map(|text| extract(text, separator))
        .collect()
}

/// Parse a displayed value back into a number: currency symbols are
/// dropped and a comma separator becomes a dot.
pub fn numeric_value(display: &str, separator: DecimalSeparator) -> Option<f64> {
    let mut cleaned: String = display
        .chars()
        .filter(|c| !CURRENCY_SYMBOLS.contains(c))
        .collect();
    if separator == DecimalSeparator::Comma {
        cleaned = cleaned.replace(',', ".");
    }
    cleaned.trim().parse().ok()
}
