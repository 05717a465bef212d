//! Per-source schema descriptors
//!
//! Each producer writes a CSV artifact with its own column set. A
//! [`SourceSchema`] lists, in destination order, which columns the consumer
//! reads, how each value is parsed, and whether the column must be present.
//! The header is checked against the descriptor once per artifact
//! ([`SourceSchema::bind`]); rows are then read by index.

use chrono::{DateTime, NaiveDateTime, Utc};
use csv::StringRecord;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ParseError;
use mdp_common::MdpError;
use tracing::warn;

pub const STATUS_COLUMN: &str = "status";
pub const SUCCESS_STATUS: &str = "success";
pub const SOURCE_COLUMN: &str = "source";
pub const PROCESSED_AT_COLUMN: &str = "processed_at";

/// Producers known to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Crypto prices scraped from CoinMarketCap
    CoinMarketCap,
    /// FX rates from Open Exchange Rates
    OpenExchangeRates,
    /// Minute-level equity quotes from Yahoo Finance
    YahooFinance,
}

impl SourceKind {
    pub const ALL: [SourceKind; 3] = [
        SourceKind::CoinMarketCap,
        SourceKind::OpenExchangeRates,
        SourceKind::YahooFinance,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::CoinMarketCap => "coinmarketcap",
            SourceKind::OpenExchangeRates => "openexchangerates",
            SourceKind::YahooFinance => "yahoofinance",
        }
    }

    pub fn schema(self) -> &'static SourceSchema {
        match self {
            SourceKind::CoinMarketCap => &CRYPTO_PRICES,
            SourceKind::OpenExchangeRates => &EXCHANGE_RATES,
            SourceKind::YahooFinance => &STOCK_QUOTES,
        }
    }
}

impl FromStr for SourceKind {
    type Err = MdpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "coinmarketcap" => Ok(SourceKind::CoinMarketCap),
            "openexchangerates" | "openexchangerate" => Ok(SourceKind::OpenExchangeRates),
            "yahoofinance" | "yahoo" => Ok(SourceKind::YahooFinance),
            other => Err(MdpError::UnknownSource(other.to_string())),
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a raw CSV cell is turned into a typed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    /// Decimal string, optionally formatted as currency or percentage
    Decimal,
    /// Whole number; integral floats like `"1200.0"` are accepted
    Integer,
    Timestamp,
}

impl FieldKind {
    pub fn expected(self) -> &'static str {
        match self {
            FieldKind::Text => "text",
            FieldKind::Decimal => "decimal",
            FieldKind::Integer => "integer",
            FieldKind::Timestamp => "timestamp",
        }
    }

    /// Parse a non-empty raw cell.
    pub fn parse(self, raw: &str) -> Option<Value> {
        match self {
            FieldKind::Text => Some(Value::Text(raw.to_string())),
            FieldKind::Decimal => parse_decimal(raw).map(Value::Decimal),
            FieldKind::Integer => parse_integer(raw).map(Value::Integer),
            FieldKind::Timestamp => parse_timestamp(raw).map(Value::Timestamp),
        }
    }
}

/// A typed destination value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Text(String),
    Decimal(f64),
    Integer(i64),
    Timestamp(DateTime<Utc>),
    /// Absent optional field; keeps its kind so sinks can type the null
    Null(FieldKind),
}

impl Value {
    /// Plain-text rendering used by CSV outputs.
    pub fn to_field(&self) -> String {
        match self {
            Value::Text(s) => s.clone(),
            Value::Decimal(d) => d.to_string(),
            Value::Integer(i) => i.to_string(),
            Value::Timestamp(ts) => ts.to_rfc3339(),
            Value::Null(_) => String::new(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// One column read from the artifact.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    /// Header name in the staged CSV
    pub column: &'static str,
    /// Column name in the destination table
    pub destination: &'static str,
    pub kind: FieldKind,
    pub required: bool,
}

const fn required(column: &'static str, destination: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec {
        column,
        destination,
        kind,
        required: true,
    }
}

const fn optional(column: &'static str, destination: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec {
        column,
        destination,
        kind,
        required: false,
    }
}

/// Where the `source` column of a record comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceTagPolicy {
    /// Keep the row's own `source` value; fall back to the notification tag
    PreferEmbedded,
    /// Always write the notification's tag
    FromNotification,
}

/// Column mapping for one source.
#[derive(Debug)]
pub struct SourceSchema {
    pub kind: SourceKind,
    /// Destination table
    pub table: &'static str,
    pub fields: &'static [FieldSpec],
    pub source_policy: SourceTagPolicy,
}

pub static CRYPTO_PRICES: SourceSchema = SourceSchema {
    kind: SourceKind::CoinMarketCap,
    table: "crypto_prices",
    fields: &[
        required("name", "name", FieldKind::Text),
        required("symbol", "symbol", FieldKind::Text),
        required("price", "price", FieldKind::Decimal),
        optional("change_24h", "change_24h", FieldKind::Decimal),
        optional("change_7d", "change_7d", FieldKind::Decimal),
        optional("market_cap", "market_cap", FieldKind::Decimal),
        required("timestamp", "observed_at", FieldKind::Timestamp),
        required(STATUS_COLUMN, "status", FieldKind::Text),
    ],
    source_policy: SourceTagPolicy::PreferEmbedded,
};

pub static EXCHANGE_RATES: SourceSchema = SourceSchema {
    kind: SourceKind::OpenExchangeRates,
    table: "exchange_rates",
    fields: &[
        required("currency", "currency", FieldKind::Text),
        required("rate", "rate", FieldKind::Decimal),
        required("base", "base", FieldKind::Text),
        required("exchange_timestamp", "exchange_timestamp", FieldKind::Timestamp),
        required("ingest_timestamp", "ingest_timestamp", FieldKind::Timestamp),
        required(STATUS_COLUMN, "status", FieldKind::Text),
    ],
    source_policy: SourceTagPolicy::PreferEmbedded,
};

pub static STOCK_QUOTES: SourceSchema = SourceSchema {
    kind: SourceKind::YahooFinance,
    table: "stock_quotes",
    fields: &[
        required("Datetime", "datetime", FieldKind::Timestamp),
        required("Open", "open", FieldKind::Decimal),
        required("High", "high", FieldKind::Decimal),
        required("Low", "low", FieldKind::Decimal),
        required("Close", "close", FieldKind::Decimal),
        required("Volume", "volume", FieldKind::Integer),
        required("symbol", "symbol", FieldKind::Text),
        required("ingest_timestamp", "ingest_timestamp", FieldKind::Timestamp),
        required(STATUS_COLUMN, "status", FieldKind::Text),
    ],
    source_policy: SourceTagPolicy::FromNotification,
};

impl SourceSchema {
    /// Destination columns in record order: mapped fields, `source`, `processed_at`.
    pub fn destination_columns(&self) -> Vec<&'static str> {
        self.fields
            .iter()
            .map(|f| f.destination)
            .chain([SOURCE_COLUMN, PROCESSED_AT_COLUMN])
            .collect()
    }

    /// Resolve column positions against an artifact header.
    pub fn bind(&'static self, headers: &StringRecord) -> Result<BoundSchema, ParseError> {
        let position = |name: &str| headers.iter().position(|h| h.trim() == name);

        let mut missing = Vec::new();
        let mut indices = Vec::with_capacity(self.fields.len());
        for field in self.fields {
            let index = position(field.column);
            if index.is_none() && field.required {
                missing.push(field.column.to_string());
            }
            indices.push(index);
        }

        if !missing.is_empty() {
            return Err(ParseError::MissingColumns(missing));
        }

        let status_index = position(STATUS_COLUMN)
            .ok_or_else(|| ParseError::MissingColumns(vec![STATUS_COLUMN.to_string()]))?;

        Ok(BoundSchema {
            schema: self,
            indices,
            status_index,
            source_index: position(SOURCE_COLUMN),
        })
    }
}

/// A schema resolved against one artifact's header.
#[derive(Debug)]
pub struct BoundSchema {
    pub schema: &'static SourceSchema,
    indices: Vec<Option<usize>>,
    status_index: usize,
    source_index: Option<usize>,
}

impl BoundSchema {
    pub fn is_success(&self, row: &StringRecord) -> bool {
        row.get(self.status_index) == Some(SUCCESS_STATUS)
    }

    pub fn status<'r>(&self, row: &'r StringRecord) -> &'r str {
        row.get(self.status_index).unwrap_or_default()
    }

    pub fn embedded_source<'r>(&self, row: &'r StringRecord) -> Option<&'r str> {
        self.source_index
            .and_then(|i| row.get(i))
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Parse the mapped fields of one row, in destination order.
    ///
    /// `row_number` is 1-based over data rows and only used in errors.
    pub fn parse_fields(
        &self,
        row: &StringRecord,
        row_number: usize,
    ) -> Result<Vec<(&'static str, Value)>, ParseError> {
        let mut values = Vec::with_capacity(self.schema.fields.len() + 2);

        for (field, index) in self.schema.fields.iter().zip(&self.indices) {
            let raw = index.and_then(|i| row.get(i)).map(str::trim).unwrap_or("");

            let value = if raw.is_empty() {
                if field.required {
                    return Err(ParseError::MissingField {
                        row: row_number,
                        column: field.column.to_string(),
                    });
                }
                Value::Null(field.kind)
            } else {
                match field.kind.parse(raw) {
                    Some(value) => value,
                    None if field.required => {
                        return Err(ParseError::InvalidField {
                            row: row_number,
                            column: field.column.to_string(),
                            value: raw.to_string(),
                            expected: field.kind.expected(),
                        });
                    },
                    None => {
                        warn!(
                            row = row_number,
                            column = field.column,
                            value = raw,
                            expected = field.kind.expected(),
                            "Nulling unparseable optional field"
                        );
                        Value::Null(field.kind)
                    },
                }
            };

            values.push((field.destination, value));
        }

        Ok(values)
    }
}

/// Parse a decimal, tolerating `$`, thousands separators, a trailing `%`
/// and exponent notation such as `1.6e-05`.
pub fn parse_decimal(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    let (negative, unsigned) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let unsigned = unsigned.strip_prefix('$').unwrap_or(unsigned);
    let unsigned = unsigned.strip_suffix('%').unwrap_or(unsigned);
    let digits: String = unsigned.chars().filter(|c| *c != ',').collect();

    // A second sign would otherwise be accepted by `f64::from_str`.
    if !digits.starts_with(|c: char| c.is_ascii_digit() || c == '.') {
        return None;
    }

    let value: f64 = digits.parse().ok()?;
    value
        .is_finite()
        .then_some(if negative { -value } else { value })
}

/// Lower bound of `i64` as an exact `f64` (-2^63).
const I64_MIN_F64: f64 = i64::MIN as f64;
/// One past the upper bound of `i64` as an exact `f64` (2^63).
const I64_END_F64: f64 = -(i64::MIN as f64);

/// Parse a whole number, accepting integral floats such as `"1200.0"`.
///
/// Values outside the `i64` range are rejected rather than saturated.
pub fn parse_integer(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    if let Ok(value) = trimmed.parse::<i64>() {
        return Some(value);
    }
    let value = parse_decimal(trimmed)?;
    let in_range = (I64_MIN_F64..I64_END_F64).contains(&value);
    (value.fract() == 0.0 && in_range).then_some(value as i64)
}

const OFFSET_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%z"];
const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Parse a timestamp; offset-less values are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();

    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in OFFSET_FORMATS {
        if let Ok(ts) = DateTime::parse_from_str(trimmed, format) {
            return Some(ts.with_timezone(&Utc));
        }
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(trimmed, format).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_source_kind_round_trip_and_aliases() {
        for kind in SourceKind::ALL {
            assert_eq!(kind.as_str().parse::<SourceKind>().unwrap(), kind);
            assert_eq!(kind.schema().kind, kind);
        }
        assert_eq!(
            "OpenExchangeRate".parse::<SourceKind>().unwrap(),
            SourceKind::OpenExchangeRates
        );
        assert!(matches!(
            "unknown".parse::<SourceKind>(),
            Err(MdpError::UnknownSource(_))
        ));
    }

    #[test]
    fn test_parse_decimal_formats() {
        assert_eq!(parse_decimal("0.91234"), Some(0.91234));
        assert_eq!(parse_decimal("$67,123.45"), Some(67123.45));
        assert_eq!(parse_decimal("-1.25%"), Some(-1.25));
        assert_eq!(parse_decimal(" +3 "), Some(3.0));
        assert_eq!(parse_decimal("abc"), None);
        assert_eq!(parse_decimal("NaN"), None);
        assert_eq!(parse_decimal("inf"), None);
        assert_eq!(parse_decimal("1.2.3"), None);
        assert_eq!(parse_decimal("$"), None);
        assert_eq!(parse_decimal("--5"), None);
        assert_eq!(parse_decimal("1e999"), None);
    }

    #[test]
    fn test_parse_decimal_exponent_notation() {
        assert_eq!(parse_decimal("1.6e-05"), Some(1.6e-05));
        assert_eq!(parse_decimal("1e5"), Some(100000.0));
        assert_eq!(parse_decimal("-2.5E+3"), Some(-2500.0));
        assert_eq!(parse_decimal("e5"), None);
    }

    #[test]
    fn test_parse_integer() {
        assert_eq!(parse_integer("1200"), Some(1200));
        assert_eq!(parse_integer("1200.0"), Some(1200));
        assert_eq!(parse_integer("1200.5"), None);
        assert_eq!(parse_integer("lots"), None);
        assert_eq!(parse_integer("1.2e3"), Some(1200));
        assert_eq!(parse_integer("-9223372036854775808.0"), Some(i64::MIN));
        assert_eq!(parse_integer("9223372036854775808.0"), None);
        assert_eq!(parse_integer("1e20"), None);
    }

    #[test]
    fn test_unparseable_optional_field_becomes_null() {
        let headers = StringRecord::from(vec![
            "name", "symbol", "price", "market_cap", "timestamp", "status",
        ]);
        let bound = CRYPTO_PRICES.bind(&headers).unwrap();
        let row = StringRecord::from(vec![
            "Bitcoin",
            "BTC",
            "$64,000.00",
            "$1.26T$1,260,112,334,001",
            "2024-05-01T13:00:00+00:00",
            "success",
        ]);

        let values = bound.parse_fields(&row, 1).unwrap();
        let market_cap = values.iter().find(|(name, _)| *name == "market_cap").unwrap();
        assert!(matches!(market_cap.1, Value::Null(_)));
        assert_eq!(values[2], ("price", Value::Decimal(64000.0)));
    }

    #[test]
    fn test_unparseable_required_field_is_an_error() {
        let headers = StringRecord::from(vec!["name", "symbol", "price", "timestamp", "status"]);
        let bound = CRYPTO_PRICES.bind(&headers).unwrap();
        let row = StringRecord::from(vec![
            "Bitcoin", "BTC", "n/a", "2024-05-01T13:00:00+00:00", "success",
        ]);

        assert!(matches!(
            bound.parse_fields(&row, 1),
            Err(ParseError::InvalidField { .. })
        ));
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 5, 1, 13, 30, 0).unwrap();

        assert_eq!(parse_timestamp("2024-05-01T13:30:00+00:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-05-01T13:30:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2024-05-01 09:30:00-04:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-05-01T13:30:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-05-01 13:30:00"), Some(expected));
        assert!(parse_timestamp("2024-05-01T13:30:00.123456+00:00").is_some());
        assert_eq!(parse_timestamp("yesterday"), None);
        assert_eq!(parse_timestamp("2024-13-01T00:00:00"), None);
    }

    #[test]
    fn test_bind_reports_all_missing_required_columns() {
        let headers = StringRecord::from(vec!["currency", "base", "status"]);
        let err = EXCHANGE_RATES.bind(&headers).unwrap_err();
        match err {
            ParseError::MissingColumns(cols) => {
                assert_eq!(cols, vec!["rate", "exchange_timestamp", "ingest_timestamp"]);
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_bind_tolerates_missing_optional_and_extra_columns() {
        let headers = StringRecord::from(vec![
            "name", "symbol", "price", "timestamp", "status", "rank",
        ]);
        let bound = CRYPTO_PRICES.bind(&headers).unwrap();
        let row = StringRecord::from(vec![
            "Bitcoin", "BTC", "$64,000.00", "2024-05-01T13:00:00+00:00", "success", "1",
        ]);

        assert!(bound.is_success(&row));
        assert_eq!(bound.embedded_source(&row), None);

        let values = bound.parse_fields(&row, 1).unwrap();
        assert_eq!(values[2], ("price", Value::Decimal(64000.0)));
        assert_eq!(values[3], ("change_24h", Value::Null(FieldKind::Decimal)));
        assert_eq!(values.len(), CRYPTO_PRICES.fields.len());
    }

    #[test]
    fn test_destination_columns_end_with_source_and_processed_at() {
        let cols = STOCK_QUOTES.destination_columns();
        assert_eq!(cols.first(), Some(&"datetime"));
        assert_eq!(&cols[cols.len() - 2..], &[SOURCE_COLUMN, PROCESSED_AT_COLUMN]);
    }

    #[test]
    fn test_status_must_match_exactly() {
        let headers = StringRecord::from(vec!["currency", "rate", "base", "exchange_timestamp", "ingest_timestamp", "status"]);
        let bound = EXCHANGE_RATES.bind(&headers).unwrap();
        let row = |status: &str| {
            StringRecord::from(vec!["EUR", "0.9", "USD", "2024-05-01T13:00:00", "2024-05-01T13:01:00", status])
        };
        assert!(bound.is_success(&row("success")));
        assert!(!bound.is_success(&row("Success")));
        assert!(!bound.is_success(&row("error: timeout")));
    }
}
