//! Record transformer/filter
//!
//! Turns one staged CSV payload into the records destined for a sink. The
//! header is bound to the source schema once; after that every row is
//! judged on its own: non-success rows are filtered out, rows whose typed
//! fields do not parse are rejected, and neither affects the other rows.

use chrono::{DateTime, Utc};
use csv::{ReaderBuilder, StringRecord};
use tracing::{debug, warn};

use crate::error::ParseError;
use crate::schema::{
    SourceSchema, SourceTagPolicy, Value, PROCESSED_AT_COLUMN, SOURCE_COLUMN,
};

/// A row translated into destination columns.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformedRecord {
    columns: Vec<(&'static str, Value)>,
}

impl TransformedRecord {
    pub fn columns(&self) -> &[(&'static str, Value)] {
        &self.columns
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.columns.iter().map(|(_, v)| v)
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(name, _)| *name == column)
            .map(|(_, v)| v)
    }
}

/// Result of transforming one artifact.
#[derive(Debug, Default)]
pub struct TransformOutput {
    pub records: Vec<TransformedRecord>,
    /// Data rows read (header excluded)
    pub total_rows: usize,
    /// Rows dropped because `status` was not `"success"`
    pub filtered: usize,
    /// Successful rows dropped because a field failed to parse
    pub rejected: usize,
}

/// Transform a staged CSV payload.
///
/// `source_tag` is the tag resolved from the notification; where it lands is
/// decided by the schema's [`SourceTagPolicy`]. Every record gets the same
/// `processed_at` timestamp.
///
/// Artifact-level problems (unreadable CSV, missing required columns) are
/// errors; row-level problems are counted and logged.
pub fn transform(
    schema: &'static SourceSchema,
    source_tag: &str,
    payload: &[u8],
    processed_at: DateTime<Utc>,
) -> Result<TransformOutput, ParseError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(payload);

    let headers = reader.headers()?.clone();
    let bound = schema.bind(&headers)?;

    let mut output = TransformOutput::default();
    let mut row = StringRecord::new();
    while reader.read_record(&mut row)? {
        output.total_rows += 1;
        let row_number = output.total_rows;

        if !bound.is_success(&row) {
            output.filtered += 1;
            debug!(
                row = row_number,
                status = bound.status(&row),
                "Dropping non-success row"
            );
            continue;
        }

        let mut columns = match bound.parse_fields(&row, row_number) {
            Ok(columns) => columns,
            Err(e) => {
                output.rejected += 1;
                warn!(table = schema.table, error = %e, "Dropping unparseable row");
                continue;
            },
        };

        let source = match (schema.source_policy, bound.embedded_source(&row)) {
            (SourceTagPolicy::PreferEmbedded, Some(embedded)) => embedded,
            _ => source_tag,
        };
        columns.push((SOURCE_COLUMN, Value::Text(source.to_string())));
        columns.push((PROCESSED_AT_COLUMN, Value::Timestamp(processed_at)));

        output.records.push(TransformedRecord { columns });
    }

    Ok(output)
}
