//! Aggregation: map page results onto the fixed column layout and append
//! them to a table.
//!
//! This module is pure: it works on an in-memory [`Table`]. Loading and
//! persisting the spreadsheet (and serialising writers to the same file)
//! lives in [`crate::sheet`].
//!
//! Rows are only ever appended after the last populated row. Existing rows,
//! including a header that differs from [`COLUMNS`], are never modified;
//! new values are written positionally.

use crate::output::{ExtractedFields, ExtractionOutcome, PageResult};
use chrono::{Duration, NaiveDate};
use serde_json::{json, Value};

/// Header row of a freshly created table, in column order.
pub const COLUMNS: [&str; 11] = [
    "Page",
    "Type Document",
    "Date",
    "Montant",
    "Devise",
    "Emetteur",
    "Destinataire",
    "Numéro Document",
    "Autres Informations",
    "Image Path",
    "Date Traitement",
];

/// Field keys feeding columns 2–8, in column order.
pub const FIELD_KEYS: [&str; 7] = [
    "type_document",
    "date",
    "montant",
    "devise",
    "emetteur",
    "destinataire",
    "numero_document",
];

/// Field key feeding the auxiliary-data column.
pub const AUX_KEY: &str = "autres_informations";

/// Format of the processed-at column.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One spreadsheet cell value.
///
/// `DateTime` and `Duration` hold the raw Excel serial (days since
/// 1899-12-30) so a loaded date is written back as the same date.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Text(String),
    Number(f64),
    Bool(bool),
    DateTime(f64),
    Duration(f64),
}

impl Cell {
    pub fn text(s: impl Into<String>) -> Self {
        Cell::Text(s.into())
    }

    /// Map a JSON field value to a cell. Nested values become compact JSON text.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Cell::Empty,
            Value::String(s) => Cell::Text(s.clone()),
            Value::Bool(b) => Cell::Bool(*b),
            Value::Number(n) => n.as_f64().map(Cell::Number).unwrap_or(Cell::Empty),
            Value::Array(_) | Value::Object(_) => Cell::Text(value.to_string()),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Cell::Empty => Value::Null,
            Cell::Text(s) => Value::String(s.clone()),
            Cell::Bool(b) => Value::Bool(*b),
            Cell::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Cell::DateTime(_) | Cell::Duration(_) => Value::String(self.as_display()),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Cell::Empty)
    }

    /// Display form used for header names and diagnostics.
    pub fn as_display(&self) -> String {
        match self {
            Cell::Empty => String::new(),
            Cell::Text(s) => s.clone(),
            Cell::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", *n as i64),
            Cell::Number(n) => n.to_string(),
            Cell::Bool(b) => (if *b { "TRUE" } else { "FALSE" }).to_string(),
            Cell::DateTime(serial) => display_serial_date(*serial),
            Cell::Duration(serial) => {
                let secs = (serial * 86_400.0).round() as i64;
                format!("{}:{:02}:{:02}", secs / 3600, secs % 3600 / 60, secs % 60)
            }
        }
    }
}

fn display_serial_date(serial: f64) -> String {
    let millis = (serial * 86_400_000.0).round() as i64;
    let Some(at) = NaiveDate::from_ymd_opt(1899, 12, 30)
        .and_then(|epoch| epoch.and_hms_opt(0, 0, 0))
        .and_then(|epoch| epoch.checked_add_signed(Duration::milliseconds(millis)))
    else {
        return serial.to_string();
    };
    if serial.fract() == 0.0 {
        at.format("%Y-%m-%d").to_string()
    } else {
        at.format(TIMESTAMP_FORMAT).to_string()
    }
}

/// Rows of cells; row 0 is the header once the table is non-empty.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    rows: Vec<Vec<Cell>>,
}

impl Table {
    /// A table holding only the [`COLUMNS`] header row.
    pub fn with_header() -> Self {
        Self {
            rows: vec![COLUMNS.iter().map(|h| Cell::text(*h)).collect()],
        }
    }

    /// Build from loaded rows. Trailing all-empty rows are dropped so the
    /// next append lands right after the last populated row.
    pub fn from_rows(mut rows: Vec<Vec<Cell>>) -> Self {
        while rows
            .last()
            .map(|r| r.iter().all(Cell::is_empty))
            .unwrap_or(false)
        {
            rows.pop();
        }
        Self { rows }
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    pub fn header(&self) -> Option<&[Cell]> {
        self.rows.first().map(Vec::as_slice)
    }

    /// Every row after the header.
    pub fn data_rows(&self) -> &[Vec<Cell>] {
        self.rows.get(1..).unwrap_or(&[])
    }

    /// Number of populated rows, header included.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Widest row, in cells.
    pub fn width(&self) -> usize {
        self.rows.iter().map(Vec::len).max().unwrap_or(0)
    }

    pub fn push_row(&mut self, row: Vec<Cell>) {
        self.rows.push(row);
    }

    /// Add header cells after the last used column of the table.
    pub fn extend_header(&mut self, headers: impl IntoIterator<Item = Cell>) {
        let width = self.width();
        if self.rows.is_empty() {
            self.rows.push(Vec::new());
        }
        let header = &mut self.rows[0];
        header.resize(width, Cell::Empty);
        header.extend(headers);
    }
}

/// Append one row per page result, in the given order.
///
/// `None` (or a table with no rows at all) starts a new table with the
/// [`COLUMNS`] header. `processed_at` is stamped on every appended row.
pub fn append(existing: Option<Table>, results: &[PageResult], processed_at: &str) -> Table {
    let mut table = match existing {
        Some(t) if !t.is_empty() => t,
        _ => Table::with_header(),
    };

    for result in results {
        table.push_row(build_row(result, processed_at));
    }
    table
}

/// The 11 cells for one page result.
pub fn build_row(result: &PageResult, processed_at: &str) -> Vec<Cell> {
    let mut row = Vec::with_capacity(COLUMNS.len());
    row.push(Cell::Number(result.page as f64));

    match &result.outcome {
        ExtractionOutcome::Success {
            fields: ExtractedFields::Structured(map),
            ..
        } => {
            for key in FIELD_KEYS {
                row.push(map.get(key).map(Cell::from_json).unwrap_or(Cell::Empty));
            }
            let aux = map.get(AUX_KEY).cloned().unwrap_or_else(|| json!({}));
            row.push(Cell::Text(aux.to_string()));
        }
        ExtractionOutcome::Success {
            fields: ExtractedFields::RawText(text),
            ..
        } => {
            row.extend(FIELD_KEYS.iter().map(|_| Cell::Empty));
            row.push(Cell::Text(json!({ "raw_text": text }).to_string()));
        }
        ExtractionOutcome::Failure(failure) => {
            row.extend(FIELD_KEYS.iter().map(|_| Cell::Empty));
            row.push(Cell::Text(
                json!({ "error": failure.kind.as_str(), "message": failure.message }).to_string(),
            ));
        }
    }

    row.push(Cell::Text(result.image.path.display().to_string()));
    row.push(Cell::text(processed_at));
    row
}

/// Local wall-clock time in [`TIMESTAMP_FORMAT`].
pub fn timestamp_now() -> String {
    chrono::Local::now().format(TIMESTAMP_FORMAT).to_string()
}
