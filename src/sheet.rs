//! Spreadsheet persistence for result tables (`.xlsx`).
//!
//! Reading uses `calamine` (values only), writing uses `rust_xlsxwriter`.
//! A save rewrites the whole workbook. The result sheet comes first with
//! its header row styled and every column 15 wide; any other worksheets of
//! the loaded workbook are written back after it, values only. Date and
//! duration cells keep a number format so they reload as the same values.
//!
//! Writes go to a temp file in the target's directory that is then renamed
//! over the target; readers never see a half-written table. The file keeps
//! the target's permissions, or `0644` when it is new.
//!
//! ## Concurrent appends
//!
//! "Find the first unused row" is a read-modify-write on a plain file.
//! [`append_to_file`] holds a per-output-path async mutex for the whole
//! cycle, which serialises appends from the same process. Writers in
//! other processes still need their own external lock.

use crate::error::Pdf2SheetError;
use crate::output::PageResult;
use crate::pipeline::aggregate::{self, Cell, Table, COLUMNS};
use calamine::{open_workbook, Data, Range, Reader, Xlsx};
use once_cell::sync::Lazy;
use rust_xlsxwriter::{Color, Format, FormatAlign, Workbook, Worksheet, XlsxError};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fs::Permissions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Name of the worksheet written to every new table.
pub const SHEET_NAME: &str = "Résultats Analyse";

/// Width applied to every column.
pub const COLUMN_WIDTH: f64 = 15.0;

/// Header fill colour.
const HEADER_FILL: u32 = 0xCCCCCC;

/// Excel's per-cell string limit.
const MAX_CELL_CHARS: usize = 32_767;

const DATE_FORMAT: &str = "yyyy-mm-dd";
const DATETIME_FORMAT: &str = "yyyy-mm-dd hh:mm:ss";
const DURATION_FORMAT: &str = "[h]:mm:ss";

/// A table file: the result sheet plus every other worksheet it carries.
#[derive(Debug, Clone, PartialEq)]
pub struct TableBook {
    /// Name of the first worksheet, which holds the results.
    pub sheet_name: String,
    pub table: Table,
    /// Remaining worksheets in workbook order.
    pub others: Vec<(String, Table)>,
}

impl TableBook {
    /// A single-sheet book named [`SHEET_NAME`].
    pub fn new(table: Table) -> Self {
        Self {
            sheet_name: SHEET_NAME.to_string(),
            table,
            others: Vec::new(),
        }
    }
}

// ── Per-path write locks ─────────────────────────────────────────────────

type LockMap = HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>;

static TABLE_LOCKS: Lazy<Mutex<LockMap>> = Lazy::new(Default::default);

fn lock_key(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Handle on one path's write lock. The registry entry goes away when the
/// last handle for that path is dropped.
struct TableLock {
    key: PathBuf,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl TableLock {
    fn for_path(path: &Path) -> Self {
        let key = lock_key(path);
        let mut locks = TABLE_LOCKS.lock().unwrap_or_else(|p| p.into_inner());
        let lock = Arc::clone(locks.entry(key.clone()).or_default());
        Self { key, lock }
    }
}

impl Drop for TableLock {
    fn drop(&mut self) {
        let mut locks = TABLE_LOCKS.lock().unwrap_or_else(|p| p.into_inner());
        // Clones are only handed out under the registry mutex: the map's
        // copy plus ours means nobody else is waiting.
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.key);
        }
    }
}

// ── Reading ──────────────────────────────────────────────────────────────

/// Load every worksheet of an existing table.
pub fn load_book(path: &Path) -> Result<TableBook, Pdf2SheetError> {
    let read_err = |detail: String| Pdf2SheetError::TableReadFailed {
        path: path.to_path_buf(),
        detail,
    };

    if !path.exists() {
        return Err(Pdf2SheetError::FileNotFound {
            path: path.to_path_buf(),
        });
    }

    let mut workbook: Xlsx<std::io::BufReader<std::fs::File>> = open_workbook(path).map_err(|e: calamine::XlsxError| read_err(e.to_string()))?;
    let mut sheets = Vec::new();
    for name in workbook.sheet_names() {
        let range = workbook
            .worksheet_range(&name)
            .map_err(|e| read_err(e.to_string()))?;
        sheets.push((name, table_from_range(&range)));
    }

    let mut sheets = sheets.into_iter();
    let (sheet_name, table) = sheets
        .next()
        .ok_or_else(|| read_err("workbook has no worksheet".to_string()))?;
    let book = TableBook {
        sheet_name,
        table,
        others: sheets.collect(),
    };
    debug!(
        "Loaded table {} ({} rows, {} other sheets)",
        path.display(),
        book.table.len(),
        book.others.len()
    );
    Ok(book)
}

/// Load the result sheet (the first worksheet) of an existing table.
pub fn load_table(path: &Path) -> Result<Table, Pdf2SheetError> {
    load_book(path).map(|book| book.table)
}

fn table_from_range(range: &Range<Data>) -> Table {
    let (height, width) = match range.end() {
        Some((r, c)) => (r as usize + 1, c as usize + 1),
        None => (0, 0),
    };
    let (r0, c0) = range.start().unwrap_or((0, 0));

    let mut rows = vec![vec![Cell::Empty; width]; height];
    for (r, c, data) in range.used_cells() {
        rows[r0 as usize + r][c0 as usize + c] = cell_from_data(data);
    }
    Table::from_rows(rows)
}

fn cell_from_data(data: &Data) -> Cell {
    match data {
        Data::Empty => Cell::Empty,
        Data::String(s) => Cell::Text(s.clone()),
        Data::Float(f) => Cell::Number(*f),
        Data::Int(i) => Cell::Number(*i as f64),
        Data::Bool(b) => Cell::Bool(*b),
        Data::DateTime(dt) if dt.is_duration() => Cell::Duration(dt.as_f64()),
        Data::DateTime(dt) => Cell::DateTime(dt.as_f64()),
        Data::DateTimeIso(s) | Data::DurationIso(s) => Cell::Text(s.clone()),
        Data::Error(e) => Cell::Text(format!("{:?}", e)),
    }
}

// ── Writing ──────────────────────────────────────────────────────────────

/// Write `table` as a single-sheet workbook, creating parent directories.
pub fn save_table(table: &Table, path: &Path) -> Result<(), Pdf2SheetError> {
    save_book(&TableBook::new(table.clone()), path)
}

/// Write every sheet of `book` to `path`, creating parent directories.
pub fn save_book(book: &TableBook, path: &Path) -> Result<(), Pdf2SheetError> {
    let write_err = |detail: String| Pdf2SheetError::TableWriteFailed {
        path: path.to_path_buf(),
        detail,
    };

    let parent = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(p) => p,
        None => Path::new("."),
    };
    std::fs::create_dir_all(parent).map_err(|e| write_err(e.to_string()))?;

    let mut workbook = Workbook::new();
    fill_workbook(&mut workbook, book).map_err(|e| write_err(e.to_string()))?;

    // Same directory as the target so the final rename stays on one filesystem.
    let tmp = tempfile::Builder::new()
        .prefix(".pdf2sheet-")
        .suffix(".xlsx")
        .tempfile_in(parent)
        .map_err(|e| write_err(e.to_string()))?;
    workbook
        .save(tmp.path())
        .map_err(|e| write_err(e.to_string()))?;
    target_permissions(path, tmp.as_file())
        .and_then(|perms| tmp.as_file().set_permissions(perms))
        .map_err(|e| write_err(e.to_string()))?;
    tmp.persist(path).map_err(|e| write_err(e.error.to_string()))?;

    debug!("Saved table {} ({} rows)", path.display(), book.table.len());
    Ok(())
}

/// Permissions for the saved file: the target's own when it exists.
fn target_permissions(target: &Path, tmp: &std::fs::File) -> std::io::Result<Permissions> {
    if let Ok(meta) = std::fs::metadata(target) {
        return Ok(meta.permissions());
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = tmp;
        Ok(Permissions::from_mode(0o644))
    }
    #[cfg(not(unix))]
    {
        tmp.metadata().map(|m| m.permissions())
    }
}

fn fill_workbook(workbook: &mut Workbook, book: &TableBook) -> Result<(), XlsxError> {
    let header_format = Format::new()
        .set_bold()
        .set_background_color(Color::RGB(HEADER_FILL))
        .set_align(FormatAlign::Center);

    let worksheet = workbook.add_worksheet();
    worksheet.set_name(&book.sheet_name)?;
    for (r, row) in book.table.rows().iter().enumerate() {
        let header = (r == 0).then_some(&header_format);
        for (c, cell) in row.iter().enumerate() {
            write_cell(worksheet, r as u32, c as u16, cell, header)?;
        }
    }
    for c in 0..book.table.width().max(COLUMNS.len()) {
        worksheet.set_column_width(c as u16, COLUMN_WIDTH)?;
    }

    for (name, table) in &book.others {
        let worksheet = workbook.add_worksheet();
        worksheet.set_name(name)?;
        for (r, row) in table.rows().iter().enumerate() {
            for (c, cell) in row.iter().enumerate() {
                write_cell(worksheet, r as u32, c as u16, cell, None)?;
            }
        }
    }
    Ok(())
}

fn num_format(cell: &Cell) -> Option<&'static str> {
    match cell {
        Cell::DateTime(serial) if serial.fract() == 0.0 => Some(DATE_FORMAT),
        Cell::DateTime(_) => Some(DATETIME_FORMAT),
        Cell::Duration(_) => Some(DURATION_FORMAT),
        _ => None,
    }
}

fn write_cell(
    worksheet: &mut Worksheet,
    row: u32,
    col: u16,
    cell: &Cell,
    header: Option<&Format>,
) -> Result<(), XlsxError> {
    let format = match (num_format(cell), header) {
        (Some(nf), Some(h)) => Some(h.clone().set_num_format(nf)),
        (Some(nf), None) => Some(Format::new().set_num_format(nf)),
        (None, h) => h.cloned(),
    };

    match (cell, &format) {
        (Cell::Empty, Some(f)) => {
            worksheet.write_blank(row, col, f)?;
        }
        (Cell::Empty, None) => {}
        (Cell::Text(s), Some(f)) => {
            worksheet.write_string_with_format(row, col, clip(s), f)?;
        }
        (Cell::Text(s), None) => {
            worksheet.write_string(row, col, clip(s))?;
        }
        (Cell::Number(n) | Cell::DateTime(n) | Cell::Duration(n), Some(f)) => {
            worksheet.write_number_with_format(row, col, *n, f)?;
        }
        (Cell::Number(n) | Cell::DateTime(n) | Cell::Duration(n), None) => {
            worksheet.write_number(row, col, *n)?;
        }
        (Cell::Bool(b), Some(f)) => {
            worksheet.write_boolean_with_format(row, col, *b, f)?;
        }
        (Cell::Bool(b), None) => {
            worksheet.write_boolean(row, col, *b)?;
        }
    }
    Ok(())
}

fn clip(s: &str) -> &str {
    match s.char_indices().nth(MAX_CELL_CHARS) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Write a header-only table.
pub fn create_template(path: &Path) -> Result<(), Pdf2SheetError> {
    save_table(&Table::with_header(), path)?;
    info!("Created table template {}", path.display());
    Ok(())
}

/// Every data row of a table keyed by its header cell.
///
/// Columns without a header are keyed `column_{n}` (1-indexed).
pub fn read_records(path: &Path) -> Result<Vec<BTreeMap<String, Value>>, Pdf2SheetError> {
    let table = load_table(path)?;
    let header: Vec<String> = table
        .header()
        .map(|h| h.iter().map(Cell::as_display).collect())
        .unwrap_or_default();

    let records: Vec<BTreeMap<String, Value>> = table
        .data_rows()
        .iter()
        .map(|row| {
            (0..table.width())
                .map(|c| {
                    let key = header
                        .get(c)
                        .filter(|h| !h.is_empty())
                        .cloned()
                        .unwrap_or_else(|| format!("column_{}", c + 1));
                    let value = row.get(c).map(Cell::to_json).unwrap_or(Value::Null);
                    (key, value)
                })
                .collect()
        })
        .collect();
    Ok(records)
}

/// Load `input` (or start a new table), append `results`, save to `output`.
///
/// `input` is only read; it is overwritten only when it is also `output`.
/// Its other worksheets are carried into `output`. Returns the result
/// sheet as written.
pub async fn append_to_file(
    input: Option<&Path>,
    output: &Path,
    results: &[PageResult],
    processed_at: String,
) -> Result<Table, Pdf2SheetError> {
    let table_lock = TableLock::for_path(output);
    let _guard = table_lock.lock.lock().await;

    let input = input.map(Path::to_path_buf);
    let output = output.to_path_buf();
    let results = results.to_vec();

    tokio::task::spawn_blocking(move || {
        let (existing, sheet_name, others) = match input.as_deref().map(load_book).transpose()? {
            Some(book) => (Some(book.table), book.sheet_name, book.others),
            None => (None, SHEET_NAME.to_string(), Vec::new()),
        };
        let before = existing.as_ref().map(Table::len).unwrap_or(0);
        let book = TableBook {
            sheet_name,
            table: aggregate::append(existing, &results, &processed_at),
            others,
        };
        save_book(&book, &output)?;
        info!(
            "Appended {} rows to {} (rows {}→{})",
            results.len(),
            output.display(),
            before,
            book.table.len()
        );
        Ok::<_, Pdf2SheetError>(book.table)
    })
    .await
    .map_err(|e| Pdf2SheetError::Internal(format!("Aggregation task panicked: {}", e)))?
}

/// Add header cells after the last used column of an existing table.
///
/// The new cells take the header style. Returns the result sheet as written.
pub async fn add_headers(path: &Path, headers: &[String]) -> Result<Table, Pdf2SheetError> {
    let table_lock = TableLock::for_path(path);
    let _guard = table_lock.lock.lock().await;

    let path = path.to_path_buf();
    let headers = headers.to_vec();

    tokio::task::spawn_blocking(move || {
        let mut book = load_book(&path)?;
        book.table
            .extend_header(headers.iter().map(|h| Cell::text(h.as_str())));
        save_book(&book, &path)?;
        info!("Added {} header(s) to {}", headers.len(), path.display());
        Ok::<_, Pdf2SheetError>(book.table)
    })
    .await
    .map_err(|e| Pdf2SheetError::Internal(format!("Header task panicked: {}", e)))?
}
