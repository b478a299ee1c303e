//! SpreadsheetProcessor: the capability seam behind the router.
//!
//! The router owns the wire; a processor owns spreadsheet semantics. The
//! in-memory implementation here backs standalone runs and tests.

use std::collections::HashMap;
use std::future::Future;

use parking_lot::RwLock;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("invalid cell reference: {0}")]
    InvalidReference(String),

    #[error("{0}")]
    Rejected(String),
}

/// What a chat turn produced. Proposed changes are previewed to the client
/// and only applied once approved.
#[derive(Debug, Clone, Default)]
pub struct ChatReply {
    pub message: String,
    pub data: Option<Value>,
    pub proposed_changes: Vec<Value>,
}

impl ChatReply {
    pub fn text(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }
}

pub trait SpreadsheetProcessor: Send + Sync + 'static {
    fn process_chat_message(
        &self,
        session_id: &str,
        message: &str,
        context: Option<Value>,
    ) -> impl Future<Output = Result<ChatReply, ProcessorError>> + Send;

    fn get_cell_value(
        &self,
        sheet: &str,
        cell: &str,
    ) -> impl Future<Output = Result<Value, ProcessorError>> + Send;

    fn get_range_values(
        &self,
        sheet: &str,
        range: &str,
    ) -> impl Future<Output = Result<Vec<Vec<Value>>, ProcessorError>> + Send;

    /// Store a value and return what the cell now holds.
    fn update_cell(
        &self,
        sheet: &str,
        cell: &str,
        value: Value,
        formula: Option<String>,
    ) -> impl Future<Output = Result<Value, ProcessorError>> + Send;

    fn update_range(
        &self,
        sheet: &str,
        range: &str,
        values: Vec<Vec<Value>>,
    ) -> impl Future<Output = Result<(), ProcessorError>> + Send;
}

// ─────────────────────────────────────────────────────────────────────────────
// Cell addressing
// ─────────────────────────────────────────────────────────────────────────────

/// Zero-based (column, row) of an `A1`-style reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellRef {
    pub col: u32,
    pub row: u32,
}

impl CellRef {
    pub fn parse(reference: &str) -> Result<Self, ProcessorError> {
        let invalid = || ProcessorError::InvalidReference(reference.to_string());
        let reference = reference.trim().replace('$', "");
        let split = reference
            .find(|c: char| c.is_ascii_digit())
            .ok_or_else(invalid)?;
        let (letters, digits) = reference.split_at(split);
        if letters.is_empty() || !letters.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(invalid());
        }

        let mut col: u32 = 0;
        for c in letters.chars() {
            let n = c.to_ascii_uppercase() as u32 - 'A' as u32 + 1;
            col = col.checked_mul(26).and_then(|v| v.checked_add(n)).ok_or_else(invalid)?;
        }
        let row: u32 = digits.parse().map_err(|_| invalid())?;
        if row == 0 {
            return Err(invalid());
        }
        Ok(Self { col: col - 1, row: row - 1 })
    }

    pub fn to_a1(self) -> String {
        let mut n = self.col + 1;
        let mut letters = Vec::new();
        while n > 0 {
            let rem = (n - 1) % 26;
            letters.push((b'A' + rem as u8) as char);
            n = (n - 1) / 26;
        }
        letters.reverse();
        format!("{}{}", letters.into_iter().collect::<String>(), self.row + 1)
    }
}

/// Largest range a single read or write may cover.
pub const MAX_RANGE_CELLS: u64 = 100_000;

/// Inclusive rectangle; a single cell is a 1×1 range. Ranges larger than
/// [`MAX_RANGE_CELLS`] are rejected.
fn parse_range(range: &str) -> Result<(CellRef, CellRef), ProcessorError> {
    let (start, end) = match range.split_once(':') {
        Some((a, b)) => (CellRef::parse(a)?, CellRef::parse(b)?),
        None => {
            let cell = CellRef::parse(range)?;
            (cell, cell)
        }
    };
    let low = CellRef { col: start.col.min(end.col), row: start.row.min(end.row) };
    let high = CellRef { col: start.col.max(end.col), row: start.row.max(end.row) };

    let rows = u64::from(high.row - low.row) + 1;
    let cols = u64::from(high.col - low.col) + 1;
    match rows.checked_mul(cols) {
        Some(cells) if cells <= MAX_RANGE_CELLS => Ok((low, high)),
        _ => Err(ProcessorError::Rejected(format!(
            "range {range} exceeds {MAX_RANGE_CELLS} cells"
        ))),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory processor
// ─────────────────────────────────────────────────────────────────────────────

/// Keeps cell values in memory and echoes chat. Empty cells read as `null`.
#[derive(Default)]
pub struct InMemoryProcessor {
    sheets: RwLock<HashMap<String, HashMap<CellRef, Value>>>,
}

impl InMemoryProcessor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SpreadsheetProcessor for InMemoryProcessor {
    async fn process_chat_message(
        &self,
        _session_id: &str,
        message: &str,
        context: Option<Value>,
    ) -> Result<ChatReply, ProcessorError> {
        Ok(ChatReply {
            message: format!("Received: {message}"),
            data: context,
            proposed_changes: Vec::new(),
        })
    }

    async fn get_cell_value(&self, sheet: &str, cell: &str) -> Result<Value, ProcessorError> {
        let cell = CellRef::parse(cell)?;
        Ok(self
            .sheets
            .read()
            .get(sheet)
            .and_then(|cells| cells.get(&cell).cloned())
            .unwrap_or(Value::Null))
    }

    async fn get_range_values(&self, sheet: &str, range: &str) -> Result<Vec<Vec<Value>>, ProcessorError> {
        let (start, end) = parse_range(range)?;
        let sheets = self.sheets.read();
        let cells = sheets.get(sheet);
        Ok((start.row..=end.row)
            .map(|row| {
                (start.col..=end.col)
                    .map(|col| {
                        cells
                            .and_then(|c| c.get(&CellRef { col, row }).cloned())
                            .unwrap_or(Value::Null)
                    })
                    .collect()
            })
            .collect())
    }

    async fn update_cell(
        &self,
        sheet: &str,
        cell: &str,
        value: Value,
        _formula: Option<String>,
    ) -> Result<Value, ProcessorError> {
        let cell = CellRef::parse(cell)?;
        self.sheets
            .write()
            .entry(sheet.to_string())
            .or_default()
            .insert(cell, value.clone());
        Ok(value)
    }

    async fn update_range(
        &self,
        sheet: &str,
        range: &str,
        values: Vec<Vec<Value>>,
    ) -> Result<(), ProcessorError> {
        let (start, end) = parse_range(range)?;
        let rows = (end.row - start.row + 1) as usize;
        let cols = (end.col - start.col + 1) as usize;
        if values.len() > rows || values.iter().any(|r| r.len() > cols) {
            return Err(ProcessorError::Rejected(format!(
                "values do not fit in {range} ({rows}x{cols})"
            )));
        }

        let mut sheets = self.sheets.write();
        let cells = sheets.entry(sheet.to_string()).or_default();
        for (r, row) in values.into_iter().enumerate() {
            for (c, value) in row.into_iter().enumerate() {
                let at = CellRef { col: start.col + c as u32, row: start.row + r as u32 };
                cells.insert(at, value);
            }
        }
        Ok(())
    }
}
