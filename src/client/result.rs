//! Raw, undecoded results.

use crate::error::{Error, ErrorFields, Result};
use crate::protocol::backend::{DataRow, FieldDescriptionTail};
use crate::protocol::types::{FormatCode, Oid};

/// Outcome class of one result, mirroring libpq's `ExecStatusType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    /// The statement string was empty
    EmptyQuery,
    /// A command that returns no rows completed
    CommandOk,
    /// A row-returning statement completed
    TuplesOk,
    /// The server's response was not understood
    BadResponse,
    NonfatalError,
    /// The server reported an error
    FatalError,
}

impl ResultStatus {
    /// `TuplesOk`, `CommandOk` and `EmptyQuery` count as success.
    pub fn is_success(self) -> bool {
        matches!(
            self,
            ResultStatus::TuplesOk | ResultStatus::CommandOk | ResultStatus::EmptyQuery
        )
    }
}

/// Column information from RowDescription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub tail: FieldDescriptionTail,
}

impl ColumnInfo {
    /// Describe a computed column.
    pub fn new(name: impl Into<String>, type_oid: Oid, format: FormatCode) -> Self {
        Self {
            name: name.into(),
            tail: FieldDescriptionTail::synthetic(type_oid, format),
        }
    }

    /// Table OID (0 if not a table column)
    pub fn table_oid(&self) -> Oid {
        self.tail.table_oid.get()
    }

    /// Data type OID
    pub fn type_oid(&self) -> Oid {
        self.tail.type_oid.get()
    }

    /// Type modifier (type-specific)
    pub fn type_modifier(&self) -> i32 {
        self.tail.type_modifier.get()
    }

    /// Format code (0=text, 1=binary)
    pub fn format(&self) -> FormatCode {
        FormatCode::from_u16(self.tail.format.get())
    }
}

/// One complete result as received from the server.
///
/// Rows keep their DataRow payloads verbatim; decoding is left to
/// [`ResultSet`](crate::value::ResultSet).
#[derive(Debug, Clone)]
pub struct PgResult {
    status: ResultStatus,
    columns: Vec<ColumnInfo>,
    rows: Vec<Vec<u8>>,
    command_tag: String,
    error: Option<ErrorFields>,
}

impl PgResult {
    pub fn new(status: ResultStatus) -> Self {
        Self {
            status,
            columns: Vec::new(),
            rows: Vec::new(),
            command_tag: String::new(),
            error: None,
        }
    }

    /// A failed result carrying the server's error fields.
    pub fn from_error(fields: ErrorFields) -> Self {
        Self {
            error: Some(fields),
            ..Self::new(ResultStatus::FatalError)
        }
    }

    /// Build a row-returning result from column descriptions and cell values.
    ///
    /// Each row must have one entry per column; `None` is NULL.
    pub fn with_rows(columns: Vec<ColumnInfo>, rows: &[Vec<Option<&[u8]>>]) -> Self {
        let rows = rows
            .iter()
            .map(|cells| {
                let mut payload = (cells.len() as u16).to_be_bytes().to_vec();
                for cell in cells {
                    match cell {
                        Some(bytes) => {
                            payload.extend_from_slice(&(bytes.len() as i32).to_be_bytes());
                            payload.extend_from_slice(bytes);
                        }
                        None => payload.extend_from_slice(&(-1_i32).to_be_bytes()),
                    }
                }
                payload
            })
            .collect::<Vec<_>>();
        Self {
            command_tag: format!("SELECT {}", rows.len()),
            columns,
            rows,
            ..Self::new(ResultStatus::TuplesOk)
        }
    }

    pub fn status(&self) -> ResultStatus {
        self.status
    }

    pub fn columns(&self) -> &[ColumnInfo] {
        &self.columns
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Iterate over rows as parsed DataRow views.
    pub fn rows(&self) -> impl Iterator<Item = Result<DataRow<'_>>> + '_ {
        self.rows.iter().map(|payload| DataRow::parse(payload))
    }

    /// Command tag, e.g. `SELECT 3` or `INSERT 0 1`.
    pub fn command_tag(&self) -> &str {
        &self.command_tag
    }

    /// Server error fields, for failed results.
    pub fn error_fields(&self) -> Option<&ErrorFields> {
        self.error.as_ref()
    }

    /// Human-readable error text, empty on success.
    pub fn error_message(&self) -> String {
        self.error
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default()
    }

    pub(crate) fn set_status(&mut self, status: ResultStatus) {
        self.status = status;
    }

    pub(crate) fn set_columns(&mut self, columns: Vec<ColumnInfo>) {
        self.columns = columns;
    }

    /// Keep a DataRow payload. It must describe one value per column.
    pub(crate) fn push_row(&mut self, payload: &[u8]) -> Result<()> {
        let row = DataRow::parse(payload)?;
        if row.len() != self.columns.len() {
            return Err(Error::Protocol(format!(
                "DataRow has {} values, RowDescription has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        row.validate()?;
        self.rows.push(payload.to_vec());
        Ok(())
    }

    pub(crate) fn set_command_tag(&mut self, tag: &str) {
        self.command_tag = tag.to_string();
    }
}
