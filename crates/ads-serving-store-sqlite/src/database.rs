//! Typed transaction protocol issued against `SQLite`.
//!
//! Every statement travels as a [`DbCommand`] carrying its bound values and,
//! for reads, the declared column types of its result rows. Binding counts
//! are checked against the prepared statement before anything executes.

use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::{params_from_iter, Connection, ToSql};

use crate::LedgerError;

/// Rows per multi-row `VALUES` command; keeps large batches under the
/// `SQLite` bound-variable limit.
pub const MAX_ROWS_PER_COMMAND: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// DDL or parameterless statements, possibly several per command.
    Execute,
    /// One parameterized write.
    Run,
    /// One parameterized query returning records.
    Read,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    String(String),
    Double(f64),
    Int(i64),
}

impl ToSql for BindValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::String(value) => ToSqlOutput::Borrowed(ValueRef::Text(value.as_bytes())),
            Self::Double(value) => ToSqlOutput::Owned(Value::Real(*value)),
            Self::Int(value) => ToSqlOutput::Owned(Value::Integer(*value)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    String,
    Double,
    Int,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    String(String),
    Double(f64),
    Int(i64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DbRecord {
    columns: Vec<ColumnValue>,
}

impl DbRecord {
    /// # Errors
    /// Returns [`LedgerError::Column`] when the column is absent or not text.
    pub fn column_string(&self, index: usize) -> Result<&str, LedgerError> {
        match self.columns.get(index) {
            Some(ColumnValue::String(value)) => Ok(value),
            _ => Err(LedgerError::Column { index }),
        }
    }

    /// # Errors
    /// Returns [`LedgerError::Column`] when the column is absent or not a double.
    pub fn column_double(&self, index: usize) -> Result<f64, LedgerError> {
        match self.columns.get(index) {
            Some(ColumnValue::Double(value)) => Ok(*value),
            _ => Err(LedgerError::Column { index }),
        }
    }

    /// # Errors
    /// Returns [`LedgerError::Column`] when the column is absent or not an integer.
    pub fn column_int(&self, index: usize) -> Result<i64, LedgerError> {
        match self.columns.get(index) {
            Some(ColumnValue::Int(value)) => Ok(*value),
            _ => Err(LedgerError::Column { index }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DbCommand {
    kind: CommandKind,
    sql: String,
    bindings: Vec<BindValue>,
    record_bindings: Vec<ColumnType>,
}

impl DbCommand {
    #[must_use]
    pub fn execute(sql: impl Into<String>) -> Self {
        Self::new(CommandKind::Execute, sql.into(), Vec::new())
    }

    #[must_use]
    pub fn run(sql: impl Into<String>) -> Self {
        Self::new(CommandKind::Run, sql.into(), Vec::new())
    }

    #[must_use]
    pub fn read(sql: impl Into<String>, record_bindings: &[ColumnType]) -> Self {
        Self::new(CommandKind::Read, sql.into(), record_bindings.to_vec())
    }

    fn new(kind: CommandKind, sql: String, record_bindings: Vec<ColumnType>) -> Self {
        Self {
            kind,
            sql,
            bindings: Vec::new(),
            record_bindings,
        }
    }

    #[must_use]
    pub fn bind_string(mut self, value: impl Into<String>) -> Self {
        self.bindings.push(BindValue::String(value.into()));
        self
    }

    #[must_use]
    pub fn bind_double(mut self, value: f64) -> Self {
        self.bindings.push(BindValue::Double(value));
        self
    }

    #[must_use]
    pub fn bind_int(mut self, value: i64) -> Self {
        self.bindings.push(BindValue::Int(value));
        self
    }

    #[must_use]
    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    #[must_use]
    pub fn bindings(&self) -> &[BindValue] {
        &self.bindings
    }
}

/// Ordered commands applied atomically.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DbTransaction {
    commands: Vec<DbCommand>,
}

impl DbTransaction {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: DbCommand) {
        self.commands.push(command);
    }

    #[must_use]
    pub fn commands(&self) -> &[DbCommand] {
        &self.commands
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DbResponse {
    /// Records of every `Read` command, in command order.
    pub records: Vec<DbRecord>,
    /// Rows changed by `Run` commands.
    pub changes: usize,
}

/// Runs all commands inside one `SQLite` transaction.
///
/// Nothing is committed unless every command succeeds.
///
/// # Errors
/// Returns [`LedgerError::BindingMismatch`] or
/// [`LedgerError::RecordBindingMismatch`] when a command's declared shape
/// does not match its statement, and [`LedgerError::Backend`] for `SQLite`
/// failures.
pub fn run_transaction(
    conn: &Connection,
    transaction: &DbTransaction,
) -> Result<DbResponse, LedgerError> {
    let tx = conn.unchecked_transaction()?;
    let mut response = DbResponse::default();

    for command in &transaction.commands {
        match command.kind {
            CommandKind::Execute => {
                if !command.bindings.is_empty() {
                    return Err(LedgerError::BindingMismatch {
                        expected: 0,
                        actual: command.bindings.len(),
                    });
                }
                tx.execute_batch(&command.sql)?;
            }
            CommandKind::Run => {
                let mut stmt = tx.prepare(&command.sql)?;
                ensure_binding_count(stmt.parameter_count(), command)?;
                response.changes += stmt.execute(params_from_iter(command.bindings.iter()))?;
            }
            CommandKind::Read => {
                let mut stmt = tx.prepare(&command.sql)?;
                ensure_binding_count(stmt.parameter_count(), command)?;
                if stmt.column_count() != command.record_bindings.len() {
                    return Err(LedgerError::RecordBindingMismatch {
                        expected: command.record_bindings.len(),
                        actual: stmt.column_count(),
                    });
                }

                let mut rows = stmt.query(params_from_iter(command.bindings.iter()))?;
                while let Some(row) = rows.next()? {
                    response
                        .records
                        .push(read_record(row, &command.record_bindings)?);
                }
            }
        }
    }

    tx.commit()?;
    Ok(response)
}

/// Builds `(?, ?, ?), (?, ?, ?)` for multi-row inserts.
#[must_use]
pub fn build_binding_parameter_placeholders(
    parameters_count: usize,
    values_count: usize,
) -> String {
    let row = format!("({})", vec!["?"; parameters_count].join(", "));
    vec![row; values_count].join(", ")
}

fn ensure_binding_count(expected: usize, command: &DbCommand) -> Result<(), LedgerError> {
    if expected != command.bindings.len() {
        return Err(LedgerError::BindingMismatch {
            expected,
            actual: command.bindings.len(),
        });
    }
    Ok(())
}

fn read_record(
    row: &rusqlite::Row<'_>,
    record_bindings: &[ColumnType],
) -> Result<DbRecord, LedgerError> {
    let mut columns = Vec::with_capacity(record_bindings.len());
    for (index, column_type) in record_bindings.iter().enumerate() {
        let value = match column_type {
            ColumnType::String => ColumnValue::String(row.get(index)?),
            ColumnType::Double => ColumnValue::Double(row.get(index)?),
            ColumnType::Int => ColumnValue::Int(row.get(index)?),
        };
        columns.push(value);
    }
    Ok(DbRecord { columns })
}
