//! The seam to the raw database driver. The runtime only ever talks to
//! these traits; real drivers live outside this crate.

use std::time::Duration;

use ahash::AHashMap;
use strum_macros::{Display, EnumString};

use crate::errors::DataStoreError;
use crate::types::SqlType;
use crate::value::Value;

pub type DriverResult<T> = Result<T, DataStoreError>;

/// How a statement is sent to the driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum StatementStyle {
    /// Plain text, no placeholders bound by the driver.
    Statement,
    #[default]
    Prepared,
    Callable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// Everything the driver needs to prepare one statement.
#[derive(Debug, Clone, Default)]
pub struct StatementSpec {
    pub sql: String,
    pub style: StatementStyle,
    pub timeout: Option<Duration>,
    pub fetch_size: Option<u32>,
}

impl StatementSpec {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            ..Default::default()
        }
    }
}

/// A fully-consumed result set. Results are owned by the call that opened
/// them; drivers hand back the complete rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSetData {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl ResultSetData {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    /// Case-insensitive column lookup, the way drivers resolve labels.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
    }

    pub fn row(&self, index: usize) -> Option<RowView<'_>> {
        self.rows.get(index).map(|values| RowView {
            columns: &self.columns,
            values,
        })
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = RowView<'_>> {
        self.rows.iter().map(|values| RowView {
            columns: &self.columns,
            values,
        })
    }
}

/// A borrowed view over one row.
#[derive(Debug, Clone, Copy)]
pub struct RowView<'a> {
    columns: &'a [String],
    values: &'a [Value],
}

impl<'a> RowView<'a> {
    pub fn new(columns: &'a [String], values: &'a [Value]) -> Self {
        Self { columns, values }
    }

    pub fn columns(&self) -> &'a [String] {
        self.columns
    }

    pub fn get_by_index(&self, index: usize) -> Option<&'a Value> {
        self.values.get(index)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&'a Value> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .and_then(|i| self.values.get(i))
    }
}

/// A prepared statement. Indices are zero-based.
pub trait Statement: Send {
    fn bind(&mut self, index: usize, value: Value, sql_type: Option<SqlType>) -> DriverResult<()>;

    fn execute_query(&mut self) -> DriverResult<ResultSetData>;

    fn execute_update(&mut self) -> DriverResult<u64>;

    /// Keys generated by the last update, when the driver supports them.
    fn generated_keys(&mut self) -> DriverResult<Option<ResultSetData>>;

    /// Queues the currently-bound parameters for a batch run.
    fn add_batch(&mut self) -> DriverResult<()>;

    fn execute_batch(&mut self) -> DriverResult<Vec<u64>>;

    /// OUT-parameter results of a callable statement, one row keyed by
    /// parameter position.
    fn out_results(&mut self) -> DriverResult<Option<ResultSetData>> {
        Ok(None)
    }
}

pub trait Connection: Send {
    fn prepare(&mut self, spec: &StatementSpec) -> DriverResult<Box<dyn Statement>>;

    fn commit(&mut self) -> DriverResult<()>;

    fn rollback(&mut self) -> DriverResult<()>;

    fn set_auto_commit(&mut self, auto_commit: bool) -> DriverResult<()>;

    fn auto_commit(&self) -> bool;

    fn set_isolation(&mut self, level: IsolationLevel) -> DriverResult<()>;

    fn close(&mut self) -> DriverResult<()>;

    fn is_closed(&self) -> bool;

    /// The vendor product string, consulted by the database-id provider.
    fn product_name(&self) -> String;
}

pub trait Driver: Send + Sync {
    fn connect(
        &self,
        url: &str,
        properties: &AHashMap<String, String>,
    ) -> DriverResult<Box<dyn Connection>>;
}
