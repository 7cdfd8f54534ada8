//! An in-memory driver for exercising the runtime without a database:
//! tables as column/row stores with trivial insert/select matching,
//! scripted responses matched by SQL text, a recorded statement log,
//! failure injection and a generated-key sequence.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use ahash::AHashMap;
use squill_core::Value;
use squill_core::driver::{
    Connection, Driver, DriverResult, IsolationLevel, ResultSetData, Statement, StatementSpec,
};
use squill_core::errors::DataStoreError;
use squill_core::types::SqlType;

#[derive(Debug, Clone)]
pub struct Executed {
    pub sql: String,
    pub parameters: Vec<Value>,
}

#[derive(Debug, Clone)]
enum Response {
    Rows(ResultSetData),
    Affected(u64),
    Fail(String),
}

#[derive(Debug)]
struct Scripted {
    needle: String,
    response: Response,
    once: bool,
}

#[derive(Debug, Default, Clone)]
struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Table {
    fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug)]
struct Shared {
    product: String,
    responses: Mutex<Vec<Scripted>>,
    tables: Mutex<AHashMap<String, Table>>,
    log: Mutex<Vec<Executed>>,
    key_sequence: AtomicI64,
    fail_pings: AtomicBool,
    pings_to_fail: AtomicUsize,
    fail_connects: AtomicUsize,
    connect_count: AtomicUsize,
    commit_count: AtomicUsize,
    rollback_count: AtomicUsize,
}

/// The driver handed to data sources in tests.
#[derive(Debug, Clone)]
pub struct MemoryDriver {
    shared: Arc<Shared>,
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::with_product("Memory DB")
    }

    pub fn with_product(product: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                product: product.into(),
                responses: Mutex::new(Vec::new()),
                tables: Mutex::new(AHashMap::new()),
                log: Mutex::new(Vec::new()),
                key_sequence: AtomicI64::new(1),
                fail_pings: AtomicBool::new(false),
                pings_to_fail: AtomicUsize::new(0),
                fail_connects: AtomicUsize::new(0),
                connect_count: AtomicUsize::new(0),
                commit_count: AtomicUsize::new(0),
                rollback_count: AtomicUsize::new(0),
            }),
        }
    }

    /// Builds a result set from column names and row literals.
    pub fn rows(columns: &[&str], rows: &[&[Value]]) -> ResultSetData {
        ResultSetData::new(
            columns.iter().map(|c| c.to_string()).collect(),
            rows.iter().map(|r| r.to_vec()).collect(),
        )
    }

    /// Seeds a table served by the trivial statement matcher.
    pub fn create_table(&self, name: &str, columns: &[&str], rows: &[&[Value]]) -> &Self {
        self.shared
            .tables
            .lock()
            .expect("memory driver tables")
            .insert(
                name.to_lowercase(),
                Table {
                    columns: columns.iter().map(|c| c.to_string()).collect(),
                    rows: rows.iter().map(|r| r.to_vec()).collect(),
                },
            );
        self
    }

    /// The current rows of a table, for assertions.
    pub fn table_rows(&self, name: &str) -> Vec<Vec<Value>> {
        self.shared
            .tables
            .lock()
            .expect("memory driver tables")
            .get(&name.to_lowercase())
            .map(|table| table.rows.clone())
            .unwrap_or_default()
    }

    /// Queries whose SQL contains `needle` answer with these rows.
    /// Scripted responses take precedence over table storage.
    pub fn respond_rows(&self, needle: impl Into<String>, data: ResultSetData) -> &Self {
        self.push(needle, Response::Rows(data), false);
        self
    }

    /// Like `respond_rows`, but consumed by the first match.
    pub fn respond_rows_once(&self, needle: impl Into<String>, data: ResultSetData) -> &Self {
        self.push(needle, Response::Rows(data), true);
        self
    }

    pub fn respond_affected(&self, needle: impl Into<String>, count: u64) -> &Self {
        self.push(needle, Response::Affected(count), false);
        self
    }

    pub fn respond_error(&self, needle: impl Into<String>, message: impl Into<String>) -> &Self {
        self.push(needle, Response::Fail(message.into()), false);
        self
    }

    fn push(&self, needle: impl Into<String>, response: Response, once: bool) {
        self.shared
            .responses
            .lock()
            .expect("memory driver responses")
            .push(Scripted {
                needle: needle.into(),
                response,
                once,
            });
    }

    pub fn fail_pings(&self, fail: bool) {
        self.shared.fail_pings.store(fail, Ordering::SeqCst);
    }

    /// Only the next `n` ping queries fail.
    pub fn fail_next_pings(&self, n: usize) {
        self.shared.pings_to_fail.store(n, Ordering::SeqCst);
    }

    /// The next `n` connect attempts fail.
    pub fn fail_next_connects(&self, n: usize) {
        self.shared.fail_connects.store(n, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.shared.connect_count.load(Ordering::SeqCst)
    }

    pub fn commit_count(&self) -> usize {
        self.shared.commit_count.load(Ordering::SeqCst)
    }

    pub fn rollback_count(&self) -> usize {
        self.shared.rollback_count.load(Ordering::SeqCst)
    }

    /// Every statement executed so far, with its bound parameters.
    pub fn executed(&self) -> Vec<Executed> {
        self.shared.log.lock().expect("memory driver log").clone()
    }

    pub fn executed_sql(&self) -> Vec<String> {
        self.executed().into_iter().map(|e| e.sql).collect()
    }
}

impl Driver for MemoryDriver {
    fn connect(
        &self,
        _url: &str,
        _properties: &AHashMap<String, String>,
    ) -> DriverResult<Box<dyn Connection>> {
        let pending_failures = self.shared.fail_connects.load(Ordering::SeqCst);
        if pending_failures > 0 {
            self.shared
                .fail_connects
                .store(pending_failures - 1, Ordering::SeqCst);
            return Err(DataStoreError::Driver("connect refused by script".into()));
        }
        self.shared.connect_count.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryConnection {
            shared: self.shared.clone(),
            auto_commit: true,
            closed: false,
        }))
    }
}

struct MemoryConnection {
    shared: Arc<Shared>,
    auto_commit: bool,
    closed: bool,
}

impl MemoryConnection {
    fn check(&self) -> DriverResult<()> {
        if self.closed {
            Err(DataStoreError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Connection for MemoryConnection {
    fn prepare(&mut self, spec: &StatementSpec) -> DriverResult<Box<dyn Statement>> {
        self.check()?;
        Ok(Box::new(MemoryStatement {
            shared: self.shared.clone(),
            sql: spec.sql.clone(),
            bindings: Vec::new(),
            batch: Vec::new(),
            last_key: None,
        }))
    }

    fn commit(&mut self) -> DriverResult<()> {
        self.check()?;
        self.shared.commit_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn rollback(&mut self) -> DriverResult<()> {
        self.check()?;
        self.shared.rollback_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn set_auto_commit(&mut self, auto_commit: bool) -> DriverResult<()> {
        self.check()?;
        self.auto_commit = auto_commit;
        Ok(())
    }

    fn auto_commit(&self) -> bool {
        self.auto_commit
    }

    fn set_isolation(&mut self, _level: IsolationLevel) -> DriverResult<()> {
        self.check()
    }

    fn close(&mut self) -> DriverResult<()> {
        self.closed = true;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn product_name(&self) -> String {
        self.shared.product.clone()
    }
}

struct MemoryStatement {
    shared: Arc<Shared>,
    sql: String,
    bindings: Vec<Value>,
    batch: Vec<Vec<Value>>,
    last_key: Option<i64>,
}

impl MemoryStatement {
    fn record(&self, parameters: Vec<Value>) {
        self.shared
            .log
            .lock()
            .expect("memory driver log")
            .push(Executed {
                sql: self.sql.clone(),
                parameters,
            });
    }

    fn matched_response(&self) -> Option<Response> {
        let mut responses = self.shared.responses.lock().expect("memory driver responses");
        let position = responses
            .iter()
            .position(|scripted| self.sql.contains(&scripted.needle))?;
        let response = responses[position].response.clone();
        if responses[position].once {
            responses.remove(position);
        }
        Some(response)
    }

    /// `SELECT cols FROM t [WHERE col = ?]` against table storage.
    fn table_query(&self, parameters: &[Value]) -> Option<ResultSetData> {
        let select = parse_select(&self.sql)?;
        let tables = self.shared.tables.lock().expect("memory driver tables");
        let table = tables.get(&select.table)?;

        let rows: Vec<Vec<Value>> = match &select.condition {
            None => table.rows.clone(),
            Some(column) => {
                let index = table.column_index(column)?;
                let needle = parameters.first().cloned().unwrap_or(Value::Null);
                table
                    .rows
                    .iter()
                    .filter(|row| row.get(index) == Some(&needle))
                    .cloned()
                    .collect()
            }
        };

        if select.columns.is_empty() {
            return Some(ResultSetData::new(table.columns.clone(), rows));
        }
        let mut columns = Vec::with_capacity(select.columns.len());
        let mut indices = Vec::with_capacity(select.columns.len());
        for requested in &select.columns {
            match table.column_index(requested) {
                Some(index) => {
                    columns.push(table.columns[index].clone());
                    indices.push(Some(index));
                }
                None => {
                    columns.push(requested.clone());
                    indices.push(None);
                }
            }
        }
        let projected = rows
            .iter()
            .map(|row| {
                indices
                    .iter()
                    .map(|index| {
                        index
                            .and_then(|index| row.get(index))
                            .cloned()
                            .unwrap_or(Value::Null)
                    })
                    .collect()
            })
            .collect();
        Some(ResultSetData::new(columns, projected))
    }

    /// `INSERT INTO t [(cols)] VALUES (…)` into table storage. A missing
    /// table is created on first insert.
    fn table_insert(&self, parameters: &[Value]) -> Option<u64> {
        let insert = parse_insert(&self.sql)?;
        let mut tables = self.shared.tables.lock().expect("memory driver tables");
        let table = tables.entry(insert.table).or_insert_with(|| Table {
            columns: if insert.columns.is_empty() {
                (0..parameters.len()).map(|i| format!("c{i}")).collect()
            } else {
                insert.columns.clone()
            },
            rows: Vec::new(),
        });
        let row: Vec<Value> = if insert.columns.is_empty() {
            (0..table.columns.len())
                .map(|i| parameters.get(i).cloned().unwrap_or(Value::Null))
                .collect()
        } else {
            table
                .columns
                .iter()
                .map(|column| {
                    insert
                        .columns
                        .iter()
                        .position(|c| c.eq_ignore_ascii_case(column))
                        .and_then(|i| parameters.get(i))
                        .cloned()
                        .unwrap_or(Value::Null)
                })
                .collect()
        };
        table.rows.push(row);
        Some(1)
    }

    fn is_ping(&self) -> bool {
        self.sql.trim().eq_ignore_ascii_case("SELECT 1")
            || self.sql.trim().eq_ignore_ascii_case("NO PING QUERY SET")
    }

    fn ping_should_fail(&self) -> bool {
        if self.shared.fail_pings.load(Ordering::SeqCst) {
            return true;
        }
        let remaining = self.shared.pings_to_fail.load(Ordering::SeqCst);
        if remaining > 0 {
            self.shared
                .pings_to_fail
                .store(remaining - 1, Ordering::SeqCst);
            true
        } else {
            false
        }
    }
}

impl Statement for MemoryStatement {
    fn bind(&mut self, index: usize, value: Value, _sql_type: Option<SqlType>) -> DriverResult<()> {
        if self.bindings.len() <= index {
            self.bindings.resize(index + 1, Value::Null);
        }
        self.bindings[index] = value;
        Ok(())
    }

    fn execute_query(&mut self) -> DriverResult<ResultSetData> {
        if self.is_ping() && self.ping_should_fail() {
            return Err(DataStoreError::Driver("ping refused by script".into()));
        }
        let parameters = std::mem::take(&mut self.bindings);
        self.record(parameters.clone());
        match self.matched_response() {
            Some(Response::Rows(data)) => Ok(data),
            Some(Response::Affected(_)) => Ok(ResultSetData::default()),
            Some(Response::Fail(message)) => Err(DataStoreError::Driver(message)),
            None => Ok(self.table_query(&parameters).unwrap_or_default()),
        }
    }

    fn execute_update(&mut self) -> DriverResult<u64> {
        let parameters = std::mem::take(&mut self.bindings);
        self.record(parameters.clone());
        self.last_key = Some(self.shared.key_sequence.fetch_add(1, Ordering::SeqCst));
        match self.matched_response() {
            Some(Response::Affected(count)) => Ok(count),
            Some(Response::Rows(_)) => Ok(1),
            Some(Response::Fail(message)) => Err(DataStoreError::Driver(message)),
            None => Ok(self.table_insert(&parameters).unwrap_or(1)),
        }
    }

    fn generated_keys(&mut self) -> DriverResult<Option<ResultSetData>> {
        Ok(self.last_key.map(|key| {
            ResultSetData::new(vec!["id".to_string()], vec![vec![Value::Int(key)]])
        }))
    }

    fn add_batch(&mut self) -> DriverResult<()> {
        self.batch.push(std::mem::take(&mut self.bindings));
        Ok(())
    }

    fn execute_batch(&mut self) -> DriverResult<Vec<u64>> {
        let batch = std::mem::take(&mut self.batch);
        let mut counts = Vec::with_capacity(batch.len());
        for parameters in batch {
            self.record(parameters.clone());
            counts.push(match self.matched_response() {
                Some(Response::Affected(count)) => count,
                Some(Response::Fail(message)) => {
                    return Err(DataStoreError::Driver(message));
                }
                Some(Response::Rows(_)) => 1,
                None => self.table_insert(&parameters).unwrap_or(1),
            });
        }
        Ok(counts)
    }
}

struct SelectSpec {
    columns: Vec<String>,
    table: String,
    condition: Option<String>,
}

/// Recognizes `select <cols|*> from <table> [where <col> = ?]`. Anything
/// richer falls back to scripted or default responses.
fn parse_select(sql: &str) -> Option<SelectSpec> {
    let lower = sql.trim().to_lowercase();
    let rest = lower.strip_prefix("select ")?;
    let from_pos = rest.find(" from ")?;
    let columns_part = rest[..from_pos].trim();
    let after_from = rest[from_pos + 6..].trim();

    let (table_part, condition_part) = match after_from.find(" where ") {
        Some(where_pos) => (
            &after_from[..where_pos],
            Some(after_from[where_pos + 7..].trim()),
        ),
        None => (after_from, None),
    };
    let table = table_part.split_whitespace().next()?.to_string();

    let condition = match condition_part {
        None => None,
        Some(condition) => {
            let (column, rhs) = condition.split_once('=')?;
            if rhs.trim() != "?" {
                return None;
            }
            Some(column.trim().to_string())
        }
    };

    let columns = if columns_part == "*" {
        Vec::new()
    } else {
        columns_part
            .split(',')
            .map(|c| c.trim().to_string())
            .collect()
    };
    Some(SelectSpec {
        columns,
        table,
        condition,
    })
}

struct InsertSpec {
    table: String,
    columns: Vec<String>,
}

/// Recognizes `insert into <table> [(cols)] values (…)`.
fn parse_insert(sql: &str) -> Option<InsertSpec> {
    let lower = sql.trim().to_lowercase();
    let rest = lower.strip_prefix("insert into ")?;
    let values_pos = rest.find("values")?;
    let head = rest[..values_pos].trim();
    let (table, columns) = match head.find('(') {
        Some(open) => {
            let table = head[..open].trim().to_string();
            let list = head[open + 1..].trim_end().trim_end_matches(')');
            (
                table,
                list.split(',').map(|c| c.trim().to_string()).collect(),
            )
        }
        None => (head.to_string(), Vec::new()),
    };
    if table.is_empty() || table.contains(' ') {
        return None;
    }
    Some(InsertSpec { table, columns })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn prepare(driver: &MemoryDriver, sql: &str) -> Box<dyn Statement> {
        let mut connection = driver.connect("mem://t", &AHashMap::new()).unwrap();
        connection.prepare(&StatementSpec::new(sql)).unwrap()
    }

    #[test]
    fn inserts_populate_table_storage() {
        let driver = MemoryDriver::new();
        let mut stmt = prepare(&driver, "insert into users (id, name) values (?, ?)");
        stmt.bind(0, Value::Int(1), None).unwrap();
        stmt.bind(1, Value::Str("ada".into()), None).unwrap();
        assert_eq!(stmt.execute_update().unwrap(), 1);
        assert_eq!(
            driver.table_rows("users"),
            vec![vec![Value::Int(1), Value::Str("ada".into())]]
        );
    }

    #[test]
    fn selects_filter_on_a_bound_column() {
        let driver = MemoryDriver::new();
        driver.create_table(
            "users",
            &["id", "name"],
            &[
                &[Value::Int(1), Value::Str("ada".into())],
                &[Value::Int(2), Value::Str("grace".into())],
            ],
        );
        let mut stmt = prepare(&driver, "select * from users where id = ?");
        stmt.bind(0, Value::Int(2), None).unwrap();
        let data = stmt.execute_query().unwrap();
        assert_eq!(data.columns, vec!["id".to_string(), "name".to_string()]);
        assert_eq!(data.rows, vec![vec![Value::Int(2), Value::Str("grace".into())]]);
    }

    #[test]
    fn selects_project_named_columns() {
        let driver = MemoryDriver::new();
        driver.create_table(
            "users",
            &["id", "name"],
            &[&[Value::Int(1), Value::Str("ada".into())]],
        );
        let mut stmt = prepare(&driver, "select name from users");
        let data = stmt.execute_query().unwrap();
        assert_eq!(data.columns, vec!["name".to_string()]);
        assert_eq!(data.rows, vec![vec![Value::Str("ada".into())]]);
    }

    #[test]
    fn inserted_rows_come_back_through_select() {
        let driver = MemoryDriver::new();
        let mut insert = prepare(&driver, "insert into things (id) values (?)");
        insert.bind(0, Value::Int(7), None).unwrap();
        insert.execute_update().unwrap();

        let mut select = prepare(&driver, "select * from things where id = ?");
        select.bind(0, Value::Int(7), None).unwrap();
        assert_eq!(
            select.execute_query().unwrap().rows,
            vec![vec![Value::Int(7)]]
        );
    }

    #[test]
    fn scripted_responses_win_over_table_storage() {
        let driver = MemoryDriver::new();
        driver.create_table("users", &["id"], &[&[Value::Int(1)]]);
        driver.respond_rows("from users", MemoryDriver::rows(&["id"], &[&[Value::Int(9)]]));
        let mut stmt = prepare(&driver, "select * from users");
        assert_eq!(
            stmt.execute_query().unwrap().rows,
            vec![vec![Value::Int(9)]]
        );
    }

    #[test]
    fn unparsed_statements_fall_back_to_defaults() {
        let driver = MemoryDriver::new();
        let mut update = prepare(&driver, "update things set x = 1");
        assert_eq!(update.execute_update().unwrap(), 1);
        let mut select = prepare(&driver, "select mem_now()");
        assert_eq!(select.execute_query().unwrap(), ResultSetData::default());
    }
}
