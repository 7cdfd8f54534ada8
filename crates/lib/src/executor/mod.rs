//! The execution pipeline: statement dispatch, the session-local cache,
//! parameter binding, key generation, and the interceptor chain around it
//! all. Three dispatch styles share one chassis: simple (fresh statement
//! per call), reuse (statements cached by SQL text) and batch (updates
//! queued until flush).

pub mod caching;
mod result_set;

use std::sync::Arc;

use ahash::AHashMap;
use squill_core::Value;
use squill_core::cache::{Cache, CacheKey, PerpetualCache};
use squill_core::driver::{Statement, StatementSpec};
use squill_core::errors::{ConfigError, DataStoreError, Result};
use squill_core::reflect;
use squill_core::sql::{BoundSql, ParameterMapping, ParameterMode};
use squill_core::types::{LangType, TypeHandler};

use crate::config::{Configuration, ExecutorType, LocalCacheScope};
use crate::mapping::{KeyGeneratorKind, MappedStatement};
use crate::plugin::{Interceptor, Invocation, Outcome, run_chain};
use crate::session::RowBounds;

pub use caching::CachingExecutor;

/// The outcome of one flushed batch statement.
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub statement_id: String,
    pub sql: String,
    pub parameters: Vec<Value>,
    pub update_counts: Vec<u64>,
}

pub trait Executor: Send {
    fn query(
        &mut self,
        statement: &Arc<MappedStatement>,
        parameter: Value,
        bounds: RowBounds,
    ) -> Result<Vec<Value>>;

    /// Updates mutate the parameter in place when key generation writes
    /// generated values back.
    fn update(&mut self, statement: &Arc<MappedStatement>, parameter: &mut Value) -> Result<u64>;

    fn flush_statements(&mut self) -> Result<Vec<BatchResult>>;

    fn commit(&mut self, required: bool) -> Result<()>;

    fn rollback(&mut self, required: bool) -> Result<()>;

    fn create_cache_key(
        &self,
        statement: &Arc<MappedStatement>,
        parameter: &Value,
        bounds: &RowBounds,
    ) -> Result<CacheKey>;

    fn is_cached(&self, statement: &Arc<MappedStatement>, key: &CacheKey) -> bool;

    fn clear_local_cache(&mut self);

    fn close(&mut self, force_rollback: bool) -> Result<()>;

    fn is_closed(&self) -> bool;
}

/// Assembles the executor stack for one session: the dispatch chassis,
/// the second-level cache coordinator when caching is enabled, and the
/// interceptor chain outermost.
pub fn new_executor(
    configuration: Arc<Configuration>,
    transaction: Box<dyn crate::transaction::Transaction>,
    executor_type: ExecutorType,
) -> Box<dyn Executor> {
    let kind = match executor_type {
        ExecutorType::Simple => ExecKind::Simple,
        ExecutorType::Reuse => ExecKind::Reuse {
            statements: AHashMap::new(),
        },
        ExecutorType::Batch => ExecKind::Batch { queue: Vec::new() },
    };
    let interceptors = configuration.interceptors().to_vec();
    let cache_enabled = configuration.settings.cache_enabled;
    let base: Box<dyn Executor> = Box::new(DefaultExecutor {
        configuration,
        transaction,
        local_cache: PerpetualCache::new("LocalCache"),
        kind,
        closed: false,
    });
    let cached: Box<dyn Executor> = if cache_enabled {
        Box::new(CachingExecutor::new(base))
    } else {
        base
    };
    if interceptors.is_empty() {
        cached
    } else {
        Box::new(InterceptingExecutor {
            inner: cached,
            interceptors,
        })
    }
}

enum ExecKind {
    Simple,
    Reuse {
        statements: AHashMap<String, Box<dyn Statement>>,
    },
    Batch {
        queue: Vec<BatchItem>,
    },
}

struct BatchItem {
    statement_id: String,
    sql: String,
    stmt: Box<dyn Statement>,
    parameters: Vec<Value>,
}

pub struct DefaultExecutor {
    configuration: Arc<Configuration>,
    transaction: Box<dyn crate::transaction::Transaction>,
    local_cache: PerpetualCache,
    kind: ExecKind,
    closed: bool,
}

impl DefaultExecutor {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(DataStoreError::Closed.into())
        } else {
            Ok(())
        }
    }

    fn statement_spec(&self, statement: &MappedStatement, sql: &str) -> StatementSpec {
        let settings = &self.configuration.settings;
        StatementSpec {
            sql: sql.to_string(),
            style: statement.statement_style,
            timeout: statement.timeout.or(settings.default_statement_timeout),
            fetch_size: statement.fetch_size.or(settings.default_fetch_size),
        }
    }

    fn cache_key_for(
        &self,
        statement: &MappedStatement,
        parameter: &Value,
        bounds: &RowBounds,
        bound: &BoundSql,
    ) -> Result<CacheKey> {
        let mut key = CacheKey::new();
        key.update(Value::Str(statement.id.clone()));
        key.update(Value::Int(bounds.offset as i64));
        key.update(Value::Int(bounds.limit.min(i64::MAX as usize) as i64));
        key.update(Value::Str(bound.sql.clone()));
        key.update_all(bound.bound_values(parameter)?);
        if let Some(environment) = &self.configuration.environment {
            key.update(Value::Str(environment.id.clone()));
        }
        Ok(key)
    }

    fn do_query(
        &mut self,
        statement: &Arc<MappedStatement>,
        parameter: &Value,
        bounds: &RowBounds,
        bound: &BoundSql,
    ) -> Result<Vec<Value>> {
        // batched updates must land before any read
        if matches!(self.kind, ExecKind::Batch { .. }) {
            self.flush(false)?;
        }

        let spec = self.statement_spec(statement, &bound.sql);
        let data = match &mut self.kind {
            ExecKind::Reuse { statements } => {
                if !statements.contains_key(&bound.sql) {
                    let stmt = self.transaction.connection()?.prepare(&spec)?;
                    statements.insert(bound.sql.clone(), stmt);
                }
                let stmt = statements
                    .get_mut(&bound.sql)
                    .expect("statement inserted above");
                bind_parameters(&self.configuration, stmt.as_mut(), statement, bound, parameter)?;
                stmt.execute_query()?
            }
            _ => {
                let mut stmt = self.transaction.connection()?.prepare(&spec)?;
                bind_parameters(&self.configuration, stmt.as_mut(), statement, bound, parameter)?;
                stmt.execute_query()?
            }
        };

        let configuration = self.configuration.clone();
        let handler = result_set::ResultSetHandler::new(&configuration, statement, *bounds);
        handler.handle(&data, &mut |nested_id, nested_param| {
            let nested = configuration.mapped_statement(nested_id)?;
            self.query(&nested, nested_param, RowBounds::default())
        })
    }

    fn do_update(
        &mut self,
        statement: &Arc<MappedStatement>,
        parameter: &mut Value,
        bound: &BoundSql,
    ) -> Result<u64> {
        let spec = self.statement_spec(statement, &bound.sql);
        match &mut self.kind {
            ExecKind::Simple => {
                let mut stmt = self.transaction.connection()?.prepare(&spec)?;
                bind_parameters(&self.configuration, stmt.as_mut(), statement, bound, parameter)?;
                let count = stmt.execute_update()?;
                if statement.key_generator == KeyGeneratorKind::Driver {
                    apply_generated_keys(statement, parameter, stmt.as_mut())?;
                }
                Ok(count)
            }
            ExecKind::Reuse { statements } => {
                if !statements.contains_key(&bound.sql) {
                    let stmt = self.transaction.connection()?.prepare(&spec)?;
                    statements.insert(bound.sql.clone(), stmt);
                }
                let stmt = statements
                    .get_mut(&bound.sql)
                    .expect("statement inserted above");
                bind_parameters(&self.configuration, stmt.as_mut(), statement, bound, parameter)?;
                let count = stmt.execute_update()?;
                if statement.key_generator == KeyGeneratorKind::Driver {
                    apply_generated_keys(statement, parameter, stmt.as_mut())?;
                }
                Ok(count)
            }
            ExecKind::Batch { queue } => {
                let reuse_last = queue
                    .last()
                    .is_some_and(|item| {
                        item.sql == bound.sql && item.statement_id == statement.id
                    });
                if reuse_last {
                    let item = queue.last_mut().expect("checked above");
                    bind_parameters(
                        &self.configuration,
                        item.stmt.as_mut(),
                        statement,
                        bound,
                        parameter,
                    )?;
                    item.stmt.add_batch()?;
                    item.parameters.push(parameter.clone());
                } else {
                    let mut stmt = self.transaction.connection()?.prepare(&spec)?;
                    bind_parameters(&self.configuration, stmt.as_mut(), statement, bound, parameter)?;
                    stmt.add_batch()?;
                    queue.push(BatchItem {
                        statement_id: statement.id.clone(),
                        sql: bound.sql.clone(),
                        stmt,
                        parameters: vec![parameter.clone()],
                    });
                }
                // real counts surface from flush_statements
                Ok(0)
            }
        }
    }

    fn run_select_key(
        &mut self,
        key_statement_id: &str,
        statement: &MappedStatement,
        parameter: &mut Value,
    ) -> Result<()> {
        let key_statement = self.configuration.mapped_statement(key_statement_id)?;
        let rows = self.query(&key_statement, parameter.clone(), RowBounds::default())?;
        let Some(row) = rows.first() else {
            return Ok(());
        };
        write_key_values(statement, parameter, row)
    }

    fn flush(&mut self, rollback: bool) -> Result<Vec<BatchResult>> {
        match &mut self.kind {
            ExecKind::Simple => Ok(Vec::new()),
            ExecKind::Reuse { statements } => {
                statements.clear();
                Ok(Vec::new())
            }
            ExecKind::Batch { queue } => {
                let mut results = Vec::new();
                let items = std::mem::take(queue);
                if rollback {
                    return Ok(results);
                }
                for mut item in items {
                    let update_counts = item.stmt.execute_batch()?;
                    results.push(BatchResult {
                        statement_id: item.statement_id,
                        sql: item.sql,
                        parameters: item.parameters,
                        update_counts,
                    });
                }
                Ok(results)
            }
        }
    }
}

impl Executor for DefaultExecutor {
    fn query(
        &mut self,
        statement: &Arc<MappedStatement>,
        parameter: Value,
        bounds: RowBounds,
    ) -> Result<Vec<Value>> {
        self.ensure_open()?;
        let bound = statement
            .sql_source
            .bound_sql(&parameter, self.configuration.database_id.as_deref())?;
        let key = self.cache_key_for(statement, &parameter, &bounds, &bound)?;

        if statement.flush_cache {
            self.local_cache.clear().map_err(squill_core::Error::from)?;
        }
        if let Some(Value::List(rows)) =
            self.local_cache.get(&key).map_err(squill_core::Error::from)?
        {
            tracing::debug!(statement = %statement.id, "session cache hit");
            return Ok(rows);
        }

        let rows = self.do_query(statement, &parameter, &bounds, &bound)?;
        self.local_cache
            .put(key, Value::List(rows.clone()))
            .map_err(squill_core::Error::from)?;
        if self.configuration.settings.local_cache_scope == LocalCacheScope::Statement {
            self.clear_local_cache();
        }
        Ok(rows)
    }

    fn update(&mut self, statement: &Arc<MappedStatement>, parameter: &mut Value) -> Result<u64> {
        self.ensure_open()?;
        self.clear_local_cache();

        if let KeyGeneratorKind::SelectKey {
            statement_id,
            before: true,
        } = &statement.key_generator
        {
            let statement_id = statement_id.clone();
            self.run_select_key(&statement_id, statement, parameter)?;
        }

        let bound = statement
            .sql_source
            .bound_sql(parameter, self.configuration.database_id.as_deref())?;
        let count = self.do_update(statement, parameter, &bound)?;

        if let KeyGeneratorKind::SelectKey {
            statement_id,
            before: false,
        } = &statement.key_generator
        {
            let statement_id = statement_id.clone();
            self.run_select_key(&statement_id, statement, parameter)?;
        }
        Ok(count)
    }

    fn flush_statements(&mut self) -> Result<Vec<BatchResult>> {
        self.ensure_open()?;
        self.flush(false)
    }

    fn commit(&mut self, required: bool) -> Result<()> {
        self.ensure_open()?;
        self.clear_local_cache();
        self.flush(false)?;
        if required {
            self.transaction.commit()?;
        }
        Ok(())
    }

    fn rollback(&mut self, required: bool) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.clear_local_cache();
        self.flush(true)?;
        if required {
            self.transaction.rollback()?;
        }
        Ok(())
    }

    fn create_cache_key(
        &self,
        statement: &Arc<MappedStatement>,
        parameter: &Value,
        bounds: &RowBounds,
    ) -> Result<CacheKey> {
        self.ensure_open()?;
        let bound = statement
            .sql_source
            .bound_sql(parameter, self.configuration.database_id.as_deref())?;
        self.cache_key_for(statement, parameter, bounds, &bound)
    }

    fn is_cached(&self, _statement: &Arc<MappedStatement>, key: &CacheKey) -> bool {
        matches!(self.local_cache.get(key), Ok(Some(_)))
    }

    fn clear_local_cache(&mut self) {
        if !self.closed {
            let _ = self.local_cache.clear();
        }
    }

    fn close(&mut self, force_rollback: bool) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let rollback_result = self.rollback(force_rollback);
        let close_result = self.transaction.close();
        self.closed = true;
        self.kind = ExecKind::Simple;
        let _ = self.local_cache.clear();
        rollback_result.and(close_result)
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Binds the ordered parameter values onto the prepared statement,
/// resolving one type handler per mapping.
fn bind_parameters(
    configuration: &Configuration,
    stmt: &mut dyn Statement,
    statement: &MappedStatement,
    bound: &BoundSql,
    parameter: &Value,
) -> Result<()> {
    let explicit;
    let mappings: &[ParameterMapping] = if bound.parameter_mappings.is_empty() {
        match &statement.parameter_map {
            Some(map) => {
                explicit = map.mappings.clone();
                &explicit
            }
            None => &bound.parameter_mappings,
        }
    } else {
        &bound.parameter_mappings
    };

    for (index, mapping) in mappings.iter().enumerate() {
        if mapping.mode == ParameterMode::Out {
            // OUT slots hold a position but carry no input value
            stmt.bind(index, Value::Null, mapping.sql_type)?;
            continue;
        }
        let value = bound.parameter_value(&mapping.property, parameter)?;
        let handler = resolve_handler(configuration, mapping, &value)?;
        let sql_type = mapping.sql_type.or_else(|| {
            value
                .is_null()
                .then_some(configuration.settings.sql_type_for_null)
        });
        handler.set_parameter(stmt, index, &value, sql_type)?;
    }
    Ok(())
}

fn resolve_handler(
    configuration: &Configuration,
    mapping: &ParameterMapping,
    value: &Value,
) -> Result<Arc<dyn TypeHandler>> {
    if let Some(name) = &mapping.type_handler
        && let Some(named) = configuration.type_handlers.get_named(name)
    {
        return Ok(named);
    }
    let lang = mapping
        .lang_type
        .clone()
        .or_else(|| lang_of_value(value));
    Ok(configuration
        .type_handlers
        .require(lang.as_ref(), mapping.sql_type)?)
}

pub(crate) fn lang_of_value(value: &Value) -> Option<LangType> {
    use squill_core::value::ValueKind;
    match value.kind() {
        ValueKind::Null => None,
        ValueKind::Bool => Some(LangType::Bool),
        ValueKind::Int => Some(LangType::Long),
        ValueKind::Double => Some(LangType::Double),
        ValueKind::Str => Some(LangType::Str),
        ValueKind::Bytes => Some(LangType::Bytes),
        ValueKind::List => Some(LangType::List),
        ValueKind::Map => Some(LangType::Map),
    }
}

/// Reads driver-generated keys into the declared key properties of the
/// parameter object.
fn apply_generated_keys(
    statement: &MappedStatement,
    parameter: &mut Value,
    stmt: &mut dyn Statement,
) -> Result<()> {
    let Some(keys) = stmt.generated_keys()? else {
        return Ok(());
    };
    let Some(row) = keys.row(0) else {
        return Ok(());
    };
    write_key_row(statement, parameter, row.columns(), |column, index| {
        row.get_by_name(column)
            .or_else(|| row.get_by_index(index))
            .cloned()
    })
}

/// Writes a select-key result row into the key properties.
fn write_key_values(
    statement: &MappedStatement,
    parameter: &mut Value,
    row: &Value,
) -> Result<()> {
    match row {
        Value::Map(map) => {
            let columns: Vec<String> = map.keys().cloned().collect();
            write_key_row(statement, parameter, &columns, |column, index| {
                map.get(column)
                    .or_else(|| map.values().nth(index))
                    .cloned()
            })
        }
        scalar => {
            if let Some(property) = statement.key_properties.first() {
                reflect::set_path(parameter, property, scalar.clone())?;
            }
            Ok(())
        }
    }
}

fn write_key_row(
    statement: &MappedStatement,
    parameter: &mut Value,
    columns: &[String],
    mut value_at: impl FnMut(&str, usize) -> Option<Value>,
) -> Result<()> {
    for (index, property) in statement.key_properties.iter().enumerate() {
        let column = statement
            .key_columns
            .get(index)
            .cloned()
            .or_else(|| columns.get(index).cloned())
            .unwrap_or_else(|| property.clone());
        if let Some(value) = value_at(&column, index) {
            reflect::set_path(parameter, property, value)?;
        }
    }
    Ok(())
}

/// Routes executor operations through the registered interceptors; the
/// first registered interceptor runs outermost.
pub struct InterceptingExecutor {
    inner: Box<dyn Executor>,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

fn outcome_mismatch() -> squill_core::Error {
    ConfigError::InvalidValue {
        what: "interceptor outcome".to_string(),
        value: "does not match the intercepted operation".to_string(),
    }
    .into()
}

impl Executor for InterceptingExecutor {
    fn query(
        &mut self,
        statement: &Arc<MappedStatement>,
        parameter: Value,
        bounds: RowBounds,
    ) -> Result<Vec<Value>> {
        let interceptors = self.interceptors.clone();
        let mut parameter = parameter;
        let mut bounds = bounds;
        let inner = &mut self.inner;
        let outcome = run_chain(
            &interceptors,
            Invocation::Query {
                statement,
                parameter: &mut parameter,
                bounds: &mut bounds,
            },
            &mut |invocation| match invocation {
                Invocation::Query {
                    statement,
                    parameter,
                    bounds,
                } => inner
                    .query(statement, parameter.clone(), *bounds)
                    .map(Outcome::Rows),
                _ => Err(outcome_mismatch()),
            },
        )?;
        match outcome {
            Outcome::Rows(rows) => Ok(rows),
            _ => Err(outcome_mismatch()),
        }
    }

    fn update(&mut self, statement: &Arc<MappedStatement>, parameter: &mut Value) -> Result<u64> {
        let interceptors = self.interceptors.clone();
        let inner = &mut self.inner;
        let outcome = run_chain(
            &interceptors,
            Invocation::Update {
                statement,
                parameter,
            },
            &mut |invocation| match invocation {
                Invocation::Update {
                    statement,
                    parameter,
                } => inner.update(statement, parameter).map(Outcome::Affected),
                _ => Err(outcome_mismatch()),
            },
        )?;
        match outcome {
            Outcome::Affected(count) => Ok(count),
            _ => Err(outcome_mismatch()),
        }
    }

    fn flush_statements(&mut self) -> Result<Vec<BatchResult>> {
        let interceptors = self.interceptors.clone();
        let inner = &mut self.inner;
        let outcome = run_chain(&interceptors, Invocation::Flush, &mut |invocation| {
            match invocation {
                Invocation::Flush => inner.flush_statements().map(Outcome::Batches),
                _ => Err(outcome_mismatch()),
            }
        })?;
        match outcome {
            Outcome::Batches(batches) => Ok(batches),
            _ => Err(outcome_mismatch()),
        }
    }

    fn commit(&mut self, required: bool) -> Result<()> {
        let interceptors = self.interceptors.clone();
        let inner = &mut self.inner;
        run_chain(
            &interceptors,
            Invocation::Commit { required },
            &mut |invocation| match invocation {
                Invocation::Commit { required } => {
                    inner.commit(required).map(|()| Outcome::Unit)
                }
                _ => Err(outcome_mismatch()),
            },
        )?;
        Ok(())
    }

    fn rollback(&mut self, required: bool) -> Result<()> {
        let interceptors = self.interceptors.clone();
        let inner = &mut self.inner;
        run_chain(
            &interceptors,
            Invocation::Rollback { required },
            &mut |invocation| match invocation {
                Invocation::Rollback { required } => {
                    inner.rollback(required).map(|()| Outcome::Unit)
                }
                _ => Err(outcome_mismatch()),
            },
        )?;
        Ok(())
    }

    fn create_cache_key(
        &self,
        statement: &Arc<MappedStatement>,
        parameter: &Value,
        bounds: &RowBounds,
    ) -> Result<CacheKey> {
        self.inner.create_cache_key(statement, parameter, bounds)
    }

    fn is_cached(&self, statement: &Arc<MappedStatement>, key: &CacheKey) -> bool {
        self.inner.is_cached(statement, key)
    }

    fn clear_local_cache(&mut self) {
        self.inner.clear_local_cache();
    }

    fn close(&mut self, force_rollback: bool) -> Result<()> {
        self.inner.close(force_rollback)
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}
