//! The user-facing surface: a session factory built from XML or an
//! assembled configuration, and single-threaded sessions over a
//! transaction + executor pair.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use squill_core::driver::{Driver, IsolationLevel};
use squill_core::errors::{BindingError, ConfigError, Result};
use squill_core::{ErrorContext, Value, from_value, to_value};
use indexmap::IndexMap;

use crate::binding::{Mapper, wrap_parameter};
use crate::builder::XmlConfigBuilder;
use crate::config::{Configuration, DriverRegistry, ExecutorType};
use crate::executor::{BatchResult, Executor, new_executor};
use crate::io::ResourceResolver;
use crate::mapping::{MappedStatement, StatementKind};

/// Offset/limit applied while consuming a result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowBounds {
    pub offset: usize,
    pub limit: usize,
}

impl Default for RowBounds {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: usize::MAX,
        }
    }
}

impl RowBounds {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }
}

#[derive(Default)]
pub struct SqlSessionFactoryBuilder {
    drivers: DriverRegistry,
    resolver: ResourceResolver,
    interceptors: Vec<(String, Box<dyn crate::plugin::Interceptor>)>,
}

impl SqlSessionFactoryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Where mapper resources are looked up from.
    pub fn resolver(mut self, resolver: ResourceResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn register_driver(mut self, name: impl Into<String>, driver: Arc<dyn Driver>) -> Self {
        self.drivers.register(name, driver);
        self
    }

    /// Makes a named interceptor available to `<plugins>` declarations.
    pub fn register_interceptor(
        mut self,
        name: impl Into<String>,
        interceptor: Box<dyn crate::plugin::Interceptor>,
    ) -> Self {
        self.interceptors.push((name.into(), interceptor));
        self
    }

    pub fn build_from_xml(self, xml: &str) -> Result<SqlSessionFactory> {
        self.build_from_xml_with(xml, None, &[])
    }

    pub fn build_from_xml_with(
        self,
        xml: &str,
        environment: Option<&str>,
        properties: &[(&str, &str)],
    ) -> Result<SqlSessionFactory> {
        let mut builder = XmlConfigBuilder::new(self.resolver, self.drivers)
            .environment(environment)
            .properties(properties);
        for (name, interceptor) in self.interceptors {
            builder = builder.register_interceptor(name, interceptor);
        }
        let configuration = builder.parse(xml)?;
        Ok(SqlSessionFactory {
            configuration: Arc::new(configuration),
        })
    }

    pub fn build(self, configuration: Configuration) -> SqlSessionFactory {
        SqlSessionFactory {
            configuration: Arc::new(configuration),
        }
    }
}

#[derive(Debug)]
pub struct SqlSessionFactory {
    configuration: Arc<Configuration>,
}

impl SqlSessionFactory {
    pub fn configuration(&self) -> &Arc<Configuration> {
        &self.configuration
    }

    pub fn open_session(&self) -> Result<SqlSession> {
        self.open(
            self.configuration.settings.default_executor_type,
            false,
            None,
        )
    }

    pub fn open_session_with(
        &self,
        executor_type: ExecutorType,
        auto_commit: bool,
    ) -> Result<SqlSession> {
        self.open(executor_type, auto_commit, None)
    }

    pub fn open_session_isolated(&self, isolation: IsolationLevel) -> Result<SqlSession> {
        self.open(
            self.configuration.settings.default_executor_type,
            false,
            Some(isolation),
        )
    }

    fn open(
        &self,
        executor_type: ExecutorType,
        auto_commit: bool,
        isolation: Option<IsolationLevel>,
    ) -> Result<SqlSession> {
        let environment =
            self.configuration
                .environment
                .as_ref()
                .ok_or(ConfigError::Unresolved {
                    kind: "environment",
                    reference: "no environment configured".to_string(),
                })?;
        let transaction = environment.transaction_factory.new_transaction(
            &environment.data_source,
            isolation,
            auto_commit,
        );
        let executor = new_executor(self.configuration.clone(), transaction, executor_type);
        Ok(SqlSession {
            configuration: self.configuration.clone(),
            executor,
            auto_commit,
            dirty: false,
            context: ErrorContext::new(),
        })
    }
}

/// One unit of work. Sessions are single-threaded and must not be shared.
pub struct SqlSession {
    configuration: Arc<Configuration>,
    executor: Box<dyn Executor>,
    auto_commit: bool,
    dirty: bool,
    context: ErrorContext,
}

impl SqlSession {
    pub fn configuration(&self) -> &Arc<Configuration> {
        &self.configuration
    }

    fn statement_for(
        &self,
        id: &str,
        select: bool,
        called: &'static str,
    ) -> Result<Arc<MappedStatement>> {
        let statement = self.configuration.mapped_statement(id)?;
        let is_select = statement.kind == StatementKind::Select;
        if is_select != select {
            return Err(BindingError::KindMismatch {
                id: id.to_string(),
                kind: statement.kind.to_string(),
                called,
            }
            .into());
        }
        Ok(statement)
    }

    /// Value-level query, the substrate all typed selects go through.
    pub fn select_rows(
        &mut self,
        statement: &str,
        parameter: impl Serialize,
        bounds: RowBounds,
    ) -> Result<Vec<Value>> {
        let mapped = self.statement_for(statement, true, "a query")?;
        let parameter = wrap_parameter(to_value(&parameter)?);
        self.context
            .activity("executing a query")
            .object(&mapped.id)
            .resource(&mapped.resource);
        let result = self.executor.query(&mapped, parameter, bounds);
        self.finish(result)
    }

    pub fn select_list<T: DeserializeOwned>(
        &mut self,
        statement: &str,
        parameter: impl Serialize,
    ) -> Result<Vec<T>> {
        self.select_list_bounds(statement, parameter, RowBounds::default())
    }

    pub fn select_list_bounds<T: DeserializeOwned>(
        &mut self,
        statement: &str,
        parameter: impl Serialize,
        bounds: RowBounds,
    ) -> Result<Vec<T>> {
        self.select_rows(statement, parameter, bounds)?
            .into_iter()
            .map(|row| Ok(from_value(row)?))
            .collect()
    }

    pub fn select_one<T: DeserializeOwned>(
        &mut self,
        statement: &str,
        parameter: impl Serialize,
    ) -> Result<Option<T>> {
        let mut rows = self.select_rows(statement, parameter, RowBounds::default())?;
        match rows.len() {
            0 => Ok(None),
            1 => Ok(Some(from_value(rows.remove(0))?)),
            count => Err(BindingError::TooManyRows {
                id: statement.to_string(),
                count,
            }
            .into()),
        }
    }

    /// Rows keyed by one of their properties, in first-appearance order.
    pub fn select_map<T: DeserializeOwned>(
        &mut self,
        statement: &str,
        parameter: impl Serialize,
        key_property: &str,
    ) -> Result<IndexMap<String, T>> {
        let rows = self.select_rows(statement, parameter, RowBounds::default())?;
        let mut keyed = IndexMap::new();
        for row in rows {
            let key = match row.get(key_property) {
                Some(value) if !value.is_null() => value.to_string(),
                _ => {
                    return Err(BindingError::MissingMapKey {
                        id: statement.to_string(),
                        key: key_property.to_string(),
                    }
                    .into());
                }
            };
            keyed.insert(key, from_value(row)?);
        }
        Ok(keyed)
    }

    pub fn insert(&mut self, statement: &str, parameter: impl Serialize) -> Result<u64> {
        self.run_update(statement, parameter).map(|(count, _)| count)
    }

    /// Like `insert`, but hands back the parameter value after key
    /// generation wrote into it.
    pub fn insert_with_keys(
        &mut self,
        statement: &str,
        parameter: impl Serialize,
    ) -> Result<(u64, Value)> {
        self.run_update(statement, parameter)
    }

    pub fn update(&mut self, statement: &str, parameter: impl Serialize) -> Result<u64> {
        self.run_update(statement, parameter).map(|(count, _)| count)
    }

    pub fn delete(&mut self, statement: &str, parameter: impl Serialize) -> Result<u64> {
        self.run_update(statement, parameter).map(|(count, _)| count)
    }

    fn run_update(
        &mut self,
        statement: &str,
        parameter: impl Serialize,
    ) -> Result<(u64, Value)> {
        let mapped = self.statement_for(statement, false, "an update")?;
        let mut parameter = wrap_parameter(to_value(&parameter)?);
        self.context
            .activity("executing an update")
            .object(&mapped.id)
            .resource(&mapped.resource);
        self.dirty = true;
        let result = self.executor.update(&mapped, &mut parameter);
        let count = self.finish(result)?;
        Ok((count, parameter))
    }

    pub fn flush_statements(&mut self) -> Result<Vec<BatchResult>> {
        let result = self.executor.flush_statements();
        self.finish(result)
    }

    pub fn commit(&mut self) -> Result<()> {
        self.commit_force(false)
    }

    pub fn commit_force(&mut self, force: bool) -> Result<()> {
        let required = self.commit_or_rollback_required(force);
        let result = self.executor.commit(required);
        self.dirty = false;
        self.finish(result)
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.rollback_force(false)
    }

    pub fn rollback_force(&mut self, force: bool) -> Result<()> {
        let required = self.commit_or_rollback_required(force);
        let result = self.executor.rollback(required);
        self.dirty = false;
        self.finish(result)
    }

    pub fn clear_cache(&mut self) {
        self.executor.clear_local_cache();
    }

    pub fn mapper(&mut self, namespace: &str) -> Result<Mapper<'_>> {
        if !self.configuration.has_mapper(namespace) {
            return Err(BindingError::UnknownMapper(namespace.to_string()).into());
        }
        Ok(Mapper::new(self, namespace))
    }

    pub fn close(&mut self) -> Result<()> {
        let force_rollback = self.dirty && !self.auto_commit;
        self.dirty = false;
        self.executor.close(force_rollback)
    }

    fn commit_or_rollback_required(&self, force: bool) -> bool {
        (!self.auto_commit && self.dirty) || force
    }

    fn finish<T>(&mut self, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                self.context.reset();
                Ok(value)
            }
            Err(error) => {
                let wrapped = error.in_context(&self.context);
                self.context.reset();
                Err(wrapped)
            }
        }
    }
}

impl Drop for SqlSession {
    fn drop(&mut self) {
        if !self.executor.is_closed() {
            let _ = self.close();
        }
    }
}
