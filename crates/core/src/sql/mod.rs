//! Dynamic SQL: a node tree compiled from mapper XML, applied per
//! invocation against a binding context, then scanned into a
//! prepared-statement text plus an ordered parameter-binding plan.

pub mod nodes;
pub mod text;

use ahash::AHashMap;
use strum_macros::{Display, EnumString};

use crate::errors::{Error, Result};
use crate::reflect;
use crate::types::{LangType, SqlType};
use crate::value::Value;

pub use nodes::{DynamicContext, SqlNode};

/// One `#{…}` placeholder's metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterMapping {
    pub property: String,
    pub lang_type: Option<LangType>,
    pub sql_type: Option<SqlType>,
    pub mode: ParameterMode,
    pub type_handler: Option<String>,
    pub numeric_scale: Option<u32>,
}

impl ParameterMapping {
    pub fn of(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            lang_type: None,
            sql_type: None,
            mode: ParameterMode::In,
            type_handler: None,
            numeric_scale: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum ParameterMode {
    #[default]
    In,
    Out,
    Inout,
}

/// The executable plan for one invocation: rendered SQL with `?`
/// placeholders, the ordered bindings, and values synthesized during
/// rendering (`<bind>`, `<foreach>`).
#[derive(Debug, Clone)]
pub struct BoundSql {
    pub sql: String,
    pub parameter_mappings: Vec<ParameterMapping>,
    pub additional_parameters: AHashMap<String, Value>,
}

impl BoundSql {
    pub fn new(sql: String, parameter_mappings: Vec<ParameterMapping>) -> Self {
        Self {
            sql,
            parameter_mappings,
            additional_parameters: AHashMap::new(),
        }
    }

    /// Resolves one mapping's value: additional parameters first, then the
    /// root parameter object. A scalar root answers for any property, the
    /// way a sole unnamed parameter binds.
    pub fn parameter_value(&self, property: &str, root: &Value) -> Result<Value> {
        if let Some(direct) = self.additional_parameters.get(property) {
            return Ok(direct.clone());
        }
        let tokens = reflect::tokenize(property);
        if let Some(first) = tokens.first()
            && let Some(base) = self.additional_parameters.get(&first.name)
        {
            let rest = property
                .split_once('.')
                .map(|(_, rest)| rest.to_string())
                .unwrap_or_default();
            let mut current = base.clone();
            if let Some(index) = &first.index {
                let indexed = match index {
                    reflect::IndexKey::Position(p) => format!("[{p}]"),
                    reflect::IndexKey::Key(k) => format!("[{k}]"),
                };
                current = reflect::get_path(&current, &indexed)?;
            }
            if rest.is_empty() {
                return Ok(current);
            }
            return Ok(reflect::get_path(&current, &rest)?);
        }
        if property == "_parameter" {
            return Ok(root.clone());
        }
        match root {
            Value::Map(_) | Value::List(_) => Ok(reflect::get_path(root, property)?),
            scalar => Ok(scalar.clone()),
        }
    }

    /// The ordered values for the `?` slots, ready to bind.
    pub fn bound_values(&self, root: &Value) -> Result<Vec<Value>> {
        self.parameter_mappings
            .iter()
            .filter(|m| m.mode != ParameterMode::Out)
            .map(|m| self.parameter_value(&m.property, root))
            .collect()
    }
}

/// A compiled statement body, producing a `BoundSql` per invocation.
pub trait SqlSource: Send + Sync {
    fn bound_sql(&self, parameter: &Value, database_id: Option<&str>) -> Result<BoundSql>;
}

/// Fully static text: scanned once at build time.
#[derive(Debug, Clone)]
pub struct StaticSqlSource {
    sql: String,
    parameter_mappings: Vec<ParameterMapping>,
}

impl StaticSqlSource {
    pub fn new(sql_with_tokens: &str) -> Result<Self> {
        let (sql, parameter_mappings) = text::scan_placeholders(sql_with_tokens)?;
        Ok(Self {
            sql,
            parameter_mappings,
        })
    }
}

impl SqlSource for StaticSqlSource {
    fn bound_sql(&self, _parameter: &Value, _database_id: Option<&str>) -> Result<BoundSql> {
        Ok(BoundSql::new(
            self.sql.clone(),
            self.parameter_mappings.clone(),
        ))
    }
}

/// A node tree without conditional fragments or `${…}`: rendered once at
/// build time, then served statically.
#[derive(Debug, Clone)]
pub struct RawSqlSource {
    inner: StaticSqlSource,
}

impl RawSqlSource {
    pub fn new(root: &SqlNode) -> Result<Self> {
        let mut ctx = DynamicContext::new(&Value::Null, None);
        root.apply(&mut ctx)?;
        Ok(Self {
            inner: StaticSqlSource::new(&ctx.into_sql())?,
        })
    }
}

impl SqlSource for RawSqlSource {
    fn bound_sql(&self, parameter: &Value, database_id: Option<&str>) -> Result<BoundSql> {
        self.inner.bound_sql(parameter, database_id)
    }
}

/// A node tree with conditional fragments or inline `${…}`: re-applied to
/// a fresh context on every invocation.
#[derive(Debug, Clone)]
pub struct DynamicSqlSource {
    root: SqlNode,
}

impl DynamicSqlSource {
    pub fn new(root: SqlNode) -> Self {
        Self { root }
    }
}

impl SqlSource for DynamicSqlSource {
    fn bound_sql(&self, parameter: &Value, database_id: Option<&str>) -> Result<BoundSql> {
        let mut ctx = DynamicContext::new(parameter, database_id);
        self.root.apply(&mut ctx)?;
        let bindings = ctx.take_bindings();
        let (sql, parameter_mappings) = text::scan_placeholders(&ctx.into_sql())?;
        let mut bound = BoundSql::new(sql, parameter_mappings);
        bound.additional_parameters = bindings.into_iter().collect();
        Ok(bound)
    }
}

/// Picks the raw or dynamic variant for a compiled tree.
pub fn build_sql_source(root: SqlNode) -> Result<Box<dyn SqlSource>, Error> {
    if root.is_dynamic() {
        Ok(Box::new(DynamicSqlSource::new(root)))
    } else {
        Ok(Box::new(RawSqlSource::new(&root)?))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn static_source_scans_once() {
        let source = StaticSqlSource::new("select * from users where id = #{id}").unwrap();
        let bound = source.bound_sql(&Value::Int(3), None).unwrap();
        assert_eq!(bound.sql, "select * from users where id = ?");
        assert_eq!(bound.parameter_mappings.len(), 1);
        assert_eq!(bound.parameter_mappings[0].property, "id");
    }

    #[test]
    fn scalar_root_answers_any_property() {
        let bound = BoundSql::new("?".into(), vec![ParameterMapping::of("id")]);
        assert_eq!(bound.parameter_value("id", &Value::Int(42)).unwrap(), Value::Int(42));
    }

    #[test]
    fn additional_parameters_win_over_the_root() {
        let mut bound = BoundSql::new("?".into(), vec![]);
        bound
            .additional_parameters
            .insert("__frch_id_0".to_string(), Value::Int(10));
        let root = Value::from_iter([("id".to_string(), Value::Int(99))]);
        assert_eq!(
            bound.parameter_value("__frch_id_0", &root).unwrap(),
            Value::Int(10)
        );
        assert_eq!(bound.parameter_value("id", &root).unwrap(), Value::Int(99));
    }

    #[test]
    fn additional_parameter_paths_navigate_nested_values() {
        let mut bound = BoundSql::new("?".into(), vec![]);
        bound.additional_parameters.insert(
            "__frch_item_0".to_string(),
            Value::from_iter([("sku".to_string(), Value::Str("a-1".into()))]),
        );
        assert_eq!(
            bound
                .parameter_value("__frch_item_0.sku", &Value::Null)
                .unwrap(),
            Value::Str("a-1".into())
        );
    }
}
