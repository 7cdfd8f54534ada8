//! Mapper binding: a proxy value that turns method-style calls into
//! `namespace.method` statement executions with the right kind checks and
//! return shaping.

use indexmap::IndexMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use squill_core::Value;
use squill_core::errors::{BindingError, Result};

use crate::mapping::StatementKind;
use crate::session::{RowBounds, SqlSession};

/// Wraps a sole positional parameter the way the binding layer expects:
/// a bare collection answers to the names `list`, `collection` and
/// `array` (and `param1`, as the first and only declared argument);
/// everything else passes through.
pub fn wrap_parameter(value: Value) -> Value {
    match value {
        Value::List(items) => {
            let list = Value::List(items);
            Value::from_iter([
                ("list".to_string(), list.clone()),
                ("collection".to_string(), list.clone()),
                ("array".to_string(), list.clone()),
                ("param1".to_string(), list),
            ])
        }
        other => other,
    }
}

/// The proxy bound to one namespace and one session. Each call resolves
/// `namespace.method`, verifies the statement kind and shapes the result.
pub struct Mapper<'s> {
    session: &'s mut SqlSession,
    namespace: String,
}

impl<'s> Mapper<'s> {
    pub(crate) fn new(session: &'s mut SqlSession, namespace: &str) -> Self {
        Self {
            session,
            namespace: namespace.to_string(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn statement_id(&self, method: &str) -> String {
        format!("{}.{}", self.namespace, method)
    }

    fn check_kind(&self, method: &str, expected: StatementKind) -> Result<String> {
        let id = self.statement_id(method);
        let statement = self.session.configuration().mapped_statement(&id)?;
        if statement.kind != expected {
            return Err(BindingError::KindMismatch {
                id,
                kind: statement.kind.to_string(),
                called: match expected {
                    StatementKind::Select => "a select",
                    StatementKind::Insert => "an insert",
                    StatementKind::Update => "an update",
                    StatementKind::Delete => "a delete",
                    _ => "a statement",
                },
            }
            .into());
        }
        Ok(id)
    }

    pub fn select_one<T: DeserializeOwned>(
        &mut self,
        method: &str,
        args: impl Serialize,
    ) -> Result<Option<T>> {
        let id = self.check_kind(method, StatementKind::Select)?;
        self.session.select_one(&id, args)
    }

    pub fn select_list<T: DeserializeOwned>(
        &mut self,
        method: &str,
        args: impl Serialize,
    ) -> Result<Vec<T>> {
        let id = self.check_kind(method, StatementKind::Select)?;
        self.session.select_list(&id, args)
    }

    pub fn select_list_bounds<T: DeserializeOwned>(
        &mut self,
        method: &str,
        args: impl Serialize,
        bounds: RowBounds,
    ) -> Result<Vec<T>> {
        let id = self.check_kind(method, StatementKind::Select)?;
        self.session.select_list_bounds(&id, args, bounds)
    }

    pub fn select_map<T: DeserializeOwned>(
        &mut self,
        method: &str,
        args: impl Serialize,
        key_property: &str,
    ) -> Result<IndexMap<String, T>> {
        let id = self.check_kind(method, StatementKind::Select)?;
        self.session.select_map(&id, args, key_property)
    }

    /// Whether any row matches; sugar over a single-row count select.
    pub fn exists(&mut self, method: &str, args: impl Serialize) -> Result<bool> {
        let id = self.check_kind(method, StatementKind::Select)?;
        let rows = self.session.select_rows(&id, args, RowBounds::default())?;
        Ok(match rows.first() {
            None => false,
            Some(Value::Int(count)) => *count > 0,
            Some(_) => true,
        })
    }

    pub fn insert(&mut self, method: &str, args: impl Serialize) -> Result<u64> {
        let id = self.check_kind(method, StatementKind::Insert)?;
        self.session.insert(&id, args)
    }

    pub fn insert_with_keys(
        &mut self,
        method: &str,
        args: impl Serialize,
    ) -> Result<(u64, Value)> {
        let id = self.check_kind(method, StatementKind::Insert)?;
        self.session.insert_with_keys(&id, args)
    }

    pub fn update(&mut self, method: &str, args: impl Serialize) -> Result<u64> {
        let id = self.check_kind(method, StatementKind::Update)?;
        self.session.update(&id, args)
    }

    pub fn delete(&mut self, method: &str, args: impl Serialize) -> Result<u64> {
        let id = self.check_kind(method, StatementKind::Delete)?;
        self.session.delete(&id, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collections_answer_to_the_usual_names() {
        let wrapped = wrap_parameter(Value::List(vec![Value::Int(1), Value::Int(2)]));
        for name in ["list", "collection", "array"] {
            let entry = wrapped.get(name).unwrap();
            assert_eq!(entry.len(), Some(2));
        }
    }

    #[test]
    fn scalars_and_maps_pass_through() {
        assert_eq!(wrap_parameter(Value::Int(5)), Value::Int(5));
        let map = Value::from_iter([("a".to_string(), Value::Int(1))]);
        assert_eq!(wrap_parameter(map.clone()), map);
    }
}
