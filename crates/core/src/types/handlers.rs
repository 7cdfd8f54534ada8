use std::fmt;
use std::sync::{Arc, Mutex};

use ahash::AHashMap;

use crate::driver::{RowView, Statement};
use crate::errors::{DataStoreError, Error, Result, TypeError};
use crate::types::{LangType, SqlType};
use crate::value::Value;

/// How a result column is addressed.
#[derive(Debug, Clone, Copy)]
pub enum ColumnRef<'a> {
    Name(&'a str),
    Index(usize),
}

/// A bidirectional converter between a language-side type and a
/// database-side SQL type: one set-on-statement function and three
/// get-from-result variants.
pub trait TypeHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Language-side types this handler serves, used for declarative
    /// registration.
    fn applies_lang(&self) -> Vec<LangType> {
        Vec::new()
    }

    /// SQL-side types this handler serves; `None` is the wildcard slot.
    fn applies_sql(&self) -> Vec<Option<SqlType>> {
        vec![None]
    }

    /// Coerces the value to this handler's canonical shape. Everything
    /// else is shared plumbing.
    fn coerce(&self, value: &Value) -> Result<Value>;

    fn set_parameter(
        &self,
        stmt: &mut dyn Statement,
        index: usize,
        value: &Value,
        sql_type: Option<SqlType>,
    ) -> Result<()> {
        let coerced = if value.is_null() {
            Value::Null
        } else {
            self.coerce(value)?
        };
        stmt.bind(index, coerced, sql_type)?;
        Ok(())
    }

    fn get_result(&self, row: RowView<'_>, column: ColumnRef<'_>) -> Result<Value> {
        let raw = match column {
            ColumnRef::Name(name) => row.get_by_name(name).ok_or_else(|| {
                DataStoreError::Driver(format!("no column named '{name}' in result set"))
            })?,
            ColumnRef::Index(index) => row.get_by_index(index).ok_or_else(|| {
                DataStoreError::Driver(format!("no column at index {index} in result set"))
            })?,
        };
        if raw.is_null() {
            Ok(Value::Null)
        } else {
            self.coerce(raw)
        }
    }

    fn get_callable_result(&self, stmt: &mut dyn Statement, index: usize) -> Result<Value> {
        let out = stmt
            .out_results()?
            .ok_or(DataStoreError::Unsupported("callable OUT parameters"))?;
        let row = out
            .row(0)
            .ok_or_else(|| DataStoreError::Driver("empty OUT parameter row".to_string()))?;
        self.get_result(row, ColumnRef::Index(index))
    }
}

fn mismatch(expected: &'static str, actual: &Value) -> Error {
    TypeError::ValueMismatch {
        expected,
        actual: actual.kind_name(),
    }
    .into()
}

macro_rules! scalar_handler {
    ($ty:ident, $name:literal, $lang:expr, $sqls:expr, |$v:ident| $coerce:expr) => {
        pub struct $ty;

        impl TypeHandler for $ty {
            fn name(&self) -> &'static str {
                $name
            }

            fn applies_lang(&self) -> Vec<LangType> {
                $lang
            }

            fn applies_sql(&self) -> Vec<Option<SqlType>> {
                $sqls
            }

            fn coerce(&self, $v: &Value) -> Result<Value> {
                $coerce
            }
        }
    };
}

scalar_handler!(
    BoolHandler,
    "bool",
    vec![LangType::Bool],
    vec![Some(SqlType::Boolean), Some(SqlType::Bit), None],
    |v| match v {
        Value::Bool(_) => Ok(v.clone()),
        Value::Int(0) => Ok(Value::Bool(false)),
        Value::Int(1) => Ok(Value::Bool(true)),
        Value::Str(s) if s.eq_ignore_ascii_case("true") => Ok(Value::Bool(true)),
        Value::Str(s) if s.eq_ignore_ascii_case("false") => Ok(Value::Bool(false)),
        other => Err(mismatch("bool", other)),
    }
);

fn coerce_integer(v: &Value) -> Result<Value> {
    match v {
        Value::Int(_) => Ok(v.clone()),
        Value::Bool(b) => Ok(Value::Int(*b as i64)),
        Value::Double(d) if d.fract() == 0.0 => Ok(Value::Int(*d as i64)),
        Value::Str(s) => s
            .trim()
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| mismatch("int", v)),
        other => Err(mismatch("int", other)),
    }
}

scalar_handler!(
    IntHandler,
    "int",
    vec![LangType::Int],
    vec![
        Some(SqlType::Integer),
        Some(SqlType::Smallint),
        Some(SqlType::Tinyint),
        None
    ],
    |v| coerce_integer(v)
);

scalar_handler!(
    LongHandler,
    "long",
    vec![LangType::Long],
    vec![Some(SqlType::Bigint), None],
    |v| coerce_integer(v)
);

fn coerce_floating(v: &Value) -> Result<Value> {
    match v {
        Value::Double(_) => Ok(v.clone()),
        Value::Int(i) => Ok(Value::Double(*i as f64)),
        Value::Str(s) => s
            .trim()
            .parse::<f64>()
            .map(Value::Double)
            .map_err(|_| mismatch("double", v)),
        other => Err(mismatch("double", other)),
    }
}

scalar_handler!(
    FloatHandler,
    "float",
    vec![LangType::Float],
    vec![Some(SqlType::Float), Some(SqlType::Real), None],
    |v| coerce_floating(v)
);

scalar_handler!(
    DoubleHandler,
    "double",
    vec![LangType::Double],
    vec![
        Some(SqlType::Double),
        Some(SqlType::Decimal),
        Some(SqlType::Numeric),
        None
    ],
    |v| coerce_floating(v)
);

scalar_handler!(
    StringHandler,
    "string",
    vec![LangType::Str],
    vec![
        Some(SqlType::Varchar),
        Some(SqlType::Char),
        Some(SqlType::Longvarchar),
        Some(SqlType::Clob),
        None
    ],
    |v| match v {
        Value::Str(_) => Ok(v.clone()),
        Value::Bool(_) | Value::Int(_) | Value::Double(_) => Ok(Value::Str(v.to_string())),
        other => Err(mismatch("string", other)),
    }
);

scalar_handler!(
    BytesHandler,
    "bytes",
    vec![LangType::Bytes],
    vec![
        Some(SqlType::Blob),
        Some(SqlType::Binary),
        Some(SqlType::Varbinary),
        Some(SqlType::Longvarbinary),
        None
    ],
    |v| match v {
        Value::Bytes(_) => Ok(v.clone()),
        Value::Str(s) => Ok(Value::Bytes(s.as_bytes().to_vec())),
        other => Err(mismatch("bytes", other)),
    }
);

scalar_handler!(
    DateHandler,
    "date",
    vec![LangType::Date, LangType::Time, LangType::Timestamp],
    vec![
        Some(SqlType::Date),
        Some(SqlType::Time),
        Some(SqlType::Timestamp),
        None
    ],
    // Dates travel as ISO strings or epoch milliseconds; the driver owns
    // the actual temporal representation.
    |v| match v {
        Value::Str(_) | Value::Int(_) => Ok(v.clone()),
        other => Err(mismatch("date", other)),
    }
);

scalar_handler!(
    ObjectHandler,
    "object",
    vec![
        LangType::Map,
        LangType::List,
        LangType::Object("object".to_string())
    ],
    vec![Some(SqlType::Other), None],
    |v| Ok(v.clone())
);

/// Stores enum values by variant name.
pub struct EnumStringHandler {
    type_name: String,
    variants: Vec<String>,
}

impl EnumStringHandler {
    pub fn new(type_name: impl Into<String>, variants: Vec<String>) -> Self {
        Self {
            type_name: type_name.into(),
            variants,
        }
    }

    fn check(&self, s: &str) -> Result<()> {
        if self.variants.is_empty() || self.variants.iter().any(|v| v == s) {
            Ok(())
        } else {
            Err(TypeError::EnumVariant {
                name: self.type_name.clone(),
                value: s.to_string(),
            }
            .into())
        }
    }
}

impl TypeHandler for EnumStringHandler {
    fn name(&self) -> &'static str {
        "enum"
    }

    fn coerce(&self, value: &Value) -> Result<Value> {
        match value {
            Value::Str(s) => {
                self.check(s)?;
                Ok(value.clone())
            }
            other => Err(mismatch("enum variant name", other)),
        }
    }
}

/// Stores enum values by zero-based variant position.
pub struct EnumOrdinalHandler {
    type_name: String,
    variants: Vec<String>,
}

impl EnumOrdinalHandler {
    pub fn new(type_name: impl Into<String>, variants: Vec<String>) -> Self {
        Self {
            type_name: type_name.into(),
            variants,
        }
    }
}

impl TypeHandler for EnumOrdinalHandler {
    fn name(&self) -> &'static str {
        "enum-ordinal"
    }

    fn coerce(&self, value: &Value) -> Result<Value> {
        match value {
            // parameter side: variant name -> ordinal
            Value::Str(s) => self
                .variants
                .iter()
                .position(|v| v == s)
                .map(|i| Value::Int(i as i64))
                .ok_or_else(|| {
                    TypeError::EnumVariant {
                        name: self.type_name.clone(),
                        value: s.clone(),
                    }
                    .into()
                }),
            // result side: ordinal -> variant name
            Value::Int(i) => self
                .variants
                .get(*i as usize)
                .map(|v| Value::Str(v.clone()))
                .ok_or_else(|| {
                    TypeError::EnumVariant {
                        name: self.type_name.clone(),
                        value: i.to_string(),
                    }
                    .into()
                }),
            other => Err(mismatch("enum ordinal", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnumStyle {
    #[default]
    Name,
    Ordinal,
}

enum MemoSlot {
    Hit(Arc<dyn TypeHandler>),
    /// Sentinel for a known miss so repeat misses short-circuit.
    Miss,
}

#[derive(Default)]
struct Inner {
    by_lang: AHashMap<LangType, AHashMap<Option<SqlType>, Arc<dyn TypeHandler>>>,
    by_sql: AHashMap<SqlType, Arc<dyn TypeHandler>>,
    named: AHashMap<String, Arc<dyn TypeHandler>>,
    memo: AHashMap<(Option<LangType>, Option<SqlType>), MemoSlot>,
    enums: AHashMap<String, Vec<String>>,
    default_enum_style: EnumStyle,
}

/// Resolves a handler for a `(LangType?, SqlType?)` pair. Registration
/// normally happens at configuration time but enum fallbacks register
/// lazily, so all state sits behind one lock.
pub struct TypeHandlerRegistry {
    inner: Mutex<Inner>,
}

impl fmt::Debug for TypeHandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TypeHandlerRegistry")
    }
}

impl Default for TypeHandlerRegistry {
    fn default() -> Self {
        let registry = Self {
            inner: Mutex::new(Inner::default()),
        };
        registry.register(Arc::new(BoolHandler));
        registry.register(Arc::new(IntHandler));
        registry.register(Arc::new(LongHandler));
        registry.register(Arc::new(FloatHandler));
        registry.register(Arc::new(DoubleHandler));
        registry.register(Arc::new(StringHandler));
        registry.register(Arc::new(BytesHandler));
        registry.register(Arc::new(DateHandler));
        registry.register(Arc::new(ObjectHandler));
        registry
    }
}

impl TypeHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler under the cross product of its declared
    /// language-side and SQL-side types.
    pub fn register(&self, handler: Arc<dyn TypeHandler>) {
        let langs = handler.applies_lang();
        let sqls = handler.applies_sql();
        let mut inner = self.inner.lock().expect("type handler registry lock");
        for lang in &langs {
            let slot = inner.by_lang.entry(lang.clone()).or_default();
            for sql in &sqls {
                slot.insert(*sql, handler.clone());
            }
        }
        for sql in sqls.iter().flatten() {
            inner.by_sql.entry(*sql).or_insert_with(|| handler.clone());
        }
        inner.named.insert(handler.name().to_string(), handler);
        inner.memo.clear();
    }

    /// Resolves a handler by its declared name, for `typeHandler=…`
    /// references in placeholders and result mappings.
    pub fn get_named(&self, name: &str) -> Option<Arc<dyn TypeHandler>> {
        self.inner
            .lock()
            .expect("type handler registry lock")
            .named
            .get(name)
            .cloned()
    }

    /// Registers a handler for one explicit pair, ignoring its metadata.
    pub fn register_for(
        &self,
        lang: LangType,
        sql: Option<SqlType>,
        handler: Arc<dyn TypeHandler>,
    ) {
        let mut inner = self.inner.lock().expect("type handler registry lock");
        inner.by_lang.entry(lang).or_default().insert(sql, handler);
        inner.memo.clear();
    }

    /// Declares a named enum type so `Object` lookups can fall back to the
    /// default enum handler.
    pub fn register_enum_type(&self, name: impl Into<String>, variants: Vec<String>) {
        let mut inner = self.inner.lock().expect("type handler registry lock");
        inner.enums.insert(name.into(), variants);
        inner.memo.clear();
    }

    pub fn set_default_enum_style(&self, style: EnumStyle) {
        let mut inner = self.inner.lock().expect("type handler registry lock");
        inner.default_enum_style = style;
        inner.memo.clear();
    }

    pub fn has(&self, lang: Option<&LangType>, sql: Option<SqlType>) -> bool {
        self.get(lang, sql).is_some()
    }

    /// Resolution: exact sql-type match inside the language slot, else the
    /// wildcard entry, else a sole registered handler; enum names without a
    /// slot get the default enum handler registered and retried. Outcomes
    /// are memoised either way.
    pub fn get(
        &self,
        lang: Option<&LangType>,
        sql: Option<SqlType>,
    ) -> Option<Arc<dyn TypeHandler>> {
        let mut inner = self.inner.lock().expect("type handler registry lock");
        let key = (lang.cloned(), sql);
        if let Some(slot) = inner.memo.get(&key) {
            return match slot {
                MemoSlot::Hit(handler) => Some(handler.clone()),
                MemoSlot::Miss => None,
            };
        }
        let resolved = Self::resolve(&mut inner, lang, sql);
        inner.memo.insert(
            key,
            match &resolved {
                Some(handler) => MemoSlot::Hit(handler.clone()),
                None => MemoSlot::Miss,
            },
        );
        resolved
    }

    /// `get` that raises `TypeError::NoHandler` on a miss.
    pub fn require(
        &self,
        lang: Option<&LangType>,
        sql: Option<SqlType>,
    ) -> Result<Arc<dyn TypeHandler>, TypeError> {
        self.get(lang, sql).ok_or_else(|| TypeError::NoHandler {
            lang: lang.map_or_else(|| "none".to_string(), |l| l.to_string()),
            sql: sql.map_or_else(|| "none".to_string(), |s| s.to_string()),
        })
    }

    fn resolve(
        inner: &mut Inner,
        lang: Option<&LangType>,
        sql: Option<SqlType>,
    ) -> Option<Arc<dyn TypeHandler>> {
        let Some(lang) = lang else {
            return sql.and_then(|sql| inner.by_sql.get(&sql).cloned());
        };

        // Named object types declared as enums resolve through the enum
        // slot instead.
        let lang = match lang {
            LangType::Object(name) if inner.enums.contains_key(name) => {
                LangType::Enum(name.clone())
            }
            other => other.clone(),
        };

        if !inner.by_lang.contains_key(&lang)
            && let LangType::Enum(name) = &lang
        {
            let variants = inner.enums.get(name).cloned().unwrap_or_default();
            let handler: Arc<dyn TypeHandler> = match inner.default_enum_style {
                EnumStyle::Name => Arc::new(EnumStringHandler::new(name.clone(), variants)),
                EnumStyle::Ordinal => Arc::new(EnumOrdinalHandler::new(name.clone(), variants)),
            };
            inner
                .by_lang
                .entry(lang.clone())
                .or_default()
                .insert(None, handler);
        }

        let slot = inner.by_lang.get(&lang)?;
        slot.get(&sql)
            .or_else(|| slot.get(&None))
            .or_else(|| {
                if slot.len() == 1 {
                    slot.values().next()
                } else {
                    None
                }
            })
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_sql_type_wins_over_wildcard() {
        let registry = TypeHandlerRegistry::new();
        let exact = registry
            .get(Some(&LangType::Str), Some(SqlType::Clob))
            .unwrap();
        assert_eq!(exact.name(), "string");
    }

    #[test]
    fn resolution_is_stable_across_calls() {
        let registry = TypeHandlerRegistry::new();
        let a = registry.get(Some(&LangType::Int), Some(SqlType::Integer)).unwrap();
        let b = registry.get(Some(&LangType::Int), Some(SqlType::Integer)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn misses_are_memoised() {
        let registry = TypeHandlerRegistry::new();
        let lang = LangType::Object("app.Unknown".to_string());
        assert!(registry.get(Some(&lang), None).is_none());
        assert!(registry.get(Some(&lang), None).is_none());
    }

    #[test]
    fn enum_types_fall_back_to_the_default_enum_handler() {
        let registry = TypeHandlerRegistry::new();
        registry.register_enum_type("Color", vec!["RED".into(), "GREEN".into()]);
        let lang = LangType::Object("Color".to_string());
        let handler = registry.get(Some(&lang), None).unwrap();
        assert_eq!(handler.name(), "enum");
        assert!(handler.coerce(&Value::Str("RED".into())).is_ok());
        assert!(handler.coerce(&Value::Str("BLUE".into())).is_err());
    }

    #[test]
    fn ordinal_enum_round_trip() {
        let handler = EnumOrdinalHandler::new("Color", vec!["RED".into(), "GREEN".into()]);
        assert_eq!(
            handler.coerce(&Value::Str("GREEN".into())).unwrap(),
            Value::Int(1)
        );
        assert_eq!(
            handler.coerce(&Value::Int(0)).unwrap(),
            Value::Str("RED".into())
        );
    }

    #[test]
    fn sql_only_lookup_uses_the_sql_axis() {
        let registry = TypeHandlerRegistry::new();
        let handler = registry.get(None, Some(SqlType::Bigint)).unwrap();
        assert_eq!(handler.name(), "long");
    }
}
