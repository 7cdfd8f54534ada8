use indexmap::IndexMap;

use crate::errors::{Error, ExprError, Result};
use crate::expr::{Expression, Scope};
use crate::sql::text;
use crate::value::Value;

/// Per-invocation state while rendering: the bindings map, the
/// space-joined SQL accumulator, and the counter naming synthetic
/// foreach parameters.
#[derive(Debug)]
pub struct DynamicContext {
    bindings: IndexMap<String, Value>,
    sql: String,
    unique: usize,
}

impl DynamicContext {
    pub const PARAMETER_KEY: &'static str = "_parameter";
    pub const DATABASE_ID_KEY: &'static str = "_databaseId";

    pub fn new(parameter: &Value, database_id: Option<&str>) -> Self {
        let mut bindings = IndexMap::new();
        bindings.insert(Self::PARAMETER_KEY.to_string(), parameter.clone());
        bindings.insert(
            Self::DATABASE_ID_KEY.to_string(),
            database_id.map_or(Value::Null, |id| Value::Str(id.to_string())),
        );
        Self {
            bindings,
            sql: String::new(),
            unique: 0,
        }
    }

    pub fn append(&mut self, fragment: &str) {
        let fragment = fragment.trim();
        if fragment.is_empty() {
            return;
        }
        if !self.sql.is_empty() {
            self.sql.push(' ');
        }
        self.sql.push_str(fragment);
    }

    pub fn bind(&mut self, name: impl Into<String>, value: Value) {
        self.bindings.insert(name.into(), value);
    }

    pub fn bindings(&self) -> &IndexMap<String, Value> {
        &self.bindings
    }

    pub fn take_bindings(&mut self) -> IndexMap<String, Value> {
        std::mem::take(&mut self.bindings)
    }

    pub fn next_unique(&mut self) -> usize {
        let current = self.unique;
        self.unique += 1;
        current
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn into_sql(self) -> String {
        self.sql
    }

    /// Runs `f` against an empty SQL accumulator and hands back what it
    /// produced, restoring the outer accumulator afterwards. Bindings are
    /// shared with the outer scope.
    pub fn capture(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<bool>,
    ) -> Result<(String, bool)> {
        let saved = std::mem::take(&mut self.sql);
        let applied = f(self)?;
        let fragment = std::mem::replace(&mut self.sql, saved);
        Ok((fragment, applied))
    }
}

impl Scope for DynamicContext {
    fn resolve(&self, name: &str) -> Option<Value> {
        if let Some(found) = self.bindings.get(name) {
            return Some(found.clone());
        }
        self.bindings
            .get(Self::PARAMETER_KEY)
            .and_then(|parameter| parameter.get(name))
            .cloned()
    }
}

/// Splits a pipe-separated overrides list into uppercase match tokens.
pub fn parse_overrides(overrides: &str) -> Vec<String> {
    overrides
        .split('|')
        .filter(|o| !o.is_empty())
        .map(|o| o.to_uppercase())
        .collect()
}

#[derive(Debug, Clone)]
pub enum SqlNode {
    /// Literal SQL.
    Static(String),
    /// Text with inline `${…}`, re-evaluated per call.
    Text(String),
    Mixed(Vec<SqlNode>),
    If {
        test: Expression,
        contents: Box<SqlNode>,
    },
    Choose {
        whens: Vec<(Expression, SqlNode)>,
        otherwise: Option<Box<SqlNode>>,
    },
    Trim {
        prefix: Option<String>,
        suffix: Option<String>,
        prefix_overrides: Vec<String>,
        suffix_overrides: Vec<String>,
        contents: Box<SqlNode>,
    },
    Foreach {
        collection: Expression,
        item: Option<String>,
        index: Option<String>,
        open: Option<String>,
        close: Option<String>,
        separator: Option<String>,
        contents: Box<SqlNode>,
    },
    Bind {
        name: String,
        value: Expression,
    },
}

impl SqlNode {
    /// `<where>` is trim sugar: prepend `WHERE`, strip one leading
    /// `AND`/`OR`.
    pub fn where_node(contents: SqlNode) -> SqlNode {
        SqlNode::Trim {
            prefix: Some("WHERE".to_string()),
            suffix: None,
            prefix_overrides: ["AND ", "OR ", "AND\n", "OR\n", "AND\t", "OR\t"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            suffix_overrides: Vec::new(),
            contents: Box::new(contents),
        }
    }

    /// `<set>` is trim sugar: prepend `SET`, strip a trailing comma.
    pub fn set_node(contents: SqlNode) -> SqlNode {
        SqlNode::Trim {
            prefix: Some("SET".to_string()),
            suffix: None,
            prefix_overrides: vec![",".to_string()],
            suffix_overrides: vec![",".to_string()],
            contents: Box::new(contents),
        }
    }

    /// Whether this tree must be re-rendered per invocation.
    pub fn is_dynamic(&self) -> bool {
        match self {
            SqlNode::Static(_) => false,
            SqlNode::Mixed(children) => children.iter().any(SqlNode::is_dynamic),
            _ => true,
        }
    }

    pub fn apply(&self, ctx: &mut DynamicContext) -> Result<bool> {
        match self {
            SqlNode::Static(sql) => {
                ctx.append(sql);
                Ok(true)
            }
            SqlNode::Text(template) => {
                let rendered = text::substitute_dollar(template, |token| {
                    resolve_dollar_token(token, ctx)
                })?;
                ctx.append(&rendered);
                Ok(true)
            }
            SqlNode::Mixed(children) => {
                for child in children {
                    child.apply(ctx)?;
                }
                Ok(true)
            }
            SqlNode::If { test, contents } => {
                let pass = test.eval_bool(ctx)?;
                if pass {
                    contents.apply(ctx)?;
                }
                Ok(pass)
            }
            SqlNode::Choose { whens, otherwise } => {
                for (test, contents) in whens {
                    let pass = test.eval_bool(ctx)?;
                    if pass {
                        contents.apply(ctx)?;
                        return Ok(true);
                    }
                }
                if let Some(otherwise) = otherwise {
                    otherwise.apply(ctx)?;
                    return Ok(true);
                }
                Ok(false)
            }
            SqlNode::Trim {
                prefix,
                suffix,
                prefix_overrides,
                suffix_overrides,
                contents,
            } => {
                let (fragment, _) = ctx.capture(|ctx| contents.apply(ctx))?;
                let trimmed = apply_trim(
                    &fragment,
                    prefix.as_deref(),
                    suffix.as_deref(),
                    prefix_overrides,
                    suffix_overrides,
                );
                ctx.append(&trimmed);
                Ok(true)
            }
            SqlNode::Foreach {
                collection,
                item,
                index,
                open,
                close,
                separator,
                contents,
            } => self.apply_foreach(
                ctx, collection, item, index, open, close, separator, contents,
            ),
            SqlNode::Bind { name, value } => {
                let bound = value.eval(ctx)?;
                ctx.bind(name.clone(), bound);
                Ok(true)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_foreach(
        &self,
        ctx: &mut DynamicContext,
        collection: &Expression,
        item: &Option<String>,
        index: &Option<String>,
        open: &Option<String>,
        close: &Option<String>,
        separator: &Option<String>,
        contents: &SqlNode,
    ) -> Result<bool> {
        let collection_value = collection.eval(ctx)?;
        let entries: Vec<(Value, Value)> = match &collection_value {
            Value::Null => Vec::new(),
            Value::List(items) => items
                .iter()
                .enumerate()
                .map(|(i, v)| (Value::Int(i as i64), v.clone()))
                .collect(),
            Value::Map(map) => map
                .iter()
                .map(|(k, v)| (Value::Str(k.clone()), v.clone()))
                .collect(),
            other => {
                return Err(Error::Expr(ExprError::BadOperand {
                    expression: collection.source().to_string(),
                    op: "foreach",
                    kind: other.kind_name(),
                }));
            }
        };
        if entries.is_empty() {
            return Ok(true);
        }

        if let Some(open) = open {
            ctx.append(open);
        }
        for (n, (index_value, item_value)) in entries.into_iter().enumerate() {
            if n > 0
                && let Some(separator) = separator
            {
                ctx.append(separator);
            }
            let iteration = ctx.next_unique();
            if let Some(item) = item {
                ctx.bind(item.clone(), item_value.clone());
                ctx.bind(format!("__frch_{item}_{iteration}"), item_value);
            }
            if let Some(index) = index {
                ctx.bind(index.clone(), index_value.clone());
                ctx.bind(format!("__frch_{index}_{iteration}"), index_value);
            }
            let (fragment, _) = ctx.capture(|ctx| contents.apply(ctx))?;
            let rewritten = text::rewrite_foreach_tokens(
                &fragment,
                item.as_deref(),
                index.as_deref(),
                iteration,
            );
            ctx.append(&rewritten);
        }
        if let Some(close) = close {
            ctx.append(close);
        }
        Ok(true)
    }
}

/// `${name}` evaluates against the bindings; `${name:default}` falls back
/// to the literal default when the name resolves to nothing.
fn resolve_dollar_token(token: &str, ctx: &DynamicContext) -> Result<String> {
    let (expression, default) = split_default(token);
    let value = Expression::parse(expression)?.eval(ctx)?;
    match (&value, default) {
        (Value::Null, Some(default)) => Ok(default.to_string()),
        _ => Ok(value.to_string()),
    }
}

fn split_default(token: &str) -> (&str, Option<&str>) {
    // A ':' inside quotes belongs to a string literal, not a default.
    let mut in_quote: Option<char> = None;
    for (offset, c) in token.char_indices() {
        match (c, in_quote) {
            ('\'' | '"', None) => in_quote = Some(c),
            (c, Some(q)) if c == q => in_quote = None,
            (':', None) => return (token[..offset].trim(), Some(token[offset + 1..].trim())),
            _ => {}
        }
    }
    (token.trim(), None)
}

fn apply_trim(
    fragment: &str,
    prefix: Option<&str>,
    suffix: Option<&str>,
    prefix_overrides: &[String],
    suffix_overrides: &[String],
) -> String {
    let mut body = fragment.trim();
    if body.is_empty() {
        return String::new();
    }
    let upper = body.to_uppercase();
    for over in prefix_overrides {
        if upper.starts_with(over.as_str()) {
            body = body[over.len()..].trim_start();
            break;
        }
    }
    let upper = body.to_uppercase();
    for over in suffix_overrides {
        if upper.ends_with(over.as_str()) {
            body = body[..body.len() - over.len()].trim_end();
            break;
        }
    }
    let mut out = String::new();
    if let Some(prefix) = prefix {
        out.push_str(prefix);
        if !body.is_empty() {
            out.push(' ');
        }
    }
    out.push_str(body);
    if let Some(suffix) = suffix {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(suffix);
    }
    out
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::sql::{DynamicSqlSource, SqlSource};

    fn expr(source: &str) -> Expression {
        Expression::parse(source).unwrap()
    }

    fn param(entries: Vec<(&str, Value)>) -> Value {
        Value::from_iter(entries.into_iter().map(|(k, v)| (k.to_string(), v)))
    }

    #[test]
    fn foreach_emits_synthetic_bindings_in_order() {
        // <foreach item="id" open="(" close=")" separator=","> #{id} </foreach>
        let tree = SqlNode::Foreach {
            collection: expr("ids"),
            item: Some("id".to_string()),
            index: None,
            open: Some("(".to_string()),
            close: Some(")".to_string()),
            separator: Some(",".to_string()),
            contents: Box::new(SqlNode::Static("#{id}".to_string())),
        };
        let source = DynamicSqlSource::new(tree);
        let parameter = param(vec![(
            "ids",
            Value::List(vec![Value::Int(10), Value::Int(20), Value::Int(30)]),
        )]);
        let bound = source.bound_sql(&parameter, None).unwrap();

        assert_eq!(bound.sql, "( ? , ? , ? )");
        let names: Vec<_> = bound
            .parameter_mappings
            .iter()
            .map(|m| m.property.as_str())
            .collect();
        assert_eq!(names, vec!["__frch_id_0", "__frch_id_1", "__frch_id_2"]);
        assert_eq!(
            bound.bound_values(&parameter).unwrap(),
            vec![Value::Int(10), Value::Int(20), Value::Int(30)]
        );
    }

    #[test]
    fn foreach_over_empty_collection_renders_nothing() {
        let tree = SqlNode::Foreach {
            collection: expr("ids"),
            item: Some("id".to_string()),
            index: None,
            open: Some("(".to_string()),
            close: Some(")".to_string()),
            separator: Some(",".to_string()),
            contents: Box::new(SqlNode::Static("#{id}".to_string())),
        };
        let source = DynamicSqlSource::new(tree);
        let bound = source
            .bound_sql(&param(vec![("ids", Value::List(Vec::new()))]), None)
            .unwrap();
        assert_eq!(bound.sql, "");
    }

    #[test]
    fn foreach_over_map_binds_keys_and_values() {
        let tree = SqlNode::Foreach {
            collection: expr("filters"),
            item: Some("v".to_string()),
            index: Some("k".to_string()),
            open: None,
            close: None,
            separator: Some("AND".to_string()),
            contents: Box::new(SqlNode::Text("${k} = #{v}".to_string())),
        };
        let source = DynamicSqlSource::new(tree);
        let parameter = param(vec![(
            "filters",
            param(vec![("a", Value::Int(1)), ("b", Value::Int(2))]),
        )]);
        let bound = source.bound_sql(&parameter, None).unwrap();
        assert_eq!(bound.sql, "a = ? AND b = ?");
        assert_eq!(
            bound.bound_values(&parameter).unwrap(),
            vec![Value::Int(1), Value::Int(2)]
        );
    }

    #[test]
    fn where_strips_a_leading_and() {
        // <where><if test="age != null"> AND age = #{age} </if></where>
        let tree = SqlNode::Mixed(vec![
            SqlNode::Static("select * from users".to_string()),
            SqlNode::where_node(SqlNode::If {
                test: expr("age != null"),
                contents: Box::new(SqlNode::Static("AND age = #{age}".to_string())),
            }),
        ]);
        let source = DynamicSqlSource::new(tree);

        let bound = source
            .bound_sql(&param(vec![("age", Value::Int(10))]), None)
            .unwrap();
        assert_eq!(bound.sql, "select * from users WHERE age = ?");
        assert_eq!(
            bound
                .bound_values(&param(vec![("age", Value::Int(10))]))
                .unwrap(),
            vec![Value::Int(10)]
        );

        let bound = source
            .bound_sql(&param(vec![("age", Value::Null)]), None)
            .unwrap();
        assert_eq!(bound.sql, "select * from users");
    }

    #[test]
    fn set_strips_a_trailing_comma() {
        let tree = SqlNode::set_node(SqlNode::Mixed(vec![
            SqlNode::If {
                test: expr("name != null"),
                contents: Box::new(SqlNode::Static("name = #{name},".to_string())),
            },
            SqlNode::If {
                test: expr("age != null"),
                contents: Box::new(SqlNode::Static("age = #{age},".to_string())),
            },
        ]));
        let source = DynamicSqlSource::new(tree);
        let bound = source
            .bound_sql(
                &param(vec![("name", Value::Str("ada".into())), ("age", Value::Null)]),
                None,
            )
            .unwrap();
        assert_eq!(bound.sql, "SET name = ?");
    }

    #[test]
    fn choose_picks_first_matching_when() {
        let tree = SqlNode::Choose {
            whens: vec![
                (expr("kind == 'a'"), SqlNode::Static("is_a = 1".to_string())),
                (expr("kind == 'b'"), SqlNode::Static("is_b = 1".to_string())),
            ],
            otherwise: Some(Box::new(SqlNode::Static("is_other = 1".to_string()))),
        };
        let source = DynamicSqlSource::new(tree);

        let bound = source
            .bound_sql(&param(vec![("kind", Value::Str("b".into()))]), None)
            .unwrap();
        assert_eq!(bound.sql, "is_b = 1");

        let bound = source
            .bound_sql(&param(vec![("kind", Value::Str("z".into()))]), None)
            .unwrap();
        assert_eq!(bound.sql, "is_other = 1");
    }

    #[test]
    fn bind_values_are_visible_downstream() {
        let tree = SqlNode::Mixed(vec![
            SqlNode::Bind {
                name: "pattern".to_string(),
                value: expr("'%ada%'"),
            },
            SqlNode::Static("select * from users where name like #{pattern}".to_string()),
        ]);
        let source = DynamicSqlSource::new(tree);
        let parameter = Value::Map(Default::default());
        let bound = source.bound_sql(&parameter, None).unwrap();
        assert_eq!(bound.sql, "select * from users where name like ?");
        assert_eq!(
            bound.bound_values(&parameter).unwrap(),
            vec![Value::Str("%ada%".into())]
        );
    }

    #[test]
    fn dollar_default_applies_when_binding_is_missing() {
        let tree = SqlNode::Text("select * from ${name:default}".to_string());
        let source = DynamicSqlSource::new(tree);

        let bound = source
            .bound_sql(&Value::Map(Default::default()), None)
            .unwrap();
        assert_eq!(bound.sql, "select * from default");

        let bound = source
            .bound_sql(&param(vec![("name", Value::Str("products".into()))]), None)
            .unwrap();
        assert_eq!(bound.sql, "select * from products");
    }

    #[test]
    fn database_id_binding_is_seeded() {
        let tree = SqlNode::If {
            test: expr("_databaseId == 'mem'"),
            contents: Box::new(SqlNode::Static("select 1".to_string())),
        };
        let source = DynamicSqlSource::new(tree);
        let bound = source.bound_sql(&Value::Null, Some("mem")).unwrap();
        assert_eq!(bound.sql, "select 1");
        let bound = source.bound_sql(&Value::Null, Some("other")).unwrap();
        assert_eq!(bound.sql, "");
    }

    #[test]
    fn render_is_deterministic() {
        let tree = SqlNode::Mixed(vec![
            SqlNode::where_node(SqlNode::Mixed(vec![
                SqlNode::If {
                    test: expr("a != null"),
                    contents: Box::new(SqlNode::Static("AND a = #{a}".to_string())),
                },
                SqlNode::If {
                    test: expr("b != null"),
                    contents: Box::new(SqlNode::Static("AND b = #{b}".to_string())),
                },
            ])),
        ]);
        let source = DynamicSqlSource::new(tree);
        let parameter = param(vec![("a", Value::Int(1)), ("b", Value::Int(2))]);
        let first = source.bound_sql(&parameter, None).unwrap();
        let second = source.bound_sql(&parameter, None).unwrap();
        assert_eq!(first.sql, second.sql);
        assert_eq!(first.parameter_mappings, second.parameter_mappings);
    }

    #[test]
    fn trim_handles_custom_overrides_case_insensitively() {
        let out = apply_trim(
            "and x = 1",
            Some("WHERE"),
            None,
            &parse_overrides("AND |OR "),
            &[],
        );
        assert_eq!(out, "WHERE x = 1");
    }
}
