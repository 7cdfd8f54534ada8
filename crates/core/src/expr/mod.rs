//! The embedded expression language behind `test="…"` conditions,
//! `<foreach collection="…">` and `<bind value="…">`. Deliberately small:
//! literals, property paths with indexing, equality and ordering,
//! `and`/`or`/`not`, and the truthiness rules `null`/`0`/`""` are false.

mod lexer;
mod parser;

use crate::errors::ExprError;
use crate::reflect;
use crate::value::Value;

/// Name resolution for expression evaluation. Lookup falls back to the
/// `_parameter` bindings when a name is not found directly.
pub trait Scope {
    fn resolve(&self, name: &str) -> Option<Value>;
}

impl Scope for indexmap::IndexMap<String, Value> {
    fn resolve(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

impl Scope for ahash::AHashMap<String, Value> {
    fn resolve(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Literal(Value),
    Path(Vec<PathSeg>),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PathSeg {
    Name(String),
    Index(Box<Expr>),
    Call { name: String, args: Vec<Expr> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

/// A parsed expression, reusable across invocations.
#[derive(Debug, Clone)]
pub struct Expression {
    source: String,
    root: Expr,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        let tokens = lexer::lex(source)?;
        let root = parser::parse(source, tokens)?;
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn eval(&self, scope: &dyn Scope) -> Result<Value, ExprError> {
        eval_expr(&self.root, scope, &self.source)
    }

    pub fn eval_bool(&self, scope: &dyn Scope) -> Result<bool, ExprError> {
        Ok(truthy(&self.eval(scope)?))
    }
}

/// `null`, numeric zero and the empty string are false; everything else,
/// including empty containers, is true.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Int(i) => *i != 0,
        Value::Double(d) => *d != 0.0,
        Value::Str(s) => !s.is_empty(),
        Value::Bytes(_) | Value::List(_) | Value::Map(_) => true,
    }
}

fn eval_expr(expr: &Expr, scope: &dyn Scope, source: &str) -> Result<Value, ExprError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Path(segments) => eval_path(segments, scope, source),
        Expr::Unary { op, operand } => {
            let value = eval_expr(operand, scope, source)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!truthy(&value))),
                UnaryOp::Neg => match value {
                    Value::Int(i) => Ok(Value::Int(-i)),
                    Value::Double(d) => Ok(Value::Double(-d)),
                    other => Err(ExprError::BadOperand {
                        expression: source.to_string(),
                        op: "-",
                        kind: other.kind_name(),
                    }),
                },
            }
        }
        Expr::Binary { op, left, right } => match op {
            BinaryOp::And => {
                let lhs = eval_expr(left, scope, source)?;
                if !truthy(&lhs) {
                    return Ok(Value::Bool(false));
                }
                let rhs = eval_expr(right, scope, source)?;
                Ok(Value::Bool(truthy(&rhs)))
            }
            BinaryOp::Or => {
                let lhs = eval_expr(left, scope, source)?;
                if truthy(&lhs) {
                    return Ok(Value::Bool(true));
                }
                let rhs = eval_expr(right, scope, source)?;
                Ok(Value::Bool(truthy(&rhs)))
            }
            _ => {
                let lhs = eval_expr(left, scope, source)?;
                let rhs = eval_expr(right, scope, source)?;
                compare(*op, &lhs, &rhs, source)
            }
        },
    }
}

fn eval_path(segments: &[PathSeg], scope: &dyn Scope, source: &str) -> Result<Value, ExprError> {
    let mut current: Option<Value> = None;
    for segment in segments {
        current = Some(match (current, segment) {
            (None, PathSeg::Name(name)) => scope.resolve(name).unwrap_or(Value::Null),
            (Some(value), PathSeg::Name(name)) => {
                reflect::get_path(&value, name).map_err(|e| ExprError::Eval {
                    expression: source.to_string(),
                    message: e.to_string(),
                })?
            }
            (Some(value), PathSeg::Index(index)) => {
                let key = eval_expr(index, scope, source)?;
                index_value(&value, &key, source)?
            }
            (Some(value), PathSeg::Call { name, args }) => {
                let args = args
                    .iter()
                    .map(|a| eval_expr(a, scope, source))
                    .collect::<Result<Vec<_>, _>>()?;
                call_method(&value, name, &args, source)?
            }
            (None, _) => {
                return Err(ExprError::Eval {
                    expression: source.to_string(),
                    message: "expression cannot start with an index or call".to_string(),
                });
            }
        });
    }
    Ok(current.unwrap_or(Value::Null))
}

fn index_value(value: &Value, key: &Value, source: &str) -> Result<Value, ExprError> {
    match (value, key) {
        (Value::Null, _) => Ok(Value::Null),
        (Value::List(items), Value::Int(i)) => {
            Ok(items.get(*i as usize).cloned().unwrap_or(Value::Null))
        }
        (Value::Map(map), Value::Str(k)) => Ok(map.get(k).cloned().unwrap_or(Value::Null)),
        (Value::Map(map), Value::Int(i)) => {
            Ok(map.get(&i.to_string()).cloned().unwrap_or(Value::Null))
        }
        (other, _) => Err(ExprError::BadOperand {
            expression: source.to_string(),
            op: "[]",
            kind: other.kind_name(),
        }),
    }
}

fn call_method(
    value: &Value,
    name: &str,
    args: &[Value],
    source: &str,
) -> Result<Value, ExprError> {
    match (name, args) {
        ("size", []) | ("length", []) => value.len().map(|l| Value::Int(l as i64)).ok_or_else(|| {
            ExprError::BadOperand {
                expression: source.to_string(),
                op: "size()",
                kind: value.kind_name(),
            }
        }),
        ("isEmpty", []) => value.len().map(|l| Value::Bool(l == 0)).ok_or_else(|| {
            ExprError::BadOperand {
                expression: source.to_string(),
                op: "isEmpty()",
                kind: value.kind_name(),
            }
        }),
        ("contains", [needle]) => match value {
            Value::List(items) => Ok(Value::Bool(items.contains(needle))),
            Value::Str(s) => Ok(Value::Bool(
                needle.as_str().is_some_and(|n| s.contains(n)),
            )),
            other => Err(ExprError::BadOperand {
                expression: source.to_string(),
                op: "contains()",
                kind: other.kind_name(),
            }),
        },
        _ => Err(ExprError::Eval {
            expression: source.to_string(),
            message: format!("unknown method '{name}'"),
        }),
    }
}

fn compare(op: BinaryOp, lhs: &Value, rhs: &Value, source: &str) -> Result<Value, ExprError> {
    use std::cmp::Ordering;

    let ordering: Option<Ordering> = match (lhs, rhs) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (a, b) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => None,
        },
    };

    let result = match op {
        BinaryOp::Eq => match ordering {
            Some(Ordering::Equal) => true,
            Some(_) => false,
            None => lhs == rhs,
        },
        BinaryOp::Ne => match ordering {
            Some(Ordering::Equal) => false,
            Some(_) => true,
            None => lhs != rhs,
        },
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let Some(ordering) = ordering else {
                // Relational comparison against null or mixed kinds is
                // simply false, matching the lenient test-condition style.
                return Ok(Value::Bool(false));
            };
            match op {
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::Le => ordering != Ordering::Greater,
                BinaryOp::Gt => ordering == Ordering::Greater,
                BinaryOp::Ge => ordering != Ordering::Less,
                _ => unreachable!(),
            }
        }
        BinaryOp::And | BinaryOp::Or => unreachable!("handled by eval_expr"),
    };
    let _ = source;
    Ok(Value::Bool(result))
}

#[cfg(test)]
mod tests {
    use ahash::AHashMap;
    use pretty_assertions::assert_eq;

    use super::*;

    fn scope() -> AHashMap<String, Value> {
        let mut scope = AHashMap::new();
        scope.insert("age".to_string(), Value::Int(10));
        scope.insert("name".to_string(), Value::Str("ada".into()));
        scope.insert(
            "user".to_string(),
            Value::from_iter([
                ("id".to_string(), Value::Int(3)),
                (
                    "roles".to_string(),
                    Value::List(vec![Value::Str("admin".into())]),
                ),
            ]),
        );
        scope.insert("empty".to_string(), Value::Str(String::new()));
        scope
    }

    fn eval(source: &str) -> Value {
        Expression::parse(source).unwrap().eval(&scope()).unwrap()
    }

    #[test]
    fn comparisons() {
        assert_eq!(eval("age == 10"), Value::Bool(true));
        assert_eq!(eval("age != null"), Value::Bool(true));
        assert_eq!(eval("age > 9"), Value::Bool(true));
        assert_eq!(eval("age gte 10"), Value::Bool(true));
        assert_eq!(eval("name == 'ada'"), Value::Bool(true));
        assert_eq!(eval("missing == null"), Value::Bool(true));
    }

    #[test]
    fn numeric_comparison_crosses_int_and_double() {
        assert_eq!(eval("age == 10.0"), Value::Bool(true));
        assert_eq!(eval("age < 10.5"), Value::Bool(true));
    }

    #[test]
    fn boolean_connectives_short_circuit() {
        assert_eq!(eval("age == 10 and name == 'ada'"), Value::Bool(true));
        assert_eq!(eval("age == 11 or name == 'ada'"), Value::Bool(true));
        assert_eq!(eval("not (age == 11)"), Value::Bool(true));
        // missing.anything would error if evaluated
        assert_eq!(eval("age == 10 or missing.oops == 1"), Value::Bool(true));
    }

    #[test]
    fn truthiness_rules() {
        assert!(!truthy(&Value::Null));
        assert!(!truthy(&Value::Int(0)));
        assert!(!truthy(&Value::Double(0.0)));
        assert!(!truthy(&Value::Str(String::new())));
        assert!(truthy(&Value::Str("x".into())));
        assert!(truthy(&Value::List(Vec::new())));
        assert_eq!(eval("empty"), Value::Str(String::new()));
        assert!(!Expression::parse("empty").unwrap().eval_bool(&scope()).unwrap());
    }

    #[test]
    fn path_navigation_with_indexing() {
        assert_eq!(eval("user.id"), Value::Int(3));
        assert_eq!(eval("user.roles[0]"), Value::Str("admin".into()));
        assert_eq!(eval("user.roles.size()"), Value::Int(1));
        assert_eq!(eval("user['id']"), Value::Int(3));
    }

    #[test]
    fn relational_with_null_is_false() {
        assert_eq!(eval("missing > 1"), Value::Bool(false));
        assert_eq!(eval("missing < 1"), Value::Bool(false));
    }

    #[test]
    fn unary_minus() {
        assert_eq!(eval("-age"), Value::Int(-10));
        assert_eq!(eval("age > -1"), Value::Bool(true));
    }
}
