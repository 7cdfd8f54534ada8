use std::sync::{Arc, Mutex};

use ahash::AHashMap;

use crate::errors::ReflectionError;
use crate::value::Value;

/// One segment of a property path: a name plus an optional index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyToken {
    pub name: String,
    pub index: Option<IndexKey>,
}

/// `a[0]` indexes lists by position, `a[key]` indexes maps by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexKey {
    Position(usize),
    Key(String),
}

/// Splits `a.b[0].c` into its segments. Malformed brackets fall back to
/// treating the whole segment as a plain name.
pub fn tokenize(path: &str) -> Vec<PropertyToken> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .map(|segment| match segment.find('[') {
            Some(open) if segment.ends_with(']') => {
                let name = segment[..open].to_string();
                let inner = &segment[open + 1..segment.len() - 1];
                let index = match inner.parse::<usize>() {
                    Ok(position) => IndexKey::Position(position),
                    Err(_) => IndexKey::Key(inner.trim_matches(['\'', '"']).to_string()),
                };
                PropertyToken {
                    name,
                    index: Some(index),
                }
            }
            _ => PropertyToken {
                name: segment.to_string(),
                index: None,
            },
        })
        .collect()
}

/// Navigation over a `Value` tree by dotted, optionally indexed paths.
/// Missing map keys and out-of-range list positions read as `Null`;
/// navigating *through* a scalar is an error.
pub struct MetaObject<'a> {
    value: &'a mut Value,
}

impl<'a> MetaObject<'a> {
    pub fn new(value: &'a mut Value) -> Self {
        Self { value }
    }

    pub fn get_value(&self, path: &str) -> Result<Value, ReflectionError> {
        get_path(self.value, path)
    }

    pub fn set_value(&mut self, path: &str, new_value: Value) -> Result<(), ReflectionError> {
        set_path(self.value, path, new_value)
    }
}

pub fn get_path(root: &Value, path: &str) -> Result<Value, ReflectionError> {
    let mut current = root.clone();
    for token in tokenize(path) {
        current = step(&current, &token)?;
    }
    Ok(current)
}

fn step(current: &Value, token: &PropertyToken) -> Result<Value, ReflectionError> {
    let named = if token.name.is_empty() {
        current.clone()
    } else {
        match current {
            Value::Null => Value::Null,
            Value::Map(map) => map.get(&token.name).cloned().unwrap_or(Value::Null),
            other => {
                // `size`/`length` read as the container length so expressions
                // like `list.size` work without a method call.
                if matches!(token.name.as_str(), "size" | "length") {
                    match other.len() {
                        Some(len) => Value::Int(len as i64),
                        None => {
                            return Err(ReflectionError::NotIndexable {
                                kind: other.kind_name(),
                                segment: token.name.clone(),
                            });
                        }
                    }
                } else {
                    return Err(ReflectionError::NotIndexable {
                        kind: other.kind_name(),
                        segment: token.name.clone(),
                    });
                }
            }
        }
    };
    let Some(index) = &token.index else {
        return Ok(named);
    };
    match (index, &named) {
        (_, Value::Null) => Ok(Value::Null),
        (IndexKey::Position(position), Value::List(items)) => {
            Ok(items.get(*position).cloned().unwrap_or(Value::Null))
        }
        (IndexKey::Position(position), Value::Map(map)) => {
            Ok(map.get(&position.to_string()).cloned().unwrap_or(Value::Null))
        }
        (IndexKey::Key(key), Value::Map(map)) => {
            Ok(map.get(key).cloned().unwrap_or(Value::Null))
        }
        (index, other) => Err(ReflectionError::NotIndexable {
            kind: other.kind_name(),
            segment: match index {
                IndexKey::Position(p) => format!("[{p}]"),
                IndexKey::Key(k) => format!("[{k}]"),
            },
        }),
    }
}

/// Sets a leaf, materializing intermediate maps (and growing lists with
/// nulls) along the way.
pub fn set_path(root: &mut Value, path: &str, new_value: Value) -> Result<(), ReflectionError> {
    let tokens = tokenize(path);
    if tokens.is_empty() {
        *root = new_value;
        return Ok(());
    }
    set_tokens(root, &tokens, new_value)
}

fn set_tokens(
    current: &mut Value,
    tokens: &[PropertyToken],
    new_value: Value,
) -> Result<(), ReflectionError> {
    let (token, rest) = tokens.split_first().expect("tokens are non-empty");

    if current.is_null() {
        *current = Value::Map(Default::default());
    }
    let slot = slot_for(current, token)?;
    if rest.is_empty() {
        *slot = new_value;
        Ok(())
    } else {
        set_tokens(slot, rest, new_value)
    }
}

fn slot_for<'v>(
    current: &'v mut Value,
    token: &PropertyToken,
) -> Result<&'v mut Value, ReflectionError> {
    let named: &mut Value = if token.name.is_empty() {
        current
    } else {
        match current {
            Value::Map(map) => map.entry(token.name.clone()).or_insert(Value::Null),
            other => {
                return Err(ReflectionError::NotIndexable {
                    kind: other.kind_name(),
                    segment: token.name.clone(),
                });
            }
        }
    };
    let Some(index) = &token.index else {
        return Ok(named);
    };
    match index {
        IndexKey::Position(position) => {
            if named.is_null() {
                *named = Value::List(Vec::new());
            }
            match named {
                Value::List(items) => {
                    while items.len() <= *position {
                        items.push(Value::Null);
                    }
                    Ok(&mut items[*position])
                }
                other => Err(ReflectionError::NotIndexable {
                    kind: other.kind_name(),
                    segment: format!("[{position}]"),
                }),
            }
        }
        IndexKey::Key(key) => {
            if named.is_null() {
                *named = Value::Map(Default::default());
            }
            match named {
                Value::Map(map) => Ok(map.entry(key.clone()).or_insert(Value::Null)),
                other => Err(ReflectionError::NotIndexable {
                    kind: other.kind_name(),
                    segment: format!("[{key}]"),
                }),
            }
        }
    }
}

/// Cached metadata for one record shape: its property set and a
/// case-insensitive name index. Two properties that collide when
/// case-folded are recorded as ambiguous and only fail when looked up.
#[derive(Debug)]
pub struct ShapeInfo {
    name: String,
    properties: Vec<String>,
    by_folded: AHashMap<String, FoldedEntry>,
}

#[derive(Debug)]
enum FoldedEntry {
    Unique(String),
    Ambiguous(Vec<String>),
}

impl ShapeInfo {
    pub fn new(name: impl Into<String>, properties: impl IntoIterator<Item = String>) -> Self {
        let name = name.into();
        let properties: Vec<String> = properties
            .into_iter()
            .filter(|p| !excluded_property(p))
            .collect();
        let mut by_folded: AHashMap<String, FoldedEntry> = AHashMap::new();
        for property in &properties {
            let folded = property.to_lowercase();
            match by_folded.get_mut(&folded) {
                None => {
                    by_folded.insert(folded, FoldedEntry::Unique(property.clone()));
                }
                Some(FoldedEntry::Unique(existing)) => {
                    let ambiguous = vec![existing.clone(), property.clone()];
                    by_folded.insert(folded, FoldedEntry::Ambiguous(ambiguous));
                }
                Some(FoldedEntry::Ambiguous(candidates)) => {
                    candidates.push(property.clone());
                }
            }
        }
        Self {
            name,
            properties,
            by_folded,
        }
    }

    /// Derives a shape from a map instance, keeping key order.
    pub fn from_map(name: impl Into<String>, value: &Value) -> Self {
        let properties = value
            .as_map()
            .map(|map| map.keys().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        Self::new(name, properties)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn properties(&self) -> &[String] {
        &self.properties
    }

    pub fn has_property(&self, name: &str) -> bool {
        self.properties.iter().any(|p| p == name)
    }

    /// Resolves a name case-insensitively to the declared property name.
    pub fn find_property(&self, name: &str) -> Result<Option<&str>, ReflectionError> {
        match self.by_folded.get(&name.to_lowercase()) {
            None => Ok(None),
            Some(FoldedEntry::Unique(property)) => Ok(Some(property)),
            Some(FoldedEntry::Ambiguous(candidates)) => Err(ReflectionError::AmbiguousProperty {
                shape: self.name.clone(),
                name: name.to_string(),
                candidates: candidates.clone(),
            }),
        }
    }
}

fn excluded_property(name: &str) -> bool {
    name.starts_with('$') || name == "class" || name == "serialVersionUID"
}

/// Process-wide cache of shape descriptors, keyed by shape name. The cache
/// can be disabled, in which case descriptors are rebuilt on every lookup
/// from whatever source registered them.
#[derive(Debug)]
pub struct ReflectorFactory {
    enabled: bool,
    shapes: Mutex<AHashMap<String, Arc<ShapeInfo>>>,
}

impl Default for ReflectorFactory {
    fn default() -> Self {
        Self {
            enabled: true,
            shapes: Mutex::new(AHashMap::new()),
        }
    }
}

impl ReflectorFactory {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Default::default()
        }
    }

    pub fn is_caching_enabled(&self) -> bool {
        self.enabled
    }

    pub fn register(&self, shape: ShapeInfo) {
        self.shapes
            .lock()
            .expect("reflector cache lock")
            .insert(shape.name().to_string(), Arc::new(shape));
    }

    pub fn find(&self, name: &str) -> Option<Arc<ShapeInfo>> {
        self.shapes
            .lock()
            .expect("reflector cache lock")
            .get(name)
            .cloned()
    }

    /// Returns the cached descriptor, deriving one from `instance` on first
    /// sight. With caching disabled the derivation happens every call.
    pub fn find_or_derive(&self, name: &str, instance: &Value) -> Arc<ShapeInfo> {
        if self.enabled
            && let Some(found) = self.find(name)
        {
            return found;
        }
        let derived = Arc::new(ShapeInfo::from_map(name, instance));
        if self.enabled {
            self.shapes
                .lock()
                .expect("reflector cache lock")
                .insert(name.to_string(), derived.clone());
        }
        derived
    }

    pub fn clear(&self) {
        self.shapes.lock().expect("reflector cache lock").clear();
    }
}
