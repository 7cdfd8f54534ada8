use thiserror::Error;

use crate::error_context::ErrorContext;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised while assembling the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("malformed XML in {resource}: {message}")]
    Xml { resource: String, message: String },
    #[error("element <{element}> is missing required attribute '{attribute}'")]
    MissingAttribute {
        element: String,
        attribute: &'static str,
    },
    #[error("unexpected element <{0}>")]
    UnknownElement(String),
    #[error("unknown setting '{0}'")]
    UnknownSetting(String),
    #[error("invalid value '{value}' for {what}")]
    InvalidValue { what: String, value: String },
    #[error("resource '{0}' was already loaded")]
    DuplicateResource(String),
    #[error("duplicate registration of '{0}'")]
    Duplicate(String),
    #[error("unresolved {kind} reference '{reference}'")]
    Unresolved { kind: &'static str, reference: String },
    #[error("could not read resource '{resource}': {source}")]
    Io {
        resource: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Type(#[from] TypeError),
}

/// Errors raised when a mapper invocation cannot be bound to a statement.
#[derive(Debug, Error)]
pub enum BindingError {
    #[error("no mapped statement named '{id}'{hint}")]
    UnknownStatement { id: String, hint: String },
    #[error("statement '{id}' is a {kind} statement and cannot be invoked as {called}")]
    KindMismatch {
        id: String,
        kind: String,
        called: &'static str,
    },
    #[error("query '{id}' expected one row, got {count}")]
    TooManyRows { id: String, count: usize },
    #[error("map-keyed query '{id}' produced a row without key property '{key}'")]
    MissingMapKey { id: String, key: String },
    #[error("namespace '{0}' is not registered as a mapper")]
    UnknownMapper(String),
}

/// Errors raised navigating or converting value shapes.
#[derive(Debug, Error)]
pub enum ReflectionError {
    #[error("no property named '{name}' in {shape}")]
    NoSuchProperty { shape: String, name: String },
    #[error("property '{name}' is ambiguous in {shape}; it matches {candidates:?} ignoring case")]
    AmbiguousProperty {
        shape: String,
        name: String,
        candidates: Vec<String>,
    },
    #[error("cannot navigate '{segment}' through a {kind} value")]
    NotIndexable { kind: &'static str, segment: String },
    #[error("index {index} out of bounds (len {len})")]
    IndexOutOfBounds { index: usize, len: usize },
    #[error("value conversion failed: {0}")]
    Conversion(String),
}

/// Errors raised resolving or applying type handlers and aliases.
#[derive(Debug, Error)]
pub enum TypeError {
    #[error("alias '{alias}' already maps to '{existing}', refusing to remap to '{attempted}'")]
    AliasCollision {
        alias: String,
        existing: String,
        attempted: String,
    },
    #[error("unknown type alias '{0}'")]
    UnknownAlias(String),
    #[error("no type handler for (lang: {lang}, sql: {sql})")]
    NoHandler { lang: String, sql: String },
    #[error("enum '{name}' has no variant matching '{value}'")]
    EnumVariant { name: String, value: String },
    #[error("handler for {expected} cannot accept a {actual} value")]
    ValueMismatch {
        expected: &'static str,
        actual: &'static str,
    },
}

/// Errors raised inside the cache layer.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache '{id}' failed to serialize an entry: {source}")]
    Serialization {
        id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("cache '{id}' is misconfigured: {message}")]
    Decoration { id: String, message: String },
    #[error("cache '{id}' timed out waiting for key latch")]
    LatchTimeout { id: String },
}

/// Errors reported by the database driver or the connection layer.
#[derive(Debug, Error)]
pub enum DataStoreError {
    #[error("driver error: {0}")]
    Driver(String),
    #[error("connection is closed")]
    Closed,
    #[error("connection failed validation")]
    Invalid,
    #[error("driver does not support {0}")]
    Unsupported(&'static str),
}

/// Pool-specific failures, distinct from general datastore errors.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error(
        "could not get a good connection after {bad} bad connections (tolerance {tolerance})"
    )]
    BadConnectionLimit { bad: u32, tolerance: u32 },
    #[error("pool wait was interrupted")]
    Interrupted,
    #[error(transparent)]
    DataStore(#[from] DataStoreError),
}

/// Errors from the embedded expression language.
#[derive(Debug, Error)]
pub enum ExprError {
    #[error("lex error at offset {offset} in '{expression}': {message}")]
    Lex {
        expression: String,
        offset: usize,
        message: String,
    },
    #[error("parse error in '{expression}': {message}")]
    Parse { expression: String, message: String },
    #[error("cannot apply '{op}' to {kind} value in '{expression}'")]
    BadOperand {
        expression: String,
        op: &'static str,
        kind: &'static str,
    },
    #[error("could not evaluate '{expression}': {message}")]
    Eval { expression: String, message: String },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Binding(#[from] BindingError),
    #[error(transparent)]
    Reflection(#[from] ReflectionError),
    #[error(transparent)]
    Type(#[from] TypeError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    DataStore(#[from] DataStoreError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Expr(#[from] ExprError),
    #[error("{breadcrumb}")]
    Context {
        breadcrumb: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wraps this error with the diagnostic breadcrumb accumulated so far.
    /// Wrapping an already-wrapped error replaces the breadcrumb instead of
    /// nesting, so the outermost context wins.
    pub fn in_context(self, context: &ErrorContext) -> Error {
        let breadcrumb = context.render(&self);
        match self {
            Error::Context { source, .. } => Error::Context { breadcrumb, source },
            other => Error::Context {
                breadcrumb,
                source: Box::new(other),
            },
        }
    }

    /// The underlying cause, unwrapping any context layer.
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }
}
