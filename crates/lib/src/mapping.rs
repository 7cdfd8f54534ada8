//! The immutable-at-runtime model: mapped statements, result maps and the
//! owned intermediate configs that ride the incomplete queues until their
//! references resolve.

use std::sync::Arc;
use std::time::Duration;

use squill_core::cache::Cache;
use squill_core::driver::StatementStyle;
use squill_core::sql::{ParameterMapping, SqlSource};
use squill_core::types::{LangType, SqlType};
use strum_macros::{Display, EnumString};

/// What a statement does, parsed straight from its element name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    Flush,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum ResultSetStyle {
    ForwardOnly,
    ScrollInsensitive,
    ScrollSensitive,
    Default,
}

/// Key generation for inserts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyGeneratorKind {
    None,
    /// Read driver-generated keys back after execution.
    Driver,
    /// Run a companion select statement before or after the insert.
    SelectKey {
        statement_id: String,
        before: bool,
    },
}

/// The executable contract of one SQL operation. Created during
/// configuration assembly, never mutated afterwards.
pub struct MappedStatement {
    pub id: String,
    pub kind: StatementKind,
    pub sql_source: Arc<dyn SqlSource>,
    pub statement_style: StatementStyle,
    pub fetch_size: Option<u32>,
    pub timeout: Option<Duration>,
    pub result_set_style: Option<ResultSetStyle>,
    pub flush_cache: bool,
    pub use_cache: bool,
    pub result_ordered: bool,
    pub parameter_map: Option<Arc<ParameterMap>>,
    pub result_maps: Vec<Arc<ResultMap>>,
    pub key_generator: KeyGeneratorKind,
    pub key_properties: Vec<String>,
    pub key_columns: Vec<String>,
    pub database_id: Option<String>,
    pub cache: Option<Arc<dyn Cache>>,
    pub resource: String,
}

impl std::fmt::Debug for MappedStatement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedStatement")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("resource", &self.resource)
            .finish_non_exhaustive()
    }
}

impl MappedStatement {
    pub fn builder(
        id: impl Into<String>,
        kind: StatementKind,
        sql_source: Arc<dyn SqlSource>,
    ) -> MappedStatementBuilder {
        MappedStatementBuilder {
            statement: MappedStatement {
                id: id.into(),
                kind,
                sql_source,
                statement_style: StatementStyle::Prepared,
                fetch_size: None,
                timeout: None,
                result_set_style: None,
                flush_cache: kind != StatementKind::Select,
                use_cache: kind == StatementKind::Select,
                result_ordered: false,
                parameter_map: None,
                result_maps: Vec::new(),
                key_generator: KeyGeneratorKind::None,
                key_properties: Vec::new(),
                key_columns: Vec::new(),
                database_id: None,
                cache: None,
                resource: String::new(),
            },
        }
    }

    pub fn namespace(&self) -> &str {
        self.id.rsplit_once('.').map_or("", |(ns, _)| ns)
    }
}

pub struct MappedStatementBuilder {
    statement: MappedStatement,
}

impl MappedStatementBuilder {
    pub fn statement_style(mut self, style: StatementStyle) -> Self {
        self.statement.statement_style = style;
        self
    }

    pub fn fetch_size(mut self, fetch_size: Option<u32>) -> Self {
        self.statement.fetch_size = fetch_size;
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.statement.timeout = timeout;
        self
    }

    pub fn result_set_style(mut self, style: Option<ResultSetStyle>) -> Self {
        self.statement.result_set_style = style;
        self
    }

    pub fn flush_cache(mut self, flush: bool) -> Self {
        self.statement.flush_cache = flush;
        self
    }

    pub fn use_cache(mut self, use_cache: bool) -> Self {
        self.statement.use_cache = use_cache;
        self
    }

    pub fn result_ordered(mut self, ordered: bool) -> Self {
        self.statement.result_ordered = ordered;
        self
    }

    pub fn parameter_map(mut self, map: Option<Arc<ParameterMap>>) -> Self {
        self.statement.parameter_map = map;
        self
    }

    pub fn result_maps(mut self, maps: Vec<Arc<ResultMap>>) -> Self {
        self.statement.result_maps = maps;
        self
    }

    pub fn key_generator(mut self, generator: KeyGeneratorKind) -> Self {
        self.statement.key_generator = generator;
        self
    }

    pub fn key_properties(mut self, properties: Vec<String>) -> Self {
        self.statement.key_properties = properties;
        self
    }

    pub fn key_columns(mut self, columns: Vec<String>) -> Self {
        self.statement.key_columns = columns;
        self
    }

    pub fn database_id(mut self, database_id: Option<String>) -> Self {
        self.statement.database_id = database_id;
        self
    }

    pub fn cache(mut self, cache: Option<Arc<dyn Cache>>) -> Self {
        self.statement.cache = cache;
        self
    }

    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.statement.resource = resource.into();
        self
    }

    pub fn build(self) -> MappedStatement {
        self.statement
    }
}

/// Binds result-set columns to properties of a target shape.
#[derive(Debug, Clone)]
pub struct ResultMap {
    pub id: String,
    pub type_name: String,
    pub mappings: Vec<ResultMapping>,
    pub constructor_mappings: Vec<ResultMapping>,
    pub discriminator: Option<Discriminator>,
    pub auto_mapping: Option<bool>,
}

impl ResultMap {
    /// An inline map for a bare `resultType` declaration: no explicit
    /// mappings, rows automap into the named shape.
    pub fn inline(id: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            type_name: type_name.into(),
            mappings: Vec::new(),
            constructor_mappings: Vec::new(),
            discriminator: None,
            auto_mapping: None,
        }
    }

    pub fn id_mappings(&self) -> impl Iterator<Item = &ResultMapping> {
        self.mappings.iter().filter(|m| m.id_flag)
    }

    pub fn has_nested_result_maps(&self) -> bool {
        self.mappings.iter().any(|m| m.nested_result_map.is_some())
    }

    pub fn has_nested_selects(&self) -> bool {
        self.mappings.iter().any(|m| m.nested_select.is_some())
    }

    pub fn mapped_columns(&self) -> impl Iterator<Item = &str> {
        self.mappings
            .iter()
            .chain(self.constructor_mappings.iter())
            .filter_map(|m| m.column.as_deref())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResultMapping {
    pub property: String,
    pub column: Option<String>,
    /// `column="{prop=col,…}"` composites feeding a nested select.
    pub composite_columns: Vec<(String, String)>,
    pub lang_type: Option<LangType>,
    pub sql_type: Option<SqlType>,
    pub type_handler: Option<String>,
    pub nested_result_map: Option<String>,
    pub nested_select: Option<String>,
    pub column_prefix: Option<String>,
    /// True for `<collection>`, false for `<association>` and plain results.
    pub many: bool,
    /// True when declared with `<id>`.
    pub id_flag: bool,
}

impl ResultMapping {
    pub fn simple(property: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            column: Some(column.into()),
            ..Default::default()
        }
    }
}

/// A column whose value deterministically selects among alternative
/// result maps for one row.
#[derive(Debug, Clone)]
pub struct Discriminator {
    pub column: String,
    pub lang_type: Option<LangType>,
    pub sql_type: Option<SqlType>,
    /// column value -> result map id
    pub cases: Vec<(String, String)>,
}

impl Discriminator {
    pub fn case_for(&self, value: &str) -> Option<&str> {
        self.cases
            .iter()
            .find(|(case, _)| case == value)
            .map(|(_, id)| id.as_str())
    }
}

/// An explicit `<parameterMap>`.
#[derive(Debug, Clone)]
pub struct ParameterMap {
    pub id: String,
    pub mappings: Vec<ParameterMapping>,
}

// ---------------------------------------------------------------------------
// Owned intermediates for the incomplete queues. Each carries enough state
// to retry after more of the configuration has landed.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CacheRefConfig {
    pub namespace: String,
    pub referenced_namespace: String,
}

#[derive(Debug, Clone)]
pub struct ResultMapConfig {
    pub namespace: String,
    pub id: String,
    pub type_name: String,
    pub extends: Option<String>,
    pub auto_mapping: Option<bool>,
    pub mappings: Vec<ResultMapping>,
    pub constructor_mappings: Vec<ResultMapping>,
    pub discriminator: Option<Discriminator>,
}

#[derive(Debug, Clone)]
pub struct SelectKeyConfig {
    pub statement_id: String,
    pub before: bool,
}

/// A statement awaiting reference resolution. It keeps its raw XML so a
/// retry can re-run the full build once the missing reference lands.
#[derive(Debug, Clone)]
pub struct StatementConfig {
    pub namespace: String,
    pub resource: String,
    pub raw_xml: String,
}
