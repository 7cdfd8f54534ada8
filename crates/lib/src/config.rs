//! The root registry owner. After the loader's `parse()` returns the
//! configuration is read-only; sessions and executors only ever read it
//! through an `Arc`.

use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ahash::{AHashMap, AHashSet};
use itertools::Itertools;
use squill_core::cache::Cache;
use squill_core::driver::Driver;
use squill_core::errors::{BindingError, ConfigError};
use squill_core::reflect::ReflectorFactory;
use squill_core::types::{SqlType, TypeAliasRegistry, TypeHandlerRegistry};
use strum_macros::{Display, EnumString};

use crate::datasource::DataSource;
use crate::mapping::{
    CacheRefConfig, MappedStatement, ParameterMap, ResultMap, ResultMapConfig, StatementConfig,
};
use crate::plugin::Interceptor;
use crate::transaction::TransactionFactory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum ExecutorType {
    #[default]
    Simple,
    Reuse,
    Batch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum AutoMappingBehavior {
    None,
    #[default]
    Partial,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum LocalCacheScope {
    #[default]
    Session,
    Statement,
}

/// Recognized `<settings>` keys and their defaults. Unknown keys are a
/// configuration error.
#[derive(Debug, Clone)]
pub struct Settings {
    pub cache_enabled: bool,
    pub default_executor_type: ExecutorType,
    pub default_statement_timeout: Option<Duration>,
    pub default_fetch_size: Option<u32>,
    pub map_underscore_to_camel_case: bool,
    pub auto_mapping_behavior: AutoMappingBehavior,
    pub local_cache_scope: LocalCacheScope,
    pub sql_type_for_null: SqlType,
    pub use_generated_keys: bool,
    pub log_prefix: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            default_executor_type: ExecutorType::Simple,
            default_statement_timeout: None,
            default_fetch_size: None,
            map_underscore_to_camel_case: false,
            auto_mapping_behavior: AutoMappingBehavior::Partial,
            local_cache_scope: LocalCacheScope::Session,
            sql_type_for_null: SqlType::Other,
            use_generated_keys: false,
            log_prefix: None,
        }
    }
}

impl Settings {
    pub fn apply(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
            value.parse().map_err(|_| ConfigError::InvalidValue {
                what: format!("setting '{key}'"),
                value: value.to_string(),
            })
        }

        match key {
            "cacheEnabled" => self.cache_enabled = parse(key, value)?,
            "defaultExecutorType" => self.default_executor_type = parse(key, value)?,
            "defaultStatementTimeout" => {
                self.default_statement_timeout =
                    Some(Duration::from_secs(parse::<u64>(key, value)?))
            }
            "defaultFetchSize" => self.default_fetch_size = Some(parse(key, value)?),
            "mapUnderscoreToCamelCase" => {
                self.map_underscore_to_camel_case = parse(key, value)?
            }
            "autoMappingBehavior" => self.auto_mapping_behavior = parse(key, value)?,
            "localCacheScope" => self.local_cache_scope = parse(key, value)?,
            "jdbcTypeForNull" => self.sql_type_for_null = parse(key, value)?,
            "useGeneratedKeys" => self.use_generated_keys = parse(key, value)?,
            "logPrefix" => self.log_prefix = Some(value.to_string()),
            unknown => return Err(ConfigError::UnknownSetting(unknown.to_string())),
        }
        Ok(())
    }
}

/// Lookup failure detail from a [`StrictMap`].
#[derive(Debug)]
pub enum StrictLookup {
    Missing,
    Ambiguous(Vec<String>),
}

/// A registry keyed by fully-qualified ids that also answers to bare
/// short names, as long as the short name is unambiguous.
#[derive(Debug, Default)]
pub struct StrictMap<V> {
    map: AHashMap<String, StrictEntry<V>>,
}

#[derive(Debug)]
enum StrictEntry<V> {
    Value(V),
    Ambiguous(Vec<String>),
}

impl<V> StrictMap<V> {
    pub fn new() -> Self {
        Self {
            map: AHashMap::new(),
        }
    }

    pub fn insert(&mut self, key: &str, value: V) -> Result<(), ConfigError> {
        if self.map.contains_key(key) {
            return Err(ConfigError::Duplicate(key.to_string()));
        }
        if let Some((_, short)) = key.rsplit_once('.') {
            // short names are candidate lists; lookup resolves a sole
            // candidate and rejects the rest as ambiguous
            match self.map.get_mut(short) {
                None => {
                    self.map
                        .insert(short.to_string(), StrictEntry::Ambiguous(vec![key.to_string()]));
                }
                Some(StrictEntry::Ambiguous(candidates)) => candidates.push(key.to_string()),
                Some(StrictEntry::Value(_)) => {}
            }
        }
        self.map.insert(key.to_string(), StrictEntry::Value(value));
        Ok(())
    }

    pub fn contains(&self, key: &str) -> bool {
        matches!(self.map.get(key), Some(StrictEntry::Value(_)))
    }

    pub fn get(&self, key: &str) -> Result<&V, StrictLookup> {
        match self.map.get(key) {
            Some(StrictEntry::Value(value)) => Ok(value),
            Some(StrictEntry::Ambiguous(candidates)) => {
                if candidates.len() == 1 {
                    match self.map.get(&candidates[0]) {
                        Some(StrictEntry::Value(value)) => Ok(value),
                        _ => Err(StrictLookup::Missing),
                    }
                } else {
                    Err(StrictLookup::Ambiguous(candidates.clone()))
                }
            }
            None => Err(StrictLookup::Missing),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.map.iter().filter_map(|(k, v)| match v {
            StrictEntry::Value(_) => Some(k.as_str()),
            StrictEntry::Ambiguous(_) => None,
        })
    }

    /// Full ids that end with the given short name, for diagnostics.
    pub fn similar(&self, name: &str) -> Vec<String> {
        self.keys()
            .filter(|k| k.ends_with(name) || k.contains(name))
            .map(str::to_string)
            .sorted()
            .collect()
    }
}

/// Named drivers available to data-source construction; the analog of the
/// driver manager the original delegates to.
#[derive(Default, Clone)]
pub struct DriverRegistry {
    drivers: AHashMap<String, Arc<dyn Driver>>,
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.drivers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, driver: Arc<dyn Driver>) {
        self.drivers.insert(name.into(), driver);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Driver>, ConfigError> {
        self.drivers
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::Unresolved {
                kind: "driver",
                reference: name.to_string(),
            })
    }
}

/// The active environment: its transaction factory and data source.
#[derive(Clone)]
pub struct Environment {
    pub id: String,
    pub transaction_factory: Arc<dyn TransactionFactory>,
    pub data_source: Arc<dyn DataSource>,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment").field("id", &self.id).finish()
    }
}

#[derive(Debug, Default)]
pub(crate) struct IncompleteQueues {
    pub cache_refs: Vec<CacheRefConfig>,
    pub result_maps: Vec<ResultMapConfig>,
    pub statements: Vec<StatementConfig>,
}

impl IncompleteQueues {
    pub fn is_empty(&self) -> bool {
        self.cache_refs.is_empty() && self.result_maps.is_empty() && self.statements.is_empty()
    }

    pub fn len(&self) -> usize {
        self.cache_refs.len() + self.result_maps.len() + self.statements.len()
    }
}

pub struct Configuration {
    pub settings: Settings,
    pub variables: AHashMap<String, String>,
    pub type_aliases: TypeAliasRegistry,
    pub type_handlers: TypeHandlerRegistry,
    pub reflectors: ReflectorFactory,
    pub environment: Option<Environment>,
    pub database_id: Option<String>,
    pub(crate) drivers: DriverRegistry,
    mapped_statements: StrictMap<Arc<MappedStatement>>,
    result_maps: StrictMap<Arc<ResultMap>>,
    parameter_maps: StrictMap<Arc<ParameterMap>>,
    caches: AHashMap<String, Arc<dyn Cache>>,
    cache_refs: AHashMap<String, String>,
    sql_fragments: AHashMap<String, String>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    mapper_namespaces: AHashSet<String>,
    loaded_resources: AHashSet<String>,
    pub(crate) incomplete: Mutex<IncompleteQueues>,
}

impl std::fmt::Debug for Configuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Configuration")
            .field("environment", &self.environment)
            .field("database_id", &self.database_id)
            .field("statements", &self.mapped_statements.keys().count())
            .finish_non_exhaustive()
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}

impl Configuration {
    pub fn new() -> Self {
        Self {
            settings: Settings::default(),
            variables: AHashMap::new(),
            type_aliases: TypeAliasRegistry::new(),
            type_handlers: TypeHandlerRegistry::new(),
            reflectors: ReflectorFactory::default(),
            environment: None,
            database_id: None,
            drivers: DriverRegistry::new(),
            mapped_statements: StrictMap::new(),
            result_maps: StrictMap::new(),
            parameter_maps: StrictMap::new(),
            caches: AHashMap::new(),
            cache_refs: AHashMap::new(),
            sql_fragments: AHashMap::new(),
            interceptors: Vec::new(),
            mapper_namespaces: AHashSet::new(),
            loaded_resources: AHashSet::new(),
            incomplete: Mutex::new(IncompleteQueues::default()),
        }
    }

    // -- statements ---------------------------------------------------------

    pub fn add_mapped_statement(&mut self, statement: MappedStatement) -> Result<(), ConfigError> {
        self.mapped_statements
            .insert(&statement.id.clone(), Arc::new(statement))
    }

    pub fn has_statement(&self, id: &str) -> bool {
        self.mapped_statements.contains(id)
    }

    pub fn mapped_statement(&self, id: &str) -> Result<Arc<MappedStatement>, BindingError> {
        match self.mapped_statements.get(id) {
            Ok(found) => Ok(found.clone()),
            Err(StrictLookup::Ambiguous(candidates)) => Err(BindingError::UnknownStatement {
                id: id.to_string(),
                hint: format!(" (short name is ambiguous: {})", candidates.iter().join(", ")),
            }),
            Err(StrictLookup::Missing) => {
                let mut similar = self.mapped_statements.similar(id);
                if similar.is_empty()
                    && let Some((namespace, _)) = id.rsplit_once('.')
                {
                    // fall back to siblings in the same namespace
                    similar = self
                        .mapped_statements
                        .keys()
                        .filter(|k| k.starts_with(namespace) && k.contains('.'))
                        .map(str::to_string)
                        .sorted()
                        .collect();
                }
                let hint = if similar.is_empty() {
                    String::new()
                } else {
                    format!(" (did you mean {}?)", similar.iter().join(", "))
                };
                Err(BindingError::UnknownStatement {
                    id: id.to_string(),
                    hint,
                })
            }
        }
    }

    pub fn statement_ids(&self) -> Vec<String> {
        self.mapped_statements
            .keys()
            .filter(|k| k.contains('.'))
            .map(str::to_string)
            .sorted()
            .collect()
    }

    // -- result & parameter maps -------------------------------------------

    pub fn add_result_map(&mut self, map: ResultMap) -> Result<(), ConfigError> {
        self.result_maps.insert(&map.id.clone(), Arc::new(map))
    }

    pub fn has_result_map(&self, id: &str) -> bool {
        self.result_maps.contains(id)
    }

    pub fn result_map(&self, id: &str) -> Result<Arc<ResultMap>, ConfigError> {
        self.result_maps
            .get(id)
            .map(Arc::clone)
            .map_err(|_| ConfigError::Unresolved {
                kind: "result map",
                reference: id.to_string(),
            })
    }

    pub fn add_parameter_map(&mut self, map: ParameterMap) -> Result<(), ConfigError> {
        self.parameter_maps.insert(&map.id.clone(), Arc::new(map))
    }

    pub fn parameter_map(&self, id: &str) -> Result<Arc<ParameterMap>, ConfigError> {
        self.parameter_maps
            .get(id)
            .map(Arc::clone)
            .map_err(|_| ConfigError::Unresolved {
                kind: "parameter map",
                reference: id.to_string(),
            })
    }

    // -- caches -------------------------------------------------------------

    pub fn add_cache(&mut self, cache: Arc<dyn Cache>) -> Result<(), ConfigError> {
        let id = cache.id().to_string();
        if self.caches.contains_key(&id) {
            return Err(ConfigError::Duplicate(format!("cache '{id}'")));
        }
        self.caches.insert(id, cache);
        Ok(())
    }

    pub fn has_cache(&self, namespace: &str) -> bool {
        self.caches.contains_key(namespace)
    }

    pub fn cache(&self, namespace: &str) -> Option<Arc<dyn Cache>> {
        self.caches.get(namespace).cloned()
    }

    pub fn add_cache_ref(&mut self, namespace: &str, referenced: &str) {
        self.cache_refs
            .insert(namespace.to_string(), referenced.to_string());
    }

    pub fn cache_ref(&self, namespace: &str) -> Option<&str> {
        self.cache_refs.get(namespace).map(String::as_str)
    }

    /// The cache a namespace uses: its own, or the one it references.
    pub fn effective_cache(&self, namespace: &str) -> Option<Arc<dyn Cache>> {
        if let Some(own) = self.caches.get(namespace) {
            return Some(own.clone());
        }
        self.cache_refs
            .get(namespace)
            .and_then(|referenced| self.caches.get(referenced).cloned())
    }

    // -- sql fragments ------------------------------------------------------

    pub fn add_sql_fragment(&mut self, id: &str, xml: String) -> Result<(), ConfigError> {
        if self.sql_fragments.contains_key(id) {
            return Err(ConfigError::Duplicate(format!("sql fragment '{id}'")));
        }
        self.sql_fragments.insert(id.to_string(), xml);
        Ok(())
    }

    pub fn sql_fragment(&self, id: &str) -> Option<&str> {
        self.sql_fragments.get(id).map(String::as_str)
    }

    // -- interceptors -------------------------------------------------------

    pub fn add_interceptor(&mut self, interceptor: Arc<dyn Interceptor>) {
        self.interceptors.push(interceptor);
    }

    pub fn interceptors(&self) -> &[Arc<dyn Interceptor>] {
        &self.interceptors
    }

    // -- mappers & resources ------------------------------------------------

    pub fn add_mapper(&mut self, namespace: &str) -> Result<(), ConfigError> {
        if !self.mapper_namespaces.insert(namespace.to_string()) {
            return Err(ConfigError::Duplicate(format!("mapper '{namespace}'")));
        }
        Ok(())
    }

    pub fn has_mapper(&self, namespace: &str) -> bool {
        self.mapper_namespaces.contains(namespace)
    }

    pub fn mark_resource_loaded(&mut self, resource: &str) -> Result<(), ConfigError> {
        if !self.loaded_resources.insert(resource.to_string()) {
            return Err(ConfigError::DuplicateResource(resource.to_string()));
        }
        Ok(())
    }

    pub fn is_resource_loaded(&self, resource: &str) -> bool {
        self.loaded_resources.contains(resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_setting_is_rejected() {
        let mut settings = Settings::default();
        assert!(settings.apply("cacheEnabled", "false").is_ok());
        assert!(!settings.cache_enabled);
        let err = settings.apply("enableTurbo", "true").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownSetting(_)));
    }

    #[test]
    fn setting_values_are_validated() {
        let mut settings = Settings::default();
        assert!(settings.apply("defaultExecutorType", "REUSE").is_ok());
        assert_eq!(settings.default_executor_type, ExecutorType::Reuse);
        assert!(settings.apply("defaultExecutorType", "TURBO").is_err());
    }

    #[test]
    fn strict_map_resolves_unambiguous_short_names() {
        let mut map = StrictMap::new();
        map.insert("app.UserMapper.selectUser", 1).unwrap();
        assert_eq!(map.get("app.UserMapper.selectUser").copied().unwrap(), 1);
        assert_eq!(map.get("selectUser").copied().unwrap(), 1);
    }

    #[test]
    fn strict_map_reports_ambiguous_short_names() {
        let mut map = StrictMap::new();
        map.insert("a.selectUser", 1).unwrap();
        map.insert("b.selectUser", 2).unwrap();
        assert!(matches!(
            map.get("selectUser"),
            Err(StrictLookup::Ambiguous(_))
        ));
        assert_eq!(map.get("a.selectUser").copied().unwrap(), 1);
    }

    #[test]
    fn duplicate_statement_registration_fails() {
        let mut map = StrictMap::new();
        map.insert("ns.one", 1).unwrap();
        assert!(map.insert("ns.one", 2).is_err());
    }

    #[test]
    fn unknown_statement_lookup_offers_a_hint() {
        let mut config = Configuration::new();
        let source: Arc<dyn squill_core::sql::SqlSource> =
            Arc::new(squill_core::sql::StaticSqlSource::new("select 1").unwrap());
        config
            .add_mapped_statement(
                crate::mapping::MappedStatement::builder(
                    "app.UserMapper.selectUser",
                    crate::mapping::StatementKind::Select,
                    source,
                )
                .build(),
            )
            .unwrap();
        let err = config.mapped_statement("app.UserMapper.selectUsr").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("selectUsr"));
    }
}
