//! Per-mapper-file parsing: caches, parameter maps, result maps, sql
//! fragments and statements. Unresolvable references are queued on the
//! configuration's incomplete queues and re-drained to fixed point.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use squill_core::errors::{ConfigError, Result};
use squill_core::sql::{ParameterMapping, ParameterMode, build_sql_source};
use squill_core::types::{LangType, SqlType};
use squill_core::cache::{CacheBuilder, EvictionKind};

use crate::builder::script::{build_statement_node, is_missing_fragment};
use crate::builder::{
    attr_value, bool_attr, node_source, parse_attr, required_attr, xml_error,
};
use crate::config::{Configuration, IncompleteQueues};
use crate::mapping::{
    CacheRefConfig, Discriminator, KeyGeneratorKind, MappedStatement, ParameterMap, ResultMap,
    ResultMapConfig, ResultMapping, ResultSetStyle, StatementConfig, StatementKind,
};

pub struct XmlMapperBuilder<'a> {
    configuration: &'a mut Configuration,
    resource: String,
}

impl<'a> XmlMapperBuilder<'a> {
    pub fn new(configuration: &'a mut Configuration, resource: impl Into<String>) -> Self {
        Self {
            configuration,
            resource: resource.into(),
        }
    }

    pub fn parse(mut self, xml: &str) -> Result<()> {
        if self.configuration.is_resource_loaded(&self.resource) {
            return Ok(());
        }
        let document =
            roxmltree::Document::parse(xml).map_err(|e| xml_error(&self.resource, e))?;
        let mapper = document.root_element();
        if !mapper.has_tag_name("mapper") {
            return Err(
                ConfigError::UnknownElement(mapper.tag_name().name().to_string()).into(),
            );
        }
        let variables = self.configuration.variables.clone();
        let namespace = required_attr(mapper, "namespace", &variables)?;
        self.configuration.mark_resource_loaded(&self.resource)?;
        if !self.configuration.has_mapper(&namespace) {
            self.configuration.add_mapper(&namespace)?;
        }
        tracing::debug!(resource = %self.resource, %namespace, "parsing mapper");

        // category order matters: fragments and shapes land before the
        // statements that reference them
        self.parse_cache_ref(mapper, &namespace, &variables)?;
        self.parse_cache(mapper, &namespace, &variables)?;
        self.parse_parameter_maps(mapper, &namespace, &variables)?;
        self.parse_result_maps(mapper, &namespace, &variables)?;
        self.parse_sql_fragments(xml, mapper, &namespace, &variables)?;
        self.parse_statements(xml, mapper, &namespace)?;

        drain_incomplete(self.configuration)
    }

    fn parse_cache_ref(
        &mut self,
        mapper: roxmltree::Node<'_, '_>,
        namespace: &str,
        variables: &AHashMap<String, String>,
    ) -> Result<()> {
        for node in mapper.children().filter(|c| c.has_tag_name("cache-ref")) {
            let referenced = required_attr(node, "namespace", variables)?;
            self.configuration.add_cache_ref(namespace, &referenced);
            if !self.configuration.has_cache(&referenced) {
                self.configuration
                    .incomplete
                    .lock()
                    .expect("incomplete queue lock")
                    .cache_refs
                    .push(CacheRefConfig {
                        namespace: namespace.to_string(),
                        referenced_namespace: referenced,
                    });
            }
        }
        Ok(())
    }

    fn parse_cache(
        &mut self,
        mapper: roxmltree::Node<'_, '_>,
        namespace: &str,
        variables: &AHashMap<String, String>,
    ) -> Result<()> {
        for node in mapper.children().filter(|c| c.has_tag_name("cache")) {
            if let Some(kind) = attr_value(node, "type", variables)
                && !kind.eq_ignore_ascii_case("PERPETUAL")
            {
                return Err(ConfigError::InvalidValue {
                    what: "cache type".to_string(),
                    value: kind,
                }
                .into());
            }
            let eviction = match attr_value(node, "eviction", variables) {
                Some(raw) => {
                    EvictionKind::from_str(&raw).map_err(|_| ConfigError::InvalidValue {
                        what: "cache eviction".to_string(),
                        value: raw,
                    })?
                }
                None => EvictionKind::default(),
            };
            let properties = crate::builder::property_children(node, variables)?;
            let read_only = bool_attr(node, "readOnly", variables)?.unwrap_or(false);
            let cache = CacheBuilder::new(namespace)
                .eviction(eviction)
                .clear_interval(
                    parse_attr::<u64>(node, "flushInterval", variables)?
                        .map(Duration::from_millis),
                )
                .size(parse_attr(node, "size", variables)?)
                .read_write(!read_only)
                .blocking(bool_attr(node, "blocking", variables)?.unwrap_or(false))
                .blocking_timeout(
                    properties
                        .get("blockingTimeout")
                        .and_then(|raw| raw.parse().ok())
                        .map(Duration::from_millis),
                )
                .build();
            self.configuration.add_cache(cache)?;
        }
        Ok(())
    }

    fn parse_parameter_maps(
        &mut self,
        mapper: roxmltree::Node<'_, '_>,
        namespace: &str,
        variables: &AHashMap<String, String>,
    ) -> Result<()> {
        for node in mapper.children().filter(|c| c.has_tag_name("parameterMap")) {
            let id = required_attr(node, "id", variables)?;
            let mut mappings = Vec::new();
            for parameter in node.children().filter(|c| c.has_tag_name("parameter")) {
                let property = required_attr(parameter, "property", variables)?;
                let mut mapping = ParameterMapping::of(property);
                mapping.lang_type = attr_value(parameter, "javaType", variables)
                    .map(|raw| LangType::parse(&raw));
                mapping.sql_type = parse_attr::<SqlType>(parameter, "jdbcType", variables)?;
                mapping.mode = parse_attr::<ParameterMode>(parameter, "mode", variables)?
                    .unwrap_or_default();
                mapping.type_handler = attr_value(parameter, "typeHandler", variables);
                mapping.numeric_scale = parse_attr(parameter, "numericScale", variables)?;
                mappings.push(mapping);
            }
            self.configuration.add_parameter_map(ParameterMap {
                id: qualify(namespace, &id),
                mappings,
            })?;
        }
        Ok(())
    }

    fn parse_result_maps(
        &mut self,
        mapper: roxmltree::Node<'_, '_>,
        namespace: &str,
        variables: &AHashMap<String, String>,
    ) -> Result<()> {
        for node in mapper.children().filter(|c| c.has_tag_name("resultMap")) {
            let mut synthesized = Vec::new();
            let config =
                parse_result_map_element(namespace, node, variables, &mut synthesized, None)?;
            for child in synthesized {
                resolve_or_queue_result_map(self.configuration, child)?;
            }
            resolve_or_queue_result_map(self.configuration, config)?;
        }
        Ok(())
    }

    fn parse_sql_fragments(
        &mut self,
        xml: &str,
        mapper: roxmltree::Node<'_, '_>,
        namespace: &str,
        variables: &AHashMap<String, String>,
    ) -> Result<()> {
        for node in mapper.children().filter(|c| c.has_tag_name("sql")) {
            let id = required_attr(node, "id", variables)?;
            self.configuration
                .add_sql_fragment(&qualify(namespace, &id), node_source(xml, node))?;
        }
        Ok(())
    }

    fn parse_statements(
        &mut self,
        xml: &str,
        mapper: roxmltree::Node<'_, '_>,
        namespace: &str,
    ) -> Result<()> {
        let statement_nodes: Vec<_> = mapper
            .children()
            .filter(|c| {
                matches!(
                    c.tag_name().name(),
                    "select" | "insert" | "update" | "delete"
                )
            })
            .collect();
        // database-id-specific statements win over generic ones with the
        // same id, so they register first
        let (specific, generic): (Vec<_>, Vec<_>) = statement_nodes
            .into_iter()
            .partition(|node| node.has_attribute("databaseId"));
        for node in specific.into_iter().chain(generic) {
            let config = StatementConfig {
                namespace: namespace.to_string(),
                resource: self.resource.clone(),
                raw_xml: node_source(xml, node),
            };
            match try_build_statement(self.configuration, &config)? {
                None => {}
                Some(missing) => {
                    tracing::debug!(reference = %missing, "statement deferred on reference");
                    self.configuration
                        .incomplete
                        .lock()
                        .expect("incomplete queue lock")
                        .statements
                        .push(config);
                }
            }
        }
        Ok(())
    }
}

pub(crate) fn qualify(namespace: &str, id: &str) -> String {
    if id.contains('.') {
        id.to_string()
    } else {
        format!("{namespace}.{id}")
    }
}

fn resolve_or_queue_result_map(
    configuration: &mut Configuration,
    config: ResultMapConfig,
) -> Result<()> {
    match try_resolve_result_map(configuration, &config)? {
        None => Ok(()),
        Some(missing) => {
            tracing::debug!(reference = %missing, "result map deferred on extends");
            configuration
                .incomplete
                .lock()
                .expect("incomplete queue lock")
                .result_maps
                .push(config);
            Ok(())
        }
    }
}

/// Registers the result map unless its `extends` parent is still
/// missing; returns the missing reference in that case.
fn try_resolve_result_map(
    configuration: &mut Configuration,
    config: &ResultMapConfig,
) -> Result<Option<String>> {
    let mut mappings = config.mappings.clone();
    let mut constructor_mappings = config.constructor_mappings.clone();
    let mut discriminator = config.discriminator.clone();

    if let Some(extends) = &config.extends {
        if !configuration.has_result_map(extends) {
            return Ok(Some(extends.clone()));
        }
        let parent = configuration.result_map(extends)?;
        for inherited in &parent.mappings {
            if !mappings.iter().any(|m| m.property == inherited.property) {
                mappings.push(inherited.clone());
            }
        }
        if constructor_mappings.is_empty() {
            constructor_mappings = parent.constructor_mappings.clone();
        }
        if discriminator.is_none() {
            discriminator = parent.discriminator.clone();
        }
    }

    configuration.add_result_map(ResultMap {
        id: config.id.clone(),
        type_name: config.type_name.clone(),
        mappings,
        constructor_mappings,
        discriminator,
        auto_mapping: config.auto_mapping,
    })?;
    Ok(None)
}

fn parse_result_map_element(
    namespace: &str,
    node: roxmltree::Node<'_, '_>,
    variables: &AHashMap<String, String>,
    synthesized: &mut Vec<ResultMapConfig>,
    generated_id: Option<String>,
) -> Result<ResultMapConfig> {
    let id = match attr_value(node, "id", variables) {
        Some(id) => qualify(namespace, &id),
        None => generated_id.ok_or(ConfigError::MissingAttribute {
            element: "resultMap".to_string(),
            attribute: "id",
        })?,
    };
    let type_name = attr_value(node, "type", variables)
        .or_else(|| attr_value(node, "ofType", variables))
        .or_else(|| attr_value(node, "javaType", variables))
        .unwrap_or_else(|| "map".to_string());
    let extends = attr_value(node, "extends", variables).map(|e| qualify(namespace, &e));
    let auto_mapping = bool_attr(node, "autoMapping", variables)?;

    let mut mappings = Vec::new();
    let mut constructor_mappings = Vec::new();
    let mut discriminator = None;

    for child in node.children().filter(|c| c.is_element()) {
        match child.tag_name().name() {
            "constructor" => {
                for (index, arg) in child.children().filter(|c| c.is_element()).enumerate() {
                    let id_flag = arg.has_tag_name("idArg");
                    if !id_flag && !arg.has_tag_name("arg") {
                        return Err(ConfigError::UnknownElement(
                            arg.tag_name().name().to_string(),
                        )
                        .into());
                    }
                    let mut mapping = parse_mapping_attrs(arg, variables)?;
                    if mapping.property.is_empty() {
                        mapping.property = attr_value(arg, "name", variables)
                            .unwrap_or_else(|| format!("arg{index}"));
                    }
                    mapping.id_flag = id_flag;
                    constructor_mappings.push(mapping);
                }
            }
            "id" | "result" => {
                let mut mapping = parse_mapping_attrs(child, variables)?;
                mapping.id_flag = child.has_tag_name("id");
                mappings.push(mapping);
            }
            "association" | "collection" => {
                let many = child.has_tag_name("collection");
                let mut mapping = parse_mapping_attrs(child, variables)?;
                mapping.many = many;
                mapping.nested_select =
                    attr_value(child, "select", variables).map(|s| qualify(namespace, &s));
                mapping.column_prefix = attr_value(child, "columnPrefix", variables);
                if let Some(nested) = attr_value(child, "resultMap", variables) {
                    mapping.nested_result_map = Some(qualify(namespace, &nested));
                } else if mapping.nested_select.is_none()
                    && child.children().any(|c| c.is_element())
                {
                    // anonymous inline map
                    let child_id = format!("{id}_{}_{}", child.tag_name().name(), mapping.property);
                    let inline = parse_result_map_element(
                        namespace,
                        child,
                        variables,
                        synthesized,
                        Some(child_id.clone()),
                    )?;
                    synthesized.push(inline);
                    mapping.nested_result_map = Some(child_id);
                }
                mappings.push(mapping);
            }
            "discriminator" => {
                let column = required_attr(child, "column", variables)?;
                let mut cases = Vec::new();
                for case in child.children().filter(|c| c.has_tag_name("case")) {
                    let value = required_attr(case, "value", variables)?;
                    let target = match attr_value(case, "resultMap", variables) {
                        Some(target) => qualify(namespace, &target),
                        None => {
                            let case_id = format!("{id}_case_{value}");
                            let inline = parse_result_map_element(
                                namespace,
                                case,
                                variables,
                                synthesized,
                                Some(case_id.clone()),
                            )?;
                            synthesized.push(inline);
                            case_id
                        }
                    };
                    cases.push((value, target));
                }
                discriminator = Some(Discriminator {
                    column,
                    lang_type: attr_value(child, "javaType", variables)
                        .map(|raw| LangType::parse(&raw)),
                    sql_type: parse_attr(child, "jdbcType", variables)?,
                    cases,
                });
            }
            other => {
                return Err(ConfigError::UnknownElement(other.to_string()).into());
            }
        }
    }

    Ok(ResultMapConfig {
        namespace: namespace.to_string(),
        id,
        type_name,
        extends,
        auto_mapping,
        mappings,
        constructor_mappings,
        discriminator,
    })
}

fn parse_mapping_attrs(
    node: roxmltree::Node<'_, '_>,
    variables: &AHashMap<String, String>,
) -> Result<ResultMapping> {
    let mut mapping = ResultMapping {
        property: attr_value(node, "property", variables).unwrap_or_default(),
        ..Default::default()
    };
    if let Some(column) = attr_value(node, "column", variables) {
        if let Some(inner) = column
            .strip_prefix('{')
            .and_then(|rest| rest.strip_suffix('}'))
        {
            for pair in inner.split(',') {
                if let Some((property, column)) = pair.split_once('=') {
                    mapping
                        .composite_columns
                        .push((property.trim().to_string(), column.trim().to_string()));
                }
            }
        } else {
            mapping.column = Some(column);
        }
    }
    mapping.lang_type =
        attr_value(node, "javaType", variables).map(|raw| LangType::parse(&raw));
    mapping.sql_type = parse_attr(node, "jdbcType", variables)?;
    mapping.type_handler = attr_value(node, "typeHandler", variables);
    Ok(mapping)
}

/// Attempts to turn a raw statement element into a registered
/// `MappedStatement`. Returns the missing reference when a result map,
/// parameter map, referenced cache or sql fragment has not landed yet.
pub(crate) fn try_build_statement(
    configuration: &mut Configuration,
    config: &StatementConfig,
) -> Result<Option<String>> {
    let variables = configuration.variables.clone();
    let document =
        roxmltree::Document::parse(&config.raw_xml).map_err(|e| xml_error(&config.resource, e))?;
    let node = document.root_element();
    let kind = StatementKind::from_str(node.tag_name().name()).unwrap_or(StatementKind::Unknown);
    let id = required_attr(node, "id", &variables)?;
    let full_id = qualify(&config.namespace, &id);

    // database-id discrimination
    if let Some(required_db) = attr_value(node, "databaseId", &variables) {
        if configuration.database_id.as_deref() != Some(required_db.as_str()) {
            return Ok(None);
        }
    } else if configuration.has_statement(&full_id) {
        // a database-id-specific statement already claimed the id
        return Ok(None);
    }

    // namespace cache: a declared cache-ref that has not resolved yet
    // defers the statement
    let cache = match configuration.effective_cache(&config.namespace) {
        Some(cache) => Some(cache),
        None => match configuration.cache_ref(&config.namespace) {
            Some(referenced) => return Ok(Some(format!("cache '{referenced}'"))),
            None => None,
        },
    };

    // key generation
    let mut key_properties: Vec<String> = attr_value(node, "keyProperty", &variables)
        .map(|raw| raw.split(',').map(|p| p.trim().to_string()).collect())
        .unwrap_or_default();
    let key_columns: Vec<String> = attr_value(node, "keyColumn", &variables)
        .map(|raw| raw.split(',').map(|c| c.trim().to_string()).collect())
        .unwrap_or_default();
    let mut key_generator = KeyGeneratorKind::None;

    if let Some(select_key) = node.children().find(|c| c.has_tag_name("selectKey")) {
        let select_key_id = format!("{full_id}!selectKey");
        if !configuration.has_statement(&select_key_id) {
            let root = match build_statement_node(
                configuration,
                &config.namespace,
                select_key,
                &variables,
            ) {
                Ok(root) => root,
                Err(error) if is_missing_fragment(&error) => {
                    return Ok(Some(error.to_string()));
                }
                Err(error) => return Err(error),
            };
            let result_type = attr_value(select_key, "resultType", &variables)
                .unwrap_or_else(|| "object".to_string());
            let statement = MappedStatement::builder(
                select_key_id.clone(),
                StatementKind::Select,
                Arc::from(build_sql_source(root)?),
            )
            .result_maps(vec![Arc::new(ResultMap::inline(
                format!("{select_key_id}-inline"),
                configuration.type_aliases.resolve(&result_type),
            ))])
            .use_cache(false)
            .flush_cache(false)
            .resource(&config.resource)
            .build();
            configuration.add_mapped_statement(statement)?;
        }
        if let Some(raw) = attr_value(select_key, "keyProperty", &variables) {
            key_properties = raw.split(',').map(|p| p.trim().to_string()).collect();
        }
        let before = attr_value(select_key, "order", &variables)
            .is_some_and(|order| order.eq_ignore_ascii_case("BEFORE"));
        key_generator = KeyGeneratorKind::SelectKey {
            statement_id: select_key_id,
            before,
        };
    } else {
        let use_generated = bool_attr(node, "useGeneratedKeys", &variables)?
            .unwrap_or(configuration.settings.use_generated_keys && kind == StatementKind::Insert);
        if use_generated {
            key_generator = KeyGeneratorKind::Driver;
        }
    }

    // body
    let root = match build_statement_node(configuration, &config.namespace, node, &variables) {
        Ok(root) => root,
        Err(error) if is_missing_fragment(&error) => return Ok(Some(error.to_string())),
        Err(error) => return Err(error),
    };
    let sql_source = build_sql_source(root)?;

    // result shape
    let mut result_maps = Vec::new();
    if let Some(ids) = attr_value(node, "resultMap", &variables) {
        for raw in ids.split(',') {
            let qualified = qualify(&config.namespace, raw.trim());
            if !configuration.has_result_map(&qualified) {
                return Ok(Some(format!("result map '{qualified}'")));
            }
            result_maps.push(configuration.result_map(&qualified)?);
        }
    } else if let Some(result_type) = attr_value(node, "resultType", &variables) {
        result_maps.push(Arc::new(ResultMap::inline(
            format!("{full_id}-inline"),
            configuration.type_aliases.resolve(&result_type),
        )));
    }

    let parameter_map = match attr_value(node, "parameterMap", &variables) {
        Some(raw) => {
            let qualified = qualify(&config.namespace, &raw);
            match configuration.parameter_map(&qualified) {
                Ok(map) => Some(map),
                Err(_) => return Ok(Some(format!("parameter map '{qualified}'"))),
            }
        }
        None => None,
    };

    let statement = MappedStatement::builder(full_id, kind, Arc::from(sql_source))
        .statement_style(
            parse_attr(node, "statementType", &variables)?.unwrap_or_default(),
        )
        .fetch_size(parse_attr(node, "fetchSize", &variables)?)
        .timeout(parse_attr::<u64>(node, "timeout", &variables)?.map(Duration::from_secs))
        .result_set_style(parse_attr::<ResultSetStyle>(node, "resultSetType", &variables)?)
        .flush_cache(
            bool_attr(node, "flushCache", &variables)?
                .unwrap_or(kind != StatementKind::Select),
        )
        .use_cache(
            bool_attr(node, "useCache", &variables)?.unwrap_or(kind == StatementKind::Select),
        )
        .result_ordered(bool_attr(node, "resultOrdered", &variables)?.unwrap_or(false))
        .parameter_map(parameter_map)
        .result_maps(result_maps)
        .key_generator(key_generator)
        .key_properties(key_properties)
        .key_columns(key_columns)
        .database_id(attr_value(node, "databaseId", &variables))
        .cache(cache)
        .resource(&config.resource)
        .build();

    configuration.add_mapped_statement(statement)?;
    Ok(None)
}

/// Re-drains every incomplete queue until empty or a fixed point.
pub(crate) fn drain_incomplete(configuration: &mut Configuration) -> Result<()> {
    loop {
        let taken = {
            let mut queues = configuration
                .incomplete
                .lock()
                .expect("incomplete queue lock");
            std::mem::take(&mut *queues)
        };
        if taken.is_empty() {
            return Ok(());
        }
        let before = taken.len();
        let mut requeue = IncompleteQueues::default();

        for cache_ref in taken.cache_refs {
            if !configuration.has_cache(&cache_ref.referenced_namespace) {
                requeue.cache_refs.push(cache_ref);
            }
        }
        for result_map in taken.result_maps {
            if try_resolve_result_map(configuration, &result_map)?.is_some() {
                requeue.result_maps.push(result_map);
            }
        }
        for statement in taken.statements {
            if try_build_statement(configuration, &statement)?.is_some() {
                requeue.statements.push(statement);
            }
        }

        let after = requeue.len();
        {
            let mut queues = configuration
                .incomplete
                .lock()
                .expect("incomplete queue lock");
            queues.cache_refs.extend(requeue.cache_refs);
            queues.result_maps.extend(requeue.result_maps);
            queues.statements.extend(requeue.statements);
        }
        if after == 0 || after == before {
            return Ok(());
        }
    }
}

/// The end-of-load check: anything still queued fails with its first
/// missing reference.
pub(crate) fn check_incomplete(configuration: &mut Configuration) -> Result<()> {
    let (cache_ref, result_map, statement) = {
        let queues = configuration
            .incomplete
            .lock()
            .expect("incomplete queue lock");
        (
            queues.cache_refs.first().cloned(),
            queues.result_maps.first().cloned(),
            queues.statements.first().cloned(),
        )
    };
    if let Some(cache_ref) = cache_ref {
        return Err(ConfigError::Unresolved {
            kind: "cache",
            reference: cache_ref.referenced_namespace,
        }
        .into());
    }
    if let Some(result_map) = result_map {
        if let Some(missing) = try_resolve_result_map(configuration, &result_map)? {
            return Err(ConfigError::Unresolved {
                kind: "result map",
                reference: missing,
            }
            .into());
        }
    }
    if let Some(statement) = statement {
        if let Some(missing) = try_build_statement(configuration, &statement)? {
            return Err(ConfigError::Unresolved {
                kind: "statement reference",
                reference: missing,
            }
            .into());
        }
    }
    Ok(())
}
