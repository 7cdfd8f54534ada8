//! Parses the root `<configuration>` document: properties, settings,
//! aliases, plugins, environments, database-id provider, type handlers
//! and mapper sources, in that order.

use ahash::AHashMap;
use squill_core::errors::{ConfigError, Result};
use squill_core::types::{LangType, SqlType};

use crate::builder::xml_mapper::{XmlMapperBuilder, check_incomplete, drain_incomplete};
use crate::builder::{
    attr, attr_value, parse_properties_text, property_children, required_attr, xml_error,
};
use crate::config::{Configuration, DriverRegistry, Environment};
use crate::datasource::build_data_source;
use crate::io::ResourceResolver;
use crate::plugin::Interceptor;
use crate::transaction::{
    LocalTransactionFactory, ManagedTransactionFactory, TransactionFactory,
};

/// Element order enforced on `<configuration>` children.
fn element_rank(name: &str) -> Option<u8> {
    Some(match name {
        "properties" => 0,
        "settings" => 1,
        "typeAliases" => 2,
        "plugins" => 3,
        "objectFactory" => 4,
        "objectWrapperFactory" => 5,
        "reflectorFactory" => 6,
        "environments" => 7,
        "databaseIdProvider" => 8,
        "typeHandlers" => 9,
        "mappers" => 10,
        _ => return None,
    })
}

pub struct XmlConfigBuilder {
    resolver: ResourceResolver,
    drivers: DriverRegistry,
    interceptors: AHashMap<String, Box<dyn Interceptor>>,
    environment_override: Option<String>,
    external_properties: AHashMap<String, String>,
}

impl XmlConfigBuilder {
    pub fn new(resolver: ResourceResolver, drivers: DriverRegistry) -> Self {
        Self {
            resolver,
            drivers,
            interceptors: AHashMap::new(),
            environment_override: None,
            external_properties: AHashMap::new(),
        }
    }

    pub fn environment(mut self, environment: Option<&str>) -> Self {
        self.environment_override = environment.map(str::to_string);
        self
    }

    pub fn properties(mut self, properties: &[(&str, &str)]) -> Self {
        for (key, value) in properties {
            self.external_properties
                .insert(key.to_string(), value.to_string());
        }
        self
    }

    /// Makes a named interceptor available to `<plugins>`.
    pub fn register_interceptor(
        mut self,
        name: impl Into<String>,
        interceptor: Box<dyn Interceptor>,
    ) -> Self {
        self.interceptors.insert(name.into(), interceptor);
        self
    }

    pub fn parse(mut self, xml: &str) -> Result<Configuration> {
        let document =
            roxmltree::Document::parse(xml).map_err(|e| xml_error("<configuration>", e))?;
        let root = document.root_element();
        if !root.has_tag_name("configuration") {
            return Err(
                ConfigError::UnknownElement(root.tag_name().name().to_string()).into(),
            );
        }

        let mut configuration = Configuration::new();
        configuration.drivers = self.drivers.clone();

        let mut last_rank = 0u8;
        for node in root.children().filter(|c| c.is_element()) {
            let name = node.tag_name().name();
            let rank = element_rank(name)
                .ok_or_else(|| ConfigError::UnknownElement(name.to_string()))?;
            if rank < last_rank {
                return Err(ConfigError::InvalidValue {
                    what: "configuration element order".to_string(),
                    value: name.to_string(),
                }
                .into());
            }
            last_rank = rank;

            match name {
                "properties" => self.parse_properties(&mut configuration, node)?,
                "settings" => self.parse_settings(&mut configuration, node)?,
                "typeAliases" => self.parse_type_aliases(&mut configuration, node)?,
                "plugins" => self.parse_plugins(&mut configuration, node)?,
                "objectFactory" | "objectWrapperFactory" => {
                    // object creation is the value model's business here;
                    // the elements are tolerated for portability
                    tracing::debug!(element = name, "ignoring factory declaration");
                }
                "reflectorFactory" => {
                    // only the default reflector ships; the element is
                    // accepted so shared configurations keep loading
                    tracing::debug!("using the built-in reflector factory");
                }
                "environments" => self.parse_environments(&mut configuration, node)?,
                "databaseIdProvider" => self.parse_database_id(&mut configuration, node)?,
                "typeHandlers" => self.parse_type_handlers(&mut configuration, node)?,
                "mappers" => self.parse_mappers(&mut configuration, node)?,
                _ => unreachable!("ranked above"),
            }
        }

        drain_incomplete(&mut configuration)?;
        check_incomplete(&mut configuration)?;
        Ok(configuration)
    }

    fn parse_properties(
        &mut self,
        configuration: &mut Configuration,
        node: roxmltree::Node<'_, '_>,
    ) -> Result<()> {
        // inline children first, then file/url contents, then runtime
        // properties override everything
        let empty = AHashMap::new();
        let mut variables = property_children(node, &empty)?;
        if let Some(resource) = attr(node, "resource") {
            let text = self.resolver.read_to_string(resource)?;
            variables.extend(parse_properties_text(&text));
        } else if let Some(url) = attr(node, "url") {
            let text = self.resolver.read_to_string(url)?;
            variables.extend(parse_properties_text(&text));
        }
        variables.extend(
            self.external_properties
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        configuration.variables = variables;
        Ok(())
    }

    fn parse_settings(
        &mut self,
        configuration: &mut Configuration,
        node: roxmltree::Node<'_, '_>,
    ) -> Result<()> {
        let variables = configuration.variables.clone();
        for setting in node.children().filter(|c| c.has_tag_name("setting")) {
            let name = required_attr(setting, "name", &variables)?;
            let value = required_attr(setting, "value", &variables)?;
            configuration.settings.apply(&name, &value)?;
        }
        Ok(())
    }

    fn parse_type_aliases(
        &mut self,
        configuration: &mut Configuration,
        node: roxmltree::Node<'_, '_>,
    ) -> Result<()> {
        let variables = configuration.variables.clone();
        for child in node.children().filter(|c| c.is_element()) {
            match child.tag_name().name() {
                "typeAlias" => {
                    let alias = required_attr(child, "alias", &variables)?;
                    let target = required_attr(child, "type", &variables)?;
                    configuration.type_aliases.register(alias, target)?;
                }
                "package" => {
                    // package scans register code types; shapes here come
                    // from serde, so there is nothing to scan
                    tracing::warn!("typeAliases <package> scan has no effect");
                }
                other => {
                    return Err(ConfigError::UnknownElement(other.to_string()).into());
                }
            }
        }
        Ok(())
    }

    fn parse_plugins(
        &mut self,
        configuration: &mut Configuration,
        node: roxmltree::Node<'_, '_>,
    ) -> Result<()> {
        let variables = configuration.variables.clone();
        for plugin in node.children().filter(|c| c.has_tag_name("plugin")) {
            let name = required_attr(plugin, "interceptor", &variables)?;
            let mut interceptor =
                self.interceptors
                    .remove(&name)
                    .ok_or_else(|| ConfigError::Unresolved {
                        kind: "plugin",
                        reference: name.clone(),
                    })?;
            let properties = property_children(plugin, &variables)?;
            interceptor.set_properties(&properties);
            configuration.add_interceptor(interceptor.into());
        }
        Ok(())
    }

    fn parse_environments(
        &mut self,
        configuration: &mut Configuration,
        node: roxmltree::Node<'_, '_>,
    ) -> Result<()> {
        let variables = configuration.variables.clone();
        let default_id = required_attr(node, "default", &variables)?;
        let wanted = self
            .environment_override
            .clone()
            .unwrap_or(default_id);

        for environment in node.children().filter(|c| c.has_tag_name("environment")) {
            let id = required_attr(environment, "id", &variables)?;
            if id != wanted {
                continue;
            }

            let tx_node = environment
                .children()
                .find(|c| c.has_tag_name("transactionManager"))
                .ok_or(ConfigError::MissingAttribute {
                    element: "environment".to_string(),
                    attribute: "transactionManager",
                })?;
            let tx_kind = required_attr(tx_node, "type", &variables)?;
            let tx_properties = property_children(tx_node, &variables)?;
            let transaction_factory: std::sync::Arc<dyn TransactionFactory> =
                match tx_kind.to_uppercase().as_str() {
                    "LOCAL" => std::sync::Arc::new(LocalTransactionFactory),
                    "MANAGED" => std::sync::Arc::new(ManagedTransactionFactory {
                        close_connection: tx_properties
                            .get("closeConnection")
                            .is_none_or(|raw| raw.parse().unwrap_or(true)),
                    }),
                    other => {
                        return Err(ConfigError::InvalidValue {
                            what: "transactionManager type".to_string(),
                            value: other.to_string(),
                        }
                        .into());
                    }
                };

            let ds_node = environment
                .children()
                .find(|c| c.has_tag_name("dataSource"))
                .ok_or(ConfigError::MissingAttribute {
                    element: "environment".to_string(),
                    attribute: "dataSource",
                })?;
            let ds_kind = required_attr(ds_node, "type", &variables)?;
            let ds_properties = property_children(ds_node, &variables)?;
            let data_source =
                build_data_source(&ds_kind, &ds_properties, &configuration.drivers)?;

            configuration.environment = Some(Environment {
                id,
                transaction_factory,
                data_source,
            });
            return Ok(());
        }
        Err(ConfigError::Unresolved {
            kind: "environment",
            reference: wanted,
        }
        .into())
    }

    /// `DB_VENDOR`: match the connection's product string against the
    /// declared property names; the matching value becomes the database
    /// id consulted by `databaseId` attributes and `_databaseId`.
    fn parse_database_id(
        &mut self,
        configuration: &mut Configuration,
        node: roxmltree::Node<'_, '_>,
    ) -> Result<()> {
        let variables = configuration.variables.clone();
        let kind = required_attr(node, "type", &variables)?;
        if configuration.type_aliases.resolve(&kind) != "db_vendor" {
            return Err(ConfigError::InvalidValue {
                what: "databaseIdProvider type".to_string(),
                value: kind,
            }
            .into());
        }
        let vendors = property_children(node, &variables)?;
        let Some(environment) = &configuration.environment else {
            return Ok(());
        };
        let mut connection = environment.data_source.connection()?;
        let product = connection.product_name();
        let _ = connection.close();
        configuration.database_id = vendors
            .iter()
            .find(|(vendor, _)| product.contains(vendor.as_str()))
            .map(|(_, id)| id.clone());
        tracing::debug!(product = %product, database_id = ?configuration.database_id, "resolved database id");
        Ok(())
    }

    fn parse_type_handlers(
        &mut self,
        configuration: &mut Configuration,
        node: roxmltree::Node<'_, '_>,
    ) -> Result<()> {
        let variables = configuration.variables.clone();
        for child in node.children().filter(|c| c.is_element()) {
            match child.tag_name().name() {
                "typeHandler" => {
                    let handler_name = required_attr(child, "handler", &variables)?;
                    let handler = configuration
                        .type_handlers
                        .get_named(&handler_name)
                        .ok_or_else(|| ConfigError::Unresolved {
                            kind: "type handler",
                            reference: handler_name.clone(),
                        })?;
                    let lang = attr_value(child, "javaType", &variables)
                        .map(|raw| LangType::parse(&configuration.type_aliases.resolve(&raw)));
                    let sql = match attr_value(child, "jdbcType", &variables) {
                        Some(raw) => Some(raw.parse::<SqlType>().map_err(|_| {
                            ConfigError::InvalidValue {
                                what: "jdbcType".to_string(),
                                value: raw,
                            }
                        })?),
                        None => None,
                    };
                    match lang {
                        Some(lang) => {
                            configuration.type_handlers.register_for(lang, sql, handler)
                        }
                        None => configuration.type_handlers.register(handler),
                    }
                }
                "package" => {
                    // handlers are code registrations; a package scan has
                    // nothing on disk to discover
                    tracing::warn!("typeHandlers <package> scan has no effect");
                }
                other => {
                    return Err(ConfigError::UnknownElement(other.to_string()).into());
                }
            }
        }
        Ok(())
    }

    fn parse_mappers(
        &mut self,
        configuration: &mut Configuration,
        node: roxmltree::Node<'_, '_>,
    ) -> Result<()> {
        let variables = configuration.variables.clone();
        for child in node.children().filter(|c| c.is_element()) {
            match child.tag_name().name() {
                "mapper" => {
                    let resource = attr_value(child, "resource", &variables)
                        .or_else(|| attr_value(child, "url", &variables))
                        .ok_or(ConfigError::MissingAttribute {
                            element: "mapper".to_string(),
                            attribute: "resource",
                        })?;
                    let xml = self.resolver.read_to_string(&resource)?;
                    XmlMapperBuilder::new(configuration, &resource).parse(&xml)?;
                }
                "package" => {
                    let package = required_attr(child, "name", &variables)?;
                    for resource in self.resolver.list_package(&package)? {
                        if !resource.ends_with(".xml") {
                            continue;
                        }
                        let xml = self.resolver.read_to_string(&resource)?;
                        XmlMapperBuilder::new(configuration, &resource).parse(&xml)?;
                    }
                }
                other => {
                    return Err(ConfigError::UnknownElement(other.to_string()).into());
                }
            }
        }
        Ok(())
    }
}
