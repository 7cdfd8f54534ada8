//! Configuration assembly: the root XML builder, the per-mapper-file
//! builder, and the script builder that compiles statement bodies into
//! node trees.

mod script;
mod xml_config;
mod xml_mapper;

pub use xml_config::XmlConfigBuilder;
pub use xml_mapper::XmlMapperBuilder;

use ahash::AHashMap;
use squill_core::errors::{ConfigError, Result};
use squill_core::sql::text::substitute_dollar;

/// Substitutes `${name}` / `${name:default}` from the variables map.
/// Unknown names without a default keep their token untouched, so
/// render-time placeholders survive configuration time.
pub(crate) fn substitute_variables(text: &str, variables: &AHashMap<String, String>) -> String {
    let substituted = substitute_dollar(text, |token| {
        let (name, default) = match split_token_default(token) {
            Some((name, default)) => (name, Some(default)),
            None => (token.trim(), None),
        };
        if let Some(value) = variables.get(name) {
            Ok(value.clone())
        } else if let Some(default) = default {
            Ok(default.to_string())
        } else {
            Ok(format!("${{{token}}}"))
        }
    });
    substituted.unwrap_or_else(|_| text.to_string())
}

fn split_token_default(token: &str) -> Option<(&str, &str)> {
    token
        .split_once(':')
        .map(|(name, default)| (name.trim(), default.trim()))
}

// -- small roxmltree helpers shared by the builders -------------------------

pub(crate) fn attr<'a>(node: roxmltree::Node<'a, '_>, name: &str) -> Option<&'a str> {
    node.attribute(name)
}

pub(crate) fn attr_value(
    node: roxmltree::Node<'_, '_>,
    name: &str,
    variables: &AHashMap<String, String>,
) -> Option<String> {
    node.attribute(name)
        .map(|raw| substitute_variables(raw, variables))
}

pub(crate) fn required_attr(
    node: roxmltree::Node<'_, '_>,
    name: &'static str,
    variables: &AHashMap<String, String>,
) -> Result<String, ConfigError> {
    attr_value(node, name, variables).ok_or_else(|| ConfigError::MissingAttribute {
        element: node.tag_name().name().to_string(),
        attribute: name,
    })
}

pub(crate) fn bool_attr(
    node: roxmltree::Node<'_, '_>,
    name: &str,
    variables: &AHashMap<String, String>,
) -> Result<Option<bool>, ConfigError> {
    parse_attr(node, name, variables)
}

pub(crate) fn parse_attr<T: std::str::FromStr>(
    node: roxmltree::Node<'_, '_>,
    name: &str,
    variables: &AHashMap<String, String>,
) -> Result<Option<T>, ConfigError> {
    match attr_value(node, name, variables) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                what: format!(
                    "attribute '{name}' of <{}>",
                    node.tag_name().name()
                ),
                value: raw,
            }),
    }
}

/// Collects `<property name="…" value="…"/>` children.
pub(crate) fn property_children(
    node: roxmltree::Node<'_, '_>,
    variables: &AHashMap<String, String>,
) -> Result<AHashMap<String, String>, ConfigError> {
    let mut properties = AHashMap::new();
    for child in node.children().filter(|c| c.has_tag_name("property")) {
        let name = required_attr(child, "name", variables)?;
        let value = required_attr(child, "value", variables)?;
        properties.insert(name, value);
    }
    Ok(properties)
}

pub(crate) fn xml_error(resource: &str, error: roxmltree::Error) -> ConfigError {
    ConfigError::Xml {
        resource: resource.to_string(),
        message: error.to_string(),
    }
}

/// The raw source text of an element, used to stash `<sql>` fragments and
/// incomplete statements for later re-parsing.
pub(crate) fn node_source(document_text: &str, node: roxmltree::Node<'_, '_>) -> String {
    document_text[node.range()].to_string()
}

/// Parses a java-style properties file: `key=value` lines, `#`/`!`
/// comments.
pub(crate) fn parse_properties_text(text: &str) -> AHashMap<String, String> {
    let mut properties = AHashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            properties.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    properties
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> AHashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn substitutes_known_variables() {
        let variables = vars(&[("name", "products")]);
        assert_eq!(
            substitute_variables("select * from ${name}", &variables),
            "select * from products"
        );
    }

    #[test]
    fn default_applies_when_variable_is_missing() {
        assert_eq!(
            substitute_variables("${name:default}", &vars(&[])),
            "default"
        );
        assert_eq!(
            substitute_variables("${name:default}", &vars(&[("name", "products")])),
            "products"
        );
    }

    #[test]
    fn unknown_tokens_survive_for_render_time() {
        assert_eq!(
            substitute_variables("where x = ${later}", &vars(&[])),
            "where x = ${later}"
        );
    }

    #[test]
    fn parses_properties_lines() {
        let properties = parse_properties_text("# comment\nurl = mem://db\nuser=root\n");
        assert_eq!(properties.get("url").unwrap(), "mem://db");
        assert_eq!(properties.get("user").unwrap(), "root");
    }
}
