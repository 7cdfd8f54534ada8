//! Compiles a statement element's children into the dynamic SQL node
//! tree. `<include>` fragments are cloned from their `<sql>` source with
//! declared properties substituted, recursively.

use ahash::AHashMap;
use squill_core::errors::{ConfigError, Error, Result};
use squill_core::expr::Expression;
use squill_core::sql::text::{contains_dollar_token, substitute_dollar};
use squill_core::sql::nodes::parse_overrides;
use squill_core::sql::SqlNode;

use crate::builder::{attr_value, required_attr, xml_error};
use crate::config::Configuration;

/// Distinguishes a missing `<sql>` fragment (retryable) from a fatal
/// build error.
pub(crate) fn is_missing_fragment(error: &Error) -> bool {
    matches!(
        error.root(),
        Error::Config(ConfigError::Unresolved {
            kind: "sql fragment",
            ..
        })
    )
}

pub(crate) fn build_statement_node(
    configuration: &Configuration,
    namespace: &str,
    node: roxmltree::Node<'_, '_>,
    variables: &AHashMap<String, String>,
) -> Result<SqlNode> {
    let children = build_children(configuration, namespace, node, variables)?;
    Ok(SqlNode::Mixed(children))
}

fn build_children(
    configuration: &Configuration,
    namespace: &str,
    node: roxmltree::Node<'_, '_>,
    variables: &AHashMap<String, String>,
) -> Result<Vec<SqlNode>> {
    let mut children = Vec::new();
    for child in node.children() {
        if child.is_text() {
            if let Some(text) = child.text() {
                let substituted = substitute_known(text, variables);
                if substituted.trim().is_empty() {
                    continue;
                }
                if contains_dollar_token(&substituted) {
                    children.push(SqlNode::Text(substituted));
                } else {
                    children.push(SqlNode::Static(substituted));
                }
            }
            continue;
        }
        if !child.is_element() {
            continue;
        }
        children.push(build_element(configuration, namespace, child, variables)?);
    }
    Ok(children)
}

fn build_element(
    configuration: &Configuration,
    namespace: &str,
    node: roxmltree::Node<'_, '_>,
    variables: &AHashMap<String, String>,
) -> Result<SqlNode> {
    let contents =
        |variables: &AHashMap<String, String>| -> Result<Box<SqlNode>> {
            Ok(Box::new(SqlNode::Mixed(build_children(
                configuration,
                namespace,
                node,
                variables,
            )?)))
        };

    match node.tag_name().name() {
        "if" => {
            let test = required_attr(node, "test", variables)?;
            Ok(SqlNode::If {
                test: Expression::parse(&test)?,
                contents: contents(variables)?,
            })
        }
        "where" => Ok(SqlNode::where_node(*contents(variables)?)),
        "set" => Ok(SqlNode::set_node(*contents(variables)?)),
        "trim" => Ok(SqlNode::Trim {
            prefix: attr_value(node, "prefix", variables),
            suffix: attr_value(node, "suffix", variables),
            prefix_overrides: attr_value(node, "prefixOverrides", variables)
                .map(|o| parse_overrides(&o))
                .unwrap_or_default(),
            suffix_overrides: attr_value(node, "suffixOverrides", variables)
                .map(|o| parse_overrides(&o))
                .unwrap_or_default(),
            contents: contents(variables)?,
        }),
        "choose" => {
            let mut whens = Vec::new();
            let mut otherwise = None;
            for branch in node.children().filter(|c| c.is_element()) {
                match branch.tag_name().name() {
                    "when" => {
                        let test = required_attr(branch, "test", variables)?;
                        whens.push((
                            Expression::parse(&test)?,
                            SqlNode::Mixed(build_children(
                                configuration,
                                namespace,
                                branch,
                                variables,
                            )?),
                        ));
                    }
                    "otherwise" => {
                        otherwise = Some(Box::new(SqlNode::Mixed(build_children(
                            configuration,
                            namespace,
                            branch,
                            variables,
                        )?)));
                    }
                    other => {
                        return Err(ConfigError::UnknownElement(format!("choose/{other}")).into());
                    }
                }
            }
            Ok(SqlNode::Choose { whens, otherwise })
        }
        "foreach" => {
            let collection = required_attr(node, "collection", variables)?;
            Ok(SqlNode::Foreach {
                collection: Expression::parse(&collection)?,
                item: attr_value(node, "item", variables),
                index: attr_value(node, "index", variables),
                open: attr_value(node, "open", variables),
                close: attr_value(node, "close", variables),
                separator: attr_value(node, "separator", variables),
                contents: contents(variables)?,
            })
        }
        "bind" => {
            let name = required_attr(node, "name", variables)?;
            let value = required_attr(node, "value", variables)?;
            Ok(SqlNode::Bind {
                name,
                value: Expression::parse(&value)?,
            })
        }
        "include" => build_include(configuration, namespace, node, variables),
        // selectKey is the statement parser's business, not SQL text
        "selectKey" => Ok(SqlNode::Mixed(Vec::new())),
        other => Err(ConfigError::UnknownElement(other.to_string()).into()),
    }
}

/// Resolves `<include refid="…">`: clones the referenced `<sql>` subtree,
/// layering the declared `<property>` values over the current variables,
/// and recurses into nested includes.
fn build_include(
    configuration: &Configuration,
    namespace: &str,
    node: roxmltree::Node<'_, '_>,
    variables: &AHashMap<String, String>,
) -> Result<SqlNode> {
    let refid = required_attr(node, "refid", variables)?;

    let mut scoped = variables.clone();
    for property in node.children().filter(|c| c.has_tag_name("property")) {
        let name = required_attr(property, "name", variables)?;
        let value = required_attr(property, "value", variables)?;
        scoped.insert(name, value);
    }

    // fragments may live in another namespace; nested includes resolve
    // relative to where the fragment was declared
    let qualified = format!("{namespace}.{refid}");
    let (fragment_xml, fragment_namespace) = match configuration.sql_fragment(&qualified) {
        Some(xml) => (xml.to_string(), namespace.to_string()),
        None => {
            let xml = configuration
                .sql_fragment(&refid)
                .ok_or_else(|| ConfigError::Unresolved {
                    kind: "sql fragment",
                    reference: qualified.clone(),
                })?;
            let declared_in = refid
                .rsplit_once('.')
                .map_or(namespace, |(ns, _)| ns)
                .to_string();
            (xml.to_string(), declared_in)
        }
    };

    let document = roxmltree::Document::parse(&fragment_xml)
        .map_err(|e| xml_error(&format!("sql fragment '{refid}'"), e))?;
    let children = build_children(
        configuration,
        &fragment_namespace,
        document.root_element(),
        &scoped,
    )?;
    Ok(SqlNode::Mixed(children))
}

/// Config-time `${…}` substitution for statement text: only names present
/// in the variables map are replaced; every other token survives intact
/// for render time, default suffix included.
fn substitute_known(text: &str, variables: &AHashMap<String, String>) -> String {
    if variables.is_empty() {
        return text.to_string();
    }
    substitute_dollar(text, |token| {
        let name = token.split_once(':').map_or(token, |(n, _)| n).trim();
        match variables.get(name) {
            Some(value) => Ok(value.clone()),
            None => Ok(format!("${{{token}}}")),
        }
    })
    .unwrap_or_else(|_| text.to_string())
}

#[cfg(test)]
mod tests {
    use squill_core::Value;
    use squill_core::sql::{DynamicSqlSource, SqlSource};

    use super::*;

    fn build(xml: &str) -> SqlNode {
        let configuration = Configuration::new();
        let document = roxmltree::Document::parse(xml).unwrap();
        build_statement_node(
            &configuration,
            "test",
            document.root_element(),
            &AHashMap::new(),
        )
        .unwrap()
    }

    #[test]
    fn builds_where_if_trees_from_xml() {
        let node = build(
            r#"<select id="find">
                 select * from users
                 <where>
                   <if test="age != null">AND age = #{age}</if>
                 </where>
               </select>"#,
        );
        let source = DynamicSqlSource::new(node);
        let parameter = Value::from_iter([("age".to_string(), Value::Int(10))]);
        let bound = source.bound_sql(&parameter, None).unwrap();
        assert_eq!(bound.sql, "select * from users WHERE age = ?");
    }

    #[test]
    fn unknown_dynamic_elements_are_rejected() {
        let configuration = Configuration::new();
        let document =
            roxmltree::Document::parse("<select><wobble/></select>").unwrap();
        let result = build_statement_node(
            &configuration,
            "test",
            document.root_element(),
            &AHashMap::new(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn include_pulls_fragments_with_properties() {
        let mut configuration = Configuration::new();
        configuration
            .add_sql_fragment(
                "test.columns",
                "<sql id=\"columns\">id, ${alias}.name</sql>".to_string(),
            )
            .unwrap();
        let document = roxmltree::Document::parse(
            r#"<select>select <include refid="columns"><property name="alias" value="u"/></include> from users u</select>"#,
        )
        .unwrap();
        let node = build_statement_node(
            &configuration,
            "test",
            document.root_element(),
            &AHashMap::new(),
        )
        .unwrap();
        let source = DynamicSqlSource::new(node);
        let bound = source.bound_sql(&Value::Null, None).unwrap();
        assert_eq!(bound.sql, "select id, u.name from users u");
    }

    #[test]
    fn missing_fragment_is_flagged_retryable() {
        let configuration = Configuration::new();
        let document =
            roxmltree::Document::parse(r#"<select><include refid="nope"/></select>"#).unwrap();
        let error = build_statement_node(
            &configuration,
            "test",
            document.root_element(),
            &AHashMap::new(),
        )
        .unwrap_err();
        assert!(is_missing_fragment(&error));
    }
}
