use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;

use crate::errors::{ConfigError, Result};
use crate::sql::{ParameterMapping, ParameterMode};
use crate::types::{LangType, SqlType};

static HASH_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#\{([^}]*)\}").expect("hash token pattern"));
static DOLLAR_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]*)\}").expect("dollar token pattern"));

/// Rewrites every `#{…}` token to a `?` placeholder, emitting the ordered
/// parameter mappings alongside.
pub fn scan_placeholders(text: &str) -> Result<(String, Vec<ParameterMapping>)> {
    let mut mappings = Vec::new();
    let mut out = String::with_capacity(text.len());
    let mut last_pos = 0;
    for cap in HASH_TOKEN.captures_iter(text) {
        let span = cap.get(0).expect("whole match").range();
        out.push_str(&text[last_pos..span.start]);
        out.push('?');
        mappings.push(parse_parameter(&cap[1])?);
        last_pos = span.end;
    }
    out.push_str(&text[last_pos..]);
    Ok((out, mappings))
}

/// Replaces every `${…}` token using `resolve`. The resolver sees the raw
/// token content, including any `:default` suffix.
pub fn substitute_dollar(
    text: &str,
    mut resolve: impl FnMut(&str) -> Result<String>,
) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut last_pos = 0;
    for cap in DOLLAR_TOKEN.captures_iter(text) {
        let span = cap.get(0).expect("whole match").range();
        out.push_str(&text[last_pos..span.start]);
        out.push_str(&resolve(&cap[1])?);
        last_pos = span.end;
    }
    out.push_str(&text[last_pos..]);
    Ok(out)
}

pub fn contains_dollar_token(text: &str) -> bool {
    DOLLAR_TOKEN.is_match(text)
}

/// Rewrites `#{item…}`/`#{index…}` references inside a foreach body to
/// the synthetic `__frch_<name>_<n>` bindings registered on the context.
pub fn rewrite_foreach_tokens(
    text: &str,
    item: Option<&str>,
    index: Option<&str>,
    iteration: usize,
) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_pos = 0;
    for cap in HASH_TOKEN.captures_iter(text) {
        let span = cap.get(0).expect("whole match").range();
        out.push_str(&text[last_pos..span.start]);
        let content = &cap[1];
        let (property, attrs) = match content.find(',') {
            Some(comma) => (&content[..comma], &content[comma..]),
            None => (content, ""),
        };
        let property = property.trim();
        let rewritten = [item, index]
            .into_iter()
            .flatten()
            .find_map(|name| {
                rewrite_property(property, name, iteration)
                    .map(|p| format!("#{{{p}{attrs}}}"))
            })
            .unwrap_or_else(|| format!("#{{{content}}}"));
        out.push_str(&rewritten);
        last_pos = span.end;
    }
    out.push_str(&text[last_pos..]);
    out
}

fn rewrite_property(property: &str, name: &str, iteration: usize) -> Option<String> {
    if property == name {
        Some(format!("__frch_{name}_{iteration}"))
    } else if let Some(rest) = property.strip_prefix(name)
        && rest.starts_with(['.', '['])
    {
        Some(format!("__frch_{name}_{iteration}{rest}"))
    } else {
        None
    }
}

/// Parses the inside of a `#{…}` token: the property path plus optional
/// `key=value` attributes.
fn parse_parameter(content: &str) -> Result<ParameterMapping, crate::errors::Error> {
    let mut parts = content.split(',');
    let property = parts
        .next()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ConfigError::InvalidValue {
            what: "parameter placeholder".to_string(),
            value: content.to_string(),
        })?;
    let mut mapping = ParameterMapping::of(property);
    for attr in parts {
        let (key, value) = attr.split_once('=').ok_or_else(|| ConfigError::InvalidValue {
            what: "parameter attribute".to_string(),
            value: attr.to_string(),
        })?;
        let (key, value) = (key.trim(), value.trim());
        match key {
            "javaType" => mapping.lang_type = Some(LangType::parse(value)),
            "jdbcType" => {
                mapping.sql_type =
                    Some(
                        SqlType::from_str(value).map_err(|_| ConfigError::InvalidValue {
                            what: "jdbcType".to_string(),
                            value: value.to_string(),
                        })?,
                    )
            }
            "mode" => {
                mapping.mode =
                    ParameterMode::from_str(value).map_err(|_| ConfigError::InvalidValue {
                        what: "parameter mode".to_string(),
                        value: value.to_string(),
                    })?
            }
            "typeHandler" => mapping.type_handler = Some(value.to_string()),
            "numericScale" => {
                mapping.numeric_scale =
                    Some(value.parse().map_err(|_| ConfigError::InvalidValue {
                        what: "numericScale".to_string(),
                        value: value.to_string(),
                    })?)
            }
            // jdbcTypeName and resultMap are accepted for compatibility
            // with statements ported from other runtimes.
            "jdbcTypeName" | "resultMap" => {}
            unknown => {
                return Err(ConfigError::InvalidValue {
                    what: "parameter attribute name".to_string(),
                    value: unknown.to_string(),
                }
                .into());
            }
        }
    }
    Ok(mapping)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn scans_placeholders_in_order() {
        let (sql, mappings) =
            scan_placeholders("insert into t (a, b) values (#{a}, #{b,jdbcType=INTEGER})")
                .unwrap();
        assert_eq!(sql, "insert into t (a, b) values (?, ?)");
        assert_eq!(mappings[0].property, "a");
        assert_eq!(mappings[1].property, "b");
        assert_eq!(mappings[1].sql_type, Some(SqlType::Integer));
    }

    #[test]
    fn parses_full_attribute_set() {
        let (_, mappings) = scan_placeholders(
            "#{amount, javaType=double, jdbcType=NUMERIC, mode=INOUT, typeHandler=money, numericScale=2}",
        )
        .unwrap();
        let m = &mappings[0];
        assert_eq!(m.property, "amount");
        assert_eq!(m.lang_type, Some(LangType::Double));
        assert_eq!(m.sql_type, Some(SqlType::Numeric));
        assert_eq!(m.mode, ParameterMode::Inout);
        assert_eq!(m.type_handler.as_deref(), Some("money"));
        assert_eq!(m.numeric_scale, Some(2));
    }

    #[test]
    fn rejects_unknown_attributes() {
        assert!(scan_placeholders("#{a, wible=1}").is_err());
    }

    #[test]
    fn dollar_substitution_keeps_surrounding_text() {
        let out = substitute_dollar("select * from ${table} where 1=1", |name| {
            assert_eq!(name, "table");
            Ok("users".to_string())
        })
        .unwrap();
        assert_eq!(out, "select * from users where 1=1");
    }

    #[test]
    fn rewrites_item_references_only() {
        let out = rewrite_foreach_tokens("#{id} + #{other}", Some("id"), None, 2);
        assert_eq!(out, "#{__frch_id_2} + #{other}");
        let nested = rewrite_foreach_tokens("#{item.sku, jdbcType=VARCHAR}", Some("item"), None, 0);
        assert_eq!(nested, "#{__frch_item_0.sku, jdbcType=VARCHAR}");
    }
}
