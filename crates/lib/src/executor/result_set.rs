//! Projects result rows into values: explicit result mappings,
//! automapping, discriminators, nested selects and nested (joined)
//! result maps with grouping.

use ahash::AHashSet;
use indexmap::IndexMap;
use squill_core::Value;
use squill_core::cache::CacheKey;
use squill_core::driver::{ResultSetData, RowView};
use squill_core::errors::Result;
use squill_core::reflect;
use squill_core::types::handlers::ColumnRef;
use squill_core::types::LangType;

use crate::config::{AutoMappingBehavior, Configuration};
use crate::executor::lang_of_value;
use crate::mapping::{MappedStatement, ResultMap, ResultMapping};
use crate::session::RowBounds;

pub(crate) type NestedQuery<'a> = dyn FnMut(&str, Value) -> Result<Vec<Value>> + 'a;

pub(crate) struct ResultSetHandler<'c> {
    configuration: &'c Configuration,
    statement: &'c MappedStatement,
    bounds: RowBounds,
}

impl<'c> ResultSetHandler<'c> {
    pub(crate) fn new(
        configuration: &'c Configuration,
        statement: &'c MappedStatement,
        bounds: RowBounds,
    ) -> Self {
        Self {
            configuration,
            statement,
            bounds,
        }
    }

    pub(crate) fn handle(
        &self,
        data: &ResultSetData,
        nested_query: &mut NestedQuery<'_>,
    ) -> Result<Vec<Value>> {
        let Some(result_map) = self.statement.result_maps.first() else {
            // no declared shape: every row becomes a plain map
            let fallback = ResultMap::inline(format!("{}-inline", self.statement.id), "map");
            return self.handle_rows(&fallback, data, nested_query);
        };
        if result_map.has_nested_result_maps() {
            self.handle_grouped(result_map, data, nested_query)
        } else {
            self.handle_rows(result_map, data, nested_query)
        }
    }

    fn handle_rows(
        &self,
        result_map: &ResultMap,
        data: &ResultSetData,
        nested_query: &mut NestedQuery<'_>,
    ) -> Result<Vec<Value>> {
        let mut results = Vec::new();
        for (row_index, row) in data.iter_rows().enumerate() {
            if row_index < self.bounds.offset {
                continue;
            }
            if results.len() >= self.bounds.limit {
                break;
            }
            let resolved = self.resolve_discriminated(result_map, row, None)?;
            let value = self.map_row(&resolved, row, None, false, nested_query)?;
            results.push(value);
        }
        Ok(results)
    }

    /// Joined-row processing: rows sharing the outer `<id>` columns fold
    /// into one object whose nested collections accumulate. With
    /// `resultOrdered` the accumulator only ever holds the current group.
    fn handle_grouped(
        &self,
        result_map: &ResultMap,
        data: &ResultSetData,
        nested_query: &mut NestedQuery<'_>,
    ) -> Result<Vec<Value>> {
        let mut groups: IndexMap<CacheKey, Value> = IndexMap::new();
        let mut finished: Vec<Value> = Vec::new();

        for row in data.iter_rows() {
            let resolved = self.resolve_discriminated(result_map, row, None)?;
            let key = self.row_key(&resolved, row)?;

            if self.statement.result_ordered
                && let Some(last) = groups.last()
                && *last.0 != key
            {
                finished.extend(std::mem::take(&mut groups).into_values());
            }

            if !groups.contains_key(&key) {
                let base = self.map_row(&resolved, row, None, false, nested_query)?;
                groups.insert(key.clone(), base);
            }
            let parent = groups.get_mut(&key).expect("group inserted above");
            apply_nested_mappings(
                self.configuration,
                &resolved,
                row,
                parent,
                |nested_map, row, prefix| self.map_row(nested_map, row, prefix, true, nested_query),
            )?;
        }
        finished.extend(groups.into_values());

        let offset = self.bounds.offset.min(finished.len());
        let end = offset.saturating_add(self.bounds.limit).min(finished.len());
        Ok(finished[offset..end].to_vec())
    }

    fn row_key(&self, result_map: &ResultMap, row: RowView<'_>) -> Result<CacheKey> {
        let mut key = CacheKey::new();
        key.update(Value::Str(result_map.id.clone()));
        let id_mappings: Vec<&ResultMapping> = result_map.id_mappings().collect();
        let key_mappings: Vec<&ResultMapping> = if id_mappings.is_empty() {
            result_map
                .mappings
                .iter()
                .filter(|m| m.nested_result_map.is_none())
                .collect()
        } else {
            id_mappings
        };
        for mapping in key_mappings {
            if let Some(column) = mapping.column.as_deref() {
                key.update(Value::Str(column.to_string()));
                key.update(row.get_by_name(column).cloned().unwrap_or(Value::Null));
            }
        }
        Ok(key)
    }

    fn resolve_discriminated(
        &self,
        result_map: &ResultMap,
        row: RowView<'_>,
        prefix: Option<&str>,
    ) -> Result<ResultMap> {
        let mut current = result_map.clone();
        let mut visited: AHashSet<String> = AHashSet::new();
        visited.insert(current.id.clone());
        while let Some(discriminator) = current.discriminator.clone() {
            let column = prefixed(prefix, &discriminator.column);
            let value = row
                .get_by_name(&column)
                .cloned()
                .unwrap_or(Value::Null)
                .to_string();
            let Some(case_id) = discriminator.case_for(&value) else {
                break;
            };
            if !visited.insert(case_id.to_string()) {
                break;
            }
            current = (*self.configuration.result_map(case_id)?).clone();
        }
        Ok(current)
    }

    fn map_row(
        &self,
        result_map: &ResultMap,
        row: RowView<'_>,
        prefix: Option<&str>,
        nested: bool,
        nested_query: &mut NestedQuery<'_>,
    ) -> Result<Value> {
        let lang = self
            .configuration
            .type_aliases
            .resolve_lang(&result_map.type_name);

        // a scalar target with a single column short-circuits to the value
        if result_map.mappings.is_empty()
            && result_map.constructor_mappings.is_empty()
            && row.columns().len() == 1
            && is_scalar(&lang)
        {
            let handler = self
                .configuration
                .type_handlers
                .require(Some(&lang), None)?;
            return handler.get_result(row, ColumnRef::Index(0));
        }

        let mut object = Value::Map(Default::default());
        for mapping in &result_map.constructor_mappings {
            self.apply_simple_mapping(mapping, row, prefix, &mut object)?;
        }
        for mapping in &result_map.mappings {
            if mapping.nested_result_map.is_some() {
                continue; // joined rows fold in via the grouping pass
            }
            if let Some(select_id) = &mapping.nested_select {
                let parameter = self.nested_select_parameter(mapping, row, prefix)?;
                let value = if parameter.is_null() && mapping.composite_columns.is_empty() {
                    Value::Null
                } else {
                    let rows = nested_query(select_id, parameter)?;
                    if mapping.many {
                        Value::List(rows)
                    } else {
                        rows.into_iter().next().unwrap_or(Value::Null)
                    }
                };
                reflect::set_path(&mut object, &mapping.property, value)?;
            } else {
                self.apply_simple_mapping(mapping, row, prefix, &mut object)?;
            }
        }

        self.auto_map(result_map, row, prefix, nested, &mut object)?;
        Ok(object)
    }

    fn apply_simple_mapping(
        &self,
        mapping: &ResultMapping,
        row: RowView<'_>,
        prefix: Option<&str>,
        object: &mut Value,
    ) -> Result<()> {
        let Some(column) = mapping.column.as_deref() else {
            return Ok(());
        };
        let column = prefixed(prefix, column);
        let raw = row.get_by_name(&column).cloned().unwrap_or(Value::Null);
        let handler = if let Some(name) = &mapping.type_handler
            && let Some(named) = self.configuration.type_handlers.get_named(name)
        {
            named
        } else {
            let lang = mapping.lang_type.clone().or_else(|| lang_of_value(&raw));
            match self.configuration.type_handlers.get(lang.as_ref(), mapping.sql_type) {
                Some(handler) => handler,
                None => {
                    reflect::set_path(object, &mapping.property, raw)?;
                    return Ok(());
                }
            }
        };
        let value = handler.get_result(row, ColumnRef::Name(&column))?;
        reflect::set_path(object, &mapping.property, value)?;
        Ok(())
    }

    fn nested_select_parameter(
        &self,
        mapping: &ResultMapping,
        row: RowView<'_>,
        prefix: Option<&str>,
    ) -> Result<Value> {
        if !mapping.composite_columns.is_empty() {
            let mut parameter = Value::Map(Default::default());
            for (property, column) in &mapping.composite_columns {
                let column = prefixed(prefix, column);
                let value = row.get_by_name(&column).cloned().unwrap_or(Value::Null);
                reflect::set_path(&mut parameter, property, value)?;
            }
            return Ok(parameter);
        }
        let Some(column) = mapping.column.as_deref() else {
            return Ok(Value::Null);
        };
        Ok(row
            .get_by_name(&prefixed(prefix, column))
            .cloned()
            .unwrap_or(Value::Null))
    }

    fn auto_map(
        &self,
        result_map: &ResultMap,
        row: RowView<'_>,
        prefix: Option<&str>,
        nested: bool,
        object: &mut Value,
    ) -> Result<()> {
        let behavior = self.configuration.settings.auto_mapping_behavior;
        let allowed = match result_map.auto_mapping {
            Some(explicit) => explicit,
            None => match behavior {
                AutoMappingBehavior::None => false,
                AutoMappingBehavior::Partial => !nested,
                AutoMappingBehavior::Full => true,
            },
        };
        if !allowed {
            return Ok(());
        }

        let mapped: AHashSet<String> = result_map
            .mapped_columns()
            .map(|c| prefixed(prefix, c).to_uppercase())
            .collect();
        let shape = self.configuration.reflectors.find(&result_map.type_name);

        for (index, column) in row.columns().iter().enumerate() {
            if let Some(prefix) = prefix {
                if !column.to_lowercase().starts_with(&prefix.to_lowercase()) {
                    continue;
                }
            }
            if mapped.contains(&column.to_uppercase()) {
                continue;
            }
            let bare = match prefix {
                Some(prefix) => &column[prefix.len()..],
                None => column.as_str(),
            };
            let candidate = if self.configuration.settings.map_underscore_to_camel_case {
                camelize(bare)
            } else {
                bare.to_string()
            };
            let property = match &shape {
                Some(shape) => match shape.find_property(&candidate)? {
                    Some(declared) => declared.to_string(),
                    None => continue,
                },
                None => candidate,
            };
            if object.get(&property).is_some() {
                continue;
            }
            let value = row.get_by_index(index).cloned().unwrap_or(Value::Null);
            if let Value::Map(map) = object {
                map.insert(property, value);
            }
        }
        Ok(())
    }
}

/// Folds this row's nested (joined) mappings into the parent object.
fn apply_nested_mappings(
    configuration: &Configuration,
    result_map: &ResultMap,
    row: RowView<'_>,
    parent: &mut Value,
    mut map_child: impl FnMut(&ResultMap, RowView<'_>, Option<&str>) -> Result<Value>,
) -> Result<()> {
    for mapping in &result_map.mappings {
        let Some(nested_id) = &mapping.nested_result_map else {
            continue;
        };
        let nested_map = configuration.result_map(nested_id)?;
        let prefix = mapping.column_prefix.as_deref();

        // a row with all-null child id columns carries no child
        let id_columns: Vec<String> = nested_map
            .id_mappings()
            .filter_map(|m| m.column.as_deref())
            .map(|c| prefixed(prefix, c))
            .collect();
        if !id_columns.is_empty()
            && id_columns
                .iter()
                .all(|c| row.get_by_name(c).is_none_or(Value::is_null))
        {
            continue;
        }

        let child = map_child(&nested_map, row, prefix)?;
        let existing = reflect::get_path(parent, &mapping.property)?;
        if mapping.many {
            let mut list = match existing {
                Value::List(items) => items,
                Value::Null => Vec::new(),
                other => vec![other],
            };
            if !list.contains(&child) {
                list.push(child);
            }
            reflect::set_path(parent, &mapping.property, Value::List(list))?;
        } else if existing.is_null() {
            reflect::set_path(parent, &mapping.property, child)?;
        }
    }
    Ok(())
}

fn prefixed(prefix: Option<&str>, column: &str) -> String {
    match prefix {
        Some(prefix) => format!("{prefix}{column}"),
        None => column.to_string(),
    }
}

fn is_scalar(lang: &LangType) -> bool {
    matches!(
        lang,
        LangType::Bool
            | LangType::Int
            | LangType::Long
            | LangType::Float
            | LangType::Double
            | LangType::Str
            | LangType::Bytes
            | LangType::Date
            | LangType::Time
            | LangType::Timestamp
    )
}

fn camelize(column: &str) -> String {
    let mut out = String::with_capacity(column.len());
    let mut upper_next = false;
    for c in column.chars() {
        if c == '_' {
            upper_next = true;
        } else if upper_next {
            out.extend(c.to_uppercase());
            upper_next = false;
        } else {
            out.push(c.to_ascii_lowercase());
        }
    }
    out
}
