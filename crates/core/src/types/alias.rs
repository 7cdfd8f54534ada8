use ahash::AHashMap;

use crate::errors::TypeError;
use crate::types::LangType;

/// Fixed bootstrap aliases. Keys are lowercase; lookups fold before
/// probing, which is what makes the registry case-insensitive.
static BOOTSTRAP: phf::Map<&'static str, &'static str> = phf::phf_map! {
    // primitives and their boxed spellings
    "boolean" => "bool",
    "bool" => "bool",
    "byte" => "i8",
    "short" => "i16",
    "int" => "i32",
    "integer" => "i32",
    "long" => "i64",
    "float" => "f32",
    "double" => "f64",
    "decimal" => "decimal",
    "bigdecimal" => "decimal",
    "string" => "string",
    "str" => "string",
    "char" => "string",
    "byte[]" => "bytes",
    "bytes" => "bytes",
    // date/time
    "date" => "date",
    "time" => "time",
    "timestamp" => "timestamp",
    "datetime" => "timestamp",
    "instant" => "timestamp",
    // containers
    "map" => "map",
    "hashmap" => "map",
    "list" => "list",
    "arraylist" => "list",
    "collection" => "list",
    "iterator" => "list",
    "array" => "list",
    "object" => "object",
    // database-facing
    "resultset" => "resultset",
    "db_vendor" => "db_vendor",
};

/// Case-insensitive short names for types used in configuration. User
/// registrations layer over the fixed bootstrap table; re-registering an
/// alias with a different target fails.
#[derive(Debug, Default)]
pub struct TypeAliasRegistry {
    user: AHashMap<String, String>,
}

impl TypeAliasRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves an alias to its canonical type name. Unregistered names
    /// resolve to themselves so fully-spelled type names pass through.
    pub fn resolve(&self, alias: &str) -> String {
        let folded = alias.to_lowercase();
        if let Some(user) = self.user.get(&folded) {
            return user.clone();
        }
        if let Some(bootstrap) = BOOTSTRAP.get(folded.as_str()) {
            return (*bootstrap).to_string();
        }
        alias.to_string()
    }

    /// Resolves an alias straight to a language-side type.
    pub fn resolve_lang(&self, alias: &str) -> LangType {
        LangType::parse(&self.resolve(alias))
    }

    pub fn register(
        &mut self,
        alias: impl Into<String>,
        target: impl Into<String>,
    ) -> Result<(), TypeError> {
        let alias = alias.into();
        let target = target.into();
        let folded = alias.to_lowercase();
        let existing = self
            .user
            .get(&folded)
            .map(String::as_str)
            .or_else(|| BOOTSTRAP.get(folded.as_str()).copied());
        match existing {
            Some(existing) if existing != target => Err(TypeError::AliasCollision {
                alias,
                existing: existing.to_string(),
                attempted: target,
            }),
            Some(_) => Ok(()),
            None => {
                self.user.insert(folded, target);
                Ok(())
            }
        }
    }
}
