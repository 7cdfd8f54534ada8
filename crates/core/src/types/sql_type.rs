use std::fmt;

use strum_macros::{Display, EnumString};

/// Database-side SQL types, the `jdbcType` axis of handler resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum SqlType {
    Char,
    Varchar,
    Longvarchar,
    Clob,
    Bit,
    Boolean,
    Tinyint,
    Smallint,
    Integer,
    Bigint,
    Float,
    Real,
    Double,
    Decimal,
    Numeric,
    Date,
    Time,
    Timestamp,
    Binary,
    Varbinary,
    Longvarbinary,
    Blob,
    Array,
    Struct,
    Other,
    Cursor,
    Null,
    Undefined,
}

/// Language-side types, the `javaType` axis of handler resolution. Enum
/// and object types carry the declared type name so user registrations can
/// participate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LangType {
    Bool,
    Int,
    Long,
    Float,
    Double,
    Str,
    Bytes,
    Date,
    Time,
    Timestamp,
    Map,
    List,
    Enum(String),
    Object(String),
}

impl LangType {
    /// Parses a canonical alias-registry name. Unknown names become
    /// `Object` types so user-registered handlers can still match.
    pub fn parse(name: &str) -> LangType {
        match name.to_lowercase().as_str() {
            "bool" | "boolean" => LangType::Bool,
            "int" | "i32" | "integer" | "short" | "i16" | "byte" | "i8" => LangType::Int,
            "long" | "i64" => LangType::Long,
            "float" | "f32" => LangType::Float,
            "double" | "f64" | "decimal" | "bigdecimal" => LangType::Double,
            "string" | "str" | "char" => LangType::Str,
            "bytes" | "byte[]" | "binary" => LangType::Bytes,
            "date" => LangType::Date,
            "time" => LangType::Time,
            "timestamp" | "datetime" | "instant" => LangType::Timestamp,
            "map" | "hashmap" => LangType::Map,
            "list" | "collection" | "arraylist" | "iterator" | "array" => LangType::List,
            _ => LangType::Object(name.to_string()),
        }
    }

    pub fn is_enum(&self) -> bool {
        matches!(self, LangType::Enum(_))
    }
}

impl fmt::Display for LangType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LangType::Bool => write!(f, "bool"),
            LangType::Int => write!(f, "int"),
            LangType::Long => write!(f, "long"),
            LangType::Float => write!(f, "float"),
            LangType::Double => write!(f, "double"),
            LangType::Str => write!(f, "string"),
            LangType::Bytes => write!(f, "bytes"),
            LangType::Date => write!(f, "date"),
            LangType::Time => write!(f, "time"),
            LangType::Timestamp => write!(f, "timestamp"),
            LangType::Map => write!(f, "map"),
            LangType::List => write!(f, "list"),
            LangType::Enum(name) => write!(f, "enum {name}"),
            LangType::Object(name) => write!(f, "{name}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn sql_type_parses_case_insensitively() {
        assert_eq!(SqlType::from_str("VARCHAR").unwrap(), SqlType::Varchar);
        assert_eq!(SqlType::from_str("varchar").unwrap(), SqlType::Varchar);
        assert_eq!(SqlType::Varchar.to_string(), "VARCHAR");
    }

    #[test]
    fn lang_type_falls_back_to_object() {
        assert_eq!(LangType::parse("i64"), LangType::Long);
        assert_eq!(
            LangType::parse("com.example.Color"),
            LangType::Object("com.example.Color".to_string())
        );
    }
}
