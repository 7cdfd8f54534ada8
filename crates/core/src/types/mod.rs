pub mod alias;
pub mod handlers;
mod sql_type;

pub use alias::TypeAliasRegistry;
pub use handlers::{TypeHandler, TypeHandlerRegistry};
pub use sql_type::{LangType, SqlType};
