//! Core primitives for the squill SQL mapping runtime: the dynamic value
//! model, type handlers, the expression language, dynamic SQL rendering,
//! the cache layer and the driver seam. Everything here is I/O-free; the
//! assembled runtime lives in the `squill` crate.

pub mod cache;
pub mod driver;
pub mod error_context;
pub mod errors;
pub mod expr;
pub mod reflect;
pub mod sql;
pub mod types;
pub mod value;

pub use error_context::ErrorContext;
pub use errors::{Error, Result};
pub use value::{Value, from_value, to_value};
