//! A SQL mapping runtime: interface-style mapper calls bound to
//! parameterised SQL declared in XML, executed over a pooled connection
//! and projected back into record shapes.
//!
//! The crate assembles the primitives from `squill-core` into the full
//! pipeline: configuration loading, dynamic SQL, the executor stack with
//! its two cache levels, the connection pool and the session surface.

pub mod binding;
pub mod builder;
pub mod config;
pub mod datasource;
pub mod executor;
pub mod io;
pub mod mapping;
pub mod plugin;
pub mod pool;
pub mod session;
pub mod testing;
pub mod transaction;

pub use squill_core::{Error, ErrorContext, Result, Value, from_value, to_value};

pub use binding::Mapper;
pub use config::{Configuration, ExecutorType};
pub use session::{RowBounds, SqlSession, SqlSessionFactory, SqlSessionFactoryBuilder};
