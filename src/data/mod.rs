//! Data layer module
//!
//! Owns the object store abstraction (C3) and its concrete SQLite
//! implementation.

mod models;
mod sqlite_store;
mod store;

pub use models::*;
pub use sqlite_store::SqliteStore;
pub use store::*;
