//! Database module: entity models and SQL repositories.
//!
//! - `model`: typed view structs returned by queries.
//! - `repo`: SQL-only functions that map rows into those structs.
//!
//! External modules import from `release_herald::db` — the repository API is
//! re-exported here.

pub mod model;
pub mod repo;

pub use model::{NewRelease, UnnotifiedRelease};
pub use repo::*;
