//! State store for steroids: models, SQLite pools, and typed queries for
//! the per-project and global databases.

pub mod models;
pub mod pool;
pub mod queries;
pub mod schema;
