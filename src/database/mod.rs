//! # Database Operations
//!
//! Postgres connection pooling and schema migrations for the `PgDemandStore` and
//! `PgProviderOrderStore` persistence backends. Without a configured `database.url` the
//! binaries fall back to the in-memory stores.

pub mod connection;

pub use connection::DatabaseConnection;

/// Embedded schema migrations (`migrations/`)
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
