//! Storage layer for the Electa wallet.
//!
//! This crate provides PostgreSQL implementations of the repository traits
//! defined in `electa-core`. It handles all database interactions including
//! connection pooling, migrations, and the atomic ledger commit.
//!
//! # Architecture
//!
//! The storage layer follows the repository pattern:
//!
//! - [`postgres::Database`] - Connection pool management
//! - [`postgres::PgRepositories`] - Composite repository for all entity types
//! - Individual repositories for accounts, transactions, escrow deposits and
//!   settlements
//!
//! Balances are cached on `wallet_accounts` and only change inside
//! `commit_entry`, which locks the touched accounts with `SELECT … FOR UPDATE`
//! under a `lock_timeout`.
//!
//! # Usage
//!
//! ```ignore
//! use electa_storage::{Database, DatabaseConfig, PgRepositories};
//!
//! let config = DatabaseConfig::for_service(&database_url, lock_timeout);
//! let db = Database::connect(&config).await?;
//! db.migrate().await?;
//!
//! let repositories = Arc::new(PgRepositories::new(Arc::new(db)));
//! ```

pub mod postgres;

pub use postgres::{Database, DatabaseConfig, PgRepositories};
