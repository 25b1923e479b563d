//! # Database Node Library
//!
//! Persistence node of the cluster. It answers create, query and update
//! requests for stored objects from a pluggable storage engine, and
//! implements the account-level requests built on top of them.
//!
//! ## Module Organization
//!
//! - `backend`: the storage contract and its table and document engines
//! - `sequencer`: per-object request ordering
//! - `account`: avatar slots, wish names and account summaries
//! - `server`: request decoding, scheduling and responses
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use dbserver::backend;
//! use dbserver::server::{DbConfig, DbServer};
//! use shared::{Bridge, Schema};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = DbConfig::default();
//!     let schema = Arc::new(Schema::load(&config.dclass_path)?);
//!     let store = backend::open(config.backend, &config.data_dir, schema.clone(), config.id_range)?;
//!
//!     let bridge = Bridge::connect(&config.md_addr()).await?;
//!     let mut server = DbServer::new(config, schema, store, bridge.outbox());
//!     server.start().await?;
//!
//!     server.run(bridge).await?;
//!     Ok(())
//! }
//! ```

pub mod account;
pub mod backend;
pub mod error;
pub mod sequencer;
pub mod server;

pub use backend::{BackendKind, DatabaseBackend, IdRange, StoredObject};
pub use error::{BackendError, DbError};
pub use server::{DbConfig, DbServer};
