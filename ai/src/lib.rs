//! # AI Node Library
//!
//! Game-logic node of the cluster. An AI node owns a set of distributed
//! objects, generates new ones on the state servers, follows them through
//! the parent/zone hierarchy and applies field updates sent by clients and
//! other nodes.
//!
//! ## Module Organization
//!
//! - `object`: per-object state, the update queue and the behavior trait
//! - `registry`: class id to behavior constructors
//! - `table`: resident objects
//! - `interest`: parent/zone membership and arrival/departure hooks
//! - `dispatch`: field-update decoding and client authorization
//! - `repository`: node state and the logic loop
//! - `district`: the district object and node bootstrap
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use ai::district::bootstrap;
//! use ai::registry::TypeRegistry;
//! use ai::repository::{AiConfig, AiRepository};
//! use shared::{Bridge, Schema};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AiConfig::default();
//!     let schema = Arc::new(Schema::load(&config.dclass_path)?);
//!     let registry = TypeRegistry::standard(&schema, &config.district_class, &config.avatar_class);
//!
//!     let bridge = Bridge::connect(&config.md_addr()).await?;
//!     let mut repo = AiRepository::new(config, schema, registry, bridge.outbox())?;
//!     bootstrap(&mut repo)?;
//!
//!     repo.run(bridge).await?;
//!     Ok(())
//! }
//! ```

pub mod dispatch;
pub mod district;
pub mod error;
pub mod interest;
pub mod object;
pub mod registry;
pub mod repository;
pub mod table;

pub use error::AiError;
pub use object::{Location, ObjectBehavior, ObjectState};
pub use repository::{AiConfig, AiRepository};
