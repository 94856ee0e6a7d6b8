//! Relationship-based access control (ReBAC) engine
//!
//! This crate implements a Zanzibar-style authorization engine providing:
//! - A schema language for object types, relations and permissions
//! - A versioned relationship store with snapshot reads
//! - Permission checks that evaluate union, intersection, exclusion,
//!   subject-set expansion and arrows over the relationship graph
//! - Consistency tokens for read-after-write checks
//!
//! # Core Concepts
//!
//! - **Object**: Any resource that can be protected (e.g., document, folder, payment)
//! - **Subject**: An object, or a set of subjects such as `group:eng#member`
//! - **Relation**: A typed edge from a resource to its subjects (e.g., owner, viewer)
//! - **Permission**: An expression over relations and other permissions
//! - **Revision**: Every committed write batch produces a new store revision
//!
//! # Example
//!
//! ```rust
//! use rebac_engine::{AuthorizationEngine, EngineConfig, RelationshipUpdate};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = AuthorizationEngine::new(EngineConfig::default())?;
//!
//!     engine
//!         .write_schema(
//!             r#"
//!             definition namespace/user {}
//!
//!             definition namespace/payment {
//!                 relation payer: namespace/user
//!                 relation collector: namespace/user
//!                 permission view = payer + collector
//!             }
//!             "#,
//!         )
//!         .await?;
//!
//!     // Write relationship
//!     engine
//!         .write_relationships(vec![RelationshipUpdate::touch(
//!             "namespace/payment:payment_1#payer@namespace/user:bob".parse()?,
//!         )])
//!         .await?;
//!
//!     // Check permission
//!     let allowed = engine
//!         .check(
//!             &"namespace/user:bob".parse()?,
//!             "view",
//!             &"namespace/payment:payment_1".parse()?,
//!         )
//!         .await?;
//!     assert!(allowed);
//!
//!     Ok(())
//! }
//! ```

pub mod models;
pub mod engine;
pub mod store;
pub mod schema;
pub mod compiler;
pub mod check;
pub mod expand;
pub mod consistency;
pub mod config;
pub mod error;

pub use models::*;
pub use engine::*;
pub use schema::*;
pub use error::*;
pub use store::{InMemoryRelationshipStore, RelationshipIter, RelationshipStore, RevisionBounds};
pub use compiler::compile;
pub use check::{CheckOptions, PermissionChecker};
pub use expand::{PermissionTree, SubjectExpander};
pub use consistency::{Consistency, ConsistencyToken, ConsistencyTokenManager};
pub use self::config::EngineConfig;
