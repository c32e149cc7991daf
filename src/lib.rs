//! # element-session: Session Schema Engine
//!
//! Declares relational schemas for experiment sessions (subjects, sessions,
//! per-session key-value attributes, data directories, experimenters, notes
//! and project membership), activates them under a configurable database
//! prefix, and stores records with key, reference, type and cascade
//! constraints enforced.
//!
//! ## Design Principles
//!
//! - **Explicit registry**: activation state lives in a [`SchemaRegistry`]
//!   you pass around, never in globals
//! - **Resolved references**: foreign keys point at descriptors, not names
//! - **Atomic deletes**: a delete and its whole cascade apply together or
//!   not at all
//! - **Bounded waits**: every lock wait ends in `LockTimeout`
//!
//! ## Example Usage
//!
//! ```rust
//! use element_session::query::Restriction;
//! use element_session::schema::Row;
//! use element_session::store::RecordStore;
//! use element_session::Database;
//!
//! # async fn example() -> element_session::Result<()> {
//! let db = Database::builder().database_prefix("demo_").build()?;
//! let session = db.session()?;
//! assert_eq!(session.namespace(), "demo_session");
//!
//! let rows = db.store().fetch(session.session(), Restriction::All).await?;
//! assert!(rows.is_empty());
//! # Ok(())
//! # }
//! ```
//!
//! [`SchemaRegistry`]: schema::SchemaRegistry

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod config;
pub mod error;
pub mod query;
pub mod schema;
pub mod session;
pub mod storage;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

pub use config::Config;
pub use error::{Error, Result};

use schema::{ActivationHandle, SchemaHandle, SchemaRegistry};
use session::SessionSchema;
use store::MemoryRecordStore;
use tracing::info;

/// Database instance: configuration, schema registry and record store.
///
/// Cloning is cheap; clones share the registry and the store.
#[derive(Debug, Clone)]
pub struct Database {
    config: Config,
    registry: SchemaRegistry,
    store: Arc<MemoryRecordStore>,
}

impl Database {
    /// Create a new database builder
    #[must_use]
    pub fn builder() -> DatabaseBuilder {
        DatabaseBuilder::default()
    }

    /// Effective configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Schema registry.
    #[must_use]
    pub const fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Record store.
    #[must_use]
    pub fn store(&self) -> &MemoryRecordStore {
        &self.store
    }

    /// Activate a schema module under the configured prefix.
    ///
    /// # Errors
    ///
    /// Any activation error.
    pub fn activate(&self, module: &ActivationHandle) -> Result<Arc<SchemaHandle>> {
        self.registry.activate(&self.config.database_prefix, module)
    }

    /// Activate the session schema (with its upstream schemas) under the
    /// configured prefix.
    ///
    /// # Errors
    ///
    /// Any activation error.
    pub fn session(&self) -> Result<SessionSchema> {
        SessionSchema::activate(&self.registry, &self.config.database_prefix)
    }
}

/// Database builder
#[derive(Debug, Default)]
pub struct DatabaseBuilder {
    config: Config,
    env_overrides: bool,
}

impl DatabaseBuilder {
    /// Replace the whole configuration
    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Set the prefix prepended to every schema namespace
    #[must_use]
    pub fn database_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.database_prefix = prefix.into();
        self
    }

    /// Set the bounded wait for schema and table locks
    #[must_use]
    pub const fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.config.lock_timeout = timeout;
        self
    }

    /// Apply `ELEMENTDB_*` environment overrides at build time
    #[must_use]
    pub const fn with_env_overrides(mut self) -> Self {
        self.env_overrides = true;
        self
    }

    /// Build the database
    ///
    /// # Errors
    ///
    /// Returns `Config` if an environment override is malformed or the
    /// lock timeout is zero.
    pub fn build(self) -> Result<Database> {
        let config = if self.env_overrides {
            self.config.with_env_overrides()?
        } else {
            self.config.validated()?
        };
        let registry = SchemaRegistry::new(config.lock_timeout);
        let store = Arc::new(MemoryRecordStore::new(registry.clone()));
        info!(prefix = %config.database_prefix, lock_timeout = ?config.lock_timeout, "database ready");
        Ok(Database {
            config,
            registry,
            store,
        })
    }
}
