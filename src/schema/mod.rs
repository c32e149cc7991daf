//! Schema metadata: values, attribute types, entity descriptors and the
//! activation registry
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use element_session::schema::{
//!     ActivationHandle, Attribute, AttributeType, EntityDefinition, SchemaBuilder, SchemaModule,
//!     SchemaRegistry,
//! };
//!
//! struct Lab;
//!
//! impl SchemaModule for Lab {
//!     fn name(&self) -> &str {
//!         "lab"
//!     }
//!
//!     fn declare(&self, schema: &mut SchemaBuilder<'_>) -> element_session::Result<()> {
//!         schema.define(
//!             EntityDefinition::lookup("User")
//!                 .primary(Attribute::new("user", AttributeType::Varchar(32))),
//!         )?;
//!         Ok(())
//!     }
//! }
//!
//! let registry = SchemaRegistry::default();
//! let lab: ActivationHandle = Arc::new(Lab);
//! let handle = registry.activate("demo_", &lab)?;
//! assert_eq!(handle.namespace(), "demo_lab");
//! assert!(registry.entity("demo_lab.User").is_some());
//! # Ok::<(), element_session::Error>(())
//! ```

mod definition;
mod entity;
mod registry;
mod types;
mod value;

pub use definition::parse_definition;
pub use entity::{Entity, EntityDefinition, EntityKind, ForeignKey, OnDelete, Reference};
pub use registry::{
    ActivationHandle, RegisteredEntity, SchemaBuilder, SchemaHandle, SchemaModule, SchemaRegistry,
};
pub use types::{Attribute, AttributeType};
pub use value::{PrimaryKey, Row, Value};
