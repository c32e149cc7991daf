//! Record storage with constraint enforcement
//!
//! Tuples keyed by attribute name go in, tuples keyed by attribute name come
//! out. Every mutation is checked by the [`ConstraintValidator`] while the
//! affected tables are locked.
//!
//! # Example
//!
//! ```rust,no_run
//! use element_session::query::Restriction;
//! use element_session::schema::{Row, SchemaRegistry};
//! use element_session::store::{MemoryRecordStore, RecordStore};
//!
//! # async fn example(registry: SchemaRegistry) -> element_session::Result<()> {
//! let store = MemoryRecordStore::new(registry.clone());
//! let subject = registry.entity("lab_subject.Subject").unwrap();
//!
//! let mouse = Row::new()
//!     .with("subject", "M01")
//!     .with("sex", "F")
//!     .with("subject_birth_date", "2024-01-15");
//! store.insert(&subject, mouse).await?;
//! let rows = store.fetch(&subject, Restriction::All).await?;
//! assert_eq!(rows.count(), 1);
//! # Ok(())
//! # }
//! ```

mod fetch;
mod memory;
mod validator;

pub use fetch::{Fetch, FetchIter};
pub use memory::MemoryRecordStore;
pub use validator::{CascadePlan, ConstraintValidator, TableView};

use std::collections::BTreeMap;
use std::future::Future;

use crate::query::Restriction;
use crate::schema::{Entity, PrimaryKey, Row};
use crate::Result;

/// Rows of one entity, in primary-key order.
pub type Rows = BTreeMap<PrimaryKey, Row>;

/// Outcome of a delete: removed and nullified records per entity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteSummary {
    deleted: BTreeMap<String, usize>,
    nullified: BTreeMap<String, usize>,
}

impl DeleteSummary {
    /// Records deleted from the entity (qualified name).
    #[must_use]
    pub fn deleted(&self, qualified_name: &str) -> usize {
        self.deleted.get(qualified_name).copied().unwrap_or(0)
    }

    /// Records whose references to the deleted rows were set to NULL.
    #[must_use]
    pub fn nullified(&self, qualified_name: &str) -> usize {
        self.nullified.get(qualified_name).copied().unwrap_or(0)
    }

    /// Total records deleted across entities.
    #[must_use]
    pub fn total_deleted(&self) -> usize {
        self.deleted.values().sum()
    }

    /// Per-entity deletion counts.
    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.deleted.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub(crate) fn from_plan(plan: &CascadePlan) -> Self {
        let mut nullified = BTreeMap::new();
        for (entity, _, _) in plan.nullifications() {
            *nullified.entry(entity.qualified_name().to_string()).or_insert(0) += 1;
        }
        Self {
            deleted: plan.deletion_counts(),
            nullified,
        }
    }
}

/// Record store trait.
///
/// Entities are the resolved descriptors published by the
/// [`SchemaRegistry`](crate::schema::SchemaRegistry); keys are tuples
/// holding (at least) the primary-key attributes.
pub trait RecordStore: Send + Sync {
    /// Insert one record, returning its primary key.
    fn insert(&self, entity: &Entity, row: Row) -> impl Future<Output = Result<PrimaryKey>> + Send;

    /// Change secondary attributes of an existing record, returning the
    /// stored tuple.
    fn update(
        &self,
        entity: &Entity,
        key: &Row,
        changes: Row,
    ) -> impl Future<Output = Result<Row>> + Send;

    /// Delete a record with its cascade set, atomically.
    fn delete(&self, entity: &Entity, key: &Row) -> impl Future<Output = Result<DeleteSummary>> + Send;

    /// Lazy, restartable selection of the entity's records.
    fn fetch(
        &self,
        entity: &Entity,
        restriction: Restriction,
    ) -> impl Future<Output = Result<Fetch>> + Send;

    /// Insert records one after another, stopping at the first error.
    ///
    /// Records inserted before the error stay inserted.
    fn insert_many(
        &self,
        entity: &Entity,
        rows: Vec<Row>,
    ) -> impl Future<Output = Result<Vec<PrimaryKey>>> + Send {
        async move {
            let mut keys = Vec::with_capacity(rows.len());
            for row in rows {
                keys.push(self.insert(entity, row).await?);
            }
            Ok(keys)
        }
    }
}
