//! In-memory record store using `DashMap`.
//!
//! Each entity table pairs an async reader/writer gate (held for the whole
//! validate-then-apply step) with a copy-on-write snapshot of its rows.
//! Gates are always taken in ascending registration ordinal. A delete
//! applies its whole cascade while holding every affected table's rows.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};
use std::time::Duration;

use arrow::record_batch::RecordBatch;
use dashmap::DashMap;
use rustc_hash::FxHashMap;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock as Gate};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::{ConstraintValidator, DeleteSummary, Fetch, RecordStore, Rows};
use crate::query::Restriction;
use crate::schema::{Entity, PrimaryKey, Row, SchemaRegistry, Value};
use crate::{storage, Error, Result};

pub(crate) struct Table {
    entity: Arc<Entity>,
    ordinal: u64,
    gate: Arc<Gate<()>>,
    data: RwLock<Arc<Rows>>,
}

impl Table {
    /// Current rows; later writes do not affect the returned snapshot.
    pub(crate) fn snapshot(&self) -> Arc<Rows> {
        Arc::clone(&self.data.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Mutate the rows, cloning them only if a snapshot is still alive.
    fn modify<R>(&self, f: impl FnOnce(&mut Rows) -> R) -> R {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        f(Arc::make_mut(&mut data))
    }

    pub(crate) fn entity(&self) -> &Arc<Entity> {
        &self.entity
    }
}

/// Tables to lock for one operation, keyed (and therefore acquired) by
/// ordinal.
#[derive(Default)]
struct LockPlan {
    tables: BTreeMap<u64, (Arc<Table>, bool)>,
}

impl LockPlan {
    fn read(&mut self, table: Arc<Table>) -> &mut Self {
        self.tables.entry(table.ordinal).or_insert((table, false));
        self
    }

    fn write(&mut self, table: Arc<Table>) -> &mut Self {
        self.tables.insert(table.ordinal, (table, true));
        self
    }

    async fn acquire(&self, timeout: Duration) -> Result<TableLocks> {
        let deadline = Instant::now() + timeout;
        let mut locks = TableLocks::default();
        for (table, write) in self.tables.values() {
            let gate = Arc::clone(&table.gate);
            let acquired = if *write {
                tokio::time::timeout_at(deadline, gate.write_owned())
                    .await
                    .map(|g| locks._write.push(g))
            } else {
                tokio::time::timeout_at(deadline, gate.read_owned())
                    .await
                    .map(|g| locks._read.push(g))
            };
            if acquired.is_err() {
                warn!(entity = %table.entity.qualified_name(), ?timeout, "lock wait timed out");
                return Err(Error::LockTimeout {
                    resource: table.entity.qualified_name().to_string(),
                    waited: timeout,
                });
            }
        }
        Ok(locks)
    }

    /// Apply `f` to every write-planned table at once. Readers see either
    /// none or all of the changes.
    fn commit<'a, R>(
        &'a self,
        f: impl FnOnce(&mut FxHashMap<&'a str, RwLockWriteGuard<'a, Arc<Rows>>>) -> R,
    ) -> R {
        let mut data: FxHashMap<&'a str, _> = self
            .tables
            .values()
            .filter(|(_, write)| *write)
            .map(|(t, _)| {
                let guard = t.data.write().unwrap_or_else(PoisonError::into_inner);
                (t.entity.qualified_name(), guard)
            })
            .collect();
        f(&mut data)
    }

    fn snapshots(&self) -> FxHashMap<String, Arc<Rows>> {
        self.tables
            .values()
            .map(|(t, _)| (t.entity.qualified_name().to_string(), t.snapshot()))
            .collect()
    }
}

/// Held gates; released on drop.
#[derive(Default)]
struct TableLocks {
    _read: Vec<OwnedRwLockReadGuard<()>>,
    _write: Vec<OwnedRwLockWriteGuard<()>>,
}

/// In-memory record store.
///
/// Thread-safe; clone the registry handle into it and share the store
/// behind an `Arc`.
pub struct MemoryRecordStore {
    registry: SchemaRegistry,
    tables: DashMap<String, Arc<Table>>,
    lock_timeout: Duration,
}

impl std::fmt::Debug for MemoryRecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRecordStore")
            .field("tables", &self.tables.len())
            .field("lock_timeout", &self.lock_timeout)
            .finish_non_exhaustive()
    }
}

impl MemoryRecordStore {
    /// Create a store over `registry`, using its lock timeout.
    #[must_use]
    pub fn new(registry: SchemaRegistry) -> Self {
        let lock_timeout = registry.lock_timeout();
        Self::with_lock_timeout(registry, lock_timeout)
    }

    /// Create a store with an explicit bounded lock wait.
    #[must_use]
    pub fn with_lock_timeout(registry: SchemaRegistry, lock_timeout: Duration) -> Self {
        Self {
            registry,
            tables: DashMap::new(),
            lock_timeout,
        }
    }

    /// Registry the store resolves entities through.
    #[must_use]
    pub const fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Number of records in the entity.
    ///
    /// # Errors
    ///
    /// `UnknownEntity` if the entity is not registered.
    pub fn len(&self, entity: &Entity) -> Result<usize> {
        Ok(self.table(entity)?.snapshot().len())
    }

    /// Whether the entity holds no records.
    ///
    /// # Errors
    ///
    /// `UnknownEntity` if the entity is not registered.
    pub fn is_empty(&self, entity: &Entity) -> Result<bool> {
        Ok(self.len(entity)? == 0)
    }

    /// Look up one record by key.
    ///
    /// # Errors
    ///
    /// `UnknownEntity` for unregistered entities, `ConstraintViolation`
    /// for malformed keys.
    pub fn get(&self, entity: &Entity, key: &Row) -> Result<Option<Row>> {
        let key = entity.key_of(key)?;
        Ok(self.table(entity)?.snapshot().get(&key).cloned())
    }

    fn table(&self, entity: &Entity) -> Result<Arc<Table>> {
        let table = self.table_named(entity.qualified_name())?;
        if std::ptr::eq(table.entity.as_ref(), entity) || *table.entity == *entity {
            Ok(table)
        } else {
            Err(Error::UnknownEntity(format!(
                "{} (descriptor differs from the registered one)",
                entity.qualified_name()
            )))
        }
    }

    fn table_named(&self, qualified_name: &str) -> Result<Arc<Table>> {
        if let Some(table) = self.tables.get(qualified_name) {
            return Ok(Arc::clone(table.value()));
        }
        let registered = self.registry.registered(qualified_name)?;
        let table = self
            .tables
            .entry(qualified_name.to_string())
            .or_insert_with(|| {
                Arc::new(Table {
                    entity: Arc::clone(registered.entity()),
                    ordinal: registered.ordinal(),
                    gate: Arc::new(Gate::new(())),
                    data: RwLock::new(Arc::new(Rows::new())),
                })
            });
        Ok(Arc::clone(table.value()))
    }

    /// Plan for writing `table` after reading every table it references.
    fn reference_plan(&self, table: &Arc<Table>) -> Result<LockPlan> {
        let mut plan = LockPlan::default();
        for fk in table.entity.foreign_keys() {
            plan.read(self.table_named(fk.target())?);
        }
        plan.write(Arc::clone(table));
        Ok(plan)
    }

    /// Export the entity's rows as an Arrow batch in primary-key order.
    ///
    /// # Errors
    ///
    /// `UnknownEntity` or an Arrow error.
    pub fn export(&self, entity: &Entity) -> Result<RecordBatch> {
        let table = self.table(entity)?;
        let rows = table.snapshot();
        storage::to_record_batch(&table.entity, rows.values())
    }

    /// Write the entity's rows to a Parquet file.
    ///
    /// # Errors
    ///
    /// `UnknownEntity`, IO, Arrow or Parquet errors.
    pub fn export_parquet<P: AsRef<Path>>(&self, entity: &Entity, path: P) -> Result<usize> {
        let batch = self.export(entity)?;
        storage::write_parquet(path, &batch)?;
        Ok(batch.num_rows())
    }

    /// Insert every row of a Parquet file written by
    /// [`export_parquet`](Self::export_parquet), through the validator.
    ///
    /// # Errors
    ///
    /// Layout mismatches, or the first rejected row.
    pub async fn import_parquet<P: AsRef<Path>>(&self, entity: &Entity, path: P) -> Result<usize> {
        let mut inserted = 0;
        for batch in storage::read_parquet(path)? {
            let rows = storage::rows_from_batch(entity, &batch)?;
            inserted += self.insert_many(entity, rows).await?.len();
        }
        info!(entity = %entity.qualified_name(), inserted, "imported parquet");
        Ok(inserted)
    }
}

impl RecordStore for MemoryRecordStore {
    #[instrument(level = "debug", skip_all, fields(entity = %entity.qualified_name()))]
    async fn insert(&self, entity: &Entity, row: Row) -> Result<PrimaryKey> {
        let table = self.table(entity)?;
        let plan = self.reference_plan(&table)?;
        let _locks = plan.acquire(self.lock_timeout).await?;

        let view = plan.snapshots();
        let (key, row) = ConstraintValidator::new(&self.registry).validate_insert(entity, row, &view)?;
        drop(view);

        table.modify(|rows| rows.insert(key.clone(), row));
        debug!(%key, "inserted");
        Ok(key)
    }

    #[instrument(level = "debug", skip_all, fields(entity = %entity.qualified_name()))]
    async fn update(&self, entity: &Entity, key: &Row, changes: Row) -> Result<Row> {
        let key = entity.key_of(key)?;
        let table = self.table(entity)?;
        let plan = self.reference_plan(&table)?;
        let _locks = plan.acquire(self.lock_timeout).await?;

        let view = plan.snapshots();
        let row = ConstraintValidator::new(&self.registry).validate_update(entity, &key, changes, &view)?;
        drop(view);

        table.modify(|rows| rows.insert(key.clone(), row.clone()));
        debug!(%key, "updated");
        Ok(row)
    }

    #[instrument(level = "debug", skip_all, fields(entity = %entity.qualified_name()))]
    async fn delete(&self, entity: &Entity, key: &Row) -> Result<DeleteSummary> {
        let key = entity.key_of(key)?;
        let table = self.table(entity)?;
        let validator = ConstraintValidator::new(&self.registry);

        let mut plan = LockPlan::default();
        for dependent in validator.dependent_closure(&table.entity) {
            plan.write(self.table_named(dependent.qualified_name())?);
        }
        let _locks = plan.acquire(self.lock_timeout).await?;

        let view = plan.snapshots();
        let cascade = validator.validate_delete(&table.entity, &key, &view)?;
        drop(view);

        plan.commit(|data| {
            for (e, k) in cascade.deletions() {
                if let Some(rows) = data.get_mut(e.qualified_name()) {
                    Arc::make_mut(&mut **rows).remove(k);
                }
            }
            for (e, k, attributes) in cascade.nullifications() {
                let row = data
                    .get_mut(e.qualified_name())
                    .and_then(|rows| Arc::make_mut(&mut **rows).get_mut(k));
                if let Some(row) = row {
                    for a in attributes {
                        row.set(a.as_str(), Value::Null);
                    }
                }
            }
        });

        let summary = DeleteSummary::from_plan(&cascade);
        if summary.total_deleted() > 1 {
            info!(%key, deleted = summary.total_deleted(), "delete cascaded");
        } else {
            debug!(%key, "deleted");
        }
        Ok(summary)
    }

    async fn fetch(&self, entity: &Entity, restriction: Restriction) -> Result<Fetch> {
        let table = self.table(entity)?;
        let predicate = restriction.compile(entity)?;
        Ok(Fetch::new(table, predicate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{
        ActivationHandle, Attribute, AttributeType, EntityDefinition, OnDelete, Reference,
        SchemaBuilder, SchemaModule,
    };

    struct Fixture;

    impl SchemaModule for Fixture {
        fn name(&self) -> &str {
            "fixture"
        }

        fn declare(&self, schema: &mut SchemaBuilder<'_>) -> Result<()> {
            let subject = schema.define(
                EntityDefinition::manual("Subject")
                    .primary(Attribute::new("subject_id", AttributeType::Int)),
            )?;
            schema.define(
                EntityDefinition::manual("Session")
                    .reference(Reference::to(&subject).on_delete(OnDelete::Cascade))
                    .primary(Attribute::new("session_id", AttributeType::Varchar(16)))
                    .secondary(Attribute::new("session_type", AttributeType::Varchar(32)).nullable())
                    .with_part(
                        EntityDefinition::part("Attribute")
                            .primary(Attribute::new("attribute_name", AttributeType::Varchar(32))),
                    ),
            )?;
            Ok(())
        }
    }

    fn store() -> (MemoryRecordStore, Arc<Entity>, Arc<Entity>) {
        let registry = SchemaRegistry::new(Duration::from_millis(200));
        let handle = registry
            .activate("t_", &(Arc::new(Fixture) as ActivationHandle))
            .unwrap();
        let subject = handle.get("Subject").unwrap();
        let session = handle.get("Session").unwrap();
        (MemoryRecordStore::new(registry), subject, session)
    }

    #[tokio::test]
    async fn test_insert_update_get() {
        let (store, subject, session) = store();
        store.insert(&subject, Row::new().with("subject_id", 1)).await.unwrap();
        let key = Row::new().with("subject_id", 1).with("session_id", "S1");
        store
            .insert(&session, key.clone().with("session_type", "ephys"))
            .await
            .unwrap();

        let updated = store
            .update(&session, &key, Row::new().with("session_type", "behavior"))
            .await
            .unwrap();
        assert_eq!(updated.get("session_type"), Some(&Value::from("behavior")));
        let stored = store.get(&session, &key).unwrap().unwrap();
        assert_eq!(stored, updated);
        assert_eq!(store.len(&session).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cascade_delete_counts() {
        let (store, subject, session) = store();
        let part = session.part("Attribute").unwrap().clone();
        store.insert(&subject, Row::new().with("subject_id", 1)).await.unwrap();
        for s in ["S1", "S2"] {
            let key = Row::new().with("subject_id", 1).with("session_id", s);
            store.insert(&session, key.clone()).await.unwrap();
            store
                .insert(&part, key.with("attribute_name", "depth"))
                .await
                .unwrap();
        }

        let summary = store
            .delete(&subject, &Row::new().with("subject_id", 1))
            .await
            .unwrap();
        assert_eq!(summary.deleted("t_fixture.Subject"), 1);
        assert_eq!(summary.deleted("t_fixture.Session"), 2);
        assert_eq!(summary.deleted("t_fixture.Session.Attribute"), 2);
        assert_eq!(summary.total_deleted(), 5);
        assert!(store.is_empty(&part).unwrap());
    }

    #[tokio::test]
    async fn test_snapshot_survives_writes() {
        let (store, subject, _) = store();
        store.insert(&subject, Row::new().with("subject_id", 1)).await.unwrap();
        let table = store.table(&subject).unwrap();
        let before = table.snapshot();
        store.insert(&subject, Row::new().with("subject_id", 2)).await.unwrap();
        assert_eq!(before.len(), 1);
        assert_eq!(table.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn test_running_fetch_keeps_rows_deleted_by_cascade() {
        let (store, subject, session) = store();
        store.insert(&subject, Row::new().with("subject_id", 1)).await.unwrap();
        for s in ["S1", "S2"] {
            let key = Row::new().with("subject_id", 1).with("session_id", s);
            store.insert(&session, key).await.unwrap();
        }
        let fetch = store.fetch(&session, Restriction::All).await.unwrap();
        let mut pass = fetch.iter();
        assert!(pass.next().is_some());

        store.delete(&subject, &Row::new().with("subject_id", 1)).await.unwrap();
        assert!(pass.next().is_some());
        assert!(fetch.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cascade_visible_to_readers_all_at_once() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let (store, subject, session) = store();
        let store = Arc::new(store);
        for id in 0..50 {
            store.insert(&subject, Row::new().with("subject_id", id)).await.unwrap();
            for s in ["S1", "S2", "S3"] {
                let key = Row::new().with("subject_id", id).with("session_id", s);
                store.insert(&session, key).await.unwrap();
            }
        }

        let done = Arc::new(AtomicBool::new(false));
        let reader = {
            let (store, subject, session, done) =
                (Arc::clone(&store), Arc::clone(&subject), Arc::clone(&session), Arc::clone(&done));
            std::thread::spawn(move || {
                let subjects = store.table(&subject).unwrap();
                let sessions = store.table(&session).unwrap();
                let mut orphans = 0;
                while !done.load(Ordering::Acquire) {
                    let masters = subjects.snapshot();
                    let parts = sessions.snapshot();
                    orphans += parts
                        .keys()
                        .filter(|k| !masters.contains_key(&PrimaryKey::new(vec![k.values()[0].clone()])))
                        .count();
                }
                orphans
            })
        };

        for id in 0..50 {
            store
                .delete(&subject, &Row::new().with("subject_id", id))
                .await
                .unwrap();
        }
        done.store(true, Ordering::Release);
        assert_eq!(reader.join().unwrap(), 0);
        assert!(store.is_empty(&session).unwrap());
    }

    #[tokio::test]
    async fn test_lock_timeout() {
        let (store, subject, _) = store();
        let table = store.table(&subject).unwrap();
        let held = Arc::clone(&table.gate).write_owned().await;

        let err = store
            .insert(&subject, Row::new().with("subject_id", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LockTimeout { ref resource, .. } if resource == "t_fixture.Subject"));
        assert!(err.is_recoverable());

        drop(held);
        assert!(store.insert(&subject, Row::new().with("subject_id", 1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_foreign_descriptor_rejected() {
        let (store, _, _) = store();
        let stray = EntityDefinition::manual("Subject")
            .primary(Attribute::new("subject_id", AttributeType::Varchar(4)))
            .build("t_fixture", &|_: &Entity| -> Result<()> { Ok(()) })
            .unwrap();
        let err = store.insert(&stray, Row::new().with("subject_id", "x")).await.unwrap_err();
        assert!(matches!(err, Error::UnknownEntity(_)));
    }
}
