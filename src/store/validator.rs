//! Write-time constraint checks and cascade planning
//!
//! The validator is pure: it reads table snapshots through [`TableView`]
//! and returns normalized tuples or a delete plan. The store applies the
//! result while it still holds the table locks.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use super::Rows;
use crate::error::{ConstraintKind, Violation};
use crate::schema::{Entity, OnDelete, PrimaryKey, Row, SchemaRegistry, Value};
use crate::{Error, Result};

/// Read access to table contents, keyed by qualified entity name.
pub trait TableView {
    /// Rows of the entity, or `None` if the view does not cover it.
    fn rows(&self, qualified_name: &str) -> Option<&Rows>;
}

impl TableView for FxHashMap<String, Arc<Rows>> {
    fn rows(&self, qualified_name: &str) -> Option<&Rows> {
        self.get(qualified_name).map(|rows| &**rows)
    }
}

impl TableView for FxHashMap<String, Rows> {
    fn rows(&self, qualified_name: &str) -> Option<&Rows> {
        self.get(qualified_name)
    }
}

/// Records removed or rewritten by one delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CascadePlan {
    deletions: Vec<(Arc<Entity>, PrimaryKey)>,
    nullify: Vec<(Arc<Entity>, PrimaryKey, Vec<String>)>,
}

impl CascadePlan {
    /// Records to delete, root first.
    #[must_use]
    pub fn deletions(&self) -> &[(Arc<Entity>, PrimaryKey)] {
        &self.deletions
    }

    /// Records whose reference attributes become NULL.
    #[must_use]
    pub fn nullifications(&self) -> &[(Arc<Entity>, PrimaryKey, Vec<String>)] {
        &self.nullify
    }

    /// Deleted record count per qualified entity name.
    #[must_use]
    pub fn deletion_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for (entity, _) in &self.deletions {
            *counts.entry(entity.qualified_name().to_string()).or_insert(0) += 1;
        }
        counts
    }
}

struct Blocker {
    parent: Arc<Entity>,
    parent_key: PrimaryKey,
    dependent: Arc<Entity>,
    key: PrimaryKey,
}

/// Checks tuples against entity declarations and plans cascades.
#[derive(Debug, Clone, Copy)]
pub struct ConstraintValidator<'a> {
    registry: &'a SchemaRegistry,
}

impl<'a> ConstraintValidator<'a> {
    /// Validator resolving dependents through `registry`.
    #[must_use]
    pub const fn new(registry: &'a SchemaRegistry) -> Self {
        Self { registry }
    }

    /// Check a tuple against the heading and normalize it: reject unknown
    /// attributes, fill defaults, coerce values to their declared types.
    ///
    /// Foreign keys and key uniqueness are not checked here.
    ///
    /// # Errors
    ///
    /// `ConstraintViolation` naming the attribute and value.
    pub fn normalize(&self, entity: &Entity, mut row: Row) -> Result<Row> {
        let entity_name = entity.qualified_name();
        if let Some(unknown) = row.names().find(|n| entity.attribute(n).is_none()) {
            return Err(Violation::new(ConstraintKind::UnknownAttribute, entity_name)
                .attribute(unknown)
                .detail(format!("not in the heading of `{}`", entity.name()))
                .into());
        }

        let mut normalized = Row::new();
        for attr in entity.heading() {
            let value = match row.remove(attr.name()) {
                Some(v) => v,
                None => match attr.default_value() {
                    Some(default) => default.clone(),
                    None => {
                        return Err(Violation::new(ConstraintKind::MissingAttribute, entity_name)
                            .attribute(attr.name())
                            .detail(format!("{} is required", attr.attr_type()))
                            .into())
                    }
                },
            };
            if value.is_null() {
                if !attr.is_nullable() {
                    return Err(Violation::new(ConstraintKind::NullNotAllowed, entity_name)
                        .attribute(attr.name())
                        .value(Value::Null)
                        .into());
                }
                normalized.set(attr.name(), Value::Null);
                continue;
            }
            let value = attr.attr_type().normalize(value.clone()).map_err(|(kind, detail)| {
                Violation::new(kind, entity_name)
                    .attribute(attr.name())
                    .value(value)
                    .detail(detail)
            })?;
            normalized.set(attr.name(), value);
        }
        Ok(normalized)
    }

    /// Validate a tuple for insertion.
    ///
    /// `tables` must cover the entity and every referenced entity.
    ///
    /// # Errors
    ///
    /// `ConstraintViolation` for heading, type, reference or uniqueness
    /// violations.
    pub fn validate_insert(
        &self,
        entity: &Entity,
        row: Row,
        tables: &impl TableView,
    ) -> Result<(PrimaryKey, Row)> {
        let row = self.normalize(entity, row)?;
        let key = entity.key_of(&row)?;
        Self::check_references(entity, &row, tables)?;
        if tables
            .rows(entity.qualified_name())
            .is_some_and(|rows| rows.contains_key(&key))
        {
            return Err(Violation::new(ConstraintKind::DuplicateKey, entity.qualified_name())
                .detail(format!("{key} already exists"))
                .into());
        }
        Ok((key, row))
    }

    /// Validate changes to the secondary attributes of an existing record
    /// and return the merged tuple.
    ///
    /// Key attributes may appear in `changes` only with their current value.
    ///
    /// # Errors
    ///
    /// `NotFound` for an absent key, `ConstraintViolation` otherwise.
    pub fn validate_update(
        &self,
        entity: &Entity,
        key: &PrimaryKey,
        changes: Row,
        tables: &impl TableView,
    ) -> Result<Row> {
        let existing = tables
            .rows(entity.qualified_name())
            .and_then(|rows| rows.get(key))
            .ok_or_else(|| Error::NotFound {
                entity: entity.qualified_name().to_string(),
                key: key.to_string(),
            })?;

        let mut merged = existing.clone();
        for (name, value) in changes {
            let Some(attr) = entity.attribute(&name) else {
                return Err(Violation::new(ConstraintKind::UnknownAttribute, entity.qualified_name())
                    .attribute(name)
                    .into());
            };
            if entity.is_primary(&name) {
                let unchanged = attr
                    .attr_type()
                    .normalize(value.clone())
                    .is_ok_and(|v| Some(&v) == existing.get(&name));
                if !unchanged {
                    return Err(Violation::new(ConstraintKind::PrimaryKeyImmutable, entity.qualified_name())
                        .attribute(name)
                        .value(value)
                        .into());
                }
            }
            merged.set(name, value);
        }

        let merged = self.normalize(entity, merged)?;
        Self::check_references(entity, &merged, tables)?;
        Ok(merged)
    }

    /// Plan the delete of one record: the record itself, every part and
    /// cascading dependent, transitively, and every nullifying reference.
    ///
    /// `tables` must cover [`dependent_closure`](Self::dependent_closure).
    ///
    /// # Errors
    ///
    /// `NotFound` for an absent key, `CascadeBlocked` when a restricting
    /// reference would be left dangling.
    pub fn validate_delete(
        &self,
        entity: &Arc<Entity>,
        key: &PrimaryKey,
        tables: &impl TableView,
    ) -> Result<CascadePlan> {
        let present = tables
            .rows(entity.qualified_name())
            .is_some_and(|rows| rows.contains_key(key));
        if !present {
            return Err(Error::NotFound {
                entity: entity.qualified_name().to_string(),
                key: key.to_string(),
            });
        }

        let mut plan = CascadePlan::default();
        let mut doomed: FxHashSet<(String, PrimaryKey)> = FxHashSet::default();
        let mut blockers = Vec::new();
        let mut queue = VecDeque::from([(Arc::clone(entity), key.clone())]);
        doomed.insert((entity.qualified_name().to_string(), key.clone()));

        while let Some((parent, parent_key)) = queue.pop_front() {
            for dependent in self.registry.dependents(parent.qualified_name()) {
                let Some(rows) = tables.rows(dependent.qualified_name()) else {
                    continue;
                };
                for fk in dependent
                    .foreign_keys()
                    .iter()
                    .filter(|fk| fk.target() == parent.qualified_name())
                {
                    let referencing = rows
                        .iter()
                        .filter(|(_, row)| fk.key_in(row).as_ref() == Some(&parent_key))
                        .map(|(k, _)| k.clone());
                    let policy = if fk.is_master_link() {
                        OnDelete::Cascade
                    } else {
                        fk.on_delete()
                    };
                    for dependent_key in referencing {
                        match policy {
                            OnDelete::Cascade => {
                                let id = (dependent.qualified_name().to_string(), dependent_key.clone());
                                if doomed.insert(id) {
                                    queue.push_back((Arc::clone(&dependent), dependent_key));
                                }
                            }
                            OnDelete::Nullify => plan.nullify.push((
                                Arc::clone(&dependent),
                                dependent_key,
                                fk.attributes().to_vec(),
                            )),
                            OnDelete::Restrict => blockers.push(Blocker {
                                parent: Arc::clone(&parent),
                                parent_key: parent_key.clone(),
                                dependent: Arc::clone(&dependent),
                                key: dependent_key,
                            }),
                        }
                    }
                }
            }
            plan.deletions.push((parent, parent_key));
        }

        // A restricting reference only blocks if its row survives the delete.
        let blocking: Vec<&Blocker> = blockers
            .iter()
            .filter(|b| !doomed.contains(&(b.dependent.qualified_name().to_string(), b.key.clone())))
            .collect();
        if let Some(first) = blocking.first() {
            let dependents = blocking
                .iter()
                .filter(|b| {
                    b.parent.qualified_name() == first.parent.qualified_name()
                        && b.parent_key == first.parent_key
                        && b.dependent.qualified_name() == first.dependent.qualified_name()
                })
                .count();
            return Err(Error::CascadeBlocked {
                entity: first.parent.qualified_name().to_string(),
                key: first.parent_key.to_string(),
                dependent: first.dependent.qualified_name().to_string(),
                dependents,
            });
        }

        plan.nullify
            .retain(|(e, k, _)| !doomed.contains(&(e.qualified_name().to_string(), k.clone())));
        Ok(plan)
    }

    /// The entity and every entity that (transitively) references it, in
    /// discovery order.
    #[must_use]
    pub fn dependent_closure(&self, entity: &Arc<Entity>) -> Vec<Arc<Entity>> {
        let mut seen: FxHashSet<String> = FxHashSet::default();
        let mut closure = Vec::new();
        let mut queue = VecDeque::from([Arc::clone(entity)]);
        seen.insert(entity.qualified_name().to_string());
        while let Some(current) = queue.pop_front() {
            for dependent in self.registry.dependents(current.qualified_name()) {
                if seen.insert(dependent.qualified_name().to_string()) {
                    queue.push_back(dependent);
                }
            }
            closure.push(current);
        }
        closure
    }

    fn check_references(entity: &Entity, row: &Row, tables: &impl TableView) -> Result<()> {
        for fk in entity.foreign_keys() {
            let Some(target_key) = fk.key_in(row) else {
                continue;
            };
            if target_key.values().iter().any(Value::is_null) {
                return Err(Violation::new(ConstraintKind::NullNotAllowed, entity.qualified_name())
                    .attribute(fk.target())
                    .detail(format!("reference {target_key} is partially NULL"))
                    .into());
            }
            let exists = tables
                .rows(fk.target())
                .is_some_and(|rows| rows.contains_key(&target_key));
            if !exists {
                return Err(Violation::new(ConstraintKind::DanglingForeignKey, entity.qualified_name())
                    .attribute(fk.target())
                    .detail(format!("no record {target_key} in `{}`", fk.target()))
                    .into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{
        ActivationHandle, Attribute, AttributeType, EntityDefinition, Reference, SchemaBuilder,
        SchemaModule,
    };

    struct Fixture;

    impl SchemaModule for Fixture {
        fn name(&self) -> &str {
            "fixture"
        }

        fn declare(&self, schema: &mut SchemaBuilder<'_>) -> Result<()> {
            let subject = schema.define(
                EntityDefinition::manual("Subject")
                    .primary(Attribute::new("subject_id", AttributeType::Int))
                    .secondary(Attribute::new("species", AttributeType::Varchar(8)).with_default("mouse")),
            )?;
            let session = schema.define(
                EntityDefinition::manual("Session")
                    .references(&subject)
                    .primary(Attribute::new("session_id", AttributeType::Varchar(16)))
                    .secondary(Attribute::new("session_type", AttributeType::Varchar(32)).nullable())
                    .with_part(
                        EntityDefinition::part("Attribute")
                            .primary(Attribute::new("attribute_name", AttributeType::Varchar(32))),
                    ),
            )?;
            schema.define(
                EntityDefinition::manual("SessionNote")
                    .reference(Reference::to(&session).on_delete(OnDelete::Cascade))
                    .secondary(Attribute::new("note", AttributeType::Varchar(64))),
            )?;
            schema.define(
                EntityDefinition::manual("Cage")
                    .primary(Attribute::new("cage", AttributeType::Int))
                    .secondary_reference(Reference::to(&subject).nullable().on_delete(OnDelete::Nullify)),
            )?;
            Ok(())
        }
    }

    fn registry() -> SchemaRegistry {
        let registry = SchemaRegistry::default();
        registry
            .activate("t_", &(Arc::new(Fixture) as ActivationHandle))
            .unwrap();
        registry
    }

    fn entity(registry: &SchemaRegistry, name: &str) -> Arc<Entity> {
        registry.entity(&format!("t_fixture.{name}")).unwrap()
    }

    fn put(tables: &mut FxHashMap<String, Rows>, entity: &Entity, row: Row) {
        let key = entity.key_of(&row).unwrap();
        tables
            .entry(entity.qualified_name().to_string())
            .or_default()
            .insert(key, row);
    }

    #[test]
    fn test_insert_fills_defaults_and_nulls() {
        let registry = registry();
        let validator = ConstraintValidator::new(&registry);
        let subject = entity(&registry, "Subject");
        let tables = FxHashMap::<String, Rows>::default();

        let (key, row) = validator
            .validate_insert(&subject, Row::new().with("subject_id", 1), &tables)
            .unwrap();
        assert_eq!(key, PrimaryKey::new(vec![Value::Int(1)]));
        assert_eq!(row.get("species"), Some(&Value::from("mouse")));
    }

    #[test]
    fn test_insert_violations() {
        let registry = registry();
        let validator = ConstraintValidator::new(&registry);
        let subject = entity(&registry, "Subject");
        let session = entity(&registry, "Session");
        let mut tables = FxHashMap::<String, Rows>::default();
        put(&mut tables, &subject, Row::new().with("subject_id", 1).with("species", "mouse"));

        let kind = |row: Row, e: &Entity| {
            validator
                .validate_insert(e, row, &tables)
                .unwrap_err()
                .violation()
                .map(|v| v.kind)
        };
        assert_eq!(kind(Row::new(), &subject), Some(ConstraintKind::MissingAttribute));
        assert_eq!(
            kind(Row::new().with("subject_id", 2).with("color", "red"), &subject),
            Some(ConstraintKind::UnknownAttribute)
        );
        assert_eq!(
            kind(Row::new().with("subject_id", "two"), &subject),
            Some(ConstraintKind::TypeMismatch)
        );
        assert_eq!(
            kind(Row::new().with("subject_id", 2).with("species", "hedgehogs"), &subject),
            Some(ConstraintKind::ValueTooLong)
        );
        assert_eq!(
            kind(Row::new().with("subject_id", 2).with("species", Value::Null), &subject),
            Some(ConstraintKind::NullNotAllowed)
        );
        assert_eq!(
            kind(Row::new().with("subject_id", 1), &subject),
            Some(ConstraintKind::DuplicateKey)
        );
        assert_eq!(
            kind(Row::new().with("subject_id", 99).with("session_id", "S1"), &session),
            Some(ConstraintKind::DanglingForeignKey)
        );
        assert!(validator
            .validate_insert(&session, Row::new().with("subject_id", 1).with("session_id", "S1"), &tables)
            .is_ok());
    }

    #[test]
    fn test_update_rules() {
        let registry = registry();
        let validator = ConstraintValidator::new(&registry);
        let subject = entity(&registry, "Subject");
        let mut tables = FxHashMap::<String, Rows>::default();
        put(&mut tables, &subject, Row::new().with("subject_id", 1).with("species", "mouse"));
        let key = PrimaryKey::new(vec![Value::Int(1)]);

        let merged = validator
            .validate_update(&subject, &key, Row::new().with("species", "rat"), &tables)
            .unwrap();
        assert_eq!(merged.get("species"), Some(&Value::from("rat")));

        // Restating the key is fine, changing it is not.
        assert!(validator
            .validate_update(&subject, &key, Row::new().with("subject_id", 1), &tables)
            .is_ok());
        let err = validator
            .validate_update(&subject, &key, Row::new().with("subject_id", 2), &tables)
            .unwrap_err();
        assert_eq!(err.violation().unwrap().kind, ConstraintKind::PrimaryKeyImmutable);

        let missing = PrimaryKey::new(vec![Value::Int(7)]);
        assert!(matches!(
            validator.validate_update(&subject, &missing, Row::new(), &tables),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_delete_plan_cascades_restricts_and_nullifies() {
        let registry = registry();
        let validator = ConstraintValidator::new(&registry);
        let subject = entity(&registry, "Subject");
        let session = entity(&registry, "Session");
        let part = entity(&registry, "Session.Attribute");
        let note = entity(&registry, "SessionNote");
        let cage = entity(&registry, "Cage");

        let mut tables = FxHashMap::<String, Rows>::default();
        put(&mut tables, &subject, Row::new().with("subject_id", 1).with("species", "mouse"));
        put(&mut tables, &session, Row::new().with("subject_id", 1).with("session_id", "S1"));
        put(
            &mut tables,
            &part,
            Row::new().with("subject_id", 1).with("session_id", "S1").with("attribute_name", "a"),
        );
        put(
            &mut tables,
            &note,
            Row::new().with("subject_id", 1).with("session_id", "S1").with("note", "n"),
        );
        put(&mut tables, &cage, Row::new().with("cage", 3).with("subject_id", 1));

        let session_key = session
            .key_of(&Row::new().with("subject_id", 1).with("session_id", "S1"))
            .unwrap();
        let plan = validator.validate_delete(&session, &session_key, &tables).unwrap();
        let counts = plan.deletion_counts();
        assert_eq!(counts.get("t_fixture.Session"), Some(&1));
        assert_eq!(counts.get("t_fixture.Session.Attribute"), Some(&1));
        assert_eq!(counts.get("t_fixture.SessionNote"), Some(&1));
        assert!(plan.nullifications().is_empty());

        let subject_key = PrimaryKey::new(vec![Value::Int(1)]);
        let err = validator.validate_delete(&subject, &subject_key, &tables).unwrap_err();
        match err {
            Error::CascadeBlocked { dependent, dependents, .. } => {
                assert_eq!(dependent, "t_fixture.Session");
                assert_eq!(dependents, 1);
            }
            other => panic!("unexpected error: {other}"),
        }

        // Without the session, only the nullifying cage reference remains.
        tables.get_mut("t_fixture.Session").unwrap().clear();
        let plan = validator.validate_delete(&subject, &subject_key, &tables).unwrap();
        assert_eq!(plan.deletions().len(), 1);
        assert_eq!(plan.nullifications().len(), 1);
        assert_eq!(plan.nullifications()[0].2, ["subject_id"]);
    }

    #[test]
    fn test_dependent_closure() {
        let registry = registry();
        let validator = ConstraintValidator::new(&registry);
        let closure: Vec<String> = validator
            .dependent_closure(&entity(&registry, "Subject"))
            .iter()
            .map(|e| e.qualified_name().to_string())
            .collect();
        assert_eq!(closure[0], "t_fixture.Subject");
        assert!(closure.contains(&"t_fixture.Session.Attribute".to_string()));
        assert!(closure.contains(&"t_fixture.SessionNote".to_string()));
        assert!(closure.contains(&"t_fixture.Cage".to_string()));
        assert_eq!(closure.len(), 5);
    }
}
