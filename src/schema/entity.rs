//! Entity descriptors and the definition builder
//!
//! An [`EntityDefinition`] is a template; defining it inside a schema
//! produces an immutable [`Entity`] descriptor. Foreign keys take resolved
//! descriptors, never names, so the reference graph is explicit.
//!
//! ```text
//! Subject (1) ──< Session (N) ──< Session.Attribute (N)   [part]
//!                    │
//!                    ├──< SessionDirectory (0..1)
//!                    ├──< SessionNote (0..1)
//!                    └──< SessionExperimenter >── User
//! ```

use std::collections::HashMap;
use std::fmt;
use std::fmt::Write as _;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{Attribute, PrimaryKey, Row, Value};
use crate::error::{ConstraintKind, Violation};
use crate::{Error, Result};

/// Table tier, carried as plain data on the descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    /// Rows entered by hand or by external tools
    Manual,
    /// Small reference tables
    Lookup,
    /// Rows imported from external data
    Imported,
    /// Rows computed from upstream tables
    Computed,
    /// Rows subordinate to a master row
    Part,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Manual => "manual",
            Self::Lookup => "lookup",
            Self::Imported => "imported",
            Self::Computed => "computed",
            Self::Part => "part",
        };
        f.write_str(s)
    }
}

/// What happens to dependent rows when a referenced row is deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OnDelete {
    /// Deletion fails while dependents exist
    #[default]
    Restrict,
    /// Dependents are deleted too
    Cascade,
    /// Dependents' reference attributes are set to NULL (nullable references only)
    Nullify,
}

/// A resolved foreign key on an entity descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    target: String,
    target_name: String,
    attributes: Vec<String>,
    identifying: bool,
    nullable: bool,
    on_delete: OnDelete,
    master: bool,
}

impl ForeignKey {
    /// Qualified name of the referenced entity.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Inherited attribute names, in the referenced primary-key order.
    #[must_use]
    pub fn attributes(&self) -> &[String] {
        &self.attributes
    }

    /// Whether the inherited attributes are part of the primary key.
    #[must_use]
    pub const fn is_identifying(&self) -> bool {
        self.identifying
    }

    /// Whether the reference may be NULL.
    #[must_use]
    pub const fn is_nullable(&self) -> bool {
        self.nullable
    }

    /// Delete policy.
    #[must_use]
    pub const fn on_delete(&self) -> OnDelete {
        self.on_delete
    }

    /// Whether this is the implicit part → master reference.
    #[must_use]
    pub const fn is_master_link(&self) -> bool {
        self.master
    }

    /// Referenced key values taken from a dependent row, or `None` when
    /// every component is NULL.
    pub(crate) fn key_in(&self, row: &Row) -> Option<PrimaryKey> {
        let values: Vec<Value> = self
            .attributes
            .iter()
            .map(|a| row.get(a).cloned().unwrap_or(Value::Null))
            .collect();
        if values.iter().all(Value::is_null) {
            None
        } else {
            Some(PrimaryKey::new(values))
        }
    }
}

/// Immutable entity descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    schema: String,
    name: String,
    qualified: String,
    kind: EntityKind,
    comment: Option<String>,
    primary_key: Vec<Attribute>,
    secondary: Vec<Attribute>,
    foreign_keys: Vec<ForeignKey>,
    master: Option<String>,
    parts: Vec<Arc<Entity>>,
}

impl Entity {
    /// Namespace that owns the entity.
    #[must_use]
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Entity name; parts are named `Master.Part`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `namespace.Name`, unique across the registry.
    #[must_use]
    pub fn qualified_name(&self) -> &str {
        &self.qualified
    }

    /// Table tier.
    #[must_use]
    pub const fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Table comment.
    #[must_use]
    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    /// Primary-key attributes in declaration order.
    #[must_use]
    pub fn primary_key(&self) -> &[Attribute] {
        &self.primary_key
    }

    /// Secondary attributes in declaration order.
    #[must_use]
    pub fn secondary(&self) -> &[Attribute] {
        &self.secondary
    }

    /// Full heading: primary key first, then secondary attributes.
    pub fn heading(&self) -> impl Iterator<Item = &Attribute> {
        self.primary_key.iter().chain(self.secondary.iter())
    }

    /// Look up an attribute by name.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.heading().find(|a| a.name() == name)
    }

    /// Whether `name` is a primary-key attribute.
    #[must_use]
    pub fn is_primary(&self, name: &str) -> bool {
        self.primary_key.iter().any(|a| a.name() == name)
    }

    /// Foreign keys, master link first for parts.
    #[must_use]
    pub fn foreign_keys(&self) -> &[ForeignKey] {
        &self.foreign_keys
    }

    /// Qualified name of the master, for part entities.
    #[must_use]
    pub fn master(&self) -> Option<&str> {
        self.master.as_deref()
    }

    /// Part entities declared inside this one.
    #[must_use]
    pub fn parts(&self) -> &[Arc<Self>] {
        &self.parts
    }

    /// Look up a part by its local name (`"Attribute"`) or full name.
    #[must_use]
    pub fn part(&self, name: &str) -> Option<&Arc<Self>> {
        self.parts.iter().find(|p| {
            p.name == name || p.name.rsplit('.').next() == Some(name)
        })
    }

    /// Extract (and type-normalize) the primary key from a tuple.
    ///
    /// # Errors
    ///
    /// Constraint violation when a key attribute is missing, NULL, or of
    /// the wrong type.
    pub fn key_of(&self, row: &Row) -> Result<PrimaryKey> {
        let mut values = Vec::with_capacity(self.primary_key.len());
        for attr in &self.primary_key {
            let value = match row.get(attr.name()) {
                None | Some(Value::Null) => {
                    return Err(Violation::new(ConstraintKind::MissingAttribute, &self.qualified)
                        .attribute(attr.name())
                        .detail("primary-key attribute required")
                        .into())
                }
                Some(v) => v.clone(),
            };
            let value = attr.attr_type().normalize(value.clone()).map_err(|(kind, detail)| {
                Violation::new(kind, &self.qualified)
                    .attribute(attr.name())
                    .value(value)
                    .detail(detail)
            })?;
            values.push(value);
        }
        Ok(PrimaryKey::new(values))
    }

    /// The key as a tuple of primary-key attributes.
    #[must_use]
    pub fn key_row(&self, key: &PrimaryKey) -> Row {
        self.primary_key
            .iter()
            .zip(key.values())
            .map(|(a, v)| (a.name().to_string(), v.clone()))
            .collect()
    }

    /// Namespace-independent rendering of the declaration, used to compare
    /// definitions activated under different namespaces.
    #[must_use]
    pub fn signature(&self) -> String {
        let mut out = String::new();
        self.write_signature(&mut out);
        out
    }

    fn write_signature(&self, out: &mut String) {
        let _ = writeln!(out, "{} {}", self.kind, self.name);
        for attr in &self.primary_key {
            let _ = writeln!(out, "  {attr}");
        }
        out.push_str("  ---\n");
        for attr in &self.secondary {
            let _ = writeln!(out, "  {attr}");
        }
        for fk in &self.foreign_keys {
            let _ = writeln!(
                out,
                "  -> {} {:?} identifying={} nullable={} {:?}",
                fk.target_name, fk.attributes, fk.identifying, fk.nullable, fk.on_delete
            );
        }
        for part in &self.parts {
            part.write_signature(out);
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.qualified, self.kind)
    }
}

/// A foreign-key declaration against a resolved descriptor.
#[derive(Debug, Clone)]
pub struct Reference {
    target: Arc<Entity>,
    nullable: bool,
    on_delete: OnDelete,
}

impl Reference {
    /// Reference `target` with the default (restrict) policy.
    #[must_use]
    pub fn to(target: &Arc<Entity>) -> Self {
        Self {
            target: Arc::clone(target),
            nullable: false,
            on_delete: OnDelete::Restrict,
        }
    }

    /// Allow NULL references (secondary references only).
    #[must_use]
    pub const fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Delete policy.
    #[must_use]
    pub const fn on_delete(mut self, policy: OnDelete) -> Self {
        self.on_delete = policy;
        self
    }

    /// Referenced descriptor.
    #[must_use]
    pub const fn target(&self) -> &Arc<Entity> {
        &self.target
    }
}

#[derive(Debug, Clone)]
enum Item {
    Attr(Attribute),
    Ref(Reference),
}

/// Template describing an entity before it is defined in a schema.
///
/// ```rust
/// use element_session::schema::{Attribute, AttributeType, EntityDefinition};
///
/// let def = EntityDefinition::manual("Subject")
///     .primary(Attribute::new("subject_id", AttributeType::Int))
///     .secondary(Attribute::new("species", AttributeType::Varchar(32)).nullable());
/// assert_eq!(def.name(), "Subject");
/// ```
#[derive(Debug, Clone)]
pub struct EntityDefinition {
    name: String,
    kind: EntityKind,
    comment: Option<String>,
    primary: Vec<Item>,
    secondary: Vec<Item>,
    parts: Vec<EntityDefinition>,
}

impl EntityDefinition {
    /// Start a definition of the given tier.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: EntityKind) -> Self {
        Self {
            name: name.into(),
            kind,
            comment: None,
            primary: Vec::new(),
            secondary: Vec::new(),
            parts: Vec::new(),
        }
    }

    /// Manual table.
    #[must_use]
    pub fn manual(name: impl Into<String>) -> Self {
        Self::new(name, EntityKind::Manual)
    }

    /// Lookup table.
    #[must_use]
    pub fn lookup(name: impl Into<String>) -> Self {
        Self::new(name, EntityKind::Lookup)
    }

    /// Part table, to be nested with [`with_part`](Self::with_part).
    #[must_use]
    pub fn part(name: impl Into<String>) -> Self {
        Self::new(name, EntityKind::Part)
    }

    /// Entity name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Table tier.
    #[must_use]
    pub const fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Table comment, if set.
    #[must_use]
    pub fn comment_text(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    /// Table comment.
    #[must_use]
    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Local primary-key attribute.
    #[must_use]
    pub fn primary(mut self, attr: Attribute) -> Self {
        self.primary.push(Item::Attr(attr));
        self
    }

    /// Secondary attribute.
    #[must_use]
    pub fn secondary(mut self, attr: Attribute) -> Self {
        self.secondary.push(Item::Attr(attr));
        self
    }

    /// Identifying reference: the target's key joins this primary key.
    #[must_use]
    pub fn references(self, target: &Arc<Entity>) -> Self {
        self.reference(Reference::to(target))
    }

    /// Identifying reference with an explicit policy.
    #[must_use]
    pub fn reference(mut self, reference: Reference) -> Self {
        self.primary.push(Item::Ref(reference));
        self
    }

    /// Non-identifying reference: the target's key becomes secondary
    /// attributes.
    #[must_use]
    pub fn secondary_reference(mut self, reference: Reference) -> Self {
        self.secondary.push(Item::Ref(reference));
        self
    }

    /// Nest a part entity.
    #[must_use]
    pub fn with_part(mut self, part: Self) -> Self {
        self.parts.push(part);
        self
    }

    /// Validate the definition and produce the descriptor.
    ///
    /// `resolve` is asked about every reference target and must fail for
    /// targets that are not resolved yet.
    pub(crate) fn build(
        self,
        schema: &str,
        resolve: &dyn Fn(&Entity) -> Result<()>,
    ) -> Result<Arc<Entity>> {
        if self.kind == EntityKind::Part {
            return Err(Error::definition(
                &self.name,
                "part entities must be nested inside their master",
            ));
        }
        check_name(&self.name)?;

        let mut heading = Heading::new(&self.name);
        heading.add_items(self.primary, true, resolve)?;
        heading.add_items(self.secondary, false, resolve)?;
        let master_key = heading.primary.clone();
        let mut master = heading.finish(schema, self.kind, self.comment, None)?;

        let mut parts = Vec::with_capacity(self.parts.len());
        for part in self.parts {
            parts.push(part.build_part(schema, &master, &master_key, resolve)?);
        }
        if let Some(dup) = first_duplicate(parts.iter().map(|p| p.name.as_str())) {
            return Err(Error::definition(&master.name, format!("part `{dup}` declared twice")));
        }
        master.parts = parts;
        Ok(Arc::new(master))
    }

    fn build_part(
        self,
        schema: &str,
        master: &Entity,
        master_key: &[Attribute],
        resolve: &dyn Fn(&Entity) -> Result<()>,
    ) -> Result<Arc<Entity>> {
        let full_name = format!("{}.{}", master.name, self.name);
        if self.kind != EntityKind::Part {
            return Err(Error::definition(
                &full_name,
                format!("nested entity must be a part, not {}", self.kind),
            ));
        }
        check_name(&self.name)?;
        if !self.parts.is_empty() {
            return Err(Error::definition(&full_name, "part entities cannot have parts"));
        }

        let mut heading = Heading::new(&full_name);
        for attr in master_key {
            heading.push_inherited(attr.inherited(false), true, &master.qualified)?;
        }
        heading.foreign_keys.push(ForeignKey {
            target: master.qualified.clone(),
            target_name: master.name.clone(),
            attributes: master_key.iter().map(|a| a.name().to_string()).collect(),
            identifying: true,
            nullable: false,
            on_delete: OnDelete::Cascade,
            master: true,
        });
        heading.add_items(self.primary, true, resolve)?;
        heading.add_items(self.secondary, false, resolve)?;
        if heading.primary.len() == master_key.len() {
            return Err(Error::definition(
                &full_name,
                "part primary key must extend the master key",
            ));
        }
        let entity = heading.finish(
            schema,
            EntityKind::Part,
            self.comment,
            Some(master.qualified.clone()),
        )?;
        Ok(Arc::new(entity))
    }
}

fn check_name(name: &str) -> Result<()> {
    let valid = name.chars().next().is_some_and(char::is_alphabetic)
        && name.chars().all(|c| c.is_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::definition(name, "entity names must be alphanumeric identifiers"))
    }
}

fn first_duplicate<'a>(mut names: impl Iterator<Item = &'a str>) -> Option<&'a str> {
    let mut seen = std::collections::HashSet::new();
    names.find(|n| !seen.insert(*n))
}

/// Where an attribute of the heading under construction came from.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Origin {
    Local,
    Inherited,
}

struct Heading {
    entity: String,
    primary: Vec<Attribute>,
    secondary: Vec<Attribute>,
    foreign_keys: Vec<ForeignKey>,
    origin: HashMap<String, Origin>,
}

impl Heading {
    fn new(entity: &str) -> Self {
        Self {
            entity: entity.to_string(),
            primary: Vec::new(),
            secondary: Vec::new(),
            foreign_keys: Vec::new(),
            origin: HashMap::new(),
        }
    }

    fn existing(&self, name: &str) -> Option<&Attribute> {
        self.primary
            .iter()
            .chain(self.secondary.iter())
            .find(|a| a.name() == name)
    }

    fn add_items(
        &mut self,
        items: Vec<Item>,
        primary: bool,
        resolve: &dyn Fn(&Entity) -> Result<()>,
    ) -> Result<()> {
        for item in items {
            match item {
                Item::Attr(attr) => self.push_local(attr, primary)?,
                Item::Ref(reference) => self.push_reference(reference, primary, resolve)?,
            }
        }
        Ok(())
    }

    fn push_local(&mut self, attr: Attribute, primary: bool) -> Result<()> {
        if let Some(Origin::Inherited) = self.origin.get(attr.name()) {
            return Err(Error::definition(
                &self.entity,
                format!("attribute `{}` collides with an inherited key attribute", attr.name()),
            ));
        }
        if self.existing(attr.name()).is_some() {
            return Err(Error::definition(
                &self.entity,
                format!("attribute `{}` declared twice", attr.name()),
            ));
        }
        check_attribute(&self.entity, &attr, primary)?;
        self.origin.insert(attr.name().to_string(), Origin::Local);
        if primary {
            self.primary.push(attr);
        } else {
            self.secondary.push(attr);
        }
        Ok(())
    }

    /// Add an inherited attribute; identical inherited attributes merge.
    fn push_inherited(&mut self, attr: Attribute, primary: bool, source: &str) -> Result<()> {
        if let Some(existing) = self.existing(attr.name()) {
            let mergeable = self.origin.get(attr.name()) == Some(&Origin::Inherited)
                && existing.attr_type() == attr.attr_type()
                && self.primary.iter().any(|a| a.name() == attr.name()) == primary;
            if mergeable {
                return Ok(());
            }
            return Err(Error::definition(
                &self.entity,
                format!(
                    "attribute `{}` inherited from `{source}` collides with an existing attribute",
                    attr.name()
                ),
            ));
        }
        self.origin.insert(attr.name().to_string(), Origin::Inherited);
        if primary {
            self.primary.push(attr);
        } else {
            self.secondary.push(attr);
        }
        Ok(())
    }

    fn push_reference(
        &mut self,
        reference: Reference,
        primary: bool,
        resolve: &dyn Fn(&Entity) -> Result<()>,
    ) -> Result<()> {
        let target = &reference.target;
        resolve(target)?;
        if primary && reference.nullable {
            return Err(Error::definition(
                &self.entity,
                format!("identifying reference to `{}` cannot be nullable", target.qualified),
            ));
        }
        if reference.on_delete == OnDelete::Nullify && !(reference.nullable && !primary) {
            return Err(Error::definition(
                &self.entity,
                format!(
                    "reference to `{}` can only nullify on delete when it is a nullable secondary reference",
                    target.qualified
                ),
            ));
        }
        if self.foreign_keys.iter().any(|fk| fk.target == target.qualified && !fk.master) {
            return Err(Error::definition(
                &self.entity,
                format!("`{}` referenced twice", target.qualified),
            ));
        }
        for attr in &target.primary_key {
            self.push_inherited(attr.inherited(reference.nullable), primary, &target.qualified)?;
        }
        self.foreign_keys.push(ForeignKey {
            target: target.qualified.clone(),
            target_name: target.name.clone(),
            attributes: target.primary_key.iter().map(|a| a.name().to_string()).collect(),
            identifying: primary,
            nullable: reference.nullable,
            on_delete: reference.on_delete,
            master: false,
        });
        Ok(())
    }

    fn finish(
        self,
        schema: &str,
        kind: EntityKind,
        comment: Option<String>,
        master: Option<String>,
    ) -> Result<Entity> {
        if self.primary.is_empty() {
            return Err(Error::definition(&self.entity, "primary key is empty"));
        }
        Ok(Entity {
            schema: schema.to_string(),
            qualified: format!("{schema}.{}", self.entity),
            name: self.entity,
            kind,
            comment,
            primary_key: self.primary,
            secondary: self.secondary,
            foreign_keys: self.foreign_keys,
            master,
            parts: Vec::new(),
        })
    }
}

fn check_attribute(entity: &str, attr: &Attribute, primary: bool) -> Result<()> {
    use super::AttributeType;

    if attr.name().is_empty()
        || !attr.name().chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        || attr.name().starts_with(|c: char| c.is_ascii_digit())
    {
        return Err(Error::definition(
            entity,
            format!("attribute name `{}` must be lowercase snake_case", attr.name()),
        ));
    }
    match attr.attr_type() {
        AttributeType::Varchar(0) => {
            return Err(Error::definition(
                entity,
                format!("attribute `{}` has zero length", attr.name()),
            ))
        }
        AttributeType::Enum(options) if options.is_empty() => {
            return Err(Error::definition(
                entity,
                format!("attribute `{}` has an empty enum", attr.name()),
            ))
        }
        _ => {}
    }
    if primary {
        if attr.is_nullable() {
            return Err(Error::definition(
                entity,
                format!("primary-key attribute `{}` cannot be nullable", attr.name()),
            ));
        }
        if !attr.attr_type().allowed_in_primary_key() {
            return Err(Error::definition(
                entity,
                format!("{} attribute `{}` cannot be in the primary key", attr.attr_type(), attr.name()),
            ));
        }
    }
    if let Some(default) = attr.default_value() {
        if !default.is_null() {
            attr.attr_type().normalize(default.clone()).map_err(|(_, detail)| {
                Error::definition(
                    entity,
                    format!("default of `{}` is invalid: {detail}", attr.name()),
                )
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::AttributeType;

    fn resolved(_: &Entity) -> Result<()> {
        Ok(())
    }

    fn subject() -> Arc<Entity> {
        EntityDefinition::manual("Subject")
            .primary(Attribute::new("subject_id", AttributeType::Int))
            .build("lab_subject", &resolved)
            .unwrap()
    }

    #[test]
    fn test_identifying_reference_prefixes_primary_key() {
        let subject = subject();
        let session = EntityDefinition::manual("Session")
            .references(&subject)
            .primary(Attribute::new("session_id", AttributeType::Varchar(16)))
            .secondary(Attribute::new("session_type", AttributeType::Varchar(32)).nullable())
            .build("lab_session", &resolved)
            .unwrap();

        let key: Vec<&str> = session.primary_key().iter().map(Attribute::name).collect();
        assert_eq!(key, ["subject_id", "session_id"]);
        assert_eq!(session.qualified_name(), "lab_session.Session");
        assert_eq!(session.foreign_keys()[0].target(), "lab_subject.Subject");
        assert_eq!(session.foreign_keys()[0].on_delete(), OnDelete::Restrict);
    }

    #[test]
    fn test_primary_secondary_collision_rejected() {
        let err = EntityDefinition::manual("Probe")
            .primary(Attribute::new("probe", AttributeType::Varchar(8)))
            .secondary(Attribute::new("probe", AttributeType::Int))
            .build("s", &resolved)
            .unwrap_err();
        assert!(matches!(err, Error::SchemaDefinition { ref entity, .. } if entity == "Probe"));
        assert!(err.to_string().contains("`probe`"));
    }

    #[test]
    fn test_local_attribute_colliding_with_inherited_rejected() {
        let err = EntityDefinition::manual("Session")
            .references(&subject())
            .primary(Attribute::new("subject_id", AttributeType::Int))
            .build("s", &resolved)
            .unwrap_err();
        assert!(err.to_string().contains("inherited"));
    }

    #[test]
    fn test_part_inherits_master_key_and_cascades() {
        let session = EntityDefinition::manual("Session")
            .references(&subject())
            .primary(Attribute::new("session_id", AttributeType::Varchar(16)))
            .with_part(
                EntityDefinition::part("Attribute")
                    .primary(Attribute::new("attribute_name", AttributeType::Varchar(32)))
                    .secondary(
                        Attribute::new("attribute_value", AttributeType::Varchar(2000))
                            .with_default(""),
                    ),
            )
            .build("s", &resolved)
            .unwrap();

        let part = session.part("Attribute").unwrap();
        assert_eq!(part.name(), "Session.Attribute");
        assert_eq!(part.master(), Some("s.Session"));
        let key: Vec<&str> = part.primary_key().iter().map(Attribute::name).collect();
        assert_eq!(key, ["subject_id", "session_id", "attribute_name"]);
        let link = &part.foreign_keys()[0];
        assert!(link.is_master_link());
        assert_eq!(link.on_delete(), OnDelete::Cascade);
    }

    #[test]
    fn test_part_local_key_colliding_with_master_rejected() {
        let err = EntityDefinition::manual("Session")
            .primary(Attribute::new("session_id", AttributeType::Varchar(16)))
            .with_part(
                EntityDefinition::part("Attribute")
                    .primary(Attribute::new("session_id", AttributeType::Varchar(16))),
            )
            .build("s", &resolved)
            .unwrap_err();
        assert!(matches!(err, Error::SchemaDefinition { ref entity, .. } if entity == "Session.Attribute"));
    }

    #[test]
    fn test_unresolved_reference_rejected() {
        let subject = subject();
        let err = EntityDefinition::manual("Session")
            .references(&subject)
            .primary(Attribute::new("session_id", AttributeType::Varchar(16)))
            .build("s", &|target: &Entity| -> Result<()> {
                Err(Error::definition("Session", format!("`{}` is not resolved", target.qualified_name())))
            })
            .unwrap_err();
        assert!(err.to_string().contains("lab_subject.Subject"));
    }

    #[test]
    fn test_nullable_primary_and_blob_key_rejected() {
        let nullable = EntityDefinition::manual("A")
            .primary(Attribute::new("a", AttributeType::Int).nullable())
            .build("s", &resolved);
        assert!(nullable.is_err());

        let blob = EntityDefinition::manual("B")
            .primary(Attribute::new("b", AttributeType::Blob))
            .build("s", &resolved);
        assert!(blob.is_err());

        let empty = EntityDefinition::manual("C")
            .secondary(Attribute::new("c", AttributeType::Int))
            .build("s", &resolved);
        assert!(empty.is_err());
    }

    #[test]
    fn test_zero_length_varchar_and_empty_enum_rejected() {
        for ty in [AttributeType::Varchar(0), AttributeType::Enum(vec![])] {
            let err = EntityDefinition::manual("Subject")
                .primary(Attribute::new("subject_id", AttributeType::Int))
                .secondary(Attribute::new("code", ty))
                .build("s", &resolved)
                .unwrap_err();
            assert!(matches!(err, Error::SchemaDefinition { .. }), "got {err}");
        }
        let err = EntityDefinition::manual("Subject")
            .primary(Attribute::new("code", AttributeType::Varchar(0)))
            .build("s", &resolved)
            .unwrap_err();
        assert!(err.to_string().contains("zero length"));
    }

    #[test]
    fn test_invalid_default_rejected() {
        let err = EntityDefinition::manual("Subject")
            .primary(Attribute::new("subject_id", AttributeType::Int))
            .secondary(
                Attribute::new("sex", AttributeType::Enum(vec!["M".into(), "F".into()]))
                    .with_default("X"),
            )
            .build("s", &resolved)
            .unwrap_err();
        assert!(err.to_string().contains("default of `sex`"));
    }

    #[test]
    fn test_nullify_requires_nullable_secondary_reference() {
        let subject = subject();
        let err = EntityDefinition::manual("Cage")
            .primary(Attribute::new("cage", AttributeType::Int))
            .secondary_reference(Reference::to(&subject).on_delete(OnDelete::Nullify))
            .build("s", &resolved)
            .unwrap_err();
        assert!(err.to_string().contains("nullify"));

        let ok = EntityDefinition::manual("Cage")
            .primary(Attribute::new("cage", AttributeType::Int))
            .secondary_reference(Reference::to(&subject).nullable().on_delete(OnDelete::Nullify))
            .build("s", &resolved)
            .unwrap();
        assert!(ok.attribute("subject_id").unwrap().is_nullable());
    }

    #[test]
    fn test_shared_inherited_attribute_merges() {
        let subject = subject();
        let session = EntityDefinition::manual("Session")
            .references(&subject)
            .primary(Attribute::new("session_id", AttributeType::Int))
            .build("s", &resolved)
            .unwrap();
        let paired = EntityDefinition::manual("Pairing")
            .references(&subject)
            .references(&session)
            .build("s", &resolved)
            .unwrap();
        let key: Vec<&str> = paired.primary_key().iter().map(Attribute::name).collect();
        assert_eq!(key, ["subject_id", "session_id"]);
    }

    #[test]
    fn test_key_of_requires_all_key_attributes() {
        let subject = subject();
        assert!(subject.key_of(&Row::new().with("subject_id", 4)).is_ok());
        let err = subject.key_of(&Row::new()).unwrap_err();
        assert_eq!(err.violation().unwrap().kind, ConstraintKind::MissingAttribute);
    }

    #[test]
    fn test_signature_ignores_namespace() {
        let a = subject();
        let b = EntityDefinition::manual("Subject")
            .primary(Attribute::new("subject_id", AttributeType::Int))
            .build("other_subject", &resolved)
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(a.signature(), b.signature());
    }
}
