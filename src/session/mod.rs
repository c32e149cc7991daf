//! The session schema
//!
//! ```text
//! subject.Subject ──< Session ──< Session.Attribute        [part]
//!                       │
//!                       ├──< SessionDirectory   (one per session)
//!                       ├──< SessionNote        (one per session)
//!                       ├──< SessionExperimenter >── lab.User
//!                       └──< ProjectSession     >── project.Project
//! ```
//!
//! Every reference uses the default restricting delete policy except the
//! part, which always follows its master.

mod records;
pub mod upstream;

pub use records::{SessionRecord, SessionRecordBuilder};
pub use upstream::{LabModule, ProjectModule, SubjectModule};

use std::sync::Arc;

use crate::schema::{
    parse_definition, ActivationHandle, Entity, EntityKind, SchemaBuilder, SchemaHandle,
    SchemaModule, SchemaRegistry,
};
use crate::Result;

/// `Session`
pub const SESSION_DEFINITION: &str = "
# Top-level, singular, discrete instance of an experiment or task run
-> subject.Subject
session_id                               : VARCHAR(16)                 # session number or other identifier
---
session_datetime=NULL                    : DATETIME                    # beginning of a session as a microsecond precision datetime
session_type=NULL                        : VARCHAR(32)                 # type of session, e.g. 'behavior', 'ephys', 'training', 'recording'
";

/// `Session.Attribute`
pub const SESSION_ATTRIBUTE_DEFINITION: &str = "
-> master
attribute_name: varchar(32)
---
attribute_value='': varchar(2000)
attribute_blob=null: longblob
";

/// `SessionDirectory`
pub const SESSION_DIRECTORY_DEFINITION: &str = "
-> Session
---
session_dir: varchar(256) # Path to the data directory for a session
";

/// `SessionExperimenter`
pub const SESSION_EXPERIMENTER_DEFINITION: &str = "
# Individual(s) conducting the session
-> Session
-> lab.User
";

/// `SessionNote`
pub const SESSION_NOTE_DEFINITION: &str = "
-> Session
---
session_note: varchar(1024)
";

/// `ProjectSession`
pub const PROJECT_SESSION_DEFINITION: &str = "
-> project.Project
-> Session
";

/// Logical schema `session`, depending on `lab`, `project` and `subject`.
#[derive(Clone)]
pub struct SessionModule {
    lab: ActivationHandle,
    project: ActivationHandle,
    subject: ActivationHandle,
}

impl SessionModule {
    /// Session schema over the bundled upstream modules.
    #[must_use]
    pub fn new() -> Self {
        let lab: ActivationHandle = Arc::new(LabModule);
        Self::with_upstream(
            Arc::clone(&lab),
            Arc::new(ProjectModule::with_lab(Arc::clone(&lab))),
            Arc::new(SubjectModule::with_lab(lab)),
        )
    }

    /// Session schema over caller-supplied upstream modules.
    ///
    /// `lab` must publish `User`, `project` must publish `Project` and
    /// `subject` must publish `Subject`.
    #[must_use]
    pub fn with_upstream(
        lab: ActivationHandle,
        project: ActivationHandle,
        subject: ActivationHandle,
    ) -> Self {
        Self {
            lab,
            project,
            subject,
        }
    }
}

impl Default for SessionModule {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaModule for SessionModule {
    fn name(&self) -> &str {
        "session"
    }

    fn dependencies(&self) -> Vec<ActivationHandle> {
        vec![
            Arc::clone(&self.lab),
            Arc::clone(&self.project),
            Arc::clone(&self.subject),
        ]
    }

    fn declare(&self, schema: &mut SchemaBuilder<'_>) -> Result<()> {
        let user = schema.dependency(self.lab.name())?.get("User")?;
        let project = schema.dependency(self.project.name())?.get("Project")?;
        let subject = schema.dependency(self.subject.name())?.get("Subject")?;

        let session = schema.define(
            parse_definition("Session", EntityKind::Manual, SESSION_DEFINITION, &[&subject])?
                .with_part(parse_definition(
                    "Attribute",
                    EntityKind::Part,
                    SESSION_ATTRIBUTE_DEFINITION,
                    &[],
                )?),
        )?;

        let manual = |name: &str, text: &str, refs: &[&Arc<Entity>]| {
            parse_definition(name, EntityKind::Manual, text, refs)
        };
        schema.define(manual("SessionDirectory", SESSION_DIRECTORY_DEFINITION, &[&session])?)?;
        schema.define(manual(
            "SessionExperimenter",
            SESSION_EXPERIMENTER_DEFINITION,
            &[&session, &user],
        )?)?;
        schema.define(manual("SessionNote", SESSION_NOTE_DEFINITION, &[&session])?)?;
        schema.define(manual(
            "ProjectSession",
            PROJECT_SESSION_DEFINITION,
            &[&project, &session],
        )?)?;
        Ok(())
    }
}

/// Typed view of an activated session schema.
#[derive(Debug, Clone)]
pub struct SessionSchema {
    handle: Arc<SchemaHandle>,
    session: Arc<Entity>,
    session_attribute: Arc<Entity>,
    session_directory: Arc<Entity>,
    session_experimenter: Arc<Entity>,
    session_note: Arc<Entity>,
    project_session: Arc<Entity>,
}

impl SessionSchema {
    /// Activate the session schema (and its upstream schemas) under
    /// `prefix`.
    ///
    /// # Errors
    ///
    /// Any activation error.
    pub fn activate(registry: &SchemaRegistry, prefix: &str) -> Result<Self> {
        let module: ActivationHandle = Arc::new(SessionModule::new());
        Self::from_handle(registry.activate(prefix, &module)?)
    }

    /// Wrap an activated session schema.
    ///
    /// # Errors
    ///
    /// `UnknownEntity` if the handle lacks a session entity.
    pub fn from_handle(handle: Arc<SchemaHandle>) -> Result<Self> {
        Ok(Self {
            session: handle.get("Session")?,
            session_attribute: handle.get("Session.Attribute")?,
            session_directory: handle.get("SessionDirectory")?,
            session_experimenter: handle.get("SessionExperimenter")?,
            session_note: handle.get("SessionNote")?,
            project_session: handle.get("ProjectSession")?,
            handle,
        })
    }

    /// Underlying schema handle.
    #[must_use]
    pub const fn handle(&self) -> &Arc<SchemaHandle> {
        &self.handle
    }

    /// Namespace the schema is bound to.
    #[must_use]
    pub fn namespace(&self) -> &str {
        self.handle.namespace()
    }

    /// `Session`
    #[must_use]
    pub const fn session(&self) -> &Arc<Entity> {
        &self.session
    }

    /// `Session.Attribute`
    #[must_use]
    pub const fn session_attribute(&self) -> &Arc<Entity> {
        &self.session_attribute
    }

    /// `SessionDirectory`
    #[must_use]
    pub const fn session_directory(&self) -> &Arc<Entity> {
        &self.session_directory
    }

    /// `SessionExperimenter`
    #[must_use]
    pub const fn session_experimenter(&self) -> &Arc<Entity> {
        &self.session_experimenter
    }

    /// `SessionNote`
    #[must_use]
    pub const fn session_note(&self) -> &Arc<Entity> {
        &self.session_note
    }

    /// `ProjectSession`
    #[must_use]
    pub const fn project_session(&self) -> &Arc<Entity> {
        &self.project_session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Attribute, AttributeType, OnDelete};

    fn names(entity: &Entity) -> Vec<&str> {
        entity.primary_key().iter().map(Attribute::name).collect()
    }

    #[test]
    fn test_activation_order() {
        let registry = SchemaRegistry::default();
        let schema = SessionSchema::activate(&registry, "test_").unwrap();
        assert_eq!(schema.namespace(), "test_session");
        assert_eq!(
            registry.namespaces(),
            ["test_lab", "test_project", "test_subject", "test_session"]
        );
        assert_eq!(
            schema.handle().dependencies(),
            ["test_lab", "test_project", "test_subject"]
        );
    }

    #[test]
    fn test_headings() {
        let registry = SchemaRegistry::default();
        let schema = SessionSchema::activate(&registry, "test_").unwrap();

        assert_eq!(names(schema.session()), ["subject", "session_id"]);
        assert_eq!(
            schema.session().attribute("session_datetime").unwrap().attr_type(),
            &AttributeType::Datetime
        );
        assert_eq!(
            names(schema.session_attribute()),
            ["subject", "session_id", "attribute_name"]
        );
        let blob = schema.session_attribute().attribute("attribute_blob").unwrap();
        assert!(blob.is_nullable());
        assert_eq!(names(schema.session_directory()), ["subject", "session_id"]);
        assert_eq!(
            names(schema.session_experimenter()),
            ["subject", "session_id", "user"]
        );
        assert_eq!(names(schema.session_note()), ["subject", "session_id"]);
        assert_eq!(
            names(schema.project_session()),
            ["project", "subject", "session_id"]
        );
    }

    #[test]
    fn test_references_restrict_except_part() {
        let registry = SchemaRegistry::default();
        let schema = SessionSchema::activate(&registry, "test_").unwrap();
        for fk in schema.session_experimenter().foreign_keys() {
            assert_eq!(fk.on_delete(), OnDelete::Restrict);
            assert!(fk.is_identifying());
        }
        let link = &schema.session_attribute().foreign_keys()[0];
        assert!(link.is_master_link());
        assert_eq!(link.target(), "test_session.Session");

        let dependents: Vec<String> = registry
            .dependents("test_session.Session")
            .iter()
            .map(|e| e.name().to_string())
            .collect();
        assert_eq!(
            dependents,
            [
                "Session.Attribute",
                "SessionDirectory",
                "SessionExperimenter",
                "SessionNote",
                "ProjectSession"
            ]
        );
    }

    #[test]
    fn test_reactivation_returns_same_schema() {
        let registry = SchemaRegistry::default();
        let first = SessionSchema::activate(&registry, "test_").unwrap();
        let second = SessionSchema::activate(&registry, "test_").unwrap();
        assert!(Arc::ptr_eq(first.handle(), second.handle()));
        assert_eq!(registry.dependents("test_subject.Subject").len(), 1);
    }
}
