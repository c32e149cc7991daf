//! Minimal `lab`, `project` and `subject` schemas
//!
//! The session schema references `subject.Subject`, `lab.User` and
//! `project.Project`, which sibling packages own. These modules declare
//! just enough of those schemas to activate and exercise the session
//! schema; deployments with their own upstream modules pass them to
//! [`SessionModule::with_upstream`](super::SessionModule::with_upstream).

use std::sync::Arc;

use crate::schema::{parse_definition, ActivationHandle, EntityKind, SchemaBuilder, SchemaModule};
use crate::Result;

/// `lab.Lab`
pub const LAB_DEFINITION: &str = "
# Table for storing general lab info
lab                 : varchar(24)    # Abbreviated lab name
---
lab_name            : varchar(255)   # full lab name
institution=''      : varchar(255)
address=''          : varchar(255)
time_zone='UTC'     : varchar(64)
";

/// `lab.User`
pub const USER_DEFINITION: &str = "
# Table for storing user information
user                : varchar(32)    # username, short identifier
---
user_email=''       : varchar(128)
user_cellphone=''   : varchar(32)
user_fullname=''    : varchar(64)    # Full name used to uniquely identify an individual
";

/// `lab.Protocol`
pub const PROTOCOL_DEFINITION: &str = "
# Protocol specifics, such as an IACUC, IRB, or other approval
protocol                  : varchar(16)
---
protocol_description=''   : varchar(255)
";

/// `lab.Source`
pub const SOURCE_DEFINITION: &str = "
# Source or supplier of animals
source              : varchar(32)    # abbreviated source name
---
source_name         : varchar(255)
contact_details=''  : varchar(255)
";

/// `project.Project`
pub const PROJECT_DEFINITION: &str = "
project                 : varchar(32)
---
project_description=''  : varchar(1024)
";

/// `project.ProjectUser`
pub const PROJECT_USER_DEFINITION: &str = "
# Users involved in the project
-> Project
-> lab.User
";

/// `subject.Subject`
pub const SUBJECT_DEFINITION: &str = "
# Animal Subject
subject                 : varchar(8)
---
subject_nickname=''     : varchar(64)
sex                     : enum('M', 'F', 'U')
subject_birth_date      : date
subject_description=''  : varchar(1024)
";

/// `subject.Subject.Lab`
pub const SUBJECT_LAB_DEFINITION: &str = "
-> master
-> lab.Lab
---
subject_alias=''        : varchar(32)   # alias of the subject in this lab, if different
";

/// Logical schema `lab`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LabModule;

impl SchemaModule for LabModule {
    fn name(&self) -> &str {
        "lab"
    }

    fn declare(&self, schema: &mut SchemaBuilder<'_>) -> Result<()> {
        schema.define(parse_definition("Lab", EntityKind::Lookup, LAB_DEFINITION, &[])?)?;
        schema.define(parse_definition("User", EntityKind::Lookup, USER_DEFINITION, &[])?)?;
        schema.define(parse_definition("Protocol", EntityKind::Lookup, PROTOCOL_DEFINITION, &[])?)?;
        schema.define(parse_definition("Source", EntityKind::Lookup, SOURCE_DEFINITION, &[])?)?;
        Ok(())
    }
}

/// Logical schema `project`, depending on `lab`.
#[derive(Clone)]
pub struct ProjectModule {
    lab: ActivationHandle,
}

impl ProjectModule {
    /// Project schema over the bundled `lab` module.
    #[must_use]
    pub fn new() -> Self {
        Self::with_lab(Arc::new(LabModule))
    }

    /// Project schema over a caller-supplied `lab` module.
    #[must_use]
    pub fn with_lab(lab: ActivationHandle) -> Self {
        Self { lab }
    }
}

impl Default for ProjectModule {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaModule for ProjectModule {
    fn name(&self) -> &str {
        "project"
    }

    fn dependencies(&self) -> Vec<ActivationHandle> {
        vec![Arc::clone(&self.lab)]
    }

    fn declare(&self, schema: &mut SchemaBuilder<'_>) -> Result<()> {
        let user = schema.dependency(self.lab.name())?.get("User")?;
        let project = schema.define(parse_definition(
            "Project",
            EntityKind::Manual,
            PROJECT_DEFINITION,
            &[],
        )?)?;
        schema.define(parse_definition(
            "ProjectUser",
            EntityKind::Manual,
            PROJECT_USER_DEFINITION,
            &[&project, &user],
        )?)?;
        Ok(())
    }
}

/// Logical schema `subject`, depending on `lab`.
#[derive(Clone)]
pub struct SubjectModule {
    lab: ActivationHandle,
}

impl SubjectModule {
    /// Subject schema over the bundled `lab` module.
    #[must_use]
    pub fn new() -> Self {
        Self::with_lab(Arc::new(LabModule))
    }

    /// Subject schema over a caller-supplied `lab` module.
    #[must_use]
    pub fn with_lab(lab: ActivationHandle) -> Self {
        Self { lab }
    }
}

impl Default for SubjectModule {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaModule for SubjectModule {
    fn name(&self) -> &str {
        "subject"
    }

    fn dependencies(&self) -> Vec<ActivationHandle> {
        vec![Arc::clone(&self.lab)]
    }

    fn declare(&self, schema: &mut SchemaBuilder<'_>) -> Result<()> {
        let lab = schema.dependency(self.lab.name())?.get("Lab")?;
        let subject = parse_definition("Subject", EntityKind::Manual, SUBJECT_DEFINITION, &[])?
            .with_part(parse_definition(
                "Lab",
                EntityKind::Part,
                SUBJECT_LAB_DEFINITION,
                &[&lab],
            )?);
        schema.define(subject)?;
        Ok(())
    }
}
