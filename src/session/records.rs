//! Session Record - typed tuple for the `Session` entity

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::schema::{Row, Value};
use crate::{Error, Result};

/// A `Session` tuple.
///
/// Converts to and from the untyped [`Row`] the record store works with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionRecord {
    subject: String,
    session_id: String,
    session_datetime: Option<NaiveDateTime>,
    session_type: Option<String>,
}

impl SessionRecord {
    /// Create a session with no datetime or type.
    #[must_use]
    pub fn new(subject: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self::builder(subject, session_id).build()
    }

    /// Create a builder for the optional fields.
    #[must_use]
    pub fn builder(
        subject: impl Into<String>,
        session_id: impl Into<String>,
    ) -> SessionRecordBuilder {
        SessionRecordBuilder::new(subject, session_id)
    }

    /// Get the subject.
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Get the session identifier.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Get the session start, if recorded.
    #[must_use]
    pub const fn session_datetime(&self) -> Option<NaiveDateTime> {
        self.session_datetime
    }

    /// Get the session type, if recorded.
    #[must_use]
    pub fn session_type(&self) -> Option<&str> {
        self.session_type.as_deref()
    }

    /// Primary-key tuple `(subject, session_id)`.
    #[must_use]
    pub fn key(&self) -> Row {
        Row::new()
            .with("subject", self.subject.as_str())
            .with("session_id", self.session_id.as_str())
    }

    /// Full tuple; unset optional fields are sent as NULL.
    #[must_use]
    pub fn to_row(&self) -> Row {
        self.key()
            .with("session_datetime", self.session_datetime)
            .with("session_type", self.session_type.clone())
    }

    /// Read a fetched `Session` tuple.
    ///
    /// # Errors
    ///
    /// Returns `ParseError` if a key attribute is missing or an attribute
    /// has the wrong type.
    pub fn from_row(row: &Row) -> Result<Self> {
        let text = |name: &str| -> Result<Option<String>> {
            match row.get(name) {
                None | Some(Value::Null) => Ok(None),
                Some(Value::Text(s)) => Ok(Some(s.clone())),
                Some(other) => Err(Error::ParseError(format!("`{name}` is not text: {other}"))),
            }
        };
        let required = |name: &str| -> Result<String> {
            text(name)?.ok_or_else(|| Error::ParseError(format!("missing `{name}`")))
        };
        let session_datetime = match row.get("session_datetime") {
            None | Some(Value::Null) => None,
            Some(Value::Datetime(dt)) => Some(*dt),
            Some(other) => {
                return Err(Error::ParseError(format!(
                    "`session_datetime` is not a datetime: {other}"
                )))
            }
        };
        Ok(Self {
            subject: required("subject")?,
            session_id: required("session_id")?,
            session_datetime,
            session_type: text("session_type")?,
        })
    }
}

/// Builder for `SessionRecord`.
#[derive(Debug)]
pub struct SessionRecordBuilder {
    subject: String,
    session_id: String,
    session_datetime: Option<NaiveDateTime>,
    session_type: Option<String>,
}

impl SessionRecordBuilder {
    /// Create a new builder with the key fields.
    #[must_use]
    pub fn new(subject: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            session_id: session_id.into(),
            session_datetime: None,
            session_type: None,
        }
    }

    /// Set the session start.
    #[must_use]
    pub const fn session_datetime(mut self, datetime: NaiveDateTime) -> Self {
        self.session_datetime = Some(datetime);
        self
    }

    /// Set the session type, e.g. `ephys`.
    #[must_use]
    pub fn session_type(mut self, session_type: impl Into<String>) -> Self {
        self.session_type = Some(session_type.into());
        self
    }

    /// Build the `SessionRecord`.
    #[must_use]
    pub fn build(self) -> SessionRecord {
        SessionRecord {
            subject: self.subject,
            session_id: self.session_id,
            session_datetime: self.session_datetime,
            session_type: self.session_type,
        }
    }
}
