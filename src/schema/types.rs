//! Attribute types and attribute declarations
//!
//! The type vocabulary is the one DataJoint definitions use: the `int`
//! family, floating types, `bool`, `varchar(n)`, `enum(...)`, `date`,
//! `datetime` and blobs.

use std::fmt;

use chrono::{NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

use super::Value;
use crate::error::ConstraintKind;

/// Declared type of an attribute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "arg", rename_all = "lowercase")]
pub enum AttributeType {
    /// Integer family (`tinyint` .. `bigint`), stored as 64-bit signed
    Int,
    /// `float`, `double`, `decimal`
    Float,
    /// `bool` / `boolean`
    Bool,
    /// `varchar(n)` / `char(n)`: text of at most `n` characters
    Varchar(u32),
    /// `enum('a', 'b', ...)`
    Enum(Vec<String>),
    /// `date`
    Date,
    /// `datetime`, microsecond precision
    Datetime,
    /// `blob` / `longblob`
    Blob,
}

const DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// Datetimes are stored at microsecond precision, the resolution of the
/// columnar export.
fn truncate_micros(dt: NaiveDateTime) -> NaiveDateTime {
    dt.with_nanosecond(dt.nanosecond() / 1_000 * 1_000).unwrap_or(dt)
}

impl AttributeType {
    /// Whether attributes of this type may take part in a primary key.
    #[must_use]
    pub const fn allowed_in_primary_key(&self) -> bool {
        !matches!(self, Self::Blob)
    }

    /// Coerce a value into this type.
    ///
    /// NULL passes through; nullability is the caller's concern.
    pub(crate) fn normalize(&self, value: Value) -> Result<Value, (ConstraintKind, String)> {
        let mismatch = |v: &Value| (ConstraintKind::TypeMismatch, format!("expected {self}, got {v}"));
        match (self, value) {
            (_, Value::Null) => Ok(Value::Null),
            (Self::Int, v @ Value::Int(_))
            | (Self::Float, v @ Value::Float(_))
            | (Self::Bool, v @ Value::Bool(_))
            | (Self::Date, v @ Value::Date(_))
            | (Self::Blob, v @ Value::Blob(_)) => Ok(v),
            #[allow(clippy::cast_precision_loss)]
            (Self::Float, Value::Int(i)) => Ok(Value::Float(i as f64)),
            (Self::Bool, Value::Int(i @ (0 | 1))) => Ok(Value::Bool(i == 1)),
            (Self::Varchar(max), Value::Text(s)) => {
                let len = s.chars().count();
                if len > *max as usize {
                    Err((
                        ConstraintKind::ValueTooLong,
                        format!("{len} characters exceed {self}"),
                    ))
                } else {
                    Ok(Value::Text(s))
                }
            }
            (Self::Enum(options), Value::Text(s)) => {
                if options.iter().any(|o| *o == s) {
                    Ok(Value::Text(s))
                } else {
                    Err((ConstraintKind::NotInEnum, format!("'{s}' is not one of {self}")))
                }
            }
            (Self::Date, Value::Text(s)) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                .map(Value::Date)
                .map_err(|_| mismatch(&Value::Text(s))),
            (Self::Datetime, Value::Datetime(dt)) => Ok(Value::Datetime(truncate_micros(dt))),
            (Self::Datetime, Value::Date(d)) => d
                .and_hms_opt(0, 0, 0)
                .map(Value::Datetime)
                .ok_or_else(|| mismatch(&Value::Date(d))),
            (Self::Datetime, Value::Text(s)) => {
                let trimmed = s.trim();
                DATETIME_FORMATS
                    .iter()
                    .find_map(|f| NaiveDateTime::parse_from_str(trimmed, f).ok())
                    .or_else(|| {
                        NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
                            .ok()
                            .and_then(|d| d.and_hms_opt(0, 0, 0))
                    })
                    .map(|dt| Value::Datetime(truncate_micros(dt)))
                    .ok_or_else(|| mismatch(&Value::Text(s)))
            }
            (_, v) => Err(mismatch(&v)),
        }
    }
}

impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int => f.write_str("int"),
            Self::Float => f.write_str("double"),
            Self::Bool => f.write_str("bool"),
            Self::Varchar(n) => write!(f, "varchar({n})"),
            Self::Enum(options) => {
                f.write_str("enum(")?;
                for (i, o) in options.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "'{o}'")?;
                }
                f.write_str(")")
            }
            Self::Date => f.write_str("date"),
            Self::Datetime => f.write_str("datetime"),
            Self::Blob => f.write_str("longblob"),
        }
    }
}

/// A declared attribute: name, type, nullability, default and comment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attribute {
    name: String,
    attr_type: AttributeType,
    nullable: bool,
    default: Option<Value>,
    comment: Option<String>,
}

impl Attribute {
    /// Create a required attribute.
    #[must_use]
    pub fn new(name: impl Into<String>, attr_type: AttributeType) -> Self {
        Self {
            name: name.into(),
            attr_type,
            nullable: false,
            default: None,
            comment: None,
        }
    }

    /// Make the attribute nullable; a missing value becomes NULL.
    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self.default = Some(Value::Null);
        self
    }

    /// Default used when an insert omits the attribute.
    ///
    /// A NULL default makes the attribute nullable.
    #[must_use]
    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        let value = value.into();
        if value.is_null() {
            self.nullable = true;
        }
        self.default = Some(value);
        self
    }

    /// Attach a comment.
    #[must_use]
    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Attribute name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared type.
    #[must_use]
    pub const fn attr_type(&self) -> &AttributeType {
        &self.attr_type
    }

    /// Whether NULL is allowed.
    #[must_use]
    pub const fn is_nullable(&self) -> bool {
        self.nullable
    }

    /// Default value, if declared.
    #[must_use]
    pub const fn default_value(&self) -> Option<&Value> {
        self.default.as_ref()
    }

    /// Comment, if declared.
    #[must_use]
    pub fn comment_text(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    /// Whether an insert must supply this attribute.
    #[must_use]
    pub const fn is_required(&self) -> bool {
        !self.nullable && self.default.is_none()
    }

    /// Same declaration, ignoring the comment.
    #[must_use]
    pub fn same_definition(&self, other: &Self) -> bool {
        self.name == other.name
            && self.attr_type == other.attr_type
            && self.nullable == other.nullable
            && self.default == other.default
    }

    pub(crate) fn inherited(&self, nullable: bool) -> Self {
        let mut attr = self.clone();
        attr.default = None;
        attr.nullable = false;
        if nullable {
            attr = attr.nullable();
        }
        attr
    }
}

impl PartialEq for Attribute {
    fn eq(&self, other: &Self) -> bool {
        self.same_definition(other) && self.comment == other.comment
    }
}

impl Eq for Attribute {}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        match &self.default {
            Some(Value::Null) => f.write_str("=NULL")?,
            Some(v) => write!(f, "={v}")?,
            None => {}
        }
        write!(f, " : {}", self.attr_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varchar_length_check() {
        let ty = AttributeType::Varchar(4);
        assert!(ty.normalize(Value::from("abcd")).is_ok());
        let (kind, _) = ty.normalize(Value::from("abcde")).unwrap_err();
        assert_eq!(kind, ConstraintKind::ValueTooLong);
    }

    #[test]
    fn test_enum_membership() {
        let ty = AttributeType::Enum(vec!["M".into(), "F".into(), "U".into()]);
        assert!(ty.normalize(Value::from("F")).is_ok());
        let (kind, _) = ty.normalize(Value::from("X")).unwrap_err();
        assert_eq!(kind, ConstraintKind::NotInEnum);
    }

    #[test]
    fn test_datetime_parses_text() {
        let v = AttributeType::Datetime
            .normalize(Value::from("2023-05-01 13:45:10.250"))
            .unwrap();
        let Value::Datetime(dt) = v else {
            panic!("expected datetime, got {v:?}");
        };
        assert_eq!(dt.format("%H:%M:%S%.3f").to_string(), "13:45:10.250");

        assert!(AttributeType::Datetime.normalize(Value::from("yesterday")).is_err());
    }

    #[test]
    fn test_datetime_truncates_to_microseconds() {
        let day = NaiveDate::from_ymd_opt(2023, 5, 1).unwrap();
        let micros = day.and_hms_micro_opt(10, 0, 0, 123_456).unwrap();
        for nanos in [123_456_100, 123_456_900] {
            let dt = day.and_hms_nano_opt(10, 0, 0, nanos).unwrap();
            assert_eq!(
                AttributeType::Datetime.normalize(Value::Datetime(dt)).unwrap(),
                Value::Datetime(micros)
            );
        }
        assert_eq!(
            AttributeType::Datetime
                .normalize(Value::from("2023-05-01 10:00:00.123456789"))
                .unwrap(),
            Value::Datetime(micros)
        );
    }

    #[test]
    fn test_int_widens_to_float_but_not_back() {
        assert_eq!(
            AttributeType::Float.normalize(Value::from(3)).unwrap(),
            Value::from(3.0)
        );
        let (kind, _) = AttributeType::Int.normalize(Value::from(3.5)).unwrap_err();
        assert_eq!(kind, ConstraintKind::TypeMismatch);
    }

    #[test]
    fn test_null_default_makes_nullable() {
        let attr = Attribute::new("session_type", AttributeType::Varchar(32)).with_default(Value::Null);
        assert!(attr.is_nullable());
        assert!(!attr.is_required());
        assert_eq!(attr.to_string(), "session_type=NULL : varchar(32)");
    }

    #[test]
    fn test_blob_not_allowed_in_primary_key() {
        assert!(!AttributeType::Blob.allowed_in_primary_key());
        assert!(AttributeType::Varchar(16).allowed_in_primary_key());
    }
}
