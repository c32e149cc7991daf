//! Columnar export (Arrow/Parquet)
//!
//! The layout follows the entity heading exactly:
//! - one field per attribute, primary key first, in declaration order
//! - field nullability as declared
//! - schema metadata `primary_key` listing the key attributes
//! - field metadata `type` holding the declared attribute type
//! - rows in primary-key order
//!
//! | Attribute type        | Arrow type                    |
//! |-----------------------|-------------------------------|
//! | `int`                 | `Int64`                       |
//! | `double`              | `Float64`                     |
//! | `bool`                | `Boolean`                     |
//! | `varchar(n)`, `enum`  | `Utf8`                        |
//! | `date`                | `Date32`                      |
//! | `datetime`            | `Timestamp(Microsecond, None)`|
//! | `longblob`            | `Binary`                      |

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BinaryArray, BooleanArray, Date32Array, Float64Array, Int64Array, StringArray,
    TimestampMicrosecondArray,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Datelike, NaiveDate};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;

use crate::schema::{Attribute, AttributeType, Entity, Row, Value};
use crate::{Error, Result};

/// Schema metadata key listing the primary-key attributes, comma separated
pub const PRIMARY_KEY_METADATA: &str = "primary_key";

/// Field metadata key holding the declared attribute type
pub const TYPE_METADATA: &str = "type";

/// Days from 0001-01-01 (CE) to 1970-01-01
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// Arrow type used for an attribute type.
#[must_use]
pub fn arrow_type(attr_type: &AttributeType) -> DataType {
    match attr_type {
        AttributeType::Int => DataType::Int64,
        AttributeType::Float => DataType::Float64,
        AttributeType::Bool => DataType::Boolean,
        AttributeType::Varchar(_) | AttributeType::Enum(_) => DataType::Utf8,
        AttributeType::Date => DataType::Date32,
        AttributeType::Datetime => DataType::Timestamp(TimeUnit::Microsecond, None),
        AttributeType::Blob => DataType::Binary,
    }
}

/// Arrow schema for an entity heading.
#[must_use]
pub fn schema_for(entity: &Entity) -> SchemaRef {
    let fields: Vec<Field> = entity
        .heading()
        .map(|attr| {
            Field::new(attr.name(), arrow_type(attr.attr_type()), attr.is_nullable()).with_metadata(
                HashMap::from([(TYPE_METADATA.to_string(), attr.attr_type().to_string())]),
            )
        })
        .collect();
    let key = entity
        .primary_key()
        .iter()
        .map(Attribute::name)
        .collect::<Vec<_>>()
        .join(",");
    Arc::new(Schema::new_with_metadata(
        fields,
        HashMap::from([(PRIMARY_KEY_METADATA.to_string(), key)]),
    ))
}

/// Build a record batch from rows already normalized for `entity`.
///
/// Rows are written in the order given; pass them in key order.
///
/// # Errors
///
/// Returns error if a value does not match its attribute type.
pub fn to_record_batch<'a>(
    entity: &Entity,
    rows: impl IntoIterator<Item = &'a Row>,
) -> Result<RecordBatch> {
    let rows: Vec<&Row> = rows.into_iter().collect();
    let columns = entity
        .heading()
        .map(|attr| column(entity, attr, &rows))
        .collect::<Result<Vec<ArrayRef>>>()?;
    Ok(RecordBatch::try_new(schema_for(entity), columns)?)
}

fn column(entity: &Entity, attr: &Attribute, rows: &[&Row]) -> Result<ArrayRef> {
    let values = rows.iter().map(|row| row.get(attr.name()).unwrap_or(&Value::Null));
    let mismatch = |v: &Value| {
        Error::StorageError(format!(
            "`{}`.`{}`: cannot store {v} as {}",
            entity.qualified_name(),
            attr.name(),
            attr.attr_type()
        ))
    };
    let array: ArrayRef = match attr.attr_type() {
        AttributeType::Int => Arc::new(Int64Array::from(
            values
                .map(|v| match v {
                    Value::Null => Ok(None),
                    Value::Int(i) => Ok(Some(*i)),
                    other => Err(mismatch(other)),
                })
                .collect::<Result<Vec<_>>>()?,
        )),
        AttributeType::Float => Arc::new(Float64Array::from(
            values
                .map(|v| match v {
                    Value::Null => Ok(None),
                    Value::Float(x) => Ok(Some(*x)),
                    other => Err(mismatch(other)),
                })
                .collect::<Result<Vec<_>>>()?,
        )),
        AttributeType::Bool => Arc::new(BooleanArray::from(
            values
                .map(|v| match v {
                    Value::Null => Ok(None),
                    Value::Bool(b) => Ok(Some(*b)),
                    other => Err(mismatch(other)),
                })
                .collect::<Result<Vec<_>>>()?,
        )),
        AttributeType::Varchar(_) | AttributeType::Enum(_) => Arc::new(StringArray::from(
            values
                .map(|v| match v {
                    Value::Null => Ok(None),
                    Value::Text(s) => Ok(Some(s.as_str())),
                    other => Err(mismatch(other)),
                })
                .collect::<Result<Vec<_>>>()?,
        )),
        AttributeType::Date => Arc::new(Date32Array::from(
            values
                .map(|v| match v {
                    Value::Null => Ok(None),
                    Value::Date(d) => Ok(Some(d.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE)),
                    other => Err(mismatch(other)),
                })
                .collect::<Result<Vec<_>>>()?,
        )),
        AttributeType::Datetime => Arc::new(TimestampMicrosecondArray::from(
            values
                .map(|v| match v {
                    Value::Null => Ok(None),
                    Value::Datetime(dt) => Ok(Some(dt.and_utc().timestamp_micros())),
                    other => Err(mismatch(other)),
                })
                .collect::<Result<Vec<_>>>()?,
        )),
        AttributeType::Blob => Arc::new(BinaryArray::from_opt_vec(
            values
                .map(|v| match v {
                    Value::Null => Ok(None),
                    Value::Blob(b) => Ok(Some(b.as_slice())),
                    other => Err(mismatch(other)),
                })
                .collect::<Result<Vec<_>>>()?,
        )),
    };
    Ok(array)
}

/// Convert a batch with the entity's layout back into tuples.
///
/// Heading attributes without a column are left out of the tuples, so
/// inserting them applies the declared defaults.
///
/// # Errors
///
/// Returns error on a different primary key, a column of the wrong Arrow
/// type, or a column outside the heading.
pub fn rows_from_batch(entity: &Entity, batch: &RecordBatch) -> Result<Vec<Row>> {
    let schema = batch.schema();
    if let Some(key) = schema.metadata().get(PRIMARY_KEY_METADATA) {
        let expected: Vec<&str> = entity.primary_key().iter().map(Attribute::name).collect();
        if key.split(',').collect::<Vec<_>>() != expected {
            return Err(Error::StorageError(format!(
                "`{}`: batch primary key ({key}) does not match ({})",
                entity.qualified_name(),
                expected.join(",")
            )));
        }
    }
    if let Some(extra) = schema
        .fields()
        .iter()
        .find(|f| entity.attribute(f.name()).is_none())
    {
        return Err(Error::StorageError(format!(
            "`{}`: column `{}` is not in the heading",
            entity.qualified_name(),
            extra.name()
        )));
    }

    let mut rows = vec![Row::new(); batch.num_rows()];
    for attr in entity.heading() {
        let Some(col) = batch.column_by_name(attr.name()) else {
            continue;
        };
        let expected = arrow_type(attr.attr_type());
        if col.data_type() != &expected {
            return Err(Error::StorageError(format!(
                "`{}`.`{}`: expected {expected}, found {}",
                entity.qualified_name(),
                attr.name(),
                col.data_type()
            )));
        }
        for (i, row) in rows.iter_mut().enumerate() {
            row.set(attr.name(), cell(col, attr.attr_type(), i)?);
        }
    }
    Ok(rows)
}

fn downcast<'a, T: 'static>(col: &'a ArrayRef) -> Result<&'a T> {
    col.as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| Error::StorageError(format!("unexpected array type {}", col.data_type())))
}

fn cell(col: &ArrayRef, attr_type: &AttributeType, i: usize) -> Result<Value> {
    if col.is_null(i) {
        return Ok(Value::Null);
    }
    Ok(match attr_type {
        AttributeType::Int => Value::Int(downcast::<Int64Array>(col)?.value(i)),
        AttributeType::Float => Value::Float(downcast::<Float64Array>(col)?.value(i)),
        AttributeType::Bool => Value::Bool(downcast::<BooleanArray>(col)?.value(i)),
        AttributeType::Varchar(_) | AttributeType::Enum(_) => {
            Value::Text(downcast::<StringArray>(col)?.value(i).to_string())
        }
        AttributeType::Date => {
            let days = downcast::<Date32Array>(col)?.value(i);
            NaiveDate::from_num_days_from_ce_opt(days + UNIX_EPOCH_DAYS_FROM_CE)
                .map(Value::Date)
                .ok_or_else(|| Error::StorageError(format!("date out of range: {days}")))?
        }
        AttributeType::Datetime => {
            let micros = downcast::<TimestampMicrosecondArray>(col)?.value(i);
            DateTime::from_timestamp_micros(micros)
                .map(|dt| Value::Datetime(dt.naive_utc()))
                .ok_or_else(|| Error::StorageError(format!("timestamp out of range: {micros}")))?
        }
        AttributeType::Blob => Value::Blob(downcast::<BinaryArray>(col)?.value(i).to_vec()),
    })
}

/// Write one batch to a Parquet file.
///
/// # Errors
///
/// Returns error if the file cannot be created or written.
pub fn write_parquet<P: AsRef<Path>>(path: P, batch: &RecordBatch) -> Result<()> {
    let file = File::create(path.as_ref())?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)?;
    writer.write(batch)?;
    writer.close()?;
    Ok(())
}

/// Read every batch of a Parquet file.
///
/// # Errors
///
/// Returns error if the file cannot be read or parsed.
pub fn read_parquet<P: AsRef<Path>>(path: P) -> Result<Vec<RecordBatch>> {
    let file = File::open(path.as_ref())
        .map_err(|e| Error::StorageError(format!("Failed to open Parquet file: {e}")))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
    reader
        .map(|batch| batch.map_err(Error::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::EntityDefinition;
    use chrono::NaiveDateTime;

    fn entity() -> Arc<Entity> {
        EntityDefinition::manual("Session")
            .primary(Attribute::new("subject", AttributeType::Varchar(8)))
            .primary(Attribute::new("session_id", AttributeType::Int))
            .secondary(Attribute::new("session_datetime", AttributeType::Datetime).nullable())
            .secondary(Attribute::new("session_date", AttributeType::Date).nullable())
            .secondary(Attribute::new("quality", AttributeType::Float).with_default(0.0))
            .secondary(Attribute::new("curated", AttributeType::Bool).with_default(false))
            .secondary(Attribute::new("sex", AttributeType::Enum(vec!["M".into(), "F".into()])).nullable())
            .secondary(Attribute::new("blob", AttributeType::Blob).nullable())
            .build("test_session", &|_: &Entity| -> Result<()> { Ok(()) })
            .unwrap()
    }

    fn sample() -> Vec<Row> {
        let dt = NaiveDateTime::parse_from_str("2023-05-01 10:30:00.125", "%Y-%m-%d %H:%M:%S%.f").unwrap();
        vec![
            Row::new()
                .with("subject", "M01")
                .with("session_id", 1)
                .with("session_datetime", dt)
                .with("session_date", dt.date())
                .with("quality", 0.5)
                .with("curated", true)
                .with("sex", "F")
                .with("blob", vec![1u8, 2, 3]),
            Row::new()
                .with("subject", "M01")
                .with("session_id", 2)
                .with("session_datetime", Value::Null)
                .with("session_date", Value::Null)
                .with("quality", 0.0)
                .with("curated", false)
                .with("sex", Value::Null)
                .with("blob", Value::Null),
        ]
    }

    #[test]
    fn test_schema_follows_heading() {
        let schema = schema_for(&entity());
        let names: Vec<&str> = schema.fields().iter().map(|f| f.name().as_str()).collect();
        assert_eq!(
            names,
            ["subject", "session_id", "session_datetime", "session_date", "quality", "curated", "sex", "blob"]
        );
        assert!(!schema.field(0).is_nullable());
        assert!(schema.field(2).is_nullable());
        assert!(!schema.field(4).is_nullable());
        assert_eq!(schema.metadata()[PRIMARY_KEY_METADATA], "subject,session_id");
        assert_eq!(schema.field(6).metadata()[TYPE_METADATA], "enum('M', 'F')");
    }

    #[test]
    fn test_batch_round_trip() {
        let entity = entity();
        let rows = sample();
        let batch = to_record_batch(&entity, &rows).unwrap();
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.num_columns(), 8);
        assert_eq!(rows_from_batch(&entity, &batch).unwrap(), rows);
    }

    #[test]
    fn test_parquet_round_trip() {
        let entity = entity();
        let rows = sample();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.parquet");

        write_parquet(&path, &to_record_batch(&entity, &rows).unwrap()).unwrap();
        let batches = read_parquet(&path).unwrap();
        let read: Vec<Row> = batches
            .iter()
            .flat_map(|b| rows_from_batch(&entity, b).unwrap())
            .collect();
        assert_eq!(read, rows);
        assert_eq!(batches[0].schema().metadata()[PRIMARY_KEY_METADATA], "subject,session_id");
    }

    #[test]
    fn test_layout_mismatch_rejected() {
        let entity = entity();
        let other = EntityDefinition::manual("Other")
            .primary(Attribute::new("other_id", AttributeType::Int))
            .build("test_session", &|_: &Entity| -> Result<()> { Ok(()) })
            .unwrap();
        let batch = to_record_batch(&other, &[Row::new().with("other_id", 1)]).unwrap();
        assert!(matches!(rows_from_batch(&entity, &batch), Err(Error::StorageError(_))));
    }

    #[test]
    fn test_unnormalized_value_rejected() {
        let entity = entity();
        let bad = Row::new().with("subject", "M01").with("session_id", "one");
        assert!(to_record_batch(&entity, [&bad]).is_err());
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            read_parquet("/nonexistent/session.parquet"),
            Err(Error::StorageError(_))
        ));
    }
}
