//! Table snapshot service
//!
//! Opens a table through the session, slices `[offset, offset + limit)` and
//! converts every cell into something JSON can carry:
//!
//! - binary values become base64 text
//! - timestamps, dates and times become ISO-8601 text
//! - numbers, booleans and strings pass through natively
//! - anything else uses Arrow's display formatting
//!
//! Non-finite floats have no JSON form and become `null`.
//!
//! [`preview`] renders the first rows of a table as text for `execute`
//! replies that ask for table previews.

use arrow::array::timezone::Tz;
use arrow::array::{Array, ArrayRef, AsArray};
use arrow::datatypes::{
    ArrowTimestampType, DataType, Date32Type, Date64Type, Float16Type, Float32Type, Float64Type,
    Int16Type, Int32Type, Int64Type, Int8Type, Time32MillisecondType, Time32SecondType,
    Time64MicrosecondType, Time64NanosecondType, TimeUnit, TimestampMicrosecondType,
    TimestampMillisecondType, TimestampNanosecondType, TimestampSecondType, UInt16Type,
    UInt32Type, UInt64Type, UInt8Type, SchemaRef,
};
use arrow::record_batch::RecordBatch;
use arrow::temporal_conversions::{as_datetime, as_datetime_with_timezone};
use arrow::util::display::{ArrayFormatter, FormatOptions};
use arrow::util::pretty::pretty_format_batches;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{NaiveDateTime, SecondsFormat};
use serde_json::Value;

use crate::error::{Result, RunnerError};
use crate::protocol::{ColumnInfo, TableFrame, TableInfo, TablePreview};
use crate::session::Session;
use crate::wrapper::is_internal_name;

const NAIVE_DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";
const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S%.f";

/// Rows rendered by [`preview`]
pub const PREVIEW_ROWS: usize = 10;

/// Width above which the column header is split one column per line
const PREVIEW_HEADER_WIDTH: usize = 80;

/// One converted slice plus the table's refreshing state
#[derive(Debug, Clone, PartialEq)]
pub struct TableSnapshot {
    pub frame: TableFrame,
    pub is_refreshing: bool,
}

/// Snapshot `name`, reporting any failure as a table error
pub fn snapshot(session: &dyn Session, name: &str, offset: usize, limit: usize) -> Result<TableSnapshot> {
    read_snapshot(session, name, offset, limit).map_err(|e| match e {
        RunnerError::Table { .. } => e,
        other => RunnerError::table(name, other),
    })
}

fn read_snapshot(session: &dyn Session, name: &str, offset: usize, limit: usize) -> Result<TableSnapshot> {
    let table = session.open_table(name)?;
    let total_rows = table.row_count();
    let is_refreshing = table.is_refreshing();
    let batch = table.slice_rows(offset, limit)?;

    let schema = batch.schema();
    let columns = schema.fields().iter().map(|f| f.name().clone()).collect();
    let types = schema
        .fields()
        .iter()
        .map(|f| f.data_type().to_string())
        .collect();

    Ok(TableSnapshot {
        frame: TableFrame {
            name: name.to_string(),
            columns,
            types,
            rows: batch_rows(&batch)?,
            total_rows,
            offset,
        },
        is_refreshing,
    })
}

/// Describe one table for `list_tables`; unreadable tables get `row_count = -1`
pub fn describe(session: &dyn Session, name: &str) -> TableInfo {
    match session.open_table(name) {
        Ok(table) => TableInfo {
            name: name.to_string(),
            row_count: i64::try_from(table.row_count()).unwrap_or(i64::MAX),
            is_refreshing: table.is_refreshing(),
            columns: column_infos(&table.schema()),
        },
        Err(e) => {
            tracing::warn!("Could not open table {}: {}", name, e);
            TableInfo {
                name: name.to_string(),
                row_count: -1,
                is_refreshing: false,
                columns: Vec::new(),
            }
        }
    }
}

/// Render the first [`PREVIEW_ROWS`] rows of `name`, optionally under a
/// `Columns: name (type), ...` header
pub fn preview(session: &dyn Session, name: &str, show_meta: bool) -> Result<TablePreview> {
    let table = session.open_table(name)?;
    let row_count = table.row_count();
    let columns = column_infos(&table.schema());

    let mut lines = Vec::new();
    if show_meta {
        let listed = columns
            .iter()
            .map(|c| format!("{} ({})", c.name, c.type_name))
            .collect::<Vec<_>>();
        let header = format!("Columns: {}", listed.join(", "));
        if header.len() > PREVIEW_HEADER_WIDTH {
            lines.push("Columns:".to_string());
            lines.extend(listed.iter().map(|column| format!("  {column}")));
        } else {
            lines.push(header);
        }
        lines.push(String::new());
    }

    if row_count == 0 {
        lines.push("(empty table)".to_string());
    } else {
        let batch = table.slice_rows(0, PREVIEW_ROWS)?;
        lines.push(pretty_format_batches(&[batch])?.to_string());
    }

    Ok(TablePreview {
        name: name.to_string(),
        row_count,
        is_refreshing: table.is_refreshing(),
        columns,
        preview: lines.join("\n"),
    })
}

fn column_infos(schema: &SchemaRef) -> Vec<ColumnInfo> {
    schema
        .fields()
        .iter()
        .map(|f| ColumnInfo {
            name: f.name().clone(),
            type_name: f.data_type().to_string(),
        })
        .collect()
}

/// Sorted table names visible to the user (result tables excluded)
pub fn user_table_names(session: &dyn Session) -> Result<Vec<String>> {
    Ok(session
        .list_table_names()?
        .into_iter()
        .filter(|name| !is_internal_name(name))
        .collect())
}

/// Convert a batch to row-major JSON values
pub fn batch_rows(batch: &RecordBatch) -> Result<Vec<Vec<Value>>> {
    let columns = batch
        .columns()
        .iter()
        .map(column_values)
        .collect::<Result<Vec<_>>>()?;

    let mut rows: Vec<Vec<Value>> = (0..batch.num_rows())
        .map(|_| Vec::with_capacity(columns.len()))
        .collect();
    for column in columns {
        for (row, value) in rows.iter_mut().zip(column) {
            row.push(value);
        }
    }
    Ok(rows)
}

/// Convert one column to JSON values, one per row
pub fn column_values(array: &ArrayRef) -> Result<Vec<Value>> {
    let array = array.as_ref();
    let values = match array.data_type() {
        DataType::Null => vec![Value::Null; array.len()],
        DataType::Boolean => {
            let typed = array.as_boolean();
            map_rows(array, |i| Value::from(typed.value(i)))
        }
        DataType::Int8 => primitive::<Int8Type>(array),
        DataType::Int16 => primitive::<Int16Type>(array),
        DataType::Int32 => primitive::<Int32Type>(array),
        DataType::Int64 => primitive::<Int64Type>(array),
        DataType::UInt8 => primitive::<UInt8Type>(array),
        DataType::UInt16 => primitive::<UInt16Type>(array),
        DataType::UInt32 => primitive::<UInt32Type>(array),
        DataType::UInt64 => primitive::<UInt64Type>(array),
        DataType::Float16 => {
            let typed = array.as_primitive::<Float16Type>();
            map_rows(array, |i| Value::from(typed.value(i).to_f64()))
        }
        DataType::Float32 => {
            let typed = array.as_primitive::<Float32Type>();
            map_rows(array, |i| Value::from(f64::from(typed.value(i))))
        }
        DataType::Float64 => primitive::<Float64Type>(array),
        DataType::Utf8 => {
            let typed = array.as_string::<i32>();
            map_rows(array, |i| Value::from(typed.value(i)))
        }
        DataType::LargeUtf8 => {
            let typed = array.as_string::<i64>();
            map_rows(array, |i| Value::from(typed.value(i)))
        }
        DataType::Utf8View => {
            let typed = array.as_string_view();
            map_rows(array, |i| Value::from(typed.value(i)))
        }
        DataType::Binary => {
            let typed = array.as_binary::<i32>();
            map_rows(array, |i| Value::from(BASE64.encode(typed.value(i))))
        }
        DataType::LargeBinary => {
            let typed = array.as_binary::<i64>();
            map_rows(array, |i| Value::from(BASE64.encode(typed.value(i))))
        }
        DataType::BinaryView => {
            let typed = array.as_binary_view();
            map_rows(array, |i| Value::from(BASE64.encode(typed.value(i))))
        }
        DataType::FixedSizeBinary(_) => {
            let typed = array.as_fixed_size_binary();
            map_rows(array, |i| Value::from(BASE64.encode(typed.value(i))))
        }
        DataType::Timestamp(unit, tz) => {
            let tz = tz
                .as_deref()
                .map(|tz| tz.parse::<Tz>())
                .transpose()?;
            match unit {
                TimeUnit::Second => timestamps::<TimestampSecondType>(array, tz),
                TimeUnit::Millisecond => timestamps::<TimestampMillisecondType>(array, tz),
                TimeUnit::Microsecond => timestamps::<TimestampMicrosecondType>(array, tz),
                TimeUnit::Nanosecond => timestamps::<TimestampNanosecondType>(array, tz),
            }
        }
        DataType::Date32 => {
            let typed = array.as_primitive::<Date32Type>();
            map_rows(array, |i| formatted(typed.value_as_date(i).map(|d| d.format(DATE_FORMAT))))
        }
        DataType::Date64 => {
            let typed = array.as_primitive::<Date64Type>();
            map_rows(array, |i| formatted(typed.value_as_date(i).map(|d| d.format(DATE_FORMAT))))
        }
        DataType::Time32(TimeUnit::Second) => {
            let typed = array.as_primitive::<Time32SecondType>();
            map_rows(array, |i| formatted(typed.value_as_time(i).map(|t| t.format(TIME_FORMAT))))
        }
        DataType::Time32(TimeUnit::Millisecond) => {
            let typed = array.as_primitive::<Time32MillisecondType>();
            map_rows(array, |i| formatted(typed.value_as_time(i).map(|t| t.format(TIME_FORMAT))))
        }
        DataType::Time64(TimeUnit::Microsecond) => {
            let typed = array.as_primitive::<Time64MicrosecondType>();
            map_rows(array, |i| formatted(typed.value_as_time(i).map(|t| t.format(TIME_FORMAT))))
        }
        DataType::Time64(TimeUnit::Nanosecond) => {
            let typed = array.as_primitive::<Time64NanosecondType>();
            map_rows(array, |i| formatted(typed.value_as_time(i).map(|t| t.format(TIME_FORMAT))))
        }
        _ => {
            let formatter = ArrayFormatter::try_new(array, &FormatOptions::default())?;
            map_rows(array, |i| Value::from(formatter.value(i).to_string()))
        }
    };
    Ok(values)
}

fn map_rows(array: &dyn Array, mut convert: impl FnMut(usize) -> Value) -> Vec<Value> {
    (0..array.len())
        .map(|i| if array.is_null(i) { Value::Null } else { convert(i) })
        .collect()
}

fn primitive<T>(array: &dyn Array) -> Vec<Value>
where
    T: arrow::datatypes::ArrowPrimitiveType,
    T::Native: Into<Value>,
{
    let typed = array.as_primitive::<T>();
    map_rows(array, |i| typed.value(i).into())
}

fn timestamps<T: ArrowTimestampType>(array: &dyn Array, tz: Option<Tz>) -> Vec<Value> {
    let typed = array.as_primitive::<T>();
    map_rows(array, |i| {
        let raw = typed.value(i);
        let text = match tz {
            Some(tz) => as_datetime_with_timezone::<T>(raw, tz)
                .map(|dt| dt.fixed_offset().to_rfc3339_opts(SecondsFormat::AutoSi, false)),
            None => as_datetime::<T>(raw).map(|dt: NaiveDateTime| {
                dt.format(NAIVE_DATETIME_FORMAT).to_string()
            }),
        };
        text.map(Value::String).unwrap_or(Value::Null)
    })
}

fn formatted(value: Option<impl std::fmt::Display>) -> Value {
    value
        .map(|v| Value::String(v.to_string()))
        .unwrap_or(Value::Null)
}
