//! Typed query results and conversion of engine values to JSON.

use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{MetricsViewError, Result};

#[cfg(feature = "duckdb")]
use duckdb::types::{TimeUnit, Value as DuckValue};

/// Engine-independent column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalType {
    Boolean,
    Integer,
    Float,
    Decimal,
    Text,
    Date,
    Time,
    Timestamp,
    Interval,
    Blob,
    List,
    Struct,
    Map,
    Unknown,
}

impl LogicalType {
    pub fn is_numeric(&self) -> bool {
        matches!(self, LogicalType::Integer | LogicalType::Float | LogicalType::Decimal)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    pub data_type: LogicalType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl ColumnMeta {
    pub fn new(name: impl Into<String>, data_type: LogicalType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub fields: Vec<ColumnMeta>,
}

impl Schema {
    pub fn new(fields: Vec<ColumnMeta>) -> Self {
        Self { fields }
    }

    pub fn field(&self, name: &str) -> Option<&ColumnMeta> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Schema plus rows. Each row maps column name to value in schema order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub schema: Schema,
    pub rows: Vec<Map<String, Value>>,
}

impl QueryResult {
    pub fn new(schema: Schema, rows: Vec<Map<String, Value>>) -> Self {
        Self { schema, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Fail when more than `cap` rows came back. Zero disables the cap.
    pub fn set_cap(&self, cap: u64) -> Result<()> {
        if cap > 0 && self.rows.len() as u64 > cap {
            return Err(MetricsViewError::CapacityExceeded(format!(
                "result cap exceeded: returned more than {cap} rows"
            )));
        }
        Ok(())
    }

    /// Values of one column in row order.
    pub fn column<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Value> + 'a {
        self.rows.iter().map(move |r| r.get(name).unwrap_or(&Value::Null))
    }
}

/// RFC 3339 rendering used for every timestamp value.
pub fn timestamp_to_json(t: DateTime<Utc>) -> Value {
    Value::String(t.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
                    .ok()
                    .map(|n| n.and_utc())
            }),
        _ => None,
    }
}

#[cfg(feature = "duckdb")]
fn to_micros(unit: TimeUnit, value: i64) -> i64 {
    match unit {
        TimeUnit::Second => value.saturating_mul(1_000_000),
        TimeUnit::Millisecond => value.saturating_mul(1_000),
        TimeUnit::Microsecond => value,
        TimeUnit::Nanosecond => value / 1_000,
    }
}

#[cfg(feature = "duckdb")]
pub(crate) fn duck_value_to_json(value: DuckValue) -> Value {
    match value {
        DuckValue::Null => Value::Null,
        DuckValue::Boolean(b) => Value::Bool(b),
        DuckValue::TinyInt(i) => Value::from(i),
        DuckValue::SmallInt(i) => Value::from(i),
        DuckValue::Int(i) => Value::from(i),
        DuckValue::BigInt(i) => Value::from(i),
        DuckValue::HugeInt(i) => match i64::try_from(i) {
            Ok(small) => Value::from(small),
            Err(_) => Value::String(i.to_string()),
        },
        DuckValue::UTinyInt(i) => Value::from(i),
        DuckValue::USmallInt(i) => Value::from(i),
        DuckValue::UInt(i) => Value::from(i),
        DuckValue::UBigInt(i) => Value::from(i),
        DuckValue::Float(f) => Value::from(f),
        DuckValue::Double(f) => Value::from(f),
        DuckValue::Decimal(d) => d
            .to_string()
            .parse::<f64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(d.to_string())),
        DuckValue::Timestamp(unit, t) => match DateTime::<Utc>::from_timestamp_micros(to_micros(unit, t)) {
            Some(ts) => timestamp_to_json(ts),
            None => Value::String(t.to_string()),
        },
        DuckValue::Text(s) => Value::String(s),
        DuckValue::Blob(bytes) => Value::String(hex::encode(bytes)),
        DuckValue::Date32(d) => {
            match NaiveDate::from_ymd_opt(1970, 1, 1)
                .and_then(|epoch| epoch.checked_add_signed(chrono::Duration::days(i64::from(d))))
            {
                Some(date) => Value::String(date.format("%Y-%m-%d").to_string()),
                None => Value::from(d),
            }
        }
        DuckValue::Time64(unit, t) => {
            let micros = to_micros(unit, t);
            let secs = micros.div_euclid(1_000_000);
            let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
            match u32::try_from(secs)
                .ok()
                .and_then(|s| NaiveTime::from_num_seconds_from_midnight_opt(s, nanos))
            {
                Some(time) => Value::String(time.format("%H:%M:%S%.f").to_string()),
                None => Value::from(micros),
            }
        }
        DuckValue::Interval { months, days, nanos } => {
            Value::String(format!("{months} months {days} days {nanos} nanos"))
        }
        DuckValue::List(items) => Value::Array(items.into_iter().map(duck_value_to_json).collect()),
        DuckValue::Enum(s) => Value::String(s),
        DuckValue::Struct(fields) => {
            let mut map = Map::new();
            for (key, val) in fields.iter() {
                map.insert(key.clone(), duck_value_to_json(val.clone()));
            }
            Value::Object(map)
        }
        DuckValue::Array(items) => Value::Array(items.into_iter().map(duck_value_to_json).collect()),
        DuckValue::Map(entries) => {
            let pairs: Vec<Value> = entries
                .iter()
                .map(|(k, v)| Value::Array(vec![duck_value_to_json(k.clone()), duck_value_to_json(v.clone())]))
                .collect();
            Value::Array(pairs)
        }
        DuckValue::Union(inner) => duck_value_to_json(*inner),
    }
}

#[cfg(feature = "duckdb")]
pub(crate) fn logical_type_from_arrow(data_type: &duckdb::arrow::datatypes::DataType) -> LogicalType {
    use duckdb::arrow::datatypes::DataType;
    match data_type {
        DataType::Boolean => LogicalType::Boolean,
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64 => LogicalType::Integer,
        DataType::Float16 | DataType::Float32 | DataType::Float64 => LogicalType::Float,
        DataType::Decimal128(_, _) | DataType::Decimal256(_, _) => LogicalType::Decimal,
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => LogicalType::Text,
        DataType::Date32 | DataType::Date64 => LogicalType::Date,
        DataType::Time32(_) | DataType::Time64(_) => LogicalType::Time,
        DataType::Timestamp(_, _) => LogicalType::Timestamp,
        DataType::Interval(_) | DataType::Duration(_) => LogicalType::Interval,
        DataType::Binary | DataType::LargeBinary | DataType::FixedSizeBinary(_) => LogicalType::Blob,
        DataType::List(_) | DataType::LargeList(_) | DataType::FixedSizeList(_, _) => LogicalType::List,
        DataType::Struct(_) => LogicalType::Struct,
        DataType::Map(_, _) => LogicalType::Map,
        DataType::Dictionary(_, value) => logical_type_from_arrow(value),
        _ => LogicalType::Unknown,
    }
}

/// DuckDB column type used when re-materializing a result locally.
pub fn duckdb_type_name(data_type: LogicalType) -> &'static str {
    match data_type {
        LogicalType::Boolean => "BOOLEAN",
        LogicalType::Integer => "BIGINT",
        LogicalType::Float | LogicalType::Decimal => "DOUBLE",
        LogicalType::Date => "DATE",
        LogicalType::Timestamp => "TIMESTAMP",
        _ => "VARCHAR",
    }
}
