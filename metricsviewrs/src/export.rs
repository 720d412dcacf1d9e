//! File exports of query results.

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{
    ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray, TimestampMicrosecondArray,
};
use arrow::datatypes::{DataType, Field, Schema as ArrowSchema, TimeUnit};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use rust_xlsxwriter::Workbook;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MetricsViewError, Result};
use crate::result::{parse_timestamp, LogicalType, QueryResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileFormat {
    Csv,
    Xlsx,
    Parquet,
}

impl FileFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            FileFormat::Csv => "csv",
            FileFormat::Xlsx => "xlsx",
            FileFormat::Parquet => "parquet",
        }
    }
}

/// Base file name for an export: `<view>[_<dimension>][_filtered]`.
pub fn generate_filename(metrics_view: &str, dimension: Option<&str>, filtered: bool) -> String {
    let mut name = metrics_view.replace('"', "_");
    if let Some(dim) = dimension.filter(|d| !d.is_empty()) {
        name.push('_');
        name.push_str(dim);
    }
    if filtered {
        name.push_str("_filtered");
    }
    name
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn write_csv<W: Write>(result: &QueryResult, writer: W) -> Result<()> {
    let mut out = csv::Writer::from_writer(writer);
    let export = |e: csv::Error| MetricsViewError::Export(format!("csv: {e}"));
    out.write_record(result.schema.names()).map_err(export)?;
    for row in &result.rows {
        let record: Vec<String> = result
            .schema
            .fields
            .iter()
            .map(|f| cell_text(row.get(&f.name).unwrap_or(&Value::Null)))
            .collect();
        out.write_record(&record).map_err(export)?;
    }
    out.flush()?;
    Ok(())
}

/// Single-sheet workbook with a header row. Numbers stay numeric.
pub fn write_xlsx(result: &QueryResult) -> Result<Vec<u8>> {
    let export = |e: rust_xlsxwriter::XlsxError| MetricsViewError::Export(format!("xlsx: {e}"));
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    for (col, field) in result.schema.fields.iter().enumerate() {
        let col = u16::try_from(col).map_err(|_| MetricsViewError::Export("too many columns for xlsx".to_string()))?;
        sheet.write_string(0, col, &field.name).map_err(export)?;
    }
    for (idx, row) in result.rows.iter().enumerate() {
        let r = u32::try_from(idx + 1).map_err(|_| MetricsViewError::Export("too many rows for xlsx".to_string()))?;
        for (col, field) in result.schema.fields.iter().enumerate() {
            let col = col as u16;
            match row.get(&field.name).unwrap_or(&Value::Null) {
                Value::Null => {}
                Value::Bool(b) => {
                    sheet.write_boolean(r, col, *b).map_err(export)?;
                }
                Value::Number(n) => {
                    sheet.write_number(r, col, n.as_f64().unwrap_or(f64::NAN)).map_err(export)?;
                }
                other => {
                    sheet.write_string(r, col, cell_text(other)).map_err(export)?;
                }
            }
        }
    }
    workbook.save_to_buffer().map_err(export)
}

fn to_record_batch(result: &QueryResult) -> Result<RecordBatch> {
    let mut fields = Vec::with_capacity(result.schema.len());
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(result.schema.len());
    for meta in &result.schema.fields {
        let values = result.rows.iter().map(|r| r.get(&meta.name).unwrap_or(&Value::Null));
        let (data_type, array): (DataType, ArrayRef) = match meta.data_type {
            LogicalType::Boolean => (
                DataType::Boolean,
                Arc::new(values.map(Value::as_bool).collect::<BooleanArray>()),
            ),
            LogicalType::Integer => (DataType::Int64, Arc::new(values.map(Value::as_i64).collect::<Int64Array>())),
            LogicalType::Float | LogicalType::Decimal => (
                DataType::Float64,
                Arc::new(values.map(Value::as_f64).collect::<Float64Array>()),
            ),
            LogicalType::Timestamp => (
                DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
                Arc::new(
                    values
                        .map(|v| parse_timestamp(v).map(|t| t.timestamp_micros()))
                        .collect::<TimestampMicrosecondArray>()
                        .with_timezone("UTC"),
                ),
            ),
            _ => (
                DataType::Utf8,
                Arc::new(
                    values
                        .map(|v| (!v.is_null()).then(|| cell_text(v)))
                        .collect::<StringArray>(),
                ),
            ),
        };
        fields.push(Field::new(&meta.name, data_type, meta.nullable));
        arrays.push(array);
    }
    RecordBatch::try_new(Arc::new(ArrowSchema::new(fields)), arrays)
        .map_err(|e| MetricsViewError::Export(format!("parquet: {e}")))
}

pub fn write_parquet<W: Write + Send>(result: &QueryResult, writer: W) -> Result<()> {
    let export = |e: parquet::errors::ParquetError| MetricsViewError::Export(format!("parquet: {e}"));
    let batch = to_record_batch(result)?;
    let mut out = ArrowWriter::try_new(writer, batch.schema(), None).map_err(export)?;
    out.write(&batch).map_err(export)?;
    out.close().map_err(export)?;
    Ok(())
}

/// Write `result` to `dir/<name>.<ext>` and return the full path.
pub fn export_to_dir(result: &QueryResult, format: FileFormat, dir: &Path, name: &str) -> Result<std::path::PathBuf> {
    let path = dir.join(format!("{name}.{}", format.extension()));
    match format {
        FileFormat::Csv => write_csv(result, File::create(&path)?)?,
        FileFormat::Xlsx => std::fs::write(&path, write_xlsx(result)?)?,
        FileFormat::Parquet => write_parquet(result, File::create(&path)?)?,
    }
    tracing::info!(path = %path.display(), rows = result.len(), "exported result");
    Ok(path)
}
