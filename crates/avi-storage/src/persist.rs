use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow_array::{
    ArrayRef, BooleanArray, Date32Array, Float64Array, Int64Array, RecordBatch, StringArray,
    TimestampMicrosecondArray,
};
use arrow_schema::{ArrowError, DataType, Field as ArrowField, Schema, TimeUnit};
use avi_core::{Cell, ColumnSpec, ColumnType, NormalizedTable, SourceId};
use chrono::NaiveDate;
use parquet::arrow::ArrowWriter;
use parquet::errors::ParquetError;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("i/o error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("building record batch for {source_id}: {source}")]
    Arrow {
        source_id: SourceId,
        #[source]
        source: ArrowError,
    },
    #[error("writing parquet {path}: {source}")]
    Parquet {
        path: PathBuf,
        #[source]
        source: ParquetError,
    },
    #[error("row {row}, column `{column}`: value does not match column type {expected:?}")]
    TypeMismatch {
        row: usize,
        column: String,
        expected: ColumnType,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> WriteError + '_ {
    move |source| WriteError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenDataset {
    pub absolute_path: PathBuf,
    pub relative_path: PathBuf,
    pub rows: usize,
    pub bytes: u64,
    pub sha256: String,
}

/// Writes accepted tables as one Parquet file per (source, ingestion date).
#[derive(Debug, Clone)]
pub struct ParquetWriter {
    root: PathBuf,
}

impl ParquetWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn output_relative_path(&self, source_id: SourceId, ingest_date: NaiveDate) -> PathBuf {
        self.named_relative_path(source_id, ingest_date, source_id.as_str())
    }

    /// Path of a dataset named `name` in the same partition as the source's
    /// main output.
    pub fn named_relative_path(&self, source_id: SourceId, ingest_date: NaiveDate, name: &str) -> PathBuf {
        PathBuf::from(source_id.as_str())
            .join(format!("ingest_date={}", ingest_date.format("%Y-%m-%d")))
            .join(format!("{name}.parquet"))
    }

    /// Writes via a temp file and atomic rename, so a re-ingestion on the same
    /// date replaces the previous file instead of adding another.
    pub fn write(
        &self,
        table: &NormalizedTable,
        ingest_date: NaiveDate,
    ) -> Result<WrittenDataset, WriteError> {
        self.write_named(table, ingest_date, table.source_id.as_str())
    }

    pub fn write_named(
        &self,
        table: &NormalizedTable,
        ingest_date: NaiveDate,
        name: &str,
    ) -> Result<WrittenDataset, WriteError> {
        let relative_path = self.named_relative_path(table.source_id, ingest_date, name);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent).map_err(io_err(&parent))?;

        let batch = record_batch(table)?;
        let temp_path = parent.join(format!(".{}.parquet.tmp", Uuid::new_v4()));
        if let Err(err) = write_batch(&temp_path, &batch) {
            let _ = fs::remove_file(&temp_path);
            return Err(err);
        }
        if let Err(source) = fs::rename(&temp_path, &absolute_path) {
            let _ = fs::remove_file(&temp_path);
            return Err(WriteError::Io {
                path: absolute_path,
                source,
            });
        }

        let (sha256, bytes) = sha256_file(&absolute_path).map_err(io_err(&absolute_path))?;
        info!(
            source_id = %table.source_id,
            path = %absolute_path.display(),
            rows = table.row_count(),
            bytes,
            "wrote parquet dataset"
        );
        Ok(WrittenDataset {
            absolute_path,
            relative_path,
            rows: table.row_count(),
            bytes,
            sha256,
        })
    }

    /// Removes a file this writer produced, e.g. when a later write of the
    /// same attempt fails.
    pub fn discard(&self, written: &WrittenDataset) -> Result<(), WriteError> {
        match fs::remove_file(&written.absolute_path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(WriteError::Io {
                path: written.absolute_path.clone(),
                source,
            }),
        }
    }
}

/// SHA-256 hex digest and byte length of a file.
pub fn sha256_file(path: &Path) -> std::io::Result<(String, u64)> {
    let bytes = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok((hex::encode(hasher.finalize()), bytes.len() as u64))
}

fn write_batch(path: &Path, batch: &RecordBatch) -> Result<(), WriteError> {
    let parquet_err = |source| WriteError::Parquet {
        path: path.to_path_buf(),
        source,
    };
    let file = File::create(path).map_err(io_err(path))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None).map_err(parquet_err)?;
    writer.write(batch).map_err(parquet_err)?;
    writer.close().map_err(parquet_err)?;
    Ok(())
}

fn arrow_type(column_type: ColumnType) -> DataType {
    match column_type {
        ColumnType::Date => DataType::Date32,
        ColumnType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
        ColumnType::Integer => DataType::Int64,
        ColumnType::Float => DataType::Float64,
        ColumnType::Boolean => DataType::Boolean,
        ColumnType::Categorical | ColumnType::Identifier => DataType::Utf8,
    }
}

fn record_batch(table: &NormalizedTable) -> Result<RecordBatch, WriteError> {
    let schema = Arc::new(Schema::new(
        table
            .schema
            .columns
            .iter()
            .map(|c| ArrowField::new(c.name.as_str(), arrow_type(c.column_type), c.nullable))
            .collect::<Vec<_>>(),
    ));
    let columns = table
        .schema
        .columns
        .iter()
        .enumerate()
        .map(|(idx, spec)| column_array(table, idx, spec))
        .collect::<Result<Vec<_>, _>>()?;
    RecordBatch::try_new(schema, columns).map_err(|source| WriteError::Arrow {
        source_id: table.source_id,
        source,
    })
}

fn epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default()
}

fn column_array(table: &NormalizedTable, idx: usize, spec: &ColumnSpec) -> Result<ArrayRef, WriteError> {
    let cells = table.rows.iter().map(|row| row.get(idx).unwrap_or(&Cell::Null));
    let mismatch = |row: usize| WriteError::TypeMismatch {
        row,
        column: spec.name.clone(),
        expected: spec.column_type,
    };

    let array: ArrayRef = match spec.column_type {
        ColumnType::Date => {
            let values = cells
                .enumerate()
                .map(|(row, cell)| match cell {
                    Cell::Null => Ok(None),
                    Cell::Date(d) => Ok(Some((*d - epoch()).num_days() as i32)),
                    _ => Err(mismatch(row)),
                })
                .collect::<Result<Vec<_>, _>>()?;
            Arc::new(Date32Array::from(values))
        }
        ColumnType::Timestamp => {
            let values = cells
                .enumerate()
                .map(|(row, cell)| match cell {
                    Cell::Null => Ok(None),
                    Cell::Timestamp(ts) => Ok(Some(ts.timestamp_micros())),
                    _ => Err(mismatch(row)),
                })
                .collect::<Result<Vec<_>, _>>()?;
            Arc::new(TimestampMicrosecondArray::from(values).with_timezone("UTC"))
        }
        ColumnType::Integer => {
            let values = cells
                .enumerate()
                .map(|(row, cell)| match cell {
                    Cell::Null => Ok(None),
                    Cell::Integer(v) => Ok(Some(*v)),
                    _ => Err(mismatch(row)),
                })
                .collect::<Result<Vec<_>, _>>()?;
            Arc::new(Int64Array::from(values))
        }
        ColumnType::Float => {
            let values = cells
                .enumerate()
                .map(|(row, cell)| match cell {
                    Cell::Null => Ok(None),
                    Cell::Float(v) => Ok(Some(*v)),
                    _ => Err(mismatch(row)),
                })
                .collect::<Result<Vec<_>, _>>()?;
            Arc::new(Float64Array::from(values))
        }
        ColumnType::Boolean => {
            let values = cells
                .enumerate()
                .map(|(row, cell)| match cell {
                    Cell::Null => Ok(None),
                    Cell::Boolean(v) => Ok(Some(*v)),
                    _ => Err(mismatch(row)),
                })
                .collect::<Result<Vec<_>, _>>()?;
            Arc::new(BooleanArray::from(values))
        }
        ColumnType::Categorical | ColumnType::Identifier => {
            let values = cells
                .enumerate()
                .map(|(row, cell)| match cell {
                    Cell::Null => Ok(None),
                    Cell::Text(s) => Ok(Some(s.as_str())),
                    _ => Err(mismatch(row)),
                })
                .collect::<Result<Vec<_>, _>>()?;
            Arc::new(StringArray::from(values))
        }
    };
    Ok(array)
}
