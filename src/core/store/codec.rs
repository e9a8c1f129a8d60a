//! Conversions between `Task` and its SQLite row.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Row;
use rusqlite::types::Type;
use std::path::PathBuf;

use crate::core::task::{
    InputFile, OutputFiles, OutputFormat, PcmType, SeparationParams, Task, TaskStatus,
};

pub(super) const TASK_COLUMNS: &str = "task_id, status, created_at, started_at, completed_at, \
     input_file_path, file_size_bytes, model_type, config_path, instruments, use_tta, \
     extract_instrumental, output_format, pcm_type, progress, current_stage, \
     estimated_completion, output_files, error_message, processing_time_seconds";

/// Fixed-width UTC text so lexical order in SQL matches time order.
pub(super) fn encode_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error(
    idx: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

fn decode_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn get_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| decode_ts(idx, &s)).transpose()
}

pub(super) fn decode_status(idx: usize, raw: &str) -> rusqlite::Result<TaskStatus> {
    TaskStatus::from_status(raw)
        .ok_or_else(|| conversion_error(idx, format!("unknown task status '{}'", raw)))
}

pub(super) fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let status: String = row.get(1)?;
    let created_at: String = row.get(2)?;
    let size_bytes: i64 = row.get(6)?;
    let instruments: String = row.get(9)?;
    let output_format: String = row.get(12)?;
    let pcm_type: String = row.get(13)?;
    let output_files: Option<String> = row.get(17)?;

    let instruments: Vec<String> =
        serde_json::from_str(&instruments).map_err(|e| conversion_error(9, e))?;
    let output_files: Option<OutputFiles> = output_files
        .map(|json| serde_json::from_str(&json).map_err(|e| conversion_error(17, e)))
        .transpose()?;

    Ok(Task {
        task_id: row.get(0)?,
        status: decode_status(1, &status)?,
        created_at: decode_ts(2, &created_at)?,
        started_at: get_ts(row, 3)?,
        completed_at: get_ts(row, 4)?,
        input: InputFile {
            path: PathBuf::from(row.get::<_, String>(5)?),
            size_bytes: u64::try_from(size_bytes).map_err(|e| conversion_error(6, e))?,
        },
        params: SeparationParams {
            model_type: row.get(7)?,
            config_path: row.get(8)?,
            instruments,
            use_tta: row.get(10)?,
            extract_instrumental: row.get(11)?,
            output_format: OutputFormat::from_name(&output_format).ok_or_else(|| {
                conversion_error(12, format!("unknown output format '{}'", output_format))
            })?,
            pcm_type: PcmType::from_name(&pcm_type)
                .ok_or_else(|| conversion_error(13, format!("unknown pcm type '{}'", pcm_type)))?,
        },
        progress: row.get(14)?,
        current_stage: row.get(15)?,
        estimated_completion: get_ts(row, 16)?,
        output_files,
        error_message: row.get(18)?,
        processing_time_seconds: row.get(19)?,
    })
}
