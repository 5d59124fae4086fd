//! Wire encoders for executed tables: JSON, CSV, Parquet, and the Arrow IPC
//! stream format.

use arrow::ipc::writer::StreamWriter;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use parquet::arrow::ArrowWriter;

use crate::error::ExecutionError;
use crate::exec::{ExecOptions, ExecutionResult};
use crate::route::RouteDefinition;

pub const FORMATS: &[&str] = &["json", "csv", "parquet", "arrow"];

pub fn validate_format(format: &str) -> Result<String, ExecutionError> {
    let normalised = format.trim().to_ascii_lowercase();

    match FORMATS.contains(&normalised.as_str()) {
        true => Ok(normalised),
        false => Err(ExecutionError::InvalidParameter {
            name: "format".into(),
            detail: format!("'{format}' is not one of {FORMATS:?}"),
        }),
    }
}

/// Encode an execution result in the requested format.
pub fn render(
    route: &RouteDefinition,
    format: &str,
    result: &ExecutionResult,
    opts: ExecOptions,
) -> Result<Response, ExecutionError> {
    match format {
        "json" => render_json(route, result, opts),
        "csv" => render_csv(route, result),
        "parquet" => render_parquet(route, result),
        "arrow" => render_arrow(route, result),
        other => Err(ExecutionError::InvalidParameter {
            name: "format".into(),
            detail: format!("'{other}' is not one of {FORMATS:?}"),
        }),
    }
}

fn render_json(
    route: &RouteDefinition,
    result: &ExecutionResult,
    opts: ExecOptions,
) -> Result<Response, ExecutionError> {
    let columns: Vec<String> = result
        .table
        .schema()
        .fields()
        .iter()
        .map(|field| field.name().clone())
        .collect();

    let body = serde_json::json!({
        "route_id": route.id,
        "total_rows": result.total_rows,
        "offset": opts.offset,
        "limit": opts.limit,
        "row_count": result.table.num_rows(),
        "cache_hit": result.cache_hit,
        "columns": columns,
        "rows": result.table.to_json_rows(),
    });

    Ok(Json(body).into_response())
}

fn render_csv(route: &RouteDefinition, result: &ExecutionResult) -> Result<Response, ExecutionError> {
    let mut buffer = Vec::new();

    {
        let mut writer = arrow::csv::WriterBuilder::new()
            .with_header(true)
            .build(&mut buffer);

        for batch in result.table.batches() {
            writer.write(batch).map_err(encode_error)?;
        }
    }

    Ok(attachment(
        buffer,
        "text/csv; charset=utf-8",
        &format!("{}.csv", route.id),
    ))
}

fn render_parquet(
    route: &RouteDefinition,
    result: &ExecutionResult,
) -> Result<Response, ExecutionError> {
    let mut buffer = Vec::new();

    {
        let mut writer = ArrowWriter::try_new(&mut buffer, result.table.schema(), None)
            .map_err(encode_error)?;

        for batch in result.table.batches() {
            writer.write(batch).map_err(encode_error)?;
        }

        writer.close().map_err(encode_error)?;
    }

    Ok(attachment(
        buffer,
        "application/octet-stream",
        &format!("{}.parquet", route.id),
    ))
}

fn render_arrow(
    route: &RouteDefinition,
    result: &ExecutionResult,
) -> Result<Response, ExecutionError> {
    let mut buffer = Vec::new();

    {
        let mut writer = StreamWriter::try_new(&mut buffer, &result.table.schema())
            .map_err(encode_error)?;

        for batch in result.table.batches() {
            writer.write(batch).map_err(encode_error)?;
        }

        writer.finish().map_err(encode_error)?;
    }

    Ok(attachment(
        buffer,
        "application/vnd.apache.arrow.stream",
        &format!("{}.arrows", route.id),
    ))
}

fn attachment(body: Vec<u8>, content_type: &str, filename: &str) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE.as_str(), content_type.to_owned()),
            (
                header::CONTENT_DISPOSITION.as_str(),
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        body,
    )
        .into_response()
}

fn encode_error(err: impl std::fmt::Display) -> ExecutionError {
    ExecutionError::Internal {
        detail: format!("could not encode response: {err}"),
    }
}
