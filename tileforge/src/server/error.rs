//! Mapping the error taxonomy onto HTTP responses.
//!
//! Every error crosses the boundary as `{error, details?}` with the status
//! from the taxonomy. The `generating` shape is a 202 success, not an
//! error, and carries the retry hints as both headers and body.

use axum::{
	Json,
	body::Body,
	http::{StatusCode, header},
	response::{IntoResponse, Response},
};
use serde::Serialize;
use tileforge_core::ApiError;

/// Wrapper so handlers can `?` an [`ApiError`] straight into a response.
#[derive(Debug)]
pub struct HttpError(pub ApiError);

impl From<ApiError> for HttpError {
	fn from(err: ApiError) -> Self {
		HttpError(err)
	}
}

impl From<anyhow::Error> for HttpError {
	fn from(err: anyhow::Error) -> Self {
		HttpError(err.into())
	}
}

#[derive(Serialize)]
struct ErrorBody<'a> {
	error: &'a str,
	#[serde(skip_serializing_if = "Option::is_none")]
	details: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none", rename = "jobId")]
	job_id: Option<String>,
}

impl IntoResponse for HttpError {
	fn into_response(self) -> Response {
		let status = StatusCode::from_u16(self.0.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
		if status.is_server_error() {
			log::warn!("request failed: {}", self.0);
		}
		let job_id = match &self.0 {
			ApiError::JobRunning { job_id } => Some(job_id.clone()),
			_ => None,
		};
		let body = ErrorBody {
			error: self.0.code(),
			details: self.0.details(),
			job_id,
		};
		(status, Json(body)).into_response()
	}
}

pub type HttpResult<T> = Result<T, HttpError>;

/// The `202 Accepted` answer for a tile that is still rendering.
pub fn generating_response(queue_position: usize, queue_length: usize, retry_after_secs: u64) -> Response {
	let body = serde_json::json!({
		"status": "generating",
		"retry_after": retry_after_secs,
		"queue_position": queue_position,
		"queue_length": queue_length,
	});
	Response::builder()
		.status(StatusCode::ACCEPTED)
		.header("Retry-After", retry_after_secs.to_string())
		.header("X-Tile-Status", "generating")
		.header("X-Queue-Position", queue_position.to_string())
		.header("X-Queue-Length", queue_length.to_string())
		.header(header::CONTENT_TYPE, "application/json")
		.body(Body::from(body.to_string()))
		.expect("static response builds")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn taxonomy_maps_to_status_and_body() {
		let response = HttpError(ApiError::ServerBusy(4)).into_response();
		assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
		let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
		let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
		assert_eq!(value["error"], "server_busy");
	}

	#[tokio::test]
	async fn job_running_carries_the_job_id() {
		let response = HttpError(ApiError::JobRunning { job_id: "j-9".into() }).into_response();
		assert_eq!(response.status(), StatusCode::CONFLICT);
		let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
		let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
		assert_eq!(value["error"], "job_running");
		assert_eq!(value["jobId"], "j-9");
	}

	#[test]
	fn generating_is_a_202_with_retry_headers() {
		let response = generating_response(3, 12, 2);
		assert_eq!(response.status(), StatusCode::ACCEPTED);
		let headers = response.headers();
		assert_eq!(headers.get("Retry-After").unwrap(), "2");
		assert_eq!(headers.get("X-Tile-Status").unwrap(), "generating");
		assert_eq!(headers.get("X-Queue-Position").unwrap(), "3");
		assert_eq!(headers.get("X-Queue-Length").unwrap(), "12");
	}
}
