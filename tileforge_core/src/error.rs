//! The API error taxonomy.
//!
//! Every failure that can cross the HTTP boundary carries a stable machine
//! code and a status; the server serializes it as `{error, details?}`.
//! Internal plumbing keeps using `anyhow` and converts at the boundary.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ApiError {
	// 400
	#[error("target_required")]
	TargetRequired,
	#[error("too_many_targets")]
	TooManyTargets,
	#[error("invalid_target_name: {0}")]
	InvalidTargetName(String),
	#[error("project_id_required")]
	ProjectIdRequired,
	#[error("missing_bbox")]
	MissingBbox,
	#[error("invalid_bbox: {0}")]
	InvalidBbox(String),
	#[error("no_layers")]
	NoLayers,
	#[error("extent_out_of_range")]
	ExtentOutOfRange,
	#[error("unsupported_filetype: {0}")]
	UnsupportedFiletype(String),
	#[error("bad_request: {0}")]
	BadRequest(String),

	// 404
	#[error("project_not_found: {0}")]
	ProjectNotFound(String),
	#[error("job_not_found: {0}")]
	JobNotFound(String),
	#[error("layer_not_found: {0}")]
	LayerNotFound(String),
	#[error("project_cache_not_found: {0}")]
	ProjectCacheNotFound(String),

	// 409
	#[error("job_already_running: {0}")]
	JobAlreadyRunning(String),
	#[error("job_running: {job_id}")]
	JobRunning { job_id: String },
	#[error("batch_running: {0}")]
	BatchRunning(String),

	// 413
	#[error("file_too_large")]
	FileTooLarge,
	#[error("zip_too_many_entries")]
	ZipTooManyEntries,
	#[error("zip_extract_too_large")]
	ZipExtractTooLarge,
	#[error("zip_entry_too_large")]
	ZipEntryTooLarge,

	// 429
	#[error("server_busy: {0} jobs running")]
	ServerBusy(usize),

	// 410
	#[error("gone")]
	Gone,

	// 500
	#[error("spawn_error: {0}")]
	SpawnError(String),
	#[error("render_failed: {0}")]
	RenderFailed(String),
	#[error("delete_failed: {0}")]
	DeleteFailed(String),
	#[error("config_update_failed: {0}")]
	ConfigUpdateFailed(String),
	#[error("protocol_error: {0}")]
	ProtocolError(String),
	#[error("worker_crashed: {0}")]
	WorkerCrashed(String),
	#[error("tile_generation_timeout")]
	TileGenerationTimeout,
	#[error("aborted")]
	Aborted,
	#[error("internal_error: {0}")]
	Internal(String),
}

impl ApiError {
	/// The stable machine code sent to clients as `error`.
	pub fn code(&self) -> &'static str {
		use ApiError::*;
		match self {
			TargetRequired => "target_required",
			TooManyTargets => "too_many_targets",
			InvalidTargetName(_) => "invalid_target_name",
			ProjectIdRequired => "project_id_required",
			MissingBbox => "missing_bbox",
			InvalidBbox(_) => "invalid_bbox",
			NoLayers => "no_layers",
			ExtentOutOfRange => "extent_out_of_range",
			UnsupportedFiletype(_) => "unsupported_filetype",
			BadRequest(_) => "bad_request",
			ProjectNotFound(_) => "project_not_found",
			JobNotFound(_) => "job_not_found",
			LayerNotFound(_) => "layer_not_found",
			ProjectCacheNotFound(_) => "project_cache_not_found",
			JobAlreadyRunning(_) => "job_already_running",
			JobRunning { .. } => "job_running",
			BatchRunning(_) => "batch_running",
			FileTooLarge => "file_too_large",
			ZipTooManyEntries => "zip_too_many_entries",
			ZipExtractTooLarge => "zip_extract_too_large",
			ZipEntryTooLarge => "zip_entry_too_large",
			ServerBusy(_) => "server_busy",
			Gone => "gone",
			SpawnError(_) => "spawn_error",
			RenderFailed(_) => "render_failed",
			DeleteFailed(_) => "delete_failed",
			ConfigUpdateFailed(_) => "config_update_failed",
			ProtocolError(_) => "protocol_error",
			WorkerCrashed(_) => "worker_crashed",
			TileGenerationTimeout => "tile_generation_timeout",
			Aborted => "aborted",
			Internal(_) => "internal_error",
		}
	}

	/// The HTTP status this error maps to.
	pub fn status(&self) -> u16 {
		use ApiError::*;
		match self {
			TargetRequired | TooManyTargets | InvalidTargetName(_) | ProjectIdRequired | MissingBbox | InvalidBbox(_)
			| NoLayers | ExtentOutOfRange | UnsupportedFiletype(_) | BadRequest(_) => 400,
			ProjectNotFound(_) | JobNotFound(_) | LayerNotFound(_) | ProjectCacheNotFound(_) => 404,
			JobAlreadyRunning(_) | JobRunning { .. } | BatchRunning(_) => 409,
			FileTooLarge | ZipTooManyEntries | ZipExtractTooLarge | ZipEntryTooLarge => 413,
			ServerBusy(_) => 429,
			Gone => 410,
			SpawnError(_) | RenderFailed(_) | DeleteFailed(_) | ConfigUpdateFailed(_) | ProtocolError(_)
			| WorkerCrashed(_) | TileGenerationTimeout | Aborted | Internal(_) => 500,
		}
	}

	/// Optional human detail, separate from the machine code.
	pub fn details(&self) -> Option<String> {
		use ApiError::*;
		match self {
			InvalidTargetName(d) | InvalidBbox(d) | UnsupportedFiletype(d) | BadRequest(d) | ProjectNotFound(d)
			| JobNotFound(d) | LayerNotFound(d) | ProjectCacheNotFound(d) | JobAlreadyRunning(d) | BatchRunning(d)
			| SpawnError(d) | RenderFailed(d) | DeleteFailed(d) | ConfigUpdateFailed(d) | ProtocolError(d)
			| WorkerCrashed(d) | Internal(d) => Some(d.clone()),
			JobRunning { job_id } => Some(job_id.clone()),
			ServerBusy(n) => Some(format!("{n} jobs running")),
			_ => None,
		}
	}
}

impl From<anyhow::Error> for ApiError {
	fn from(err: anyhow::Error) -> Self {
		match err.downcast::<ApiError>() {
			Ok(api) => api,
			Err(other) => ApiError::Internal(format!("{other:#}")),
		}
	}
}
