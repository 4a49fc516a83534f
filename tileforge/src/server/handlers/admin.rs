//! Admin surface: batch jobs, project runs, cache deletion, config patches.

use crate::access::AccessAction;
use crate::server::error::{HttpError, HttpResult};
use crate::state::AppState;
use axum::{
	Json,
	extract::{Path, Query, State},
	response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use tileforge_core::{
	ApiError,
	types::{ProjectId, TargetKind, ZoomRange},
};
use tileforge_render::{JobParams, Trigger, XyzMode, batch::JOB_TAIL_CAP};

lazy_static::lazy_static! {
	static ref TARGET_NAME: regex::Regex = regex::Regex::new(r"^[\w .:-]{1,128}$").unwrap();
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateCacheRequest {
	pub project: String,
	pub layer: Option<String>,
	pub theme: Option<String>,
	pub zoom_min: Option<u8>,
	pub zoom_max: Option<u8>,
	pub publish_zoom_min: Option<u8>,
	pub publish_zoom_max: Option<u8>,
	pub scheme: Option<tileforge_core::types::TileScheme>,
	pub tile_crs: Option<String>,
	pub xyz_mode: Option<String>,
	pub tile_matrix_preset: Option<String>,
	pub allow_remote: Option<bool>,
	pub throttle_ms: Option<u64>,
	pub render_timeout_ms: Option<u64>,
	pub tile_retries: Option<u32>,
	pub png_compression: Option<u8>,
	pub project_extent: Option<[f64; 4]>,
	pub extent_crs: Option<String>,
	/// `full` (default) or `incremental`.
	pub recache: Option<String>,
	pub overlap: Option<bool>,
	pub run_reason: Option<String>,
}

/// `POST /generate-cache`: start one batch job.
pub async fn start_job(State(state): State<AppState>, Json(request): Json<GenerateCacheRequest>) -> HttpResult<Json<serde_json::Value>> {
	state.require(&AccessAction::Admin)?;

	let project = ProjectId::parse(&request.project).ok_or(ApiError::ProjectIdRequired)?;
	let (kind, name) = match (&request.layer, &request.theme) {
		(Some(layer), None) => (TargetKind::Layer, layer.clone()),
		(None, Some(theme)) => (TargetKind::Theme, theme.clone()),
		(None, None) => return Err(HttpError(ApiError::TargetRequired)),
		(Some(_), Some(_)) => return Err(HttpError(ApiError::TooManyTargets)),
	};
	if !TARGET_NAME.is_match(&name) {
		return Err(HttpError(ApiError::InvalidTargetName(name)));
	}

	let zoom_override = match (request.zoom_min, request.zoom_max) {
		(Some(min), Some(max)) => {
			Some(ZoomRange::new(min, max).map_err(|err| ApiError::BadRequest(err.to_string()))?)
		}
		_ => None,
	};

	let mut params: JobParams =
		state
			.manager
			.params_for_target(&project, kind, &name, zoom_override, Trigger::Manual, request.run_reason.clone())?;

	if let (Some(min), Some(max)) = (request.publish_zoom_min, request.publish_zoom_max) {
		params.publish_zoom = ZoomRange::new(min, max).ok();
	}
	if let Some(scheme) = request.scheme {
		params.scheme = scheme;
	}
	if let Some(crs) = request.tile_crs {
		params.tile_crs = crs;
	}
	if request.xyz_mode.as_deref() == Some("full") {
		params.xyz_mode = XyzMode::Full;
	}
	if let Some(preset) = request.tile_matrix_preset {
		params.tile_matrix_preset = Some(preset);
	}
	if let Some(allow) = request.allow_remote {
		params.allow_remote = allow;
	}
	if let Some(throttle) = request.throttle_ms {
		params.throttle_ms = throttle;
	}
	if let Some(timeout) = request.render_timeout_ms {
		params.render_timeout_ms = timeout;
	}
	if let Some(retries) = request.tile_retries {
		params.tile_retries = retries;
	}
	params.png_compression = request.png_compression;
	if let Some(extent) = request.project_extent {
		params.project_extent = Some(extent);
	}
	if let Some(crs) = request.extent_crs {
		params.extent_crs = Some(crs);
	}
	params.incremental = request.recache.as_deref() == Some("incremental");
	params.overlap = request.overlap.unwrap_or(false);

	let started = state.manager.start_job(params)?;
	Ok(Json(json!({
		"status": "started",
		"id": started.id,
		"target": started.target,
		"targetMode": started.target_kind.as_str(),
	})))
}

/// `GET /generate-cache/{id}?tail=N`
pub async fn get_job(
	State(state): State<AppState>,
	Path(id): Path<String>,
	Query(query): Query<HashMap<String, String>>,
) -> HttpResult<Json<serde_json::Value>> {
	state.require(&AccessAction::Admin)?;
	let record = state.manager.get_job(&id).ok_or(ApiError::JobNotFound(id))?;

	let tail: usize = query
		.get("tail")
		.and_then(|v| v.parse().ok())
		.unwrap_or(JOB_TAIL_CAP)
		.min(JOB_TAIL_CAP);
	Ok(Json(json!({
		"id": record.id,
		"status": record.status,
		"exitCode": record.exit_code,
		"startedAt": record.started_at,
		"endedAt": record.ended_at,
		"progress": record.progress,
		"stdout": clip_tail(&record.stdout_tail, tail),
		"stderr": clip_tail(&record.stderr_tail, tail),
	})))
}

/// `GET /generate-cache/running`
pub async fn list_running(State(state): State<AppState>) -> HttpResult<Json<serde_json::Value>> {
	state.require(&AccessAction::Admin)?;
	Ok(Json(json!({ "jobs": state.manager.list_running() })))
}

/// `DELETE /generate-cache/{id}`: abort.
pub async fn abort_job(State(state): State<AppState>, Path(id): Path<String>) -> HttpResult<Json<serde_json::Value>> {
	state.require(&AccessAction::Admin)?;
	state.manager.abort(&id)?;
	Ok(Json(json!({"status": "aborted", "id": id})))
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRunRequest {
	pub reason: Option<String>,
	#[serde(default)]
	pub layers: Vec<String>,
	pub run_id: Option<String>,
}

/// `POST /projects/{id}/cache/project`: start a project-wide run.
/// The body is optional; an empty body runs the configured layers.
pub async fn start_project_cache(
	State(state): State<AppState>,
	Path(project): Path<String>,
	body: String,
) -> HttpResult<Json<serde_json::Value>> {
	state.require(&AccessAction::Admin)?;
	let project = ProjectId::parse(&project).ok_or(ApiError::ProjectIdRequired)?;
	state.manager.resolve_project_file(&project)?;

	let request: ProjectRunRequest = if body.trim().is_empty() {
		ProjectRunRequest::default()
	} else {
		serde_json::from_str(&body).map_err(|err| ApiError::BadRequest(err.to_string()))?
	};
	let run_id = state
		.manager
		.start_project_run(&project, request.reason, request.layers, request.run_id, Trigger::Manual)?;
	Ok(Json(json!({"status": "started", "runId": run_id})))
}

/// `GET /projects/{id}/cache/project`: current and last run state.
pub async fn get_project_cache(
	State(state): State<AppState>,
	Path(project): Path<String>,
) -> HttpResult<Json<serde_json::Value>> {
	let project = ProjectId::parse(&project).ok_or(ApiError::ProjectIdRequired)?;
	state.require(&AccessAction::ProjectRead(project.clone()))?;

	let current = state.manager.project_run(&project);
	let config = state
		.config_store
		.load(&project)
		.map_err(|err| ApiError::Internal(format!("{err:#}")))?;
	Ok(Json(json!({
		"current": current,
		"projectCache": config.project_cache,
	})))
}

/// `PATCH /projects/{id}/config`: deep-merge a config patch and re-arm
/// the project's schedule timer.
pub async fn patch_config(
	State(state): State<AppState>,
	Path(project): Path<String>,
	Json(patch): Json<serde_json::Value>,
) -> HttpResult<Json<serde_json::Value>> {
	state.require(&AccessAction::Admin)?;
	let project = ProjectId::parse(&project).ok_or(ApiError::ProjectIdRequired)?;

	let config = state
		.config_store
		.update(&project, patch)
		.map_err(|err| ApiError::ConfigUpdateFailed(format!("{err:#}")))?;
	state.scheduler.schedule_project(&project);
	Ok(Json(serde_json::to_value(&*config).map_err(|err| ApiError::Internal(err.to_string()))?))
}

/// `GET /projects/{id}/config`
pub async fn get_config(State(state): State<AppState>, Path(project): Path<String>) -> HttpResult<Json<serde_json::Value>> {
	let project = ProjectId::parse(&project).ok_or(ApiError::ProjectIdRequired)?;
	state.require(&AccessAction::ProjectRead(project.clone()))?;
	let config = state
		.config_store
		.load(&project)
		.map_err(|err| ApiError::Internal(format!("{err:#}")))?;
	Ok(Json(serde_json::to_value(&*config).map_err(|err| ApiError::Internal(err.to_string()))?))
}

/// `GET /projects`: ids and layer counts from the inventory.
pub async fn list_projects(State(state): State<AppState>) -> HttpResult<Json<serde_json::Value>> {
	let mut projects: Vec<serde_json::Value> = Vec::new();
	for project in state.paths.list_projects() {
		if !state.access.allows(&AccessAction::ProjectRead(project.clone())) {
			continue;
		}
		let inventory = state.inventory(Some(&project));
		projects.push(json!({
			"id": project,
			"layers": inventory.layers.len(),
		}));
	}
	Ok(Json(json!({ "projects": projects })))
}

/// `DELETE /cache/{project}`: purge the whole cache, re-bootstrap an
/// empty index.
pub async fn purge_project(State(state): State<AppState>, Path(project): Path<String>) -> HttpResult<Json<serde_json::Value>> {
	state.require(&AccessAction::Admin)?;
	let project = ProjectId::parse(&project).ok_or(ApiError::ProjectIdRequired)?;

	let dir = state.paths.project_dir(&project);
	if !dir.exists() {
		return Err(HttpError(ApiError::ProjectCacheNotFound(project.to_string())));
	}

	// running jobs lose their directories; abort them first
	for record in state.manager.list_running() {
		if record.project == project {
			let _ = state.manager.abort(&record.id);
			state.manager.wait_job(&record.id).await;
		}
	}

	tokio::fs::remove_dir_all(&dir)
		.await
		.map_err(|err| ApiError::DeleteFailed(format!("{}: {err}", dir.display())))?;
	state.config_store.evict(&project);

	let mut skeleton = tileforge_core::types::ProjectIndex::skeleton(&project);
	skeleton.project = state
		.manager
		.resolve_project_file(&project)
		.ok()
		.map(|p| p.to_string_lossy().to_string());
	state
		.index_store
		.save(&project, &mut skeleton)
		.map_err(|err| ApiError::Internal(format!("{err:#}")))?;

	Ok(Json(json!({"status": "purged", "project": project})))
}

/// `DELETE /cache/{project}/{name}?force=1`: purge one layer or theme.
pub async fn delete_target(
	State(state): State<AppState>,
	Path((project, name)): Path<(String, String)>,
	Query(query): Query<HashMap<String, String>>,
) -> HttpResult<Json<serde_json::Value>> {
	state.require(&AccessAction::Admin)?;
	let project = ProjectId::parse(&project).ok_or(ApiError::ProjectIdRequired)?;
	let force = matches!(query.get("force").map(String::as_str), Some("1" | "true"));

	// the path does not say whether the name is a layer or a theme
	let index = state
		.index_store
		.load(&project)
		.map_err(|err| ApiError::Internal(format!("{err:#}")))?;
	let kind = index
		.find(TargetKind::Layer, &name)
		.map(|_| TargetKind::Layer)
		.or_else(|| index.find(TargetKind::Theme, &name).map(|_| TargetKind::Theme))
		.unwrap_or(TargetKind::Layer);

	state.manager.delete_target(&project, kind, &name, force).await?;
	Ok(Json(json!({"status": "deleted", "project": project, "target": name})))
}

/// The retired global-index endpoint.
pub async fn legacy_global_index() -> Response {
	HttpError(ApiError::Gone).into_response()
}

fn clip_tail(tail: &str, limit: usize) -> String {
	if tail.len() <= limit {
		return tail.to_string();
	}
	let start = tail.len() - limit;
	let start = (start..tail.len()).find(|i| tail.is_char_boundary(*i)).unwrap_or(0);
	tail[start..].to_string()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn target_names_are_validated() {
		assert!(TARGET_NAME.is_match("orto"));
		assert!(TARGET_NAME.is_match("Roads 2024.v2"));
		assert!(!TARGET_NAME.is_match("../escape"));
		assert!(!TARGET_NAME.is_match(""));
		assert!(!TARGET_NAME.is_match("a/b"));
	}

	#[test]
	fn clip_tail_keeps_the_end() {
		assert_eq!(clip_tail("abcdef", 3), "def");
		assert_eq!(clip_tail("abc", 10), "abc");
	}
}
