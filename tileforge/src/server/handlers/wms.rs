//! WMS dispatch: capabilities, GetMap (with tile-aligned caching),
//! GetFeatureInfo, GetLegendGraphic.
//!
//! GetMap requests that are exactly 256×256 and aligned to a known grid are
//! cached like tiles under `_wms_tiles/`; everything else renders to a
//! scratch file and is streamed without caching.

use super::{Kvp, plain_400, serve_file, xml_response};
use crate::access::AccessAction;
use crate::ogc::wms_capabilities;
use crate::server::error::{HttpError, HttpResult, generating_response};
use crate::state::AppState;
use axum::{
	body::Body,
	extract::{Query, State},
	http::{StatusCode, header},
	response::Response,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tileforge_core::{ApiError, types::ProjectId};
use tileforge_render::{RenderTask, TileKey, TileResponse, WorkerJob};

const REQUEST_BUDGET: Duration = Duration::from_secs(10);

/// Relative tolerance when matching a bbox against a grid resolution.
const ALIGNMENT_EPSILON: f64 = 1e-6;

pub async fn kvp(State(state): State<AppState>, Query(raw): Query<HashMap<String, String>>) -> HttpResult<Response> {
	let kvp = Kvp::new(raw);

	let scope = match kvp.get("project") {
		Some(value) => {
			let project = ProjectId::parse(value).ok_or_else(|| ApiError::ProjectNotFound(value.to_string()))?;
			state.require(&AccessAction::ProjectRead(project.clone()))?;
			Some(project)
		}
		None => None,
	};

	match kvp.get_or("request", "GetCapabilities").to_ascii_lowercase().as_str() {
		"getcapabilities" => {
			let inventory = state.inventory(scope.as_ref());
			Ok(xml_response(wms_capabilities(&inventory, "")?))
		}
		"getmap" => get_map(&state, &kvp, scope.as_ref()).await,
		"getfeatureinfo" => get_feature_info(&state, &kvp, scope.as_ref()).await,
		"getlegendgraphic" => get_legend(&state, &kvp, scope.as_ref()).await,
		other => Ok(plain_400(&format!("unsupported WMS request '{other}'"))),
	}
}

struct MapRequest {
	project: ProjectId,
	layers: Vec<String>,
	styles: String,
	bbox: [f64; 4],
	width: u32,
	height: u32,
	crs: String,
	transparent: bool,
	format: String,
	extension: String,
}

fn parse_map_request(state: &AppState, kvp: &Kvp, scope: Option<&ProjectId>) -> Result<MapRequest, HttpError> {
	let project = resolve_project(state, kvp, scope)?;

	let layers: Vec<String> = kvp
		.get_or("layers", "")
		.split(',')
		.filter(|s| !s.is_empty())
		.map(|s| s.trim().to_string())
		.collect();
	if layers.is_empty() {
		return Err(HttpError(ApiError::NoLayers));
	}

	let bbox = parse_bbox(kvp.get("bbox"))?;
	let width: u32 = kvp
		.get_or("width", "256")
		.parse()
		.map_err(|_| ApiError::BadRequest("WIDTH must be an integer".to_string()))?;
	let height: u32 = kvp
		.get_or("height", "256")
		.parse()
		.map_err(|_| ApiError::BadRequest("HEIGHT must be an integer".to_string()))?;

	let crs = kvp
		.get("crs")
		.or_else(|| kvp.get("srs"))
		.unwrap_or("EPSG:3857")
		.to_string();
	let format = kvp.get_or("format", "image/png").to_string();
	let extension = if format.contains("jpeg") || format.contains("jpg") {
		"jpg"
	} else {
		"png"
	}
	.to_string();
	let transparent = kvp.get_or("transparent", "false").eq_ignore_ascii_case("true");

	Ok(MapRequest {
		project,
		layers,
		styles: kvp.get_or("styles", "").to_string(),
		bbox,
		width,
		height,
		crs,
		transparent,
		format,
		extension,
	})
}

async fn get_map(state: &AppState, kvp: &Kvp, scope: Option<&ProjectId>) -> HttpResult<Response> {
	let request = parse_map_request(state, kvp, scope)?;
	let project_path = state.manager.resolve_project_file(&request.project)?;

	// tile-aligned 256×256 requests are cached like tiles
	if request.width == 256 && request.height == 256 {
		if let Some((level, col, row)) = align_to_grid(state, &request) {
			let dir = state.paths.wms_tile_dir(
				&request.project,
				&request.crs,
				&request.layers.join(","),
				&request.styles,
				request.transparent,
			);
			let path = dir.join(level.to_string()).join(col.to_string()).join(format!(
				"{row}.{}",
				request.extension
			));
			if path.is_file() {
				return Ok(serve_file(&path, &request.format).await);
			}

			let job = WorkerJob::render_map(
				&project_path.to_string_lossy(),
				&path.to_string_lossy(),
				request.bbox,
				request.width,
				request.height,
				&request.crs,
				&request.layers,
				request.transparent,
				&request.extension,
			);
			let task = RenderTask {
				key: TileKey {
					project: request.project.clone(),
					kind: tileforge_core::types::TargetKind::Layer,
					// underscore prefix keeps it out of the on-demand markers
					name: format!("_wms:{}", request.layers.join(",")),
					level: level.to_string(),
					col,
					row,
				},
				expected_path: path,
				job,
			};
			return match state.queue.request_tile_within(task, REQUEST_BUDGET).await {
				Ok(TileResponse::Ready(path)) => Ok(serve_file(&path, &request.format).await),
				Ok(TileResponse::Generating {
					queue_position,
					queue_length,
					retry_after_secs,
				}) => Ok(generating_response(queue_position, queue_length, retry_after_secs)),
				Err(err) => Err(HttpError(err)),
			};
		}
	}

	// arbitrary extents render to a scratch file and are not cached
	let scratch = scratch_path(state, &request);
	let job = WorkerJob::render_map(
		&project_path.to_string_lossy(),
		&scratch.to_string_lossy(),
		request.bbox,
		request.width,
		request.height,
		&request.crs,
		&request.layers,
		request.transparent,
		&request.extension,
	);
	let reply = state.pool.run(job).await?;
	if !reply.is_success() {
		return Err(HttpError(ApiError::RenderFailed(
			reply.message().unwrap_or("map render failed").to_string(),
		)));
	}
	let bytes = tokio::fs::read(&scratch)
		.await
		.map_err(|err| ApiError::RenderFailed(format!("renderer wrote no output: {err}")))?;
	let _ = tokio::fs::remove_file(&scratch).await;

	Ok(
		Response::builder()
			.status(StatusCode::OK)
			.header(header::CONTENT_TYPE, request.format)
			.body(Body::from(bytes))
			.expect("map response builds"),
	)
}

async fn get_feature_info(state: &AppState, kvp: &Kvp, scope: Option<&ProjectId>) -> HttpResult<Response> {
	let request = parse_map_request(state, kvp, scope)?;
	let project_path = state.manager.resolve_project_file(&request.project)?;

	let query_layers: Vec<String> = kvp
		.get_or("query_layers", "")
		.split(',')
		.filter(|s| !s.is_empty())
		.map(|s| s.trim().to_string())
		.collect();
	let query_layers = if query_layers.is_empty() { request.layers.clone() } else { query_layers };

	let i: u32 = kvp
		.get("i")
		.or_else(|| kvp.get("x"))
		.and_then(|v| v.parse().ok())
		.unwrap_or(0);
	let j: u32 = kvp
		.get("j")
		.or_else(|| kvp.get("y"))
		.and_then(|v| v.parse().ok())
		.unwrap_or(0);
	let feature_count: u64 = kvp
		.get("feature_count")
		.and_then(|v| v.parse().ok())
		.unwrap_or(10)
		.min(state.settings.wfs_max_features_limit);
	let info_format = kvp.get_or("info_format", "application/json");

	let job = WorkerJob::feature_info(
		&project_path.to_string_lossy(),
		&request.crs,
		request.bbox,
		request.width,
		request.height,
		i,
		j,
		&query_layers,
		feature_count,
		info_format,
	);
	let reply = state.pool.run(job).await?;
	if !reply.is_success() {
		return Err(HttpError(ApiError::RenderFailed(
			reply.message().unwrap_or("feature info failed").to_string(),
		)));
	}

	if let Some(data) = reply.body.get("data") {
		return Ok(
			Response::builder()
				.status(StatusCode::OK)
				.header(header::CONTENT_TYPE, "application/json")
				.body(Body::from(data.to_string()))
				.expect("json response builds"),
		);
	}
	let text = reply.body.get("text").and_then(serde_json::Value::as_str).unwrap_or("");
	Ok(
		Response::builder()
			.status(StatusCode::OK)
			.header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
			.body(Body::from(text.to_string()))
			.expect("text response builds"),
	)
}

async fn get_legend(state: &AppState, kvp: &Kvp, scope: Option<&ProjectId>) -> HttpResult<Response> {
	let project = resolve_project(state, kvp, scope)?;
	let project_path = state.manager.resolve_project_file(&project)?;
	let Some(layer) = kvp.get("layer").or_else(|| kvp.get("layers")) else {
		return Err(HttpError(ApiError::NoLayers));
	};
	let transparent = kvp.get_or("transparent", "true").eq_ignore_ascii_case("true");

	let scratch = state
		.paths
		.project_dir(&project)
		.join("_wms_tiles")
		.join("scratch")
		.join(format!("legend-{}.png", uuid::Uuid::new_v4()));
	if let Some(parent) = scratch.parent() {
		let _ = tokio::fs::create_dir_all(parent).await;
	}

	let job = WorkerJob::legend(
		&project_path.to_string_lossy(),
		layer,
		&scratch.to_string_lossy(),
		"png",
		transparent,
	);
	let reply = state.pool.run(job).await?;
	if !reply.is_success() {
		return Err(HttpError(ApiError::RenderFailed(
			reply.message().unwrap_or("legend render failed").to_string(),
		)));
	}
	let bytes = tokio::fs::read(&scratch)
		.await
		.map_err(|err| ApiError::RenderFailed(format!("renderer wrote no legend: {err}")))?;
	let _ = tokio::fs::remove_file(&scratch).await;

	Ok(
		Response::builder()
			.status(StatusCode::OK)
			.header(header::CONTENT_TYPE, "image/png")
			.body(Body::from(bytes))
			.expect("legend response builds"),
	)
}

fn resolve_project(state: &AppState, kvp: &Kvp, scope: Option<&ProjectId>) -> Result<ProjectId, HttpError> {
	if let Some(project) = scope {
		return Ok(project.clone());
	}
	match kvp.get("project").or_else(|| kvp.get("map")) {
		Some(value) => {
			let project = ProjectId::parse(value).ok_or_else(|| ApiError::ProjectNotFound(value.to_string()))?;
			state.require(&AccessAction::ProjectRead(project.clone()))?;
			Ok(project)
		}
		None => Err(HttpError(ApiError::ProjectIdRequired)),
	}
}

fn parse_bbox(raw: Option<&str>) -> Result<[f64; 4], HttpError> {
	let raw = raw.ok_or(ApiError::MissingBbox)?;
	let parts: Vec<f64> = raw.split(',').filter_map(|p| p.trim().parse().ok()).collect();
	let bbox: [f64; 4] = parts
		.try_into()
		.map_err(|_| ApiError::InvalidBbox(raw.to_string()))?;
	if bbox[0] >= bbox[2] || bbox[1] >= bbox[3] || bbox.iter().any(|v| !v.is_finite()) {
		return Err(HttpError(ApiError::InvalidBbox(raw.to_string())));
	}
	Ok(bbox)
}

/// Match the request bbox against a known grid: returns the level and the
/// tile address when the request is exactly one aligned 256×256 tile.
fn align_to_grid(state: &AppState, request: &MapRequest) -> Option<(u8, u64, u64)> {
	let preset = state.grids.find_preset_for_crs(&request.crs)?;
	let span_x = request.bbox[2] - request.bbox[0];

	for matrix in &preset.matrices {
		let tile_span = matrix.resolution * f64::from(matrix.tile_width.unwrap_or(preset.tile_width));
		if ((span_x - tile_span) / tile_span).abs() > ALIGNMENT_EPSILON {
			continue;
		}
		let origin = matrix.top_left.unwrap_or(preset.top_left_corner);
		let col = (request.bbox[0] - origin[0]) / tile_span;
		let row = (origin[1] - request.bbox[3]) / tile_span;
		if col < -ALIGNMENT_EPSILON || row < -ALIGNMENT_EPSILON {
			return None;
		}
		if (col - col.round()).abs() > ALIGNMENT_EPSILON || (row - row.round()).abs() > ALIGNMENT_EPSILON {
			return None;
		}
		return Some((matrix.z, col.round() as u64, row.round() as u64));
	}
	None
}

fn scratch_path(state: &AppState, request: &MapRequest) -> PathBuf {
	let dir = state
		.paths
		.project_dir(&request.project)
		.join("_wms_tiles")
		.join("scratch");
	let _ = std::fs::create_dir_all(&dir);
	dir.join(format!("map-{}.{}", uuid::Uuid::new_v4(), request.extension))
}
