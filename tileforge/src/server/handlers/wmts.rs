//! WMTS dispatch: capabilities, KVP GetTile, REST tiles.
//!
//! REST requests are strict (advertised style and set id only, integer
//! indices, hard 404 on out-of-bounds). KVP requests are tolerant: layer
//! identifiers resolve through several fallbacks and unknown TileMatrix
//! identifiers are remapped to the nearest numeric level.

use super::{Kvp, plain_400, plain_404, serve_file, xml_response};
use crate::access::AccessAction;
use crate::inventory::InventoryLayer;
use crate::ogc::{resolve_tile, tile_bbox, wmts_capabilities};
use crate::server::error::{HttpError, HttpResult, generating_response};
use crate::state::AppState;
use axum::{
	extract::{Path, Query, State},
	response::Response,
};
use std::collections::HashMap;
use std::time::Duration;
use tileforge_core::{
	ApiError,
	grid::TileMatrixPreset,
	types::{ProjectId, TargetKind},
};
use tileforge_render::{RenderTask, TileKey, TileResponse, WorkerJob};

/// How long a tile request waits synchronously before answering 202.
const REQUEST_BUDGET: Duration = Duration::from_secs(10);

/// `GET /wmts`: KVP entry point: capabilities or GetTile.
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
			let xml = wmts_capabilities(&inventory, &state.grids, &base_url(&kvp))?;
			Ok(xml_response(xml))
		}
		"gettile" => kvp_get_tile(&state, &kvp, scope.as_ref()).await,
		other => Ok(plain_400(&format!("unsupported WMTS request '{other}'"))),
	}
}

async fn kvp_get_tile(state: &AppState, kvp: &Kvp, scope: Option<&ProjectId>) -> HttpResult<Response> {
	let Some(requested_layer) = kvp.get("layer") else {
		return Ok(plain_400("LAYER parameter is required"));
	};
	let inventory = state.inventory(scope);
	let Some(layer) = inventory.resolve_layer(requested_layer) else {
		return Ok(plain_404());
	};
	state.require(&AccessAction::ProjectRead(layer.project.clone()))?;

	let Some(preset) = state.grids.get(&layer.set_id) else {
		return Ok(plain_404());
	};

	let (Some(row), Some(col)) = (parse_index(kvp.get("tilerow")), parse_index(kvp.get("tilecol"))) else {
		return Ok(plain_400("TileRow/TileCol must be non-negative integers"));
	};
	let requested_matrix = kvp.get_or("tilematrix", "");
	// tolerate "set:level" style identifiers
	let requested_matrix = requested_matrix.rsplit(':').next().unwrap_or(requested_matrix);

	let Some(resolved) = resolve_tile(&preset, requested_matrix, col, row) else {
		return Ok(plain_404());
	};

	serve_or_render(state, layer, &preset, resolved.matrix.z, resolved.col, resolved.row).await
}

/// `GET /wmts/rest/{project}/{layer}/{style}/{set}/{matrix}/{row}/{col}.png`
pub async fn rest_tile(
	State(state): State<AppState>,
	Path((project, layer_key, style, set_id, matrix_id, row, col)): Path<(
		String,
		String,
		String,
		String,
		String,
		String,
		String,
	)>,
) -> HttpResult<Response> {
	let Some(project) = ProjectId::parse(&project) else {
		return Ok(plain_404());
	};
	state.require(&AccessAction::ProjectRead(project.clone()))?;

	let inventory = state.inventory(Some(&project));
	let Some(layer) = inventory.layers.iter().find(|l| l.entry.name == layer_key) else {
		return Ok(plain_404());
	};

	// only the advertised style and set are valid on the REST surface
	if style != "default" {
		return Ok(plain_400("unknown style"));
	}
	if set_id != layer.set_id {
		return Ok(plain_400("TileMatrixSet does not match the layer"));
	}

	let Some(preset) = state.grids.get(&layer.set_id) else {
		return Ok(plain_404());
	};

	let Some(col) = col.strip_suffix(&format!(".{}", layer.entry.tile_format.extension())) else {
		return Ok(plain_400("unexpected tile extension"));
	};
	let (Some(row), Some(col)) = (parse_index(Some(row.as_str())), parse_index(Some(col))) else {
		return Ok(plain_400("tile indices must be non-negative integers"));
	};

	let Some(matrix) = preset.matrix_by_identifier(&matrix_id) else {
		return Ok(plain_404());
	};
	if col > u64::from(matrix.matrix_width) - 1 || row > u64::from(matrix.matrix_height) - 1 {
		return Ok(plain_404());
	}

	serve_or_render(&state, layer, &preset, matrix.z, col, row).await
}

/// `GET /wmts/{project}/{layer}/{z}/{x}/{y}.png`: the short tile form.
pub async fn short_tile(
	State(state): State<AppState>,
	Path((project, layer_key, z, x, y)): Path<(String, String, String, String, String)>,
) -> HttpResult<Response> {
	let Some(project) = ProjectId::parse(&project) else {
		return Ok(plain_404());
	};
	state.require(&AccessAction::ProjectRead(project.clone()))?;

	let inventory = state.inventory(Some(&project));
	let Some(layer) = inventory.layers.iter().find(|l| l.entry.name == layer_key) else {
		return Ok(plain_404());
	};
	let Some(preset) = state.grids.get(&layer.set_id) else {
		return Ok(plain_404());
	};

	let y = y
		.strip_suffix(&format!(".{}", layer.entry.tile_format.extension()))
		.unwrap_or(&y);
	let (Some(row), Some(col)) = (parse_index(Some(y)), parse_index(Some(x.as_str()))) else {
		return Ok(plain_400("tile indices must be non-negative integers"));
	};
	let Some(resolved) = resolve_tile(&preset, &z, col, row) else {
		return Ok(plain_404());
	};

	serve_or_render(&state, layer, &preset, resolved.matrix.z, resolved.col, resolved.row).await
}

/// Serve the cached tile or push an on-demand render, 202-ing past the
/// request budget.
async fn serve_or_render(
	state: &AppState,
	layer: &InventoryLayer,
	preset: &TileMatrixPreset,
	source_level: u8,
	col: u64,
	row: u64,
) -> HttpResult<Response> {
	let entry = &layer.entry;
	// the on-disk level comes from the matrix, which for auto-generated
	// grids may differ from the advertised identifier
	let level = source_level.to_string();
	let path = state.paths.tile_path(
		&layer.project,
		entry.kind,
		&entry.name,
		&level,
		col,
		row,
		entry.tile_format.extension(),
	);

	if path.is_file() {
		return Ok(serve_file(&path, entry.tile_format.mime()).await);
	}

	let Some(matrix) = preset.matrix_by_level(source_level) else {
		return Ok(plain_404());
	};
	let project_path = state.manager.resolve_project_file(&layer.project)?;
	let bbox = tile_bbox(preset, matrix, col, row);

	let job = WorkerJob::render_map(
		&project_path.to_string_lossy(),
		&path.to_string_lossy(),
		bbox,
		matrix.tile_width.unwrap_or(preset.tile_width),
		matrix.tile_height.unwrap_or(preset.tile_height),
		&entry.tile_crs,
		&[entry.name.clone()],
		entry.tile_format == tileforge_core::types::TileFormat::Png,
		entry.tile_format.extension(),
	);

	let task = RenderTask {
		key: TileKey {
			project: layer.project.clone(),
			kind: entry.kind,
			name: entry.name.clone(),
			level,
			col,
			row,
		},
		expected_path: path,
		job,
	};

	match state.queue.request_tile_within(task, REQUEST_BUDGET).await {
		Ok(TileResponse::Ready(path)) => Ok(serve_file(&path, entry.tile_format.mime()).await),
		Ok(TileResponse::Generating {
			queue_position,
			queue_length,
			retry_after_secs,
		}) => Ok(generating_response(queue_position, queue_length, retry_after_secs)),
		Err(err) => Err(HttpError(err)),
	}
}

fn parse_index(value: Option<&str>) -> Option<u64> {
	let value = value?;
	if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
		return None;
	}
	value.parse().ok()
}

fn base_url(kvp: &Kvp) -> String {
	kvp.get("baseurl").unwrap_or("").trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn indices_reject_signs_and_fractions() {
		assert_eq!(parse_index(Some("15")), Some(15));
		assert_eq!(parse_index(Some("-1")), None);
		assert_eq!(parse_index(Some("+1")), None);
		assert_eq!(parse_index(Some("1.5")), None);
		assert_eq!(parse_index(Some("")), None);
		assert_eq!(parse_index(None), None);
	}
}
