//! Router composition, kept declarative: handlers live in `handlers`,
//! lifecycle and middleware in `tile_server`.

use super::handlers::{admin, wfs, wms, wmts};
use crate::state::AppState;
use axum::{
	Router,
	routing::{delete, get, post},
};

pub fn build_router(state: AppState) -> Router {
	Router::new()
		.route("/status", get(|| async { "ready!" }))
		// retired global index
		.route("/index.json", get(admin::legacy_global_index))
		// projects and configuration
		.route("/projects", get(admin::list_projects))
		.route(
			"/projects/{id}/config",
			get(admin::get_config).patch(admin::patch_config),
		)
		.route(
			"/projects/{id}/cache/project",
			get(admin::get_project_cache).post(admin::start_project_cache),
		)
		// batch jobs
		.route("/generate-cache", post(admin::start_job))
		.route("/generate-cache/running", get(admin::list_running))
		.route("/generate-cache/{id}", get(admin::get_job).delete(admin::abort_job))
		// cache deletion
		.route("/cache/{project}", delete(admin::purge_project))
		.route("/cache/{project}/{name}", delete(admin::delete_target))
		// OGC surfaces
		.route("/wmts", get(wmts::kvp))
		.route(
			"/wmts/rest/{project}/{layer}/{style}/{set}/{matrix}/{row}/{col}",
			get(wmts::rest_tile),
		)
		.route("/wmts/{project}/{layer}/{z}/{x}/{y}", get(wmts::short_tile))
		.route("/wms", get(wms::kvp))
		.route("/wfs", get(wfs::get).post(wfs::post))
		.with_state(state)
}
