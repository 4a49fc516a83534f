//! Shared application state handed to every handler.

use crate::access::{AccessAction, AccessPolicy, AllowAll};
use crate::inventory::Inventory;
use crate::server::error::HttpError;
use std::{path::PathBuf, sync::Arc};
use tileforge_core::{
	ApiError, Settings,
	grid::GridRegistry,
	store::{CachePaths, ConfigStore, IndexStore, ProjectLocks},
	types::ProjectId,
};
use tileforge_render::{RenderQueue, WorkerPool, batch::BatchJobManager, scheduler::Scheduler};

#[derive(Clone)]
pub struct AppState {
	pub settings: Arc<Settings>,
	pub paths: CachePaths,
	pub projects_dir: PathBuf,
	pub index_store: Arc<IndexStore>,
	pub config_store: Arc<ConfigStore>,
	pub grids: Arc<GridRegistry>,
	pub pool: WorkerPool,
	pub queue: Arc<RenderQueue>,
	pub manager: Arc<BatchJobManager>,
	pub scheduler: Arc<Scheduler>,
	pub access: Arc<dyn AccessPolicy>,
}

impl AppState {
	/// Wire the full stack over a cache directory. The worker pool serves
	/// interactive OGC operations; batch jobs spawn their own processes.
	pub fn build(
		settings: Arc<Settings>,
		cache_dir: PathBuf,
		projects_dir: PathBuf,
		presets_dir: PathBuf,
		renderer: Vec<String>,
		pool_workers: usize,
	) -> anyhow::Result<AppState> {
		let paths = CachePaths::new(cache_dir);
		let locks = Arc::new(ProjectLocks::new());
		let index_store = Arc::new(IndexStore::new(paths.clone(), Arc::clone(&locks)));
		let config_store = Arc::new(ConfigStore::new(paths.clone(), locks, settings.schedule_min_lead));
		let grids = GridRegistry::new(presets_dir)?;
		grids.watch()?;

		let pool = WorkerPool::new({
			let mut config = tileforge_render::WorkerPoolConfig::new(renderer.clone(), pool_workers);
			config.abort_grace = settings.abort_grace;
			config
		});
		let queue = RenderQueue::new(pool.clone(), settings.max_render_procs, settings.tile_wait_timeout);
		let manager = BatchJobManager::new(
			Arc::clone(&settings),
			paths.clone(),
			Arc::clone(&index_store),
			Arc::clone(&config_store),
			Arc::clone(&grids),
			projects_dir.clone(),
			renderer,
		);
		let scheduler = Scheduler::new(Arc::clone(&settings), Arc::clone(&manager));

		// first on-demand request per target: stamp the config marker and
		// make sure the index advertises the set as partial/on-demand
		queue.set_first_request_hook(on_demand_marker_hook(
			Arc::clone(&settings),
			Arc::clone(&index_store),
			Arc::clone(&config_store),
			Arc::clone(&grids),
			paths.clone(),
		));

		Ok(AppState {
			settings,
			paths,
			projects_dir,
			index_store,
			config_store,
			grids,
			pool,
			queue,
			manager,
			scheduler,
			access: Arc::new(AllowAll),
		})
	}

	pub fn with_access(mut self, access: Arc<dyn AccessPolicy>) -> AppState {
		self.access = access;
		self
	}

	/// 404 unless the policy grants `action`. A denied request is
	/// indistinguishable from a missing resource on purpose.
	pub fn require(&self, action: &AccessAction) -> Result<(), HttpError> {
		if self.access.allows(action) {
			Ok(())
		} else {
			let what = match action {
				AccessAction::Admin => "admin".to_string(),
				AccessAction::ProjectRead(project) => project.to_string(),
			};
			Err(HttpError(ApiError::ProjectNotFound(what)))
		}
	}

	pub fn inventory(&self, only: Option<&ProjectId>) -> Inventory {
		Inventory::build(&self.paths, &self.index_store, &self.grids, only)
	}
}

fn on_demand_marker_hook(
	settings: Arc<Settings>,
	index_store: Arc<IndexStore>,
	config_store: Arc<ConfigStore>,
	grids: Arc<GridRegistry>,
	paths: CachePaths,
) -> tileforge_render::FirstRequestHook {
	Arc::new(move |key| {
		// internal caches (e.g. WMS scratch tiles) are not advertised
		if key.name.starts_with('_') {
			return;
		}
		let now = chrono::Utc::now();

		let existing = index_store
			.load(&key.project)
			.ok()
			.and_then(|index| index.find(key.kind, &key.name).cloned());
		let scheme = existing.as_ref().map_or(tileforge_core::types::TileScheme::Wmts, |e| e.scheme);
		let tile_crs = existing
			.as_ref()
			.map(|e| e.tile_crs.clone())
			.unwrap_or_else(|| "EPSG:3857".to_string());
		let preset_id = existing
			.as_ref()
			.and_then(|e| e.tile_matrix_preset.clone())
			.or_else(|| grids.find_preset_for_crs(&tile_crs).map(|p| p.id.clone()));

		let result = config_store.mutate(&key.project, |config| {
			let state = config.target_state_mut(key.kind, &key.name);
			state.last_requested_at = Some(now);
			state.scheme_hint = Some(scheme);
			state.tile_crs_hint = Some(tile_crs.clone());
			if state.tile_matrix_preset.is_none() {
				state.tile_matrix_preset = preset_id.clone();
			}
		});
		if let Err(err) = result {
			log::warn!("recording on-demand marker for {}:{} failed: {err:#}", key.project, key.name);
		}

		// absent entries are created as on-demand placeholders
		if existing.is_none() {
			let project = key.project.clone();
			let kind = key.kind;
			let name = key.name.clone();
			let entry_name = name.clone();
			let (bootstrap_zoom_min, bootstrap_zoom_max) =
				(settings.project_bootstrap_zoom_min, settings.project_bootstrap_zoom_max);
			let path = paths.target_dir(&project, kind, &name);
			let tile_matrix_set = preset_id.as_deref().and_then(|id| grids.get(id)).map(|p| p.to_matrix_set());
			let result = index_store.upsert(&project, kind, &name, move |_| {
				Some(tileforge_core::types::IndexEntry {
					name: entry_name,
					kind,
					scheme,
					tile_crs,
					layer_crs: None,
					zoom_min: bootstrap_zoom_min,
					zoom_max: bootstrap_zoom_max,
					last_zoom_min: None,
					last_zoom_max: None,
					tile_format: tileforge_core::types::TileFormat::Png,
					path,
					tile_matrix_preset: preset_id,
					tile_matrix_set,
					extent: None,
					extent_wgs84: None,
					progress: Some(tileforge_core::types::ProgressSnapshot {
						status: tileforge_core::types::ProgressStatus::OnDemand,
						percent: 0.0,
						total_generated: 0,
						expected_total: 0,
						updated_at: now,
						message: None,
					}),
					partial: true,
					bootstrap: false,
					generated: None,
					updated: None,
					last_request_at: Some(now),
				})
			});
			if let Err(err) = result {
				log::warn!("bootstrapping on-demand index entry for {} failed: {err:#}", key.project);
			}
		} else {
			let result = index_store.upsert(&key.project, key.kind, &key.name, |entry| {
				entry.map(|mut entry| {
					entry.last_request_at = Some(now);
					entry
				})
			});
			if let Err(err) = result {
				log::warn!("stamping lastRequestAt for {}:{} failed: {err:#}", key.project, key.name);
			}
		}
	})
}
