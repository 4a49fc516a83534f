//! Long-running multi-tile generation jobs.
//!
//! Each batch job owns a dedicated renderer subprocess (jobs run for
//! minutes to hours and must be abortable without disturbing the shared
//! pool). The manager enforces exclusive ownership of `(project, kind,
//! name)` through the active-keys set, caps concurrency, folds worker
//! progress into the index and config stores, and keeps finished jobs
//! queryable for a TTL.

mod progress;
mod project_run;
mod runner;

pub use progress::*;
pub use project_run::*;

use crate::{RecachePlan, WorkerJob, compute_recache_plan};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::{
	path::PathBuf,
	sync::{
		Arc,
		atomic::{AtomicUsize, Ordering},
	},
	time::Duration,
};
use tileforge_core::{
	ApiError, Settings,
	grid::GridRegistry,
	store::{CachePaths, ConfigStore, IndexStore},
	types::{ProjectId, RunResult, TargetKey, TargetKind, TileScheme, ZoomRange},
};
use tokio::sync::Notify;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
	Running,
	Completed,
	Error,
	Aborted,
}

impl JobStatus {
	pub fn as_run_result(self) -> RunResult {
		match self {
			JobStatus::Running | JobStatus::Completed => RunResult::Success,
			JobStatus::Error => RunResult::Error,
			JobStatus::Aborted => RunResult::Aborted,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
	Manual,
	Timer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum XyzMode {
	Partial,
	Full,
}

/// Everything needed to start one batch job.
#[derive(Debug, Clone)]
pub struct JobParams {
	pub project: ProjectId,
	pub kind: TargetKind,
	pub name: String,
	pub project_path: PathBuf,
	pub zoom: ZoomRange,
	pub publish_zoom: Option<ZoomRange>,
	pub scheme: TileScheme,
	pub tile_crs: String,
	pub xyz_mode: XyzMode,
	pub tile_matrix_preset: Option<String>,
	pub allow_remote: bool,
	pub throttle_ms: u64,
	pub render_timeout_ms: u64,
	pub tile_retries: u32,
	pub png_compression: Option<u8>,
	pub project_extent: Option<[f64; 4]>,
	pub extent_crs: Option<String>,
	pub incremental: bool,
	pub overlap: bool,
	pub run_reason: Option<String>,
	pub trigger: Trigger,
	pub run_id: Option<String>,
	pub batch_index: Option<usize>,
	pub batch_total: Option<usize>,
}

impl JobParams {
	pub fn key(&self) -> TargetKey {
		TargetKey::new(self.project.clone(), self.kind, self.name.clone())
	}

	/// The tile-generation job as written to the renderer's stdin.
	pub fn to_worker_job(&self, plan: &RecachePlan, output_dir: &std::path::Path, index_path: &std::path::Path) -> WorkerJob {
		let mut payload = json!({
			"zoom_min": self.zoom.min,
			"zoom_max": self.zoom.max,
			"publish_zoom_min": self.publish_zoom.map_or(self.zoom.min, |z| z.min),
			"publish_zoom_max": self.publish_zoom.map_or(self.zoom.max, |z| z.max),
			"output_dir": output_dir.to_string_lossy(),
			"index_path": index_path.to_string_lossy(),
			"scheme": self.scheme.as_str(),
			"xyz_mode": match self.xyz_mode { XyzMode::Partial => "partial", XyzMode::Full => "full" },
			"wmts": self.scheme == TileScheme::Wmts,
			"allow_remote": self.allow_remote,
			"skip_existing": plan.skip_existing,
			"project": self.project_path.to_string_lossy(),
		});
		let object = payload.as_object_mut().expect("payload is an object");
		object.insert(
			self.kind.as_str().to_string(),
			serde_json::Value::String(self.name.clone()),
		);
		if let Some(preset) = &self.tile_matrix_preset {
			object.insert("tile_matrix_preset".to_string(), json!(preset));
		}
		object.insert("tile_crs".to_string(), json!(self.tile_crs));
		if self.throttle_ms > 0 {
			object.insert("throttle_ms".to_string(), json!(self.throttle_ms));
		}
		object.insert("render_timeout_ms".to_string(), json!(self.render_timeout_ms));
		object.insert("tile_retries".to_string(), json!(self.tile_retries));
		if let Some(compression) = self.png_compression {
			object.insert("png_compression".to_string(), json!(compression));
		}
		if let Some(extent) = self.project_extent {
			object.insert("project_extent4".to_string(), json!(extent));
		}
		if let Some(crs) = &self.extent_crs {
			object.insert("extent_crs".to_string(), json!(crs));
		}
		WorkerJob::from_value(payload)
	}
}

/// In-memory record of one job, queryable until TTL eviction.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
	pub id: String,
	pub project: ProjectId,
	pub kind: TargetKind,
	pub name: String,
	pub status: JobStatus,
	pub trigger: Trigger,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub run_reason: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub run_id: Option<String>,
	pub started_at: DateTime<Utc>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub ended_at: Option<DateTime<Utc>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub exit_code: Option<i32>,
	#[serde(skip)]
	pub stdout_tail: String,
	#[serde(skip)]
	pub stderr_tail: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub progress: Option<tileforge_core::types::ProgressSnapshot>,
	pub zoom_min: u8,
	pub zoom_max: u8,
}

/// Maximum bytes of stdout/stderr kept per job.
pub const JOB_TAIL_CAP: usize = 50_000;

#[derive(Debug)]
pub struct StartedJob {
	pub id: String,
	pub target: String,
	pub target_kind: TargetKind,
}

pub struct BatchJobManager {
	pub(crate) settings: Arc<Settings>,
	pub(crate) paths: CachePaths,
	pub(crate) index_store: Arc<IndexStore>,
	pub(crate) config_store: Arc<ConfigStore>,
	pub(crate) grids: Arc<GridRegistry>,
	/// Directory holding the uploaded project files.
	pub(crate) projects_dir: PathBuf,
	/// Program + args of the renderer subprocess.
	pub(crate) renderer: Vec<String>,
	pub(crate) jobs: DashMap<String, Arc<Mutex<JobRecord>>>,
	pub(crate) active_keys: DashMap<String, String>,
	pub(crate) aborts: DashMap<String, Arc<Notify>>,
	pub(crate) runs: DashMap<String, Arc<Mutex<ProjectRunRecord>>>,
	pub(crate) running_count: AtomicUsize,
}

impl BatchJobManager {
	pub fn new(
		settings: Arc<Settings>,
		paths: CachePaths,
		index_store: Arc<IndexStore>,
		config_store: Arc<ConfigStore>,
		grids: Arc<GridRegistry>,
		projects_dir: PathBuf,
		renderer: Vec<String>,
	) -> Arc<BatchJobManager> {
		Arc::new(BatchJobManager {
			settings,
			paths,
			index_store,
			config_store,
			grids,
			projects_dir,
			renderer,
			jobs: DashMap::new(),
			active_keys: DashMap::new(),
			aborts: DashMap::new(),
			runs: DashMap::new(),
			running_count: AtomicUsize::new(0),
		})
	}

	/// Admit and start one batch job. Fails with `job_already_running` when
	/// the target key is taken and `server_busy` at the concurrency cap.
	pub fn start_job(self: &Arc<Self>, params: JobParams) -> Result<StartedJob, ApiError> {
		let key = params.key();
		let key_string = key.to_string();

		if self.running_count.load(Ordering::SeqCst) >= self.settings.job_max {
			return Err(ApiError::ServerBusy(self.running_count.load(Ordering::SeqCst)));
		}

		let job_id = Uuid::new_v4().to_string();
		match self.active_keys.entry(key_string.clone()) {
			dashmap::mapref::entry::Entry::Occupied(_) => {
				return Err(ApiError::JobAlreadyRunning(key_string));
			}
			dashmap::mapref::entry::Entry::Vacant(vacant) => {
				vacant.insert(job_id.clone());
			}
		}
		self.running_count.fetch_add(1, Ordering::SeqCst);

		// recache planning against what the index remembers
		let previous = self
			.index_store
			.load(&params.project)
			.ok()
			.and_then(|index| index.find(params.kind, &params.name).cloned());
		let previous_range = previous.as_ref().and_then(|e| {
			let (min, max) = (e.last_zoom_min?, e.last_zoom_max?);
			ZoomRange::new(min, max).ok()
		});
		let plan = compute_recache_plan(
			previous_range,
			previous.as_ref().map(|e| e.tile_crs.as_str()),
			params.zoom,
			&params.tile_crs,
			params.incremental,
			params.overlap,
		);

		let record = Arc::new(Mutex::new(JobRecord {
			id: job_id.clone(),
			project: params.project.clone(),
			kind: params.kind,
			name: params.name.clone(),
			status: JobStatus::Running,
			trigger: params.trigger,
			run_reason: params.run_reason.clone(),
			run_id: params.run_id.clone(),
			started_at: Utc::now(),
			ended_at: None,
			exit_code: None,
			stdout_tail: String::new(),
			stderr_tail: String::new(),
			progress: None,
			zoom_min: params.zoom.min,
			zoom_max: params.zoom.max,
		}));
		let abort = Arc::new(Notify::new());

		self.jobs.insert(job_id.clone(), Arc::clone(&record));
		self.aborts.insert(job_id.clone(), Arc::clone(&abort));

		log::info!(
			"starting batch job {job_id} for {key_string} ({}, plan {:?})",
			params.zoom,
			plan.mode
		);

		let manager = Arc::clone(self);
		let target = params.name.clone();
		let target_kind = params.kind;
		tokio::spawn(async move {
			runner::run_job(manager, params, plan, record, abort).await;
		});

		Ok(StartedJob {
			id: job_id,
			target,
			target_kind,
		})
	}

	/// Snapshot of one job, if it is still retained.
	pub fn get_job(&self, id: &str) -> Option<JobRecord> {
		self.jobs.get(id).map(|record| record.lock().clone())
	}

	pub fn list_running(&self) -> Vec<JobRecord> {
		let mut running: Vec<JobRecord> = self
			.jobs
			.iter()
			.map(|entry| entry.value().lock().clone())
			.filter(|record| record.status == JobStatus::Running)
			.collect();
		running.sort_by(|a, b| a.started_at.cmp(&b.started_at));
		running
	}

	/// The job currently holding `(project, kind, name)`, if any.
	pub fn active_job_for(&self, key: &TargetKey) -> Option<String> {
		self.active_keys.get(&key.to_string()).map(|id| id.clone())
	}

	/// Request an abort. Returns `job_not_found` for unknown ids; aborting
	/// a finished job is a no-op.
	pub fn abort(&self, id: &str) -> Result<(), ApiError> {
		let record = self.jobs.get(id).ok_or_else(|| ApiError::JobNotFound(id.to_string()))?;
		let running = record.lock().status == JobStatus::Running;
		drop(record);
		if running {
			if let Some(abort) = self.aborts.get(id) {
				log::info!("abort requested for job {id}");
				// notify_one keeps a permit if the runner isn't parked on
				// the notify yet
				abort.notify_one();
			}
		}
		Ok(())
	}

	/// Poll until the job leaves `running`, returning its final record.
	pub async fn wait_job(&self, id: &str) -> Option<JobRecord> {
		loop {
			let record = self.get_job(id)?;
			if record.status != JobStatus::Running {
				return Some(record);
			}
			tokio::time::sleep(Duration::from_millis(250)).await;
		}
	}

	/// Delete one layer/theme cache: abort a running job (only with
	/// `force`), remove the tile directory, the index entry, and any
	/// auto-generated presets when the project has none left.
	pub async fn delete_target(
		self: &Arc<Self>,
		project: &ProjectId,
		kind: TargetKind,
		name: &str,
		force: bool,
	) -> Result<(), ApiError> {
		let key = TargetKey::new(project.clone(), kind, name.to_string());
		if let Some(job_id) = self.active_job_for(&key) {
			if !force {
				return Err(ApiError::JobRunning { job_id });
			}
			self.abort(&job_id)?;
			self.wait_job(&job_id).await;
		}

		let dir = self.paths.target_dir(project, kind, name);
		let existed_on_disk = dir.exists();
		if existed_on_disk {
			tokio::fs::remove_dir_all(&dir)
				.await
				.map_err(|err| ApiError::DeleteFailed(format!("{}: {err}", dir.display())))?;
		}

		let existed_in_index = self
			.index_store
			.load(project)
			.map(|index| index.find(kind, name).is_some())
			.unwrap_or(false);
		if !existed_on_disk && !existed_in_index {
			return Err(ApiError::LayerNotFound(format!("{project}/{name}")));
		}

		let index = self
			.index_store
			.upsert(project, kind, name, |_| None)
			.map_err(|err| ApiError::DeleteFailed(format!("{err:#}")))?;

		// a project stripped of its last tile set also loses its
		// auto-generated grids and falls back to the bootstrap placeholder
		if index.layers.is_empty() {
			if let Err(err) = self.grids.remove_auto_generated(project.as_str()) {
				log::warn!("removing auto-generated presets for '{project}' failed: {err:#}");
			}
		}

		self
			.config_store
			.mutate(project, |config| {
				let state = config.target_state_mut(kind, name);
				state.last_result = Some(RunResult::Deleted);
				state.last_run_at = Some(Utc::now());
			})
			.map_err(|err| ApiError::ConfigUpdateFailed(format!("{err:#}")))?;

		log::info!("deleted cache of {key}");
		Ok(())
	}

	/// Purge a target's tile directory without touching the index.
	pub fn purge_target_cache(&self, project: &ProjectId, kind: TargetKind, name: &str) -> Result<(), ApiError> {
		let dir = self.paths.target_dir(project, kind, name);
		match std::fs::remove_dir_all(&dir) {
			Ok(()) => Ok(()),
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(err) => Err(ApiError::DeleteFailed(format!("{}: {err}", dir.display()))),
		}
	}

	pub fn paths(&self) -> &CachePaths {
		&self.paths
	}

	pub fn settings(&self) -> &Settings {
		&self.settings
	}

	pub fn config_store(&self) -> &Arc<ConfigStore> {
		&self.config_store
	}

	pub fn index_store(&self) -> &Arc<IndexStore> {
		&self.index_store
	}

	pub fn grids(&self) -> &Arc<GridRegistry> {
		&self.grids
	}

	/// The project file this project was created from, if still present.
	pub fn resolve_project_file(&self, project: &ProjectId) -> Result<PathBuf, ApiError> {
		for extension in ["qgs", "qgz"] {
			let candidate = self.projects_dir.join(format!("{project}.{extension}"));
			if candidate.is_file() {
				return Ok(candidate);
			}
		}
		Err(ApiError::ProjectNotFound(project.to_string()))
	}

	/// Build job parameters for a target from what the index, config, and
	/// settings already know, with an optional zoom override.
	pub fn params_for_target(
		&self,
		project: &ProjectId,
		kind: TargetKind,
		name: &str,
		zoom_override: Option<ZoomRange>,
		trigger: Trigger,
		run_reason: Option<String>,
	) -> Result<JobParams, ApiError> {
		let project_path = self.resolve_project_file(project)?;
		let entry = self
			.index_store
			.load(project)
			.map_err(|err| ApiError::Internal(format!("{err:#}")))?
			.find(kind, name)
			.cloned();
		let config = self
			.config_store
			.load(project)
			.map_err(|err| ApiError::Internal(format!("{err:#}")))?;

		let zoom = zoom_override
			.or_else(|| {
				entry
					.as_ref()
					.and_then(|e| ZoomRange::new(e.zoom_min, e.zoom_max).ok())
			})
			.or_else(|| config.zoom.as_ref().and_then(|z| ZoomRange::new(z.min, z.max).ok()))
			.unwrap_or_else(|| ZoomRange::new(0, 16).expect("static range"));

		let scheme = entry.as_ref().map_or(TileScheme::Wmts, |e| e.scheme);
		let tile_crs = entry
			.as_ref()
			.map(|e| e.tile_crs.clone())
			.or_else(|| config.cache_preferences.tile_crs.clone())
			.unwrap_or_else(|| "EPSG:3857".to_string());

		Ok(JobParams {
			project: project.clone(),
			kind,
			name: name.to_string(),
			project_path,
			zoom,
			publish_zoom: None,
			scheme,
			tile_crs,
			xyz_mode: XyzMode::Partial,
			tile_matrix_preset: entry.as_ref().and_then(|e| e.tile_matrix_preset.clone()),
			allow_remote: config.cache_preferences.allow_remote,
			throttle_ms: config.cache_preferences.throttle_ms,
			render_timeout_ms: self.settings.render_timeout.as_millis() as u64,
			tile_retries: self.settings.render_tile_retries,
			png_compression: None,
			project_extent: entry.as_ref().and_then(|e| e.extent),
			extent_crs: config.extent.as_ref().map(|e| e.crs.clone()),
			incremental: false,
			overlap: false,
			run_reason,
			trigger,
			run_id: None,
			batch_index: None,
			batch_total: None,
		})
	}

	/// Release bookkeeping when a job reaches a terminal state.
	pub(crate) fn release(&self, job_id: &str, key: &TargetKey) {
		// only release the key if this job still owns it
		let key_string = key.to_string();
		if let Some(entry) = self.active_keys.get(&key_string) {
			if *entry == job_id {
				drop(entry);
				self.active_keys.remove(&key_string);
			}
		}
		self.aborts.remove(job_id);
		self.running_count.fetch_sub(1, Ordering::SeqCst);
	}

	/// Drop the job record after the retention TTL.
	pub(crate) fn schedule_eviction(self: &Arc<Self>, job_id: String) {
		let manager = Arc::clone(self);
		let ttl = self.settings.job_ttl;
		tokio::spawn(async move {
			tokio::time::sleep(ttl).await;
			manager.jobs.remove(&job_id);
		});
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;
	use tileforge_core::store::ProjectLocks;

	/// A scripted renderer: emits start/progress/terminal and exits clean.
	const COMPLETING_RENDERER: &str = r#"IFS= read -r line
printf '{"debug":"start_generate","expected_total":4,"tile_crs":"EPSG:3857","scheme":"wmts","project_extent":[0.0,0.0,100.0,100.0]}\n'
printf '{"progress":"tiles","total_generated":4,"expected_total":4}\n'
printf '{"status":"completed"}\n'
exit 0"#;

	/// A renderer that starts, then hangs until killed.
	const HANGING_RENDERER: &str = r#"IFS= read -r line
printf '{"debug":"start_generate","expected_total":100}\n'
sleep 120"#;

	/// A renderer that fails with stderr noise.
	const FAILING_RENDERER: &str = r#"IFS= read -r line
echo "fatal: could not open layer" >&2
echo "giving up" >&2
exit 2"#;

	struct Harness {
		manager: Arc<BatchJobManager>,
		_cache_dir: tempfile::TempDir,
		_presets_dir: tempfile::TempDir,
		projects_dir: tempfile::TempDir,
	}

	fn harness(script: &str) -> Harness {
		let cache_dir = tempfile::tempdir().unwrap();
		let presets_dir = tempfile::tempdir().unwrap();
		let projects_dir = tempfile::tempdir().unwrap();
		std::fs::write(projects_dir.path().join("demo.qgs"), "<qgis/>").unwrap();

		let settings = Arc::new(Settings::default());
		let paths = CachePaths::new(cache_dir.path());
		let locks = Arc::new(ProjectLocks::new());
		let index_store = Arc::new(IndexStore::new(paths.clone(), Arc::clone(&locks)));
		let config_store = Arc::new(ConfigStore::new(paths.clone(), locks, settings.schedule_min_lead));
		let grids = GridRegistry::new(presets_dir.path()).unwrap();

		let manager = BatchJobManager::new(
			settings,
			paths,
			index_store,
			config_store,
			grids,
			projects_dir.path().to_path_buf(),
			vec!["sh".to_string(), "-c".to_string(), script.to_string()],
		);
		Harness {
			manager,
			_cache_dir: cache_dir,
			_presets_dir: presets_dir,
			projects_dir,
		}
	}

	fn demo() -> ProjectId {
		ProjectId::parse("demo").unwrap()
	}

	fn params(manager: &Arc<BatchJobManager>, zoom: ZoomRange, incremental: bool) -> JobParams {
		JobParams {
			zoom,
			incremental,
			..manager
				.params_for_target(&demo(), TargetKind::Layer, "orto", Some(zoom), Trigger::Manual, None)
				.unwrap()
		}
	}

	#[tokio::test]
	async fn completed_job_updates_index_and_config() {
		let h = harness(COMPLETING_RENDERER);
		let zoom = ZoomRange::new(5, 8).unwrap();
		let started = h.manager.start_job(params(&h.manager, zoom, false)).unwrap();
		let record = h.manager.wait_job(&started.id).await.unwrap();
		assert_eq!(record.status, JobStatus::Completed);
		assert_eq!(record.exit_code, Some(0));

		let index = h.manager.index_store().load(&demo()).unwrap();
		let entry = index.find(TargetKind::Layer, "orto").expect("entry upserted");
		assert_eq!((entry.zoom_min, entry.zoom_max), (5, 8));
		assert_eq!((entry.last_zoom_min, entry.last_zoom_max), (Some(5), Some(8)));
		assert!(!entry.partial);
		assert_eq!(entry.extent, Some([0.0, 0.0, 100.0, 100.0]));
		let progress = entry.progress.as_ref().unwrap();
		assert_eq!(progress.percent, 100.0);

		let config = h.manager.config_store().load(&demo()).unwrap();
		let state = config.target_state(TargetKind::Layer, "orto").unwrap();
		assert_eq!(state.last_result, Some(RunResult::Success));
		assert_eq!(state.last_job_id.as_deref(), Some(started.id.as_str()));
	}

	#[tokio::test]
	async fn incremental_run_widens_coverage_without_shrinking() {
		let h = harness(COMPLETING_RENDERER);

		let first = h
			.manager
			.start_job(params(&h.manager, ZoomRange::new(5, 8).unwrap(), false))
			.unwrap();
		h.manager.wait_job(&first.id).await.unwrap();

		let second = h
			.manager
			.start_job(params(&h.manager, ZoomRange::new(9, 10).unwrap(), true))
			.unwrap();
		h.manager.wait_job(&second.id).await.unwrap();

		let index = h.manager.index_store().load(&demo()).unwrap();
		let entry = index.find(TargetKind::Layer, "orto").unwrap();
		assert_eq!((entry.zoom_min, entry.zoom_max), (5, 10));
		assert_eq!((entry.last_zoom_min, entry.last_zoom_max), (Some(9), Some(10)));
		assert!(!entry.partial);
	}

	#[tokio::test]
	async fn duplicate_target_is_rejected_while_running() {
		let h = harness(HANGING_RENDERER);
		let zoom = ZoomRange::new(0, 5).unwrap();
		let started = h.manager.start_job(params(&h.manager, zoom, false)).unwrap();

		let err = h.manager.start_job(params(&h.manager, zoom, false)).unwrap_err();
		assert_eq!(err.code(), "job_already_running");

		h.manager.abort(&started.id).unwrap();
		let record = h.manager.wait_job(&started.id).await.unwrap();
		assert_eq!(record.status, JobStatus::Aborted);

		// the key is released after the abort
		let again = h.manager.start_job(params(&h.manager, zoom, false)).unwrap();
		h.manager.abort(&again.id).unwrap();
		h.manager.wait_job(&again.id).await.unwrap();
	}

	#[tokio::test]
	async fn admission_caps_at_job_max() {
		let h = harness(HANGING_RENDERER);
		let mut ids = Vec::new();
		for i in 0..h.manager.settings().job_max {
			let zoom = ZoomRange::new(0, 5).unwrap();
			let mut p = params(&h.manager, zoom, false);
			p.name = format!("layer{i}");
			ids.push(h.manager.start_job(p).unwrap().id);
		}

		let mut extra = params(&h.manager, ZoomRange::new(0, 5).unwrap(), false);
		extra.name = "one-too-many".to_string();
		let err = h.manager.start_job(extra).unwrap_err();
		assert_eq!(err.code(), "server_busy");

		for id in ids {
			h.manager.abort(&id).unwrap();
			h.manager.wait_job(&id).await.unwrap();
		}
	}

	#[tokio::test]
	async fn failed_job_records_stderr_tail_as_message() {
		let h = harness(FAILING_RENDERER);
		let started = h
			.manager
			.start_job(params(&h.manager, ZoomRange::new(0, 3).unwrap(), false))
			.unwrap();
		let record = h.manager.wait_job(&started.id).await.unwrap();
		assert_eq!(record.status, JobStatus::Error);
		assert_eq!(record.exit_code, Some(2));
		assert!(record.stderr_tail.contains("could not open layer"));

		let config = h.manager.config_store().load(&demo()).unwrap();
		let state = config.target_state(TargetKind::Layer, "orto").unwrap();
		assert_eq!(state.last_result, Some(RunResult::Error));
		let message = state.last_message.as_deref().unwrap();
		assert!(message.contains("giving up"));

		let index = h.manager.index_store().load(&demo()).unwrap();
		assert!(index.find(TargetKind::Layer, "orto").unwrap().partial);
	}

	#[tokio::test]
	async fn delete_while_running_needs_force() {
		let h = harness(HANGING_RENDERER);
		let started = h
			.manager
			.start_job(params(&h.manager, ZoomRange::new(0, 5).unwrap(), false))
			.unwrap();

		// a tile on disk so the delete has something to remove
		let dir = h.manager.paths().target_dir(&demo(), TargetKind::Layer, "orto");
		std::fs::create_dir_all(dir.join("5/15")).unwrap();
		std::fs::write(dir.join("5/15/10.png"), b"png").unwrap();

		let err = h
			.manager
			.delete_target(&demo(), TargetKind::Layer, "orto", false)
			.await
			.unwrap_err();
		assert_eq!(err.code(), "job_running");

		h.manager
			.delete_target(&demo(), TargetKind::Layer, "orto", true)
			.await
			.unwrap();
		assert!(!dir.exists());
		assert_eq!(h.manager.get_job(&started.id).unwrap().status, JobStatus::Aborted);

		let index = h.manager.index_store().load(&demo()).unwrap();
		assert!(index.find(TargetKind::Layer, "orto").is_none());
		let config = h.manager.config_store().load(&demo()).unwrap();
		assert_eq!(
			config.target_state(TargetKind::Layer, "orto").unwrap().last_result,
			Some(RunResult::Deleted)
		);

		// second delete finds nothing
		let err = h
			.manager
			.delete_target(&demo(), TargetKind::Layer, "orto", false)
			.await
			.unwrap_err();
		assert_eq!(err.code(), "layer_not_found");
	}

	#[tokio::test]
	async fn project_run_collects_failures_and_finishes() {
		let h = harness(COMPLETING_RENDERER);
		// seed the index with two layers so the run has targets
		for name in ["a", "b"] {
			let zoom = ZoomRange::new(0, 3).unwrap();
			let mut p = params(&h.manager, zoom, false);
			p.name = name.to_string();
			let started = h.manager.start_job(p).unwrap();
			h.manager.wait_job(&started.id).await.unwrap();
		}

		let run_id = h
			.manager
			.start_project_run(&demo(), Some("test".to_string()), Vec::new(), None, Trigger::Manual)
			.unwrap();

		loop {
			let record = h.manager.project_run(&demo()).unwrap();
			if !matches!(record.status, ProjectRunStatus::Queued | ProjectRunStatus::Running) {
				assert_eq!(record.status, ProjectRunStatus::Completed);
				assert_eq!(record.total_count, 2);
				assert_eq!(record.completed_count, 2);
				assert_eq!(record.run_id, run_id);
				break;
			}
			tokio::time::sleep(Duration::from_millis(100)).await;
		}

		let config = h.manager.config_store().load(&demo()).unwrap();
		assert_eq!(config.project_cache.last_result, Some(RunResult::Success));
		assert_eq!(config.project_cache.last_run_id.as_deref(), Some(run_id.as_str()));
		assert_eq!(config.project_cache.history.len(), 1);
	}

	#[tokio::test]
	async fn unknown_project_file_fails_admission() {
		let h = harness(COMPLETING_RENDERER);
		std::fs::remove_file(h.projects_dir.path().join("demo.qgs")).unwrap();
		let err = h
			.manager
			.params_for_target(&demo(), TargetKind::Layer, "orto", None, Trigger::Manual, None)
			.unwrap_err();
		assert_eq!(err.code(), "project_not_found");
	}
}
