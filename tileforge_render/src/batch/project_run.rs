//! Project-wide cache runs: one batch job per included layer, serialized.
//!
//! A run purges each layer before its job (full recache), collects per-layer
//! failures without stopping, and completes successfully only when every
//! layer succeeded. The per-project record stays queryable for a TTL.

use super::{BatchJobManager, JobStatus, Trigger};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tileforge_core::{
	ApiError,
	types::{HistoryEntry, ProjectId, RunResult, TargetKind, push_history},
};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectRunStatus {
	Queued,
	Running,
	Completed,
	Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunFailure {
	pub layer: String,
	pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRunRecord {
	pub run_id: String,
	pub project: ProjectId,
	pub status: ProjectRunStatus,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub reason: Option<String>,
	pub total_count: usize,
	pub completed_count: usize,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub current_layer: Option<String>,
	pub current_index: usize,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub failures: Vec<RunFailure>,
	pub started_at: DateTime<Utc>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub ended_at: Option<DateTime<Utc>>,
}

impl BatchJobManager {
	/// Start a project-wide run over `layers` (empty = the configured
	/// included layers, falling back to every layer in the index).
	pub fn start_project_run(
		self: &Arc<Self>,
		project: &ProjectId,
		reason: Option<String>,
		layers: Vec<String>,
		run_id: Option<String>,
		trigger: Trigger,
	) -> Result<String, ApiError> {
		if let Some(existing) = self.runs.get(project.as_str()) {
			let record = existing.lock();
			if matches!(record.status, ProjectRunStatus::Queued | ProjectRunStatus::Running) {
				return Err(ApiError::BatchRunning(record.run_id.clone()));
			}
		}

		let layers = self.resolve_run_layers(project, layers)?;
		let run_id = run_id.unwrap_or_else(|| Uuid::new_v4().to_string());

		let record = Arc::new(Mutex::new(ProjectRunRecord {
			run_id: run_id.clone(),
			project: project.clone(),
			status: ProjectRunStatus::Queued,
			reason: reason.clone(),
			total_count: layers.len(),
			completed_count: 0,
			current_layer: None,
			current_index: 0,
			failures: Vec::new(),
			started_at: Utc::now(),
			ended_at: None,
		}));
		self.runs.insert(project.to_string(), Arc::clone(&record));

		log::info!("starting project run {run_id} for '{project}' over {} layers", layers.len());

		let manager = Arc::clone(self);
		let project = project.clone();
		tokio::spawn(async move {
			manager.drive_project_run(project, layers, record, trigger).await;
		});
		Ok(run_id)
	}

	/// The current (or most recent retained) run record for a project.
	pub fn project_run(&self, project: &ProjectId) -> Option<ProjectRunRecord> {
		self.runs.get(project.as_str()).map(|record| record.lock().clone())
	}

	fn resolve_run_layers(&self, project: &ProjectId, requested: Vec<String>) -> Result<Vec<String>, ApiError> {
		if !requested.is_empty() {
			return Ok(requested);
		}
		let config = self
			.config_store
			.load(project)
			.map_err(|err| ApiError::Internal(format!("{err:#}")))?;
		if !config.project_cache.included_layers.is_empty() {
			return Ok(config.project_cache.included_layers.clone());
		}
		let index = self
			.index_store
			.load(project)
			.map_err(|err| ApiError::Internal(format!("{err:#}")))?;
		let layers: Vec<String> = index
			.layers
			.iter()
			.filter(|e| e.kind == TargetKind::Layer)
			.map(|e| e.name.clone())
			.collect();
		if layers.is_empty() {
			return Err(ApiError::NoLayers);
		}
		Ok(layers)
	}

	async fn drive_project_run(
		self: Arc<Self>,
		project: ProjectId,
		layers: Vec<String>,
		record: Arc<Mutex<ProjectRunRecord>>,
		trigger: Trigger,
	) {
		let run_id = {
			let mut locked = record.lock();
			locked.status = ProjectRunStatus::Running;
			locked.started_at = Utc::now();
			locked.run_id.clone()
		};

		for (index, layer) in layers.iter().enumerate() {
			{
				let mut locked = record.lock();
				locked.current_layer = Some(layer.clone());
				locked.current_index = index;
			}

			if let Err(err) = self.run_single_layer(&project, layer, &run_id, index, layers.len(), trigger).await {
				log::warn!("project run {run_id}: layer '{layer}' failed: {err}");
				record.lock().failures.push(RunFailure {
					layer: layer.clone(),
					message: err.to_string(),
				});
			}
			record.lock().completed_count = index + 1;
		}

		let (status, message) = {
			let mut locked = record.lock();
			locked.current_layer = None;
			locked.ended_at = Some(Utc::now());
			locked.status = if locked.failures.is_empty() {
				ProjectRunStatus::Completed
			} else {
				ProjectRunStatus::Error
			};
			let message = if locked.failures.is_empty() {
				None
			} else {
				Some(
					locked
						.failures
						.iter()
						.map(|f| format!("{}: {}", f.layer, f.message))
						.collect::<Vec<_>>()
						.join("; "),
				)
			};
			(locked.status, message)
		};

		let run_result = if status == ProjectRunStatus::Completed {
			RunResult::Success
		} else {
			RunResult::Error
		};
		let update = self.config_store.mutate(&project, |config| {
			let now = Utc::now();
			config.project_cache.last_run_at = Some(now);
			config.project_cache.last_result = Some(run_result);
			config.project_cache.last_message = message.clone();
			config.project_cache.last_run_id = Some(run_id.clone());
			push_history(
				&mut config.project_cache.history,
				HistoryEntry {
					at: now,
					status: run_result,
					message: message.clone(),
					job_id: Some(run_id.clone()),
					trigger: Some(
						match trigger {
							Trigger::Manual => "manual",
							Trigger::Timer => "timer",
						}
						.to_string(),
					),
				},
			);
		});
		if let Err(err) = update {
			log::warn!("project run {run_id}: config update failed: {err:#}");
		}

		log::info!("project run {run_id} for '{project}' finished: {status:?}");

		// retain the record for a while, then drop it
		let manager = Arc::clone(&self);
		let project_key = project.to_string();
		let ttl = self.settings.project_batch_ttl;
		tokio::spawn(async move {
			tokio::time::sleep(ttl).await;
			manager
				.runs
				.remove_if(&project_key, |_, record| record.lock().run_id == run_id);
		});
	}

	async fn run_single_layer(
		self: &Arc<Self>,
		project: &ProjectId,
		layer: &str,
		run_id: &str,
		index: usize,
		total: usize,
		trigger: Trigger,
	) -> Result<(), ApiError> {
		// full-recache path: the old cache goes first
		self.purge_target_cache(project, TargetKind::Layer, layer)?;

		let mut params = self.params_for_target(
			project,
			TargetKind::Layer,
			layer,
			None,
			trigger,
			Some(format!("project run {run_id}")),
		)?;
		params.run_id = Some(run_id.to_string());
		params.batch_index = Some(index);
		params.batch_total = Some(total);

		let started = self.start_job(params)?;
		let record = self
			.wait_job(&started.id)
			.await
			.ok_or_else(|| ApiError::Internal("job record evicted while running".to_string()))?;
		match record.status {
			JobStatus::Completed => Ok(()),
			JobStatus::Aborted => Err(ApiError::Aborted),
			_ => Err(ApiError::RenderFailed(
				record.progress.and_then(|p| p.message).unwrap_or_else(|| "layer job failed".to_string()),
			)),
		}
	}
}
