//! Timer-driven batch recaches.
//!
//! One armed timer per project, always at the earliest due item across
//! per-layer/theme schedules and the legacy project-level strategy (both
//! coexist and both fire). The timers themselves are thin: all date
//! arithmetic lives in `tileforge_core::schedule`, and a heartbeat recovers
//! timers that were missed or never armed (suspended host, clock jumps).

use crate::batch::{BatchJobManager, ProjectRunStatus, Trigger};
use chrono::{DateTime, Local, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::{
	Arc,
	atomic::{AtomicU64, Ordering},
};
use std::time::Duration;
use tileforge_core::{
	Settings,
	schedule::{next_legacy_run, next_schedule_run},
	types::{HistoryEntry, ProjectId, RunResult, TargetKind, ZoomRange, push_history},
};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq)]
enum DueItem {
	Target {
		kind: TargetKind,
		name: String,
		zoom_override: Option<ZoomRange>,
	},
	LegacyProjectRun,
}

struct ArmedTimer {
	target: DateTime<Utc>,
	generation: u64,
	handle: Mutex<Option<JoinHandle<()>>>,
}

pub struct Scheduler {
	settings: Arc<Settings>,
	manager: Arc<BatchJobManager>,
	timers: DashMap<String, Arc<ArmedTimer>>,
	generations: AtomicU64,
}

impl Scheduler {
	pub fn new(settings: Arc<Settings>, manager: Arc<BatchJobManager>) -> Arc<Scheduler> {
		Arc::new(Scheduler {
			settings,
			manager,
			timers: DashMap::new(),
			generations: AtomicU64::new(0),
		})
	}

	/// Arm (or re-arm) the project's timer at its earliest due item.
	pub fn schedule_project(self: &Arc<Self>, project: &ProjectId) {
		let candidates = self.collect_candidates(project);
		let earliest = candidates.iter().map(|(ts, _)| *ts).min();

		let Some(earliest) = earliest else {
			self.disarm(project);
			return;
		};

		let now = Utc::now();
		let delay = (earliest - now).to_std().unwrap_or(Duration::ZERO);
		let clamped = delay.min(self.settings.max_timer_delay);
		if clamped < delay {
			log::debug!("'{project}': timer delay {delay:?} clamped to {clamped:?}, will re-arm on fire");
		}

		let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
		let timer = Arc::new(ArmedTimer {
			target: earliest,
			generation,
			handle: Mutex::new(None),
		});

		if let Some(old) = self.timers.insert(project.to_string(), Arc::clone(&timer)) {
			if let Some(handle) = old.handle.lock().take() {
				handle.abort();
			}
		}

		log::debug!("armed timer for '{project}' at {earliest}");
		let scheduler = Arc::clone(self);
		let project = project.clone();
		let handle = tokio::spawn(async move {
			tokio::time::sleep(clamped).await;
			scheduler.on_fire(&project, generation).await;
		});
		*timer.handle.lock() = Some(handle);
	}

	/// Arm timers for every project found under the cache root.
	pub fn reschedule_all(self: &Arc<Self>) {
		for project in self.manager.paths().list_projects() {
			self.schedule_project(&project);
		}
	}

	/// Spawn the heartbeat loop: force-fire overdue timers and arm missing
	/// ones.
	pub fn start_heartbeat(self: &Arc<Self>) -> JoinHandle<()> {
		let scheduler = Arc::clone(self);
		tokio::spawn(async move {
			loop {
				tokio::time::sleep(scheduler.settings.schedule_heartbeat_interval).await;
				scheduler.heartbeat_tick().await;
			}
		})
	}

	pub(crate) async fn heartbeat_tick(self: &Arc<Self>) {
		let now = Utc::now();
		let overdue_grace =
			chrono::Duration::from_std(self.settings.schedule_overdue_grace).unwrap_or_else(|_| chrono::Duration::seconds(5));

		for project in self.manager.paths().list_projects() {
			match self.timers.get(project.as_str()).map(|t| Arc::clone(t.value())) {
				Some(timer) => {
					if timer.target + overdue_grace < now {
						log::warn!("'{project}': timer overdue (target {}), force-firing", timer.target);
						if let Some(handle) = timer.handle.lock().take() {
							handle.abort();
						}
						self.on_fire(&project, timer.generation).await;
					}
				}
				None => {
					if !self.collect_candidates(&project).is_empty() {
						log::debug!("'{project}': heartbeat arming missing timer");
						self.schedule_project(&project);
					}
				}
			}
		}
	}

	/// The instant the project's timer is armed at, if any.
	pub fn armed_target(&self, project: &ProjectId) -> Option<DateTime<Utc>> {
		self.timers.get(project.as_str()).map(|t| t.target)
	}

	fn disarm(&self, project: &ProjectId) {
		if let Some((_, timer)) = self.timers.remove(project.as_str()) {
			if let Some(handle) = timer.handle.lock().take() {
				handle.abort();
			}
		}
	}

	/// All `(next_run, item)` pairs for a project, computed live.
	fn collect_candidates(&self, project: &ProjectId) -> Vec<(DateTime<Utc>, DueItem)> {
		let Ok(config) = self.manager.config_store().load(project) else {
			return Vec::new();
		};
		let now = Local::now();
		let min_lead = self.settings.schedule_min_lead;
		let mut candidates = Vec::new();

		for (kind, states) in [(TargetKind::Layer, &config.layers), (TargetKind::Theme, &config.themes)] {
			for (name, state) in states {
				let Some(schedule) = &state.schedule else { continue };
				let Some(next) = next_schedule_run(schedule, now, min_lead) else {
					continue;
				};
				let zoom_override = match (schedule.zoom_min, schedule.zoom_max) {
					(Some(min), Some(max)) => ZoomRange::new(min, max).ok(),
					_ => None,
				};
				candidates.push((
					next.with_timezone(&Utc),
					DueItem::Target {
						kind,
						name: name.clone(),
						zoom_override,
					},
				));
			}
		}

		if let Some(next) = next_legacy_run(&config.recache, now, min_lead) {
			candidates.push((next.with_timezone(&Utc), DueItem::LegacyProjectRun));
		}
		candidates
	}

	async fn on_fire(self: &Arc<Self>, project: &ProjectId, generation: u64) {
		// a superseded timer firing late is a no-op
		{
			let Some(timer) = self.timers.get(project.as_str()) else {
				return;
			};
			if timer.generation != generation {
				return;
			}
		}
		let removed = self
			.timers
			.remove_if(project.as_str(), |_, timer| timer.generation == generation);
		let Some((_, timer)) = removed else { return };

		let now = Utc::now();
		let tolerance = chrono::Duration::from_std(self.settings.schedule_due_tolerance)
			.unwrap_or_else(|_| chrono::Duration::seconds(60));
		if timer.target > now + tolerance {
			// clamped long delay: not actually due yet, re-arm
			self.schedule_project(project);
			return;
		}

		self.run_due_items(project).await;
		self.schedule_project(project);
	}

	/// Execute everything due within the tolerance window, earliest first.
	pub(crate) async fn run_due_items(self: &Arc<Self>, project: &ProjectId) {
		let now = Utc::now();
		let tolerance = chrono::Duration::from_std(self.settings.schedule_due_tolerance)
			.unwrap_or_else(|_| chrono::Duration::seconds(60));

		let mut due: Vec<(DateTime<Utc>, DueItem)> = self
			.collect_candidates(project)
			.into_iter()
			.filter(|(ts, _)| *ts <= now + tolerance)
			.collect();
		due.sort_by_key(|(ts, _)| *ts);

		for (_, item) in due {
			match item {
				DueItem::Target {
					kind,
					name,
					zoom_override,
				} => self.run_scheduled_target(project, kind, &name, zoom_override).await,
				DueItem::LegacyProjectRun => self.run_legacy_project_recache(project).await,
			}
		}
	}

	async fn run_scheduled_target(
		self: &Arc<Self>,
		project: &ProjectId,
		kind: TargetKind,
		name: &str,
		zoom_override: Option<ZoomRange>,
	) {
		log::info!("timer fired: recaching {project}:{}:{name}", kind.as_str());

		// without a zoom override the run replaces the whole cache
		if zoom_override.is_none() {
			if let Err(err) = self.manager.purge_target_cache(project, kind, name) {
				log::warn!("scheduled purge of {project}:{name} failed: {err}");
			}
		}

		let params = match self.manager.params_for_target(
			project,
			kind,
			name,
			zoom_override,
			Trigger::Timer,
			Some("scheduled recache".to_string()),
		) {
			Ok(params) => params,
			Err(err) => {
				self.record_target_failure(project, kind, name, &err.to_string());
				return;
			}
		};

		match self.manager.start_job(params) {
			Ok(started) => {
				// the runner records history and last-run state on close
				self.manager.wait_job(&started.id).await;
			}
			Err(err) => {
				log::warn!("scheduled job for {project}:{name} not started: {err}");
				self.record_target_failure(project, kind, name, &err.to_string());
			}
		}
	}

	async fn run_legacy_project_recache(self: &Arc<Self>, project: &ProjectId) {
		log::info!("timer fired: legacy project recache for '{project}'");
		match self
			.manager
			.start_project_run(project, Some("scheduled project recache".to_string()), Vec::new(), None, Trigger::Timer)
		{
			Ok(run_id) => {
				// wait for the run so due items stay sequential
				loop {
					match self.manager.project_run(project) {
						Some(record) if matches!(record.status, ProjectRunStatus::Queued | ProjectRunStatus::Running) => {
							tokio::time::sleep(Duration::from_millis(500)).await;
						}
						_ => break,
					}
				}
				let record = self.manager.project_run(project);
				let (result, message) = match record {
					Some(record) if record.status == ProjectRunStatus::Completed => (RunResult::Success, None),
					Some(record) => (
						RunResult::Error,
						Some(format!("{} layer(s) failed", record.failures.len())),
					),
					None => (RunResult::Success, None),
				};
				self.record_legacy_result(project, result, message, Some(run_id));
			}
			Err(err) => {
				log::warn!("legacy project recache for '{project}' not started: {err}");
				self.record_legacy_result(project, RunResult::Error, Some(err.to_string()), None);
			}
		}
	}

	fn record_target_failure(&self, project: &ProjectId, kind: TargetKind, name: &str, message: &str) {
		let result = self.manager.config_store().mutate(project, |config| {
			let now = Utc::now();
			let state = config.target_state_mut(kind, name);
			state.last_result = Some(RunResult::Error);
			state.last_message = Some(message.to_string());
			state.last_run_at = Some(now);
			if let Some(schedule) = &mut state.schedule {
				schedule.last_run_at = Some(now);
				schedule.last_result = Some(RunResult::Error);
				schedule.last_message = Some(message.to_string());
				push_history(
					&mut schedule.history,
					HistoryEntry {
						at: now,
						status: RunResult::Error,
						message: Some(message.to_string()),
						job_id: None,
						trigger: Some("timer".to_string()),
					},
				);
			}
		});
		if let Err(err) = result {
			log::warn!("recording scheduled failure for {project}:{name} failed: {err:#}");
		}
	}

	fn record_legacy_result(&self, project: &ProjectId, result: RunResult, message: Option<String>, run_id: Option<String>) {
		let update = self.manager.config_store().mutate(project, |config| {
			let now = Utc::now();
			config.recache.last_run_at = Some(now);
			config.recache.last_result = Some(result);
			config.recache.last_message = message.clone();
			push_history(
				&mut config.recache.history,
				HistoryEntry {
					at: now,
					status: result,
					message: message.clone(),
					job_id: run_id.clone(),
					trigger: Some("timer".to_string()),
				},
			);
		});
		if let Err(err) = update {
			log::warn!("recording legacy recache result for '{project}' failed: {err:#}");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::Timelike;
	use std::path::PathBuf;
	use tileforge_core::store::{CachePaths, ConfigStore, IndexStore, ProjectLocks};
	use tileforge_core::types::{DayOfWeek, Schedule, ScheduleMode, WeeklySpec};

	const COMPLETING_RENDERER: &str = r#"IFS= read -r line
printf '{"debug":"start_generate","expected_total":1}\n'
printf '{"status":"completed"}\n'
exit 0"#;

	struct Harness {
		scheduler: Arc<Scheduler>,
		manager: Arc<crate::batch::BatchJobManager>,
		_dirs: (tempfile::TempDir, tempfile::TempDir, tempfile::TempDir),
	}

	fn harness() -> Harness {
		let cache_dir = tempfile::tempdir().unwrap();
		let presets_dir = tempfile::tempdir().unwrap();
		let projects_dir = tempfile::tempdir().unwrap();
		std::fs::write(projects_dir.path().join("demo.qgs"), "<qgis/>").unwrap();

		let settings = Arc::new(Settings::default());
		let paths = CachePaths::new(cache_dir.path());
		let locks = Arc::new(ProjectLocks::new());
		let index_store = Arc::new(IndexStore::new(paths.clone(), Arc::clone(&locks)));
		let config_store = Arc::new(ConfigStore::new(paths.clone(), locks, settings.schedule_min_lead));
		let grids = tileforge_core::grid::GridRegistry::new(presets_dir.path()).unwrap();

		let manager = crate::batch::BatchJobManager::new(
			Arc::clone(&settings),
			paths,
			index_store,
			config_store,
			grids,
			PathBuf::from(projects_dir.path()),
			vec!["sh".to_string(), "-c".to_string(), COMPLETING_RENDERER.to_string()],
		);
		let scheduler = Scheduler::new(settings, Arc::clone(&manager));
		Harness {
			scheduler,
			manager,
			_dirs: (cache_dir, presets_dir, projects_dir),
		}
	}

	fn demo() -> ProjectId {
		ProjectId::parse("demo").unwrap()
	}

	/// Keep the next minute boundary inside the due-tolerance window: with
	/// the clock at second ≥ 50 the boundary could slip past it.
	async fn align_clock() {
		let second = Local::now().second();
		if second >= 50 {
			tokio::time::sleep(Duration::from_secs(u64::from(62 - second))).await;
		}
	}

	/// A weekly schedule hitting every day at the next minute boundary, so
	/// it is due within the 60 s tolerance window.
	fn imminent_schedule() -> Schedule {
		let soon = Local::now() + chrono::Duration::seconds(65);
		Schedule {
			enabled: true,
			mode: ScheduleMode::Weekly,
			weekly: Some(WeeklySpec {
				days: vec![
					DayOfWeek::Mon,
					DayOfWeek::Tue,
					DayOfWeek::Wed,
					DayOfWeek::Thu,
					DayOfWeek::Fri,
					DayOfWeek::Sat,
					DayOfWeek::Sun,
				],
				time: format!("{:02}:{:02}", soon.hour(), soon.minute()),
			}),
			monthly: None,
			yearly: None,
			next_run_at: None,
			last_run_at: None,
			last_result: None,
			last_message: None,
			history: Vec::new(),
			zoom_min: None,
			zoom_max: None,
		}
	}

	#[tokio::test]
	async fn due_schedule_runs_a_timer_job_and_appends_history() {
		let h = harness();
		align_clock().await;
		h.manager
			.config_store()
			.mutate(&demo(), |config| {
				config.target_state_mut(TargetKind::Layer, "orto").schedule = Some(imminent_schedule());
			})
			.unwrap();

		h.scheduler.run_due_items(&demo()).await;

		let config = h.manager.config_store().load(&demo()).unwrap();
		let state = config.target_state(TargetKind::Layer, "orto").unwrap();
		assert_eq!(state.last_result, Some(RunResult::Success));
		let schedule = state.schedule.as_ref().unwrap();
		assert_eq!(schedule.history.len(), 1);
		assert_eq!(schedule.history[0].trigger.as_deref(), Some("timer"));
		assert_eq!(schedule.history[0].status, RunResult::Success);
		// the write recomputed the cached next run
		let next = schedule.next_run_at.unwrap();
		assert!(next > Utc::now());
	}

	#[tokio::test]
	async fn schedule_project_arms_one_timer_at_the_earliest_item() {
		let h = harness();
		h.manager
			.config_store()
			.mutate(&demo(), |config| {
				config.target_state_mut(TargetKind::Layer, "orto").schedule = Some(imminent_schedule());
			})
			.unwrap();

		assert_eq!(h.scheduler.armed_target(&demo()), None);
		h.scheduler.schedule_project(&demo());
		let target = h.scheduler.armed_target(&demo()).expect("timer armed");
		assert!(target > Utc::now());

		// disabling the schedule disarms on the next recompute
		h.manager
			.config_store()
			.mutate(&demo(), |config| {
				config
					.target_state_mut(TargetKind::Layer, "orto")
					.schedule
					.as_mut()
					.unwrap()
					.enabled = false;
			})
			.unwrap();
		h.scheduler.schedule_project(&demo());
		assert_eq!(h.scheduler.armed_target(&demo()), None);
	}

	#[tokio::test]
	async fn heartbeat_arms_missing_timers() {
		let h = harness();
		h.manager
			.config_store()
			.mutate(&demo(), |config| {
				config.target_state_mut(TargetKind::Layer, "orto").schedule = Some(imminent_schedule());
			})
			.unwrap();

		assert_eq!(h.scheduler.armed_target(&demo()), None);
		h.scheduler.heartbeat_tick().await;
		assert!(h.scheduler.armed_target(&demo()).is_some());
	}
}
