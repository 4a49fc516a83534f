//! The project config store: `cache/<projectId>/project-config.json`.
//!
//! `update` applies a deep-merge patch: objects merge recursively,
//! primitives and arrays replace. Every write trims histories, recomputes
//! schedule `nextRunAt` values, preserves `createdAt`, and overwrites
//! `updatedAt`. The most recent config per project is cached in memory.

use super::{CachePaths, ProjectLocks, write_json_atomic};
use crate::schedule::recompute_next_runs;
use crate::types::{ProjectConfig, ProjectId};
use anyhow::{Context, Result};
use chrono::{Local, Utc};
use parking_lot::RwLock;
use std::{collections::HashMap, fs, sync::Arc, time::Duration};

pub struct ConfigStore {
	paths: CachePaths,
	locks: Arc<ProjectLocks>,
	cache: RwLock<HashMap<String, Arc<ProjectConfig>>>,
	min_lead: Duration,
}

impl ConfigStore {
	pub fn new(paths: CachePaths, locks: Arc<ProjectLocks>, min_lead: Duration) -> ConfigStore {
		ConfigStore {
			paths,
			locks,
			cache: RwLock::new(HashMap::new()),
			min_lead,
		}
	}

	/// Read the config, preferring the in-memory copy.
	pub fn load(&self, project: &ProjectId) -> Result<Arc<ProjectConfig>> {
		if let Some(cached) = self.cache.read().get(project.as_str()) {
			return Ok(Arc::clone(cached));
		}
		let config = Arc::new(self.read_file(project)?);
		self.cache.write().insert(project.to_string(), Arc::clone(&config));
		Ok(config)
	}

	/// Deep-merge `patch` into the stored config.
	pub fn update(&self, project: &ProjectId, patch: serde_json::Value) -> Result<Arc<ProjectConfig>> {
		let lock = self.locks.get(project.as_str());
		let _guard = lock.lock();

		let current = self.read_file(project)?;
		let mut value = serde_json::to_value(&current)?;
		deep_merge(&mut value, patch);
		let config: ProjectConfig =
			serde_json::from_value(value).with_context(|| format!("config patch for '{project}' produced an invalid config"))?;
		self.finish_write(project, config, current.created_at)
	}

	/// Locked typed read-modify-write.
	pub fn mutate(&self, project: &ProjectId, f: impl FnOnce(&mut ProjectConfig)) -> Result<Arc<ProjectConfig>> {
		let lock = self.locks.get(project.as_str());
		let _guard = lock.lock();

		let current = self.read_file(project)?;
		let created_at = current.created_at;
		let mut config = current;
		f(&mut config);
		self.finish_write(project, config, created_at)
	}

	/// Drop the in-memory copy (project delete).
	pub fn evict(&self, project: &ProjectId) {
		self.cache.write().remove(project.as_str());
	}

	pub fn delete_file(&self, project: &ProjectId) -> Result<()> {
		self.evict(project);
		let path = self.paths.config_path(project);
		match fs::remove_file(&path) {
			Ok(()) => Ok(()),
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(err) => Err(err).with_context(|| format!("deleting {}", path.display())),
		}
	}

	fn read_file(&self, project: &ProjectId) -> Result<ProjectConfig> {
		let path = self.paths.config_path(project);
		match fs::read_to_string(&path) {
			Ok(text) => serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display())),
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(ProjectConfig::default()),
			Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
		}
	}

	fn finish_write(
		&self,
		project: &ProjectId,
		mut config: ProjectConfig,
		created_at: Option<chrono::DateTime<Utc>>,
	) -> Result<Arc<ProjectConfig>> {
		config.trim_histories();
		recompute_next_runs(&mut config, Local::now(), self.min_lead);
		config.created_at = created_at.or_else(|| Some(Utc::now()));
		config.updated_at = Some(Utc::now());

		write_json_atomic(&self.paths.config_path(project), &config)?;
		let config = Arc::new(config);
		self.cache.write().insert(project.to_string(), Arc::clone(&config));
		Ok(config)
	}
}

/// Objects merge recursively; primitives and arrays replace.
pub fn deep_merge(target: &mut serde_json::Value, patch: serde_json::Value) {
	use serde_json::Value;
	match (target, patch) {
		(Value::Object(target_map), Value::Object(patch_map)) => {
			for (key, value) in patch_map {
				match target_map.get_mut(&key) {
					Some(slot) => deep_merge(slot, value),
					None => {
						target_map.insert(key, value);
					}
				}
			}
		}
		(slot, value) => *slot = value,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::{CacheMode, DayOfWeek, ScheduleMode, TargetKind};
	use pretty_assertions::assert_eq;
	use serde_json::json;

	fn store(dir: &std::path::Path) -> ConfigStore {
		ConfigStore::new(
			CachePaths::new(dir),
			Arc::new(ProjectLocks::new()),
			Duration::from_secs(5),
		)
	}

	fn demo() -> ProjectId {
		ProjectId::parse("demo").unwrap()
	}

	#[test]
	fn missing_file_loads_as_default() {
		let dir = tempfile::tempdir().unwrap();
		let config = store(dir.path()).load(&demo()).unwrap();
		assert_eq!(config.cache_preferences.mode, CacheMode::Auto);
	}

	#[test]
	fn empty_update_equals_load_modulo_updated_at() {
		let dir = tempfile::tempdir().unwrap();
		let store = store(dir.path());
		let first = store.update(&demo(), json!({})).unwrap();
		let second = store.update(&demo(), json!({})).unwrap();

		let mut a = (*first).clone();
		let mut b = (*second).clone();
		a.updated_at = None;
		b.updated_at = None;
		assert_eq!(a, b);
		assert_eq!(first.created_at, second.created_at, "createdAt is preserved");
	}

	#[test]
	fn deep_merge_merges_objects_and_replaces_arrays() {
		let mut target = json!({
			"cachePreferences": {"mode": "auto", "throttleMs": 100},
			"projectCache": {"includedLayers": ["a", "b"]}
		});
		deep_merge(
			&mut target,
			json!({
				"cachePreferences": {"mode": "wmts"},
				"projectCache": {"includedLayers": ["c"]}
			}),
		);
		assert_eq!(target["cachePreferences"]["mode"], "wmts");
		assert_eq!(target["cachePreferences"]["throttleMs"], 100);
		assert_eq!(target["projectCache"]["includedLayers"], json!(["c"]));
	}

	#[test]
	fn update_recomputes_next_run_at() {
		let dir = tempfile::tempdir().unwrap();
		let store = store(dir.path());
		let config = store
			.update(
				&demo(),
				json!({
					"layers": {
						"orto": {
							"schedule": {
								"enabled": true,
								"mode": "weekly",
								"weekly": {"days": ["mon"], "time": "10:00"}
							}
						}
					}
				}),
			)
			.unwrap();

		let schedule = config.layers["orto"].schedule.as_ref().unwrap();
		assert_eq!(schedule.mode, ScheduleMode::Weekly);
		assert_eq!(schedule.weekly.as_ref().unwrap().days, vec![DayOfWeek::Mon]);
		let next = schedule.next_run_at.expect("enabled schedule gets a next run");
		assert!(next > Utc::now());
	}

	#[test]
	fn update_trims_histories() {
		let dir = tempfile::tempdir().unwrap();
		let store = store(dir.path());
		let entries: Vec<_> = (0..40)
			.map(|i| json!({"at": "2025-01-01T00:00:00Z", "status": "success", "message": format!("run {i}")}))
			.collect();
		let config = store.update(&demo(), json!({"recache": {"history": entries}})).unwrap();
		assert_eq!(config.recache.history.len(), crate::types::HISTORY_LIMIT);
		assert_eq!(config.recache.history.last().unwrap().message.as_deref(), Some("run 39"));
	}

	#[test]
	fn mutate_roundtrips_target_state() {
		let dir = tempfile::tempdir().unwrap();
		let store = store(dir.path());
		store
			.mutate(&demo(), |config| {
				config.target_state_mut(TargetKind::Layer, "orto").auto_recache = true;
			})
			.unwrap();
		let loaded = store.load(&demo()).unwrap();
		assert!(loaded.layers["orto"].auto_recache);
	}

	#[test]
	fn evict_drops_the_cached_copy() {
		let dir = tempfile::tempdir().unwrap();
		let store = store(dir.path());
		store.update(&demo(), json!({})).unwrap();
		store.evict(&demo());
		// after evict the next load re-reads the file
		assert!(store.load(&demo()).is_ok());
	}
}
