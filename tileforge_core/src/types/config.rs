//! The persisted per-project configuration.
//!
//! Serialized pretty-printed as `cache/<projectId>/project-config.json`.
//! Everything is optional on disk so configs written by older versions keep
//! loading; histories are trimmed to [`HISTORY_LIMIT`] on every write.

use super::{CacheMode, HistoryEntry, RunResult, Schedule, TargetKind, TileScheme, push_history};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProjectConfig {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub created_at: Option<DateTime<Utc>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub updated_at: Option<DateTime<Utc>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub extent: Option<ExtentState>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub extent_wgs84: Option<ExtentState>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub zoom: Option<ZoomState>,
	#[serde(default)]
	pub cache_preferences: CachePreferences,
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub layers: BTreeMap<String, TargetState>,
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub themes: BTreeMap<String, TargetState>,
	/// Legacy project-scope schedule; coexists with per-target schedules.
	#[serde(default)]
	pub recache: RecacheSettings,
	#[serde(default)]
	pub project_cache: ProjectCacheState,
}

impl ProjectConfig {
	pub fn target_states(&self, kind: TargetKind) -> &BTreeMap<String, TargetState> {
		match kind {
			TargetKind::Layer => &self.layers,
			TargetKind::Theme => &self.themes,
		}
	}

	pub fn target_state(&self, kind: TargetKind, name: &str) -> Option<&TargetState> {
		self.target_states(kind).get(name)
	}

	/// Get-or-insert the state record for one layer/theme.
	pub fn target_state_mut(&mut self, kind: TargetKind, name: &str) -> &mut TargetState {
		let map = match kind {
			TargetKind::Layer => &mut self.layers,
			TargetKind::Theme => &mut self.themes,
		};
		map.entry(name.to_string()).or_default()
	}

	pub fn remove_target_state(&mut self, kind: TargetKind, name: &str) -> bool {
		let map = match kind {
			TargetKind::Layer => &mut self.layers,
			TargetKind::Theme => &mut self.themes,
		};
		map.remove(name).is_some()
	}

	/// Enforce the history cap on every embedded history array.
	pub fn trim_histories(&mut self) {
		trim(&mut self.recache.history);
		trim(&mut self.project_cache.history);
		for state in self.layers.values_mut().chain(self.themes.values_mut()) {
			if let Some(schedule) = &mut state.schedule {
				trim(&mut schedule.history);
			}
		}

		fn trim(history: &mut Vec<HistoryEntry>) {
			if history.len() > super::HISTORY_LIMIT {
				let excess = history.len() - super::HISTORY_LIMIT;
				history.drain(..excess);
			}
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExtentState {
	pub bbox: [f64; 4],
	pub crs: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ZoomState {
	pub min: u8,
	pub max: u8,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CachePreferences {
	#[serde(default)]
	pub mode: CacheMode,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tile_crs: Option<String>,
	#[serde(default)]
	pub allow_remote: bool,
	#[serde(default)]
	pub throttle_ms: u64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub updated_at: Option<DateTime<Utc>>,
}

impl Default for CachePreferences {
	fn default() -> Self {
		CachePreferences {
			mode: CacheMode::Auto,
			tile_crs: None,
			allow_remote: false,
			throttle_ms: 0,
			updated_at: None,
		}
	}
}

/// Per-layer/theme run state, on-demand hints, and schedule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TargetState {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub last_params: Option<serde_json::Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub last_requested_at: Option<DateTime<Utc>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub last_result: Option<RunResult>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub last_message: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub last_run_at: Option<DateTime<Utc>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub last_job_id: Option<String>,
	#[serde(default)]
	pub auto_recache: bool,
	/// Live progress of the current or most recent run.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub progress: Option<super::ProgressSnapshot>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub schedule: Option<Schedule>,
	/// On-demand marker: scheme inferred at first tile request.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub scheme_hint: Option<TileScheme>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tile_crs_hint: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tile_matrix_preset: Option<String>,
	/// Admin-defined technical overrides for irregular layers.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub overrides: Option<TargetOverrides>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TargetOverrides {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub extent: Option<[f64; 4]>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub resolutions: Option<Vec<f64>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub origin: Option<[f64; 2]>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tile_grid: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub crs: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub layer_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecacheStrategy {
	Interval,
	#[default]
	Times,
}

/// The legacy project-scope schedule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RecacheSettings {
	#[serde(default)]
	pub enabled: bool,
	#[serde(default)]
	pub strategy: RecacheStrategy,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub interval_minutes: Option<u64>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub times_of_day: Vec<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub next_run_at: Option<DateTime<Utc>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub last_run_at: Option<DateTime<Utc>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub last_result: Option<RunResult>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub last_message: Option<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub history: Vec<HistoryEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProjectCacheState {
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub included_layers: Vec<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub last_run_at: Option<DateTime<Utc>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub last_result: Option<RunResult>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub last_message: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub last_run_id: Option<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub history: Vec<HistoryEntry>,
}

/// Record a run outcome on a target state and its schedule history.
pub fn record_run_result(
	state: &mut TargetState,
	result: RunResult,
	message: Option<String>,
	job_id: Option<String>,
	trigger: Option<String>,
) {
	let now = Utc::now();
	state.last_result = Some(result);
	state.last_message = message.clone();
	state.last_run_at = Some(now);
	state.last_job_id = job_id.clone();
	if let Some(schedule) = &mut state.schedule {
		schedule.last_run_at = Some(now);
		schedule.last_result = Some(result);
		schedule.last_message = message.clone();
		push_history(
			&mut schedule.history,
			HistoryEntry {
				at: now,
				status: result,
				message,
				job_id,
				trigger,
			},
		);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::{ScheduleMode, WeeklySpec};

	#[test]
	fn empty_config_loads_from_empty_object() {
		let config: ProjectConfig = serde_json::from_str("{}").unwrap();
		assert_eq!(config.cache_preferences.mode, CacheMode::Auto);
		assert!(config.layers.is_empty());
		assert!(!config.recache.enabled);
	}

	#[test]
	fn target_state_mut_inserts_defaults() {
		let mut config = ProjectConfig::default();
		config.target_state_mut(TargetKind::Layer, "orto").auto_recache = true;
		assert!(config.layers["orto"].auto_recache);
		assert!(config.themes.is_empty());
	}

	#[test]
	fn trim_histories_caps_every_array() {
		let mut config = ProjectConfig::default();
		let entry = HistoryEntry {
			at: Utc::now(),
			status: RunResult::Success,
			message: None,
			job_id: None,
			trigger: None,
		};
		config.recache.history = vec![entry.clone(); 40];
		let state = config.target_state_mut(TargetKind::Theme, "base");
		state.schedule = Some(Schedule {
			enabled: true,
			mode: ScheduleMode::Weekly,
			weekly: Some(WeeklySpec {
				days: vec![crate::types::DayOfWeek::Mon],
				time: "10:00".to_string(),
			}),
			monthly: None,
			yearly: None,
			next_run_at: None,
			last_run_at: None,
			last_result: None,
			last_message: None,
			history: vec![entry; 30],
			zoom_min: None,
			zoom_max: None,
		});
		config.trim_histories();
		assert_eq!(config.recache.history.len(), crate::types::HISTORY_LIMIT);
		assert_eq!(
			config.themes["base"].schedule.as_ref().unwrap().history.len(),
			crate::types::HISTORY_LIMIT
		);
	}

	#[test]
	fn record_run_result_touches_schedule_history() {
		let mut state = TargetState {
			schedule: Some(Schedule {
				enabled: true,
				mode: ScheduleMode::Weekly,
				weekly: None,
				monthly: None,
				yearly: None,
				next_run_at: None,
				last_run_at: None,
				last_result: None,
				last_message: None,
				history: Vec::new(),
				zoom_min: None,
				zoom_max: None,
			}),
			..TargetState::default()
		};
		record_run_result(
			&mut state,
			RunResult::Success,
			Some("ok".into()),
			Some("job-1".into()),
			Some("timer".into()),
		);
		assert_eq!(state.last_result, Some(RunResult::Success));
		let schedule = state.schedule.unwrap();
		assert_eq!(schedule.history.len(), 1);
		assert_eq!(schedule.history[0].trigger.as_deref(), Some("timer"));
	}
}
