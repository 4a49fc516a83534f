//! Folding worker progress events into an index/config snapshot.
//!
//! The renderer emits progress at its own rhythm; persisting every event
//! would hammer the stores. The tracker keeps the in-memory snapshot
//! current on every event and owns the two wall-clock thresholds deciding
//! when the index and the config are actually written. Status changes
//! always flush.

use serde_json::Value;
use std::time::{Duration, Instant};
use tileforge_core::types::{ProgressSnapshot, ProgressStatus};

/// Fields of interest from the `start_generate` debug event.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StartInfo {
	pub expected_total: u64,
	pub output_dir: Option<String>,
	pub storage_name: Option<String>,
	pub project_extent: Option<[f64; 4]>,
	pub project_crs: Option<String>,
	pub tile_crs: Option<String>,
	pub scheme: Option<String>,
	pub xyz_mode: Option<String>,
}

impl StartInfo {
	pub fn from_body(body: &Value) -> StartInfo {
		let extent = body.get("project_extent").and_then(|v| {
			let values: Vec<f64> = v.as_array()?.iter().filter_map(Value::as_f64).collect();
			<[f64; 4]>::try_from(values).ok()
		});
		StartInfo {
			expected_total: body.get("expected_total").and_then(Value::as_u64).unwrap_or(0),
			output_dir: body.get("output_dir").and_then(Value::as_str).map(str::to_string),
			storage_name: body.get("storage_name").and_then(Value::as_str).map(str::to_string),
			project_extent: extent,
			project_crs: body.get("project_crs").and_then(Value::as_str).map(str::to_string),
			tile_crs: body.get("tile_crs").and_then(Value::as_str).map(str::to_string),
			scheme: body.get("scheme").and_then(Value::as_str).map(str::to_string),
			xyz_mode: body.get("xyz_mode").and_then(Value::as_str).map(str::to_string),
		}
	}
}

/// Which stores are due for a write after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushNeed {
	pub index: bool,
	pub config: bool,
}

impl FlushNeed {
	pub const BOTH: FlushNeed = FlushNeed { index: true, config: true };

	pub fn any(&self) -> bool {
		self.index || self.config
	}
}

pub struct ProgressTracker {
	snapshot: ProgressSnapshot,
	index_interval: Duration,
	config_interval: Duration,
	last_index_flush: Option<Instant>,
	last_config_flush: Option<Instant>,
}

impl ProgressTracker {
	pub fn new(index_interval: Duration, config_interval: Duration) -> ProgressTracker {
		ProgressTracker {
			snapshot: ProgressSnapshot::starting(0),
			index_interval,
			config_interval,
			last_index_flush: None,
			last_config_flush: None,
		}
	}

	pub fn snapshot(&self) -> &ProgressSnapshot {
		&self.snapshot
	}

	/// `start_generate`: initialize the snapshot. Always flushes both
	/// stores (the "first flush").
	pub fn apply_start(&mut self, info: &StartInfo) -> FlushNeed {
		self.snapshot = ProgressSnapshot::starting(info.expected_total);
		self.mark_flushed(FlushNeed::BOTH);
		FlushNeed::BOTH
	}

	/// Fold one progress event.
	///
	/// `total_generated` is kept monotonic; percent is recomputed from the
	/// totals when the event carries none and never moves backwards.
	pub fn apply_progress(
		&mut self,
		total_generated: Option<u64>,
		expected_total: Option<u64>,
		percent: Option<f64>,
		status: Option<&str>,
	) -> FlushNeed {
		if let Some(total) = total_generated {
			self.snapshot.total_generated = self.snapshot.total_generated.max(total);
		}
		if let Some(expected) = expected_total {
			self.snapshot.expected_total = expected;
		}
		let computed = percent.or_else(|| {
			(self.snapshot.expected_total > 0)
				.then(|| 100.0 * self.snapshot.total_generated as f64 / self.snapshot.expected_total as f64)
		});
		if let Some(percent) = computed {
			let clamped = percent.clamp(0.0, 100.0);
			if clamped > self.snapshot.percent {
				self.snapshot.percent = clamped;
			}
		}

		let mut status_changed = false;
		if let Some(status) = status.and_then(ProgressStatus::parse) {
			status_changed = status != self.snapshot.status;
			self.snapshot.status = status;
		}
		self.snapshot.updated_at = chrono::Utc::now();

		let need = if status_changed {
			FlushNeed::BOTH
		} else {
			FlushNeed {
				index: self.interval_elapsed(self.last_index_flush, self.index_interval),
				config: self.interval_elapsed(self.last_config_flush, self.config_interval),
			}
		};
		self.mark_flushed(need);
		need
	}

	/// Terminal status: force the final snapshot and flush everything.
	pub fn apply_terminal(&mut self, status: ProgressStatus, message: Option<String>) -> FlushNeed {
		self.snapshot.status = status;
		self.snapshot.message = message;
		if status == ProgressStatus::Completed {
			self.snapshot.percent = 100.0;
		}
		self.snapshot.updated_at = chrono::Utc::now();
		self.mark_flushed(FlushNeed::BOTH);
		FlushNeed::BOTH
	}

	fn interval_elapsed(&self, last: Option<Instant>, interval: Duration) -> bool {
		last.is_none_or(|at| at.elapsed() >= interval)
	}

	fn mark_flushed(&mut self, need: FlushNeed) {
		let now = Instant::now();
		if need.index {
			self.last_index_flush = Some(now);
		}
		if need.config {
			self.last_config_flush = Some(now);
		}
	}
}

/// Append to a bounded tail buffer, trimming oldest bytes past `cap`.
pub fn push_tail(tail: &mut String, line: &str, cap: usize) {
	tail.push_str(line);
	tail.push('\n');
	if tail.len() > cap {
		let cut = tail.len() - cap;
		// cut on a char boundary at or after the overflow point
		let cut = (cut..tail.len()).find(|i| tail.is_char_boundary(*i)).unwrap_or(0);
		tail.drain(..cut);
	}
}

/// The last `n` lines of a tail buffer, joined with newlines.
pub fn last_lines(tail: &str, n: usize) -> String {
	let lines: Vec<&str> = tail.lines().rev().take(n).collect();
	lines.into_iter().rev().collect::<Vec<_>>().join("\n")
}
