//! Per-layer/theme recache schedules: weekly, monthly, or yearly slots.
//!
//! The model here is pure data; next-run computation lives in
//! [`crate::schedule`].

use super::RunResult;
use chrono::{DateTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// Maximum entries kept in any history array.
pub const HISTORY_LIMIT: usize = 25;

/// Maximum occurrences a yearly schedule may carry.
pub const YEARLY_OCCURRENCE_LIMIT: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
	#[serde(default)]
	pub enabled: bool,
	pub mode: ScheduleMode,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub weekly: Option<WeeklySpec>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub monthly: Option<MonthlySpec>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub yearly: Option<YearlySpec>,
	/// Cached; recomputed on every config write.
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
	/// Optional zoom override; absent means use the coverage range
	/// (and purge the cache before the run).
	#[serde(skip_serializing_if = "Option::is_none")]
	pub zoom_min: Option<u8>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub zoom_max: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleMode {
	Weekly,
	Monthly,
	Yearly,
}

/// Days of the week as written in schedule specs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DayOfWeek {
	Mon,
	Tue,
	Wed,
	Thu,
	Fri,
	Sat,
	Sun,
}

impl DayOfWeek {
	pub fn to_chrono(self) -> Weekday {
		match self {
			DayOfWeek::Mon => Weekday::Mon,
			DayOfWeek::Tue => Weekday::Tue,
			DayOfWeek::Wed => Weekday::Wed,
			DayOfWeek::Thu => Weekday::Thu,
			DayOfWeek::Fri => Weekday::Fri,
			DayOfWeek::Sat => Weekday::Sat,
			DayOfWeek::Sun => Weekday::Sun,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WeeklySpec {
	pub days: Vec<DayOfWeek>,
	/// Local wall-clock time, `"HH:MM"`.
	pub time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonthlySpec {
	/// Days of month, 1–31. A day past the month's length clamps to its
	/// last day.
	pub days: Vec<u8>,
	pub time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct YearlySpec {
	pub occurrences: Vec<YearlyOccurrence>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct YearlyOccurrence {
	pub month: u8,
	pub day: u8,
	pub time: String,
}

/// One line of run history, shared by schedules, the legacy project-level
/// recache record, and project-cache runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
	pub at: DateTime<Utc>,
	pub status: RunResult,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub message: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub job_id: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub trigger: Option<String>,
}

/// Append and trim to [`HISTORY_LIMIT`].
pub fn push_history(history: &mut Vec<HistoryEntry>, entry: HistoryEntry) {
	history.push(entry);
	if history.len() > HISTORY_LIMIT {
		let excess = history.len() - HISTORY_LIMIT;
		history.drain(..excess);
	}
}

/// Parse `"HH:MM"` into `(hour, minute)`.
pub fn parse_time_of_day(time: &str) -> Option<(u32, u32)> {
	let (h, m) = time.split_once(':')?;
	let hour: u32 = h.parse().ok()?;
	let minute: u32 = m.parse().ok()?;
	if hour < 24 && minute < 60 { Some((hour, minute)) } else { None }
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn history_never_exceeds_the_limit() {
		let mut history = Vec::new();
		for i in 0..40 {
			push_history(
				&mut history,
				HistoryEntry {
					at: Utc::now(),
					status: RunResult::Success,
					message: Some(format!("run {i}")),
					job_id: None,
					trigger: None,
				},
			);
		}
		assert_eq!(history.len(), HISTORY_LIMIT);
		// oldest entries were dropped
		assert_eq!(history[0].message.as_deref(), Some("run 15"));
	}

	#[test]
	fn time_of_day_parses_and_validates() {
		assert_eq!(parse_time_of_day("10:00"), Some((10, 0)));
		assert_eq!(parse_time_of_day("23:59"), Some((23, 59)));
		assert_eq!(parse_time_of_day("24:00"), None);
		assert_eq!(parse_time_of_day("10"), None);
	}

	#[test]
	fn days_serialize_lowercase() {
		assert_eq!(serde_json::to_string(&DayOfWeek::Mon).unwrap(), "\"mon\"");
		assert_eq!(serde_json::from_str::<DayOfWeek>("\"sun\"").unwrap(), DayOfWeek::Sun);
	}
}
