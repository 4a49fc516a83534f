use crate::types::{
	MonthlySpec, ProjectConfig, RecacheSettings, RecacheStrategy, Schedule, ScheduleMode, WeeklySpec, YearlySpec,
	parse_time_of_day,
};
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};

/// How many months ahead a monthly schedule is searched.
const MONTHLY_HORIZON: u32 = 14;

/// How many years ahead a yearly schedule is searched.
const YEARLY_HORIZON: i32 = 3;

/// Compute the next run for a per-target schedule.
///
/// The anchor is `max(now, last_run_at) + min_lead`, so a run that just
/// finished can never re-trigger its own slot. Returns `None` when the
/// schedule is disabled or no valid occurrence exists within the horizon.
pub fn next_schedule_run<Tz: TimeZone>(
	schedule: &Schedule,
	now: DateTime<Tz>,
	min_lead: std::time::Duration,
) -> Option<DateTime<Tz>> {
	if !schedule.enabled {
		return None;
	}
	let anchor = anchor_time(now, schedule.last_run_at, min_lead)?;
	match schedule.mode {
		ScheduleMode::Weekly => next_weekly(schedule.weekly.as_ref()?, &anchor),
		ScheduleMode::Monthly => next_monthly(schedule.monthly.as_ref()?, &anchor),
		ScheduleMode::Yearly => next_yearly(schedule.yearly.as_ref()?, &anchor),
	}
}

/// Compute the next run for the legacy project-scope recache record.
pub fn next_legacy_run<Tz: TimeZone>(
	recache: &RecacheSettings,
	now: DateTime<Tz>,
	min_lead: std::time::Duration,
) -> Option<DateTime<Tz>> {
	if !recache.enabled {
		return None;
	}
	let anchor = anchor_time(now, recache.last_run_at, min_lead)?;
	match recache.strategy {
		RecacheStrategy::Interval => {
			let minutes = recache.interval_minutes?;
			if minutes == 0 {
				return None;
			}
			let base = recache
				.last_run_at
				.map_or_else(|| anchor.clone(), |t| t.with_timezone(&anchor.timezone()));
			let next = base + Duration::minutes(minutes as i64);
			Some(if next < anchor { anchor } else { next })
		}
		RecacheStrategy::Times => recache
			.times_of_day
			.iter()
			.filter_map(|time| next_daily(time, &anchor))
			.min(),
	}
}

/// Recompute and store `next_run_at` on every schedule in a config.
/// Disabled schedules get `None`. Called by the config store on each write.
pub fn recompute_next_runs<Tz: TimeZone>(config: &mut ProjectConfig, now: DateTime<Tz>, min_lead: std::time::Duration) {
	for state in config.layers.values_mut().chain(config.themes.values_mut()) {
		if let Some(schedule) = &mut state.schedule {
			schedule.next_run_at = next_schedule_run(schedule, now.clone(), min_lead).map(|t| t.with_timezone(&Utc));
		}
	}
	config.recache.next_run_at = next_legacy_run(&config.recache, now, min_lead).map(|t| t.with_timezone(&Utc));
}

fn anchor_time<Tz: TimeZone>(
	now: DateTime<Tz>,
	last_run_at: Option<DateTime<Utc>>,
	min_lead: std::time::Duration,
) -> Option<DateTime<Tz>> {
	let lead = Duration::from_std(min_lead).ok()?;
	let mut anchor = now.clone();
	if let Some(last) = last_run_at {
		let last = last.with_timezone(&now.timezone());
		if last > anchor {
			anchor = last;
		}
	}
	Some(anchor + lead)
}

fn next_weekly<Tz: TimeZone>(spec: &WeeklySpec, anchor: &DateTime<Tz>) -> Option<DateTime<Tz>> {
	let (hour, minute) = parse_time_of_day(&spec.time)?;
	let mut best: Option<DateTime<Tz>> = None;
	for offset in 0..=7 {
		let date = anchor.date_naive() + Duration::days(offset);
		if !spec.days.iter().any(|d| d.to_chrono() == date.weekday()) {
			continue;
		}
		if let Some(candidate) = local_datetime(&anchor.timezone(), date, hour, minute) {
			if candidate >= *anchor {
				best = Some(match best {
					Some(current) if current <= candidate => current,
					_ => candidate,
				});
			}
		}
	}
	best
}

fn next_monthly<Tz: TimeZone>(spec: &MonthlySpec, anchor: &DateTime<Tz>) -> Option<DateTime<Tz>> {
	let (hour, minute) = parse_time_of_day(&spec.time)?;
	let mut best: Option<DateTime<Tz>> = None;
	for offset in 0..MONTHLY_HORIZON {
		let months = anchor.month0() + offset;
		let year = anchor.year() + (months / 12) as i32;
		let month = months % 12 + 1;
		for &day in &spec.days {
			if day == 0 {
				continue;
			}
			// day 31 in a short month clamps to the month's last day
			let day = u32::from(day).min(days_in_month(year, month));
			let Some(date) = NaiveDate::from_ymd_opt(year, month, day) else {
				continue;
			};
			if let Some(candidate) = local_datetime(&anchor.timezone(), date, hour, minute) {
				if candidate >= *anchor && best.as_ref().is_none_or(|b| candidate < *b) {
					best = Some(candidate);
				}
			}
		}
	}
	best
}

fn next_yearly<Tz: TimeZone>(spec: &YearlySpec, anchor: &DateTime<Tz>) -> Option<DateTime<Tz>> {
	let mut best: Option<DateTime<Tz>> = None;
	for year_offset in 0..=YEARLY_HORIZON {
		let year = anchor.year() + year_offset;
		for occurrence in spec.occurrences.iter().take(crate::types::YEARLY_OCCURRENCE_LIMIT) {
			let (hour, minute) = match parse_time_of_day(&occurrence.time) {
				Some(t) => t,
				None => continue,
			};
			if !(1..=12).contains(&occurrence.month) || occurrence.day == 0 {
				continue;
			}
			let month = u32::from(occurrence.month);
			let day = u32::from(occurrence.day).min(days_in_month(year, month));
			let Some(date) = NaiveDate::from_ymd_opt(year, month, day) else {
				continue;
			};
			if let Some(candidate) = local_datetime(&anchor.timezone(), date, hour, minute) {
				if candidate >= *anchor && best.as_ref().is_none_or(|b| candidate < *b) {
					best = Some(candidate);
				}
			}
		}
	}
	best
}

fn next_daily<Tz: TimeZone>(time: &str, anchor: &DateTime<Tz>) -> Option<DateTime<Tz>> {
	let (hour, minute) = parse_time_of_day(time)?;
	for offset in 0..=1 {
		let date = anchor.date_naive() + Duration::days(offset);
		if let Some(candidate) = local_datetime(&anchor.timezone(), date, hour, minute) {
			if candidate >= *anchor {
				return Some(candidate);
			}
		}
	}
	None
}

fn local_datetime<Tz: TimeZone>(tz: &Tz, date: NaiveDate, hour: u32, minute: u32) -> Option<DateTime<Tz>> {
	let naive = date.and_hms_opt(hour, minute, 0)?;
	// DST gaps: take the earliest valid interpretation
	tz.from_local_datetime(&naive).earliest()
}

fn days_in_month(year: i32, month: u32) -> u32 {
	let next = if month == 12 {
		NaiveDate::from_ymd_opt(year + 1, 1, 1)
	} else {
		NaiveDate::from_ymd_opt(year, month + 1, 1)
	};
	next.and_then(|d| d.pred_opt()).map_or(28, |d| d.day())
}
