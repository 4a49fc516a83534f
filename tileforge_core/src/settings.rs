//! Runtime limits and intervals, read once from the environment.
//!
//! Every tunable has a hard-coded default; the environment only overrides.
//! Values are parsed leniently: an unparsable value logs a warning and keeps
//! the default, so a typo in deployment never prevents startup.

use std::time::Duration;

/// All environment-tunable limits and intervals in one place.
///
/// Construct with [`Settings::from_env`] at startup and share behind an `Arc`.
#[derive(Debug, Clone)]
pub struct Settings {
	/// Maximum concurrent batch jobs per process (`JOB_MAX`).
	pub job_max: usize,
	/// How long finished jobs stay queryable (`JOB_TTL_MS`).
	pub job_ttl: Duration,
	/// Grace between kill and process-tree escalation (`ABORT_GRACE_MS`).
	pub abort_grace: Duration,
	/// How long finished project runs stay queryable (`PROJECT_BATCH_TTL_MS`).
	pub project_batch_ttl: Duration,
	/// Scheduler heartbeat period (`SCHEDULE_HEARTBEAT_INTERVAL_MS`).
	pub schedule_heartbeat_interval: Duration,
	/// Overdue threshold before the heartbeat force-fires (`SCHEDULE_OVERDUE_GRACE_MS`).
	pub schedule_overdue_grace: Duration,
	/// Minimum lead time for a freshly computed run (`SCHEDULE_MIN_LEAD_MS`).
	pub schedule_min_lead: Duration,
	/// Window in which timer targets count as due (`SCHEDULE_DUE_TOLERANCE_MS`).
	pub schedule_due_tolerance: Duration,
	/// Minimum spacing of progress flushes to the config (`PROGRESS_CONFIG_INTERVAL_MS`).
	pub progress_config_interval: Duration,
	/// Minimum spacing of progress flushes to the index (`INDEX_FLUSH_INTERVAL_MS`).
	pub index_flush_interval: Duration,
	/// Per-tile render timeout passed to the worker (`RENDER_TIMEOUT_MS`).
	pub render_timeout: Duration,
	/// Per-tile retry count passed to the worker (`RENDER_TILE_RETRIES`).
	pub render_tile_retries: u32,
	/// Maximum concurrent on-demand renders (`MAX_RENDER_PROCS`).
	pub max_render_procs: usize,
	/// How long an on-demand waiter polls before giving up.
	pub tile_wait_timeout: Duration,
	/// Upper bound for a single armed timer; longer delays re-arm on fire.
	pub max_timer_delay: Duration,
	/// Zoom floor of bootstrap/on-demand placeholder entries
	/// (`PROJECT_BOOTSTRAP_ZOOM_MIN`).
	pub project_bootstrap_zoom_min: u8,
	/// Zoom ceiling of bootstrap/on-demand placeholder entries
	/// (`PROJECT_BOOTSTRAP_ZOOM_MAX`).
	pub project_bootstrap_zoom_max: u8,
	/// Advertised zoom floor when a job carries none (`WMTS_DEFAULT_PUBLISH_ZOOM_MIN`).
	pub wmts_default_publish_zoom_min: u8,
	/// Advertised zoom ceiling when a job carries none (`WMTS_DEFAULT_PUBLISH_ZOOM_MAX`).
	pub wmts_default_publish_zoom_max: u8,
	/// Hard cap on WFS feature counts (`WFS_MAX_FEATURES_LIMIT`).
	pub wfs_max_features_limit: u64,
	/// Default WFS feature count when the request has none (`WFS_DEFAULT_MAX_FEATURES`).
	pub wfs_default_max_features: u64,
	/// `CountDefault` advertised in WFS capabilities (`WFS_CAPABILITIES_COUNT_DEFAULT`).
	pub wfs_capabilities_count_default: u64,
	/// Maximum entries accepted in an uploaded archive (`ZIP_UPLOAD_MAX_ENTRIES`).
	pub zip_upload_max_entries: usize,
	/// Total decompressed budget for an archive (`ZIP_EXTRACT_MAX_BYTES`).
	pub zip_extract_max_bytes: u64,
	/// Decompressed budget for a single archive entry (`ZIP_EXTRACT_MAX_ENTRY_BYTES`).
	pub zip_extract_max_entry_bytes: u64,
}

impl Default for Settings {
	fn default() -> Self {
		Settings {
			job_max: 4,
			job_ttl: Duration::from_secs(5 * 60),
			abort_grace: Duration::from_secs(1),
			project_batch_ttl: Duration::from_secs(15 * 60),
			schedule_heartbeat_interval: Duration::from_secs(60),
			schedule_overdue_grace: Duration::from_secs(5),
			schedule_min_lead: Duration::from_secs(5),
			schedule_due_tolerance: Duration::from_secs(60),
			progress_config_interval: Duration::from_secs(180),
			index_flush_interval: Duration::from_secs(180),
			render_timeout: Duration::from_secs(60),
			render_tile_retries: 2,
			max_render_procs: 8,
			tile_wait_timeout: Duration::from_secs(150),
			// i32::MAX milliseconds, the classic timer ceiling (~24.8 days)
			max_timer_delay: Duration::from_millis(i32::MAX as u64),
			project_bootstrap_zoom_min: 0,
			project_bootstrap_zoom_max: 22,
			wmts_default_publish_zoom_min: 0,
			wmts_default_publish_zoom_max: 22,
			wfs_max_features_limit: 10_000,
			wfs_default_max_features: 1_000,
			wfs_capabilities_count_default: 1_000,
			zip_upload_max_entries: 1_000,
			zip_extract_max_bytes: 2 * 1024 * 1024 * 1024,
			zip_extract_max_entry_bytes: 512 * 1024 * 1024,
		}
	}
}

impl Settings {
	/// Read all tunables from the environment, falling back to defaults.
	pub fn from_env() -> Settings {
		let d = Settings::default();
		Settings {
			job_max: env_parse("JOB_MAX", d.job_max),
			job_ttl: env_ms("JOB_TTL_MS", d.job_ttl),
			abort_grace: env_ms("ABORT_GRACE_MS", d.abort_grace),
			project_batch_ttl: env_ms("PROJECT_BATCH_TTL_MS", d.project_batch_ttl),
			schedule_heartbeat_interval: env_ms("SCHEDULE_HEARTBEAT_INTERVAL_MS", d.schedule_heartbeat_interval),
			schedule_overdue_grace: env_ms("SCHEDULE_OVERDUE_GRACE_MS", d.schedule_overdue_grace),
			schedule_min_lead: env_ms("SCHEDULE_MIN_LEAD_MS", d.schedule_min_lead),
			schedule_due_tolerance: env_ms("SCHEDULE_DUE_TOLERANCE_MS", d.schedule_due_tolerance),
			progress_config_interval: env_ms("PROGRESS_CONFIG_INTERVAL_MS", d.progress_config_interval),
			index_flush_interval: env_ms("INDEX_FLUSH_INTERVAL_MS", d.index_flush_interval),
			render_timeout: env_ms("RENDER_TIMEOUT_MS", d.render_timeout),
			render_tile_retries: env_parse("RENDER_TILE_RETRIES", d.render_tile_retries),
			max_render_procs: env_parse("MAX_RENDER_PROCS", d.max_render_procs),
			tile_wait_timeout: d.tile_wait_timeout,
			max_timer_delay: d.max_timer_delay,
			project_bootstrap_zoom_min: env_parse("PROJECT_BOOTSTRAP_ZOOM_MIN", d.project_bootstrap_zoom_min),
			project_bootstrap_zoom_max: env_parse("PROJECT_BOOTSTRAP_ZOOM_MAX", d.project_bootstrap_zoom_max),
			wmts_default_publish_zoom_min: env_parse("WMTS_DEFAULT_PUBLISH_ZOOM_MIN", d.wmts_default_publish_zoom_min),
			wmts_default_publish_zoom_max: env_parse("WMTS_DEFAULT_PUBLISH_ZOOM_MAX", d.wmts_default_publish_zoom_max),
			wfs_max_features_limit: env_parse("WFS_MAX_FEATURES_LIMIT", d.wfs_max_features_limit),
			wfs_default_max_features: env_parse("WFS_DEFAULT_MAX_FEATURES", d.wfs_default_max_features),
			wfs_capabilities_count_default: env_parse("WFS_CAPABILITIES_COUNT_DEFAULT", d.wfs_capabilities_count_default),
			zip_upload_max_entries: env_parse("ZIP_UPLOAD_MAX_ENTRIES", d.zip_upload_max_entries),
			zip_extract_max_bytes: env_parse("ZIP_EXTRACT_MAX_BYTES", d.zip_extract_max_bytes),
			zip_extract_max_entry_bytes: env_parse("ZIP_EXTRACT_MAX_ENTRY_BYTES", d.zip_extract_max_entry_bytes),
		}
	}
}

fn env_parse<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
	match std::env::var(name) {
		Ok(value) => value.parse().unwrap_or_else(|_| {
			log::warn!("ignoring unparsable {name}={value:?}");
			default
		}),
		Err(_) => default,
	}
}

fn env_ms(name: &str, default: Duration) -> Duration {
	Duration::from_millis(env_parse(name, default.as_millis() as u64))
}
