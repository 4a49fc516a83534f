//! The per-job subprocess driver.
//!
//! Spawns the renderer, streams its stdout/stderr, folds progress events
//! through the tracker, and performs the final index/config flush when the
//! process closes. The index entry follows the coverage-widening rule:
//! `zoomMin = min(prev, run)`, `zoomMax = max(prev, run)`.

use super::{
	BatchJobManager, FlushNeed, JOB_TAIL_CAP, JobParams, JobRecord, JobStatus, ProgressTracker, StartInfo, last_lines,
	push_tail,
};
use crate::{RecachePlan, WorkerEvent, parse_stdout_line, terminate::command_in_own_group, terminate::terminate_tree};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use tileforge_core::types::{IndexEntry, ProgressSnapshot, ProgressStatus, record_run_result};
use tokio::{
	io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
	process::Command,
	sync::Notify,
};

pub(crate) async fn run_job(
	manager: Arc<BatchJobManager>,
	params: JobParams,
	plan: RecachePlan,
	record: Arc<Mutex<JobRecord>>,
	abort: Arc<Notify>,
) {
	let key = params.key();
	let job_id = record.lock().id.clone();

	let output_dir = manager.paths.target_dir(&params.project, params.kind, &params.name);
	let index_path = manager.paths.index_path(&params.project);
	let job = params.to_worker_job(&plan, &output_dir, &index_path);

	let mut command = Command::new(&manager.renderer[0]);
	command
		.args(&manager.renderer[1..])
		.stdin(std::process::Stdio::piped())
		.stdout(std::process::Stdio::piped())
		.stderr(std::process::Stdio::piped())
		.kill_on_drop(true);
	command_in_own_group(&mut command);

	let mut child = match command.spawn() {
		Ok(child) => child,
		Err(err) => {
			log::error!("job {job_id}: spawning renderer failed: {err}");
			finalize(
				&manager,
				&params,
				&record,
				JobStatus::Error,
				None,
				None,
				Some(format!("spawn_error: {err}")),
			);
			manager.release(&job_id, &key);
			manager.schedule_eviction(job_id);
			return;
		}
	};

	// keep the handle alive for the whole run: renderers treat EOF on
	// stdin as a shutdown request
	let mut stdin = child.stdin.take();
	if let Some(pipe) = stdin.as_mut() {
		if let Err(err) = pipe.write_all(job.to_line().as_bytes()).await {
			log::warn!("job {job_id}: writing job to renderer failed: {err}");
		}
		let _ = pipe.flush().await;
	}

	let mut stdout = child
		.stdout
		.take()
		.map(|out| BufReader::new(out).lines())
		.expect("stdout piped");
	let mut stderr = child
		.stderr
		.take()
		.map(|err| BufReader::new(err).lines())
		.expect("stderr piped");

	let mut tracker = ProgressTracker::new(
		manager.settings.index_flush_interval,
		manager.settings.progress_config_interval,
	);
	let mut start_info: Option<StartInfo> = None;
	let mut terminal_status: Option<String> = None;
	let mut aborted = false;
	let mut stdout_open = true;
	let mut stderr_open = true;

	while stdout_open || stderr_open {
		tokio::select! {
			_ = abort.notified() => {
				aborted = true;
				log::info!("job {job_id}: aborting renderer process");
				terminate_tree(&mut child, manager.settings.abort_grace).await;
				break;
			}
			line = stdout.next_line(), if stdout_open => match line {
				Ok(Some(text)) => {
					push_tail(&mut record.lock().stdout_tail, &text, JOB_TAIL_CAP);
					handle_stdout_line(&manager, &params, &record, &mut tracker, &mut start_info, &mut terminal_status, &text);
				}
				_ => stdout_open = false,
			},
			line = stderr.next_line(), if stderr_open => match line {
				Ok(Some(text)) => {
					log::debug!("job {job_id} stderr: {text}");
					push_tail(&mut record.lock().stderr_tail, &text, JOB_TAIL_CAP);
				}
				_ => stderr_open = false,
			},
		}
	}

	let exit_code = match child.wait().await {
		Ok(status) => status.code(),
		Err(err) => {
			log::warn!("job {job_id}: wait failed: {err}");
			None
		}
	};

	let status = if aborted || terminal_status.as_deref() == Some("aborted") {
		JobStatus::Aborted
	} else if exit_code == Some(0) {
		JobStatus::Completed
	} else {
		JobStatus::Error
	};

	let failure_message = match status {
		JobStatus::Error => {
			let tail = last_lines(&record.lock().stderr_tail, 5);
			Some(if tail.is_empty() {
				format!("renderer exited with code {exit_code:?}")
			} else {
				tail
			})
		}
		JobStatus::Aborted => Some("aborted".to_string()),
		_ => None,
	};

	let final_progress_status = match status {
		JobStatus::Completed => ProgressStatus::Completed,
		JobStatus::Aborted => ProgressStatus::Aborted,
		_ => ProgressStatus::Error,
	};
	tracker.apply_terminal(final_progress_status, failure_message.clone());
	let snapshot = tracker.snapshot().clone();

	finalize(
		&manager,
		&params,
		&record,
		status,
		Some(snapshot),
		exit_code,
		failure_message,
	);
	drop(stdin);

	log::info!("job {job_id} for {key} finished: {status:?} (exit {exit_code:?})");
	manager.release(&job_id, &key);
	manager.schedule_eviction(job_id);
}

fn handle_stdout_line(
	manager: &Arc<BatchJobManager>,
	params: &JobParams,
	record: &Arc<Mutex<JobRecord>>,
	tracker: &mut ProgressTracker,
	start_info: &mut Option<StartInfo>,
	terminal_status: &mut Option<String>,
	text: &str,
) {
	match parse_stdout_line(text) {
		WorkerEvent::Debug { name, body } if name == "start_generate" => {
			let info = StartInfo::from_body(&body);
			tracker.apply_start(&info);
			let snapshot = tracker.snapshot().clone();
			record.lock().progress = Some(snapshot.clone());
			flush_index(manager, params, Some(&info), &snapshot, false);
			flush_config(manager, params, &snapshot);
			*start_info = Some(info);
		}
		WorkerEvent::Debug { name, .. } => {
			log::debug!("job {}: renderer debug event '{name}'", record.lock().id);
		}
		WorkerEvent::Progress {
			total_generated,
			expected_total,
			percent,
			status,
			..
		} => {
			let need = tracker.apply_progress(total_generated, expected_total, percent, status.as_deref());
			let snapshot = tracker.snapshot().clone();
			record.lock().progress = Some(snapshot.clone());
			apply_flushes(manager, params, start_info.as_ref(), &snapshot, need);
		}
		WorkerEvent::Terminal(reply) => {
			*terminal_status = Some(reply.status.clone());
			let need = FlushNeed::BOTH;
			let status = ProgressStatus::parse(&reply.status).unwrap_or(ProgressStatus::Running);
			if status.is_terminal() {
				tracker.apply_terminal(status, reply.message().map(str::to_string));
			}
			let snapshot = tracker.snapshot().clone();
			record.lock().progress = Some(snapshot.clone());
			apply_flushes(manager, params, start_info.as_ref(), &snapshot, need);
		}
		WorkerEvent::Noise(noise) => {
			log::debug!("job {}: ignoring stdout line: {noise}", record.lock().id);
		}
	}
}

fn apply_flushes(
	manager: &Arc<BatchJobManager>,
	params: &JobParams,
	start_info: Option<&StartInfo>,
	snapshot: &ProgressSnapshot,
	need: FlushNeed,
) {
	if need.index {
		flush_index(manager, params, start_info, snapshot, false);
	}
	if need.config {
		flush_config(manager, params, snapshot);
	}
}

/// Upsert the index entry with the current snapshot. With `terminal` the
/// coverage-widening and `partial` rules are applied.
fn flush_index(
	manager: &Arc<BatchJobManager>,
	params: &JobParams,
	start_info: Option<&StartInfo>,
	snapshot: &ProgressSnapshot,
	terminal: bool,
) {
	let result = manager.index_store.upsert(&params.project, params.kind, &params.name, |existing| {
		let mut entry = existing.unwrap_or_else(|| new_entry(manager, params, start_info));
		entry.progress = Some(snapshot.clone());
		entry.scheme = params.scheme;
		entry.tile_crs = params.tile_crs.clone();
		if let Some(info) = start_info {
			if let Some(extent) = info.project_extent {
				entry.extent = Some(extent);
			}
			if let Some(crs) = &info.project_crs {
				entry.layer_crs = Some(crs.clone());
			}
		}
		if params.tile_matrix_preset.is_some() {
			entry.tile_matrix_preset = params.tile_matrix_preset.clone();
			if entry.tile_matrix_set.is_none() {
				entry.tile_matrix_set = params
					.tile_matrix_preset
					.as_deref()
					.and_then(|id| manager.grids.get(id))
					.map(|preset| preset.to_matrix_set());
			}
		}
		if terminal {
			if snapshot.status == ProgressStatus::Completed {
				// coverage widens, never shrinks
				if entry.bootstrap {
					entry.zoom_min = params.zoom.min;
					entry.zoom_max = params.zoom.max;
				} else {
					entry.zoom_min = entry.zoom_min.min(params.zoom.min);
					entry.zoom_max = entry.zoom_max.max(params.zoom.max);
				}
				entry.last_zoom_min = Some(params.zoom.min);
				entry.last_zoom_max = Some(params.zoom.max);
				entry.partial = false;
				entry.generated = Some(Utc::now());
				entry.bootstrap = false;
			} else {
				entry.partial = true;
			}
		} else {
			entry.partial = true;
		}
		Some(entry)
	});
	if let Err(err) = result {
		log::warn!("index flush for {}:{} failed: {err:#}", params.project, params.name);
	}
}

fn flush_config(manager: &Arc<BatchJobManager>, params: &JobParams, snapshot: &ProgressSnapshot) {
	let result = manager.config_store.mutate(&params.project, |config| {
		let state = config.target_state_mut(params.kind, &params.name);
		state.progress = Some(snapshot.clone());
	});
	if let Err(err) = result {
		log::warn!("config flush for {}:{} failed: {err:#}", params.project, params.name);
	}
}

fn new_entry(manager: &Arc<BatchJobManager>, params: &JobParams, start_info: Option<&StartInfo>) -> IndexEntry {
	IndexEntry {
		name: params.name.clone(),
		kind: params.kind,
		scheme: params.scheme,
		tile_crs: params.tile_crs.clone(),
		layer_crs: start_info.and_then(|i| i.project_crs.clone()),
		zoom_min: params.zoom.min,
		zoom_max: params.zoom.max,
		last_zoom_min: None,
		last_zoom_max: None,
		tile_format: tileforge_core::types::TileFormat::Png,
		path: manager.paths.target_dir(&params.project, params.kind, &params.name),
		tile_matrix_preset: params.tile_matrix_preset.clone(),
		tile_matrix_set: params
			.tile_matrix_preset
			.as_deref()
			.and_then(|id| manager.grids.get(id))
			.map(|preset| preset.to_matrix_set()),
		extent: start_info.and_then(|i| i.project_extent).or(params.project_extent),
		extent_wgs84: None,
		progress: None,
		partial: true,
		bootstrap: false,
		generated: None,
		updated: None,
		last_request_at: None,
	}
}

/// Final bookkeeping shared by the success, failure, and spawn-error paths.
fn finalize(
	manager: &Arc<BatchJobManager>,
	params: &JobParams,
	record: &Arc<Mutex<JobRecord>>,
	status: JobStatus,
	snapshot: Option<ProgressSnapshot>,
	exit_code: Option<i32>,
	message: Option<String>,
) {
	let job_id = record.lock().id.clone();

	if let Some(snapshot) = &snapshot {
		flush_index(manager, params, None, snapshot, true);
	}

	let result = manager.config_store.mutate(&params.project, |config| {
		let state = config.target_state_mut(params.kind, &params.name);
		if let Some(snapshot) = &snapshot {
			state.progress = Some(snapshot.clone());
		}
		state.last_params = Some(serde_json::json!({
			"zoomMin": params.zoom.min,
			"zoomMax": params.zoom.max,
			"scheme": params.scheme.as_str(),
			"tileCrs": params.tile_crs,
			"tileMatrixPreset": params.tile_matrix_preset,
			"incremental": params.incremental,
		}));
		let run_result = match status {
			JobStatus::Completed => tileforge_core::types::RunResult::Success,
			JobStatus::Aborted => tileforge_core::types::RunResult::Aborted,
			_ => tileforge_core::types::RunResult::Error,
		};
		let trigger = match params.trigger {
			super::Trigger::Manual => "manual",
			super::Trigger::Timer => "timer",
		};
		record_run_result(
			state,
			run_result,
			message.clone(),
			Some(job_id.clone()),
			Some(trigger.to_string()),
		);
	});
	if let Err(err) = result {
		log::warn!("final config update for {}:{} failed: {err:#}", params.project, params.name);
	}

	// the record turns terminal only after both stores are flushed, so a
	// waiter that observes the terminal status sees the final state
	let mut locked = record.lock();
	locked.status = status;
	locked.ended_at = Some(Utc::now());
	locked.exit_code = exit_code;
	if let Some(snapshot) = snapshot {
		locked.progress = Some(snapshot);
	}
}
