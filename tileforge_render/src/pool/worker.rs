//! The per-worker actor: owns one subprocess, serves one job at a time.

use super::{PendingJob, PoolShared};
use crate::{WorkerEvent, parse_stdout_line, terminate::command_in_own_group, terminate::terminate_tree};
use std::sync::{
	Arc,
	atomic::{AtomicBool, Ordering},
};
use tileforge_core::ApiError;
use tokio::{
	io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
	process::{Child, ChildStdin, ChildStdout, Command},
	sync::mpsc,
};

/// Consecutive unparsable stdout lines tolerated inside one job before the
/// worker is declared broken and killed to force a restart.
const MAX_NOISE_LINES: usize = 200;

enum ServeOutcome {
	/// Terminal result delivered; the child is still good.
	Done,
	/// Protocol failure or crash; kill and respawn.
	Fatal,
	/// Killed via abort; respawn.
	Killed,
}

pub(crate) async fn worker_loop(
	shared: Arc<PoolShared>,
	id: usize,
	busy: Arc<AtomicBool>,
	mut kill_rx: mpsc::UnboundedReceiver<()>,
) {
	let mut first_spawn = true;
	'respawn: loop {
		if shared.is_closed() {
			return;
		}
		if !first_spawn {
			tokio::time::sleep(shared.config().restart_backoff).await;
		}
		first_spawn = false;

		let mut child = match spawn_child(&shared) {
			Ok(child) => child,
			Err(err) => {
				log::error!("worker {id}: spawn failed: {err}");
				continue 'respawn;
			}
		};
		let Some(mut stdin) = child.stdin.take() else {
			log::error!("worker {id}: no stdin pipe");
			continue 'respawn;
		};
		let Some(stdout) = child.stdout.take() else {
			log::error!("worker {id}: no stdout pipe");
			continue 'respawn;
		};
		let mut lines = BufReader::new(stdout).lines();
		if let Some(stderr) = child.stderr.take() {
			drain_stderr(id, stderr);
		}
		log::debug!("worker {id}: subprocess ready (pid {:?})", child.id());

		loop {
			// idle: wait for work, a kill, or pool close
			let pending = tokio::select! {
				job = shared.next_job() => match job {
					Some(job) => job,
					None => {
						terminate_tree(&mut child, shared.config().abort_grace).await;
						return;
					}
				},
				_ = kill_rx.recv() => {
					terminate_tree(&mut child, shared.config().abort_grace).await;
					continue 'respawn;
				}
			};

			busy.store(true, Ordering::SeqCst);
			let outcome = serve_one(id, &mut stdin, &mut lines, &mut kill_rx, pending).await;
			busy.store(false, Ordering::SeqCst);

			match outcome {
				ServeOutcome::Done => {}
				ServeOutcome::Fatal => {
					terminate_tree(&mut child, shared.config().abort_grace).await;
					if shared.record_crash() {
						log::error!(
							"worker {id}: persistent failure, {} crashes within {:?}",
							shared.config().crash_threshold,
							shared.config().crash_window
						);
					}
					continue 'respawn;
				}
				ServeOutcome::Killed => {
					terminate_tree(&mut child, shared.config().abort_grace).await;
					continue 'respawn;
				}
			}
		}
	}
}

async fn serve_one(
	id: usize,
	stdin: &mut ChildStdin,
	lines: &mut Lines<BufReader<ChildStdout>>,
	kill_rx: &mut mpsc::UnboundedReceiver<()>,
	pending: PendingJob,
) -> ServeOutcome {
	let PendingJob { job, reply, observer } = pending;

	let line = job.to_line();
	if let Err(err) = stdin.write_all(line.as_bytes()).await {
		log::warn!("worker {id}: writing job failed: {err}");
		let _ = reply.send(Err(ApiError::WorkerCrashed(format!("stdin write failed: {err}"))));
		return ServeOutcome::Fatal;
	}
	if let Err(err) = stdin.flush().await {
		let _ = reply.send(Err(ApiError::WorkerCrashed(format!("stdin flush failed: {err}"))));
		return ServeOutcome::Fatal;
	}

	let mut noise_lines = 0usize;
	loop {
		tokio::select! {
			_ = kill_rx.recv() => {
				let _ = reply.send(Err(ApiError::Aborted));
				return ServeOutcome::Killed;
			}
			read = lines.next_line() => match read {
				Ok(Some(text)) => match parse_stdout_line(&text) {
					WorkerEvent::Terminal(result) => {
						let _ = reply.send(Ok(result));
						return ServeOutcome::Done;
					}
					WorkerEvent::Noise(noise) => {
						log::debug!("worker {id}: ignoring stdout line: {noise}");
						noise_lines += 1;
						if noise_lines > MAX_NOISE_LINES {
							let _ = reply.send(Err(ApiError::ProtocolError(format!(
								"{noise_lines} unparsable stdout lines without a result"
							))));
							return ServeOutcome::Fatal;
						}
					}
					event => {
						if let Some(observer) = &observer {
							let _ = observer.send(event);
						}
					}
				},
				Ok(None) => {
					// EOF before the terminal result
					let _ = reply.send(Err(ApiError::WorkerCrashed(
						"worker exited before delivering a result".to_string(),
					)));
					return ServeOutcome::Fatal;
				}
				Err(err) => {
					let _ = reply.send(Err(ApiError::ProtocolError(format!("stdout read failed: {err}"))));
					return ServeOutcome::Fatal;
				}
			}
		}
	}
}

fn spawn_child(shared: &PoolShared) -> std::io::Result<Child> {
	let command_line = &shared.config().command;
	let mut command = Command::new(&command_line[0]);
	command
		.args(&command_line[1..])
		.stdin(std::process::Stdio::piped())
		.stdout(std::process::Stdio::piped())
		.stderr(std::process::Stdio::piped())
		.kill_on_drop(true);
	command_in_own_group(&mut command);
	command.spawn()
}

fn drain_stderr(id: usize, stderr: tokio::process::ChildStderr) {
	tokio::spawn(async move {
		let mut lines = BufReader::new(stderr).lines();
		while let Ok(Some(line)) = lines.next_line().await {
			log::debug!("worker {id} stderr: {line}");
		}
	});
}
