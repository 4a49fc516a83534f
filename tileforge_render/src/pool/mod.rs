//! The persistent renderer worker pool.
//!
//! A fixed set of actor-like workers each owns one renderer subprocess.
//! Idle workers pull from a shared FIFO queue, so a job never waits behind
//! a busy worker while another one is free. Crashed workers respawn after a
//! short backoff; repeated crashes inside a window are logged as persistent
//! failure but do not change the restart policy.

mod worker;

use crate::{WorkerEvent, WorkerJob, WorkerReply};
use parking_lot::Mutex;
use std::{
	collections::VecDeque,
	sync::{
		Arc,
		atomic::{AtomicBool, Ordering},
	},
	time::{Duration, Instant},
};
use tileforge_core::ApiError;
use tokio::sync::{Notify, mpsc, oneshot};

pub type JobResult = Result<WorkerReply, ApiError>;

/// How a worker subprocess is spawned and restarted.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
	/// Program and arguments of the renderer subprocess.
	pub command: Vec<String>,
	/// Number of persistent workers.
	pub workers: usize,
	/// Delay before a crashed worker respawns.
	pub restart_backoff: Duration,
	/// Grace between kill and process-tree escalation.
	pub abort_grace: Duration,
	/// Crash-burst detection: this many crashes…
	pub crash_threshold: usize,
	/// …inside this window log a persistent failure.
	pub crash_window: Duration,
}

impl WorkerPoolConfig {
	pub fn new(command: Vec<String>, workers: usize) -> WorkerPoolConfig {
		WorkerPoolConfig {
			command,
			workers: workers.max(1),
			restart_backoff: Duration::from_secs(2),
			abort_grace: Duration::from_secs(1),
			crash_threshold: 3,
			crash_window: Duration::from_secs(60),
		}
	}
}

/// A job parked in the pool, waiting for a free worker.
pub(crate) struct PendingJob {
	pub job: WorkerJob,
	pub reply: oneshot::Sender<JobResult>,
	/// Receives progress/debug events out-of-band while the job runs.
	pub observer: Option<mpsc::UnboundedSender<WorkerEvent>>,
}

/// Outcome of [`WorkerPool::abort_all`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbortSummary {
	pub cancelled_queued: usize,
	pub aborted_running: usize,
}

struct WorkerSlot {
	kill: mpsc::UnboundedSender<()>,
	busy: Arc<AtomicBool>,
	join: tokio::task::JoinHandle<()>,
}

pub(crate) struct PoolShared {
	config: WorkerPoolConfig,
	queue: Mutex<VecDeque<PendingJob>>,
	job_ready: Notify,
	closed: AtomicBool,
	crashes: Mutex<VecDeque<Instant>>,
}

impl PoolShared {
	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}

	pub fn config(&self) -> &WorkerPoolConfig {
		&self.config
	}

	/// Wait until a job is available or the pool closes.
	pub async fn next_job(&self) -> Option<PendingJob> {
		loop {
			let notified = self.job_ready.notified();
			if self.is_closed() {
				return None;
			}
			if let Some(job) = self.queue.lock().pop_front() {
				return Some(job);
			}
			notified.await;
		}
	}

	/// Record one crash; returns true when the burst threshold is reached.
	pub fn record_crash(&self) -> bool {
		let now = Instant::now();
		let mut crashes = self.crashes.lock();
		crashes.push_back(now);
		while crashes
			.front()
			.is_some_and(|t| now.duration_since(*t) > self.config.crash_window)
		{
			crashes.pop_front();
		}
		crashes.len() >= self.config.crash_threshold
	}
}

/// Owns the worker actors; cheap to clone.
#[derive(Clone)]
pub struct WorkerPool {
	shared: Arc<PoolShared>,
	slots: Arc<Mutex<Vec<WorkerSlot>>>,
}

impl WorkerPool {
	/// Spawn `config.workers` persistent workers. Requires a tokio runtime.
	pub fn new(config: WorkerPoolConfig) -> WorkerPool {
		let shared = Arc::new(PoolShared {
			config,
			queue: Mutex::new(VecDeque::new()),
			job_ready: Notify::new(),
			closed: AtomicBool::new(false),
			crashes: Mutex::new(VecDeque::new()),
		});

		let mut slots = Vec::with_capacity(shared.config.workers);
		for id in 0..shared.config.workers {
			let (kill_tx, kill_rx) = mpsc::unbounded_channel();
			let busy = Arc::new(AtomicBool::new(false));
			let join = tokio::spawn(worker::worker_loop(Arc::clone(&shared), id, Arc::clone(&busy), kill_rx));
			slots.push(WorkerSlot {
				kill: kill_tx,
				busy,
				join,
			});
		}

		WorkerPool {
			shared,
			slots: Arc::new(Mutex::new(slots)),
		}
	}

	/// Enqueue a job; the returned receiver resolves with the terminal
	/// result. Progress/debug events go to `observer` while the job runs.
	pub fn submit(&self, job: WorkerJob, observer: Option<mpsc::UnboundedSender<WorkerEvent>>) -> oneshot::Receiver<JobResult> {
		let (reply_tx, reply_rx) = oneshot::channel();
		if self.shared.is_closed() {
			let _ = reply_tx.send(Err(ApiError::Aborted));
			return reply_rx;
		}
		self.shared.queue.lock().push_back(PendingJob {
			job,
			reply: reply_tx,
			observer,
		});
		self.shared.job_ready.notify_one();
		reply_rx
	}

	/// Submit and await the terminal result.
	pub async fn run(&self, job: WorkerJob) -> JobResult {
		match self.submit(job, None).await {
			Ok(result) => result,
			Err(_) => Err(ApiError::WorkerCrashed("worker pool dropped the job".to_string())),
		}
	}

	/// Remove queued jobs matching `predicate`, failing them with `aborted`.
	/// Running jobs are untouched. Returns how many were removed.
	pub fn cancel_queued(&self, predicate: impl Fn(&WorkerJob) -> bool) -> usize {
		let removed: Vec<PendingJob> = {
			let mut queue = self.shared.queue.lock();
			let mut kept = VecDeque::with_capacity(queue.len());
			let mut removed = Vec::new();
			while let Some(pending) = queue.pop_front() {
				if predicate(&pending.job) {
					removed.push(pending);
				} else {
					kept.push_back(pending);
				}
			}
			*queue = kept;
			removed
		};
		let count = removed.len();
		for pending in removed {
			let _ = pending.reply.send(Err(ApiError::Aborted));
		}
		count
	}

	/// Fail everything: queued futures, running futures, and every
	/// subprocess (which respawns through the normal restart path).
	pub fn abort_all(&self, reason: &str) -> AbortSummary {
		log::warn!("aborting all worker pool jobs: {reason}");
		let cancelled_queued = self.cancel_queued(|_| true);

		let slots = self.slots.lock();
		let aborted_running = slots.iter().filter(|s| s.busy.load(Ordering::SeqCst)).count();
		for slot in slots.iter() {
			let _ = slot.kill.send(());
		}
		AbortSummary {
			cancelled_queued,
			aborted_running,
		}
	}

	/// Number of jobs waiting for a free worker.
	pub fn queued(&self) -> usize {
		self.shared.queue.lock().len()
	}

	/// Kill all subprocesses and refuse further submissions.
	pub async fn close(&self) {
		if self.shared.closed.swap(true, Ordering::SeqCst) {
			return;
		}
		log::info!("closing worker pool");
		self.cancel_queued(|_| true);
		self.shared.job_ready.notify_waiters();

		let slots: Vec<WorkerSlot> = std::mem::take(&mut *self.slots.lock());
		for slot in &slots {
			let _ = slot.kill.send(());
		}
		for slot in slots {
			if tokio::time::timeout(Duration::from_secs(5), slot.join).await.is_err() {
				log::warn!("worker did not stop within timeout");
			}
		}
	}
}
