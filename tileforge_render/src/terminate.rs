//! Cross-platform process-tree teardown.
//!
//! A plain kill only reaches the direct child; renderers fork helpers that
//! must not survive an abort. On unix the child is its own process group
//! (set at spawn) and a negative-pid SIGKILL reaps the whole group; on
//! windows `taskkill /T /F` walks the tree. Escalation happens only if the
//! child is still alive after the grace period.

use std::time::Duration;
use tokio::process::{Child, Command};

/// Ask the child to die, wait out the grace period, then tear down the
/// whole process tree. Safe to call on an already-dead child.
pub async fn terminate_tree(child: &mut Child, grace: Duration) {
	let pid = child.id();

	if let Err(err) = child.start_kill() {
		log::debug!("kill failed (process probably finished): {err}");
	}

	match tokio::time::timeout(grace, child.wait()).await {
		Ok(_) => return,
		Err(_) => {
			log::warn!("process {pid:?} survived kill for {grace:?}, escalating to tree kill");
		}
	}

	if let Some(pid) = pid {
		kill_tree(pid).await;
	}
	// reap whatever is left so the child doesn't zombie
	let _ = child.wait().await;
}

#[cfg(unix)]
async fn kill_tree(pid: u32) {
	// the child was spawned as its own process group leader
	let status = Command::new("kill").arg("-9").arg(format!("-{pid}")).status().await;
	if let Err(err) = status {
		log::warn!("tree kill of -{pid} failed: {err}");
	}
}

#[cfg(windows)]
async fn kill_tree(pid: u32) {
	let status = Command::new("taskkill")
		.args(["/T", "/F", "/PID", &pid.to_string()])
		.status()
		.await;
	if let Err(err) = status {
		log::warn!("taskkill /T /F {pid} failed: {err}");
	}
}

/// Configure a command so the spawned child leads its own process group,
/// making the whole tree addressable for teardown.
pub fn command_in_own_group(command: &mut Command) -> &mut Command {
	#[cfg(unix)]
	{
		command.process_group(0);
	}
	command
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn terminating_a_finished_child_is_a_no_op() {
		let mut child = Command::new("true").spawn().expect("spawn true");
		child.wait().await.unwrap();
		terminate_tree(&mut child, Duration::from_millis(100)).await;
	}

	#[tokio::test]
	async fn terminate_kills_a_sleeping_child() {
		let mut command = Command::new("sleep");
		command.arg("30");
		command_in_own_group(&mut command);
		let mut child = command.spawn().expect("spawn sleep");

		let started = std::time::Instant::now();
		terminate_tree(&mut child, Duration::from_millis(500)).await;
		assert!(started.elapsed() < Duration::from_secs(5));
	}
}
