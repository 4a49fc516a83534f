//! Per-project exclusive locks shared by the index and config stores.

use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};

/// Hands out one mutex per project id. Lock handles are `Arc`ed so holders
/// survive concurrent map growth.
#[derive(Default)]
pub struct ProjectLocks {
	inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ProjectLocks {
	pub fn new() -> ProjectLocks {
		ProjectLocks::default()
	}

	pub fn get(&self, project: &str) -> Arc<Mutex<()>> {
		let mut map = self.inner.lock();
		Arc::clone(map.entry(project.to_string()).or_default())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn same_project_shares_a_lock() {
		let locks = ProjectLocks::new();
		let a = locks.get("demo");
		let b = locks.get("demo");
		let c = locks.get("other");
		assert!(Arc::ptr_eq(&a, &b));
		assert!(!Arc::ptr_eq(&a, &c));
	}
}
