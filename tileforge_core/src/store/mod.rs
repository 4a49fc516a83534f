//! Durable per-project state: cache layout, index store, config store.
//!
//! Both stores follow the same discipline: a per-project mutex serializes
//! the compute-then-write sequence, and every write goes to a temporary
//! sibling first and is renamed into place, so readers never observe a torn
//! JSON file.

mod config_store;
mod index_store;
mod locks;
mod paths;

pub use config_store::*;
pub use index_store::*;
pub use locks::*;
pub use paths::*;

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::Path;

/// Serialize pretty-printed JSON to a temp sibling, then rename into place.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
	let parent = path
		.parent()
		.with_context(|| format!("no parent directory for {}", path.display()))?;
	fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;

	let mut tmp = path.as_os_str().to_owned();
	tmp.push(".tmp");
	let tmp = std::path::PathBuf::from(tmp);

	let json = serde_json::to_vec_pretty(value)?;
	fs::write(&tmp, json).with_context(|| format!("writing {}", tmp.display()))?;
	fs::rename(&tmp, path).with_context(|| format!("renaming {} into place", tmp.display()))?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn atomic_write_creates_parents_and_leaves_no_temp() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("a/b/data.json");
		write_json_atomic(&path, &serde_json::json!({"x": 1})).unwrap();

		let text = fs::read_to_string(&path).unwrap();
		assert!(text.contains("\"x\": 1"));
		assert!(!dir.path().join("a/b/data.json.tmp").exists());
	}
}
