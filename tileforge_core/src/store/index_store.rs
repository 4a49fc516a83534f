//! The project index store: `cache/<projectId>/index.json`.

use super::{CachePaths, ProjectLocks, write_json_atomic};
use crate::types::{IndexEntry, ProjectId, ProjectIndex, TargetKind};
use anyhow::{Context, Result};
use chrono::Utc;
use std::{fs, sync::Arc};

pub struct IndexStore {
	paths: CachePaths,
	locks: Arc<ProjectLocks>,
}

impl IndexStore {
	pub fn new(paths: CachePaths, locks: Arc<ProjectLocks>) -> IndexStore {
		IndexStore { paths, locks }
	}

	/// Read the index, or the empty skeleton when no file exists.
	///
	/// Reads don't take the project lock: writes are atomic renames, so the
	/// worst case is reading the previous generation.
	pub fn load(&self, project: &ProjectId) -> Result<ProjectIndex> {
		let path = self.paths.index_path(project);
		match fs::read_to_string(&path) {
			Ok(text) => serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display())),
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(ProjectIndex::skeleton(project)),
			Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
		}
	}

	/// Full rewrite; stamps `updated`.
	pub fn save(&self, project: &ProjectId, index: &mut ProjectIndex) -> Result<()> {
		let lock = self.locks.get(project.as_str());
		let _guard = lock.lock();
		self.save_locked(project, index)
	}

	/// Locked read-modify-write over the whole index.
	pub fn update(&self, project: &ProjectId, mutate: impl FnOnce(&mut ProjectIndex)) -> Result<ProjectIndex> {
		let lock = self.locks.get(project.as_str());
		let _guard = lock.lock();
		let mut index = self.load(project)?;
		mutate(&mut index);
		self.save_locked(project, &mut index)?;
		Ok(index)
	}

	/// Locked upsert of one `(kind, name)` entry. The updater receives the
	/// existing entry (if any); returning `None` deletes it. `name` and
	/// `kind` are re-stamped, so updaters cannot move an entry.
	pub fn upsert(
		&self,
		project: &ProjectId,
		kind: TargetKind,
		name: &str,
		updater: impl FnOnce(Option<IndexEntry>) -> Option<IndexEntry>,
	) -> Result<ProjectIndex> {
		self.update(project, |index| {
			let existing = index.find(kind, name).cloned();
			match updater(existing) {
				Some(mut entry) => {
					entry.name = name.to_string();
					entry.kind = kind;
					entry.updated = Some(Utc::now());
					index.put(entry);
				}
				None => {
					index.remove(kind, name);
				}
			}
		})
	}

	pub fn delete_file(&self, project: &ProjectId) -> Result<()> {
		let path = self.paths.index_path(project);
		match fs::remove_file(&path) {
			Ok(()) => Ok(()),
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(err) => Err(err).with_context(|| format!("deleting {}", path.display())),
		}
	}

	fn save_locked(&self, project: &ProjectId, index: &mut ProjectIndex) -> Result<()> {
		index.updated = Utc::now();
		write_json_atomic(&self.paths.index_path(project), index)
	}
}
