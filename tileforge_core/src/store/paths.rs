//! On-disk layout of the cache directory.
//!
//! ```text
//! cache/
//!   <projectId>/
//!     index.json
//!     project-config.json
//!     <layerName>/<z>/<x>/<y>.png
//!     _themes/<themeName>/<z>/<x>/<y>.png
//!     _wms_tiles/<crs>/<layers>/<styles>/<transparent>/<z>/<x>/<y>.<ext>
//! ```

use crate::types::{ProjectId, TargetKind};
use std::path::{Path, PathBuf};

/// Directory holding composed themes, distinguishing them from layers.
pub const THEMES_DIR: &str = "_themes";

/// Directory holding cached tile-aligned WMS GetMap responses.
pub const WMS_TILES_DIR: &str = "_wms_tiles";

#[derive(Debug, Clone)]
pub struct CachePaths {
	root: PathBuf,
}

impl CachePaths {
	pub fn new(root: impl Into<PathBuf>) -> CachePaths {
		CachePaths { root: root.into() }
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	pub fn project_dir(&self, project: &ProjectId) -> PathBuf {
		self.root.join(project.as_str())
	}

	pub fn index_path(&self, project: &ProjectId) -> PathBuf {
		self.project_dir(project).join("index.json")
	}

	pub fn config_path(&self, project: &ProjectId) -> PathBuf {
		self.project_dir(project).join("project-config.json")
	}

	/// Tile-base directory of one layer or theme.
	pub fn target_dir(&self, project: &ProjectId, kind: TargetKind, name: &str) -> PathBuf {
		match kind {
			TargetKind::Layer => self.project_dir(project).join(name),
			TargetKind::Theme => self.project_dir(project).join(THEMES_DIR).join(name),
		}
	}

	/// Path of a single cached tile. `level` is the on-disk source level,
	/// which for auto-generated grids may differ from the advertised
	/// identifier.
	pub fn tile_path(
		&self,
		project: &ProjectId,
		kind: TargetKind,
		name: &str,
		level: &str,
		col: u64,
		row: u64,
		extension: &str,
	) -> PathBuf {
		self
			.target_dir(project, kind, name)
			.join(level)
			.join(col.to_string())
			.join(format!("{row}.{extension}"))
	}

	/// Cache directory for tile-aligned WMS GetMap responses.
	pub fn wms_tile_dir(
		&self,
		project: &ProjectId,
		crs: &str,
		layers: &str,
		styles: &str,
		transparent: bool,
	) -> PathBuf {
		self
			.project_dir(project)
			.join(WMS_TILES_DIR)
			.join(sanitize_path_token(crs))
			.join(sanitize_path_token(layers))
			.join(sanitize_path_token(if styles.is_empty() { "default" } else { styles }))
			.join(if transparent { "t" } else { "o" })
	}

	/// All project ids present under the cache root.
	pub fn list_projects(&self) -> Vec<ProjectId> {
		let Ok(entries) = std::fs::read_dir(&self.root) else {
			return Vec::new();
		};
		let mut ids: Vec<ProjectId> = entries
			.filter_map(|e| e.ok())
			.filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
			.filter_map(|e| ProjectId::parse(&e.file_name().to_string_lossy()))
			.collect();
		ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
		ids
	}
}

/// Make an arbitrary request token safe as a single path segment.
fn sanitize_path_token(value: &str) -> String {
	value
		.chars()
		.map(|c| {
			if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
				c.to_ascii_lowercase()
			} else {
				'_'
			}
		})
		.collect()
}
