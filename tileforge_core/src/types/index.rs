//! The persisted per-project index: one entry per published tile set.
//!
//! Serialized pretty-printed as `cache/<projectId>/index.json`. Field names
//! are camelCase on disk; entries are unique on `(kind, name)`.

use super::{ProgressStatus, ProjectId, TargetKind, TileFormat, TileScheme};
use crate::grid::TileMatrixSet;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectIndex {
	/// Path of the project file this index was bootstrapped from.
	pub project: Option<String>,
	pub id: String,
	pub created: DateTime<Utc>,
	pub updated: DateTime<Utc>,
	#[serde(default)]
	pub layers: Vec<IndexEntry>,
}

impl ProjectIndex {
	/// The empty skeleton used when no index file exists yet.
	pub fn skeleton(id: &ProjectId) -> ProjectIndex {
		let now = Utc::now();
		ProjectIndex {
			project: None,
			id: id.to_string(),
			created: now,
			updated: now,
			layers: Vec::new(),
		}
	}

	pub fn find(&self, kind: TargetKind, name: &str) -> Option<&IndexEntry> {
		self.layers.iter().find(|e| e.kind == kind && e.name == name)
	}

	/// Replace or append the entry with the same `(kind, name)`.
	pub fn put(&mut self, entry: IndexEntry) {
		self.layers.retain(|e| !(e.kind == entry.kind && e.name == entry.name));
		self.layers.push(entry);
	}

	pub fn remove(&mut self, kind: TargetKind, name: &str) -> bool {
		let before = self.layers.len();
		self.layers.retain(|e| !(e.kind == kind && e.name == name));
		self.layers.len() != before
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
	pub name: String,
	pub kind: TargetKind,
	pub scheme: TileScheme,
	pub tile_crs: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub layer_crs: Option<String>,
	/// Coverage: union of all zoom levels ever rendered. Only widens.
	pub zoom_min: u8,
	pub zoom_max: u8,
	/// Range of the most recent run, consumed by incremental planning.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub last_zoom_min: Option<u8>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub last_zoom_max: Option<u8>,
	pub tile_format: TileFormat,
	/// Absolute tile-base directory.
	pub path: PathBuf,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tile_matrix_preset: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tile_matrix_set: Option<TileMatrixSet>,
	/// Bbox in tile-CRS units.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub extent: Option<[f64; 4]>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub extent_wgs84: Option<[f64; 4]>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub progress: Option<ProgressSnapshot>,
	/// True while the set has gaps (running, aborted, or on-demand only).
	#[serde(default)]
	pub partial: bool,
	/// True for placeholder entries derived from project metadata.
	#[serde(default)]
	pub bootstrap: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub generated: Option<DateTime<Utc>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub updated: Option<DateTime<Utc>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub last_request_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
	pub status: ProgressStatus,
	pub percent: f64,
	pub total_generated: u64,
	pub expected_total: u64,
	pub updated_at: DateTime<Utc>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub message: Option<String>,
}

impl ProgressSnapshot {
	pub fn starting(expected_total: u64) -> ProgressSnapshot {
		ProgressSnapshot {
			status: ProgressStatus::Running,
			percent: 0.0,
			total_generated: 0,
			expected_total,
			updated_at: Utc::now(),
			message: None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn entry(kind: TargetKind, name: &str) -> IndexEntry {
		IndexEntry {
			name: name.to_string(),
			kind,
			scheme: TileScheme::Wmts,
			tile_crs: "EPSG:3857".to_string(),
			layer_crs: None,
			zoom_min: 0,
			zoom_max: 5,
			last_zoom_min: None,
			last_zoom_max: None,
			tile_format: TileFormat::Png,
			path: PathBuf::from("/cache/demo/orto"),
			tile_matrix_preset: None,
			tile_matrix_set: None,
			extent: None,
			extent_wgs84: None,
			progress: None,
			partial: false,
			bootstrap: false,
			generated: None,
			updated: None,
			last_request_at: None,
		}
	}

	#[test]
	fn put_is_unique_on_kind_and_name() {
		let mut index = ProjectIndex::skeleton(&ProjectId::parse("demo").unwrap());
		index.put(entry(TargetKind::Layer, "orto"));
		index.put(entry(TargetKind::Theme, "orto"));
		index.put(entry(TargetKind::Layer, "orto"));
		assert_eq!(index.layers.len(), 2);
	}

	#[test]
	fn camel_case_on_disk() {
		let json = serde_json::to_string(&entry(TargetKind::Layer, "orto")).unwrap();
		assert!(json.contains("\"tileCrs\""));
		assert!(json.contains("\"zoomMin\""));
		assert!(json.contains("\"tileFormat\""));
		assert!(!json.contains("\"lastZoomMin\""), "unset options stay off disk");
	}

	#[test]
	fn remove_reports_whether_anything_went() {
		let mut index = ProjectIndex::skeleton(&ProjectId::parse("demo").unwrap());
		index.put(entry(TargetKind::Layer, "orto"));
		assert!(index.remove(TargetKind::Layer, "orto"));
		assert!(!index.remove(TargetKind::Layer, "orto"));
	}
}
