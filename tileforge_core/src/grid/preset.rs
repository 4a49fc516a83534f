//! Tile-matrix-set presets: the JSON definitions and the auto-generator.
//!
//! A preset describes a pyramid of tile matrices for one or more CRSs.
//! Preset files live in a configured directory and keep snake_case field
//! names; the normalized form embedded into index entries is camelCase.

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

/// OGC standardized rendering pixel size in metres, used to derive scale
/// denominators from resolutions.
pub const OGC_PIXEL_SIZE_M: f64 = 0.000_28;

/// Zoom levels generated for custom-CRS presets (z = 0..=22).
pub const AUTO_PRESET_LEVELS: u8 = 23;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AxisOrder {
	#[default]
	Xy,
	Yx,
}

/// A preset file as found in the presets directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TileMatrixPreset {
	pub id: String,
	#[serde(default)]
	pub supported_crs: Vec<String>,
	#[serde(default = "default_tile_size")]
	pub tile_width: u32,
	#[serde(default = "default_tile_size")]
	pub tile_height: u32,
	pub top_left_corner: [f64; 2],
	#[serde(default)]
	pub axis_order: AxisOrder,
	pub matrices: Vec<TileMatrix>,
	#[serde(default)]
	pub auto_generated: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub project_id: Option<String>,
}

fn default_tile_size() -> u32 {
	256
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TileMatrix {
	pub z: u8,
	pub identifier: String,
	pub resolution: f64,
	pub scale_denominator: f64,
	pub matrix_width: u32,
	pub matrix_height: u32,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub top_left: Option<[f64; 2]>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tile_width: Option<u32>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tile_height: Option<u32>,
}

impl TileMatrixPreset {
	pub fn supports_crs(&self, crs: &str) -> bool {
		self.supported_crs.iter().any(|c| c.eq_ignore_ascii_case(crs))
	}

	pub fn matrix_by_identifier(&self, identifier: &str) -> Option<&TileMatrix> {
		self.matrices.iter().find(|m| m.identifier == identifier)
	}

	pub fn matrix_by_level(&self, z: u8) -> Option<&TileMatrix> {
		self.matrices.iter().find(|m| m.z == z)
	}

	/// Compatibility fallback for KVP requests naming a TileMatrix this set
	/// does not have: pick the matrix whose numeric identifier is nearest.
	pub fn nearest_numeric_matrix(&self, requested: &str) -> Option<&TileMatrix> {
		let wanted: f64 = requested.parse().ok()?;
		self
			.matrices
			.iter()
			.filter_map(|m| m.identifier.parse::<f64>().ok().map(|id| (m, id)))
			.min_by(|(_, a), (_, b)| {
				let da = (a - wanted).abs();
				let db = (b - wanted).abs();
				da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
			})
			.map(|(m, _)| m)
	}

	/// The normalized form embedded into index entries.
	pub fn to_matrix_set(&self) -> TileMatrixSet {
		TileMatrixSet {
			axis_order: self.axis_order,
			tile_width: self.tile_width,
			tile_height: self.tile_height,
			origin: self.top_left_corner,
			levels: self
				.matrices
				.iter()
				.map(|m| TileMatrixLevel {
					identifier: m.identifier.clone(),
					scale_denominator: m.scale_denominator,
					matrix_width: m.matrix_width,
					matrix_height: m.matrix_height,
					resolution: m.resolution,
				})
				.collect(),
		}
	}

	/// Build a power-of-two pyramid for a CRS no stock preset covers.
	///
	/// Level 0 fits the whole extent in one tile; every further level halves
	/// the resolution. Matrix dimensions are `2^z × 2^z` so slippy-map
	/// clients can address the grid directly.
	pub fn auto_generate(crs: &str, extent: [f64; 4], project_id: &str) -> Result<TileMatrixPreset> {
		let [minx, miny, maxx, maxy] = extent;
		let width = maxx - minx;
		let height = maxy - miny;
		ensure!(
			width > 0.0 && height > 0.0,
			"cannot generate a grid for empty extent {extent:?}"
		);

		let tile_size = f64::from(default_tile_size());
		let base_resolution = width.max(height) / tile_size;

		let matrices = (0..AUTO_PRESET_LEVELS)
			.map(|z| {
				let resolution = base_resolution / f64::from(1u32 << z);
				let size = 1u32 << z;
				TileMatrix {
					z,
					identifier: z.to_string(),
					resolution,
					scale_denominator: resolution / OGC_PIXEL_SIZE_M,
					matrix_width: size,
					matrix_height: size,
					top_left: None,
					tile_width: None,
					tile_height: None,
				}
			})
			.collect();

		Ok(TileMatrixPreset {
			id: format!("{}_{}", sanitize_token(crs), sanitize_token(project_id)),
			supported_crs: vec![crs.to_string()],
			tile_width: default_tile_size(),
			tile_height: default_tile_size(),
			top_left_corner: [minx, maxy],
			axis_order: AxisOrder::Xy,
			matrices,
			auto_generated: true,
			project_id: Some(project_id.to_string()),
		})
	}

	pub fn from_json(text: &str) -> Result<TileMatrixPreset> {
		serde_json::from_str(text).context("parsing tile-matrix preset")
	}
}

/// Lowercase a token for use in preset ids and file names.
pub fn sanitize_token(value: &str) -> String {
	value
		.chars()
		.map(|c| {
			if c.is_ascii_alphanumeric() {
				c.to_ascii_lowercase()
			} else {
				'_'
			}
		})
		.collect()
}

/// Normalized tile-matrix set embedded into index entries (camelCase).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TileMatrixSet {
	pub axis_order: AxisOrder,
	pub tile_width: u32,
	pub tile_height: u32,
	pub origin: [f64; 2],
	pub levels: Vec<TileMatrixLevel>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TileMatrixLevel {
	pub identifier: String,
	pub scale_denominator: f64,
	pub matrix_width: u32,
	pub matrix_height: u32,
	pub resolution: f64,
}

#[cfg(test)]
mod tests {
	use super::*;
	use rstest::rstest;

	fn preset_with_levels(ids: &[&str]) -> TileMatrixPreset {
		TileMatrixPreset {
			id: "test".into(),
			supported_crs: vec!["EPSG:3857".into()],
			tile_width: 256,
			tile_height: 256,
			top_left_corner: [-20037508.34, 20037508.34],
			axis_order: AxisOrder::Xy,
			matrices: ids
				.iter()
				.enumerate()
				.map(|(z, id)| TileMatrix {
					z: z as u8,
					identifier: (*id).to_string(),
					resolution: 1.0 / f64::from(1u32 << z),
					scale_denominator: 1.0,
					matrix_width: 1 << z,
					matrix_height: 1 << z,
					top_left: None,
					tile_width: None,
					tile_height: None,
				})
				.collect(),
			auto_generated: false,
			project_id: None,
		}
	}

	#[test]
	fn crs_match_is_case_insensitive() {
		let preset = preset_with_levels(&["0"]);
		assert!(preset.supports_crs("epsg:3857"));
		assert!(!preset.supports_crs("EPSG:4326"));
	}

	#[rstest]
	#[case("3", "3")]
	#[case("7", "5")] // clamps to the deepest level available
	#[case("2.6", "3")]
	fn nearest_numeric_picks_the_closest(#[case] requested: &str, #[case] expected: &str) {
		let preset = preset_with_levels(&["0", "1", "2", "3", "4", "5"]);
		assert_eq!(preset.nearest_numeric_matrix(requested).unwrap().identifier, expected);
	}

	#[test]
	fn nearest_numeric_ignores_non_numeric_identifiers() {
		let preset = preset_with_levels(&["EU:A", "EU:B"]);
		assert!(preset.nearest_numeric_matrix("3").is_none());
	}

	#[test]
	fn auto_generate_builds_a_power_of_two_pyramid() {
		let preset = TileMatrixPreset::auto_generate("EPSG:3006", [200000.0, 6100000.0, 1000000.0, 7700000.0], "demo").unwrap();
		assert_eq!(preset.id, "epsg_3006_demo");
		assert!(preset.auto_generated);
		assert_eq!(preset.project_id.as_deref(), Some("demo"));
		assert_eq!(preset.matrices.len(), usize::from(AUTO_PRESET_LEVELS));

		// level 0 fits the larger extent axis in one 256px tile
		let level0 = &preset.matrices[0];
		assert_eq!(level0.matrix_width, 1);
		assert!((level0.resolution - 1_600_000.0 / 256.0).abs() < 1e-9);

		// each level halves resolution and doubles the matrix
		let level5 = &preset.matrices[5];
		assert_eq!(level5.matrix_width, 32);
		assert!((level5.resolution - level0.resolution / 32.0).abs() < 1e-9);

		// origin is the top-left corner of the extent
		assert_eq!(preset.top_left_corner, [200000.0, 7700000.0]);
	}

	#[test]
	fn auto_generate_rejects_empty_extents() {
		assert!(TileMatrixPreset::auto_generate("EPSG:3006", [1.0, 1.0, 1.0, 2.0], "demo").is_err());
	}

	#[test]
	fn matrix_set_embeds_camel_case() {
		let set = preset_with_levels(&["0", "1"]).to_matrix_set();
		let json = serde_json::to_string(&set).unwrap();
		assert!(json.contains("\"scaleDenominator\""));
		assert!(json.contains("\"matrixWidth\""));
		assert_eq!(set.levels.len(), 2);
	}
}
