//! Tile addressing: bbox computation, matrix remapping, row flips.

use tileforge_core::grid::{TileMatrix, TileMatrixPreset};

/// A request resolved against a concrete matrix of a set.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTile {
	pub matrix: TileMatrix,
	pub col: u64,
	pub row: u64,
	/// True when the requested TileMatrix was remapped to the nearest
	/// numeric identifier (compatibility fallback, logged at warn).
	pub remapped: bool,
	/// True when the row only fit after a TMS↔WMTS flip.
	pub flipped: bool,
}

/// Geographic extent of one tile in CRS units.
pub fn tile_bbox(preset: &TileMatrixPreset, matrix: &TileMatrix, col: u64, row: u64) -> [f64; 4] {
	let origin = matrix.top_left.unwrap_or(preset.top_left_corner);
	let tile_width = f64::from(matrix.tile_width.unwrap_or(preset.tile_width));
	let tile_height = f64::from(matrix.tile_height.unwrap_or(preset.tile_height));
	let span_x = matrix.resolution * tile_width;
	let span_y = matrix.resolution * tile_height;

	let minx = origin[0] + col as f64 * span_x;
	let maxy = origin[1] - row as f64 * span_y;
	[minx, maxy - span_y, minx + span_x, maxy]
}

/// Resolve a KVP GetTile against a set, tolerating unknown TileMatrix
/// identifiers (nearest-numeric remap with power-of-two rescale) and
/// TMS-convention rows (flip fallback).
pub fn resolve_tile(preset: &TileMatrixPreset, requested_matrix: &str, col: u64, row: u64) -> Option<ResolvedTile> {
	// exact identifier, or the bare numeric level
	let exact = preset
		.matrix_by_identifier(requested_matrix)
		.or_else(|| requested_matrix.parse::<u8>().ok().and_then(|z| preset.matrix_by_level(z)));

	let (matrix, col, row, remapped) = match exact {
		Some(matrix) => (matrix, col, row, false),
		None => {
			let matrix = preset.nearest_numeric_matrix(requested_matrix)?;
			let requested: f64 = requested_matrix.parse().ok()?;
			let target: f64 = matrix.identifier.parse().ok()?;
			let (col, row) = rescale(col, row, requested as i32, target as i32);
			log::warn!(
				"TileMatrix '{requested_matrix}' not in set '{}', remapped to '{}'",
				preset.id,
				matrix.identifier
			);
			(matrix, col, row, true)
		}
	};

	let (col, row, flipped) = fit_or_flip(matrix, col, row)?;
	Some(ResolvedTile {
		matrix: matrix.clone(),
		col,
		row,
		remapped,
		flipped,
	})
}

/// Rescale `(col, row)` between pyramid levels by the power-of-two factor,
/// with floor division when scaling down.
fn rescale(col: u64, row: u64, from_level: i32, to_level: i32) -> (u64, u64) {
	if to_level >= from_level {
		let shift = (to_level - from_level).min(32) as u32;
		(col << shift, row << shift)
	} else {
		let shift = (from_level - to_level).min(32) as u32;
		(col >> shift, row >> shift)
	}
}

/// Bounds-check against the matrix, attempting a TMS↔WMTS row flip when
/// the row is out of range. The flip is tried against the matrix height
/// and, for restricted (non-square) matrices, against the full `2^z`
/// pyramid height.
fn fit_or_flip(matrix: &TileMatrix, col: u64, row: u64) -> Option<(u64, u64, bool)> {
	let width = u64::from(matrix.matrix_width);
	let height = u64::from(matrix.matrix_height);
	if col >= width {
		return None;
	}
	if row < height {
		return Some((col, row, false));
	}

	let candidates = [
		height as i64 - 1 - row as i64,
		(1i64 << matrix.z.min(62)) - 1 - row as i64,
	];
	for candidate in candidates {
		if candidate >= 0 && (candidate as u64) < height {
			return Some((col, candidate as u64, true));
		}
	}
	None
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;
	use rstest::rstest;

	fn preset() -> TileMatrixPreset {
		TileMatrixPreset::auto_generate("EPSG:3857", [0.0, 0.0, 1024.0, 1024.0], "test").unwrap()
	}

	#[test]
	fn bbox_of_the_root_tile_is_the_extent() {
		let preset = preset();
		let matrix = preset.matrix_by_level(0).unwrap();
		let bbox = tile_bbox(&preset, matrix, 0, 0);
		assert_eq!(bbox, [0.0, 0.0, 1024.0, 1024.0]);
	}

	#[test]
	fn bbox_steps_by_tile_span() {
		let preset = preset();
		let matrix = preset.matrix_by_level(1).unwrap();
		// z1: resolution halves, 2×2 tiles of 512 units
		assert_eq!(tile_bbox(&preset, matrix, 1, 0), [512.0, 512.0, 1024.0, 1024.0]);
		assert_eq!(tile_bbox(&preset, matrix, 0, 1), [0.0, 0.0, 512.0, 512.0]);
	}

	#[test]
	fn exact_matrix_resolves_without_remap() {
		let preset = preset();
		let resolved = resolve_tile(&preset, "3", 4, 5).unwrap();
		assert_eq!(resolved.matrix.z, 3);
		assert!(!resolved.remapped);
		assert!(!resolved.flipped);
	}

	#[rstest]
	#[case("25", 8, 16, 22, 1, 2)] // deeper than the set: floor-divide down to z22
	#[case("-2", 0, 0, 0, 0, 0)] // shallower than the set: clamp up to z0
	fn unknown_matrix_remaps_to_nearest(
		#[case] requested: &str,
		#[case] col: u64,
		#[case] row: u64,
		#[case] expected_z: u8,
		#[case] expected_col: u64,
		#[case] expected_row: u64,
	) {
		let preset = preset();
		let resolved = resolve_tile(&preset, requested, col, row).unwrap();
		assert_eq!(resolved.matrix.z, expected_z);
		assert!(resolved.remapped);
		assert_eq!((resolved.col, resolved.row), (expected_col, expected_row));
	}

	#[test]
	fn out_of_bounds_col_is_rejected() {
		let preset = preset();
		assert_eq!(resolve_tile(&preset, "1", 2, 0), None);
	}

	#[test]
	fn restricted_matrix_row_flips_against_the_pyramid() {
		let mut preset = preset();
		// simulate a restricted grid: z5 only covers 20 of 32 rows
		let matrix = preset.matrices.iter_mut().find(|m| m.z == 5).unwrap();
		matrix.matrix_height = 20;

		// TMS row 25 of the full 32-row pyramid maps to WMTS row 6
		let resolved = resolve_tile(&preset, "5", 0, 25).unwrap();
		assert_eq!(resolved.row, 6);
		assert!(resolved.flipped);

		// a row no flip can save is a miss
		assert_eq!(resolve_tile(&preset, "5", 0, 40), None);
	}

	#[test]
	fn rescale_floors_on_the_way_down() {
		assert_eq!(rescale(5, 7, 5, 3), (1, 1));
		assert_eq!(rescale(1, 1, 3, 5), (4, 4));
		assert_eq!(rescale(3, 3, 4, 4), (3, 3));
	}
}
