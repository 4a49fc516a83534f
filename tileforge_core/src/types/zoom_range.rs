//! Inclusive zoom ranges with the coverage-widening rule.

use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};
use std::fmt;

/// An inclusive `[min, max]` zoom range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoomRange {
	pub min: u8,
	pub max: u8,
}

impl ZoomRange {
	pub fn new(min: u8, max: u8) -> Result<ZoomRange> {
		ensure!(min <= max, "zoom range inverted: {min} > {max}");
		ensure!(max <= 30, "zoom {max} out of range");
		Ok(ZoomRange { min, max })
	}

	/// Coverage only ever widens: the union of both ranges.
	pub fn widen(&self, run: ZoomRange) -> ZoomRange {
		ZoomRange {
			min: self.min.min(run.min),
			max: self.max.max(run.max),
		}
	}

	pub fn contains(&self, z: u8) -> bool {
		self.min <= z && z <= self.max
	}

	/// Whether the two ranges share at least one level.
	pub fn overlaps(&self, other: ZoomRange) -> bool {
		self.min <= other.max && other.min <= self.max
	}
}

impl fmt::Display for ZoomRange {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "z{}..z{}", self.min, self.max)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn widen_takes_the_union() {
		let coverage = ZoomRange::new(5, 8).unwrap();
		let run = ZoomRange::new(9, 10).unwrap();
		assert_eq!(coverage.widen(run), ZoomRange { min: 5, max: 10 });
		assert_eq!(run.widen(coverage), ZoomRange { min: 5, max: 10 });
	}

	#[test]
	fn overlap_is_inclusive() {
		let a = ZoomRange::new(5, 8).unwrap();
		assert!(a.overlaps(ZoomRange::new(8, 12).unwrap()));
		assert!(!a.overlaps(ZoomRange::new(9, 12).unwrap()));
	}

	#[test]
	fn inverted_range_is_rejected() {
		assert!(ZoomRange::new(9, 5).is_err());
	}
}
