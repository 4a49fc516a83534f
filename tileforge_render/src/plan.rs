//! Incremental-vs-full recache planning.

use serde::Serialize;
use tileforge_core::types::ZoomRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecacheMode {
	Full,
	Incremental,
}

/// What a batch run should do with tiles that already exist.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecachePlan {
	pub mode: RecacheMode,
	/// Only meaningful for incremental runs: skip tiles already on disk.
	pub skip_existing: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub previous: Option<ZoomRange>,
}

impl RecachePlan {
	pub fn full() -> RecachePlan {
		RecachePlan {
			mode: RecacheMode::Full,
			skip_existing: false,
			previous: None,
		}
	}
}

/// Decide how to run a recache over `requested`, given what the last run
/// covered.
///
/// Incremental only pays off when the new range genuinely differs from the
/// previous one under the same CRS. Overlapping ranges re-render shared
/// levels (content may have changed); disjoint ranges can skip tiles that
/// already exist.
pub fn compute_recache_plan(
	previous: Option<ZoomRange>,
	previous_crs: Option<&str>,
	requested: ZoomRange,
	requested_crs: &str,
	incremental: bool,
	overlap_hint: bool,
) -> RecachePlan {
	if !incremental {
		return RecachePlan::full();
	}
	let Some(previous) = previous else {
		return RecachePlan::full();
	};
	if previous == requested {
		return RecachePlan::full();
	}
	if previous_crs.is_some_and(|crs| !crs.eq_ignore_ascii_case(requested_crs)) {
		return RecachePlan::full();
	}

	let overlaps = overlap_hint || previous.overlaps(requested);
	RecachePlan {
		mode: RecacheMode::Incremental,
		skip_existing: !overlaps,
		previous: Some(previous),
	}
}
