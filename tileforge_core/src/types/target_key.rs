//! Identity of one tile set: `(project, kind, name)`.

use super::{ProjectId, TargetKind};
use std::fmt;

/// Exclusive-ownership key for a tile set. At most one batch job may hold a
/// given key at a time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetKey {
	pub project: ProjectId,
	pub kind: TargetKind,
	pub name: String,
}

impl TargetKey {
	pub fn new(project: ProjectId, kind: TargetKind, name: impl Into<String>) -> TargetKey {
		TargetKey {
			project,
			kind,
			name: name.into(),
		}
	}
}

impl fmt::Display for TargetKey {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}:{}:{}", self.project, self.kind, self.name)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn display_matches_the_wire_key() {
		let key = TargetKey::new(ProjectId::parse("demo").unwrap(), TargetKind::Layer, "orto");
		assert_eq!(key.to_string(), "demo:layer:orto");
	}
}
