//! Project identifiers derived from uploaded file names.
//!
//! A project id is a lowercased slug matching `[a-z0-9_-]+`. It is derived
//! from the uploaded file's base name: NFKD-normalize, strip combining
//! marks, collapse every other non-alphanumeric run to `_`, trim
//! underscores, lowercase. Collisions against the cache directory are
//! resolved with a numeric suffix.

use serde::{Deserialize, Serialize};
use std::{fmt, path::Path};
use unicode_normalization::UnicodeNormalization;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(String);

impl ProjectId {
	/// Derive an id from a file base name (without checking uniqueness).
	pub fn sanitize(base_name: &str) -> ProjectId {
		let mut slug = String::with_capacity(base_name.len());
		for ch in base_name.nfkd() {
			// drop combining marks left over from decomposition
			if is_combining_mark(ch) {
				continue;
			}
			if ch.is_ascii_alphanumeric() || ch == '-' {
				slug.push(ch.to_ascii_lowercase());
			} else if !slug.ends_with('_') {
				slug.push('_');
			}
		}
		let trimmed = slug.trim_matches('_');
		if trimmed.is_empty() {
			ProjectId("project".to_string())
		} else {
			ProjectId(trimmed.to_string())
		}
	}

	/// Derive an id unique within `cache_dir`, suffixing `_2`, `_3`, … on collision.
	pub fn sanitize_unique(base_name: &str, cache_dir: &Path) -> ProjectId {
		let base = ProjectId::sanitize(base_name);
		if !cache_dir.join(base.as_str()).exists() {
			return base;
		}
		for n in 2.. {
			let candidate = format!("{}_{n}", base.as_str());
			if !cache_dir.join(&candidate).exists() {
				return ProjectId(candidate);
			}
		}
		unreachable!()
	}

	/// Accept an already-sanitized id, e.g. from a URL path segment.
	pub fn parse(value: &str) -> Option<ProjectId> {
		if !value.is_empty() && value.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
		{
			Some(ProjectId(value.to_string()))
		} else {
			None
		}
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for ProjectId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl AsRef<str> for ProjectId {
	fn as_ref(&self) -> &str {
		&self.0
	}
}

fn is_combining_mark(ch: char) -> bool {
	matches!(ch as u32, 0x0300..=0x036F | 0x1AB0..=0x1AFF | 0x1DC0..=0x1DFF | 0x20D0..=0x20FF | 0xFE20..=0xFE2F)
}
