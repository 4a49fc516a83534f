//! Small closed enums: target kinds, tile schemes, formats, run outcomes.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether a tile set is backed by a single layer or a composed theme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
	Layer,
	Theme,
}

impl TargetKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			TargetKind::Layer => "layer",
			TargetKind::Theme => "theme",
		}
	}

	pub fn parse(value: &str) -> Result<TargetKind> {
		match value {
			"layer" => Ok(TargetKind::Layer),
			"theme" => Ok(TargetKind::Theme),
			_ => bail!("unknown target kind {value:?}"),
		}
	}
}

impl fmt::Display for TargetKind {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// URL/filesystem convention for addressing tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TileScheme {
	Xyz,
	Wmts,
}

impl TileScheme {
	pub fn as_str(&self) -> &'static str {
		match self {
			TileScheme::Xyz => "xyz",
			TileScheme::Wmts => "wmts",
		}
	}
}

impl fmt::Display for TileScheme {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Cache preference: force a scheme or let the project decide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
	Xyz,
	Wmts,
	#[default]
	Auto,
}

/// Raster format of cached tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TileFormat {
	#[default]
	Png,
	Jpeg,
}

impl TileFormat {
	pub fn extension(&self) -> &'static str {
		match self {
			TileFormat::Png => "png",
			TileFormat::Jpeg => "jpg",
		}
	}

	pub fn mime(&self) -> &'static str {
		match self {
			TileFormat::Png => "image/png",
			TileFormat::Jpeg => "image/jpeg",
		}
	}
}

/// Outcome of a batch run, as recorded in config histories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunResult {
	Success,
	Error,
	Aborted,
	Skipped,
	Deleted,
	OnDemand,
}

/// Lifecycle status of a tile set, as recorded in the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProgressStatus {
	Running,
	Completed,
	Error,
	Aborted,
	OnDemand,
}

impl ProgressStatus {
	pub fn is_terminal(&self) -> bool {
		!matches!(self, ProgressStatus::Running)
	}

	pub fn parse(value: &str) -> Option<ProgressStatus> {
		match value {
			"running" => Some(ProgressStatus::Running),
			// workers report either wording
			"completed" | "success" => Some(ProgressStatus::Completed),
			"error" => Some(ProgressStatus::Error),
			"aborted" => Some(ProgressStatus::Aborted),
			"on-demand" => Some(ProgressStatus::OnDemand),
			_ => None,
		}
	}
}
