//! CRS and extent detection from geospatial project files.
//!
//! The project XML is scanned with token-level regexes rather than a full
//! XML parse: project files in the wild carry vendor extensions and broken
//! namespaces, and all we need are the first `<projectCrs>` token and the
//! canvas extent. A `.qgz` is a zip archive holding the `.qgs` XML.

use crate::{ApiError, Settings};
use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use std::{fs, io::Read, path::Path};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProjectMetadata {
	pub crs: Option<String>,
	pub extent: Option<[f64; 4]>,
}

/// Read a `.qgs` or `.qgz` project file and extract CRS and extent.
pub fn inspect_project_file(path: &Path, settings: &Settings) -> Result<ProjectMetadata> {
	let xml = read_project_xml(path, settings)?;
	Ok(ProjectMetadata {
		crs: detect_crs(&xml),
		extent: detect_extent(&xml),
	})
}

lazy_static! {
	static ref PROJECT_CRS_BLOCK: Regex = Regex::new(r"(?s)<projectCrs>(.*?)</projectCrs>").unwrap();
	static ref AUTHID: Regex = Regex::new(r"<authid>\s*(EPSG:\d+)").unwrap();
	static ref ANY_EPSG: Regex = Regex::new(r"EPSG:\d+").unwrap();
	static ref EXTENT_BLOCK: Regex = Regex::new(
		r"(?s)<extent>\s*<xmin>([^<]+)</xmin>\s*<ymin>([^<]+)</ymin>\s*<xmax>([^<]+)</xmax>\s*<ymax>([^<]+)</ymax>"
	)
	.unwrap();
	static ref DEFAULT_VIEW_EXTENT: Regex = Regex::new(
		r#"<defaultViewExtent[^>]*\bxmin="([^"]+)"[^>]*\bymin="([^"]+)"[^>]*\bxmax="([^"]+)"[^>]*\bymax="([^"]+)""#
	)
	.unwrap();
}

/// First `<projectCrs>` token, falling back to `<authid>EPSG:…`, falling
/// back to the first `EPSG:NNNN` substring anywhere in the document.
pub fn detect_crs(xml: &str) -> Option<String> {
	if let Some(block) = PROJECT_CRS_BLOCK.captures(xml) {
		if let Some(authid) = AUTHID.captures(&block[1]) {
			return Some(authid[1].to_string());
		}
	}
	if let Some(authid) = AUTHID.captures(xml) {
		return Some(authid[1].to_string());
	}
	ANY_EPSG.find(xml).map(|m| m.as_str().to_string())
}

/// Canvas extent from `<extent><xmin/>…</extent>`, falling back to the
/// `<defaultViewExtent>` attributes.
pub fn detect_extent(xml: &str) -> Option<[f64; 4]> {
	if let Some(caps) = EXTENT_BLOCK.captures(xml) {
		if let Some(extent) = parse_extent(&caps[1], &caps[2], &caps[3], &caps[4]) {
			return Some(extent);
		}
	}
	let caps = DEFAULT_VIEW_EXTENT.captures(xml)?;
	parse_extent(&caps[1], &caps[2], &caps[3], &caps[4])
}

fn parse_extent(xmin: &str, ymin: &str, xmax: &str, ymax: &str) -> Option<[f64; 4]> {
	let values = [
		xmin.trim().parse().ok()?,
		ymin.trim().parse().ok()?,
		xmax.trim().parse().ok()?,
		ymax.trim().parse().ok()?,
	];
	let [minx, miny, maxx, maxy]: [f64; 4] = values;
	if minx < maxx && miny < maxy && values.iter().all(|v| v.is_finite()) {
		Some(values)
	} else {
		None
	}
}

fn read_project_xml(path: &Path, settings: &Settings) -> Result<String> {
	let extension = path
		.extension()
		.and_then(|e| e.to_str())
		.map(str::to_ascii_lowercase)
		.unwrap_or_default();
	match extension.as_str() {
		"qgs" => fs::read_to_string(path).with_context(|| format!("reading {}", path.display())),
		"qgz" => read_embedded_qgs(path, settings),
		other => Err(ApiError::UnsupportedFiletype(other.to_string()).into()),
	}
}

/// Pull the first `.qgs` entry out of a `.qgz` archive, enforcing the
/// configured decompression budgets.
fn read_embedded_qgs(path: &Path, settings: &Settings) -> Result<String> {
	let file = fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
	let mut archive = zip::ZipArchive::new(file).with_context(|| format!("reading archive {}", path.display()))?;

	if archive.len() > settings.zip_upload_max_entries {
		return Err(ApiError::ZipTooManyEntries.into());
	}

	for i in 0..archive.len() {
		let mut entry = archive.by_index(i)?;
		if !entry.name().to_ascii_lowercase().ends_with(".qgs") {
			continue;
		}
		if entry.size() > settings.zip_extract_max_entry_bytes {
			return Err(ApiError::ZipEntryTooLarge.into());
		}
		let mut text = String::with_capacity(entry.size() as usize);
		entry
			.take(settings.zip_extract_max_entry_bytes)
			.read_to_string(&mut text)
			.with_context(|| format!("decompressing project XML from {}", path.display()))?;
		return Ok(text);
	}
	anyhow::bail!("archive {} contains no .qgs entry", path.display())
}
