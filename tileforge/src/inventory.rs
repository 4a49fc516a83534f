//! The capabilities inventory: everything the OGC documents advertise.
//!
//! Built by walking the cache directory and reading each project's
//! `index.json`. Layer identifiers are globally unique: clashes across
//! projects get a numeric suffix, mirroring how entries were disambiguated
//! at creation time.

use std::collections::HashSet;
use std::sync::Arc;
use tileforge_core::{
	grid::GridRegistry,
	store::{CachePaths, IndexStore},
	types::{IndexEntry, ProjectId},
};

/// One advertised layer with its resolved grid.
#[derive(Debug, Clone)]
pub struct InventoryLayer {
	/// Globally unique identifier used in capabilities and KVP lookups.
	pub identifier: String,
	/// The index entry backing the layer.
	pub entry: IndexEntry,
	pub project: ProjectId,
	/// Advertised tile-matrix-set id.
	pub set_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct Inventory {
	pub layers: Vec<InventoryLayer>,
}

impl Inventory {
	/// Walk the cache directory for one or all projects.
	pub fn build(paths: &CachePaths, index_store: &IndexStore, grids: &Arc<GridRegistry>, only: Option<&ProjectId>) -> Inventory {
		let projects: Vec<ProjectId> = match only {
			Some(project) => vec![project.clone()],
			None => paths.list_projects(),
		};

		let mut taken: HashSet<String> = HashSet::new();
		let mut layers = Vec::new();

		for project in projects {
			let Ok(index) = index_store.load(&project) else {
				continue;
			};
			for entry in index.layers {
				let set_id = entry
					.tile_matrix_preset
					.clone()
					.or_else(|| grids.find_preset_for_crs(&entry.tile_crs).map(|p| p.id.clone()))
					.unwrap_or_else(|| entry.tile_crs.replace(':', "_").to_ascii_lowercase());

				let base = format!("{}:{}", project, entry.name);
				let mut identifier = base.clone();
				let mut suffix = 2;
				while !taken.insert(identifier.clone()) {
					identifier = format!("{base}_{suffix}");
					suffix += 1;
				}

				layers.push(InventoryLayer {
					identifier,
					entry,
					project: project.clone(),
					set_id,
				});
			}
		}
		Inventory { layers }
	}

	/// Tile-matrix-set ids referenced by at least one surviving layer.
	pub fn referenced_set_ids(&self) -> Vec<String> {
		let mut ids: Vec<String> = self
			.layers
			.iter()
			.map(|layer| layer.set_id.clone())
			.collect::<HashSet<_>>()
			.into_iter()
			.collect();
		ids.sort();
		ids
	}

	/// Tolerant layer resolution for KVP requests: exact identifier, then
	/// entry name, then `<project>:<name>` key, then `_<token>` suffix.
	pub fn resolve_layer(&self, requested: &str) -> Option<&InventoryLayer> {
		if let Some(layer) = self.layers.iter().find(|l| l.identifier == requested) {
			return Some(layer);
		}
		if let Some(layer) = self.layers.iter().find(|l| l.entry.name == requested) {
			return Some(layer);
		}
		if let Some(layer) = self
			.layers
			.iter()
			.find(|l| format!("{}:{}", l.project, l.entry.name) == requested)
		{
			return Some(layer);
		}
		self
			.layers
			.iter()
			.find(|l| requested.rsplit_once('_').is_some_and(|(_, token)| l.entry.name == token))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;
	use std::path::PathBuf;
	use tileforge_core::store::ProjectLocks;
	use tileforge_core::types::{ProjectIndex, TargetKind, TileFormat, TileScheme};

	fn entry(name: &str) -> IndexEntry {
		IndexEntry {
			name: name.to_string(),
			kind: TargetKind::Layer,
			scheme: TileScheme::Wmts,
			tile_crs: "EPSG:3857".to_string(),
			layer_crs: None,
			zoom_min: 0,
			zoom_max: 5,
			last_zoom_min: None,
			last_zoom_max: None,
			tile_format: TileFormat::Png,
			path: PathBuf::from("/tiles"),
			tile_matrix_preset: Some("web_mercator".to_string()),
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

	fn setup(dir: &std::path::Path) -> (CachePaths, IndexStore, Arc<GridRegistry>) {
		let paths = CachePaths::new(dir.join("cache"));
		let store = IndexStore::new(paths.clone(), Arc::new(ProjectLocks::new()));
		let grids = GridRegistry::new(dir.join("presets")).unwrap();
		(paths, store, grids)
	}

	#[test]
	fn clashing_identifiers_get_suffixes() {
		let dir = tempfile::tempdir().unwrap();
		let (paths, store, grids) = setup(dir.path());

		let demo = ProjectId::parse("demo").unwrap();
		let mut index = ProjectIndex::skeleton(&demo);
		index.put(entry("orto"));
		store.save(&demo, &mut index).unwrap();

		let inventory = Inventory::build(&paths, &store, &grids, None);
		assert_eq!(inventory.layers.len(), 1);
		assert_eq!(inventory.layers[0].identifier, "demo:orto");
		assert_eq!(inventory.referenced_set_ids(), vec!["web_mercator"]);
	}

	#[test]
	fn resolve_layer_is_tolerant() {
		let dir = tempfile::tempdir().unwrap();
		let (paths, store, grids) = setup(dir.path());

		let demo = ProjectId::parse("demo").unwrap();
		let mut index = ProjectIndex::skeleton(&demo);
		index.put(entry("orto"));
		store.save(&demo, &mut index).unwrap();

		let inventory = Inventory::build(&paths, &store, &grids, None);
		assert!(inventory.resolve_layer("demo:orto").is_some());
		assert!(inventory.resolve_layer("orto").is_some());
		assert!(inventory.resolve_layer("legacy_orto").is_some(), "suffix match");
		assert!(inventory.resolve_layer("missing").is_none());
	}

	#[test]
	fn scoped_build_only_reads_one_project() {
		let dir = tempfile::tempdir().unwrap();
		let (paths, store, grids) = setup(dir.path());

		for id in ["alpha", "beta"] {
			let project = ProjectId::parse(id).unwrap();
			let mut index = ProjectIndex::skeleton(&project);
			index.put(entry("orto"));
			store.save(&project, &mut index).unwrap();
		}

		let beta = ProjectId::parse("beta").unwrap();
		let inventory = Inventory::build(&paths, &store, &grids, Some(&beta));
		assert_eq!(inventory.layers.len(), 1);
		assert_eq!(inventory.layers[0].identifier, "beta:orto");
	}
}
