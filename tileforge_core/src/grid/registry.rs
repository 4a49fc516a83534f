//! The in-memory preset registry with filesystem hot reload.
//!
//! Presets are loaded from a directory of JSON files. A `notify` watcher
//! debounces change bursts (~200 ms) and swaps the whole map atomically, so
//! readers never observe a half-reloaded registry.

use super::{TileMatrixPreset, sanitize_token};
use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::{
	collections::HashMap,
	fs,
	path::{Path, PathBuf},
	sync::{Arc, mpsc},
	time::Duration,
};

const RELOAD_DEBOUNCE: Duration = Duration::from_millis(200);

pub struct GridRegistry {
	dir: PathBuf,
	presets: ArcSwap<HashMap<String, Arc<TileMatrixPreset>>>,
	watcher: parking_lot::Mutex<Option<RecommendedWatcher>>,
}

impl GridRegistry {
	/// Load all presets from `dir` (created if missing).
	pub fn new(dir: impl Into<PathBuf>) -> Result<Arc<GridRegistry>> {
		let dir = dir.into();
		fs::create_dir_all(&dir).with_context(|| format!("creating presets directory {}", dir.display()))?;
		let registry = Arc::new(GridRegistry {
			dir,
			presets: ArcSwap::from_pointee(HashMap::new()),
			watcher: parking_lot::Mutex::new(None),
		});
		registry.reload()?;
		Ok(registry)
	}

	/// Re-scan the presets directory and swap the map atomically.
	pub fn reload(&self) -> Result<()> {
		let mut map = HashMap::new();
		for entry in fs::read_dir(&self.dir).with_context(|| format!("reading presets directory {}", self.dir.display()))? {
			let path = entry?.path();
			if path.extension().is_none_or(|ext| !ext.eq_ignore_ascii_case("json")) {
				continue;
			}
			match fs::read_to_string(&path).map_err(anyhow::Error::from).and_then(|text| TileMatrixPreset::from_json(&text)) {
				Ok(preset) => {
					map.insert(preset.id.clone(), Arc::new(preset));
				}
				Err(err) => {
					log::warn!("skipping unreadable preset {}: {err:#}", path.display());
				}
			}
		}
		log::debug!("grid registry loaded {} presets from {}", map.len(), self.dir.display());
		self.presets.store(Arc::new(map));
		Ok(())
	}

	/// Start watching the presets directory; reloads are debounced.
	pub fn watch(self: &Arc<Self>) -> Result<()> {
		let (tx, rx) = mpsc::channel::<notify::Result<notify::Event>>();
		let mut watcher = RecommendedWatcher::new(
			move |event| {
				let _ = tx.send(event);
			},
			notify::Config::default(),
		)?;
		watcher.watch(&self.dir, RecursiveMode::NonRecursive)?;
		*self.watcher.lock() = Some(watcher);

		let registry = Arc::clone(self);
		std::thread::Builder::new()
			.name("grid-registry-watch".to_string())
			.spawn(move || {
				while rx.recv().is_ok() {
					// swallow the burst, then reload once
					while rx.recv_timeout(RELOAD_DEBOUNCE).is_ok() {}
					if let Err(err) = registry.reload() {
						log::warn!("preset reload failed: {err:#}");
					}
				}
			})
			.context("spawning grid registry watch thread")?;
		Ok(())
	}

	pub fn get(&self, id: &str) -> Option<Arc<TileMatrixPreset>> {
		self.presets.load().get(id).cloned()
	}

	pub fn ids(&self) -> Vec<String> {
		let mut ids: Vec<String> = self.presets.load().keys().cloned().collect();
		ids.sort();
		ids
	}

	/// Case-insensitive CRS lookup across all presets.
	pub fn find_preset_for_crs(&self, crs: &str) -> Option<Arc<TileMatrixPreset>> {
		self.presets.load().values().find(|p| p.supports_crs(crs)).cloned()
	}

	/// Generate, persist, and register a preset for a custom CRS.
	pub fn auto_generate_preset(&self, crs: &str, extent: [f64; 4], project_id: &str) -> Result<Arc<TileMatrixPreset>> {
		let preset = TileMatrixPreset::auto_generate(crs, extent, project_id)?;
		let path = self.preset_path(&preset.id);
		let json = serde_json::to_string_pretty(&preset)?;
		fs::write(&path, json).with_context(|| format!("writing auto-generated preset {}", path.display()))?;
		log::info!("auto-generated tile-matrix preset '{}' for {crs}", preset.id);

		let preset = Arc::new(preset);
		self.insert(Arc::clone(&preset));
		Ok(preset)
	}

	/// Remove every auto-generated preset belonging to `project_id`.
	/// Returns how many were deleted.
	pub fn remove_auto_generated(&self, project_id: &str) -> Result<usize> {
		let doomed: Vec<Arc<TileMatrixPreset>> = self
			.presets
			.load()
			.values()
			.filter(|p| p.auto_generated && p.project_id.as_deref() == Some(project_id))
			.cloned()
			.collect();

		for preset in &doomed {
			let path = self.preset_path(&preset.id);
			if let Err(err) = fs::remove_file(&path) {
				if err.kind() != std::io::ErrorKind::NotFound {
					return Err(err).with_context(|| format!("deleting preset {}", path.display()));
				}
			}
		}

		if !doomed.is_empty() {
			self.presets.rcu(|old| {
				let mut map = (**old).clone();
				for preset in &doomed {
					map.remove(&preset.id);
				}
				map
			});
		}
		Ok(doomed.len())
	}

	pub fn dir(&self) -> &Path {
		&self.dir
	}

	fn insert(&self, preset: Arc<TileMatrixPreset>) {
		self.presets.rcu(|old| {
			let mut map = (**old).clone();
			map.insert(preset.id.clone(), Arc::clone(&preset));
			map
		});
	}

	fn preset_path(&self, id: &str) -> PathBuf {
		self.dir.join(format!("{}.json", sanitize_token(id)))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn write_preset(dir: &Path, id: &str, crs: &str) {
		let preset = TileMatrixPreset::auto_generate(crs, [0.0, 0.0, 100.0, 100.0], "seed").unwrap();
		let preset = TileMatrixPreset {
			id: id.to_string(),
			auto_generated: false,
			project_id: None,
			..preset
		};
		fs::write(
			dir.join(format!("{id}.json")),
			serde_json::to_string_pretty(&preset).unwrap(),
		)
		.unwrap();
	}

	#[test]
	fn loads_and_finds_by_crs() {
		let dir = tempfile::tempdir().unwrap();
		write_preset(dir.path(), "web_mercator", "EPSG:3857");
		write_preset(dir.path(), "sweref99", "EPSG:3006");

		let registry = GridRegistry::new(dir.path()).unwrap();
		assert_eq!(registry.ids(), vec!["sweref99", "web_mercator"]);
		assert_eq!(registry.find_preset_for_crs("epsg:3006").unwrap().id, "sweref99");
		assert!(registry.find_preset_for_crs("EPSG:4326").is_none());
	}

	#[test]
	fn unreadable_presets_are_skipped() {
		let dir = tempfile::tempdir().unwrap();
		write_preset(dir.path(), "good", "EPSG:3857");
		fs::write(dir.path().join("bad.json"), "{ nope").unwrap();

		let registry = GridRegistry::new(dir.path()).unwrap();
		assert_eq!(registry.ids(), vec!["good"]);
	}

	#[test]
	fn auto_generate_persists_and_registers() {
		let dir = tempfile::tempdir().unwrap();
		let registry = GridRegistry::new(dir.path()).unwrap();

		let preset = registry
			.auto_generate_preset("EPSG:3006", [200000.0, 6100000.0, 1000000.0, 7700000.0], "demo")
			.unwrap();
		assert_eq!(preset.id, "epsg_3006_demo");
		assert!(dir.path().join("epsg_3006_demo.json").exists());
		assert!(registry.get("epsg_3006_demo").is_some());

		// a fresh registry over the same directory sees the file
		let reloaded = GridRegistry::new(dir.path()).unwrap();
		assert!(reloaded.get("epsg_3006_demo").is_some());
	}

	#[test]
	fn remove_auto_generated_only_touches_the_project() {
		let dir = tempfile::tempdir().unwrap();
		let registry = GridRegistry::new(dir.path()).unwrap();
		registry
			.auto_generate_preset("EPSG:3006", [0.0, 0.0, 10.0, 10.0], "demo")
			.unwrap();
		registry
			.auto_generate_preset("EPSG:3006", [0.0, 0.0, 10.0, 10.0], "other")
			.unwrap();
		write_preset(dir.path(), "stock", "EPSG:3857");
		registry.reload().unwrap();

		assert_eq!(registry.remove_auto_generated("demo").unwrap(), 1);
		assert!(registry.get("epsg_3006_demo").is_none());
		assert!(registry.get("epsg_3006_other").is_some());
		assert!(registry.get("stock").is_some());
		assert!(!dir.path().join("epsg_3006_demo.json").exists());
	}
}
