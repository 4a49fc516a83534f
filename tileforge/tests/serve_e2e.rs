//! End-to-end tests over a live HTTP server with a scripted renderer.

use std::{path::Path, sync::Arc, time::Duration};
use tempfile::TempDir;
use tileforge::{AppState, server::TileServer};
use tileforge_core::{
	Settings,
	grid::TileMatrixPreset,
	store::{CachePaths, IndexStore, ProjectLocks},
	types::{IndexEntry, ProjectId, ProjectIndex, TargetKind, TileFormat, TileScheme},
};

/// A stand-in renderer: batch jobs (carrying `output_dir`) emit the event
/// stream; single-tile jobs touch the requested `output_file`.
const SCRIPT: &str = r#"while IFS= read -r line; do
	case "$line" in
	*output_dir*)
		printf '{"debug":"start_generate","expected_total":4,"tile_crs":"EPSG:3857","scheme":"wmts"}\n'
		printf '{"progress":"tiles","total_generated":4,"expected_total":4}\n'
		printf '{"status":"completed"}\n'
		exit 0
		;;
	*)
		f=$(printf '%s' "$line" | sed -n 's/.*"output_file":"\([^"]*\)".*/\1/p')
		if [ -n "$f" ]; then mkdir -p "$(dirname "$f")" && : > "$f"; fi
		printf '{"status":"success"}\n'
		;;
	esac
done"#;

struct Harness {
	server: TileServer,
	host: String,
	root: TempDir,
}

impl Harness {
	async fn start() -> Harness {
		let root = tempfile::tempdir().unwrap();
		seed(root.path());

		let state = AppState::build(
			Arc::new(Settings::default()),
			root.path().join("cache"),
			root.path().join("projects"),
			root.path().join("presets"),
			vec!["sh".to_string(), "-c".to_string(), SCRIPT.to_string()],
			2,
		)
		.unwrap();

		let mut server = TileServer::new("127.0.0.1", 0, state, Vec::new());
		server.start().await.unwrap();
		let host = format!("http://127.0.0.1:{}", server.port());
		Harness { server, host, root }
	}

	async fn stop(mut self) {
		self.server.stop().await;
		self.server.state().pool.close().await;
	}
}

/// Seed one project `demo` with layer `orto` on a 1024×1024-unit grid.
fn seed(root: &Path) {
	std::fs::create_dir_all(root.join("projects")).unwrap();
	std::fs::write(root.join("projects/demo.qgs"), "<qgis/>").unwrap();

	std::fs::create_dir_all(root.join("presets")).unwrap();
	let preset = TileMatrixPreset::auto_generate("EPSG:3857", [0.0, 0.0, 1024.0, 1024.0], "seed").unwrap();
	let preset = TileMatrixPreset {
		id: "grid_a".to_string(),
		auto_generated: false,
		project_id: None,
		..preset
	};
	std::fs::write(
		root.join("presets/grid_a.json"),
		serde_json::to_string_pretty(&preset).unwrap(),
	)
	.unwrap();

	let paths = CachePaths::new(root.join("cache"));
	let store = IndexStore::new(paths.clone(), Arc::new(ProjectLocks::new()));
	let demo = ProjectId::parse("demo").unwrap();
	let mut index = ProjectIndex::skeleton(&demo);
	index.put(IndexEntry {
		name: "orto".to_string(),
		kind: TargetKind::Layer,
		scheme: TileScheme::Wmts,
		tile_crs: "EPSG:3857".to_string(),
		layer_crs: None,
		zoom_min: 0,
		zoom_max: 8,
		last_zoom_min: None,
		last_zoom_max: None,
		tile_format: TileFormat::Png,
		path: paths.target_dir(&demo, TargetKind::Layer, "orto"),
		tile_matrix_preset: Some("grid_a".to_string()),
		tile_matrix_set: None,
		extent: Some([0.0, 0.0, 1024.0, 1024.0]),
		extent_wgs84: None,
		progress: None,
		partial: false,
		bootstrap: false,
		generated: None,
		updated: None,
		last_request_at: None,
	});
	store.save(&demo, &mut index).unwrap();
}

#[tokio::test]
async fn tile_miss_renders_then_serves_from_cache() {
	let h = Harness::start().await;

	// the scripted renderer touches the file, so the first request already
	// resolves synchronously inside the request budget
	let url = format!("{}/wmts/demo/orto/5/15/10.png", h.host);
	let first = reqwest::get(&url).await.unwrap();
	assert_eq!(first.status(), 200);
	assert_eq!(first.headers()["content-type"], "image/png");

	let tile = h.root.path().join("cache/demo/orto/5/15/10.png");
	assert!(tile.is_file(), "tile landed in the cache layout");

	let second = reqwest::get(&url).await.unwrap();
	assert_eq!(second.status(), 200);
	h.stop().await;
}

#[tokio::test]
async fn rest_tile_validates_indices_and_bounds() {
	let h = Harness::start().await;

	// non-integer index
	let response = reqwest::get(format!(
		"{}/wmts/rest/demo/orto/default/grid_a/5/abc/10.png",
		h.host
	))
	.await
	.unwrap();
	assert_eq!(response.status(), 400);

	// out of bounds at z1 (2×2 matrix)
	let response = reqwest::get(format!("{}/wmts/rest/demo/orto/default/grid_a/1/0/7.png", h.host))
		.await
		.unwrap();
	assert_eq!(response.status(), 404);

	// wrong style
	let response = reqwest::get(format!(
		"{}/wmts/rest/demo/orto/fancy/grid_a/1/0/0.png",
		h.host
	))
	.await
	.unwrap();
	assert_eq!(response.status(), 400);
	h.stop().await;
}

#[tokio::test]
async fn kvp_get_tile_is_tolerant() {
	let h = Harness::start().await;

	// layer resolved by bare name, matrix by bare numeric identifier
	let url = format!(
		"{}/wmts?SERVICE=WMTS&REQUEST=GetTile&LAYER=orto&TileMatrix=2&TileRow=1&TileCol=1",
		h.host
	);
	let response = reqwest::get(&url).await.unwrap();
	assert_eq!(response.status(), 200);
	h.stop().await;
}

#[tokio::test]
async fn batch_job_lifecycle_over_http() {
	let h = Harness::start().await;
	let client = reqwest::Client::new();

	let started: serde_json::Value = client
		.post(format!("{}/generate-cache", h.host))
		.json(&serde_json::json!({
			"project": "demo",
			"layer": "orto",
			"zoomMin": 0,
			"zoomMax": 3,
		}))
		.send()
		.await
		.unwrap()
		.json()
		.await
		.unwrap();
	assert_eq!(started["status"], "started");
	assert_eq!(started["targetMode"], "layer");
	let job_id = started["id"].as_str().unwrap().to_string();

	// poll until terminal
	let mut status = String::new();
	for _ in 0..100 {
		let job: serde_json::Value = client
			.get(format!("{}/generate-cache/{job_id}", h.host))
			.send()
			.await
			.unwrap()
			.json()
			.await
			.unwrap();
		status = job["status"].as_str().unwrap_or("").to_string();
		if status != "running" {
			assert_eq!(job["exitCode"], 0);
			break;
		}
		tokio::time::sleep(Duration::from_millis(100)).await;
	}
	assert_eq!(status, "completed");

	// duplicate start finds nothing running any more
	let running: serde_json::Value = client
		.get(format!("{}/generate-cache/running", h.host))
		.send()
		.await
		.unwrap()
		.json()
		.await
		.unwrap();
	assert_eq!(running["jobs"].as_array().unwrap().len(), 0);

	// the index now records the run
	let index_text = std::fs::read_to_string(h.root.path().join("cache/demo/index.json")).unwrap();
	assert!(index_text.contains("\"lastZoomMax\": 3"));
	h.stop().await;
}

#[tokio::test]
async fn missing_target_is_a_400_with_machine_code() {
	let h = Harness::start().await;
	let response = reqwest::Client::new()
		.post(format!("{}/generate-cache", h.host))
		.json(&serde_json::json!({"project": "demo"}))
		.send()
		.await
		.unwrap();
	assert_eq!(response.status(), 400);
	let body: serde_json::Value = response.json().await.unwrap();
	assert_eq!(body["error"], "target_required");
	h.stop().await;
}

#[tokio::test]
async fn double_delete_returns_404_the_second_time() {
	let h = Harness::start().await;
	let client = reqwest::Client::new();

	// seed a tile so the layer has something on disk
	let tile_dir = h.root.path().join("cache/demo/orto/5/15");
	std::fs::create_dir_all(&tile_dir).unwrap();
	std::fs::write(tile_dir.join("10.png"), b"png").unwrap();

	let first = client
		.delete(format!("{}/cache/demo/orto", h.host))
		.send()
		.await
		.unwrap();
	assert_eq!(first.status(), 200);

	let second = client
		.delete(format!("{}/cache/demo/orto", h.host))
		.send()
		.await
		.unwrap();
	assert_eq!(second.status(), 404);
	h.stop().await;
}

#[tokio::test]
async fn capabilities_reflect_the_index_after_delete() {
	let h = Harness::start().await;
	let client = reqwest::Client::new();

	let before = client
		.get(format!("{}/wmts?SERVICE=WMTS&REQUEST=GetCapabilities&project=demo", h.host))
		.send()
		.await
		.unwrap()
		.text()
		.await
		.unwrap();
	assert!(before.contains("demo:orto"));
	assert!(before.contains("<TileMatrixSet>grid_a</TileMatrixSet>"));

	client
		.delete(format!("{}/cache/demo/orto?force=1", h.host))
		.send()
		.await
		.unwrap();

	let after = client
		.get(format!("{}/wmts?SERVICE=WMTS&REQUEST=GetCapabilities&project=demo", h.host))
		.send()
		.await
		.unwrap()
		.text()
		.await
		.unwrap();
	assert!(!after.contains("demo:orto"));
	assert!(!after.contains("<TileMatrixSet>grid_a</TileMatrixSet>"));
	h.stop().await;
}

#[tokio::test]
async fn config_patch_roundtrips_and_arms_schedules() {
	let h = Harness::start().await;
	let client = reqwest::Client::new();

	let patched: serde_json::Value = client
		.patch(format!("{}/projects/demo/config", h.host))
		.json(&serde_json::json!({
			"layers": {
				"orto": {
					"schedule": {
						"enabled": true,
						"mode": "weekly",
						"weekly": {"days": ["mon"], "time": "10:00"}
					}
				}
			}
		}))
		.send()
		.await
		.unwrap()
		.json()
		.await
		.unwrap();
	assert!(patched["layers"]["orto"]["schedule"]["nextRunAt"].is_string());

	// an empty patch changes nothing but the timestamp
	let reread: serde_json::Value = client
		.patch(format!("{}/projects/demo/config", h.host))
		.json(&serde_json::json!({}))
		.send()
		.await
		.unwrap()
		.json()
		.await
		.unwrap();
	assert_eq!(
		reread["layers"]["orto"]["schedule"]["weekly"]["days"],
		serde_json::json!(["mon"])
	);
	h.stop().await;
}
