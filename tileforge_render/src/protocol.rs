//! The renderer wire protocol.
//!
//! Jobs go to the worker as one UTF-8 JSON object per line on stdin. The
//! worker answers with JSON lines on stdout: any number of progress/debug
//! events and exactly one terminal result per job. Anything unparsable is
//! noise to be logged and skipped, never a protocol failure by itself.

use serde::Serialize;
use serde_json::{Value, json};

/// A job as written to a worker's stdin.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(transparent)]
pub struct WorkerJob(pub Value);

impl WorkerJob {
	pub fn from_value(value: Value) -> WorkerJob {
		WorkerJob(value)
	}

	/// One JSON line, newline terminated.
	pub fn to_line(&self) -> String {
		let mut line = self.0.to_string();
		line.push('\n');
		line
	}

	/// Default action: render a WMS-like map image to `output_file`.
	#[allow(clippy::too_many_arguments)]
	pub fn render_map(
		project_path: &str,
		output_file: &str,
		bbox: [f64; 4],
		width: u32,
		height: u32,
		crs: &str,
		layers: &[String],
		transparent: bool,
		format: &str,
	) -> WorkerJob {
		WorkerJob(json!({
			"project_path": project_path,
			"output_file": output_file,
			"bbox": bbox,
			"width": width,
			"height": height,
			"crs": crs,
			"layers": layers,
			"transparent": transparent,
			"format": format,
		}))
	}

	pub fn legend(project_path: &str, layer: &str, output_file: &str, format: &str, transparent: bool) -> WorkerJob {
		WorkerJob(json!({
			"action": "legend",
			"project_path": project_path,
			"layer": layer,
			"output_file": output_file,
			"format": format,
			"transparent": transparent,
		}))
	}

	#[allow(clippy::too_many_arguments)]
	pub fn feature_info(
		project_path: &str,
		crs: &str,
		bbox: [f64; 4],
		width: u32,
		height: u32,
		i: u32,
		j: u32,
		query_layers: &[String],
		feature_count: u64,
		info_format: &str,
	) -> WorkerJob {
		WorkerJob(json!({
			"action": "feature_info",
			"project_path": project_path,
			"crs": crs,
			"bbox": bbox,
			"width": width,
			"height": height,
			"i": i,
			"j": j,
			"query_layers": query_layers,
			"feature_count": feature_count,
			"info_format": info_format,
		}))
	}

	pub fn wfs(action: &str, project_path: &str, params: Value) -> WorkerJob {
		let mut payload = json!({
			"action": action,
			"project_path": project_path,
		});
		if let (Some(target), Value::Object(extra)) = (payload.as_object_mut(), params) {
			for (key, value) in extra {
				target.insert(key, value);
			}
		}
		WorkerJob(payload)
	}
}

/// The terminal result of one job.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerReply {
	pub status: String,
	pub body: Value,
}

impl WorkerReply {
	pub fn is_success(&self) -> bool {
		matches!(self.status.as_str(), "success" | "completed")
	}

	/// Machine code carried by an error reply, if any.
	pub fn error_code(&self) -> Option<&str> {
		self.body.get("code").and_then(Value::as_str)
	}

	pub fn message(&self) -> Option<&str> {
		self.body.get("message").and_then(Value::as_str)
	}
}

/// One parsed stdout line.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
	/// `{debug: "...", ...}`: out-of-band diagnostics, e.g. `start_generate`.
	Debug { name: String, body: Value },
	/// `{progress: "...", total_generated, expected_total, percent?, status?}`
	Progress {
		total_generated: Option<u64>,
		expected_total: Option<u64>,
		percent: Option<f64>,
		status: Option<String>,
		body: Value,
	},
	/// `{status: "...", ...}`: the terminal result.
	Terminal(WorkerReply),
	/// Anything that is not a JSON object.
	Noise(String),
}

/// Classify one stdout line.
///
/// Precedence: `debug` beats `progress` beats `status`, so progress events
/// that also carry a `status` field stay progress events.
pub fn parse_stdout_line(line: &str) -> WorkerEvent {
	let trimmed = line.trim();
	let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
		return WorkerEvent::Noise(trimmed.to_string());
	};
	let Some(object) = value.as_object() else {
		return WorkerEvent::Noise(trimmed.to_string());
	};

	if let Some(name) = object.get("debug").and_then(Value::as_str) {
		return WorkerEvent::Debug {
			name: name.to_string(),
			body: value.clone(),
		};
	}
	if object.contains_key("progress") {
		return WorkerEvent::Progress {
			total_generated: object.get("total_generated").and_then(Value::as_u64),
			expected_total: object.get("expected_total").and_then(Value::as_u64),
			percent: object.get("percent").and_then(Value::as_f64),
			status: object.get("status").and_then(Value::as_str).map(str::to_string),
			body: value.clone(),
		};
	}
	if let Some(status) = object.get("status").and_then(Value::as_str) {
		return WorkerEvent::Terminal(WorkerReply {
			status: status.to_string(),
			body: value.clone(),
		});
	}
	WorkerEvent::Noise(trimmed.to_string())
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	#[test]
	fn job_serializes_to_one_line() {
		let job = WorkerJob::legend("/p/demo.qgs", "orto", "/tmp/legend.png", "png", true);
		let line = job.to_line();
		assert!(line.ends_with('\n'));
		assert_eq!(line.matches('\n').count(), 1);
		let value: Value = serde_json::from_str(line.trim()).unwrap();
		assert_eq!(value["action"], "legend");
	}

	#[test]
	fn terminal_lines_are_detected() {
		let event = parse_stdout_line(r#"{"status":"success","output_file":"/tmp/t.png"}"#);
		match event {
			WorkerEvent::Terminal(reply) => {
				assert!(reply.is_success());
				assert_eq!(reply.body["output_file"], "/tmp/t.png");
			}
			other => panic!("expected terminal, got {other:?}"),
		}
	}

	#[test]
	fn progress_with_status_stays_progress() {
		let event = parse_stdout_line(r#"{"progress":"tiles","total_generated":10,"expected_total":100,"status":"running"}"#);
		match event {
			WorkerEvent::Progress {
				total_generated,
				expected_total,
				percent,
				status,
				..
			} => {
				assert_eq!(total_generated, Some(10));
				assert_eq!(expected_total, Some(100));
				assert_eq!(percent, None);
				assert_eq!(status.as_deref(), Some("running"));
			}
			other => panic!("expected progress, got {other:?}"),
		}
	}

	#[test]
	fn debug_beats_everything() {
		let event = parse_stdout_line(r#"{"debug":"start_generate","status":"running","expected_total":4}"#);
		match event {
			WorkerEvent::Debug { name, body } => {
				assert_eq!(name, "start_generate");
				assert_eq!(body["expected_total"], 4);
			}
			other => panic!("expected debug, got {other:?}"),
		}
	}

	#[test]
	fn garbage_is_noise_not_an_error() {
		assert_eq!(
			parse_stdout_line("QStandardPaths: wrong permissions"),
			WorkerEvent::Noise("QStandardPaths: wrong permissions".to_string())
		);
		assert_eq!(parse_stdout_line("[1,2,3]"), WorkerEvent::Noise("[1,2,3]".to_string()));
	}

	#[test]
	fn error_reply_exposes_code_and_message() {
		let event = parse_stdout_line(r#"{"status":"error","code":"layer_not_found","message":"no such layer"}"#);
		let WorkerEvent::Terminal(reply) = event else {
			panic!()
		};
		assert!(!reply.is_success());
		assert_eq!(reply.error_code(), Some("layer_not_found"));
		assert_eq!(reply.message(), Some("no such layer"));
	}
}
