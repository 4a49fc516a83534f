//! HTTP handlers for the OGC and admin surfaces.

pub mod admin;
pub mod wfs;
pub mod wms;
pub mod wmts;

use axum::{
	body::Body,
	http::{StatusCode, header},
	response::Response,
};
use std::collections::HashMap;
use std::path::Path;

/// KVP parameter lookup is case-insensitive per OGC; keys are folded once.
pub struct Kvp(HashMap<String, String>);

impl Kvp {
	pub fn new(raw: HashMap<String, String>) -> Kvp {
		Kvp(raw.into_iter().map(|(k, v)| (k.to_ascii_lowercase(), v)).collect())
	}

	pub fn get(&self, key: &str) -> Option<&str> {
		self.0.get(key).map(String::as_str)
	}

	pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
		self.get(key).unwrap_or(default)
	}
}

/// Stream a cached artifact from disk.
pub async fn serve_file(path: &Path, mime: &str) -> Response {
	match tokio::fs::read(path).await {
		Ok(bytes) => Response::builder()
			.status(StatusCode::OK)
			.header(header::CONTENT_TYPE, mime)
			.header(header::CONTENT_LENGTH, bytes.len())
			.body(Body::from(bytes))
			.expect("file response builds"),
		Err(err) => {
			log::warn!("serving {} failed: {err}", path.display());
			plain_404()
		}
	}
}

pub fn xml_response(xml: String) -> Response {
	Response::builder()
		.status(StatusCode::OK)
		.header(header::CONTENT_TYPE, "text/xml; charset=utf-8")
		.body(Body::from(xml))
		.expect("xml response builds")
}

/// Plain 404 for tile misses that carry no machine code.
pub fn plain_404() -> Response {
	Response::builder()
		.status(StatusCode::NOT_FOUND)
		.header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
		.body(Body::from("Not Found"))
		.expect("static response builds")
}

pub fn plain_400(message: &str) -> Response {
	Response::builder()
		.status(StatusCode::BAD_REQUEST)
		.header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
		.body(Body::from(message.to_string()))
		.expect("static response builds")
}
