//! CORS layer built from configured origin patterns.
//!
//! Accepted pattern forms: `*` (everything), `*suffix`, `prefix*`,
//! `/regex/`, or an exact origin string. Only the origin predicate is set;
//! methods and headers keep the tower-http defaults.

use anyhow::Result;
use axum::http::{header::HeaderValue, request::Parts};
use regex::Regex;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, CorsLayer};

enum OriginRule {
	Any,
	Suffix(String),
	Prefix(String),
	Pattern(Regex),
	Exact(String),
}

impl OriginRule {
	fn parse(pattern: &str) -> Result<OriginRule> {
		Ok(if pattern == "*" {
			OriginRule::Any
		} else if let Some(suffix) = pattern.strip_prefix('*') {
			OriginRule::Suffix(suffix.to_string())
		} else if let Some(prefix) = pattern.strip_suffix('*') {
			OriginRule::Prefix(prefix.to_string())
		} else if pattern.len() > 2 && pattern.starts_with('/') && pattern.ends_with('/') {
			OriginRule::Pattern(Regex::new(&pattern[1..pattern.len() - 1])?)
		} else {
			OriginRule::Exact(pattern.to_string())
		})
	}

	fn matches(&self, origin: &str) -> bool {
		match self {
			OriginRule::Any => true,
			OriginRule::Suffix(suffix) => origin.ends_with(suffix),
			OriginRule::Prefix(prefix) => origin.starts_with(prefix),
			OriginRule::Pattern(regex) => regex.is_match(origin),
			OriginRule::Exact(exact) => origin == exact,
		}
	}
}

pub fn build_cors_layer(allowed_origins: &[String], max_age_seconds: u64) -> Result<CorsLayer> {
	let rules: Vec<OriginRule> = allowed_origins.iter().map(|p| OriginRule::parse(p)).collect::<Result<_>>()?;

	Ok(
		CorsLayer::new()
			.allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _parts: &Parts| {
				let origin = origin.to_str().unwrap_or("");
				rules.iter().any(|rule| rule.matches(origin))
			}))
			.max_age(Duration::from_secs(max_age_seconds)),
	)
}

#[cfg(test)]
mod tests {
	use super::*;
	use axum::{
		Router,
		body::Body,
		http::{Request, header},
		routing::get,
	};
	use rstest::rstest;
	use tower::ServiceExt as _;

	async fn allowed(patterns: &[&str], origin: &str) -> bool {
		let layer = build_cors_layer(&patterns.iter().map(ToString::to_string).collect::<Vec<_>>(), 60).unwrap();
		let app = Router::new().route("/", get(|| async { "ok" })).layer(layer);
		let request = Request::builder()
			.uri("/")
			.header(header::ORIGIN, origin)
			.body(Body::empty())
			.unwrap();
		let response = app.oneshot(request).await.unwrap();
		response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_some()
	}

	#[rstest]
	#[case(&["*"], "https://anything.example", true)]
	#[case(&["https://maps.example.org"], "https://maps.example.org", true)]
	#[case(&["https://maps.example.org"], "https://other.example.org", false)]
	#[case(&["*.example.net"], "https://tiles.example.net", true)]
	#[case(&["https://example.com*"], "https://example.com:8080", true)]
	#[case(&["/^https://(foo|bar)\\.example$/"], "https://foo.example", true)]
	#[case(&["/^https://(foo|bar)\\.example$/"], "https://baz.example", false)]
	#[tokio::test]
	async fn origin_patterns(#[case] patterns: &[&str], #[case] origin: &str, #[case] expected: bool) {
		assert_eq!(allowed(patterns, origin).await, expected);
	}
}
