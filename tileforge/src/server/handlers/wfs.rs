//! WFS dispatch: all operations delegate to the renderer worker, which is
//! the only component that can read the project's vector layers. The
//! handlers validate, cap feature counts, and translate replies; only
//! `Transaction` is admin-gated.

use super::{Kvp, plain_400, xml_response};
use crate::access::AccessAction;
use crate::server::error::{HttpError, HttpResult};
use crate::state::AppState;
use anyhow::Result;
use axum::{
	body::Body,
	extract::{Query, State},
	http::{StatusCode, header},
	response::Response,
};
use quick_xml::{
	Writer,
	events::{BytesDecl, BytesText, Event},
};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::io::Cursor;
use tileforge_core::{ApiError, types::ProjectId};
use tileforge_render::WorkerJob;

pub async fn get(State(state): State<AppState>, Query(raw): Query<HashMap<String, String>>) -> HttpResult<Response> {
	let kvp = Kvp::new(raw);
	dispatch(&state, &kvp, None).await
}

pub async fn post(
	State(state): State<AppState>,
	Query(raw): Query<HashMap<String, String>>,
	body: String,
) -> HttpResult<Response> {
	let kvp = Kvp::new(raw);
	dispatch(&state, &kvp, Some(body)).await
}

async fn dispatch(state: &AppState, kvp: &Kvp, body: Option<String>) -> HttpResult<Response> {
	let project = resolve_project(state, kvp)?;
	let project_path = state.manager.resolve_project_file(&project)?;
	let project_path = project_path.to_string_lossy().to_string();

	// POST bodies may carry the operation instead of the query string
	let request = kvp
		.get("request")
		.map(str::to_ascii_lowercase)
		.or_else(|| body.as_deref().and_then(request_from_body))
		.unwrap_or_else(|| "getcapabilities".to_string());

	match request.as_str() {
		"getcapabilities" => {
			let reply = run(state, WorkerJob::wfs("wfs_list", &project_path, json!({}))).await?;
			let type_names: Vec<String> = reply
				.get("layers")
				.or_else(|| reply.get("feature_types"))
				.and_then(Value::as_array)
				.map(|items| {
					items
						.iter()
						.filter_map(|item| {
							item
								.as_str()
								.map(str::to_string)
								.or_else(|| item.get("name").and_then(Value::as_str).map(str::to_string))
						})
						.collect()
				})
				.unwrap_or_default();
			let xml = capabilities_xml(&project, &type_names, state.settings.wfs_capabilities_count_default)?;
			Ok(xml_response(xml))
		}
		"describefeaturetype" => {
			let type_name = kvp.get("typename").or_else(|| kvp.get("typenames")).unwrap_or("");
			let reply = run(
				state,
				WorkerJob::wfs("wfs_describe", &project_path, json!({"type_name": type_name})),
			)
			.await?;
			Ok(reply_response(&reply))
		}
		"getfeature" => {
			let type_name = kvp.get("typename").or_else(|| kvp.get("typenames")).unwrap_or("");
			if type_name.is_empty() {
				return Ok(plain_400("TYPENAME is required"));
			}
			let count: u64 = kvp
				.get("count")
				.or_else(|| kvp.get("maxfeatures"))
				.and_then(|v| v.parse().ok())
				.unwrap_or(state.settings.wfs_default_max_features)
				.min(state.settings.wfs_max_features_limit);

			let mut params = json!({
				"type_name": type_name,
				"count": count,
			});
			if let Some(bbox) = kvp.get("bbox") {
				params["bbox"] = json!(bbox);
			}
			if let Some(srs) = kvp.get("srsname") {
				params["srs_name"] = json!(srs);
			}
			if let Some(output) = kvp.get("outputformat") {
				params["output_format"] = json!(output);
			}
			let reply = run(state, WorkerJob::wfs("wfs_get_feature", &project_path, params)).await?;
			Ok(reply_response(&reply))
		}
		"transaction" => {
			state.require(&AccessAction::Admin)?;
			let Some(body) = body else {
				return Ok(plain_400("Transaction requires a request body"));
			};
			let reply = run(state, WorkerJob::wfs("wfs_transaction", &project_path, json!({"body": body}))).await?;
			Ok(reply_response(&reply))
		}
		other => Ok(plain_400(&format!("unsupported WFS request '{other}'"))),
	}
}

fn resolve_project(state: &AppState, kvp: &Kvp) -> Result<ProjectId, HttpError> {
	let value = kvp
		.get("project")
		.or_else(|| kvp.get("map"))
		.ok_or(ApiError::ProjectIdRequired)?;
	let project = ProjectId::parse(value).ok_or_else(|| ApiError::ProjectNotFound(value.to_string()))?;
	state.require(&AccessAction::ProjectRead(project.clone()))?;
	Ok(project)
}

async fn run(state: &AppState, job: WorkerJob) -> Result<Value, HttpError> {
	let reply = state.pool.run(job).await?;
	if reply.is_success() {
		Ok(reply.body)
	} else {
		Err(HttpError(ApiError::RenderFailed(format!(
			"{}: {}",
			reply.error_code().unwrap_or("wfs_error"),
			reply.message().unwrap_or("worker reported an error"),
		))))
	}
}

/// Workers answer with either structured `data` (JSON) or raw `text`
/// (XML/GML); pass whichever through.
fn reply_response(reply: &Value) -> Response {
	if let Some(data) = reply.get("data") {
		return Response::builder()
			.status(StatusCode::OK)
			.header(header::CONTENT_TYPE, "application/json")
			.body(Body::from(data.to_string()))
			.expect("json response builds");
	}
	let text = reply.get("text").and_then(Value::as_str).unwrap_or("");
	Response::builder()
		.status(StatusCode::OK)
		.header(header::CONTENT_TYPE, "text/xml; charset=utf-8")
		.body(Body::from(text.to_string()))
		.expect("xml response builds")
}

fn request_from_body(body: &str) -> Option<String> {
	let head = &body[..body.len().min(512)];
	for operation in ["Transaction", "GetFeature", "DescribeFeatureType", "GetCapabilities"] {
		if head.contains(&format!("<{operation}")) || head.contains(&format!(":{operation}")) {
			return Some(operation.to_ascii_lowercase());
		}
	}
	None
}

/// Feature-type names come from the renderer's reply, i.e. arbitrary
/// project data; the writer escapes them.
fn capabilities_xml(project: &ProjectId, type_names: &[String], count_default: u64) -> Result<String> {
	let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
	writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

	writer
		.create_element("wfs:WFS_Capabilities")
		.with_attributes([
			("xmlns:wfs", "http://www.opengis.net/wfs/2.0"),
			("xmlns:ows", "http://www.opengis.net/ows/1.1"),
			("version", "2.0.0"),
		])
		.write_inner_content(|writer| {
			writer
				.create_element("ows:ServiceIdentification")
				.write_inner_content(|writer| text(writer, "ows:Title", project.as_str()))?;
			writer
				.create_element("ows:OperationsMetadata")
				.write_inner_content(|writer| {
					writer
						.create_element("ows:Constraint")
						.with_attribute(("name", "CountDefault"))
						.write_inner_content(|writer| text(writer, "ows:DefaultValue", &count_default.to_string()))?;
					Ok(())
				})?;
			writer.create_element("FeatureTypeList").write_inner_content(|writer| {
				for name in type_names {
					writer
						.create_element("FeatureType")
						.write_inner_content(|writer| text(writer, "Name", name))?;
				}
				Ok(())
			})?;
			Ok(())
		})?;

	Ok(String::from_utf8(writer.into_inner().into_inner())?)
}

fn text<W: std::io::Write>(writer: &mut Writer<W>, name: &str, value: &str) -> std::io::Result<()> {
	writer.create_element(name).write_text_content(BytesText::new(value))?;
	Ok(())
}
