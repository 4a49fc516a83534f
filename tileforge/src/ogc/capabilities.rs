//! WMTS and WMS GetCapabilities documents.
//!
//! Thin serializers: everything they advertise comes from the inventory,
//! which in turn mirrors the per-project `index.json` files. A layer that
//! left the index disappears from the documents on the next request, and
//! tile-matrix sets are emitted only when a surviving layer references
//! them.

use crate::inventory::{Inventory, InventoryLayer};
use anyhow::Result;
use quick_xml::{
	Writer,
	events::{BytesDecl, Event},
};
use std::io::Cursor;
use std::sync::Arc;
use tileforge_core::grid::{GridRegistry, TileMatrixPreset};

const WMTS_NS: &str = "http://www.opengis.net/wmts/1.0";
const OWS_NS: &str = "http://www.opengis.net/ows/1.1";

/// The WMTS capabilities document for the given inventory.
pub fn wmts_capabilities(inventory: &Inventory, grids: &Arc<GridRegistry>, base_url: &str) -> Result<String> {
	let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
	writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

	writer
		.create_element("Capabilities")
		.with_attributes([
			("xmlns", WMTS_NS),
			("xmlns:ows", OWS_NS),
			("version", "1.0.0"),
		])
		.write_inner_content(|writer| {
			writer
				.create_element("ows:ServiceIdentification")
				.write_inner_content(|writer| {
					text(writer, "ows:Title", "tileforge")?;
					text(writer, "ows:ServiceType", "OGC WMTS")?;
					text(writer, "ows:ServiceTypeVersion", "1.0.0")
				})?;
			writer.create_element("Contents").write_inner_content(|writer| {
				for layer in &inventory.layers {
					write_wmts_layer(writer, layer, base_url)?;
				}
				for set_id in inventory.referenced_set_ids() {
					if let Some(preset) = grids.get(&set_id) {
						write_tile_matrix_set(writer, &preset)?;
					}
				}
				Ok(())
			})?;
			Ok(())
		})?;

	Ok(String::from_utf8(writer.into_inner().into_inner())?)
}

fn write_wmts_layer<W: std::io::Write>(
	writer: &mut Writer<W>,
	layer: &InventoryLayer,
	base_url: &str,
) -> std::io::Result<()> {
	writer.create_element("Layer").write_inner_content(|writer| {
		text(writer, "ows:Title", &layer.entry.name)?;
		text(writer, "ows:Identifier", &layer.identifier)?;

		if let Some(bbox) = layer.entry.extent_wgs84 {
			writer
				.create_element("ows:WGS84BoundingBox")
				.write_inner_content(|writer| {
					text(writer, "ows:LowerCorner", &format!("{} {}", bbox[0], bbox[1]))?;
					text(writer, "ows:UpperCorner", &format!("{} {}", bbox[2], bbox[3]))
				})?;
		}
		if let Some(bbox) = layer.entry.extent {
			writer
				.create_element("ows:BoundingBox")
				.with_attribute(("crs", layer.entry.tile_crs.as_str()))
				.write_inner_content(|writer| {
					text(writer, "ows:LowerCorner", &format!("{} {}", bbox[0], bbox[1]))?;
					text(writer, "ows:UpperCorner", &format!("{} {}", bbox[2], bbox[3]))
				})?;
		}

		writer
			.create_element("Style")
			.with_attribute(("isDefault", "true"))
			.write_inner_content(|writer| text(writer, "ows:Identifier", "default"))?;
		text(writer, "Format", layer.entry.tile_format.mime())?;
		writer
			.create_element("TileMatrixSetLink")
			.write_inner_content(|writer| text(writer, "TileMatrixSet", &layer.set_id))?;

		let template = format!(
			"{base_url}/wmts/rest/{}/{}/default/{}/{{TileMatrix}}/{{TileRow}}/{{TileCol}}.{}",
			layer.project,
			layer.entry.name,
			layer.set_id,
			layer.entry.tile_format.extension(),
		);
		writer
			.create_element("ResourceURL")
			.with_attributes([
				("format", layer.entry.tile_format.mime()),
				("resourceType", "tile"),
				("template", template.as_str()),
			])
			.write_empty()?;
		Ok(())
	})?;
	Ok(())
}

fn write_tile_matrix_set<W: std::io::Write>(writer: &mut Writer<W>, preset: &TileMatrixPreset) -> std::io::Result<()> {
	writer.create_element("TileMatrixSet").write_inner_content(|writer| {
		text(writer, "ows:Identifier", &preset.id)?;
		if let Some(crs) = preset.supported_crs.first() {
			text(writer, "ows:SupportedCRS", crs)?;
		}
		for matrix in &preset.matrices {
			writer.create_element("TileMatrix").write_inner_content(|writer| {
				text(writer, "ows:Identifier", &matrix.identifier)?;
				text(writer, "ScaleDenominator", &matrix.scale_denominator.to_string())?;
				let origin = matrix.top_left.unwrap_or(preset.top_left_corner);
				text(writer, "TopLeftCorner", &format!("{} {}", origin[0], origin[1]))?;
				text(
					writer,
					"TileWidth",
					&matrix.tile_width.unwrap_or(preset.tile_width).to_string(),
				)?;
				text(
					writer,
					"TileHeight",
					&matrix.tile_height.unwrap_or(preset.tile_height).to_string(),
				)?;
				text(writer, "MatrixWidth", &matrix.matrix_width.to_string())?;
				text(writer, "MatrixHeight", &matrix.matrix_height.to_string())
			})?;
		}
		Ok(())
	})?;
	Ok(())
}

/// The WMS capabilities document for the given inventory.
pub fn wms_capabilities(inventory: &Inventory, base_url: &str) -> Result<String> {
	let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
	writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

	writer
		.create_element("WMS_Capabilities")
		.with_attributes([("xmlns", "http://www.opengis.net/wms"), ("version", "1.3.0")])
		.write_inner_content(|writer| {
			writer.create_element("Service").write_inner_content(|writer| {
				text(writer, "Name", "WMS")?;
				text(writer, "Title", "tileforge")
			})?;
			writer.create_element("Capability").write_inner_content(|writer| {
				writer.create_element("Request").write_inner_content(|writer| {
					for operation in ["GetCapabilities", "GetMap", "GetFeatureInfo", "GetLegendGraphic"] {
						writer.create_element(operation).write_inner_content(|writer| {
							text(writer, "Format", "image/png")?;
							text(writer, "OnlineResource", &format!("{base_url}/wms"))
						})?;
					}
					Ok(())
				})?;
				writer.create_element("Layer").write_inner_content(|writer| {
					text(writer, "Title", "tileforge")?;
					for layer in &inventory.layers {
						writer.create_element("Layer").with_attribute(("queryable", "1")).write_inner_content(
							|writer| {
								text(writer, "Name", &layer.identifier)?;
								text(writer, "Title", &layer.entry.name)?;
								text(writer, "CRS", &layer.entry.tile_crs)?;
								if let Some(bbox) = layer.entry.extent_wgs84 {
									writer
										.create_element("EX_GeographicBoundingBox")
										.write_inner_content(|writer| {
											text(writer, "westBoundLongitude", &bbox[0].to_string())?;
											text(writer, "eastBoundLongitude", &bbox[2].to_string())?;
											text(writer, "southBoundLatitude", &bbox[1].to_string())?;
											text(writer, "northBoundLatitude", &bbox[3].to_string())
										})?;
								}
								if let Some(bbox) = layer.entry.extent {
									writer
										.create_element("BoundingBox")
										.with_attributes([
											("CRS", layer.entry.tile_crs.as_str()),
											("minx", bbox[0].to_string().as_str()),
											("miny", bbox[1].to_string().as_str()),
											("maxx", bbox[2].to_string().as_str()),
											("maxy", bbox[3].to_string().as_str()),
										])
										.write_empty()?;
								}
								Ok(())
							},
						)?;
					}
					Ok(())
				})?;
				Ok(())
			})?;
			Ok(())
		})?;

	Ok(String::from_utf8(writer.into_inner().into_inner())?)
}

fn text<W: std::io::Write>(writer: &mut Writer<W>, name: &str, value: &str) -> std::io::Result<()> {
	writer
		.create_element(name)
		.write_text_content(quick_xml::events::BytesText::new(value))?;
	Ok(())
}
