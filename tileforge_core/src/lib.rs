//! Core types and durable state for the tileforge tile server.
//!
//! This crate holds everything that does not touch HTTP or subprocesses:
//! semantic types (project ids, tile schemes, zoom ranges), the persisted
//! project index and configuration models with their stores, the tile-matrix
//! preset registry, schedule computation, and CRS/extent detection from
//! project files.

mod error;
mod settings;

pub mod grid;
pub mod project;
pub mod schedule;
pub mod store;
pub mod types;

pub use error::ApiError;
pub use settings::Settings;
