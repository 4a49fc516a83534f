//! tileforge: a self-hosted tile cache publishing geospatial projects as
//! WMTS, WMS and WFS endpoints.

pub mod access;
pub mod inventory;
pub mod ogc;
pub mod server;
pub mod state;

pub use state::AppState;
