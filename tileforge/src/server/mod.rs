//! The HTTP server: lifecycle, routing, handlers, CORS, error mapping.

mod cors;
mod routes;
mod tile_server;

pub mod error;
pub mod handlers;

pub use routes::build_router;
pub use tile_server::TileServer;
