//! Tile-matrix presets and the hot-reloading registry.

mod preset;
mod registry;

pub use preset::*;
pub use registry::*;
