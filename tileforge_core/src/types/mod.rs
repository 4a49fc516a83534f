//! Semantic types shared across the workspace.

mod config;
mod index;
mod kinds;
mod project_id;
mod schedule;
mod target_key;
mod zoom_range;

pub use config::*;
pub use index::*;
pub use kinds::*;
pub use project_id::*;
pub use schedule::*;
pub use target_key::*;
pub use zoom_range::*;
