//! Reading project files: CRS and extent detection.

mod detect;

pub use detect::*;
