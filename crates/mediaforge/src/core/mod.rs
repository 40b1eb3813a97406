//! Mediaforge Core Engine
//!
//! Media values, role resolution, lineage tracking, provider/model contracts
//! and the registries that route work to providers.

pub mod discovery;
pub mod ffmpeg;
pub mod fs;
pub mod generative;
pub mod lineage;
pub mod media;
pub mod project;
pub mod roles;
pub mod settings;

// Re-export common types
mod types;
pub use types::*;

mod error;
pub use error::*;

#[cfg(test)]
mod tests_lineage;
