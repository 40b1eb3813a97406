//! Provider Implementations
//!
//! Concrete adapters for the hosted and local generation backends.

mod http;
#[cfg(test)]
mod stub_server;

pub mod chatterbox;
pub mod fal;
pub mod huggingface;

pub use chatterbox::ChatterboxProvider;
pub use fal::FalProvider;
pub use huggingface::HuggingFaceProvider;
