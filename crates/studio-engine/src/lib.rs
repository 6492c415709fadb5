use std::path::PathBuf;

use studio_contracts::generation::DEFAULT_MODEL;

pub mod adapter;
pub mod artifacts;
pub mod controller;
pub mod gemini;
pub mod imaging;
pub mod settings;

pub use adapter::{ChunkStream, GenerationTransport, RequestAdapter, UploadedFile};
pub use controller::{InteractionController, Transformation};
pub use gemini::GeminiTransport;

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub api_base: String,
    pub model: String,
    /// Directory for per-request scratch files; the system temp dir when `None`.
    pub scratch_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            model: DEFAULT_MODEL.to_string(),
            scratch_dir: None,
        }
    }
}
