//! Replay export: package a stored session as a standalone HTML artifact,
//! written locally or handed to a share backend.

pub mod artifact;
pub mod error;
pub mod exporter;

pub use artifact::{key_frames, ReplayArtifact, ServerInfo};
pub use error::ReplayError;
pub use exporter::{
    ExportConfig, ExportMode, Exporter, ShareBackend, ShareMeta, ShareResult,
};
