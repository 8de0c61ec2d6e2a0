pub mod repository;
pub mod service;
pub mod types;

pub use repository::{PhotoRepository, SqlitePhotoRepository};
pub use service::{CapturePipeline, CapturePipelineImpl};
pub use types::{
    CaptureEvent, CaptureMetadata, CaptureSource, CaptureSourceError, CapturedPhoto,
    CompressionSettings,
};
