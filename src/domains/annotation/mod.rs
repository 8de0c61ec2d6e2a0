pub mod repository;
pub mod service;
pub mod types;

pub use repository::{AnnotationRepository, SqliteAnnotationRepository};
pub use service::{AnnotationEngine, AnnotationEngineImpl};
pub use types::{Annotation, AnnotationGeometry, AnnotationKind};
