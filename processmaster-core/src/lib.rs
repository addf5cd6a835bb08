pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod imaging;
pub mod models;
pub mod storage;
pub mod vision;

pub use api::{envelope, ApiResponse, ErrorBody};
pub use config::ProcessMasterConfig;
pub use error::CoreError;
pub use imaging::{normalize_screenshot, ImageError, NormalizedImage};
pub use storage::{LocalObjectStore, ObjectMeta, ObjectStore, SignedMethod, SignedUrl, StorageError};
pub use vision::{
    vision_backend, AiServiceError, AnthropicVisionClient, Coordinates, ScreenshotAnalysis,
    StepOutline, UnconfiguredVision, VisionBackend,
};
