pub mod config;
pub mod error;
pub mod inference;
pub mod metrics;
pub mod normalize;
pub mod panorama;
pub mod pipeline;
pub mod retry;
pub mod store;
pub mod taxonomy;

// Re-export commonly used types for easier testing
pub use crate::config::Config;
pub use crate::error::{ConfigError, InferenceError, PipelineError, StoreError};
pub use crate::inference::{DecodedImage, Detector, InferenceEngine, RawDetection, YoloDetector, YoloParams};
pub use crate::normalize::{to_normalized_xywh, PixelBox};
pub use crate::panorama::{Face, NewDetection, NormalizedBox, PanoramaInfo, StoredDetection};
pub use crate::pipeline::{PanoramaReport, Pipeline, PipelineSettings, SkipReason};
pub use crate::store::{PanoramaStore, SqliteStore};
pub use crate::taxonomy::{TaxonomyEntry, TaxonomyMapper};
