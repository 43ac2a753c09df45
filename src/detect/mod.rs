mod backend;
pub mod backends;
mod labels;
mod registry;
mod result;

pub use backend::{
    DatasetSplit, DetectionCapability, DetectorBackend, PredictConfig, ValidationConfig,
};
pub use backends::{StubBackend, StubCalls, YoloCliBackend};
pub use labels::ClassNames;
pub use registry::BackendRegistry;
pub use result::{Detection, Prediction, ValidationMetrics};
