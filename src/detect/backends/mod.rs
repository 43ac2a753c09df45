pub mod stub;
pub mod yolo_cli;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use stub::{StubBackend, StubCalls};
pub use yolo_cli::YoloCliBackend;

#[cfg(feature = "backend-tract")]
pub use tract::TractBackend;
