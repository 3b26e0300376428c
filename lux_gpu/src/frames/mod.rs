mod camera;
mod orchestrator;

pub use camera::CameraConstants;
pub use orchestrator::{FrameOrchestrator, FrameResources, RecordWriter};
