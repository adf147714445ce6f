pub mod control;
pub mod device_light;
pub mod extractor_client;
pub mod protocol;

pub use control::{ControlRequest, ControlResponse, ControlServer};
pub use device_light::HttpIllumination;
pub use extractor_client::HttpFeatureExtractor;
