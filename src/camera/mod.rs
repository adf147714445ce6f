pub mod v4l2;

pub use v4l2::{list_all_cameras, CameraInfo, V4l2FrameSource};

use crate::common::Result;
use crate::core::types::{CameraId, Frame};

#[derive(Debug, Clone)]
pub enum FramePoll {
    Ready(Frame),
    /// Nothing decodable has arrived yet; ask again next tick.
    Pending,
}

/// Latest-frame access for every configured camera.
pub trait FrameSource: Send + Sync {
    fn current_frame(&self, camera: &CameraId) -> Result<FramePoll>;
}
