//! kspy-hw: camera capture for live recognition.
//!
//! Provides V4L2-based camera access with frames converted to RGB.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, FrameStream, PixelFormat};
pub use frame::{Frame, FrameError};
