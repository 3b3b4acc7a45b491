//! rollcall-hw: webcam capture for the attendance scanner.
//!
//! Opens a V4L2 device and turns single captures into JPEG stills suitable
//! for upload to the verification service.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::Frame;
