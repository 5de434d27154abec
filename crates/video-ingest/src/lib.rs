//! Frame acquisition for the inspection station.
//!
//! A [`FrameSource`] hands over exactly one frame per call. Cameras and
//! network streams go through OpenCV (feature `opencv`); still images are
//! decoded with the `image` crate so the station can be exercised without a
//! camera attached.

#[cfg(feature = "opencv")]
pub mod camera;
pub mod source;
pub mod still;
pub mod types;

#[cfg(feature = "opencv")]
pub use camera::OpenCvFrameSource;
pub use source::{CapturePolicy, FrameSource, SourceKind, open_source, parse_device_index};
pub use still::{StillImageSource, load_frame};
pub use types::{CaptureError, Frame, FrameFormat};
