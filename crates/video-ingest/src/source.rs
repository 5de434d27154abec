//! Frame source abstraction and URI dispatch.

use std::path::Path;

use crate::types::{CaptureError, Frame};

/// Something that can hand over one fresh frame on demand.
pub trait FrameSource: Send {
    fn capture(&mut self) -> Result<Frame, CaptureError>;

    /// URI or path the source reads from, for log messages.
    fn describe(&self) -> &str;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn capture(&mut self) -> Result<Frame, CaptureError> {
        (**self).capture()
    }

    fn describe(&self) -> &str {
        (**self).describe()
    }
}

/// How a streaming source manages its underlying capture handle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CapturePolicy {
    /// Open the stream, read a single frame, release it.
    #[default]
    PerCapture,
    /// Keep the stream open between captures and drain buffered frames
    /// before reading so the result is never older than the request.
    KeepOpen,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceKind {
    /// Local capture device addressed by index.
    Device(i32),
    /// Network stream or file understood by the capture backend.
    Stream,
    /// Still image file or directory of images.
    Still,
}

impl SourceKind {
    /// Infer the source kind from a URI.
    pub fn from_uri(uri: &str) -> Self {
        if let Some(index) = parse_device_index(uri) {
            return SourceKind::Device(index);
        }
        if uri.contains("://") {
            return SourceKind::Stream;
        }
        let path = Path::new(uri);
        if path.is_dir() || crate::still::is_image_path(path) {
            SourceKind::Still
        } else {
            SourceKind::Stream
        }
    }
}

/// Parse a `/dev/videoX` style URI and return the zero-based index if present.
pub fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return Some(index);
    }
    if let Some(stripped) = uri.strip_prefix("/dev/video") {
        if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(index) = stripped.parse::<i32>() {
                return Some(index);
            }
        }
    }
    None
}

/// Build the frame source matching `uri`.
///
/// Still images are always available; devices and streams need the `opencv`
/// feature.
pub fn open_source(uri: &str, policy: CapturePolicy) -> Result<Box<dyn FrameSource>, CaptureError> {
    match SourceKind::from_uri(uri) {
        SourceKind::Still => Ok(Box::new(crate::still::StillImageSource::new(uri)?)),
        #[cfg(feature = "opencv")]
        SourceKind::Device(_) | SourceKind::Stream => {
            Ok(Box::new(crate::camera::OpenCvFrameSource::new(uri, policy)))
        }
        #[cfg(not(feature = "opencv"))]
        SourceKind::Device(_) | SourceKind::Stream => {
            let _ = policy;
            Err(CaptureError::Other(anyhow::anyhow!(
                "camera source {uri:?} requires building with the `opencv` feature"
            )))
        }
    }
}
