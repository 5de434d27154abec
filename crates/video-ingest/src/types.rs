use anyhow::Error;
use chrono::Utc;
use thiserror::Error;

/// Raw 3-channel frame captured from a video source.
///
/// Pixels are packed row-major from the top-left corner in the channel order
/// reported by `format`.
#[derive(Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: i32,
    pub height: i32,
    pub timestamp_ms: i64,
    pub format: FrameFormat,
}

impl Frame {
    /// Wrap a packed pixel buffer, stamping it with the current time.
    pub fn new(data: Vec<u8>, width: i32, height: i32, format: FrameFormat) -> Self {
        Self {
            data,
            width,
            height,
            timestamp_ms: Utc::now().timestamp_millis(),
            format,
        }
    }

    /// Number of bytes a well-formed frame of this size should carry.
    pub fn expected_len(&self) -> Option<usize> {
        if self.width <= 0 || self.height <= 0 {
            return None;
        }
        (self.width as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(self.format.channels())
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("timestamp_ms", &self.timestamp_ms)
            .field("format", &self.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    /// Channel order delivered by OpenCV capture backends.
    Bgr8,
    /// Channel order of decoded still images.
    Rgb8,
}

impl FrameFormat {
    pub fn channels(self) -> usize {
        3
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error("video source {uri:?} returned no frame")]
    Empty { uri: String },
    #[error(transparent)]
    Other(#[from] Error),
}
