//! OpenCV-backed single-frame capture.

use opencv::{
    core::MatTraitConstManual,
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait},
};
use tracing::{debug, warn};

use crate::{
    source::{CapturePolicy, FrameSource, parse_device_index},
    types::{CaptureError, Frame, FrameFormat},
};

/// Frames grabbed and thrown away before a keep-open read, so the returned
/// frame is not one that sat in the backend buffer since the last trigger.
const KEEP_OPEN_FLUSH_GRABS: usize = 4;

pub struct OpenCvFrameSource {
    uri: String,
    policy: CapturePolicy,
    capture: Option<VideoCapture>,
    frame: Mat,
}

impl OpenCvFrameSource {
    /// The stream is opened lazily on the first capture.
    pub fn new(uri: &str, policy: CapturePolicy) -> Self {
        Self {
            uri: uri.to_string(),
            policy,
            capture: None,
            frame: Mat::default(),
        }
    }

    fn read_one(&mut self) -> Result<Frame, CaptureError> {
        let cap = match self.capture.take() {
            Some(cap) => cap,
            None => {
                let mut cap = open_video_capture(&self.uri)?;
                configure_camera(&mut cap);
                cap
            }
        };
        let cap = self.capture.insert(cap);

        if self.policy == CapturePolicy::KeepOpen {
            for _ in 0..KEEP_OPEN_FLUSH_GRABS {
                if !cap.grab().map_err(|e| CaptureError::Other(e.into()))? {
                    break;
                }
            }
        }

        let ok = cap
            .read(&mut self.frame)
            .map_err(|e| CaptureError::Other(e.into()))?;
        let size = self
            .frame
            .size()
            .map_err(|e| CaptureError::Other(e.into()))?;
        if !ok || size.width <= 0 || size.height <= 0 {
            return Err(CaptureError::Empty {
                uri: self.uri.clone(),
            });
        }
        if self.frame.channels() != 3 {
            return Err(CaptureError::Other(anyhow::anyhow!(
                "expected a 3-channel frame from {:?}, got {} channel(s)",
                self.uri,
                self.frame.channels()
            )));
        }

        let data = self
            .frame
            .data_bytes()
            .map_err(|e| CaptureError::Other(e.into()))?
            .to_vec();

        Ok(Frame::new(data, size.width, size.height, FrameFormat::Bgr8))
    }

    fn release(&mut self) {
        if let Some(mut cap) = self.capture.take() {
            if let Err(err) = cap.release() {
                warn!("video-ingest: failed to release {}: {err}", self.uri);
            }
        }
    }
}

impl FrameSource for OpenCvFrameSource {
    fn capture(&mut self) -> Result<Frame, CaptureError> {
        let result = self.read_one();
        match (self.policy, &result) {
            (CapturePolicy::PerCapture, _) => self.release(),
            (CapturePolicy::KeepOpen, Err(err)) => {
                debug!("video-ingest: dropping stream {} after error: {err}", self.uri);
                self.release();
            }
            (CapturePolicy::KeepOpen, Ok(_)) => {}
        }
        result
    }

    fn describe(&self) -> &str {
        &self.uri
    }
}

impl Drop for OpenCvFrameSource {
    fn drop(&mut self) {
        self.release();
    }
}

/// Attempt to open a camera input either by index or URI.
fn open_video_capture(uri: &str) -> Result<VideoCapture, CaptureError> {
    if let Some(index) = parse_device_index(uri) {
        for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
            match VideoCapture::new(index, backend) {
                Ok(cap) => {
                    if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                        return Ok(cap);
                    }
                }
                Err(err) => {
                    warn!("video-ingest: failed to open device #{index} with backend {backend}: {err}");
                }
            }
        }
    }

    match VideoCapture::from_file(uri, videoio::CAP_ANY) {
        Ok(cap) => {
            if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                return Ok(cap);
            }
        }
        Err(err) => {
            warn!("video-ingest: failed to open {uri}: {err}");
        }
    }

    Err(CaptureError::Open {
        uri: uri.to_string(),
    })
}

/// Keep the backend queue short; trigger-paced reads want the newest frame.
fn configure_camera(cap: &mut VideoCapture) {
    let _ = cap.set(videoio::CAP_PROP_BUFFERSIZE, 1.0);
}
