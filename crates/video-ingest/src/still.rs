//! Replay of still images as a frame source.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use tracing::debug;

use crate::{
    source::FrameSource,
    types::{CaptureError, Frame, FrameFormat},
};

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

/// Serves frames decoded from a single image or, cyclically, from every image
/// in a directory sorted by file name.
pub struct StillImageSource {
    uri: String,
    paths: Vec<PathBuf>,
    next: usize,
}

impl StillImageSource {
    pub fn new(uri: &str) -> Result<Self, CaptureError> {
        let root = Path::new(uri);
        let mut paths = if root.is_dir() {
            fs::read_dir(root)
                .with_context(|| format!("failed to list {}", root.display()))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|path| path.is_file() && is_image_path(path))
                .collect::<Vec<_>>()
        } else if root.is_file() {
            vec![root.to_path_buf()]
        } else {
            Vec::new()
        };
        paths.sort();

        if paths.is_empty() {
            return Err(CaptureError::Open {
                uri: uri.to_string(),
            });
        }

        debug!("still source {uri}: {} image(s)", paths.len());
        Ok(Self {
            uri: uri.to_string(),
            paths,
            next: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl FrameSource for StillImageSource {
    fn capture(&mut self) -> Result<Frame, CaptureError> {
        let path = &self.paths[self.next];
        self.next = (self.next + 1) % self.paths.len();
        load_frame(path)
    }

    fn describe(&self) -> &str {
        &self.uri
    }
}

/// Decode an image file into an RGB frame.
pub fn load_frame(path: &Path) -> Result<Frame, CaptureError> {
    let image = image::open(path)
        .with_context(|| format!("failed to decode {}", path.display()))?
        .to_rgb8();
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(CaptureError::Empty {
            uri: path.display().to_string(),
        });
    }
    Ok(Frame::new(
        image.into_raw(),
        width as i32,
        height as i32,
        FrameFormat::Rgb8,
    ))
}

pub(crate) fn is_image_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}
