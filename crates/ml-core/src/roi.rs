//! Region-of-interest extraction and normalisation.
//!
//! The camera looks at the belt sideways, so the object sits in a horizontal
//! strip through the middle of the frame. The extractor keeps a centred band,
//! cuts a centred square out of it, turns it upright and scales it down to the
//! classifier input size.

use image::{
    Rgb, RgbImage,
    imageops::{self, FilterType},
};
use thiserror::Error;
use video_ingest::{Frame, FrameFormat};

/// Fraction of the frame height kept by the vertical band crop.
pub const DEFAULT_BAND_RATIO: f64 = 0.7;
/// Edge length of the square classifier input.
pub const DEFAULT_INPUT_EDGE: u32 = 64;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum MalformedFrame {
    #[error("frame dimensions {width}x{height} are degenerate")]
    Dimensions { width: i32, height: i32 },
    #[error("frame buffer holds {actual} bytes, expected {expected}")]
    BufferSize { expected: usize, actual: usize },
    #[error("region of interest collapsed (band height {band_height}, square side {side})")]
    EmptyRegion { band_height: u32, side: u32 },
}

/// Crop geometry for a given frame size, in source pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    /// Height of the vertical band before the square step.
    pub band_height: u32,
    /// Left edge of the square.
    pub x: u32,
    /// Top edge of the square, centred on the frame's vertical midline.
    pub y: u32,
    /// Side of the square crop.
    pub side: u32,
}

/// Normalised model input: a batch of one `height x width x 3` RGB image
/// with values in `[0, 1]`, stored NHWC.
#[derive(Clone, Debug, PartialEq)]
pub struct InputTensor {
    data: Vec<f32>,
    height: usize,
    width: usize,
}

impl InputTensor {
    pub const CHANNELS: usize = 3;

    pub fn from_rgb(image: &RgbImage) -> Self {
        let (width, height) = image.dimensions();
        let data = image
            .as_raw()
            .iter()
            .map(|&value| f32::from(value) / 255.0)
            .collect();
        Self {
            data,
            height: height as usize,
            width: width as usize,
        }
    }

    /// `[batch, height, width, channels]`.
    pub fn shape(&self) -> [usize; 4] {
        [1, self.height, self.width, Self::CHANNELS]
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// RGB values at row `y`, column `x`, or `None` outside the tensor.
    pub fn pixel(&self, y: usize, x: usize) -> Option<[f32; 3]> {
        if y >= self.height || x >= self.width {
            return None;
        }
        let offset = (y * self.width + x) * Self::CHANNELS;
        let px = self.data.get(offset..offset + Self::CHANNELS)?;
        Some([px[0], px[1], px[2]])
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RegionExtractor {
    band_ratio: f64,
    input_width: u32,
    input_height: u32,
}

impl Default for RegionExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_INPUT_EDGE, DEFAULT_INPUT_EDGE)
    }
}

impl RegionExtractor {
    pub fn new(input_width: u32, input_height: u32) -> Self {
        Self {
            band_ratio: DEFAULT_BAND_RATIO,
            input_width,
            input_height,
        }
    }

    /// Override the fraction of the frame height kept by the band crop.
    /// Callers are expected to pass a value in `(0, 1]`.
    pub fn with_band_ratio(mut self, band_ratio: f64) -> Self {
        self.band_ratio = band_ratio;
        self
    }

    /// Classifier input size as `(width, height)`.
    pub fn input_size(&self) -> (u32, u32) {
        (self.input_width, self.input_height)
    }

    /// Compute the centred band and square for a `width x height` frame.
    pub fn region(&self, width: u32, height: u32) -> Result<Region, MalformedFrame> {
        let band_height = ((f64::from(height) * self.band_ratio).round() as u32).min(height);
        let side = band_height.min(width);
        if band_height == 0 || side == 0 {
            return Err(MalformedFrame::EmptyRegion { band_height, side });
        }
        Ok(Region {
            band_height,
            x: (width - side) / 2,
            y: (height - side) / 2,
            side,
        })
    }

    /// Crop, rotate, reorder channels and resize, returning the RGB image the
    /// classifier will see.
    pub fn extract_image(&self, frame: &Frame) -> Result<RgbImage, MalformedFrame> {
        if frame.width <= 0 || frame.height <= 0 {
            return Err(MalformedFrame::Dimensions {
                width: frame.width,
                height: frame.height,
            });
        }
        let expected = frame.expected_len().ok_or(MalformedFrame::Dimensions {
            width: frame.width,
            height: frame.height,
        })?;
        if frame.data.len() != expected {
            return Err(MalformedFrame::BufferSize {
                expected,
                actual: frame.data.len(),
            });
        }

        let width = frame.width as u32;
        let region = self.region(width, frame.height as u32)?;
        let stride = width as usize * 3;
        let swap = frame.format == FrameFormat::Bgr8;

        // Band and square crops collapse into a single copy of the square,
        // reordering channels on the way.
        let square = RgbImage::from_fn(region.side, region.side, |x, y| {
            let offset = (region.y + y) as usize * stride + (region.x + x) as usize * 3;
            let px = &frame.data[offset..offset + 3];
            if swap {
                Rgb([px[2], px[1], px[0]])
            } else {
                Rgb([px[0], px[1], px[2]])
            }
        });

        let upright = imageops::rotate90(&square);
        Ok(imageops::resize(
            &upright,
            self.input_width,
            self.input_height,
            FilterType::Triangle,
        ))
    }

    pub fn extract(&self, frame: &Frame) -> Result<InputTensor, MalformedFrame> {
        self.extract_image(frame)
            .map(|image| InputTensor::from_rgb(&image))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn patterned_frame(width: i32, height: i32, seed: u8, format: FrameFormat) -> Frame {
        let len = (width * height * 3) as usize;
        let data = (0..len)
            .map(|i| (i as u32).wrapping_mul(31).wrapping_add(seed as u32) as u8)
            .collect();
        Frame::new(data, width, height, format)
    }

    #[test]
    fn vga_frame_geometry() {
        let region = RegionExtractor::default().region(640, 480).unwrap();
        assert_eq!(region.band_height, 336);
        assert_eq!(region.side, 336);
        assert_eq!(region.x, 152);
        assert_eq!(region.y, 72);
    }

    #[test]
    fn vga_frame_produces_fixed_tensor() {
        let frame = patterned_frame(640, 480, 7, FrameFormat::Bgr8);
        let tensor = RegionExtractor::default().extract(&frame).unwrap();
        assert_eq!(tensor.shape(), [1, 64, 64, 3]);
        assert_eq!(tensor.as_slice().len(), 64 * 64 * 3);
        assert!(tensor.as_slice().iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn two_pixel_high_frame_keeps_single_row_band() {
        let extractor = RegionExtractor::default();
        let region = extractor.region(5, 2).unwrap();
        assert_eq!(region.band_height, 1);
        assert_eq!(region.side, 1);
        assert_eq!(region.x, 2);

        let mut frame = patterned_frame(5, 2, 0, FrameFormat::Rgb8);
        let offset = (region.y as usize * 5 + region.x as usize) * 3;
        frame.data[offset..offset + 3].copy_from_slice(&[255, 0, 51]);
        let tensor = extractor.extract(&frame).unwrap();
        assert_eq!(tensor.shape(), [1, 64, 64, 3]);
        assert_eq!(tensor.pixel(0, 0), Some([1.0, 0.0, 0.2]));
        assert_eq!(tensor.pixel(63, 63), Some([1.0, 0.0, 0.2]));
        assert_eq!(tensor.pixel(64, 0), None);
    }

    #[test]
    fn rotates_clockwise_and_swaps_bgr() {
        // Full-height band so the square is the whole 4x4 frame and the
        // resize is an identity.
        let extractor = RegionExtractor::new(4, 4).with_band_ratio(1.0);
        let mut frame = Frame::new(vec![0; 4 * 4 * 3], 4, 4, FrameFormat::Bgr8);
        // Bottom-left source pixel, pure red in BGR order.
        let offset = (3 * 4) * 3;
        frame.data[offset..offset + 3].copy_from_slice(&[0, 0, 255]);

        let tensor = extractor.extract(&frame).unwrap();
        assert_eq!(tensor.pixel(0, 0), Some([1.0, 0.0, 0.0]));
        assert_eq!(tensor.pixel(3, 3), Some([0.0, 0.0, 0.0]));
    }

    #[test]
    fn portrait_frame_square_is_vertically_centred() {
        let region = RegionExtractor::default().region(100, 400).unwrap();
        assert_eq!(region.band_height, 280);
        assert_eq!(region.side, 100);
        assert_eq!(region.x, 0);
        assert_eq!(region.y, 150);
        assert_eq!(region.y + region.side / 2, 200);
    }

    #[test]
    fn portrait_frame_crops_from_the_middle() {
        // Only the middle 10 rows of a 10x40 frame are white.
        let extractor = RegionExtractor::new(10, 10);
        let mut frame = Frame::new(vec![0; 10 * 40 * 3], 10, 40, FrameFormat::Rgb8);
        frame.data[15 * 10 * 3..25 * 10 * 3].fill(255);

        let tensor = extractor.extract(&frame).unwrap();
        assert!(tensor.as_slice().iter().all(|&v| v == 1.0));
    }

    #[test]
    fn rejects_degenerate_frames() {
        let extractor = RegionExtractor::default();
        let empty = Frame::new(Vec::new(), 0, 10, FrameFormat::Bgr8);
        assert_eq!(
            extractor.extract(&empty),
            Err(MalformedFrame::Dimensions {
                width: 0,
                height: 10
            })
        );

        let short = Frame::new(vec![0; 10], 4, 4, FrameFormat::Bgr8);
        assert_eq!(
            extractor.extract(&short),
            Err(MalformedFrame::BufferSize {
                expected: 48,
                actual: 10
            })
        );
    }

    #[test]
    fn collapsed_band_is_malformed() {
        let extractor = RegionExtractor::default().with_band_ratio(0.1);
        let frame = Frame::new(vec![0; 4 * 3 * 3], 4, 3, FrameFormat::Rgb8);
        assert_eq!(
            extractor.extract(&frame),
            Err(MalformedFrame::EmptyRegion {
                band_height: 0,
                side: 0
            })
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn tensor_shape_and_range_hold_for_any_frame(
            width in 2i32..320,
            height in 2i32..320,
            seed in any::<u8>(),
        ) {
            let frame = patterned_frame(width, height, seed, FrameFormat::Bgr8);
            let extractor = RegionExtractor::default();
            let tensor = extractor.extract(&frame).unwrap();
            prop_assert_eq!(tensor.shape(), [1, 64, 64, 3]);
            prop_assert!(tensor.as_slice().iter().all(|v| (0.0..=1.0).contains(v)));

            let again = extractor.extract(&frame).unwrap();
            prop_assert_eq!(
                tensor.as_slice().iter().map(|v| v.to_bits()).collect::<Vec<_>>(),
                again.as_slice().iter().map(|v| v.to_bits()).collect::<Vec<_>>()
            );
        }

        #[test]
        fn square_is_centred_and_fits(width in 1u32..4000, height in 1u32..4000) {
            let extractor = RegionExtractor::default();
            let band = (f64::from(height) * DEFAULT_BAND_RATIO).round() as u32;
            prop_assume!(band.min(width) >= 1);

            let region = extractor.region(width, height).unwrap();
            prop_assert_eq!(region.band_height, band);
            prop_assert_eq!(region.side, band.min(width));
            prop_assert!(region.x + region.side <= width);
            prop_assert!(region.y + region.side <= height);
            prop_assert_eq!(region.x, (width - region.side) / 2);
            prop_assert_eq!(region.y, (height - region.side) / 2);
        }
    }
}
