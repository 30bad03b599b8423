//! Captured frames.
//!
//! - `Frame`: one RGB24 raster produced by a frame source.
//!
//! A frame is owned by whoever captured it and only borrowed by the vision loop
//! for display and inference. Detectors see the pixels through
//! `Frame::run_detector` and cannot keep them: the slice does not outlive the call.

use anyhow::{anyhow, Result};
use std::time::{Duration, Instant};

use crate::detect::{DetectionResult, DetectorBackend};

/// Upper bound on a single frame dimension. Anything larger is a corrupt header.
pub const MAX_FRAME_DIMENSION: u32 = 8192;

/// RGB24 raster. Bytes are row-major, three bytes per pixel.
pub struct Frame {
    data: Vec<u8>,

    pub width: u32,
    pub height: u32,

    /// Per-source capture counter.
    sequence: u64,

    /// Monotonic capture instant.
    captured_at: Instant,
}

// No Clone: a frame is captured once and dropped after its iteration.

impl Frame {
    /// Wrap RGB24 pixels. Fails if the byte count does not match the dimensions.
    pub fn new(data: Vec<u8>, width: u32, height: u32, sequence: u64) -> Result<Self> {
        if width == 0 || height == 0 || width > MAX_FRAME_DIMENSION || height > MAX_FRAME_DIMENSION
        {
            return Err(anyhow!("invalid frame dimensions {}x{}", width, height));
        }
        let expected = rgb_len(width, height)?;
        if data.len() != expected {
            return Err(anyhow!(
                "frame byte length mismatch: expected {}, got {}",
                expected,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            sequence,
            captured_at: Instant::now(),
        })
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn age(&self) -> Duration {
        self.captured_at.elapsed()
    }

    /// Read-only pixel access for preview rendering.
    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    /// RGB value at (x, y), clamped to the frame edges.
    pub fn rgb_at(&self, x: u32, y: u32) -> (u8, u8, u8) {
        let x = x.min(self.width - 1) as usize;
        let y = y.min(self.height - 1) as usize;
        let idx = (y * self.width as usize + x) * 3;
        (self.data[idx], self.data[idx + 1], self.data[idx + 2])
    }

    /// Run a detector backend on this frame.
    pub fn run_detector(&self, detector: &mut dyn DetectorBackend) -> Result<DetectionResult> {
        detector.detect(&self.data, self.width, self.height)
    }
}

pub(crate) fn rgb_len(width: u32, height: u32) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(3))
        .ok_or_else(|| anyhow!("frame dimensions overflow"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::Detection;

    struct EchoDetector;

    impl DetectorBackend for EchoDetector {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<DetectionResult> {
            assert_eq!(pixels.len(), (width * height * 3) as usize);
            Ok(DetectionResult {
                detections: vec![Detection::new("ripe", pixels[0] as f32 / 255.0)],
            })
        }
    }

    #[test]
    fn rejects_length_mismatch() {
        assert!(Frame::new(vec![0u8; 10], 2, 2, 0).is_err());
        assert!(Frame::new(vec![0u8; 12], 2, 2, 0).is_ok());
    }

    #[test]
    fn rejects_zero_dimensions() {
        assert!(Frame::new(Vec::new(), 0, 4, 0).is_err());
    }

    #[test]
    fn detector_sees_frame_pixels() {
        let frame = Frame::new(vec![255u8; 4 * 4 * 3], 4, 4, 7).unwrap();
        let result = frame.run_detector(&mut EchoDetector).unwrap();
        assert_eq!(result.detections.len(), 1);
        assert_eq!(result.detections[0].confidence, 1.0);
        assert_eq!(frame.sequence(), 7);
    }

    #[test]
    fn rgb_at_clamps_to_edges() {
        let mut data = vec![0u8; 2 * 2 * 3];
        data[9..12].copy_from_slice(&[1, 2, 3]);
        let frame = Frame::new(data, 2, 2, 0).unwrap();
        assert_eq!(frame.rgb_at(1, 1), (1, 2, 3));
        assert_eq!(frame.rgb_at(10, 10), (1, 2, 3));
    }
}
