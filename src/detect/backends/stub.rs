use anyhow::Result;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{Detection, DetectionResult};

/// Stub backend for demos and tests. Replays a fixed script of per-frame
/// results, one entry per `detect` call, wrapping around at the end.
pub struct StubBackend {
    script: Vec<DetectionResult>,
    cursor: usize,
}

impl StubBackend {
    /// Default demo script: an empty belt, then one object of each kind with a
    /// few empty frames in between. Includes an unknown label and a detection
    /// that stays below the usual 0.75 threshold.
    pub fn new() -> Self {
        let empty = DetectionResult::default();
        let one = |label: &str, confidence: f32| DetectionResult {
            detections: vec![Detection::new(label, confidence)],
        };
        Self::scripted(vec![
            empty.clone(),
            empty.clone(),
            one("ripe", 0.92),
            empty.clone(),
            DetectionResult {
                detections: vec![
                    Detection::new("half_ripe", 0.81),
                    Detection::new("rotten", 0.79),
                ],
            },
            empty.clone(),
            one("unripe", 0.62),
            one("mold", 0.88),
            empty.clone(),
            one("unknown_fruit", 0.95),
            empty,
        ])
    }

    pub fn scripted(script: Vec<DetectionResult>) -> Self {
        Self { script, cursor: 0 }
    }

    /// Number of `detect` calls served so far.
    pub fn calls(&self) -> usize {
        self.cursor
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, _pixels: &[u8], _width: u32, _height: u32) -> Result<DetectionResult> {
        if self.script.is_empty() {
            return Ok(DetectionResult::default());
        }
        let result = self.script[self.cursor % self.script.len()].clone();
        self.cursor += 1;
        Ok(result)
    }
}
