/// Result of running detection on a frame.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DetectionResult {
    /// Detections in the order the backend produced them.
    pub detections: Vec<Detection>,
}

/// One (label, confidence) output for one frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub label: String,
    /// 0..=1
    pub confidence: f32,
}

impl Detection {
    pub fn new(label: impl Into<String>, confidence: f32) -> Self {
        Self {
            label: label.into(),
            confidence,
        }
    }
}

/// The single detection chosen for a frame.
#[derive(Clone, Debug, PartialEq)]
pub struct BestDetection {
    pub label: String,
    pub confidence: f32,
}

/// Pick the highest-confidence detection strictly above `threshold`.
///
/// Comparisons are strict on both sides: a detection exactly at the threshold
/// never qualifies, and a later detection with equal confidence never replaces
/// an earlier one.
pub fn select_best(detections: &[Detection], threshold: f32) -> Option<BestDetection> {
    let mut best: Option<&Detection> = None;
    let mut best_confidence = 0.0_f32;
    for detection in detections {
        if detection.confidence > threshold && detection.confidence > best_confidence {
            best_confidence = detection.confidence;
            best = Some(detection);
        }
    }
    best.map(|d| BestDetection {
        label: d.label.clone(),
        confidence: d.confidence,
    })
}
