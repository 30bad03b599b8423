use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::{imageops::FilterType, RgbImage};
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{Detection, DetectionResult};

/// Tract-based backend for YOLO-style ONNX exports.
///
/// Expects a square `[1, 3, size, size]` f32 input and a `[1, 4 + classes, anchors]`
/// output (box centre/size rows followed by one score row per class). Each anchor
/// contributes at most one detection: its best-scoring class.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    input_size: u32,
    class_names: Vec<String>,
    min_score: f32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        input_size: u32,
        class_names: Vec<String>,
    ) -> Result<Self> {
        if class_names.is_empty() {
            return Err(anyhow!("tract backend needs at least one class name"));
        }
        let model_path = model_path.as_ref();
        let size = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            input_size,
            class_names,
            min_score: 0.25,
        })
    }

    /// Drop candidates scoring below `min_score` before they reach the caller.
    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = min_score;
        self
    }

    fn build_input(&self, pixels: &[u8], width: u32, height: u32) -> Result<Tensor> {
        let image = RgbImage::from_raw(width, height, pixels.to_vec())
            .ok_or_else(|| anyhow!("frame buffer does not match {}x{} RGB", width, height))?;
        let image = if width == self.input_size && height == self.input_size {
            image
        } else {
            image::imageops::resize(&image, self.input_size, self.input_size, FilterType::Triangle)
        };

        let size = self.input_size as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, size, size), |(_, c, y, x)| {
            image.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
        });
        Ok(input.into_tensor())
    }

    fn decode(&self, outputs: TVec<TValue>) -> Result<DetectionResult> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?
            .into_dimensionality::<tract_ndarray::Ix3>()
            .context("model output was not rank 3")?;

        let (_, rows, anchors) = view.dim();
        if rows < 5 {
            return Err(anyhow!("model output has {} rows, expected 4 + classes", rows));
        }
        let classes = rows - 4;
        if classes != self.class_names.len() {
            return Err(anyhow!(
                "model predicts {} classes but {} class names are configured",
                classes,
                self.class_names.len()
            ));
        }

        let mut detections = Vec::new();
        for anchor in 0..anchors {
            let mut best_class = 0;
            let mut best_score = f32::NEG_INFINITY;
            for class in 0..classes {
                let score = view[[0, 4 + class, anchor]];
                if score > best_score {
                    best_score = score;
                    best_class = class;
                }
            }
            if best_score.is_finite() && best_score >= self.min_score {
                detections.push(Detection::new(
                    self.class_names[best_class].clone(),
                    best_score.clamp(0.0, 1.0),
                ));
            }
        }

        // Highest score first, stable for ties.
        detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        Ok(DetectionResult { detections })
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<DetectionResult> {
        let input = self.build_input(pixels, width, height)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs)
    }

    fn warm_up(&mut self) -> Result<()> {
        let size = self.input_size;
        let blank = vec![0u8; (size as usize) * (size as usize) * 3];
        self.detect(&blank, size, size).map(|_| ())
    }
}
