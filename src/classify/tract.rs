#![cfg(feature = "backend-tract")]

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use tract_onnx::prelude::*;

use crate::classify::{EmotionBackend, FaceEmotion};
use crate::emotion::EmotionLabel;

/// Tract-based backend for a 7-class ONNX emotion model.
///
/// The whole image is resized to the model input and classified as a single
/// face; there is no face detection step. Outputs are logits in
/// `EmotionLabel::ALL` order, softmaxed and scaled to 0..=100.
pub struct TractBackend {
    model: TypedRunnableModel<TypedModel>,
    input_size: u32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let side = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, side, side)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self { model, input_size })
    }

    fn build_input(&self, image_path: &Path) -> Result<Tensor> {
        let image = image::open(image_path)
            .with_context(|| format!("failed to open {}", image_path.display()))?
            .to_rgb8();
        let resized =
            image::imageops::resize(&image, self.input_size, self.input_size, FilterType::Triangle);
        let side = self.input_size as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
            resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
        });
        Ok(input.into_tensor())
    }

    fn probabilities(&self, outputs: TVec<TValue>) -> Result<Vec<f32>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let logits: Vec<f32> = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?
            .iter()
            .copied()
            .collect();
        if logits.len() < EmotionLabel::ALL.len() {
            return Err(anyhow!(
                "model produced {} scores, expected {}",
                logits.len(),
                EmotionLabel::ALL.len()
            ));
        }
        let logits = &logits[..EmotionLabel::ALL.len()];
        let max_logit = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exp: Vec<f32> = logits.iter().map(|&x| (x - max_logit).exp()).collect();
        let sum: f32 = exp.iter().sum();
        if !sum.is_finite() || sum <= 0.0 {
            return Err(anyhow!("model produced non-finite scores"));
        }
        Ok(exp.iter().map(|e| e / sum * 100.0).collect())
    }
}

impl EmotionBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn analyze(&self, image_path: &Path) -> Result<Vec<FaceEmotion>> {
        let input = self.build_input(image_path)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let scores = self.probabilities(outputs)?;

        let mut emotion = BTreeMap::new();
        let mut dominant = (EmotionLabel::Neutral, f32::NEG_INFINITY);
        for (label, score) in EmotionLabel::ALL.into_iter().zip(scores) {
            if score > dominant.1 {
                dominant = (label, score);
            }
            emotion.insert(label.as_str().to_string(), score);
        }

        Ok(vec![FaceEmotion {
            dominant_emotion: dominant.0.as_str().to_string(),
            emotion,
        }])
    }
}
