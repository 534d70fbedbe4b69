use std::fmt;

use crate::feature::FeatureShape;

/// Errors raised by the scoring pipeline.
///
/// A missing face is not an error: detectors report it as `Ok(None)` and the
/// scorer turns it into a zero score.
#[derive(Debug, thiserror::Error)]
pub enum VisionError {
    /// The input bytes are not a supported raster image.
    #[error("cannot decode image: {0}")]
    Decode(String),

    /// Two features cannot be compared element-wise.
    #[error("incompatible feature shapes: {left} vs {right}")]
    InvalidFeatureShape {
        left: FeatureShape,
        right: FeatureShape,
    },

    /// A model backend failed while running inference.
    #[error("inference failed: {0:#}")]
    Inference(#[source] anyhow::Error),
}

impl From<image::ImageError> for VisionError {
    fn from(err: image::ImageError) -> Self {
        VisionError::Decode(err.to_string())
    }
}

/// Pipeline step a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Load,
    Detect,
    Extract,
    Score,
    Narrate,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Load => "load",
            Stage::Detect => "detect",
            Stage::Extract => "extract",
            Stage::Score => "score",
            Stage::Narrate => "narrate",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A [`VisionError`] tagged with the stage that produced it.
#[derive(Debug, thiserror::Error)]
#[error("{stage} stage failed: {source}")]
pub struct StageError {
    pub stage: Stage,
    #[source]
    pub source: VisionError,
}

impl StageError {
    pub fn new(stage: Stage, source: VisionError) -> Self {
        Self { stage, source }
    }

    /// True when the caller sent something that is not an image.
    pub fn is_client_error(&self) -> bool {
        matches!(self.source, VisionError::Decode(_))
    }
}
