//! Builds the scoring [`Pipeline`] selected by configuration.
//!
//! Models are loaded here, once; the result is shared by every request.

use anyhow::{Context, Result};
use facecomp_vision::score::SSIM_WINDOW;
use facecomp_vision::{
    DistanceNormalization, EuclideanScorer, FeatureExtractor, Pipeline, RegionDetector,
    SFaceExtractor, SeetaDetector, SimilarityScorer, StructuralPatchExtractor, StructuralScorer,
    WholeImage, YuNetDetector,
};

use crate::config::{DetectorKind, ExtractorKind, PipelineConfig, ScorerKind};

/// Reject detector/extractor/scorer combinations that cannot produce a score.
pub fn validate(cfg: &PipelineConfig) -> Result<()> {
    match (cfg.extractor, cfg.scorer) {
        (ExtractorKind::Patch, ScorerKind::Euclidean) => {
            anyhow::bail!("extractor \"patch\" needs scorer \"ssim\", not \"euclidean\"")
        }
        (ExtractorKind::Sface, ScorerKind::Ssim) => {
            anyhow::bail!("extractor \"sface\" needs scorer \"euclidean\", not \"ssim\"")
        }
        _ => {}
    }

    if cfg.extractor == ExtractorKind::Patch && (cfg.patch_side as usize) < SSIM_WINDOW {
        anyhow::bail!(
            "patch_side {} is smaller than the {}x{} SSIM window",
            cfg.patch_side,
            SSIM_WINDOW,
            SSIM_WINDOW
        );
    }
    if cfg.jitters == 0 {
        anyhow::bail!("jitters must be at least 1");
    }
    if let DistanceNormalization::Constant(c) = DistanceNormalization::from(cfg.normalization) {
        if !(c.is_finite() && c > 0.0) {
            anyhow::bail!("normalization constant must be positive, got {}", c);
        }
    }
    Ok(())
}

pub fn build_pipeline(cfg: &PipelineConfig) -> Result<Pipeline> {
    validate(cfg)?;
    let policy = cfg.candidate_policy.into();

    let detector: Box<dyn RegionDetector> = match cfg.detector {
        DetectorKind::Whole => Box::new(WholeImage),
        DetectorKind::Seeta => Box::new(
            SeetaDetector::from_file(&cfg.seeta_model_path(), cfg.seeta.into(), policy)
                .context("Failed to initialize SeetaFace detector")?,
        ),
        DetectorKind::Yunet => Box::new(
            YuNetDetector::from_file(&cfg.yunet_model_path(), cfg.yunet.into(), policy)
                .context("Failed to initialize YuNet detector")?,
        ),
    };

    let extractor: Box<dyn FeatureExtractor> = match cfg.extractor {
        ExtractorKind::Patch => Box::new(StructuralPatchExtractor::new(cfg.patch_side)),
        ExtractorKind::Sface => Box::new(
            SFaceExtractor::from_file(&cfg.sface_model_path(), cfg.jitters, cfg.seed)
                .context("Failed to initialize SFace encoder")?,
        ),
    };

    let scorer: Box<dyn SimilarityScorer> = match cfg.scorer {
        ScorerKind::Ssim => Box::new(StructuralScorer::default()),
        ScorerKind::Euclidean => Box::new(EuclideanScorer::new(cfg.normalization.into())),
    };

    let pipeline = Pipeline::new(detector, extractor, scorer);
    log::info!("Scoring pipeline: {}", pipeline.describe());
    Ok(pipeline)
}
