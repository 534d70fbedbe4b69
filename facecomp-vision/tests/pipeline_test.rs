use std::io::Cursor;

use anyhow::Result;
use facecomp_vision::{
    DistanceNormalization, EuclideanScorer, Feature, FeatureExtractor, Image, Pipeline, Region,
    RegionDetector, SimilarityScore, Stage, StructuralPatchExtractor, StructuralScorer,
    VisionError, WholeImage,
};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use ndarray::Array1;

fn encode(img: RgbImage, format: ImageFormat) -> Result<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img).write_to(&mut out, format)?;
    Ok(out.into_inner())
}

fn rings(width: u32, height: u32, period: u32) -> RgbImage {
    let (cx, cy) = (width as i64 / 2, height as i64 / 2);
    RgbImage::from_fn(width, height, |x, y| {
        let d2 = (x as i64 - cx).pow(2) + (y as i64 - cy).pow(2);
        let v = if (d2 as f64).sqrt() as u32 / period % 2 == 0 { 230 } else { 20 };
        Rgb([v, v, v])
    })
}

fn stripes(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, _| {
        let v = if x / 5 % 2 == 0 { 255 } else { 0 };
        Rgb([v, 0, 255 - v])
    })
}

fn structural() -> Pipeline {
    Pipeline::new(
        Box::new(WholeImage),
        Box::new(StructuralPatchExtractor::default()),
        Box::new(StructuralScorer::default()),
    )
}

fn score(pipeline: &Pipeline, a: &[u8], b: &[u8]) -> Result<SimilarityScore> {
    Ok(pipeline
        .score_streams(&mut Cursor::new(a), &mut Cursor::new(b))?
        .score)
}

#[test]
fn test_identical_images_score_one() -> Result<()> {
    env_logger::try_init().ok();
    let pipeline = structural();
    let png = encode(rings(160, 120, 9), ImageFormat::Png)?;
    let s = score(&pipeline, &png, &png)?;
    println!("identical: {:.4}", s.value());
    assert!((s.value() - 1.0).abs() < 1e-4);
    Ok(())
}

#[test]
fn test_score_is_symmetric_and_bounded() -> Result<()> {
    let pipeline = structural();
    let a = encode(rings(160, 120, 9), ImageFormat::Png)?;
    let b = encode(stripes(90, 140), ImageFormat::Jpeg)?;
    let ab = score(&pipeline, &a, &b)?;
    let ba = score(&pipeline, &b, &a)?;
    println!("a<->b: {:.4} / {:.4}", ab.value(), ba.value());
    assert!((ab.value() - ba.value()).abs() < 1e-6);
    assert!((0.0..=1.0).contains(&ab.value()));
    assert!(ab.value() < 0.5);
    Ok(())
}

#[test]
fn test_different_sizes_are_comparable() -> Result<()> {
    let pipeline = structural();
    let small = encode(rings(80, 60, 8), ImageFormat::Png)?;
    let large = encode(rings(640, 480, 64), ImageFormat::Png)?;
    let s = score(&pipeline, &small, &large)?;
    println!("rescaled: {:.4}", s.value());
    assert!(s.value() > 0.5);
    Ok(())
}

#[test]
fn test_undecodable_input_fails_at_load() -> Result<()> {
    let pipeline = structural();
    let png = encode(rings(64, 64, 5), ImageFormat::Png)?;
    let err = pipeline
        .score_streams(&mut Cursor::new(&png[..]), &mut Cursor::new(&b"%PDF-1.4"[..]))
        .unwrap_err();
    assert_eq!(err.stage, Stage::Load);
    assert!(err.is_client_error());

    let err = pipeline
        .score_streams(&mut Cursor::new(&b""[..]), &mut Cursor::new(&png[..]))
        .unwrap_err();
    assert_eq!(err.stage, Stage::Load);
    Ok(())
}

/// Finds a face only in images wider than they are tall.
struct LandscapeOnly;

impl RegionDetector for LandscapeOnly {
    fn name(&self) -> &'static str {
        "landscape"
    }

    fn locate(&self, image: &Image) -> Result<Option<Region>, VisionError> {
        Ok((image.width() > image.height()).then(|| Region::full(image)))
    }
}

/// Mean RGB as a three element embedding.
struct MeanColor;

impl FeatureExtractor for MeanColor {
    fn name(&self) -> &'static str {
        "mean-color"
    }

    fn extract(&self, image: &Image, region: &Region) -> Result<Feature, VisionError> {
        let crop = image.crop(region);
        let n = (crop.width() * crop.height()) as f32;
        let mut sum = [0.0f32; 3];
        for p in crop.pixels() {
            for c in 0..3 {
                sum[c] += p[c] as f32 / 255.0;
            }
        }
        Ok(Feature::Embedding(Array1::from_iter(sum.iter().map(|s| s / n))))
    }
}

#[test]
fn test_missing_region_scores_zero_without_error() -> Result<()> {
    env_logger::try_init().ok();
    let pipeline = Pipeline::new(
        Box::new(LandscapeOnly),
        Box::new(StructuralPatchExtractor::default()),
        Box::new(StructuralScorer::default()),
    );
    let landscape = encode(rings(160, 120, 9), ImageFormat::Png)?;
    let portrait = encode(rings(120, 160, 9), ImageFormat::Png)?;

    let outcome = pipeline.score_streams(
        &mut Cursor::new(&landscape[..]),
        &mut Cursor::new(&portrait[..]),
    )?;
    assert_eq!(outcome.score, SimilarityScore::ZERO);
    assert_eq!(outcome.missing_regions(), [false, true]);

    let outcome = pipeline.score_streams(
        &mut Cursor::new(&portrait[..]),
        &mut Cursor::new(&portrait[..]),
    )?;
    assert_eq!(outcome.score, SimilarityScore::ZERO);
    assert_eq!(outcome.missing_regions(), [true, true]);
    Ok(())
}

#[test]
fn test_embedding_pipeline_uses_distance() -> Result<()> {
    let pipeline = Pipeline::new(
        Box::new(WholeImage),
        Box::new(MeanColor),
        Box::new(EuclideanScorer::new(DistanceNormalization::Constant(2.5))),
    );
    let red = encode(RgbImage::from_pixel(32, 32, Rgb([255, 0, 0])), ImageFormat::Png)?;
    let blue = encode(RgbImage::from_pixel(32, 32, Rgb([0, 0, 255])), ImageFormat::Png)?;

    let same = score(&pipeline, &red, &red)?;
    assert!((same.value() - 1.0).abs() < 1e-6);

    // distance sqrt(2), 1 - 1.414 / 2.5
    let different = score(&pipeline, &red, &blue)?;
    assert!((different.value() - (1.0 - 2f32.sqrt() / 2.5)).abs() < 1e-3);
    Ok(())
}

#[test]
fn test_mismatched_features_fail_at_score() -> Result<()> {
    let pipeline = Pipeline::new(
        Box::new(WholeImage),
        Box::new(MeanColor),
        Box::new(StructuralScorer::default()),
    );
    let png = encode(rings(64, 64, 5), ImageFormat::Png)?;
    let err = pipeline
        .score_streams(&mut Cursor::new(&png[..]), &mut Cursor::new(&png[..]))
        .unwrap_err();
    assert_eq!(err.stage, Stage::Score);
    assert!(!err.is_client_error());
    Ok(())
}
