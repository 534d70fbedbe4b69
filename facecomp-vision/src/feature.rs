use std::fmt;
use std::path::Path;
use std::sync::Mutex;

use anyhow::Result;
use image::{imageops, imageops::FilterType, RgbImage};
use ndarray::{Array1, Array2};
use ort::session::Session;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::VisionError;
use crate::face;
use crate::loader::Image;
use crate::region::Region;

/// Side of the grayscale patch used for structural comparison.
pub const DEFAULT_PATCH_SIDE: u32 = 100;

/// Fixed-shape numeric summary of a region.
#[derive(Debug, Clone, PartialEq)]
pub enum Feature {
    /// Learned identity embedding, L2-normalized.
    Embedding(Array1<f32>),
    /// Grayscale intensities in [0, 255], rows x cols.
    Patch(Array2<f32>),
}

impl Feature {
    pub fn shape(&self) -> FeatureShape {
        match self {
            Feature::Embedding(v) => FeatureShape::Embedding(v.len()),
            Feature::Patch(p) => FeatureShape::Patch(p.nrows(), p.ncols()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureShape {
    Embedding(usize),
    Patch(usize, usize),
}

impl fmt::Display for FeatureShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureShape::Embedding(len) => write!(f, "embedding[{}]", len),
            FeatureShape::Patch(rows, cols) => write!(f, "patch[{}x{}]", rows, cols),
        }
    }
}

/// Reduces a located region to a [`Feature`]. Output shape must not depend
/// on the input image for a given extractor configuration.
pub trait FeatureExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    fn extract(&self, image: &Image, region: &Region) -> Result<Feature, VisionError>;
}

/// Crop, grayscale, resize to `side` x `side`.
#[derive(Debug, Clone, Copy)]
pub struct StructuralPatchExtractor {
    side: u32,
}

impl StructuralPatchExtractor {
    pub fn new(side: u32) -> Self {
        Self { side: side.max(1) }
    }
}

impl Default for StructuralPatchExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_PATCH_SIDE)
    }
}

impl FeatureExtractor for StructuralPatchExtractor {
    fn name(&self) -> &'static str {
        "patch"
    }

    fn extract(&self, image: &Image, region: &Region) -> Result<Feature, VisionError> {
        let gray = imageops::grayscale(&image.crop(region));
        let resized = imageops::resize(&gray, self.side, self.side, FilterType::Triangle);
        let side = self.side as usize;
        let pixels = resized.as_raw().iter().map(|&v| v as f32).collect();
        let patch = Array2::from_shape_vec((side, side), pixels)
            .map_err(|e| VisionError::Inference(e.into()))?;
        Ok(Feature::Patch(patch))
    }
}

/// SFace embedding extractor.
///
/// With `jitters > 1` the embedding is the normalized mean over the base crop
/// and `jitters - 1` randomly shifted and scaled copies of it. The generator is
/// reseeded on every call, so equal pixels give equal embeddings.
pub struct SFaceExtractor {
    session: Mutex<Session>,
    jitters: u32,
    seed: u64,
}

impl SFaceExtractor {
    pub fn new(session: Session, jitters: u32, seed: u64) -> Self {
        Self {
            session: Mutex::new(session),
            jitters: jitters.max(1),
            seed,
        }
    }

    pub fn from_file(path: &Path, jitters: u32, seed: u64) -> Result<Self> {
        Ok(Self::new(crate::model::session_from_file(path)?, jitters, seed))
    }
}

/// Encoder inputs for one region: the base crop plus `jitters - 1` seeded
/// perturbations of it. With landmarks every sample is aligned from
/// shifted and scaled landmarks, so all crops share the aligned shape.
fn face_crops(image: &Image, region: &Region, jitters: u32, seed: u64) -> Vec<RgbImage> {
    let align = |landmarks: &[f32; 10]| face::align_face(image.rgb(), landmarks, face::ENCODER_INPUT);

    let mut crops = vec![match &region.landmarks {
        Some(landmarks) => align(landmarks),
        None => image.crop(region),
    }];
    let mut rng = StdRng::seed_from_u64(seed);
    for _ in 1..jitters {
        let jitter = Jitter::draw(&mut rng, region);
        match &region.landmarks {
            Some(landmarks) => crops.push(align(&jitter.landmarks(landmarks))),
            None => crops.extend(
                jitter
                    .region(region, image.width(), image.height())
                    .map(|r| image.crop(&r)),
            ),
        }
    }
    crops
}

/// Seeded shift of up to 4% and scale of 0.96..1.04 of the region size.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Jitter {
    scale: f32,
    dx: f32,
    dy: f32,
}

impl Jitter {
    fn draw<R: Rng>(rng: &mut R, region: &Region) -> Self {
        let scale = rng.gen_range(0.96f32..=1.04);
        let dx = rng.gen_range(-0.04f32..=0.04) * region.width as f32;
        let dy = rng.gen_range(-0.04f32..=0.04) * region.height as f32;
        Self { scale, dx, dy }
    }

    fn region(&self, region: &Region, width: u32, height: u32) -> Option<Region> {
        let w = region.width as f32;
        let h = region.height as f32;
        let new_w = w * self.scale;
        let new_h = h * self.scale;
        let x = region.x as f32 + (w - new_w) / 2.0 + self.dx;
        let y = region.y as f32 + (h - new_h) / 2.0 + self.dy;
        Region::clipped([x, y, new_w, new_h], width, height)
    }

    /// Scale the five points about their centroid, then shift.
    fn landmarks(&self, landmarks: &[f32; 10]) -> [f32; 10] {
        let cx = landmarks.iter().step_by(2).sum::<f32>() / 5.0;
        let cy = landmarks.iter().skip(1).step_by(2).sum::<f32>() / 5.0;
        let mut out = *landmarks;
        for point in out.chunks_exact_mut(2) {
            point[0] = cx + (point[0] - cx) * self.scale + self.dx;
            point[1] = cy + (point[1] - cy) * self.scale + self.dy;
        }
        out
    }
}

impl FeatureExtractor for SFaceExtractor {
    fn name(&self) -> &'static str {
        "sface"
    }

    fn extract(&self, image: &Image, region: &Region) -> Result<Feature, VisionError> {
        let crops = face_crops(image, region, self.jitters, self.seed);
        let mut session = self
            .session
            .lock()
            .map_err(|_| VisionError::Inference(anyhow::anyhow!("encoder session poisoned")))?;

        let mut sum: Option<Array1<f32>> = None;
        for crop in &crops {
            let embedding = face::encode_face(&mut session, crop).map_err(VisionError::Inference)?;
            sum = Some(match sum {
                Some(acc) if acc.len() == embedding.len() => acc + &embedding,
                Some(acc) => {
                    return Err(VisionError::InvalidFeatureShape {
                        left: FeatureShape::Embedding(acc.len()),
                        right: FeatureShape::Embedding(embedding.len()),
                    })
                }
                None => embedding,
            });
        }
        log::debug!("sface: averaged {} crop(s)", crops.len());

        let sum = sum.ok_or_else(|| VisionError::Inference(anyhow::anyhow!("no face crop")))?;
        Ok(Feature::Embedding(face::l2_normalize(sum)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn gradient(width: u32, height: u32) -> Image {
        Image::from_rgb(RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 7 % 256) as u8, (y * 3 % 256) as u8, 90])
        }))
        .unwrap()
    }

    #[test]
    fn test_patch_shape_is_fixed() {
        let extractor = StructuralPatchExtractor::new(48);
        let a = gradient(300, 200);
        let b = gradient(64, 90);
        let fa = extractor.extract(&a, &Region::full(&a)).unwrap();
        let fb = extractor
            .extract(&b, &Region::new(10, 10, 20, 50))
            .unwrap();
        assert_eq!(fa.shape(), FeatureShape::Patch(48, 48));
        assert_eq!(fa.shape(), fb.shape());
    }

    #[test]
    fn test_patch_values_are_gray_levels() {
        let img = Image::from_rgb(RgbImage::from_pixel(30, 30, Rgb([200, 200, 200]))).unwrap();
        let Feature::Patch(patch) = StructuralPatchExtractor::new(10)
            .extract(&img, &Region::full(&img))
            .unwrap()
        else {
            panic!("expected a patch");
        };
        assert!(patch.iter().all(|&v| v == 200.0));
    }

    #[test]
    fn test_jitter_is_seeded() {
        let region = Region::new(40, 40, 100, 100);
        let mut a = StdRng::seed_from_u64(7);
        let mut b = StdRng::seed_from_u64(7);
        for _ in 0..5 {
            let ja = Jitter::draw(&mut a, &region);
            assert_eq!(ja, Jitter::draw(&mut b, &region));
            let ra = ja.region(&region, 200, 200).unwrap();
            assert!(ra.width >= 95 && ra.width <= 106);
        }
    }

    fn landmarked() -> Region {
        let mut region = Region::new(60, 50, 80, 100);
        region.landmarks = Some([80.0, 90.0, 120.0, 90.0, 100.0, 110.0, 85.0, 130.0, 115.0, 130.0]);
        region
    }

    #[test]
    fn test_jittered_crops_are_all_aligned() {
        let img = gradient(200, 200);
        let crops = face_crops(&img, &landmarked(), 5, 42);
        assert_eq!(crops.len(), 5);
        for crop in &crops {
            assert_eq!(crop.dimensions(), (face::ENCODER_INPUT, face::ENCODER_INPUT));
        }
        assert_ne!(crops[0], crops[1]);
        assert_eq!(crops, face_crops(&img, &landmarked(), 5, 42));
    }

    #[test]
    fn test_jittered_landmarks_keep_their_geometry() {
        let region = landmarked();
        let base = region.landmarks.unwrap();
        let jitter = Jitter {
            scale: 1.0,
            dx: 3.0,
            dy: -2.0,
        };
        let moved = jitter.landmarks(&base);
        for (b, m) in base.chunks_exact(2).zip(moved.chunks_exact(2)) {
            assert!((m[0] - b[0] - 3.0).abs() < 1e-4);
            assert!((m[1] - b[1] + 2.0).abs() < 1e-4);
        }

        let grown = Jitter {
            scale: 1.04,
            dx: 0.0,
            dy: 0.0,
        }
        .landmarks(&base);
        let eye_gap = |l: &[f32; 10]| l[2] - l[0];
        assert!((eye_gap(&grown) - eye_gap(&base) * 1.04).abs() < 1e-3);
    }

    #[test]
    fn test_unlandmarked_crops_follow_the_box() {
        let img = gradient(200, 200);
        let crops = face_crops(&img, &Region::new(40, 40, 100, 100), 3, 1);
        assert_eq!(crops.len(), 3);
        assert_eq!(crops[0].dimensions(), (100, 100));
    }

    #[test]
    fn test_shape_display() {
        assert_eq!(FeatureShape::Embedding(128).to_string(), "embedding[128]");
        assert_eq!(FeatureShape::Patch(100, 100).to_string(), "patch[100x100]");
    }
}
