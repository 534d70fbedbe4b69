use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use ort::session::Session;

use crate::error::VisionError;
use crate::face::{self, Detection};
use crate::loader::Image;

/// Pixel rectangle inside an image, always clipped to its bounds.
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Detector confidence, when the detector reports one.
    pub score: Option<f32>,
    /// Five facial landmarks (x1,y1,...,x5,y5) in image pixels.
    pub landmarks: Option<[f32; 10]>,
}

impl Region {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            score: None,
            landmarks: None,
        }
    }

    pub fn full(image: &Image) -> Self {
        Self::new(0, 0, image.width(), image.height())
    }

    /// Clip a floating point box (x, y, w, h) to a `width` x `height` frame.
    /// Returns `None` when nothing of the box is left inside the frame.
    pub fn clipped(bbox: [f32; 4], width: u32, height: u32) -> Option<Self> {
        let [x, y, w, h] = bbox;
        if !(x.is_finite() && y.is_finite() && w.is_finite() && h.is_finite()) {
            return None;
        }
        let x0 = x.max(0.0).floor() as u32;
        let y0 = y.max(0.0).floor() as u32;
        let x1 = ((x + w).min(width as f32)).ceil().max(0.0) as u32;
        let y1 = ((y + h).min(height as f32)).ceil().max(0.0) as u32;
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(Self::new(x0, y0, x1 - x0, y1 - y0))
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Which candidate wins when a detector returns several faces.
///
/// `First` keeps the detector's own ordering untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CandidatePolicy {
    #[default]
    First,
    MostConfident,
    Largest,
}

impl CandidatePolicy {
    pub fn select(&self, candidates: Vec<Region>) -> Option<Region> {
        match self {
            CandidatePolicy::First => candidates.into_iter().next(),
            CandidatePolicy::MostConfident => candidates.into_iter().reduce(|best, r| {
                if r.score.unwrap_or(f32::MIN) > best.score.unwrap_or(f32::MIN) {
                    r
                } else {
                    best
                }
            }),
            CandidatePolicy::Largest => candidates
                .into_iter()
                .reduce(|best, r| if r.area() > best.area() { r } else { best }),
        }
    }
}

/// Locates the area of an image that takes part in the comparison.
///
/// `Ok(None)` means "no region found" and is a normal outcome.
pub trait RegionDetector: Send + Sync {
    fn name(&self) -> &'static str;

    fn locate(&self, image: &Image) -> Result<Option<Region>, VisionError>;
}

/// Compares whole frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct WholeImage;

impl RegionDetector for WholeImage {
    fn name(&self) -> &'static str {
        "whole"
    }

    fn locate(&self, image: &Image) -> Result<Option<Region>, VisionError> {
        Ok(Some(Region::full(image)))
    }
}

/// Tuning knobs for the SeetaFace cascade.
#[derive(Debug, Clone, Copy)]
pub struct SeetaSettings {
    pub min_face_size: u32,
    pub score_threshold: f64,
    pub pyramid_scale_factor: f32,
    pub window_step: u32,
}

impl Default for SeetaSettings {
    fn default() -> Self {
        Self {
            min_face_size: 20,
            score_threshold: 2.0,
            pyramid_scale_factor: 0.8,
            window_step: 4,
        }
    }
}

/// Cascade face detector (SeetaFace via `rustface`) run on the grayscale image.
pub struct SeetaDetector {
    model: rustface::Model,
    settings: SeetaSettings,
    policy: CandidatePolicy,
}

impl SeetaDetector {
    pub fn from_file(path: &Path, settings: SeetaSettings, policy: CandidatePolicy) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("opening SeetaFace model {}", path.display()))?;
        let model = rustface::read_model(BufReader::new(file))
            .with_context(|| format!("loading SeetaFace model {}", path.display()))?;
        Ok(Self {
            model,
            settings,
            policy,
        })
    }
}

impl RegionDetector for SeetaDetector {
    fn name(&self) -> &'static str {
        "seeta"
    }

    fn locate(&self, image: &Image) -> Result<Option<Region>, VisionError> {
        // Detectors are cheap to build and carry mutable scan state, so each call gets its own.
        let mut detector = rustface::create_detector_with_model(self.model.clone());
        detector.set_min_face_size(self.settings.min_face_size);
        detector.set_score_thresh(self.settings.score_threshold);
        detector.set_pyramid_scale_factor(self.settings.pyramid_scale_factor);
        detector.set_slide_window_step(self.settings.window_step, self.settings.window_step);

        let gray = image.gray();
        let faces = detector.detect(&rustface::ImageData::new(
            gray.as_raw(),
            gray.width(),
            gray.height(),
        ));
        log::debug!("seeta: {} candidate(s)", faces.len());

        let candidates = faces
            .iter()
            .filter_map(|face| {
                let bbox = face.bbox();
                let mut region = Region::clipped(
                    [
                        bbox.x() as f32,
                        bbox.y() as f32,
                        bbox.width() as f32,
                        bbox.height() as f32,
                    ],
                    image.width(),
                    image.height(),
                )?;
                region.score = Some(face.score() as f32);
                Some(region)
            })
            .collect();
        Ok(self.policy.select(candidates))
    }
}

/// Thresholds applied to YuNet output.
#[derive(Debug, Clone, Copy)]
pub struct YuNetSettings {
    pub score_threshold: f32,
    pub nms_threshold: f32,
}

impl Default for YuNetSettings {
    fn default() -> Self {
        Self {
            score_threshold: 0.6,
            nms_threshold: 0.3,
        }
    }
}

/// YuNet CNN face detector. Works on RGB input and reports landmarks.
pub struct YuNetDetector {
    session: Mutex<Session>,
    settings: YuNetSettings,
    policy: CandidatePolicy,
}

impl YuNetDetector {
    pub fn new(session: Session, settings: YuNetSettings, policy: CandidatePolicy) -> Self {
        Self {
            session: Mutex::new(session),
            settings,
            policy,
        }
    }

    pub fn from_file(path: &Path, settings: YuNetSettings, policy: CandidatePolicy) -> Result<Self> {
        Ok(Self::new(crate::model::session_from_file(path)?, settings, policy))
    }

    fn to_region(detection: &Detection, image: &Image) -> Option<Region> {
        let mut region = Region::clipped(detection.bbox, image.width(), image.height())?;
        region.score = Some(detection.score);
        region.landmarks = Some(detection.landmarks);
        Some(region)
    }
}

impl RegionDetector for YuNetDetector {
    fn name(&self) -> &'static str {
        "yunet"
    }

    fn locate(&self, image: &Image) -> Result<Option<Region>, VisionError> {
        let mut session = self
            .session
            .lock()
            .map_err(|_| VisionError::Inference(anyhow::anyhow!("detector session poisoned")))?;
        let detections = face::detect_faces(
            &mut session,
            image.rgb(),
            self.settings.score_threshold,
            self.settings.nms_threshold,
        )
        .map_err(VisionError::Inference)?;
        log::debug!("yunet: {} candidate(s)", detections.len());

        let candidates = detections
            .iter()
            .filter_map(|d| Self::to_region(d, image))
            .collect();
        Ok(self.policy.select(candidates))
    }
}
