use std::io::{BufRead, Seek};

use crate::error::{Stage, StageError};
use crate::feature::{Feature, FeatureExtractor};
use crate::loader::{self, Image};
use crate::region::{Region, RegionDetector};
use crate::score::{SimilarityScore, SimilarityScorer};

/// Outcome of scoring one pair of images.
#[derive(Debug, Clone)]
pub struct PairOutcome {
    pub score: SimilarityScore,
    /// Located regions for image A and B; `None` where nothing was found.
    pub regions: [Option<Region>; 2],
}

impl PairOutcome {
    /// Per image, whether the detector came back empty.
    pub fn missing_regions(&self) -> [bool; 2] {
        [self.regions[0].is_none(), self.regions[1].is_none()]
    }
}

/// load -> detect -> extract -> score, with a fixed detector/extractor/scorer triple.
///
/// Holds no per-request state; one instance is shared by all requests.
pub struct Pipeline {
    detector: Box<dyn RegionDetector>,
    extractor: Box<dyn FeatureExtractor>,
    scorer: Box<dyn SimilarityScorer>,
}

impl Pipeline {
    pub fn new(
        detector: Box<dyn RegionDetector>,
        extractor: Box<dyn FeatureExtractor>,
        scorer: Box<dyn SimilarityScorer>,
    ) -> Self {
        Self {
            detector,
            extractor,
            scorer,
        }
    }

    /// `detector/extractor/scorer`, for logs.
    pub fn describe(&self) -> String {
        format!(
            "{}/{}/{}",
            self.detector.name(),
            self.extractor.name(),
            self.scorer.name()
        )
    }

    /// Score two encoded images read from the streams' current positions.
    ///
    /// The streams are left where decoding stopped.
    pub fn score_streams<A, B>(&self, a: &mut A, b: &mut B) -> Result<PairOutcome, StageError>
    where
        A: BufRead + Seek,
        B: BufRead + Seek,
    {
        let image_a = loader::load_image(a).map_err(|e| StageError::new(Stage::Load, e))?;
        let image_b = loader::load_image(b).map_err(|e| StageError::new(Stage::Load, e))?;
        self.score_images(&image_a, &image_b)
    }

    pub fn score_images(&self, a: &Image, b: &Image) -> Result<PairOutcome, StageError> {
        let regions = [self.locate(a)?, self.locate(b)?];
        let [Some(region_a), Some(region_b)] = &regions else {
            log::warn!(
                "{}: no region in image(s) {:?}, scoring zero",
                self.detector.name(),
                [regions[0].is_none(), regions[1].is_none()]
            );
            return Ok(PairOutcome {
                score: SimilarityScore::ZERO,
                regions,
            });
        };

        let features = [self.extract(a, region_a)?, self.extract(b, region_b)?];
        let score = self
            .scorer
            .score(Some(&features[0]), Some(&features[1]))
            .map_err(|e| StageError::new(Stage::Score, e))?;
        log::debug!("{}: score {:.4}", self.describe(), score.value());

        Ok(PairOutcome { score, regions })
    }

    fn locate(&self, image: &Image) -> Result<Option<Region>, StageError> {
        let region = self
            .detector
            .locate(image)
            .map_err(|e| StageError::new(Stage::Detect, e))?;
        log::debug!("{}: region {:?}", self.detector.name(), region);
        Ok(region)
    }

    fn extract(&self, image: &Image, region: &Region) -> Result<Feature, StageError> {
        self.extractor
            .extract(image, region)
            .map_err(|e| StageError::new(Stage::Extract, e))
    }
}
