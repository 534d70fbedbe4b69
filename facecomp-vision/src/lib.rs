pub mod error;
pub mod face;
pub mod feature;
pub mod loader;
pub mod model;
pub mod pipeline;
pub mod region;
pub mod score;
pub mod yunet;

// Re-export commonly used types
pub use error::{Stage, StageError, VisionError};
pub use feature::{Feature, FeatureExtractor, SFaceExtractor, StructuralPatchExtractor};
pub use loader::Image;
pub use pipeline::{PairOutcome, Pipeline};
pub use region::{
    CandidatePolicy, Region, RegionDetector, SeetaDetector, SeetaSettings, WholeImage,
    YuNetDetector, YuNetSettings,
};
pub use score::{
    DistanceNormalization, EuclideanScorer, SimilarityScore, SimilarityScorer, StructuralScorer,
};
