pub mod config;
pub mod error;
pub mod factory;
pub mod narrative;
pub mod server;
pub mod service;

// Re-export vision types for convenience
pub use facecomp_vision::{PairOutcome, Pipeline, SimilarityScore, Stage};

pub use error::CompareError;
pub use narrative::{NarrativeError, NarrativeGenerator, NarrativeRequest};
pub use service::{Comparator, ComparisonResult};
