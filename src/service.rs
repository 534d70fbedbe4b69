use std::io::{Cursor, Read, Seek};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use facecomp_vision::{loader, PairOutcome, Pipeline};

use crate::error::CompareError;
use crate::narrative::{EncodedImage, NarrativeGenerator, NarrativeRequest};

/// Response body of a successful comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub similarity_score: f32,
    pub analysis: String,
}

/// Runs LOAD -> DETECT -> EXTRACT -> SCORE -> NARRATE for one image pair.
///
/// Built once at startup; cheap to clone into request handlers.
#[derive(Clone)]
pub struct Comparator {
    pipeline: Arc<Pipeline>,
    narrator: Arc<dyn NarrativeGenerator>,
}

impl Comparator {
    pub fn new(pipeline: Arc<Pipeline>, narrator: Arc<dyn NarrativeGenerator>) -> Self {
        Self { pipeline, narrator }
    }

    /// Score both uploads on the blocking pool. The streams come back
    /// positioned wherever decoding stopped.
    async fn score(
        &self,
        a: Bytes,
        b: Bytes,
    ) -> Result<(PairOutcome, [Cursor<Bytes>; 2]), CompareError> {
        let pipeline = Arc::clone(&self.pipeline);
        let scored = tokio::task::spawn_blocking(move || {
            let mut a = Cursor::new(a);
            let mut b = Cursor::new(b);
            pipeline
                .score_streams(&mut a, &mut b)
                .map(|outcome| (outcome, [a, b]))
        })
        .await
        .map_err(|e| CompareError::Internal(anyhow::Error::new(e).context("scoring task")))?;
        Ok(scored?)
    }

    pub async fn compare(&self, a: Bytes, b: Bytes) -> Result<ComparisonResult, CompareError> {
        let (outcome, [mut a, mut b]) = self.score(a, b).await?;
        log::debug!("score {:.4}, regions {:?}", outcome.score.value(), outcome.regions);

        let request = NarrativeRequest {
            score: outcome.score,
            images: [reread(&mut a)?, reread(&mut b)?],
            missing_faces: outcome.missing_regions(),
        };
        let analysis = self.narrator.describe(&request).await?;

        Ok(ComparisonResult {
            similarity_score: outcome.score.value(),
            analysis,
        })
    }
}

/// Rewind an upload and encode it again for the narrative request. Formats
/// the providers do not take are converted to PNG.
fn reread(stream: &mut Cursor<Bytes>) -> Result<EncodedImage, CompareError> {
    stream
        .rewind()
        .map_err(|e| CompareError::Internal(anyhow::Error::new(e).context("rewinding upload")))?;
    let mut raw = Vec::with_capacity(stream.get_ref().len());
    stream
        .read_to_end(&mut raw)
        .map_err(|e| CompareError::Internal(anyhow::Error::new(e).context("re-reading upload")))?;
    let attachable = loader::attachable_bytes(&raw)
        .map_err(|e| CompareError::Internal(anyhow::Error::new(e).context("re-encoding upload")))?;
    Ok(EncodedImage::from_bytes(&attachable))
}
