use facecomp_vision::{Stage, StageError};

use crate::narrative::NarrativeError;

/// Failure of one comparison request.
#[derive(Debug, thiserror::Error)]
pub enum CompareError {
    #[error(transparent)]
    Stage(#[from] StageError),

    #[error(transparent)]
    Narrative(#[from] NarrativeError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CompareError {
    /// Stage reported in error bodies and logs. Internal faults are charged
    /// to scoring, the step that runs off the async runtime.
    pub fn stage(&self) -> Stage {
        match self {
            CompareError::Stage(e) => e.stage,
            CompareError::Narrative(_) => Stage::Narrate,
            CompareError::Internal(_) => Stage::Score,
        }
    }

    /// True when the caller sent something that cannot be compared.
    pub fn is_client_error(&self) -> bool {
        matches!(self, CompareError::Stage(e) if e.is_client_error())
    }
}
