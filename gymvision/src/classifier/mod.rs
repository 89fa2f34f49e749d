//! External vision classifier boundary.
//!
//! The classifier is an opaque, possibly non-deterministic service: an image and a fixed
//! instruction go in, free-form text comes out. Nothing it returns is trusted beyond being text;
//! mapping that text to an exercise is the catalog's job.

pub mod openai;

use crate::{catalog::Catalog, recognition::image::ValidatedImage};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Why a classification produced no answer. All of these are transient from the user's point of
/// view: the reservation is released and nothing is charged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassifierError {
    #[error("classifier did not answer within {0:?}")]
    Timeout(Duration),

    #[error("classifier request failed: {0}")]
    Transport(String),

    #[error("classifier returned HTTP {status}")]
    Upstream { status: u16 },

    #[error("classifier returned no text")]
    EmptyResponse,

    #[error("could not decode classifier response: {0}")]
    Decode(String),
}

impl ClassifierError {
    /// Short label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ClassifierError::Timeout(_) => "timeout",
            ClassifierError::Transport(_) => "transport",
            ClassifierError::Upstream { .. } => "upstream",
            ClassifierError::EmptyResponse => "empty_response",
            ClassifierError::Decode(_) => "decode",
        }
    }
}

#[async_trait]
pub trait Classifier: Send + Sync {
    /// Describe the exercise in `image`. Returns the raw answer text, trimmed and non-empty.
    async fn classify(&self, image: &ValidatedImage) -> Result<String, ClassifierError>;
}

/// The instruction sent with every image, built from the catalog's labels
pub fn default_prompt(catalog: &Catalog) -> String {
    let labels = catalog.labels().collect::<Vec<_>>().join(", ");
    format!(
        "This photo was taken in a gym. Identify the exercise being performed, or the exercise machine shown. \
         Answer with exactly one exercise name from this list and nothing else: {labels}. \
         If none of them fit, answer \"unknown\"."
    )
}
