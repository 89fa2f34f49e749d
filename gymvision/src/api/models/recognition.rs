use crate::recognition::RecognitionOutcome;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub const QUOTA_EXHAUSTED_MESSAGE: &str = "Monthly recognition limit reached. Your credits renew at the start of next month.";

// Request models

/// JSON body for `POST /api/recognize-exercise`. Exactly one field must be set.
///
/// Multipart uploads (field `image`) are accepted on the same endpoint.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct RecognitionRequest {
    /// Base64 image, raw or as a `data:image/...;base64,` URL
    pub image: Option<String>,
    /// http(s) URL of an image to fetch
    pub image_url: Option<String>,
}

// Response models

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RecognitionResponse {
    /// Canonical exercise label, or `unknown exercise`
    #[schema(example = "bench press")]
    pub exercise: String,
    /// Set when the request was refused (quota exhausted)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set alongside `error` when the quota is exhausted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credits_remaining: Option<i32>,
    /// The classifier was unavailable; nothing was charged and retrying may succeed
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub transient: bool,
}

impl RecognitionResponse {
    pub fn exercise(exercise: impl Into<String>) -> Self {
        Self {
            exercise: exercise.into(),
            error: None,
            credits_remaining: None,
            transient: false,
        }
    }
}

/// 400 body for unusable images
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ImageErrorResponse {
    pub error: String,
}

/// Client-facing view of an outcome. Raw classifier text and error internals stay server-side.
impl From<&RecognitionOutcome> for RecognitionResponse {
    fn from(outcome: &RecognitionOutcome) -> Self {
        let mut response = RecognitionResponse::exercise(outcome.exercise());
        match outcome {
            RecognitionOutcome::QuotaExhausted { credits_remaining } => {
                response.error = Some(QUOTA_EXHAUSTED_MESSAGE.to_string());
                response.credits_remaining = Some(*credits_remaining);
            }
            RecognitionOutcome::ClassifierFailed { .. } => response.transient = true,
            RecognitionOutcome::Recognized { .. } | RecognitionOutcome::Unrecognized { .. } | RecognitionOutcome::InvalidImage(_) => {}
        }
        response
    }
}
