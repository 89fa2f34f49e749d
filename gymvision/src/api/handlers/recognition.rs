use crate::{
    AppState,
    api::models::recognition::{ImageErrorResponse, RecognitionRequest, RecognitionResponse},
    auth::CurrentUser,
    errors::Result,
    metrics,
    recognition::{RecognitionOutcome, image::ImageInput},
};
use axum::{
    extract::{FromRequest, Multipart, Request, State},
    http::{StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Json, Response},
};
use bytes::Bytes;
use tracing::{debug, instrument};

/// Recognize the exercise in a photo
#[utoipa::path(
    post,
    path = "/recognize-exercise",
    tag = "recognition",
    summary = "Recognize the exercise in a photo",
    description = "Classify a gym photo and return the canonical exercise name. Costs one credit when the \
                   classifier answers, including when the answer matches no known exercise. Classifier \
                   failures are not charged and are marked `transient`. An exhausted quota is reported with \
                   HTTP 200 and an `error` message. Accepts a multipart upload (field `image`) or JSON.",
    request_body(content = RecognitionRequest, content_type = "application/json"),
    responses(
        (status = 200, description = "Recognition finished", body = RecognitionResponse),
        (status = 400, description = "Missing, malformed or oversized image", body = ImageErrorResponse),
        (status = 401, description = "Missing or invalid user header"),
        (status = 500, description = "Internal server error"),
    ),
    security(
        ("X-GymVision-User" = [])
    )
)]
#[instrument(skip_all, fields(user = %current_user.id))]
pub async fn recognize_exercise(State(state): State<AppState>, current_user: CurrentUser, request: Request) -> Result<Response> {
    let input = match image_input(&state, request).await {
        Ok(input) => input,
        Err(message) => {
            debug!(%message, "Rejected recognition request");
            metrics::record_recognition_outcome("invalid_image");
            return Ok(invalid_image(message));
        }
    };

    let outcome = state.pipeline.recognize_detached(current_user.id, input).await?;

    Ok(match &outcome {
        RecognitionOutcome::InvalidImage(e) => invalid_image(e.to_string()),
        other => Json(RecognitionResponse::from(other)).into_response(),
    })
}

fn invalid_image(error: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(ImageErrorResponse { error })).into_response()
}

/// Pull the image out of a multipart or JSON body. Errors are client-facing messages.
async fn image_input(state: &AppState, request: Request) -> std::result::Result<ImageInput, String> {
    let is_multipart = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().starts_with("multipart/form-data"));

    if is_multipart {
        let mut multipart = Multipart::from_request(request, state).await.map_err(|e| e.body_text())?;

        // The `image` field wins; otherwise take the first uploaded file
        let mut first_file = None;
        while let Some(field) = multipart.next_field().await.map_err(|e| e.body_text())? {
            let named_image = field.name() == Some("image");
            if !named_image && (field.file_name().is_none() || first_file.is_some()) {
                continue;
            }

            let content_type = field.content_type().map(str::to_string);
            let data = field.bytes().await.map_err(|e| e.body_text())?;
            let input = ImageInput::Bytes { data, content_type };
            if named_image {
                return Ok(input);
            }
            first_file = Some(input);
        }
        return first_file.ok_or_else(|| "multipart body has no 'image' field".to_string());
    }

    let body = Bytes::from_request(request, state).await.map_err(|e| e.body_text())?;
    let request: RecognitionRequest = serde_json::from_slice(&body).map_err(|e| format!("invalid JSON body: {e}"))?;
    match (request.image, request.image_url) {
        (Some(image), None) => Ok(ImageInput::Base64(image)),
        (None, Some(url)) => Ok(ImageInput::Url(url)),
        (None, None) => Err("request must include 'image' or 'image_url'".to_string()),
        (Some(_), Some(_)) => Err("provide either 'image' or 'image_url', not both".to_string()),
    }
}
