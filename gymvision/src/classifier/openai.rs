//! Classifier backed by an OpenAI-compatible `chat/completions` endpoint with image input.

use super::{Classifier, ClassifierError};
use crate::recognition::image::ValidatedImage;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument};
use url::Url;

#[derive(Debug, Clone)]
pub struct OpenAIClassifier {
    client: Client,
    base_url: Url,
    api_key: String,
    model: String,
    max_tokens: u32,
    prompt: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: [ChatMessage<'a>; 1],
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: [ContentPart<'a>; 2],
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

/// Makes sure a url has a trailing slash, so that `join` appends to the path instead of
/// replacing its last segment.
fn ensure_slash(url: &Url) -> Url {
    if url.path().ends_with('/') {
        url.clone()
    } else {
        let mut new_url = url.clone();
        let mut path = new_url.path().to_string();
        path.push('/');
        new_url.set_path(&path);
        new_url
    }
}

impl OpenAIClassifier {
    pub fn new(client: Client, base_url: Url, api_key: String, model: String, max_tokens: u32, prompt: String) -> Self {
        Self {
            client,
            base_url,
            api_key,
            model,
            max_tokens,
            prompt,
        }
    }
}

#[async_trait]
impl Classifier for OpenAIClassifier {
    #[instrument(skip_all, fields(model = %self.model, image_bytes = image.len()))]
    async fn classify(&self, image: &ValidatedImage) -> Result<String, ClassifierError> {
        let url = ensure_slash(&self.base_url)
            .join("chat/completions")
            .map_err(|e| ClassifierError::Transport(format!("failed to construct completions URL: {e}")))?;

        let body = ChatCompletionRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            temperature: 0.0,
            messages: [ChatMessage {
                role: "user",
                content: [
                    ContentPart::Text { text: &self.prompt },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl { url: image.data_url() },
                    },
                ],
            }],
        };

        let response = self
            .client
            .post(url.clone())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ClassifierError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(%url, %status, body = %body, "Classifier request failed");
            return Err(ClassifierError::Upstream { status: status.as_u16() });
        }

        let body_text = response.text().await.map_err(|e| ClassifierError::Transport(e.to_string()))?;
        let parsed: ChatCompletionResponse = serde_json::from_str(&body_text).map_err(|e| {
            error!(error = %e, body = %body_text, "Failed to parse classifier response");
            ClassifierError::Decode(e.to_string())
        })?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or(ClassifierError::EmptyResponse)?;

        debug!(answer = %text, "Classifier answered");
        Ok(text)
    }
}
