//! Client for `OpenAI`-compatible chat-completions endpoints with vision
//! input.
//!
//! Works against any server exposing `POST {api_base}/chat/completions`
//! (hosted `OpenAI`, vLLM, `LiteLLM` and similar gateways). The image is sent
//! inline as a base64 data URL. Regions are described in the prompt using the
//! tagged box form, which grounding-capable models understand.
//!
//! ## Error Classification
//!
//! | Condition | Error | Retried |
//! |-----------|-------|---------|
//! | network failure, timeout | `Transport` | yes |
//! | HTTP 429, 5xx | `Transport` | yes |
//! | other HTTP 4xx | `Rejected` | no |
//! | empty or malformed body | `Content` | no |

use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use super::{AnnotationRequest, AnnotationService};
use crate::error::AnnotationError;
use crate::retry::{retry, RetryPolicy};

/// Default per-call timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(180);

const SYSTEM_PROMPT: &str =
    "You are a professional circuit diagram analysis assistant. Answer in the format the user asks for.";
const SYSTEM_PROMPT_JSON: &str = "You are a professional circuit diagram analysis assistant. \
Always reply with one raw JSON object: no Markdown code fences, no text before or after it.";

/// Connection settings for one endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointConfig {
    /// Label used as the source key in persisted records.
    pub label: String,
    /// Base URL, e.g. `https://api.openai.com/v1`.
    pub api_base: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl EndpointConfig {
    #[must_use]
    pub fn new(label: impl Into<String>, api_base: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            api_base: api_base.into(),
            api_key: String::new(),
            model: model.into(),
            temperature: 0.1,
            max_tokens: 2048,
            timeout: DEFAULT_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.api_base.trim_end_matches('/'))
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Debug, Serialize)]
struct Message {
    role: &'static str,
    #[serde(flatten)]
    content: MessageContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum MessageContent {
    Text { content: String },
    Multimodal { content: Vec<ContentPart> },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
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

/// HTTP client for one `OpenAI`-compatible endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleClient {
    http_client: Client,
    config: EndpointConfig,
}

impl OpenAiCompatibleClient {
    /// Build a client with the endpoint's timeout.
    ///
    /// # Errors
    ///
    /// Returns `Transport` if the HTTP client cannot be constructed.
    pub fn new(config: EndpointConfig) -> Result<Self, AnnotationError> {
        let http_client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AnnotationError::Transport(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            http_client,
            config,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &EndpointConfig {
        &self.config
    }

    async fn send_once(&self, body: &ChatRequest<'_>) -> Result<String, AnnotationError> {
        let mut request = self.http_client.post(self.config.completions_url()).json(body);
        if !self.config.api_key.is_empty() {
            request = request.bearer_auth(&self.config.api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AnnotationError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, error_text));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| AnnotationError::Content(format!("malformed response body: {e}")))?;

        chat.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| AnnotationError::Content("model returned no content".to_string()))
    }
}

#[async_trait]
impl AnnotationService for OpenAiCompatibleClient {
    fn label(&self) -> &str {
        &self.config.label
    }

    async fn generate(&self, request: &AnnotationRequest) -> Result<String, AnnotationError> {
        let image_url = encode_image(&request.image_path).await?;
        let body = ChatRequest {
            model: &self.config.model,
            messages: vec![
                Message {
                    role: "system",
                    content: MessageContent::Text {
                        content: if request.expect_json {
                            SYSTEM_PROMPT_JSON
                        } else {
                            SYSTEM_PROMPT
                        }
                        .to_string(),
                    },
                },
                Message {
                    role: "user",
                    content: MessageContent::Multimodal {
                        content: vec![
                            ContentPart::Text {
                                text: render_prompt(request),
                            },
                            ContentPart::ImageUrl {
                                image_url: ImageUrl { url: image_url },
                            },
                        ],
                    },
                },
            ],
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            response_format: request.expect_json.then_some(ResponseFormat {
                format_type: "json_object",
            }),
        };

        debug!(
            "{} -> {} ({} prompt chars)",
            self.config.label,
            self.config.model,
            request.prompt.len()
        );
        retry(&self.config.retry, AnnotationError::is_retryable, || {
            self.send_once(&body)
        })
        .await
    }
}

/// Map a non-success HTTP status onto the error taxonomy.
fn classify_status(status: StatusCode, body: String) -> AnnotationError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        AnnotationError::Transport(format!("API error ({status}): {body}"))
    } else {
        AnnotationError::Rejected {
            status: status.as_u16(),
            message: body,
        }
    }
}

fn render_prompt(request: &AnnotationRequest) -> String {
    match request.region {
        Some(region) => format!("{}\n\nRegion of interest: {}", request.prompt, region.to_tagged()),
        None => request.prompt.clone(),
    }
}

async fn encode_image(path: &Path) -> Result<String, AnnotationError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|source| AnnotationError::Image {
            path: path.to_path_buf(),
            source,
        })?;
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    Ok(format!("data:{};base64,{encoded}", mime_type(path)))
}

fn mime_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("bmp") => "image/bmp",
        Some("tif" | "tiff") => "image/tiff",
        _ => "image/jpeg",
    }
}
