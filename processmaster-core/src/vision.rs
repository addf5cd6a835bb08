//! Vision / text generation client.
//!
//! Provides a `VisionBackend` trait and an Anthropic Messages API
//! implementation used for:
//! - single-screenshot analysis (what action does this frame show?)
//! - step summary synthesis
//! - content enhancement and translation

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::config::VisionConfig;

// ============================================================================
// VisionBackend trait
// ============================================================================

/// Abstraction over hosted multimodal models.
#[async_trait]
pub trait VisionBackend: Send + Sync {
    /// Describe the user action shown in one screenshot. `context` is an
    /// optional hint such as the interaction recorded at the same moment.
    async fn analyze_screenshot(
        &self,
        image: &[u8],
        media_type: &str,
        context: Option<&str>,
    ) -> Result<ScreenshotAnalysis, AiServiceError>;

    /// Produce a prose summary for an ordered list of steps.
    async fn summarize_steps(&self, steps: &[StepOutline]) -> Result<String, AiServiceError>;

    /// Rewrite `content`; `style` is either a tone word ("professional") or a
    /// full instruction.
    async fn enhance_content(&self, content: &str, style: &str) -> Result<String, AiServiceError>;

    async fn translate_content(
        &self,
        content: &str,
        target_language: &str,
    ) -> Result<String, AiServiceError>;

    /// Model identifier for job records and `/ai/models`.
    fn model(&self) -> &str;
}

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub x: f64,
    pub y: f64,
}

/// Model verdict for a single screenshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenshotAnalysis {
    pub action: String,
    pub element: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Coordinates>,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
}

fn default_confidence() -> f32 {
    0.8
}

/// The part of a step that the summary prompt needs.
#[derive(Debug, Clone, Serialize)]
pub struct StepOutline {
    pub action: String,
    pub description: String,
}

#[derive(Error, Debug)]
pub enum AiServiceError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Model reply could not be parsed: {0}")]
    Parse(String),

    #[error("Model reply contained no text")]
    EmptyResponse,

    #[error("Missing API key")]
    MissingApiKey,

    #[error("All {attempts} attempts failed: {last}")]
    RetryExhausted { attempts: usize, last: String },
}

impl AiServiceError {
    /// Network failures, rate limits and 5xx responses are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            AiServiceError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            AiServiceError::Api { code, .. } => *code == 429 || *code == 529 || *code >= 500,
            _ => false,
        }
    }
}

// ============================================================================
// Anthropic Messages API structs (private)
// ============================================================================

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<RequestMessage>,
}

#[derive(Debug, Serialize)]
struct RequestMessage {
    role: &'static str,
    content: Vec<ContentBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Image { source: ImageSource },
    Text { text: String },
}

#[derive(Debug, Serialize)]
struct ImageSource {
    #[serde(rename = "type")]
    kind: &'static str,
    media_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ResponseBlock>,
}

#[derive(Debug, Deserialize)]
struct ResponseBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: Option<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

/// Sampling parameters for one call.
#[derive(Debug, Clone, Copy)]
struct Sampling {
    max_tokens: u32,
    temperature: f32,
}

const ANALYZE: Sampling = Sampling { max_tokens: 1000, temperature: 0.1 };
const SUMMARY: Sampling = Sampling { max_tokens: 500, temperature: 0.1 };
const ENHANCE: Sampling = Sampling { max_tokens: 2000, temperature: 0.3 };
const TRANSLATE: Sampling = Sampling { max_tokens: 2000, temperature: 0.1 };

// ============================================================================
// AnthropicVisionClient
// ============================================================================

#[derive(Debug, Clone)]
pub struct AnthropicVisionClient {
    client: Client,
    config: VisionConfig,
    api_key: String,
    base_url: String,
}

impl AnthropicVisionClient {
    pub fn new(config: VisionConfig) -> Result<Self, AiServiceError> {
        let base_url = config.base_url.clone();
        Self::with_base_url(config, base_url)
    }

    /// Create a client against a custom base URL (for testing / proxies).
    pub fn with_base_url(config: VisionConfig, base_url: String) -> Result<Self, AiServiceError> {
        let api_key = config.resolved_api_key();
        if api_key.is_empty() {
            return Err(AiServiceError::MissingApiKey);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            config,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn complete(
        &self,
        content: Vec<ContentBlock>,
        sampling: Sampling,
    ) -> Result<String, AiServiceError> {
        let request = MessagesRequest {
            model: &self.config.model,
            max_tokens: sampling.max_tokens,
            temperature: sampling.temperature,
            messages: vec![RequestMessage {
                role: "user",
                content,
            }],
        };

        let retry_strategy = ExponentialBackoff::from_millis(self.config.retry_delay_ms)
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(self.config.max_retries);

        let result = RetryIf::spawn(
            retry_strategy,
            || self.complete_once(&request),
            |e: &AiServiceError| e.is_transient(),
        )
        .await;

        match result {
            Ok(text) => Ok(text),
            Err(e) if e.is_transient() => {
                tracing::error!(
                    attempts = self.config.max_retries + 1,
                    error = %e,
                    "All vision API attempts failed"
                );
                Err(AiServiceError::RetryExhausted {
                    attempts: self.config.max_retries + 1,
                    last: e.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn complete_once(&self, request: &MessagesRequest<'_>) -> Result<String, AiServiceError> {
        let url = format!("{}/v1/messages", self.base_url);

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.config.anthropic_version)
            .json(request)
            .send()
            .await?;

        let status = response.status();

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorEnvelope>(&error_body)
                .ok()
                .and_then(|e| e.error)
                .map(|e| e.message)
                .unwrap_or(error_body);

            tracing::warn!(code = status.as_u16(), message = %message, "Vision API error");

            return Err(AiServiceError::Api {
                code: status.as_u16(),
                message,
            });
        }

        let body: MessagesResponse = response.json().await?;
        body.content
            .into_iter()
            .filter(|b| b.kind == "text")
            .find_map(|b| b.text)
            .ok_or(AiServiceError::EmptyResponse)
    }
}

#[async_trait]
impl VisionBackend for AnthropicVisionClient {
    async fn analyze_screenshot(
        &self,
        image: &[u8],
        media_type: &str,
        context: Option<&str>,
    ) -> Result<ScreenshotAnalysis, AiServiceError> {
        let content = vec![
            ContentBlock::Image {
                source: ImageSource {
                    kind: "base64",
                    media_type: media_type.to_string(),
                    data: BASE64.encode(image),
                },
            },
            ContentBlock::Text {
                text: analysis_prompt(context),
            },
        ];

        let reply = self.complete(content, ANALYZE).await?;
        parse_analysis(&reply)
    }

    async fn summarize_steps(&self, steps: &[StepOutline]) -> Result<String, AiServiceError> {
        let steps_json = serde_json::to_string(steps)
            .map_err(|e| AiServiceError::Parse(e.to_string()))?;
        let prompt = format!(
            "Given these step-by-step actions, create a comprehensive guide summary:\n\n\
             Steps: {steps_json}\n\n\
             Provide:\n\
             1. A clear, concise summary of the entire process\n\
             2. Estimated completion time\n\
             3. Difficulty level (beginner/intermediate/advanced)\n\
             4. Any tips or warnings for users"
        );
        self.complete(vec![ContentBlock::Text { text: prompt }], SUMMARY)
            .await
    }

    async fn enhance_content(&self, content: &str, style: &str) -> Result<String, AiServiceError> {
        self.complete(
            vec![ContentBlock::Text {
                text: enhance_prompt(content, style),
            }],
            ENHANCE,
        )
        .await
    }

    async fn translate_content(
        &self,
        content: &str,
        target_language: &str,
    ) -> Result<String, AiServiceError> {
        let prompt = format!(
            "Translate the following process documentation content to {target_language}, \
             maintaining technical accuracy and professional tone:\n\n\
             Content: {content}\n\n\
             Ensure:\n\
             1. Technical terms are accurately translated\n\
             2. UI element names are preserved or appropriately localized\n\
             3. Step-by-step structure is maintained\n\
             4. Professional documentation style is preserved"
        );
        self.complete(vec![ContentBlock::Text { text: prompt }], TRANSLATE)
            .await
    }

    fn model(&self) -> &str {
        &self.config.model
    }
}

// ============================================================================
// Unconfigured backend
// ============================================================================

/// Stands in when no API key is configured. Every call fails with
/// `MissingApiKey`, so AI routes answer 503 while the rest of the API runs.
#[derive(Debug, Clone)]
pub struct UnconfiguredVision {
    model: String,
}

impl UnconfiguredVision {
    pub fn new(model: impl Into<String>) -> Self {
        Self { model: model.into() }
    }
}

#[async_trait]
impl VisionBackend for UnconfiguredVision {
    async fn analyze_screenshot(
        &self,
        _image: &[u8],
        _media_type: &str,
        _context: Option<&str>,
    ) -> Result<ScreenshotAnalysis, AiServiceError> {
        Err(AiServiceError::MissingApiKey)
    }

    async fn summarize_steps(&self, _steps: &[StepOutline]) -> Result<String, AiServiceError> {
        Err(AiServiceError::MissingApiKey)
    }

    async fn enhance_content(&self, _content: &str, _style: &str) -> Result<String, AiServiceError> {
        Err(AiServiceError::MissingApiKey)
    }

    async fn translate_content(
        &self,
        _content: &str,
        _target_language: &str,
    ) -> Result<String, AiServiceError> {
        Err(AiServiceError::MissingApiKey)
    }

    fn model(&self) -> &str {
        &self.model
    }
}

/// The Anthropic client when a key is available, otherwise `UnconfiguredVision`.
pub fn vision_backend(config: VisionConfig) -> Result<Arc<dyn VisionBackend>, AiServiceError> {
    match AnthropicVisionClient::new(config.clone()) {
        Ok(client) => Ok(Arc::new(client)),
        Err(AiServiceError::MissingApiKey) => {
            tracing::warn!(model = %config.model, "No vision API key configured; AI endpoints will return 503");
            Ok(Arc::new(UnconfiguredVision::new(config.model)))
        }
        Err(e) => Err(e),
    }
}

// ============================================================================
// Prompts and reply parsing
// ============================================================================

fn analysis_prompt(context: Option<&str>) -> String {
    let context_line = context
        .filter(|c| !c.trim().is_empty())
        .map(|c| format!("Context: {c}\n\n"))
        .unwrap_or_default();

    format!(
        "Analyze this screenshot and identify the user interface elements and the action being performed.\n\n\
         {context_line}\
         Return a JSON response with the following structure:\n\
         {{\n\
           \"action\": \"brief description of the action (e.g., 'click', 'type', 'navigate')\",\n\
           \"element\": \"description of the UI element being interacted with\",\n\
           \"description\": \"detailed step description in natural language\",\n\
           \"coordinates\": {{\"x\": number, \"y\": number}} (if clickable element detected),\n\
           \"confidence\": number (0-1)\n\
         }}\n\n\
         Focus on:\n\
         1. Identifying clickable elements (buttons, links, form fields)\n\
         2. Understanding the user's intent\n\
         3. Providing clear, actionable instructions\n\
         4. Detecting form inputs, navigation, and interactions\n\n\
         Respond with the JSON object only."
    )
}

/// A single word is treated as a tone; anything longer is a full instruction.
fn enhance_prompt(content: &str, style: &str) -> String {
    let style = style.trim();
    if style.contains(char::is_whitespace) {
        return format!("{style}\n\nContent:\n{content}");
    }
    let style = if style.is_empty() { "professional" } else { style };
    format!(
        "Enhance the following process documentation content to be more {style} and user-friendly:\n\n\
         Original content: {content}\n\n\
         Improve:\n\
         1. Clarity and readability\n\
         2. Professional tone\n\
         3. Actionable instructions\n\
         4. Error prevention tips\n\
         5. User experience considerations\n\n\
         Return only the enhanced content, maintaining the same structure."
    )
}

fn fenced_block() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").ok())
        .as_ref()
}

/// Extract the JSON object from a model reply. Tolerates code fences and
/// surrounding prose.
pub fn parse_analysis(reply: &str) -> Result<ScreenshotAnalysis, AiServiceError> {
    let candidate = if let Some(caps) = fenced_block().and_then(|re| re.captures(reply)) {
        caps.get(1).map(|m| m.as_str()).unwrap_or(reply)
    } else {
        match (reply.find('{'), reply.rfind('}')) {
            (Some(start), Some(end)) if end > start => &reply[start..=end],
            _ => return Err(AiServiceError::Parse("no JSON object in reply".to_string())),
        }
    };

    let mut analysis: ScreenshotAnalysis =
        serde_json::from_str(candidate).map_err(|e| AiServiceError::Parse(e.to_string()))?;
    analysis.confidence = analysis.confidence.clamp(0.0, 1.0);
    Ok(analysis)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config() -> VisionConfig {
        VisionConfig {
            api_key: "test-api-key".to_string(),
            model: "claude-test".to_string(),
            max_retries: 2,
            retry_delay_ms: 10,
            timeout_secs: 5,
            ..VisionConfig::default()
        }
    }

    fn text_reply(text: &str) -> serde_json::Value {
        serde_json::json!({
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "content": [{ "type": "text", "text": text }]
        })
    }

    #[test]
    fn test_parse_plain_json() {
        let a = parse_analysis(
            r#"{"action":"click","element":"Save button","description":"Click Save","confidence":0.9}"#,
        )
        .unwrap();
        assert_eq!(a.action, "click");
        assert!(a.coordinates.is_none());
        assert!((a.confidence - 0.9).abs() < f32::EPSILON);
    }

    #[test]
    fn test_parse_fenced_json_with_prose() {
        let reply = "Here is the analysis:\n```json\n{\"action\":\"type\",\"element\":\"Email field\",\
                     \"description\":\"Enter your email\",\"coordinates\":{\"x\":10,\"y\":20}}\n```\nDone.";
        let a = parse_analysis(reply).unwrap();
        assert_eq!(a.element, "Email field");
        assert_eq!(a.coordinates, Some(Coordinates { x: 10.0, y: 20.0 }));
        assert!((a.confidence - 0.8).abs() < f32::EPSILON, "default confidence");
    }

    #[test]
    fn test_parse_clamps_confidence() {
        let a = parse_analysis(
            r#"{"action":"a","element":"e","description":"d","confidence":7}"#,
        )
        .unwrap();
        assert_eq!(a.confidence, 1.0);
    }

    #[test]
    fn test_parse_rejects_non_json() {
        assert!(matches!(
            parse_analysis("I cannot see an image."),
            Err(AiServiceError::Parse(_))
        ));
    }

    #[test]
    fn test_enhance_prompt_tone_vs_instruction() {
        assert!(enhance_prompt("x", "concise").contains("to be more concise"));
        assert!(enhance_prompt("x", "").contains("to be more professional"));
        let p = enhance_prompt("body", "Shorten this for a mobile screen");
        assert!(p.starts_with("Shorten this for a mobile screen"));
        assert!(p.ends_with("body"));
    }

    #[test]
    fn test_missing_api_key() {
        let config = VisionConfig {
            api_key: String::new(),
            ..test_config()
        };
        if std::env::var("ANTHROPIC_API_KEY").is_ok() {
            return;
        }
        assert!(matches!(
            AnthropicVisionClient::new(config),
            Err(AiServiceError::MissingApiKey)
        ));
    }

    #[tokio::test]
    async fn test_backend_without_key_is_unconfigured() {
        if std::env::var("ANTHROPIC_API_KEY").is_ok() {
            return;
        }
        let backend = vision_backend(VisionConfig {
            api_key: String::new(),
            ..test_config()
        })
        .unwrap();
        assert_eq!(backend.model(), "claude-test");
        assert!(matches!(
            backend.enhance_content("text", "concise").await,
            Err(AiServiceError::MissingApiKey)
        ));
        assert!(matches!(
            backend.analyze_screenshot(&[1], "image/png", None).await,
            Err(AiServiceError::MissingApiKey)
        ));
    }

    #[tokio::test]
    async fn test_analyze_screenshot_sends_image_block() {
        let mock_server = MockServer::start().await;
        let client = AnthropicVisionClient::with_base_url(test_config(), mock_server.uri()).unwrap();

        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "test-api-key"))
            .and(body_partial_json(serde_json::json!({
                "model": "claude-test",
                "max_tokens": 1000,
                "messages": [{
                    "role": "user",
                    "content": [{
                        "type": "image",
                        "source": { "type": "base64", "media_type": "image/png", "data": "AQID" }
                    }]
                }]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(text_reply(
                r#"{"action":"click","element":"Submit","description":"Click Submit","confidence":0.95}"#,
            )))
            .expect(1)
            .mount(&mock_server)
            .await;

        let analysis = client
            .analyze_screenshot(&[1, 2, 3], "image/png", Some("User performed a click"))
            .await
            .unwrap();
        assert_eq!(analysis.element, "Submit");
    }

    #[tokio::test]
    async fn test_retries_on_529_then_succeeds() {
        let mock_server = MockServer::start().await;
        let client = AnthropicVisionClient::with_base_url(test_config(), mock_server.uri()).unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(529).set_body_json(serde_json::json!({
                "type": "error",
                "error": { "type": "overloaded_error", "message": "Overloaded" }
            })))
            .up_to_n_times(1)
            .mount(&mock_server)
            .await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(text_reply("A short summary.")))
            .mount(&mock_server)
            .await;

        let summary = client
            .summarize_steps(&[StepOutline {
                action: "click".to_string(),
                description: "Click Save".to_string(),
            }])
            .await
            .unwrap();
        assert_eq!(summary, "A short summary.");
    }

    #[tokio::test]
    async fn test_500_exhausts_retries() {
        let mock_server = MockServer::start().await;
        let client = AnthropicVisionClient::with_base_url(test_config(), mock_server.uri()).unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_json(serde_json::json!({
                "error": { "type": "api_error", "message": "boom" }
            })))
            .expect(3)
            .mount(&mock_server)
            .await;

        match client.enhance_content("text", "professional").await {
            Err(AiServiceError::RetryExhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(last.contains("boom"));
            }
            other => panic!("Expected RetryExhausted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_400_is_not_retried() {
        let mock_server = MockServer::start().await;
        let client = AnthropicVisionClient::with_base_url(test_config(), mock_server.uri()).unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": { "type": "invalid_request_error", "message": "bad image" }
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        match client.translate_content("hola", "English").await {
            Err(AiServiceError::Api { code, message }) => {
                assert_eq!(code, 400);
                assert_eq!(message, "bad image");
            }
            other => panic!("Expected Api error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unparseable_analysis_is_error() {
        let mock_server = MockServer::start().await;
        let client = AnthropicVisionClient::with_base_url(test_config(), mock_server.uri()).unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(text_reply("no json here")))
            .mount(&mock_server)
            .await;

        let result = client.analyze_screenshot(&[0u8; 4], "image/png", None).await;
        assert!(matches!(result, Err(AiServiceError::Parse(_))));
    }
}
