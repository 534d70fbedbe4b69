//! Clients for the multimodal language models that write the comparison text.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::json;

use facecomp_vision::loader::guess_media_type;
use facecomp_vision::SimilarityScore;

use crate::config::{NarrativeConfig, Provider};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Base64 image attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub media_type: &'static str,
    /// Standard base64, with padding.
    pub data: String,
}

impl EncodedImage {
    pub fn from_bytes(raw: &[u8]) -> Self {
        Self {
            media_type: guess_media_type(raw),
            data: base64::engine::general_purpose::STANDARD.encode(raw),
        }
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.media_type, self.data)
    }
}

#[derive(Debug, Clone)]
pub struct NarrativeRequest {
    pub score: SimilarityScore,
    pub images: [EncodedImage; 2],
    /// Per image, whether no face was detected.
    pub missing_faces: [bool; 2],
}

#[derive(Debug, thiserror::Error)]
pub enum NarrativeError {
    #[error("narrative request failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("narrative request timed out after {0:?}")]
    Timeout(Duration),

    #[error("narrative provider returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed narrative response: {0}")]
    Malformed(String),
}

impl NarrativeError {
    /// Transport failures, timeouts, 429 and 5xx are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            NarrativeError::Transport(_) | NarrativeError::Timeout(_) => true,
            NarrativeError::Status { status, .. } => *status == 429 || *status >= 500,
            NarrativeError::Malformed(_) => false,
        }
    }
}

/// Writes free-form text about a scored image pair.
#[async_trait]
pub trait NarrativeGenerator: Send + Sync {
    async fn describe(&self, request: &NarrativeRequest) -> Result<String, NarrativeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PromptStyle {
    /// Neutral feature by feature comparison.
    #[default]
    Analysis,
    /// Compatibility reading of two anonymous people.
    Matchmaking,
}

pub fn build_prompt(style: PromptStyle, score: SimilarityScore, missing_faces: [bool; 2]) -> String {
    let mut prompt = match style {
        PromptStyle::Analysis => format!(
            "You are comparing two anonymous facial photographs. Their facial similarity score is \
             {score} on a scale from 0 to 1, where 1 means identical features.\n\n\
             Do not try to identify anyone. The people shown are private individuals; do not \
             compare them to celebrities or public figures.\n\n\
             Give an objective analysis in markdown with these sections:\n\n\
             1. **Facial similarity**: what a score of {score} suggests, and the notable shared \
             or differing features.\n\
             2. **Age estimate**: an approximate age range for each photo.\n\
             3. **Visible context**: background, clothing and accessories, without guessing at \
             lifestyle.\n\
             4. **Expressions**: the expression in each photo and how they differ.\n\
             5. **Summary**: the key points of the comparison.\n\n\
             Keep a professional tone and stick to what is visible."
        ),
        PromptStyle::Matchmaking => format!(
            "You assist a matchmaking service. Two anonymous people, called John Doe (first \
             image) and Jane Doe (second image), have a facial similarity score of {score} on a \
             scale from 0 to 1, where 1 means identical faces.\n\n\
             Do not try to identify them.\n\n\
             Cover, in order:\n\n\
             1. Overall facial harmony between the two.\n\
             2. Eyes, nose, mouth and face shape: similarities and differences.\n\
             3. Expressions and the impression they give.\n\
             4. Approximate ages and visible style or grooming.\n\
             5. What the score might suggest about compatibility, remembering that appearance \
             is only one factor.\n\
             6. How the two might look together as a couple.\n\n\
             Be balanced and tactful and avoid absolute statements. Start the analysis directly."
        ),
    };

    let missing: Vec<&str> = missing_faces
        .iter()
        .zip(["first", "second"])
        .filter_map(|(&missing, which)| missing.then_some(which))
        .collect();
    if !missing.is_empty() {
        prompt.push_str(&format!(
            "\n\nNote: no face could be detected in the {} image{}, which is why the score is {}. \
             Mention this in your answer.",
            missing.join(" and "),
            if missing.len() > 1 { "s" } else { "" },
            score
        ));
    }
    prompt
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): `backoff * 2^attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(1u32 << attempt.min(16))
    }
}

/// Settings shared by the HTTP providers.
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub style: PromptStyle,
}

impl From<&NarrativeConfig> for HttpSettings {
    fn from(cfg: &NarrativeConfig) -> Self {
        Self {
            base_url: cfg.base_url().to_string(),
            model: cfg.model().to_string(),
            max_tokens: cfg.max_tokens,
            timeout: Duration::from_secs(cfg.timeout_secs),
            retry: RetryPolicy {
                max_retries: cfg.max_retries,
                backoff: Duration::from_millis(cfg.backoff_ms),
            },
            style: cfg.prompt,
        }
    }
}

async fn with_retry<F, Fut>(
    provider: &str,
    policy: RetryPolicy,
    mut attempt: F,
) -> Result<String, NarrativeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<String, NarrativeError>>,
{
    let mut retries = 0;
    loop {
        match attempt().await {
            Err(e) if e.is_retryable() && retries < policy.max_retries => {
                let delay = policy.delay(retries);
                log::warn!(
                    "{}: {} (retry {}/{} in {:?})",
                    provider,
                    e,
                    retries + 1,
                    policy.max_retries,
                    delay
                );
                tokio::time::sleep(delay).await;
                retries += 1;
            }
            result => return result,
        }
    }
}

/// Send one request with a deadline and return the body of a 2xx response.
async fn post_json(
    request: reqwest::RequestBuilder,
    timeout: Duration,
) -> Result<String, NarrativeError> {
    let exchange = async {
        let response = request.send().await.map_err(NarrativeError::Transport)?;
        let status = response.status();
        let body = response.text().await.map_err(NarrativeError::Transport)?;
        if !status.is_success() {
            return Err(NarrativeError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    };
    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| NarrativeError::Timeout(timeout))?
}

/// Messages API client.
pub struct AnthropicNarrator {
    client: reqwest::Client,
    api_key: String,
    settings: HttpSettings,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicBlock>,
}

#[derive(Deserialize)]
struct AnthropicBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

impl AnthropicNarrator {
    pub fn new(api_key: String, settings: HttpSettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            settings,
        }
    }

    fn body(&self, request: &NarrativeRequest) -> serde_json::Value {
        let prompt = build_prompt(self.settings.style, request.score, request.missing_faces);
        let mut content = vec![json!({ "type": "text", "text": prompt })];
        content.extend(request.images.iter().map(|image| {
            json!({
                "type": "image",
                "source": {
                    "type": "base64",
                    "media_type": image.media_type,
                    "data": image.data,
                }
            })
        }));
        json!({
            "model": self.settings.model,
            "max_tokens": self.settings.max_tokens,
            "messages": [{ "role": "user", "content": content }],
        })
    }

    fn parse(body: &str) -> Result<String, NarrativeError> {
        let response: AnthropicResponse =
            serde_json::from_str(body).map_err(|e| NarrativeError::Malformed(e.to_string()))?;
        response
            .content
            .into_iter()
            .find(|block| block.kind == "text")
            .and_then(|block| block.text)
            .ok_or_else(|| NarrativeError::Malformed("no text block in response".to_string()))
    }
}

#[async_trait]
impl NarrativeGenerator for AnthropicNarrator {
    async fn describe(&self, request: &NarrativeRequest) -> Result<String, NarrativeError> {
        let url = format!("{}/v1/messages", self.settings.base_url);
        let body = self.body(request);
        let raw = with_retry("anthropic", self.settings.retry, || {
            post_json(
                self.client
                    .post(&url)
                    .header("x-api-key", &self.api_key)
                    .header("anthropic-version", ANTHROPIC_VERSION)
                    .json(&body),
                self.settings.timeout,
            )
        })
        .await?;
        Self::parse(&raw)
    }
}

/// Chat Completions client.
pub struct OpenAiNarrator {
    client: reqwest::Client,
    api_key: String,
    settings: HttpSettings,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

impl OpenAiNarrator {
    pub fn new(api_key: String, settings: HttpSettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            settings,
        }
    }

    fn body(&self, request: &NarrativeRequest) -> serde_json::Value {
        let prompt = build_prompt(self.settings.style, request.score, request.missing_faces);
        let mut content = vec![json!({ "type": "text", "text": prompt })];
        content.extend(request.images.iter().map(|image| {
            json!({ "type": "image_url", "image_url": { "url": image.data_url() } })
        }));
        json!({
            "model": self.settings.model,
            "max_tokens": self.settings.max_tokens,
            "messages": [{ "role": "user", "content": content }],
        })
    }

    fn parse(body: &str) -> Result<String, NarrativeError> {
        let response: ChatResponse =
            serde_json::from_str(body).map_err(|e| NarrativeError::Malformed(e.to_string()))?;
        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| NarrativeError::Malformed("no message content in response".to_string()))
    }
}

#[async_trait]
impl NarrativeGenerator for OpenAiNarrator {
    async fn describe(&self, request: &NarrativeRequest) -> Result<String, NarrativeError> {
        let url = format!("{}/v1/chat/completions", self.settings.base_url);
        let body = self.body(request);
        let raw = with_retry("openai", self.settings.retry, || {
            post_json(
                self.client
                    .post(&url)
                    .bearer_auth(&self.api_key)
                    .json(&body),
                self.settings.timeout,
            )
        })
        .await?;
        Self::parse(&raw)
    }
}

/// Build the configured provider client around an already loaded credential.
pub fn build_narrator(cfg: &NarrativeConfig, api_key: String) -> Box<dyn NarrativeGenerator> {
    let settings = HttpSettings::from(cfg);
    log::info!(
        "Narrative provider: {:?}, model {} at {}",
        cfg.provider,
        settings.model,
        settings.base_url
    );
    match cfg.provider {
        Provider::Anthropic => Box::new(AnthropicNarrator::new(api_key, settings)),
        Provider::Openai => Box::new(OpenAiNarrator::new(api_key, settings)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn request(missing_faces: [bool; 2]) -> NarrativeRequest {
        let image = EncodedImage {
            media_type: "image/png",
            data: "AAAA".to_string(),
        };
        NarrativeRequest {
            score: SimilarityScore::clamped(0.4567),
            images: [image.clone(), image],
            missing_faces,
        }
    }

    fn settings(style: PromptStyle) -> HttpSettings {
        HttpSettings {
            base_url: "http://127.0.0.1:9".to_string(),
            model: "test-model".to_string(),
            max_tokens: 123,
            timeout: Duration::from_secs(1),
            retry: RetryPolicy {
                max_retries: 0,
                backoff: Duration::from_millis(1),
            },
            style,
        }
    }

    #[test]
    fn test_prompt_formats_score_with_two_decimals() {
        for style in [PromptStyle::Analysis, PromptStyle::Matchmaking] {
            let prompt = build_prompt(style, SimilarityScore::clamped(0.4567), [false, false]);
            assert!(prompt.contains("0.46"), "{}", prompt);
            assert!(!prompt.contains("0.4567"));
            assert!(!prompt.contains("no face could be detected"));
        }
    }

    #[test]
    fn test_prompt_mentions_missing_faces() {
        let prompt = build_prompt(PromptStyle::Analysis, SimilarityScore::ZERO, [false, true]);
        assert!(prompt.contains("in the second image,"));
        assert!(prompt.contains("0.00"));

        let prompt = build_prompt(PromptStyle::Analysis, SimilarityScore::ZERO, [true, true]);
        assert!(prompt.contains("first and second images"));
    }

    #[test]
    fn test_encoded_image() {
        let png = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0, 0];
        let image = EncodedImage::from_bytes(&png);
        assert_eq!(image.media_type, "image/png");
        assert_eq!(image.data, "iVBORw0KGgoAAA==");
        assert!(image.data_url().starts_with("data:image/png;base64,iVBOR"));
    }

    #[test]
    fn test_retry_classification() {
        let status = |status| NarrativeError::Status {
            status,
            body: String::new(),
        };
        assert!(status(429).is_retryable());
        assert!(status(500).is_retryable());
        assert!(status(529).is_retryable());
        assert!(!status(400).is_retryable());
        assert!(!status(401).is_retryable());
        assert!(NarrativeError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!NarrativeError::Malformed("x".into()).is_retryable());
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy {
            max_retries: 3,
            backoff: Duration::from_millis(500),
        };
        assert_eq!(policy.delay(0), Duration::from_millis(500));
        assert_eq!(policy.delay(1), Duration::from_millis(1000));
        assert_eq!(policy.delay(2), Duration::from_millis(2000));
    }

    #[tokio::test]
    async fn test_with_retry_stops_after_budget() {
        let calls = &AtomicU32::new(0);
        let policy = RetryPolicy {
            max_retries: 2,
            backoff: Duration::from_millis(1),
        };
        let result = with_retry("test", policy, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(NarrativeError::Status {
                status: 503,
                body: "busy".into(),
            })
        })
        .await;
        assert!(matches!(result, Err(NarrativeError::Status { status: 503, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_does_not_repeat_client_errors() {
        let calls = &AtomicU32::new(0);
        let policy = RetryPolicy {
            max_retries: 5,
            backoff: Duration::from_millis(1),
        };
        let result = with_retry("test", policy, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(NarrativeError::Status {
                status: 400,
                body: "bad".into(),
            })
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_anthropic_body_and_parse() {
        let narrator = AnthropicNarrator::new("k".into(), settings(PromptStyle::Analysis));
        let body = narrator.body(&request([false, false]));
        assert_eq!(body["model"], "test-model");
        assert_eq!(body["max_tokens"], 123);
        let content = body["messages"][0]["content"].as_array().unwrap();
        assert_eq!(content.len(), 3);
        assert_eq!(content[0]["type"], "text");
        assert_eq!(content[1]["source"]["media_type"], "image/png");
        assert_eq!(content[2]["source"]["data"], "AAAA");

        let text = AnthropicNarrator::parse(
            r#"{"content":[{"type":"thinking"},{"type":"text","text":"hello"}]}"#,
        )
        .unwrap();
        assert_eq!(text, "hello");
        assert!(matches!(
            AnthropicNarrator::parse(r#"{"content":[]}"#),
            Err(NarrativeError::Malformed(_))
        ));
        assert!(AnthropicNarrator::parse("<html>").is_err());
    }

    #[test]
    fn test_openai_body_and_parse() {
        let narrator = OpenAiNarrator::new("k".into(), settings(PromptStyle::Matchmaking));
        let body = narrator.body(&request([true, false]));
        let content = body["messages"][0]["content"].as_array().unwrap();
        assert_eq!(content[1]["type"], "image_url");
        assert_eq!(content[1]["image_url"]["url"], "data:image/png;base64,AAAA");

        let text =
            OpenAiNarrator::parse(r#"{"choices":[{"message":{"content":"hi there"}}]}"#).unwrap();
        assert_eq!(text, "hi there");
        assert!(OpenAiNarrator::parse(r#"{"choices":[]}"#).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_provider_is_transport_error() {
        let narrator = AnthropicNarrator::new("k".into(), settings(PromptStyle::Analysis));
        let err = narrator.describe(&request([false, false])).await.unwrap_err();
        assert!(
            matches!(err, NarrativeError::Transport(_) | NarrativeError::Timeout(_)),
            "{:?}",
            err
        );
    }
}
