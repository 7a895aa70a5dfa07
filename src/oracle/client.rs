use super::models::{Provider, Tier, Usage};
use crate::config::{ApiKeys, OracleConfig};
use rand::Rng;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const OPENAI_URL: &str = "https://api.openai.com/v1/chat/completions";
const GEMINI_URL: &str = "https://generativelanguage.googleapis.com/v1/models";
const REPLICATE_URL: &str = "https://api.replicate.com/v1/models";

/// Persona used when the caller gives none.
pub const DEFAULT_SYSTEM_ROLE: &str = "You are a helpful assistant.";

/// Upper bound of the single random pause taken after a 429.
const RATE_LIMIT_MAX_DELAY_MS: u64 = 5_000;

/// Maximum length for error content in error messages
const MAX_ERROR_CONTENT_LEN: usize = 200;

const LLAMA3_PROMPT_TEMPLATE: &str = "<|begin_of_text|><|start_header_id|>system<|end_header_id|>\n\n{system_prompt}<|eot_id|><|start_header_id|>user<|end_header_id|>\n\n{prompt}<|eot_id|><|start_header_id|>assistant<|end_header_id|>\n\n";

/// One request to a backing model.
#[derive(Debug, Clone, Copy)]
pub struct OracleRequest<'a> {
    pub system: Option<&'a str>,
    pub user: &'a str,
    pub json_mode: bool,
}

impl OracleRequest<'_> {
    fn system_role(&self) -> &str {
        self.system.unwrap_or(DEFAULT_SYSTEM_ROLE)
    }
}

/// Response from a backing model including usage stats
#[derive(Debug, Clone)]
pub struct OracleResponse {
    pub content: String,
    pub usage: Usage,
    pub model: String,
}

/// Failures of a single backing call. The router treats all of them as
/// reasons to escalate.
#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("no API key configured for {0}")]
    MissingKey(&'static str),
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("rate limited after one retry")]
    RateLimited,
    #[error("API error {status}: {body}")]
    Status { status: u16, body: String },
    #[error("model fault: {0}")]
    ModelFault(String),
    #[error("empty response")]
    Empty,
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// A single backing call. The router is generic over this so tests can
/// script responses per tier.
#[allow(async_fn_in_trait)]
pub trait Backend {
    async fn complete(&self, tier: Tier, request: &OracleRequest<'_>) -> Result<OracleResponse, OracleError>;
}

/// Production backend speaking the OpenAI, Gemini and Replicate HTTP APIs.
pub struct HttpBackend {
    http: reqwest::Client,
    keys: ApiKeys,
}

impl HttpBackend {
    pub fn new(config: &OracleConfig, keys: ApiKeys) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { http, keys })
    }

    /// Send a request, pausing once for a random interval on a 429.
    async fn send(&self, build: impl Fn() -> reqwest::RequestBuilder) -> Result<String, OracleError> {
        let mut rate_limited = false;
        loop {
            let response = build().send().await?;
            let status = response.status();
            let text = response.text().await?;

            if status.is_success() {
                return Ok(text);
            }

            if status == StatusCode::TOO_MANY_REQUESTS {
                if rate_limited {
                    return Err(OracleError::RateLimited);
                }
                rate_limited = true;
                let delay_ms = rand::thread_rng().gen_range(0..RATE_LIMIT_MAX_DELAY_MS);
                tracing::warn!(delay_ms, "rate limited; retrying once");
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                continue;
            }

            return Err(OracleError::Status {
                status: status.as_u16(),
                body: sanitize_api_response(&text),
            });
        }
    }

    async fn call_openai(&self, tier: Tier, request: &OracleRequest<'_>) -> Result<OracleResponse, OracleError> {
        let api_key = self.keys.openai.as_deref().ok_or(OracleError::MissingKey("OpenAI"))?;
        let body = ChatRequest {
            model: tier.id(),
            messages: vec![
                Message {
                    role: "system",
                    content: request.system_role(),
                },
                Message {
                    role: "user",
                    content: request.user,
                },
            ],
            temperature: 0.6,
            top_p: 1.0,
            response_format: ResponseFormat {
                format_type: if request.json_mode { "json_object" } else { "text" },
            },
        };

        let text = self
            .send(|| self.http.post(OPENAI_URL).bearer_auth(api_key).json(&body))
            .await?;
        let parsed: ChatResponse =
            serde_json::from_str(&text).map_err(|e| OracleError::Malformed(e.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        Ok(OracleResponse {
            content,
            usage: parsed.usage.unwrap_or_default(),
            model: parsed.model.unwrap_or_else(|| tier.id().to_string()),
        })
    }

    async fn call_gemini(&self, tier: Tier, request: &OracleRequest<'_>) -> Result<OracleResponse, OracleError> {
        let api_key = self.keys.gemini.as_deref().ok_or(OracleError::MissingKey("Gemini"))?;
        let prompt = match request.system {
            Some(role) => format!("Role description: {}\n\nPrompt:\n{}", role, request.user),
            None => request.user.to_string(),
        };
        let body = serde_json::json!({ "contents": [{ "parts": [{ "text": prompt }] }] });
        let url = format!("{}/{}:generateContent", GEMINI_URL, tier.id());

        let text = self
            .send(|| self.http.post(&url).query(&[("key", api_key)]).json(&body))
            .await?;
        let parsed: GeminiResponse =
            serde_json::from_str(&text).map_err(|e| OracleError::Malformed(e.to_string()))?;
        let content = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .map(|p| p.text)
            .ok_or_else(|| OracleError::Malformed("no candidates in Gemini response".to_string()))?;
        let usage = parsed
            .usage_metadata
            .map(|m| Usage {
                prompt_tokens: m.prompt_token_count,
                completion_tokens: m.candidates_token_count,
                total_tokens: m.total_token_count,
            })
            .unwrap_or_default();

        Ok(OracleResponse {
            content,
            usage,
            model: tier.id().to_string(),
        })
    }

    async fn call_replicate(&self, tier: Tier, request: &OracleRequest<'_>) -> Result<OracleResponse, OracleError> {
        let api_key = self
            .keys
            .replicate
            .as_deref()
            .ok_or(OracleError::MissingKey("Replicate"))?;
        let body = serde_json::json!({
            "input": {
                "top_p": 0.95,
                "prompt": request.user,
                "system_prompt": request.system_role(),
                "temperature": 0.7,
                "prompt_template": LLAMA3_PROMPT_TEMPLATE,
                "presence_penalty": 0,
                "max_tokens": 2048,
            }
        });
        let url = format!("{}/{}/predictions", REPLICATE_URL, tier.id());

        // The provider asks callers to retry some transient model faults; one
        // retry is allowed before escalating.
        let mut retried = false;
        loop {
            let text = self
                .send(|| {
                    self.http
                        .post(&url)
                        .bearer_auth(api_key)
                        .header("Prefer", "wait")
                        .json(&body)
                })
                .await?;
            let prediction: Prediction =
                serde_json::from_str(&text).map_err(|e| OracleError::Malformed(e.to_string()))?;

            if let Some(error) = prediction.error.filter(|e| !e.is_empty()) {
                if error.to_lowercase().contains("please retry") && !retried {
                    retried = true;
                    tracing::warn!(model = tier.id(), "model asked for a retry");
                    continue;
                }
                return Err(OracleError::ModelFault(error));
            }
            if prediction.status != "succeeded" {
                return Err(OracleError::Malformed(format!(
                    "prediction finished with status '{}'",
                    prediction.status
                )));
            }

            let content = match prediction.output {
                Some(serde_json::Value::Array(parts)) => parts
                    .iter()
                    .filter_map(|p| p.as_str())
                    .collect::<String>(),
                Some(serde_json::Value::String(s)) => s,
                _ => String::new(),
            };
            let usage = prediction
                .metrics
                .map(|m| Usage::new(m.input_token_count, m.output_token_count))
                .unwrap_or_default();

            return Ok(OracleResponse {
                content,
                usage,
                model: tier.id().to_string(),
            });
        }
    }
}

impl Backend for HttpBackend {
    async fn complete(&self, tier: Tier, request: &OracleRequest<'_>) -> Result<OracleResponse, OracleError> {
        match tier.provider() {
            Provider::OpenAi => self.call_openai(tier, request).await,
            Provider::Gemini => self.call_gemini(tier, request).await,
            Provider::Replicate => self.call_replicate(tier, request).await,
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    temperature: f32,
    top_p: f32,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
    model: Option<String>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    content: Option<String>,
}

#[derive(Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: GeminiContent,
}

#[derive(Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Deserialize)]
struct GeminiPart {
    text: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
    #[serde(default)]
    total_token_count: u64,
}

#[derive(Deserialize)]
struct Prediction {
    #[serde(default)]
    status: String,
    output: Option<serde_json::Value>,
    error: Option<String>,
    metrics: Option<PredictionMetrics>,
}

#[derive(Deserialize)]
struct PredictionMetrics {
    #[serde(default)]
    input_token_count: u64,
    #[serde(default)]
    output_token_count: u64,
}

/// Sanitize API response content for error messages to prevent credential leakage.
fn sanitize_api_response(content: &str) -> String {
    const SECRET_PATTERNS: &[&str] = &["api_key", "apikey", "secret", "password", "bearer", "sk-"];

    let truncated = truncate_str(content, MAX_ERROR_CONTENT_LEN);
    let lower = truncated.to_lowercase();
    if SECRET_PATTERNS.iter().any(|p| lower.contains(p)) {
        return "(response details redacted - may contain sensitive data)".to_string();
    }
    truncated.to_string()
}

/// Truncate a string for display (Unicode-safe)
pub(crate) fn truncate_str(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &s[..byte_idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_str_is_char_safe() {
        assert_eq!(truncate_str("héllo", 2), "hé");
        assert_eq!(truncate_str("abc", 10), "abc");
    }

    #[test]
    fn test_sanitize_redacts_key_material() {
        let body = r#"{"error": "Incorrect API key provided: sk-abc123"}"#;
        assert!(sanitize_api_response(body).contains("redacted"));
        assert_eq!(sanitize_api_response("Bad gateway"), "Bad gateway");
    }

    #[test]
    fn test_chat_request_json_mode() {
        let body = ChatRequest {
            model: "gpt-4o",
            messages: vec![Message {
                role: "user",
                content: "hi",
            }],
            temperature: 0.6,
            top_p: 1.0,
            response_format: ResponseFormat {
                format_type: "json_object",
            },
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["response_format"]["type"], "json_object");
        assert_eq!(value["messages"][0]["content"], "hi");
    }

    #[test]
    fn test_gemini_response_parses_usage() {
        let json = r#"{
            "candidates": [{"content": {"parts": [{"text": "{\"is_pro\": true}"}]}}],
            "usageMetadata": {"promptTokenCount": 12, "candidatesTokenCount": 3, "totalTokenCount": 15}
        }"#;
        let parsed: GeminiResponse = serde_json::from_str(json).unwrap();
        let usage = parsed.usage_metadata.unwrap();
        assert_eq!(usage.prompt_token_count, 12);
        assert_eq!(usage.total_token_count, 15);
        assert_eq!(parsed.candidates[0].content.parts[0].text, "{\"is_pro\": true}");
    }

    #[test]
    fn test_prediction_parses_streamed_output() {
        let json = r#"{"status": "succeeded", "output": ["Hel", "lo"], "metrics": {"input_token_count": 7, "output_token_count": 2}}"#;
        let prediction: Prediction = serde_json::from_str(json).unwrap();
        assert_eq!(prediction.status, "succeeded");
        assert!(prediction.error.is_none());
        assert_eq!(prediction.metrics.unwrap().output_token_count, 2);
    }
}
