//! LLM client abstraction and provider implementations.
//!
//! Defines the [`Llm`] trait and concrete clients:
//! - **[`OpenAiLlm`]** — OpenAI chat completions with SSE token streaming.
//! - **[`OllamaLlm`]** — local Ollama server (`/api/generate`, JSONL streaming).
//! - **[`GeminiLlm`]** — Google Gemini `generateContent`.
//!
//! All providers retry 429/5xx responses with exponential backoff (three
//! attempts) and map failures onto the engine taxonomy: 401/403 →
//! `AuthError`, missing model → `ModelNotFound`, exhausted retries and
//! network errors → `ProviderUnavailable`.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};

use crate::config::LlmConfig;
use crate::error::EngineError;

/// Stream of generated token fragments.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, EngineError>> + Send>>;

/// Options for a single completion call.
#[derive(Debug, Clone, Default)]
pub struct CompleteOptions {
    /// System instruction prepended to the conversation.
    pub system: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

/// A chat-completion language model.
#[async_trait]
pub trait Llm: Send + Sync {
    /// Provider-qualified model name (e.g. `"openai/gpt-4o-mini"`).
    fn name(&self) -> &str;

    /// Complete a prompt and return the full response text.
    async fn complete(&self, prompt: &str, options: &CompleteOptions)
        -> Result<String, EngineError>;

    /// Complete a prompt, yielding token fragments as they arrive.
    async fn stream_complete(&self, prompt: &str) -> Result<TokenStream, EngineError>;
}

const MAX_ATTEMPTS: u32 = 3;

/// Map an HTTP failure to the engine taxonomy. `model` is included in
/// not-found messages so the remediation is obvious.
fn classify_status(status: reqwest::StatusCode, body: &str, model: &str) -> EngineError {
    match status.as_u16() {
        401 | 403 => EngineError::Auth(format!("provider rejected credentials (HTTP {status})")),
        404 => EngineError::ModelNotFound(format!("model '{model}' not found: {body}")),
        _ => EngineError::ProviderUnavailable(format!("HTTP {status}: {body}")),
    }
}

fn retryable_status(status: reqwest::StatusCode) -> bool {
    status.as_u16() == 429 || status.is_server_error()
}

/// POST a JSON body with bounded retries. Returns the parsed response JSON.
/// Shared with the embedding providers, which follow the same retry policy.
pub(crate) async fn post_json_with_retry(
    client: &reqwest::Client,
    url: &str,
    headers: &[(String, String)],
    body: &Value,
    model: &str,
) -> Result<Value, EngineError> {
    let mut last_err: Option<EngineError> = None;

    for attempt in 0..MAX_ATTEMPTS {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
        }

        let mut req = client.post(url).json(body);
        for (k, v) in headers {
            req = req.header(k, v);
        }

        match req.send().await {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    return resp.json::<Value>().await.map_err(|e| {
                        EngineError::ProviderUnavailable(format!("invalid response body: {e}"))
                    });
                }
                let text = resp.text().await.unwrap_or_default();
                let err = classify_status(status, &text, model);
                if retryable_status(status) {
                    last_err = Some(err);
                    continue;
                }
                return Err(err);
            }
            Err(e) => {
                last_err = Some(EngineError::ProviderUnavailable(e.to_string()));
                continue;
            }
        }
    }

    Err(last_err
        .unwrap_or_else(|| EngineError::ProviderUnavailable("request failed after retries".into())))
}

// ═══════════════════════════════════════════════════════════════════════
// OpenAI
// ═══════════════════════════════════════════════════════════════════════

/// OpenAI chat-completions client. Requires `OPENAI_API_KEY`.
pub struct OpenAiLlm {
    client: reqwest::Client,
    name: String,
    model: String,
    base_url: String,
    api_key: String,
}

impl OpenAiLlm {
    pub fn new(config: &LlmConfig, timeout: Duration) -> Result<Self, EngineError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| EngineError::Auth("OPENAI_API_KEY environment variable not set".into()))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::ProviderUnavailable(e.to_string()))?;
        Ok(Self {
            client,
            name: format!("openai/{}", config.model),
            model: config.model.clone(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            api_key,
        })
    }

    fn request_body(&self, prompt: &str, options: &CompleteOptions, stream: bool) -> Value {
        let mut messages = Vec::new();
        if let Some(system) = &options.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": prompt}));

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": stream,
        });
        if let Some(max) = options.max_tokens {
            body["max_tokens"] = json!(max);
        }
        if let Some(temp) = options.temperature {
            body["temperature"] = json!(temp);
        }
        body
    }

    fn auth_headers(&self) -> Vec<(String, String)> {
        vec![(
            "Authorization".to_string(),
            format!("Bearer {}", self.api_key),
        )]
    }
}

#[async_trait]
impl Llm for OpenAiLlm {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        prompt: &str,
        options: &CompleteOptions,
    ) -> Result<String, EngineError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.request_body(prompt, options, false);
        let json =
            post_json_with_retry(&self.client, &url, &self.auth_headers(), &body, &self.model)
                .await?;

        json["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| {
                EngineError::ProviderUnavailable("response missing choices[0].message.content".into())
            })
    }

    async fn stream_complete(&self, prompt: &str) -> Result<TokenStream, EngineError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.request_body(prompt, &CompleteOptions::default(), true);

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::ProviderUnavailable(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &text, &self.model));
        }

        // SSE framing: each event is a `data: {...}` line; `[DONE]` ends the
        // stream. Frames can split across network reads, so buffer partials.
        let stream = resp.bytes_stream();
        let token_stream = async_stream::try_stream! {
            let mut buffer = String::new();
            futures::pin_mut!(stream);
            while let Some(part) = stream.next().await {
                let bytes = part.map_err(|e| EngineError::ProviderUnavailable(e.to_string()))?;
                buffer.push_str(&String::from_utf8_lossy(&bytes));
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);
                    let Some(data) = line.strip_prefix("data:") else { continue };
                    let data = data.trim();
                    if data == "[DONE]" {
                        return;
                    }
                    if let Ok(value) = serde_json::from_str::<Value>(data) {
                        if let Some(token) = value["choices"][0]["delta"]["content"].as_str() {
                            if !token.is_empty() {
                                yield token.to_string();
                            }
                        }
                    }
                }
            }
        };
        Ok(Box::pin(token_stream))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Ollama
// ═══════════════════════════════════════════════════════════════════════

/// Local Ollama client (`/api/generate`). No credentials required.
pub struct OllamaLlm {
    client: reqwest::Client,
    name: String,
    model: String,
    base_url: String,
}

impl OllamaLlm {
    pub fn new(config: &LlmConfig, timeout: Duration) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::ProviderUnavailable(e.to_string()))?;
        Ok(Self {
            client,
            name: format!("ollama/{}", config.model),
            model: config.model.clone(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
        })
    }
}

#[async_trait]
impl Llm for OllamaLlm {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        prompt: &str,
        options: &CompleteOptions,
    ) -> Result<String, EngineError> {
        let url = format!("{}/api/generate", self.base_url);
        let mut body = json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
        });
        if let Some(system) = &options.system {
            body["system"] = json!(system);
        }
        let json = post_json_with_retry(&self.client, &url, &[], &body, &self.model).await?;
        json["response"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| EngineError::ProviderUnavailable("response missing 'response' field".into()))
    }

    async fn stream_complete(&self, prompt: &str) -> Result<TokenStream, EngineError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = json!({
            "model": self.model,
            "prompt": prompt,
            "stream": true,
        });

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::ProviderUnavailable(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &text, &self.model));
        }

        // Ollama streams one JSON object per line.
        let stream = resp.bytes_stream();
        let token_stream = async_stream::try_stream! {
            let mut buffer = String::new();
            futures::pin_mut!(stream);
            while let Some(part) = stream.next().await {
                let bytes = part.map_err(|e| EngineError::ProviderUnavailable(e.to_string()))?;
                buffer.push_str(&String::from_utf8_lossy(&bytes));
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);
                    if line.is_empty() {
                        continue;
                    }
                    if let Ok(value) = serde_json::from_str::<Value>(&line) {
                        if value["done"].as_bool() == Some(true) {
                            return;
                        }
                        if let Some(token) = value["response"].as_str() {
                            if !token.is_empty() {
                                yield token.to_string();
                            }
                        }
                    }
                }
            }
        };
        Ok(Box::pin(token_stream))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Gemini
// ═══════════════════════════════════════════════════════════════════════

/// Google Gemini client (`generateContent`). Requires `GEMINI_API_KEY`.
pub struct GeminiLlm {
    client: reqwest::Client,
    name: String,
    model: String,
    base_url: String,
    api_key: String,
}

impl GeminiLlm {
    pub fn new(config: &LlmConfig, timeout: Duration) -> Result<Self, EngineError> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .map_err(|_| EngineError::Auth("GEMINI_API_KEY environment variable not set".into()))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::ProviderUnavailable(e.to_string()))?;
        Ok(Self {
            client,
            name: format!("gemini/{}", config.model),
            model: config.model.clone(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string()),
            api_key,
        })
    }
}

#[async_trait]
impl Llm for GeminiLlm {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        prompt: &str,
        options: &CompleteOptions,
    ) -> Result<String, EngineError> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );
        let mut body = json!({
            "contents": [{"parts": [{"text": prompt}]}],
        });
        if let Some(system) = &options.system {
            body["systemInstruction"] = json!({"parts": [{"text": system}]});
        }
        let json = post_json_with_retry(&self.client, &url, &[], &body, &self.model).await?;
        json["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| {
                EngineError::ProviderUnavailable("response missing candidates[0].content".into())
            })
    }

    async fn stream_complete(&self, prompt: &str) -> Result<TokenStream, EngineError> {
        // Gemini's streaming endpoint frames responses as a JSON array;
        // yielding the full completion as one fragment keeps the contract.
        let text = self.complete(prompt, &CompleteOptions::default()).await?;
        Ok(Box::pin(futures::stream::iter(vec![Ok(text)])))
    }
}
