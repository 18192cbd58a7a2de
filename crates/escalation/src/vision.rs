//! Vision capability behind the paid escalation tiers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::debug;

use crate::errors::EscalationError;

/// Estimated dollars per multimodal call, tracked in run stats.
pub const VISION_CALL_COST: f64 = 0.01;

/// Verdict from a vision-decision call.
#[derive(Clone, Debug, PartialEq)]
pub struct VisionDecision {
    pub data: Value,
    pub confidence: f64,
    pub raw: String,
}

/// Element location from a vision-finder call.
///
/// `method`/`value` prefer a selector, then element text, then raw
/// coordinates, mirroring how usable each is downstream.
#[derive(Clone, Debug, PartialEq)]
pub struct VisionLocation {
    pub method: String,
    pub value: Value,
    pub confidence: f64,
    pub reasoning: String,
}

/// Multimodal model access: one screenshot plus a prompt in, structure out.
#[async_trait]
pub trait VisionClient: Send + Sync {
    async fn decide(
        &self,
        screenshot_png: &[u8],
        prompt: &str,
        want_json: bool,
    ) -> Result<VisionDecision, EscalationError>;

    async fn locate(
        &self,
        screenshot_png: &[u8],
        prompt: &str,
        prefer: &str,
        fallback: &str,
    ) -> Result<VisionLocation, EscalationError>;
}

/// OpenAI-compatible chat-completions client.
pub struct HttpVisionClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpVisionClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn chat(
        &self,
        prompt: &str,
        screenshot_png: &[u8],
        json_mode: bool,
        max_tokens: u32,
    ) -> Result<String, EscalationError> {
        let image_url = format!(
            "data:image/png;base64,{}",
            STANDARD.encode(screenshot_png)
        );
        let mut body = json!({
            "model": self.model,
            "max_tokens": max_tokens,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": prompt },
                    { "type": "image_url", "image_url": { "url": image_url } },
                ],
            }],
        });
        if json_mode {
            body["response_format"] = json!({ "type": "json_object" });
        }

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| EscalationError::Http(err.to_string()))?;

        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .map_err(|err| EscalationError::Http(err.to_string()))?;
        if !status.is_success() {
            return Err(EscalationError::Http(format!(
                "vision api returned {status}: {payload}"
            )));
        }

        payload
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                EscalationError::InvalidResponse("response missing message content".into())
            })
    }
}

#[async_trait]
impl VisionClient for HttpVisionClient {
    async fn decide(
        &self,
        screenshot_png: &[u8],
        prompt: &str,
        want_json: bool,
    ) -> Result<VisionDecision, EscalationError> {
        debug!(target: "escalation", model = %self.model, "vision decide call");
        let raw = self.chat(prompt, screenshot_png, want_json, 1000).await?;
        if want_json {
            let data: Value = serde_json::from_str(&raw)
                .map_err(|err| EscalationError::InvalidResponse(err.to_string()))?;
            let confidence = data
                .get("confidence")
                .and_then(Value::as_f64)
                .unwrap_or(0.8);
            Ok(VisionDecision {
                data,
                confidence,
                raw,
            })
        } else {
            Ok(VisionDecision {
                data: Value::String(raw.clone()),
                confidence: 0.8,
                raw,
            })
        }
    }

    async fn locate(
        &self,
        screenshot_png: &[u8],
        prompt: &str,
        prefer: &str,
        fallback: &str,
    ) -> Result<VisionLocation, EscalationError> {
        debug!(target: "escalation", model = %self.model, "vision locate call");
        let full_prompt = format!(
            "{prompt}\n\n\
             IMPORTANT: Return your response in this exact JSON format:\n\
             {{\n\
               \"method\": \"selector\" | \"text\" | \"coordinates\",\n\
               \"value\": \"CSS selector\" | \"element text\" | {{\"x\": 123, \"y\": 456}},\n\
               \"confidence\": 0.0-1.0,\n\
               \"reasoning\": \"explain your choice\"\n\
             }}\n\n\
             Preference: return a '{prefer}' if possible. Only use '{fallback}' as a last resort."
        );
        let raw = self.chat(&full_prompt, screenshot_png, true, 500).await?;
        let parsed: Value = serde_json::from_str(&raw)
            .map_err(|err| EscalationError::InvalidResponse(err.to_string()))?;

        let method = parsed
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| EscalationError::InvalidResponse("missing 'method'".into()))?
            .to_string();
        let value = parsed.get("value").cloned().unwrap_or(Value::Null);
        let confidence = parsed
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        let reasoning = parsed
            .get("reasoning")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        Ok(VisionLocation {
            method,
            value,
            confidence,
            reasoning,
        })
    }
}

/// Deterministic client for tests and offline development: pops scripted
/// responses and counts calls.
#[derive(Default)]
pub struct MockVisionClient {
    decisions: Mutex<VecDeque<VisionDecision>>,
    locations: Mutex<VecDeque<VisionLocation>>,
    calls: AtomicU64,
}

impl MockVisionClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_decision(&self, decision: VisionDecision) {
        self.decisions.lock().push_back(decision);
    }

    pub fn push_location(&self, location: VisionLocation) {
        self.locations.lock().push_back(location);
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl VisionClient for MockVisionClient {
    async fn decide(
        &self,
        _screenshot_png: &[u8],
        _prompt: &str,
        _want_json: bool,
    ) -> Result<VisionDecision, EscalationError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.decisions.lock().pop_front().ok_or_else(|| {
            EscalationError::InvalidResponse("mock vision client has no scripted decision".into())
        })
    }

    async fn locate(
        &self,
        _screenshot_png: &[u8],
        _prompt: &str,
        _prefer: &str,
        _fallback: &str,
    ) -> Result<VisionLocation, EscalationError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.locations.lock().pop_front().ok_or_else(|| {
            EscalationError::InvalidResponse("mock vision client has no scripted location".into())
        })
    }
}
