// Veera Core Engine — Gemini Remote Client
// Speaks the streamGenerateContent SSE protocol and folds the wire deltas
// into the cumulative text the engine works with. One engine event per
// parsed payload; citation records pass through raw and the accumulator
// owns deduplication. Failures surface once and end the turn — there is
// no automatic retry at this layer.

use crate::atoms::constants::{GEMINI_BASE_URL, SYSTEM_INSTRUCTION, THINKING_OUTPUT_MARGIN};
use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::providers::{EventStream, RemoteClient};
use crate::engine::types::{
    ChatSettings, GroundingSource, ImageAttachment, Message, MessagePart, Role, StreamEvent,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use log::{debug, error, info};
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedSender;
use tokio_stream::wrappers::UnboundedReceiverStream;

// ── Struct ─────────────────────────────────────────────────────────────────

pub struct GeminiClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        GeminiClient {
            client: Client::builder()
                .connect_timeout(std::time::Duration::from_secs(10))
                .timeout(std::time::Duration::from_secs(120))
                .build()
                .unwrap_or_default(),
            base_url: GEMINI_BASE_URL.to_string(),
            api_key: api_key.into(),
        }
    }

    /// Client reading the key from `GEMINI_API_KEY`, falling back to
    /// `API_KEY`. A missing key is a configuration error, reported before
    /// any request is made.
    pub fn from_env() -> EngineResult<Self> {
        let key = std::env::var("GEMINI_API_KEY")
            .or_else(|_| std::env::var("API_KEY"))
            .map_err(|_| {
                EngineError::Config("GEMINI_API_KEY or API_KEY must be set".to_string())
            })?;
        Ok(Self::new(key))
    }

    // ── Request building ───────────────────────────────────────────────

    fn thinking_supported(model: &str) -> bool {
        model.contains("gemini-3") || model.contains("gemini-2.5")
    }

    fn build_request_body(
        history: &[Message],
        input: &str,
        image: Option<&ImageAttachment>,
        settings: &ChatSettings,
    ) -> Value {
        let mut contents: Vec<Value> = Vec::new();

        for msg in history {
            let role = match msg.role {
                Role::User => "user",
                _ => "model",
            };
            let mut parts: Vec<Value> = Vec::new();
            for part in &msg.parts {
                match part {
                    MessagePart::Text { text } if !text.is_empty() => {
                        parts.push(json!({"text": text}));
                    }
                    // Placeholders and failed turns can leave empty text
                    // parts behind; the API rejects them.
                    MessagePart::Text { .. } => {}
                    MessagePart::Inline { inline_data } => {
                        parts.push(json!({
                            "inlineData": {
                                "mimeType": inline_data.mime_type,
                                "data": inline_data.data,
                            }
                        }));
                    }
                }
            }
            if parts.is_empty() {
                continue;
            }
            contents.push(json!({"role": role, "parts": parts}));
        }

        let mut turn_parts = vec![json!({"text": input})];
        if let Some(att) = image {
            turn_parts.push(json!({
                "inlineData": {"mimeType": att.mime_type, "data": att.data}
            }));
        }
        contents.push(json!({"role": "user", "parts": turn_parts}));

        let mut body = json!({
            "contents": contents,
            "systemInstruction": {"parts": [{"text": SYSTEM_INSTRUCTION}]},
        });

        let mut generation_config = json!({
            "temperature": 0.1,
            "topP": 0.8,
            "topK": 40,
        });
        if settings.use_thinking && Self::thinking_supported(&settings.model) {
            generation_config["thinkingConfig"] =
                json!({"thinkingBudget": settings.thinking_budget});
            generation_config["maxOutputTokens"] =
                json!(settings.thinking_budget.saturating_add(THINKING_OUTPUT_MARGIN));
        }
        body["generationConfig"] = generation_config;

        if settings.use_search {
            body["tools"] = json!([{"googleSearch": {}}]);
        }

        body
    }

    // ── Response parsing ───────────────────────────────────────────────

    /// Text delta carried by one SSE payload: all text parts of the first
    /// candidate joined. Missing pieces mean an empty delta, not an error.
    fn delta_text(payload: &Value) -> String {
        payload["candidates"][0]["content"]["parts"]
            .as_array()
            .map(|parts| parts.iter().filter_map(|p| p["text"].as_str()).collect())
            .unwrap_or_default()
    }

    /// Citation records carried by one SSE payload. Records are passed
    /// through as-is (possibly with empty fields, possibly repeating ones
    /// from earlier payloads); the accumulator filters and deduplicates.
    fn citation_records(payload: &Value) -> Vec<GroundingSource> {
        let mut records = Vec::new();
        let Some(candidates) = payload["candidates"].as_array() else {
            return records;
        };
        for candidate in candidates {
            let Some(chunks) = candidate["groundingMetadata"]["groundingChunks"].as_array()
            else {
                continue;
            };
            for chunk in chunks {
                let Some(web) = chunk.get("web") else { continue };
                records.push(GroundingSource::new(
                    web["title"].as_str().unwrap_or(""),
                    web["uri"].as_str().unwrap_or(""),
                ));
            }
        }
        records
    }
}

// ── RemoteClient trait implementation ──────────────────────────────────────

#[async_trait]
impl RemoteClient for GeminiClient {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn stream_chat(
        &self,
        history: &[Message],
        input: &str,
        image: Option<&ImageAttachment>,
        settings: &ChatSettings,
    ) -> EngineResult<EventStream> {
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url.trim_end_matches('/'),
            settings.model,
            self.api_key
        );

        let body = Self::build_request_body(history, input, image, settings);

        info!(
            "[gemini] Request model={} turns={} search={} thinking={}",
            settings.model,
            history.len(),
            settings.use_search,
            settings.use_thinking
        );

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let code = status.as_u16();
            let body_text = response.text().await.unwrap_or_default();
            error!("[gemini] API error {}: {}", code, snippet(&body_text, 500));
            return Err(match code {
                401 | 403 => {
                    EngineError::provider("gemini", format!("authentication failed ({code})"))
                }
                429 => EngineError::provider("gemini", "rate limited by the API, try again later"),
                _ => EngineError::provider(
                    "gemini",
                    format!("API error {}: {}", code, snippet(&body_text, 200)),
                ),
            });
        }

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(pump_sse(response.bytes_stream().map_err(EngineError::from), tx));
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}

// ── SSE pump ───────────────────────────────────────────────────────────────

/// Drive one response body: reassemble SSE lines across chunk boundaries,
/// fold the payload deltas into the cumulative text, and emit one engine
/// event per parsed payload. Ends when the body ends, a read error is
/// forwarded, or the receiver is dropped.
async fn pump_sse(
    mut chunks: impl Stream<Item = EngineResult<Bytes>> + Unpin,
    tx: UnboundedSender<EngineResult<StreamEvent>>,
) {
    let mut buffer = String::new();
    let mut full_text = String::new();

    while let Some(result) = chunks.next().await {
        let bytes = match result {
            Ok(b) => b,
            Err(e) => {
                let _ = tx.send(Err(e));
                return;
            }
        };
        buffer.push_str(&String::from_utf8_lossy(&bytes));

        while let Some(line_end) = buffer.find('\n') {
            let line = buffer[..line_end].trim().to_string();
            buffer = buffer[line_end + 1..].to_string();

            let Some(data) = line.strip_prefix("data: ") else {
                continue;
            };
            match serde_json::from_str::<Value>(data) {
                Ok(payload) => {
                    let delta = GeminiClient::delta_text(&payload);
                    if !delta.is_empty() {
                        full_text.push_str(&delta);
                    }
                    let sources = GeminiClient::citation_records(&payload);
                    let event = StreamEvent { text: full_text.clone(), sources };
                    if tx.send(Ok(event)).is_err() {
                        // Receiver dropped: the turn was aborted.
                        return;
                    }
                }
                Err(e) => debug!("[gemini] Skipping unparseable payload line: {}", e),
            }
        }
    }
    debug!(
        "[gemini] Stream closed after {} chars",
        full_text.chars().count()
    );
}

/// Char-safe prefix of an API error body for logs and messages.
fn snippet(body: &str, limit: usize) -> &str {
    match body.char_indices().nth(limit) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}
