//! Google Gemini streaming driver.
//!
//! This module implements the [`LlmDriver`] trait for the Gemini
//! `streamGenerateContent` API with `alt=sse`, yielding the text of each
//! streamed chunk as it arrives.

use futures::{Stream, StreamExt};

use super::{LlmDriver, LlmRequest, LlmSettings};

/// Driver for the Gemini streaming generation API.
///
/// Connects to `/v1beta/models/{model}:streamGenerateContent?alt=sse` and
/// streams candidate text fragments.
#[derive(Clone)]
pub struct GeminiDriver {
    http: reqwest::Client,
    settings: LlmSettings,
}

impl std::fmt::Debug for GeminiDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiDriver")
            .field("model", &self.settings.model)
            .field("base_url", &self.settings.base_url)
            .finish()
    }
}

impl GeminiDriver {
    /// Create a new Gemini driver with the given settings.
    #[must_use]
    pub fn new(settings: LlmSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            settings,
        }
    }
}

#[async_trait::async_trait]
impl LlmDriver for GeminiDriver {
    async fn stream(
        &self,
        req: LlmRequest,
    ) -> anyhow::Result<std::pin::Pin<Box<dyn Stream<Item = anyhow::Result<String>> + Send>>>
    {
        let url = stream_url(&self.settings.base_url, &self.settings.model);
        let body = request_body(&req);

        tracing::debug!(
            name: "gemini.request",
            model = %self.settings.model,
            turns = req.turns.len(),
            "Opening streaming completion"
        );

        let resp = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.settings.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let byte_stream = resp.bytes_stream();

        let out = async_stream::try_stream! {
            let mut buf = Vec::<u8>::new();

            futures::pin_mut!(byte_stream);
            while let Some(chunk) = byte_stream.next().await {
                let chunk = chunk?;
                buf.extend_from_slice(&chunk);

                while let Some((pos, width)) = find_frame_boundary(&buf) {
                    let frame = buf.drain(..pos + width).collect::<Vec<_>>();
                    let text = String::from_utf8_lossy(&frame);

                    for line in text.lines() {
                        let line = line.trim();
                        if !line.starts_with("data:") {
                            continue;
                        }
                        let data = line.trim_start_matches("data:").trim();
                        if data.is_empty() {
                            continue;
                        }

                        let v: serde_json::Value = serde_json::from_str(data)?;
                        if let Some(fragment) = text_fragment(&v) {
                            yield fragment;
                        }
                    }
                }
            }
        };

        Ok(Box::pin(out))
    }
}

/// Build the streaming endpoint URL for a model.
fn stream_url(base_url: &str, model: &str) -> String {
    format!(
        "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
        base_url.trim_end_matches('/'),
        model
    )
}

/// Build the JSON request body for a prompt.
fn request_body(req: &LlmRequest) -> serde_json::Value {
    let contents: Vec<serde_json::Value> = req
        .turns
        .iter()
        .map(|turn| {
            serde_json::json!({
                "role": turn.role.as_wire(),
                "parts": [{ "text": turn.text }],
            })
        })
        .collect();

    serde_json::json!({
        "systemInstruction": { "parts": [{ "text": req.system_instruction }] },
        "contents": contents,
    })
}

/// Find the earliest SSE frame boundary in the buffer.
///
/// Returns the boundary position and delimiter width. Gemini terminates
/// frames with `\r\n\r\n`; a bare `\n\n` is accepted as well.
fn find_frame_boundary(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    let crlf = buf
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| (p, 4));

    match (lf, crlf) {
        (Some(l), Some(c)) => Some(if c.0 < l.0 { c } else { l }),
        (l, c) => l.or(c),
    }
}

/// Extract the text of a streamed chunk, if any.
///
/// Chunks carry `candidates[0].content.parts`; parts without a `text` field
/// (safety annotations, function calls) are skipped. Returns `None` when the
/// chunk contributes no text.
fn text_fragment(chunk: &serde_json::Value) -> Option<String> {
    let parts = chunk
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .as_array()?;

    let mut out = String::new();
    for part in parts {
        if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
            out.push_str(text);
        }
    }

    if out.is_empty() { None } else { Some(out) }
}
