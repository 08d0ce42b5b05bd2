use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::TranscriptionSection;

use super::error::{TranscribeError, TranscribeResult};
use super::{RawLine, Transcriber, TranscriptionRequest};

const BLOCKING_FINISH_REASONS: &[&str] = &[
    "SAFETY",
    "BLOCKLIST",
    "PROHIBITED_CONTENT",
    "SPII",
    "RECITATION",
];

const PROMPT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Task prompt and system instruction sent with every batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompts {
    pub prompt: String,
    pub system_instruction: String,
}

/// Body served by `prompt_url`.
#[derive(Debug, Deserialize)]
struct RemotePrompts {
    system_instruction: String,
    prompt_for_task: String,
}

/// `generateContent` client sending each batch as inline base64 WAV parts.
#[derive(Clone)]
pub struct GeminiTranscriber {
    client: Client,
    endpoint: String,
    prompt_url: Option<String>,
    configured: Prompts,
    active: Arc<RwLock<Prompts>>,
}

impl std::fmt::Debug for GeminiTranscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiTranscriber")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl GeminiTranscriber {
    pub fn new(config: &TranscriptionSection) -> TranscribeResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|err| TranscribeError::Network(err.to_string()))?;
        let endpoint = format!(
            "{}/v1beta/models/{}:generateContent",
            config.endpoint_prefix.trim_end_matches('/'),
            config.model
        );
        let configured = Prompts {
            prompt: config.prompt.clone(),
            system_instruction: config.system_instruction.clone(),
        };
        Ok(Self {
            client,
            endpoint,
            prompt_url: config.prompt_url.clone().filter(|url| !url.trim().is_empty()),
            active: Arc::new(RwLock::new(configured.clone())),
            configured,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Prompts used for the next batches.
    pub fn prompts(&self) -> Prompts {
        match self.active.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Fetches prompts from `prompt_url`, falling back to the configured
    /// ones when the URL is unset, unreachable or serves an unexpected body.
    pub async fn refresh_prompts(&self) -> Prompts {
        let prompts = match self.prompt_url.as_deref() {
            None => self.configured.clone(),
            Some(url) => match self.fetch_prompts(url).await {
                Ok(prompts) => {
                    info!(url, "loaded transcription prompts");
                    prompts
                }
                Err(err) => {
                    warn!(url, error = %err, "prompt fetch failed; using configured prompts");
                    self.configured.clone()
                }
            },
        };
        match self.active.write() {
            Ok(mut guard) => *guard = prompts.clone(),
            Err(poisoned) => *poisoned.into_inner() = prompts.clone(),
        }
        prompts
    }

    async fn fetch_prompts(&self, url: &str) -> TranscribeResult<Prompts> {
        let remote: RemotePrompts = self
            .client
            .get(url)
            .timeout(PROMPT_FETCH_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if remote.prompt_for_task.trim().is_empty() {
            return Err(TranscribeError::Validation("prompt_for_task is empty".into()));
        }
        Ok(Prompts {
            prompt: remote.prompt_for_task,
            system_instruction: remote.system_instruction,
        })
    }

    async fn encode_parts(&self, request: &TranscriptionRequest) -> TranscribeResult<Vec<Value>> {
        let mut parts = vec![json!({ "text": self.prompts().prompt })];
        for unit in &request.units {
            let data = match tokio::fs::read(&unit.path).await {
                Ok(data) => data,
                Err(err) => {
                    warn!(
                        batch = request.batch_index,
                        path = %unit.path.display(),
                        error = %err,
                        "skipping unreadable audio unit"
                    );
                    continue;
                }
            };
            parts.push(json!({
                "text": format!("[AUDIO_INFO] {} --> {}", unit.start_offset_ms, unit.end_offset_ms)
            }));
            parts.push(json!({
                "inlineData": { "mime_type": "audio/wav", "data": STANDARD.encode(data) }
            }));
        }
        if parts.len() <= 1 {
            return Err(TranscribeError::EmptyBatch {
                index: request.batch_index,
            });
        }
        Ok(parts)
    }

    fn build_payload(&self, parts: Vec<Value>) -> Value {
        let safety: Vec<Value> = [
            "HARM_CATEGORY_HARASSMENT",
            "HARM_CATEGORY_HATE_SPEECH",
            "HARM_CATEGORY_SEXUALLY_EXPLICIT",
            "HARM_CATEGORY_DANGEROUS_CONTENT",
        ]
        .iter()
        .map(|category| json!({ "category": category, "threshold": "BLOCK_NONE" }))
        .collect();
        json!({
            "contents": [{ "parts": parts }],
            "systemInstruction": { "parts": [{ "text": self.prompts().system_instruction }] },
            "safetySettings": safety,
            "generationConfig": { "responseMimeType": "application/json" }
        })
    }
}

#[async_trait]
impl Transcriber for GeminiTranscriber {
    async fn prepare(&self) {
        self.refresh_prompts().await;
    }

    async fn transcribe(&self, request: &TranscriptionRequest) -> TranscribeResult<Vec<RawLine>> {
        let api_key = request
            .api_key
            .as_deref()
            .ok_or(TranscribeError::MissingCredential {
                index: request.batch_index,
            })?;
        let parts = self.encode_parts(request).await?;
        let payload = self.build_payload(parts);
        debug!(batch = request.batch_index, units = request.units.len(), "calling transcription endpoint");
        let response = self
            .client
            .post(&self.endpoint)
            .header("x-goog-api-key", api_key)
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TranscribeError::Status {
                code: status.as_u16(),
            });
        }
        let body = response.text().await?;
        parse_response(&body)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BatchTranscript {
    subtitles: Vec<RawLine>,
}

fn parse_response(body: &str) -> TranscribeResult<Vec<RawLine>> {
    let response: GenerateResponse = serde_json::from_str(body)?;
    if let Some(reason) = response
        .prompt_feedback
        .and_then(|feedback| feedback.block_reason)
    {
        return Err(TranscribeError::ContentBlocked(reason));
    }
    let candidate = response
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| TranscribeError::Malformed("response has no candidates".into()))?;
    let finish_reason = candidate.finish_reason.unwrap_or_default();
    let Some(content) = candidate.content else {
        if BLOCKING_FINISH_REASONS.contains(&finish_reason.as_str()) {
            return Err(TranscribeError::ContentBlocked(finish_reason));
        }
        return Err(TranscribeError::Malformed(format!(
            "candidate has no content (finish reason {finish_reason:?})"
        )));
    };
    let text = content
        .parts
        .into_iter()
        .find_map(|part| part.text)
        .ok_or_else(|| TranscribeError::Malformed("candidate has no text part".into()))?;
    let transcript: BatchTranscript = serde_json::from_str(&text)
        .map_err(|err| TranscribeError::Validation(err.to_string()))?;
    Ok(transcript.subtitles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::fixture_config;
    use crate::media::WorkUnit;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answers a single request with `status` and a JSON body; returns its URL.
    async fn serve_json(status: &'static str, body: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await.unwrap();
            let reply = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(reply.as_bytes()).await.unwrap();
        });
        format!("http://{addr}/prompts")
    }

    fn transcriber_with_prompt_url(url: Option<String>) -> GeminiTranscriber {
        let mut config = fixture_config().transcription;
        config.prompt_url = url;
        GeminiTranscriber::new(&config).unwrap()
    }

    fn wrap(text: &str) -> String {
        json!({
            "candidates": [{ "content": { "parts": [{ "text": text }] }, "finishReason": "STOP" }]
        })
        .to_string()
    }

    #[test]
    fn parses_subtitles_with_optional_end() {
        let body = wrap(r#"{"subtitles":[{"start_ms":10,"end_ms":20,"text":"a"},{"start_ms":30,"text":"b"}]}"#);
        let lines = parse_response(&body).unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].end_ms, Some(20));
        assert_eq!(lines[1].end_ms, None);
    }

    #[test]
    fn invalid_transcript_json_is_a_validation_error() {
        let body = wrap(r#"{"lines":[]}"#);
        assert!(matches!(
            parse_response(&body),
            Err(TranscribeError::Validation(_))
        ));
    }

    #[test]
    fn safety_block_is_not_retryable() {
        let body = json!({ "candidates": [{ "finishReason": "SAFETY" }] }).to_string();
        let err = parse_response(&body).unwrap_err();
        assert!(matches!(err, TranscribeError::ContentBlocked(_)));
        assert!(!err.is_retryable());

        let body = json!({ "promptFeedback": { "blockReason": "OTHER" } }).to_string();
        assert!(matches!(
            parse_response(&body),
            Err(TranscribeError::ContentBlocked(_))
        ));
    }

    #[test]
    fn empty_candidates_are_malformed() {
        let err = parse_response("{}").unwrap_err();
        assert!(matches!(err, TranscribeError::Malformed(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn payload_interleaves_offsets_and_audio() {
        let dir = TempDir::new().unwrap();
        let chunk = dir.path().join("chunk.wav");
        std::fs::write(&chunk, b"RIFF").unwrap();
        let transcriber = GeminiTranscriber::new(&fixture_config().transcription).unwrap();
        assert!(transcriber
            .endpoint()
            .ends_with("/v1beta/models/gemini-2.5-flash:generateContent"));

        let request = TranscriptionRequest {
            batch_index: 0,
            units: vec![
                WorkUnit {
                    path: chunk,
                    start_offset_ms: 0,
                    end_offset_ms: 1500,
                },
                WorkUnit {
                    path: dir.path().join("missing.wav"),
                    start_offset_ms: 1500,
                    end_offset_ms: 3000,
                },
            ],
            api_key: Some("key".into()),
        };
        let parts = transcriber.encode_parts(&request).await.unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1]["text"], "[AUDIO_INFO] 0 --> 1500");
        assert_eq!(parts[2]["inlineData"]["data"], STANDARD.encode(b"RIFF"));

        let payload = transcriber.build_payload(parts);
        assert_eq!(
            payload["generationConfig"]["responseMimeType"],
            "application/json"
        );
    }

    #[tokio::test]
    async fn remote_prompts_replace_configured_ones() {
        let body = json!({
            "system_instruction": "Translate into French.",
            "prompt_for_task": "Return French subtitles as JSON."
        })
        .to_string();
        let url = serve_json("200 OK", body).await;
        let transcriber = transcriber_with_prompt_url(Some(url));

        let prompts = transcriber.refresh_prompts().await;
        assert_eq!(prompts.prompt, "Return French subtitles as JSON.");
        assert_eq!(prompts.system_instruction, "Translate into French.");
        let payload = transcriber.build_payload(vec![json!({ "text": "x" })]);
        assert_eq!(
            payload["systemInstruction"]["parts"][0]["text"],
            "Translate into French."
        );
    }

    #[tokio::test]
    async fn prompt_fetch_failures_fall_back_to_configured_prompts() {
        let configured = fixture_config().transcription;

        let incomplete = serve_json("200 OK", json!({ "prompt_for_task": "only" }).to_string()).await;
        let prompts = transcriber_with_prompt_url(Some(incomplete)).refresh_prompts().await;
        assert_eq!(prompts.prompt, configured.prompt);
        assert_eq!(prompts.system_instruction, configured.system_instruction);

        let failing = serve_json("503 Service Unavailable", "{}".into()).await;
        let prompts = transcriber_with_prompt_url(Some(failing)).refresh_prompts().await;
        assert_eq!(prompts.prompt, configured.prompt);

        let closed = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            format!("http://{}/prompts", listener.local_addr().unwrap())
        };
        let prompts = transcriber_with_prompt_url(Some(closed)).refresh_prompts().await;
        assert_eq!(prompts.system_instruction, configured.system_instruction);
    }

    #[tokio::test]
    async fn unset_prompt_url_keeps_configured_prompts() {
        let transcriber = transcriber_with_prompt_url(None);
        let prompts = transcriber.refresh_prompts().await;
        assert_eq!(prompts.prompt, fixture_config().transcription.prompt);
    }

    #[tokio::test]
    async fn batch_without_readable_audio_is_rejected() {
        let dir = TempDir::new().unwrap();
        let transcriber = GeminiTranscriber::new(&fixture_config().transcription).unwrap();
        let request = TranscriptionRequest {
            batch_index: 4,
            units: vec![WorkUnit {
                path: dir.path().join("missing.wav"),
                start_offset_ms: 0,
                end_offset_ms: 1000,
            }],
            api_key: Some("key".into()),
        };
        let err = transcriber.transcribe(&request).await.unwrap_err();
        assert!(matches!(err, TranscribeError::EmptyBatch { index: 4 }));
    }
}
