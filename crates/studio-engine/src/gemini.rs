use std::fs;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde::{Deserialize, Serialize};
use serde_json::json;
use studio_contracts::credentials::ApiKey;
use studio_contracts::generation::{ChunkPart, GenerationConfig, InlineData, StreamChunk};
use studio_contracts::{Result, StudioError};
use tracing::debug;

use crate::adapter::{ChunkStream, GenerationTransport, UploadedFile};

const ERROR_BODY_MAX_CHARS: usize = 512;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    pub contents: Vec<Content>,
    pub generation_config: WireGenerationConfig,
}

impl GenerateContentRequest {
    /// Single user turn: the uploaded image reference followed by the prompt.
    pub fn new(file: &UploadedFile, prompt: &str, config: &GenerationConfig) -> Self {
        Self {
            contents: vec![Content {
                role: "user".to_string(),
                parts: vec![
                    RequestPart::FileData(FileData {
                        file_uri: file.uri.clone(),
                        mime_type: file.mime_type.clone(),
                    }),
                    RequestPart::Text(prompt.to_string()),
                ],
            }],
            generation_config: WireGenerationConfig::from(config),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Content {
    pub role: String,
    pub parts: Vec<RequestPart>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestPart {
    FileData(FileData),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileData {
    pub file_uri: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireGenerationConfig {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub max_output_tokens: u32,
    pub response_modalities: Vec<String>,
    pub response_mime_type: String,
}

impl From<&GenerationConfig> for WireGenerationConfig {
    fn from(config: &GenerationConfig) -> Self {
        Self {
            temperature: config.temperature,
            top_p: config.top_p,
            top_k: config.top_k,
            max_output_tokens: config.max_output_tokens,
            response_modalities: config
                .response_modalities
                .iter()
                .map(|modality| modality.as_str().to_string())
                .collect(),
            response_mime_type: config.response_mime_type.clone(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponsePart {
    text: Option<String>,
    #[serde(alias = "inline_data")]
    inline_data: Option<WireInlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireInlineData {
    #[serde(alias = "mime_type")]
    mime_type: Option<String>,
    #[serde(default)]
    data: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: Option<u16>,
    message: Option<String>,
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    file: WireFile,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFile {
    name: Option<String>,
    uri: String,
    mime_type: Option<String>,
}

/// Blocking Gemini client: Files API upload plus `streamGenerateContent`
/// over server-sent events.
pub struct GeminiTransport {
    api_base: String,
    http: HttpClient,
}

impl GeminiTransport {
    pub fn new(api_base: impl Into<String>) -> Result<Self> {
        // A generation stream can legitimately outlast reqwest's default timeout.
        let http = HttpClient::builder()
            .timeout(None::<Duration>)
            .build()
            .map_err(|err| StudioError::Transport(format!("failed to build HTTP client: {err}")))?;
        Ok(Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    fn stream_endpoint(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:streamGenerateContent", self.api_base, model_path)
    }

    fn upload_endpoint(&self) -> String {
        format!("{}/files", upload_base(&self.api_base))
    }
}

impl GenerationTransport for GeminiTransport {
    fn upload_file(&self, api_key: &ApiKey, path: &Path, mime_type: &str) -> Result<UploadedFile> {
        let bytes = fs::read(path).map_err(|err| StudioError::filesystem("read", path, err))?;
        let display_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("upload");
        let endpoint = self.upload_endpoint();
        debug!(%endpoint, bytes = bytes.len(), mime_type, "starting resumable upload");

        let start = self
            .http
            .post(&endpoint)
            .query(&[("key", api_key.expose())])
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", bytes.len().to_string())
            .header("X-Goog-Upload-Header-Content-Type", mime_type)
            .json(&json!({ "file": { "display_name": display_name } }))
            .send()
            .map_err(|err| transport_error("upload start", err))?;
        let start = ensure_success(start)?;
        let upload_url = start
            .headers()
            .get("x-goog-upload-url")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                StudioError::Protocol("upload session missing x-goog-upload-url header".to_string())
            })?;

        let finish = self
            .http
            .post(&upload_url)
            .header("X-Goog-Upload-Offset", "0")
            .header("X-Goog-Upload-Command", "upload, finalize")
            .body(bytes)
            .send()
            .map_err(|err| transport_error("upload", err))?;
        let finish = ensure_success(finish)?;
        let payload: UploadResponse = finish
            .json()
            .map_err(|err| StudioError::Protocol(format!("invalid upload response: {}", err.without_url())))?;

        Ok(UploadedFile {
            name: payload.file.name,
            uri: payload.file.uri,
            mime_type: payload
                .file
                .mime_type
                .unwrap_or_else(|| mime_type.to_string()),
        })
    }

    fn stream_generate(
        &self,
        api_key: &ApiKey,
        model: &str,
        request: &GenerateContentRequest,
    ) -> Result<ChunkStream> {
        let endpoint = self.stream_endpoint(model);
        debug!(%endpoint, "opening generation stream");
        let response = self
            .http
            .post(&endpoint)
            .query(&[("alt", "sse"), ("key", api_key.expose())])
            .json(request)
            .send()
            .map_err(|err| transport_error("generate", err))?;
        let response = ensure_success(response)?;
        Ok(Box::new(SseChunks::new(BufReader::new(response))))
    }
}

/// `https://host/v1beta` becomes `https://host/upload/v1beta`.
pub fn upload_base(api_base: &str) -> String {
    let trimmed = api_base.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((host, version)) if !host.ends_with('/') && !version.is_empty() => {
            format!("{host}/upload/{version}")
        }
        _ => format!("{trimmed}/upload"),
    }
}

/// Decodes a `text/event-stream` body into chunks, one per event.
pub struct SseChunks<R> {
    reader: R,
    finished: bool,
}

impl<R: BufRead> SseChunks<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            finished: false,
        }
    }

    fn next_event(&mut self) -> Result<Option<String>> {
        let mut data = String::new();
        let mut has_data = false;
        let mut line = String::new();
        loop {
            line.clear();
            let read = self
                .reader
                .read_line(&mut line)
                .map_err(|err| StudioError::Transport(format!("stream read failed: {err}")))?;
            if read == 0 {
                self.finished = true;
                return Ok(has_data.then_some(data));
            }
            let trimmed = line.trim_end_matches(|c| c == '\r' || c == '\n');
            if trimmed.is_empty() {
                if has_data {
                    return Ok(Some(data));
                }
                continue;
            }
            if trimmed.starts_with(':') {
                continue;
            }
            if let Some(value) = trimmed.strip_prefix("data:") {
                if has_data {
                    data.push('\n');
                }
                data.push_str(value.strip_prefix(' ').unwrap_or(value));
                has_data = true;
            }
        }
    }
}

impl<R: BufRead> Iterator for SseChunks<R> {
    type Item = Result<StreamChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.next_event() {
            Ok(Some(payload)) => Some(parse_stream_payload(&payload)),
            Ok(None) => None,
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}

pub fn parse_stream_payload(payload: &str) -> Result<StreamChunk> {
    let response: StreamResponse = serde_json::from_str(payload)
        .map_err(|err| StudioError::Protocol(format!("invalid stream event: {err}")))?;
    if let Some(error) = response.error {
        let mut body = error.message.unwrap_or_default();
        if let Some(status) = error.status {
            body = format!("{status}: {body}");
        }
        return Err(StudioError::Api {
            status: error.code.unwrap_or(500),
            body,
        });
    }

    let parts = response
        .candidates
        .into_iter()
        .next()
        .and_then(|candidate| candidate.content)
        .map(|content| content.parts)
        .unwrap_or_default();
    let parts = parts
        .into_iter()
        .map(chunk_part)
        .collect::<Result<Vec<_>>>()?;
    Ok(StreamChunk::new(parts))
}

fn chunk_part(part: ResponsePart) -> Result<ChunkPart> {
    if let Some(inline) = part.inline_data {
        let data = BASE64
            .decode(inline.data.as_bytes())
            .map_err(|err| StudioError::Protocol(format!("inline data base64 decode failed: {err}")))?;
        return Ok(ChunkPart::InlineData(InlineData {
            mime_type: inline.mime_type,
            data,
        }));
    }
    Ok(match part.text {
        Some(text) => ChunkPart::Text(text),
        None => ChunkPart::Other,
    })
}

fn transport_error(stage: &str, err: reqwest::Error) -> StudioError {
    // The key travels in the query string, so the URL stays out of messages.
    StudioError::Transport(format!("{stage}: {}", err.without_url()))
}

fn ensure_success(response: HttpResponse) -> Result<HttpResponse> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    Err(StudioError::Api {
        status: status.as_u16(),
        body: truncate_text(body.trim(), ERROR_BODY_MAX_CHARS),
    })
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
