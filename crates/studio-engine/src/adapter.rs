use std::path::Path;

use image::ImageFormat;
use studio_contracts::credentials::{ApiKey, Credentials, API_KEY_VAR};
use studio_contracts::generation::{
    GenerationConfig, GenerationRequest, GenerationResult, StreamChunk,
};
use studio_contracts::progress::{
    ProgressSignal, ProgressSink, LABEL_IMAGE_RECEIVED, LABEL_STREAM_DONE, LABEL_UPLOADING,
    LABEL_WAITING,
};
use studio_contracts::{Result, StudioError};
use tracing::{debug, info};

use crate::gemini::GenerateContentRequest;

pub type ChunkStream = Box<dyn Iterator<Item = Result<StreamChunk>> + Send>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    pub name: Option<String>,
    pub uri: String,
    pub mime_type: String,
}

/// Network seam of the adapter: one upload and one streaming call.
pub trait GenerationTransport {
    fn upload_file(&self, api_key: &ApiKey, path: &Path, mime_type: &str) -> Result<UploadedFile>;

    fn stream_generate(
        &self,
        api_key: &ApiKey,
        model: &str,
        request: &GenerateContentRequest,
    ) -> Result<ChunkStream>;
}

impl<T: GenerationTransport + ?Sized> GenerationTransport for &T {
    fn upload_file(&self, api_key: &ApiKey, path: &Path, mime_type: &str) -> Result<UploadedFile> {
        (**self).upload_file(api_key, path, mime_type)
    }

    fn stream_generate(
        &self,
        api_key: &ApiKey,
        model: &str,
        request: &GenerateContentRequest,
    ) -> Result<ChunkStream> {
        (**self).stream_generate(api_key, model, request)
    }
}

pub struct RequestAdapter<T> {
    credentials: Credentials,
    transport: T,
    config: GenerationConfig,
}

impl<T: GenerationTransport> RequestAdapter<T> {
    pub fn new(credentials: Credentials, transport: T) -> Self {
        Self {
            credentials,
            transport,
            config: GenerationConfig::default(),
        }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn generate(
        &self,
        request: &GenerationRequest,
        progress: &dyn ProgressSink,
    ) -> Result<GenerationResult> {
        let api_key = self.credentials.api_key().ok_or_else(|| {
            StudioError::Configuration(format!("{API_KEY_VAR} not found in .env file"))
        })?;

        progress.report(ProgressSignal::new(0.0, LABEL_UPLOADING));
        let source = request.source_image_path();
        let mime_type = upload_mime_type(source);
        let uploaded = self.transport.upload_file(api_key, source, mime_type)?;
        debug!(uri = %uploaded.uri, mime_type = %uploaded.mime_type, "source image uploaded");

        let body = GenerateContentRequest::new(&uploaded, request.prompt(), &self.config);
        progress.report(ProgressSignal::new(0.2, LABEL_WAITING));
        let stream = self
            .transport
            .stream_generate(api_key, request.model(), &body)?;
        let result = consume_stream(stream, progress)?;

        progress.report(ProgressSignal::new(1.0, LABEL_STREAM_DONE));
        info!(model = request.model(), image = result.is_image(), "generation finished");
        Ok(result)
    }
}

/// Stops pulling chunks at the first one whose leading part is inline data;
/// any later images are dropped.
pub fn consume_stream<I>(chunks: I, progress: &dyn ProgressSink) -> Result<GenerationResult>
where
    I: IntoIterator<Item = Result<StreamChunk>>,
{
    let mut text = String::new();
    let mut chunk_count = 0usize;

    for chunk in chunks {
        let chunk = chunk?;
        if !chunk.has_content() {
            continue;
        }
        chunk_count += 1;
        progress.report(ProgressSignal::receiving(chunk_count));

        match chunk.into_leading_inline_data() {
            Ok(inline) => {
                progress.report(ProgressSignal::new(0.9, LABEL_IMAGE_RECEIVED));
                debug!(chunk = chunk_count, bytes = inline.data.len(), "image chunk received");
                return Ok(GenerationResult::Image {
                    bytes: inline.data,
                    mime_type: inline.mime_type,
                });
            }
            Err(chunk) => {
                text.push_str(&chunk.joined_text());
                text.push('\n');
            }
        }
    }

    Ok(GenerationResult::Text { text })
}

/// Content type announced to the Files API, derived from the file extension.
fn upload_mime_type(path: &Path) -> &'static str {
    ImageFormat::from_path(path)
        .map(|format| format.to_mime_type())
        .unwrap_or("application/octet-stream")
}
