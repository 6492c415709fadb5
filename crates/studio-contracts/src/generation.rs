use std::path::{Path, PathBuf};

pub const DEFAULT_MODEL: &str = "gemini-2.0-flash-exp";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    source_image_path: PathBuf,
    prompt: String,
    model: String,
}

impl GenerationRequest {
    pub fn new(
        source_image_path: impl Into<PathBuf>,
        prompt: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            source_image_path: source_image_path.into(),
            prompt: prompt.into(),
            model: model.into(),
        }
    }

    pub fn source_image_path(&self) -> &Path {
        &self.source_image_path
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

/// Outcome of one generation call. Exactly one variant is produced per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationResult {
    Image {
        bytes: Vec<u8>,
        mime_type: Option<String>,
    },
    Text {
        text: String,
    },
}

impl GenerationResult {
    pub fn is_image(&self) -> bool {
        matches!(self, Self::Image { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseModality {
    Image,
    Text,
}

impl ResponseModality {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Text => "text",
        }
    }
}

/// Sampling parameters sent with every request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub max_output_tokens: u32,
    pub response_modalities: Vec<ResponseModality>,
    pub response_mime_type: String,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 0.95,
            top_k: 40,
            max_output_tokens: 8192,
            response_modalities: vec![ResponseModality::Image, ResponseModality::Text],
            response_mime_type: "text/plain".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineData {
    pub mime_type: Option<String>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkPart {
    Text(String),
    InlineData(InlineData),
    Other,
}

/// One server-sent unit of a streamed response, reduced to the parts of its
/// first candidate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamChunk {
    pub parts: Vec<ChunkPart>,
}

impl StreamChunk {
    pub fn new(parts: Vec<ChunkPart>) -> Self {
        Self { parts }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(vec![ChunkPart::Text(text.into())])
    }

    pub fn inline(mime_type: Option<&str>, data: Vec<u8>) -> Self {
        Self::new(vec![ChunkPart::InlineData(InlineData {
            mime_type: mime_type.map(str::to_string),
            data,
        })])
    }

    pub fn has_content(&self) -> bool {
        !self.parts.is_empty()
    }

    /// Inline payload of the leading part, if that part carries one.
    pub fn leading_inline_data(&self) -> Option<&InlineData> {
        match self.parts.first() {
            Some(ChunkPart::InlineData(inline)) => Some(inline),
            _ => None,
        }
    }

    /// Owning variant of [`Self::leading_inline_data`]; hands the chunk back
    /// unchanged when the leading part is not inline data.
    pub fn into_leading_inline_data(mut self) -> Result<InlineData, Self> {
        if self.parts.is_empty() {
            return Err(self);
        }
        match self.parts.remove(0) {
            ChunkPart::InlineData(inline) => Ok(inline),
            other => {
                self.parts.insert(0, other);
                Err(self)
            }
        }
    }

    pub fn joined_text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                ChunkPart::Text(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_fixed_parameters() {
        let config = GenerationConfig::default();
        assert_eq!(config.temperature, 1.0);
        assert_eq!(config.top_p, 0.95);
        assert_eq!(config.top_k, 40);
        assert_eq!(config.max_output_tokens, 8192);
        assert_eq!(
            config
                .response_modalities
                .iter()
                .map(|modality| modality.as_str())
                .collect::<Vec<_>>(),
            vec!["image", "text"]
        );
        assert_eq!(config.response_mime_type, "text/plain");
    }

    #[test]
    fn leading_inline_data_only_inspects_first_part() {
        let trailing = StreamChunk::new(vec![
            ChunkPart::Text("caption".to_string()),
            ChunkPart::InlineData(InlineData {
                mime_type: Some("image/png".to_string()),
                data: vec![1, 2, 3],
            }),
        ]);
        assert!(trailing.leading_inline_data().is_none());
        assert_eq!(trailing.joined_text(), "caption");

        let leading = StreamChunk::inline(Some("image/png"), vec![9, 9]);
        assert_eq!(
            leading.leading_inline_data().map(|inline| inline.data.clone()),
            Some(vec![9, 9])
        );
    }

    #[test]
    fn non_image_chunk_is_handed_back_intact() {
        let chunk = StreamChunk::new(vec![
            ChunkPart::Text("caption".to_string()),
            ChunkPart::InlineData(InlineData {
                mime_type: None,
                data: vec![1],
            }),
        ]);

        assert_eq!(chunk.clone().into_leading_inline_data(), Err(chunk));
        assert_eq!(
            StreamChunk::default().into_leading_inline_data(),
            Err(StreamChunk::default())
        );
        assert_eq!(
            StreamChunk::inline(None, vec![5]).into_leading_inline_data(),
            Ok(InlineData {
                mime_type: None,
                data: vec![5],
            })
        );
    }

    #[test]
    fn joined_text_skips_non_text_parts() {
        let chunk = StreamChunk::new(vec![
            ChunkPart::Text("a".to_string()),
            ChunkPart::Other,
            ChunkPart::Text("b".to_string()),
        ]);
        assert_eq!(chunk.joined_text(), "ab");
        assert!(chunk.has_content());
        assert!(!StreamChunk::default().has_content());
    }
}
