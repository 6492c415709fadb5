use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StudioError>;

/// Coarse classification used at the UI boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Transport,
    Filesystem,
    Image,
}

#[derive(Debug, Error)]
pub enum StudioError {
    #[error("{0}")]
    Configuration(String),

    #[error("Gemini request failed: {0}")]
    Transport(String),

    #[error("Gemini API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("malformed Gemini response: {0}")]
    Protocol(String),

    #[error("failed to {action} {}: {source}", path.display())]
    Filesystem {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("image processing failed: {0}")]
    Image(String),
}

impl StudioError {
    pub fn filesystem(action: &'static str, path: &Path, source: io::Error) -> Self {
        Self::Filesystem {
            action,
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Transport(_) | Self::Api { .. } | Self::Protocol(_) => ErrorKind::Transport,
            Self::Filesystem { .. } => ErrorKind::Filesystem,
            Self::Image(_) => ErrorKind::Image,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_family_shares_one_kind() {
        let errors = [
            StudioError::Transport("connection reset".to_string()),
            StudioError::Api {
                status: 429,
                body: "quota".to_string(),
            },
            StudioError::Protocol("bad json".to_string()),
        ];
        for err in errors {
            assert_eq!(err.kind(), ErrorKind::Transport);
        }
    }

    #[test]
    fn filesystem_error_names_action_and_path() {
        let err = StudioError::filesystem(
            "write",
            Path::new("/tmp/input.jpg"),
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(err.kind(), ErrorKind::Filesystem);
        assert_eq!(err.to_string(), "failed to write /tmp/input.jpg: denied");
    }

    #[test]
    fn configuration_message_is_passed_through() {
        let err = StudioError::Configuration("GEMINI_API_KEY not found in .env file".to_string());
        assert_eq!(err.to_string(), "GEMINI_API_KEY not found in .env file");
    }
}
