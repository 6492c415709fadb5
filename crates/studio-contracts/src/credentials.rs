use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, StudioError};

pub const API_KEY_VAR: &str = "GEMINI_API_KEY";
pub const DEFAULT_ENV_FILE: &str = ".env";

#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    /// Returns `None` for an empty value, which counts as "no key".
    pub fn new(value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        if value.is_empty() {
            return None;
        }
        Some(Self(value))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(***)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    File,
    Environment,
    Missing,
}

/// Immutable snapshot of the active credential. Reloading produces a new
/// snapshot instead of touching the process environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    api_key: Option<ApiKey>,
    source: CredentialSource,
}

impl Credentials {
    pub fn missing() -> Self {
        Self {
            api_key: None,
            source: CredentialSource::Missing,
        }
    }

    pub fn from_key(api_key: ApiKey, source: CredentialSource) -> Self {
        Self {
            api_key: Some(api_key),
            source,
        }
    }

    pub fn api_key(&self) -> Option<&ApiKey> {
        self.api_key.as_ref()
    }

    pub fn source(&self) -> CredentialSource {
        self.source
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }
}

/// Which side wins when both the process environment and the credentials
/// file define the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precedence {
    EnvironmentFirst,
    FileFirst,
}

/// `KEY=value` credentials file, usually `.env` in the working directory.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Overwrites the file with a single `GEMINI_API_KEY=<key>` line.
    pub fn save(&self, api_key: &str) -> Result<()> {
        fs::write(&self.path, format!("{API_KEY_VAR}={api_key}\n"))
            .map_err(|err| StudioError::filesystem("write", &self.path, err))
    }

    /// Startup load: an exported variable beats the file.
    pub fn load(&self) -> Result<Credentials> {
        self.resolve(env::var(API_KEY_VAR).ok(), Precedence::EnvironmentFirst)
    }

    /// Explicit reload: the file beats the exported variable.
    pub fn reload(&self) -> Result<Credentials> {
        self.resolve(env::var(API_KEY_VAR).ok(), Precedence::FileFirst)
    }

    /// Under `FileFirst` a key present in the file wins even when its value
    /// is empty, so saving "" clears the active credential.
    pub fn resolve(&self, env_value: Option<String>, precedence: Precedence) -> Result<Credentials> {
        let file_value = self.read_file_key()?;
        let from_env = || snapshot(env_value.clone(), CredentialSource::Environment);

        let resolved = match precedence {
            Precedence::EnvironmentFirst => {
                from_env().or_else(|| snapshot(file_value, CredentialSource::File))
            }
            Precedence::FileFirst => match file_value {
                Some(value) => snapshot(Some(value), CredentialSource::File),
                None => from_env(),
            },
        };
        Ok(resolved.unwrap_or_else(Credentials::missing))
    }

    fn read_file_key(&self) -> Result<Option<String>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let entries = dotenvy::from_path_iter(&self.path).map_err(|err| {
            StudioError::Configuration(format!("failed to read {}: {err}", self.path.display()))
        })?;
        let mut found = None;
        for entry in entries {
            let (key, value) = entry.map_err(|err| {
                StudioError::Configuration(format!(
                    "failed to parse {}: {err}",
                    self.path.display()
                ))
            })?;
            if key == API_KEY_VAR {
                found = Some(value);
            }
        }
        Ok(found)
    }
}

fn snapshot(value: Option<String>, source: CredentialSource) -> Option<Credentials> {
    value
        .and_then(ApiKey::new)
        .map(|key| Credentials::from_key(key, source))
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new(DEFAULT_ENV_FILE)
    }
}
