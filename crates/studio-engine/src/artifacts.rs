use std::env;
use std::io::Write;
use std::path::{Path, PathBuf};

use studio_contracts::{Result, StudioError};
use tempfile::NamedTempFile;
use tracing::debug;

const ARTIFACT_PREFIX: &str = "studio-";

/// Where per-request temporary files are created.
#[derive(Debug, Clone, Default)]
pub struct ScratchSpace {
    dir: Option<PathBuf>,
}

impl ScratchSpace {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(env::temp_dir)
    }

    /// Writes `bytes` to a fresh, uniquely named file. Write failures are fatal.
    pub fn write_artifact(&self, bytes: &[u8], suffix: &str) -> Result<ScratchArtifact> {
        let dir = self.dir();
        let mut file = tempfile::Builder::new()
            .prefix(ARTIFACT_PREFIX)
            .suffix(suffix)
            .tempfile_in(&dir)
            .map_err(|err| StudioError::filesystem("create a file in", &dir, err))?;
        file.write_all(bytes)
            .and_then(|_| file.flush())
            .map_err(|err| StudioError::filesystem("write", file.path(), err))?;
        debug!(path = %file.path().display(), bytes = bytes.len(), "scratch artifact written");
        Ok(ScratchArtifact { file })
    }
}

/// Temporary file that is removed when dropped, including during unwinding.
/// Removal errors are ignored.
#[derive(Debug)]
pub struct ScratchArtifact {
    file: NamedTempFile,
}

impl ScratchArtifact {
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn artifact_lives_until_dropped() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let scratch = ScratchSpace::new(Some(temp.path().to_path_buf()));

        let artifact = scratch.write_artifact(b"jpeg-bytes", ".jpg")?;
        let path = artifact.path().to_path_buf();
        assert_eq!(fs::read(&path)?, b"jpeg-bytes");
        assert_eq!(path.extension().and_then(|ext| ext.to_str()), Some("jpg"));

        drop(artifact);
        assert!(!path.exists());
        assert_eq!(fs::read_dir(temp.path())?.count(), 0);
        Ok(())
    }

    #[test]
    fn each_artifact_gets_a_unique_path() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let scratch = ScratchSpace::new(Some(temp.path().to_path_buf()));

        let first = scratch.write_artifact(b"a", ".jpg")?;
        let second = scratch.write_artifact(b"b", ".jpg")?;
        assert_ne!(first.path(), second.path());
        Ok(())
    }

    #[test]
    fn cleanup_swallows_already_deleted_files() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let scratch = ScratchSpace::new(Some(temp.path().to_path_buf()));

        let artifact = scratch.write_artifact(b"a", ".jpg")?;
        fs::remove_file(artifact.path())?;
        drop(artifact);
        Ok(())
    }

    #[test]
    fn missing_scratch_dir_is_a_filesystem_error() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let scratch = ScratchSpace::new(Some(temp.path().join("missing")));

        let err = scratch.write_artifact(b"a", ".jpg").unwrap_err();
        assert_eq!(err.kind(), studio_contracts::ErrorKind::Filesystem);
        Ok(())
    }
}
