use std::fs::{self, File};
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::types::BackfillError;

/// A JSON state file that is only ever replaced whole.
///
/// `save` writes to a hidden sibling temp file, syncs it, then renames it over
/// the target, so a crash leaves either the old or the new contents on disk.
#[derive(Debug, Clone)]
pub struct AtomicJsonFile<T> {
    path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T> AtomicJsonFile<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Handle for the file at `path`. Nothing is touched until `load`/`save`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: PhantomData,
        }
    }

    /// Target path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and parse the file.
    ///
    /// Returns `Ok(None)` when the file is missing or blank.
    ///
    /// # Errors
    /// Returns `Persistence` when the file exists but cannot be read or parsed.
    pub fn load(&self) -> Result<Option<T>, BackfillError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(None);
        }
        let data = serde_json::from_str(&content)?;
        Ok(Some(data))
    }

    /// Replace the file contents with `data`.
    ///
    /// # Errors
    /// Returns `Persistence` when serialization or any filesystem step fails.
    pub fn save(&self, data: &T) -> Result<(), BackfillError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let json = serde_json::to_string_pretty(data)?;
        let tmp_path = self.temp_path()?;
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(json.as_bytes())?;
        tmp.sync_all()?;
        drop(tmp);

        if let Err(e) = fs::rename(&tmp_path, &self.path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(path = %self.path.display(), bytes = json.len(), "state file saved");
        Ok(())
    }

    fn temp_path(&self) -> Result<PathBuf, BackfillError> {
        let file_name = self.path.file_name().ok_or_else(|| {
            BackfillError::Persistence(format!("{} has no file name", self.path.display()))
        })?;
        let tmp_name = format!(".{}.tmp", file_name.to_string_lossy());
        Ok(match self.path.parent() {
            Some(parent) => parent.join(tmp_name),
            None => PathBuf::from(tmp_name),
        })
    }
}
