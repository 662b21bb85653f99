//! Audio storage collaborator.
//!
//! The pipeline never reads audio bytes itself; it only asks storage whether a
//! reference resolves before accepting a job.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use callpipe_core::AudioRef;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("audio not found: {0}")]
    NotFound(String),

    #[error("storage io error: {0}")]
    Io(String),
}

/// Resolves audio references to something a speech-to-text handler can read.
pub trait AudioStorage: Send + Sync {
    /// Succeeds when `audio_ref` points at readable audio.
    fn check(&self, audio_ref: &AudioRef) -> Result<(), StorageError>;
}

impl<S> AudioStorage for Arc<S>
where
    S: AudioStorage + ?Sized,
{
    fn check(&self, audio_ref: &AudioRef) -> Result<(), StorageError> {
        (**self).check(audio_ref)
    }
}

/// Accepts every well-formed reference (object stores checked by the handler itself).
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAllStorage;

impl AudioStorage for AcceptAllStorage {
    fn check(&self, _audio_ref: &AudioRef) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Audio kept as files on a local or mounted directory.
///
/// Relative references resolve under `root`. `path_mappings` rewrite a
/// host-side prefix onto the directory this process actually sees, and are
/// tried before the reference as given.
#[derive(Debug, Clone)]
pub struct LocalDirStorage {
    root: PathBuf,
    path_mappings: Vec<(String, PathBuf)>,
}

impl LocalDirStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            path_mappings: Vec::new(),
        }
    }

    pub fn with_mapping(mut self, host_prefix: impl Into<String>, local: impl Into<PathBuf>) -> Self {
        self.path_mappings.push((host_prefix.into(), local.into()));
        self
    }

    fn candidates(&self, raw: &str) -> Vec<PathBuf> {
        let raw = raw.strip_prefix("file://").unwrap_or(raw);
        let given = Path::new(raw);
        let mut out = vec![if given.is_absolute() {
            given.to_path_buf()
        } else {
            self.root.join(given)
        }];

        if let Some((prefix, local)) = self
            .path_mappings
            .iter()
            .find(|(prefix, _)| raw.starts_with(prefix.as_str()))
        {
            let relative = raw[prefix.len()..].trim_start_matches('/');
            out.insert(0, local.join(relative));
        }
        out
    }

    /// First existing file the reference resolves to.
    pub fn resolve(&self, audio_ref: &AudioRef) -> Result<PathBuf, StorageError> {
        for candidate in self.candidates(audio_ref.as_str()) {
            match std::fs::metadata(&candidate) {
                Ok(meta) if meta.is_file() => return Ok(candidate),
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StorageError::Io(format!("{}: {e}", candidate.display()))),
            }
        }
        Err(StorageError::NotFound(audio_ref.to_string()))
    }
}

impl AudioStorage for LocalDirStorage {
    fn check(&self, audio_ref: &AudioRef) -> Result<(), StorageError> {
        self.resolve(audio_ref).map(|_| ())
    }
}
