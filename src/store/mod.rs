use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::Mutex,
};

use tracing::{debug, info};

use crate::program::{ProgramError, ReferralProgram};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt state in {path}: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("state in {path} failed validation: {source}")]
    Invalid {
        path: String,
        #[source]
        source: ProgramError,
    },
    #[error("state encode failed: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("state store lock poisoned")]
    Poisoned,
}

/// Where program state lives between runs.
pub trait StateStore {
    fn load(&self) -> Result<Option<ReferralProgram>, StoreError>;
    fn save(&self, program: &ReferralProgram) -> Result<(), StoreError>;
}

/// Pretty JSON on disk, replaced atomically through a sibling temp file.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}

impl StateStore for JsonFileStore {
    fn load(&self) -> Result<Option<ReferralProgram>, StoreError> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no state file yet");
            return Ok(None);
        }
        let bytes = fs::read(&self.path).map_err(|e| self.io_err(e))?;
        let program: ReferralProgram =
            serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
                path: self.path.display().to_string(),
                source,
            })?;
        program.validate().map_err(|source| StoreError::Invalid {
            path: self.path.display().to_string(),
            source,
        })?;
        debug!(
            path = %self.path.display(),
            height = program.ledger().meta.height,
            "state loaded"
        );
        Ok(Some(program))
    }

    fn save(&self, program: &ReferralProgram) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(program).map_err(StoreError::Encode)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
            }
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        {
            let mut f = fs::File::create(&tmp).map_err(|e| self.io_err(e))?;
            f.write_all(&json).map_err(|e| self.io_err(e))?;
            f.sync_all().map_err(|e| self.io_err(e))?;
        }
        fs::rename(&tmp, &self.path).map_err(|e| self.io_err(e))?;
        info!(
            path = %self.path.display(),
            bytes = json.len(),
            root = %program.ledger().snapshot().state_root,
            "state saved"
        );
        Ok(())
    }
}

/// Keeps the encoded snapshot in memory; loads decode and validate a fresh
/// copy, same as [`JsonFileStore`].
const MEMORY_PATH: &str = "<memory>";

#[derive(Default)]
pub struct MemoryStore {
    slot: Mutex<Option<Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores raw bytes as if they had been saved, for restoring an
    /// exported snapshot.
    pub fn put_raw(&self, bytes: Vec<u8>) -> Result<(), StoreError> {
        *self.slot.lock().map_err(|_| StoreError::Poisoned)? = Some(bytes);
        Ok(())
    }
}

impl StateStore for MemoryStore {
    fn load(&self) -> Result<Option<ReferralProgram>, StoreError> {
        let slot = self.slot.lock().map_err(|_| StoreError::Poisoned)?;
        match slot.as_deref() {
            None => Ok(None),
            Some(bytes) => {
                let program: ReferralProgram =
                    serde_json::from_slice(bytes).map_err(|source| StoreError::Corrupt {
                        path: MEMORY_PATH.to_string(),
                        source,
                    })?;
                program.validate().map_err(|source| StoreError::Invalid {
                    path: MEMORY_PATH.to_string(),
                    source,
                })?;
                Ok(Some(program))
            }
        }
    }

    fn save(&self, program: &ReferralProgram) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(program).map_err(StoreError::Encode)?;
        self.put_raw(bytes)
    }
}
