//! Error types for a recovery run.

use std::io;

use thiserror::Error;

/// Terminal failures of a recovery run.
///
/// Per-entry problems (a malformed directory slot, one file that fails to
/// extract) are logged and skipped; only structural failures surface here.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("failed to open {path}: {source}")]
    Open { path: String, source: io::Error },

    #[error("invalid boot sector: {0}")]
    InvalidBootSector(String),

    #[error("unknown filesystem (use --fs to override)")]
    UnknownFilesystem,

    #[error("unsupported filesystem: {0}")]
    UnsupportedFilesystem(String),

    #[error("read failed at offset {offset}: {source}")]
    Io { offset: u64, source: io::Error },

    #[error("failed to write {path}: {source}")]
    Output { path: String, source: io::Error },
}

impl RecoveryError {
    pub(crate) fn read_at(offset: u64, source: io::Error) -> Self {
        RecoveryError::Io { offset, source }
    }

    pub(crate) fn output(path: &std::path::Path, source: io::Error) -> Self {
        RecoveryError::Output {
            path: path.display().to_string(),
            source,
        }
    }
}
