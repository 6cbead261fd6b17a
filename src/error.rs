//! Error taxonomy for formula operations.
//!
//! Every variant is fatal to the current formula operation. Nothing here is
//! retried; the binary maps each variant to a process exit status through
//! [`Error::exit_code`].

use std::path::PathBuf;

use crate::storage::StorageError;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Formula {name} doesn't exist (looked in '{}').", path.display())]
    FormulaNotFound { name: String, path: PathBuf },

    #[error("Archive {key} does not exist.\nPlease deploy it to continue.")]
    DependencyNotFound { key: String },

    #[error("object '{key}' not found in bucket '{bucket}'")]
    ObjectNotFound { bucket: String, key: String },

    #[error(
        "Attempted path traversal in tar file '{}': member '{member}' escapes '{}'",
        archive.display(),
        dest.display()
    )]
    PathTraversal {
        archive: PathBuf,
        member: String,
        dest: PathBuf,
    },

    #[error("Formula exited with return code {code}.")]
    ProcessFailure { code: i32 },

    #[error("Formula terminated by signal {}.", signal_label(*signal))]
    ProcessSignal { signal: i32 },

    #[error(
        "Interrupted by signal {} while the formula was running.",
        signal_label(*signal)
    )]
    Interrupted { signal: i32 },

    #[error("Archive {key} already exists.\nUse the --overwrite flag to continue.")]
    AlreadyExists { key: String },

    #[error("Deploy requires valid credentials; bucket '{bucket}' is accessed anonymously.")]
    Credentials { bucket: String },

    #[error("required tool '{tool}' was not found on PATH")]
    MissingTool { tool: &'static str },

    #[error("contract violation: {0}")]
    ContractViolation(&'static str),

    #[error(transparent)]
    Storage(StorageError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Process exit status for this failure.
    ///
    /// Signal-terminated scripts map to `128 + N` like a shell would report
    /// them; everything else is a plain `1`. [`Error::Interrupted`] should be
    /// re-raised rather than exited with; its code is only the fallback.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::ProcessSignal { signal } | Error::Interrupted { signal } => 128 + signal,
            _ => 1,
        }
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NoSuchKey { bucket, key } => Error::ObjectNotFound { bucket, key },
            other => Error::Storage(other),
        }
    }
}

/// Extension for attaching a message to raw I/O errors.
pub(crate) trait IoContext<T> {
    fn io_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> IoContext<T> for std::result::Result<T, std::io::Error> {
    fn io_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|source| Error::io(f(), source))
    }
}

fn signal_label(signal: i32) -> String {
    match crate::process::signal_name(signal) {
        Some(name) => name.to_string(),
        None => signal.to_string(),
    }
}
