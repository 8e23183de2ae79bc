use std::path::PathBuf;

use thiserror::Error;

/// crypto-cli error types
#[derive(Error, Debug)]
pub enum CryptoCliError {
    /// Image reference could not be parsed
    #[error("Invalid image reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    /// The image carries no encryption sentinel label
    #[error("Image is not encryptable: no encryption label in its build history")]
    NotEncryptable,

    /// The image's parent layers are not present in the local daemon
    #[error("Image was not built on this machine: parent layers are missing")]
    NotBuiltLocally,

    /// Authentication was rejected after a token refresh
    #[error("Authentication denied for scope '{scope}'")]
    AuthDenied { scope: String },

    /// The registry sent an auth challenge the client cannot interpret
    #[error("Auth protocol error: {0}")]
    AuthProtocolError(String),

    /// Key unwrap failed: wrong passphrase or tampered key material
    /// (indistinguishable by design)
    #[error("Bad passphrase")]
    BadPassphrase,

    /// An AEAD frame failed authentication during stream decryption
    #[error("Corrupt ciphertext: {0}")]
    CorruptCiphertext(String),

    /// The OS random number generator failed
    #[error("System RNG failure")]
    RngFailure,

    /// A network operation timed out or the connection failed
    #[error("Network error contacting {url}: {reason}")]
    NetworkError { url: String, reason: String },

    /// The registry answered with an unexpected HTTP status
    #[error("HTTP {status} from {url}")]
    HttpStatus { status: u16, url: String },

    /// A downloaded blob did not match its expected digest
    #[error("Corrupt download: expected {expected}, got {actual}")]
    CorruptTransport { expected: String, actual: String },

    /// A blob upload handshake did not complete
    #[error("Upload of blob {digest} failed with status {status}")]
    UploadFailed { digest: String, status: u16 },

    /// Container daemon invocation failed
    #[error("Daemon error: {0}")]
    Daemon(String),

    /// I/O error with the path it occurred on
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The workflow was cancelled
    #[error("Cancelled")]
    Cancelled,

    /// Several workers failed; individual errors preserved in order
    #[error("{0}")]
    Multiple(ErrorSet),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl CryptoCliError {
    /// Attach path context to an I/O error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CryptoCliError::Io {
            path: path.into(),
            source,
        }
    }

    /// Process exit code for this error.
    ///
    /// 1 generic, 2 authentication, 3 bad passphrase, 4 not encryptable,
    /// 5 network/transport, 6 cancelled.
    pub fn exit_code(&self) -> i32 {
        match self {
            CryptoCliError::AuthDenied { .. } | CryptoCliError::AuthProtocolError(_) => 2,
            CryptoCliError::BadPassphrase => 3,
            CryptoCliError::NotEncryptable | CryptoCliError::NotBuiltLocally => 4,
            CryptoCliError::NetworkError { .. }
            | CryptoCliError::HttpStatus { .. }
            | CryptoCliError::CorruptTransport { .. }
            | CryptoCliError::UploadFailed { .. } => 5,
            CryptoCliError::Cancelled => 6,
            CryptoCliError::Multiple(set) => set.first().map(|e| e.exit_code()).unwrap_or(1),
            _ => 1,
        }
    }
}

impl From<serde_json::Error> for CryptoCliError {
    fn from(err: serde_json::Error) -> Self {
        CryptoCliError::Serialization(err.to_string())
    }
}

/// Result type alias for crypto-cli operations
pub type Result<T> = std::result::Result<T, CryptoCliError>;

/// Ordered collection of worker errors.
///
/// Preserves first-occurrence order so the primary cause is always reported
/// first and is never masked by cleanup failures that follow it.
#[derive(Debug, Default)]
pub struct ErrorSet {
    errors: Vec<CryptoCliError>,
}

impl ErrorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: CryptoCliError) {
        self.errors.push(err);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn first(&self) -> Option<&CryptoCliError> {
        self.errors.first()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CryptoCliError> {
        self.errors.iter()
    }

    /// Collapse into a single error: `None` if empty, the sole error if
    /// singular, `Multiple` otherwise.
    pub fn into_error(mut self) -> Option<CryptoCliError> {
        match self.errors.len() {
            0 => None,
            1 => Some(self.errors.remove(0)),
            _ => Some(CryptoCliError::Multiple(self)),
        }
    }

    /// Ok if no errors were collected, otherwise the collapsed error.
    pub fn into_result(self) -> Result<()> {
        match self.into_error() {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

impl std::fmt::Display for ErrorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for err in &self.errors {
            if !first {
                write!(f, "; ")?;
            }
            write!(f, "{}", err)?;
            first = false;
        }
        Ok(())
    }
}

impl IntoIterator for ErrorSet {
    type Item = CryptoCliError;
    type IntoIter = std::vec::IntoIter<CryptoCliError>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.into_iter()
    }
}
