use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure kinds of the encryption core.
///
/// Per-recipient provider failures (`ProviderError`, `ProviderTimeout`) are
/// recoverable at the key-ring level: the ring logs them and moves on to the
/// next recipient. Everything else aborts the operation that raised it.
#[derive(Debug, Error)]
pub enum Error {
    /// A leaf looked like ciphertext but did not parse as an envelope.
    #[error("malformed ciphertext envelope: {0}")]
    MalformedEnvelope(String),

    /// The `type:` tag of an envelope is outside the closed set.
    #[error("unknown value type tag '{0}'")]
    UnsupportedType(String),

    /// GCM tag verification failed for a leaf.
    #[error("value authentication failed at '{path}'")]
    AuthenticationFailed { path: String },

    /// `sops.mac` (or the `lastmodified` it is bound to) is absent.
    #[error("'mac' not found, unable to verify file integrity")]
    IntegrityMissing,

    /// The recomputed digest does not match the stored, authenticated one.
    #[error("checksum verification failed!\nexpected {expected}\nbut got  {computed}")]
    IntegrityMismatch { expected: String, computed: String },

    /// No master-key recipient could wrap or unwrap the data key.
    #[error("no usable master key: could not {0} the data key with any recipient")]
    NoUsableRecipient(&'static str),

    /// A single provider call exceeded its deadline.
    #[error("master key provider timed out: {0}")]
    ProviderTimeout(String),

    /// A single provider call failed.
    #[error("master key provider error: {0}")]
    ProviderError(String),

    /// The document codec rejected its input.
    #[error("document syntax error: {0}")]
    Syntax(String),

    /// The source was not modified during an edit session.
    #[error("file has not been modified, exiting without writing")]
    NoChange,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn auth_failed() -> Self {
        Error::AuthenticationFailed { path: String::new() }
    }

    /// Attach the document path of the offending leaf to an
    /// `AuthenticationFailed` raised below the walker.
    pub(crate) fn at_path(self, path: &[String]) -> Self {
        match self {
            Error::AuthenticationFailed { .. } => Error::AuthenticationFailed {
                path: path.join("/"),
            },
            other => other,
        }
    }
}
