//! Error taxonomy for the image bundle engine.

/// Alias for `Result<T, imgpkg_core::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the bundle engine.
///
/// Variants map onto the error taxonomy in the design: callers print the
/// variant and the offending reference, never a raw transport message.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A reference was expected to identify a bundle but did not carry the
    /// bundle label.
    #[error("Expected bundle image but found plain image (hint: did you mean to pass the image flag?): {0}")]
    NotABundle(String),

    /// A plain-image input turned out to be a bundle.
    #[error("Expected bundle flag when copying a bundle (hint: use the bundle input instead of the image input): {0}")]
    ExpectedPlainImage(String),

    /// An `ImagesLock` input referenced a bundle.
    #[error("Unable to copy bundles using an images lock file (hint: create a bundle containing these images): {0}")]
    BundleInImagesLock(String),

    /// Malformed manifest, missing reserved directory, or unparseable lock
    /// document.
    #[error("format error: {0}")]
    Format(String),

    /// A digest did not match its expected value after a content transfer.
    #[error("digest mismatch for {reference}: expected {expected}, got {actual}")]
    DigestMismatch {
        /// The reference being verified.
        reference: String,
        /// The digest that was expected.
        expected: String,
        /// The digest actually observed.
        actual: String,
    },

    /// A transient registry error (network, 5xx, rate limiting) that
    /// exhausted its retry budget.
    #[error("registry (transient): {0}")]
    RegistryTransient(String),

    /// A permanent registry error (4xx other than rate limiting, auth
    /// failure).
    #[error("registry (permanent): {0}")]
    RegistryPermanent(String),

    /// The caller's cancellation signal fired.
    #[error("cancelled")]
    Cancelled,

    /// A reference string could not be parsed.
    #[error("invalid reference {0:?}: {1}")]
    InvalidReference(String, String),

    /// A reference reached a stage that requires a digest selector but
    /// carried a tag, or some other state the core treats as unreachable.
    /// Not a user error: surfacing this means the engine has a defect.
    #[error("internal inconsistency: {0}")]
    Internal(String),

    /// Local filesystem I/O failure (tar export, bundle pull extraction).
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Lock-document (de)serialization failure.
    #[error("lock document: {0}")]
    LockDocument(String),

    /// A single image in a copy failed; remaining work was cancelled.
    #[error("copying {digest} failed: {source}")]
    ImageCopyFailed {
        /// Digest of the image whose copy failed.
        digest: String,
        /// Underlying error.
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// `true` for [`Error::RegistryTransient`], which the gateway layer is
    /// expected to have already retried with bounded backoff before this
    /// error reaches core code.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::RegistryTransient(_))
    }
}
