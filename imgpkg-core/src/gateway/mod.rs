//! Registry gateway: the abstracted read/write surface over OCI
//! distribution the rest of the core is written against.
//!
//! This is one of the three narrow dynamic-dispatch points in the design
//! (the others are the images-lock reader and the UI sink) — modeled as a
//! small capability trait, not a sprawling class hierarchy, so tests can
//! swap in [`fake::FakeGateway`] without touching any other component.

mod fake;
mod oci;

pub use fake::FakeGateway;
pub use oci::OciDistributionGateway;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::error::Result;
use crate::reference::{Digest, Reference};

/// Content of a manifest as returned by the registry: raw bytes, media
/// type, and the digest the registry computed (or the caller already
/// knows, for digested references).
#[derive(Debug, Clone)]
pub struct ManifestBytes {
    /// Raw manifest document bytes.
    pub bytes: Vec<u8>,
    /// The manifest's declared `mediaType`.
    pub media_type: String,
    /// Content digest of `bytes`.
    pub digest: Digest,
}

/// Abstract read/write of manifests, blobs, and tags.
///
/// All methods are idempotent with respect to content digests: pushing the
/// same blob or manifest twice is a no-op on the second call as far as
/// observable registry state goes. Implementations are expected to be safe
/// for concurrent use by the copy transport's worker pool.
#[async_trait]
pub trait RegistryGateway: Send + Sync {
    /// Fetches a manifest (or index) by reference.
    async fn get_manifest(&self, reference: &Reference) -> Result<ManifestBytes>;

    /// Fetches a config blob by digest.
    async fn get_config(&self, repository: &str, digest: &Digest) -> Result<Vec<u8>>;

    /// Opens a streaming reader for a layer blob.
    async fn get_layer(
        &self,
        repository: &str,
        digest: &Digest,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>>;

    /// Checks whether a manifest exists at `reference` without transferring
    /// its body, returning its digest if present. Used by the localizer,
    /// which only needs digest equality, not a full manifest fetch.
    async fn head_manifest(&self, reference: &Reference) -> Result<Option<Digest>>;

    /// Publishes a manifest under `reference`.
    async fn put_manifest(&self, reference: &Reference, bytes: &[u8], media_type: &str) -> Result<Digest>;

    /// Uploads a blob from a streaming reader, verifying it lands under
    /// `digest`.
    async fn put_blob(
        &self,
        repository: &str,
        digest: &Digest,
        size: u64,
        reader: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Result<()>;

    /// Attempts a cross-repository blob mount (same registry, different
    /// repository) as an upload-avoidance optimization. Returns `false` if
    /// unsupported or the blob was absent at the source; callers fall back
    /// to [`RegistryGateway::get_layer`] + [`RegistryGateway::put_blob`].
    async fn mount_blob(&self, src_repository: &str, dst_repository: &str, digest: &Digest) -> Result<bool>;

    /// Applies a tag to a digest.
    async fn tag(&self, reference: &Reference, tag: &str) -> Result<()>;

    /// Lists tags in a repository.
    async fn list_tags(&self, registry: &str, repository: &str) -> Result<Vec<String>>;
}
