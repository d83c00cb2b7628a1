//! Plain image handle bound to a registry gateway.

use std::sync::Arc;

use tokio::sync::OnceCell;

use crate::error::{Error, Result};
use crate::gateway::RegistryGateway;
use crate::reference::{Digest, Reference, Selector};

/// A digest-addressed OCI image handle bound to a registry gateway.
///
/// Stateless except for memoized digest resolution: `fetch` can be called
/// repeatedly and will re-query the gateway each time, but [`PlainImage::digest_ref`]
/// caches its result so a tagged input is only resolved once per handle.
pub struct PlainImage {
    reference: Reference,
    gateway: Arc<dyn RegistryGateway>,
    resolved_digest: OnceCell<Digest>,
}

/// The manifest plus ordered layer descriptors that make up a fetched
/// image.
#[derive(Debug, Clone)]
pub struct FetchedImage {
    /// Raw manifest bytes.
    pub manifest_bytes: Vec<u8>,
    /// Manifest media type.
    pub media_type: String,
    /// Content digest of the manifest actually fetched (after any
    /// platform selection the gateway performed for an index).
    pub digest: Digest,
    /// Config blob digest, parsed out of the manifest.
    pub config_digest: Digest,
    /// Layer descriptors in manifest order.
    pub layers: Vec<LayerDescriptor>,
}

/// A single layer's descriptor as it appears in the manifest.
#[derive(Debug, Clone)]
pub struct LayerDescriptor {
    /// Content digest.
    pub digest: Digest,
    /// Declared size in bytes.
    pub size: u64,
    /// Media type, used to decide non-distributable handling (§4.H).
    pub media_type: String,
}

#[derive(Debug, serde::Deserialize)]
struct RawManifest {
    config: RawDescriptor,
    layers: Vec<RawDescriptor>,
}

#[derive(Debug, serde::Deserialize)]
struct RawDescriptor {
    digest: String,
    size: u64,
    #[serde(rename = "mediaType", default)]
    media_type: String,
}

/// Known non-distributable OCI/Docker layer media types (§4.H).
const NON_DISTRIBUTABLE_MEDIA_TYPES: &[&str] = &[
    "application/vnd.oci.image.layer.nondistributable.v1.tar",
    "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip",
    "application/vnd.oci.image.layer.nondistributable.v1.tar+zstd",
    "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip",
];

impl LayerDescriptor {
    /// `true` if this layer's media type is flagged non-distributable.
    #[must_use]
    pub fn is_non_distributable(&self) -> bool {
        NON_DISTRIBUTABLE_MEDIA_TYPES.contains(&self.media_type.as_str())
    }
}

impl PlainImage {
    /// Builds a handle over `reference`, using `gateway` for all I/O.
    #[must_use]
    pub fn new(reference: Reference, gateway: Arc<dyn RegistryGateway>) -> Self {
        Self {
            reference,
            gateway,
            resolved_digest: OnceCell::new(),
        }
    }

    /// The reference this handle was built from (may carry a tag).
    #[must_use]
    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    /// Resolves and caches the digest for this image, HEAD-ing the
    /// manifest exactly once even if the input reference carried a tag.
    pub async fn digest_ref(&self) -> Result<Reference> {
        if let Selector::Digest(_) = self.reference.selector() {
            return Ok(self.reference.clone());
        }
        let digest = self
            .resolved_digest
            .get_or_try_init(|| async {
                self.gateway
                    .head_manifest(&self.reference)
                    .await?
                    .ok_or_else(|| Error::Format(format!("manifest not found: {}", self.reference)))
            })
            .await?;
        Ok(self.reference.with_selector(Selector::Digest(digest.clone())))
    }

    /// Fetches the manifest and parses out config/layer descriptors.
    pub async fn fetch(&self) -> Result<FetchedImage> {
        let manifest = self.gateway.get_manifest(&self.reference).await?;
        let raw: RawManifest =
            serde_json::from_slice(&manifest.bytes).map_err(|e| Error::Format(e.to_string()))?;
        let config_digest = Digest::parse(&raw.config.digest)?;
        let layers = raw
            .layers
            .into_iter()
            .map(|d| {
                Ok(LayerDescriptor {
                    digest: Digest::parse(&d.digest)?,
                    size: d.size,
                    media_type: d.media_type,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(FetchedImage {
            manifest_bytes: manifest.bytes,
            media_type: manifest.media_type,
            digest: manifest.digest,
            config_digest,
            layers,
        })
    }

    /// Inspects the image config's labels and returns `true` iff the
    /// bundle label (`dev.carvel.imgpkg.bundle`) is present with a
    /// non-empty value.
    ///
    /// A missing manifest or config is a retriable fetch error, surfaced
    /// unchanged; this method never swallows transport failures into
    /// `false`.
    pub async fn is_bundle(&self) -> Result<bool> {
        let fetched = self.fetch().await?;
        let config_bytes = self
            .gateway
            .get_config(self.reference.repository(), &fetched.config_digest)
            .await?;
        config_has_bundle_label(&config_bytes)
    }

    /// Access to the underlying gateway, for components that need to
    /// issue further calls against the same registry (localizer,
    /// transport).
    #[must_use]
    pub fn gateway(&self) -> &Arc<dyn RegistryGateway> {
        &self.gateway
    }
}

#[derive(Debug, serde::Deserialize)]
struct ImageConfigLabels {
    config: Option<InnerConfig>,
}

#[derive(Debug, serde::Deserialize)]
struct InnerConfig {
    #[serde(rename = "Labels", default)]
    labels: Option<std::collections::HashMap<String, String>>,
}

/// `true` iff a raw image config blob carries the bundle label with a
/// non-empty value. Shared by [`PlainImage::is_bundle`] and the copy
/// transport, which already has the config bytes in hand after a push and
/// would otherwise need a redundant fetch to classify the image it just
/// copied.
pub(crate) fn config_has_bundle_label(config_bytes: &[u8]) -> Result<bool> {
    let config: ImageConfigLabels =
        serde_json::from_slice(config_bytes).map_err(|e| Error::Format(e.to_string()))?;
    Ok(config
        .config
        .and_then(|c| c.labels)
        .and_then(|labels| labels.get(crate::bundle::BUNDLE_CONFIG_LABEL).cloned())
        .is_some_and(|v| !v.is_empty()))
}
