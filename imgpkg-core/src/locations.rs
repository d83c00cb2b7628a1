//! Locations side-record recorder (component I): after a bundle copy,
//! publish a small single-layer OCI image caching which referenced images
//! are themselves bundles, so later copies can skip per-image bundle
//! probes (§4.I).

use sha2::{Digest as _, Sha256};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::gateway::RegistryGateway;
use crate::lock::{LocationEntry, Locations};
use crate::reference::{Digest, Reference, Selector};

const LOCATIONS_LAYER_MEDIA_TYPE: &str = "application/vnd.imgpkg.locations.v1+yaml";
const LOCATIONS_CONFIG_MEDIA_TYPE: &str = "application/vnd.imgpkg.locations.config.v1+json";
const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// The deterministic tag a Locations record is pushed under: a function of
/// the bundle's own digest, so re-running a copy overwrites the record
/// with identical content rather than accumulating stale tags.
#[must_use]
pub fn locations_tag(bundle_digest: &Digest) -> String {
    format!("{}.image-locations.imgpkg", bundle_digest.as_dirname())
}

/// Builds, serializes, and pushes a Locations record for `bundle_digest` at
/// `registry/repository`. Returns the digest of the pushed manifest.
pub async fn push(
    gateway: &dyn RegistryGateway,
    registry: &str,
    repository: &str,
    bundle_digest: &Digest,
    images: Vec<LocationEntry>,
) -> Result<Digest> {
    let body = Locations::new(images).write()?;
    let layer_digest = content_digest(&body);
    gateway
        .put_blob(
            repository,
            &layer_digest,
            body.len() as u64,
            Box::new(std::io::Cursor::new(body.clone())),
        )
        .await?;

    let config_bytes = b"{}".to_vec();
    let config_digest = content_digest(&config_bytes);
    gateway
        .put_blob(
            repository,
            &config_digest,
            config_bytes.len() as u64,
            Box::new(std::io::Cursor::new(config_bytes.clone())),
        )
        .await?;

    let manifest = RawManifest {
        schema_version: 2,
        media_type: MANIFEST_MEDIA_TYPE.to_owned(),
        config: RawDescriptor {
            media_type: LOCATIONS_CONFIG_MEDIA_TYPE.to_owned(),
            digest: config_digest.as_str().to_owned(),
            size: config_bytes.len() as u64,
        },
        layers: vec![RawDescriptor {
            media_type: LOCATIONS_LAYER_MEDIA_TYPE.to_owned(),
            digest: layer_digest.as_str().to_owned(),
            size: body.len() as u64,
        }],
    };
    let manifest_bytes = serde_json::to_vec(&manifest).map_err(|e| Error::Format(e.to_string()))?;

    let tag = locations_tag(bundle_digest);
    let reference = Reference::from_parts(registry, repository, Selector::Tag(tag));
    gateway.put_manifest(&reference, &manifest_bytes, MANIFEST_MEDIA_TYPE).await
}

/// Fetches the Locations record for `bundle_digest` at `registry/repository`,
/// if one has been published there. Used by the localizer to short-circuit
/// per-image HEADs with a single manifest fetch (§4.F).
pub async fn fetch(
    gateway: &dyn RegistryGateway,
    registry: &str,
    repository: &str,
    bundle_digest: &Digest,
) -> Result<Option<Locations>> {
    let tag = locations_tag(bundle_digest);
    let reference = Reference::from_parts(registry, repository, Selector::Tag(tag));
    let manifest = match gateway.get_manifest(&reference).await {
        Ok(m) => m,
        Err(Error::RegistryPermanent(_)) => return Ok(None),
        Err(e) => return Err(e),
    };
    let raw: RawManifestRead = serde_json::from_slice(&manifest.bytes).map_err(|e| Error::Format(e.to_string()))?;
    let Some(layer) = raw.layers.first() else {
        return Err(Error::Format(format!("locations manifest at {reference} has no layers")));
    };
    let layer_digest = Digest::parse(&layer.digest)?;
    let body = gateway.get_config(repository, &layer_digest).await?;
    Ok(Some(Locations::read(&body)?))
}

fn content_digest(data: &[u8]) -> Digest {
    let hex = Sha256::digest(data).iter().map(|b| format!("{b:02x}")).collect::<String>();
    Digest::parse(&format!("sha256:{hex}")).expect("sha256 hex digest is always well-formed")
}

#[derive(Debug, serde::Serialize)]
struct RawDescriptor {
    #[serde(rename = "mediaType")]
    media_type: String,
    digest: String,
    size: u64,
}

#[derive(Debug, serde::Serialize)]
struct RawManifest {
    #[serde(rename = "schemaVersion")]
    schema_version: u32,
    #[serde(rename = "mediaType")]
    media_type: String,
    config: RawDescriptor,
    layers: Vec<RawDescriptor>,
}

#[derive(Debug, Deserialize)]
struct RawDescriptorRead {
    digest: String,
}

#[derive(Debug, Deserialize)]
struct RawManifestRead {
    layers: Vec<RawDescriptorRead>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::FakeGateway;

    #[tokio::test]
    async fn push_then_fetch_round_trips() {
        let gateway = FakeGateway::new();
        let bundle_digest = Digest::parse(&format!("sha256:{}", "a".repeat(64))).unwrap();
        let images = vec![LocationEntry {
            image: format!("dst.example.com/repo@sha256:{}", "b".repeat(64)),
            is_bundle: false,
        }];
        push(&gateway, "dst.example.com", "repo", &bundle_digest, images.clone())
            .await
            .unwrap();

        let fetched = fetch(&gateway, "dst.example.com", "repo", &bundle_digest)
            .await
            .unwrap()
            .expect("locations record should exist");
        assert_eq!(fetched.images, images);
    }

    #[tokio::test]
    async fn fetch_missing_returns_none() {
        let gateway = FakeGateway::new();
        let bundle_digest = Digest::parse(&format!("sha256:{}", "c".repeat(64))).unwrap();
        let fetched = fetch(&gateway, "dst.example.com", "repo", &bundle_digest).await.unwrap();
        assert!(fetched.is_none());
    }

    #[test]
    fn tag_is_deterministic_function_of_digest() {
        let digest = Digest::parse(&format!("sha256:{}", "d".repeat(64))).unwrap();
        assert_eq!(locations_tag(&digest), format!("sha256-{}.image-locations.imgpkg", "d".repeat(64)));
    }
}
