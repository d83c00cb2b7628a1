//! Image-set planner (component G): expands a root copy input — a bundle
//! reference, a plain image reference, or a lock file — into the full
//! transitive [`ImageSet`] the transport must move (§4.G).

use std::sync::Arc;

use crate::bundle::Bundle;
use crate::error::{Error, Result};
use crate::gateway::RegistryGateway;
use crate::image::PlainImage;
use crate::lock::LockDocument;
use crate::model::{ImageSet, UnprocessedImageRef};
use crate::reference::Reference;

/// A single root input to a copy: how the caller named what to copy.
#[derive(Debug, Clone)]
pub enum RootInput {
    /// `-b`/`--bundle`: a reference known (or asserted) to be a bundle.
    Bundle(Reference),
    /// `-i`/`--image`: a reference asserted to be a plain, non-bundle
    /// image.
    Image(Reference),
    /// `--lock`: bytes of a `BundleLock` or `ImagesLock` file.
    Lock(Vec<u8>),
}

/// Expands every root input into the deduplicated transitive set of images
/// to copy.
///
/// Rules (§4.G):
/// - A bundle root contributes every entry of `bundle.allImagesLock()` as
///   untagged refs, then the bundle itself tagged so the destination
///   receives the original tag. If the reference turns out not to carry
///   the bundle label, the call fails with [`Error::NotABundle`].
/// - A plain-image root contributes itself untagged; if it turns out to be
///   a bundle, the call fails with [`Error::ExpectedPlainImage`].
/// - A `BundleLock` root behaves as the bundle case, using the lock's own
///   tag.
/// - An `ImagesLock` root contributes every entry as a plain image; any
///   entry that is itself a bundle fails the whole call with
///   [`Error::BundleInImagesLock`].
pub async fn expand(
    gateway: &Arc<dyn RegistryGateway>,
    concurrency: usize,
    roots: &[RootInput],
) -> Result<ImageSet> {
    let mut set = ImageSet::new();
    for root in roots {
        match root {
            RootInput::Bundle(reference) => expand_bundle_root(gateway, concurrency, reference, None, &mut set).await?,
            RootInput::Image(reference) => expand_image_root(gateway, reference, &mut set).await?,
            RootInput::Lock(bytes) => expand_lock_root(gateway, concurrency, bytes, &mut set).await?,
        }
    }
    Ok(set)
}

async fn expand_bundle_root(
    gateway: &Arc<dyn RegistryGateway>,
    concurrency: usize,
    reference: &Reference,
    tag_override: Option<String>,
    set: &mut ImageSet,
) -> Result<()> {
    let image = PlainImage::new(reference.clone(), gateway.clone());
    if !image.is_bundle().await? {
        return Err(Error::NotABundle(reference.to_string()));
    }
    let bundle = Bundle::from_plain_image(image);
    let digest_ref = bundle.reference().clone();
    let resolved = resolve_digest(gateway, &digest_ref).await?;

    let all = bundle.all_images_lock(concurrency).await?;
    for entry in all.images {
        let image_ref = Reference::parse(&entry.image)?;
        set.add(UnprocessedImageRef::new(image_ref));
    }

    let tag = tag_override.or_else(|| reference.tag().map(str::to_owned));
    match tag {
        Some(tag) => set.add(UnprocessedImageRef::with_tag(resolved, tag)),
        None => set.add(UnprocessedImageRef::new(resolved)),
    }
    Ok(())
}

async fn expand_image_root(gateway: &Arc<dyn RegistryGateway>, reference: &Reference, set: &mut ImageSet) -> Result<()> {
    let image = PlainImage::new(reference.clone(), gateway.clone());
    if image.is_bundle().await? {
        return Err(Error::ExpectedPlainImage(reference.to_string()));
    }
    let resolved = resolve_digest(gateway, reference).await?;
    set.add(UnprocessedImageRef::new(resolved));
    Ok(())
}

async fn expand_lock_root(
    gateway: &Arc<dyn RegistryGateway>,
    concurrency: usize,
    bytes: &[u8],
    set: &mut ImageSet,
) -> Result<()> {
    match LockDocument::read(bytes)? {
        LockDocument::Bundle(bundle_lock) => {
            let reference = Reference::parse(&bundle_lock.bundle.image)?;
            expand_bundle_root(gateway, concurrency, &reference, Some(bundle_lock.bundle.tag), set).await
        }
        LockDocument::Images(images_lock) => {
            for entry in images_lock.images {
                let reference = Reference::parse(&entry.image)?;
                let image = PlainImage::new(reference.clone(), gateway.clone());
                if image.is_bundle().await? {
                    return Err(Error::BundleInImagesLock(reference.to_string()));
                }
                set.add(UnprocessedImageRef::new(reference));
            }
            Ok(())
        }
    }
}

async fn resolve_digest(gateway: &Arc<dyn RegistryGateway>, reference: &Reference) -> Result<Reference> {
    let image = PlainImage::new(reference.clone(), gateway.clone());
    image.digest_ref().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::FakeGateway;
    use crate::reference::Selector;

    fn seed_plain_image(gateway: &FakeGateway, registry: &str, repository: &str) -> Reference {
        let config = b"{}".to_vec();
        let config_digest = gateway.seed_blob(registry, repository, config);
        let manifest = serde_json::json!({
            "config": {"digest": config_digest.as_str(), "size": 2},
            "layers": [],
        });
        let reference = Reference::parse(&format!("{registry}/{repository}:latest")).unwrap();
        let digest = gateway.seed_manifest(&reference, serde_json::to_vec(&manifest).unwrap(), "application/vnd.oci.image.manifest.v1+json");
        Reference::from_parts(registry, repository, Selector::Digest(digest))
    }

    #[tokio::test]
    async fn plain_image_root_rejects_bundle() {
        let fake = FakeGateway::new();
        let config = br#"{"config":{"Labels":{"dev.carvel.imgpkg.bundle":"yes"}}}"#.to_vec();
        let config_digest = fake.seed_blob("src.example.com", "repo", config);
        let manifest = serde_json::json!({"config": {"digest": config_digest.as_str(), "size": 2}, "layers": []});
        let reference = Reference::parse("src.example.com/repo:latest").unwrap();
        fake.seed_manifest(
            &reference,
            serde_json::to_vec(&manifest).unwrap(),
            "application/vnd.oci.image.manifest.v1+json",
        );
        let gateway: Arc<dyn RegistryGateway> = Arc::new(fake);

        let err = expand_image_root(&gateway, &reference, &mut ImageSet::new()).await.unwrap_err();
        assert!(matches!(err, Error::ExpectedPlainImage(_)));
    }

    #[tokio::test]
    async fn plain_image_root_resolves_digest() {
        let fake = FakeGateway::new();
        let reference = seed_plain_image(&fake, "src.example.com", "repo");
        let gateway: Arc<dyn RegistryGateway> = Arc::new(fake);
        let mut set = ImageSet::new();
        expand_image_root(&gateway, &reference, &mut set).await.unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.as_slice()[0].digest_ref.is_digested());
    }
}
