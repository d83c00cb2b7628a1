//! Copy transport (component H): relocates images between registries, or
//! exports them into a single tar archive, with bounded worker
//! concurrency (§4.H).

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;

use crate::error::{Error, Result};
use crate::gateway::RegistryGateway;
use crate::image::config_has_bundle_label;
use crate::model::{ProcessedImage, UnprocessedImageRef};
use crate::reference::{Digest, Reference, Selector};
use crate::sink::Sink;

/// Parameters shared by every worker in one copy run.
#[derive(Debug, Clone)]
pub struct CopyConfig {
    /// Destination registry host (relocate mode only).
    pub dest_registry: String,
    /// Destination repository path (relocate mode only).
    pub dest_repository: String,
    /// Worker pool size.
    pub concurrency: usize,
    /// Whether to push layers flagged non-distributable.
    pub include_non_distributable: bool,
}

#[derive(Debug, Deserialize)]
struct RawDescriptor {
    digest: String,
    size: u64,
    #[serde(rename = "mediaType", default)]
    media_type: String,
}

#[derive(Debug, Deserialize)]
struct RawManifest {
    config: RawDescriptor,
    layers: Vec<RawDescriptor>,
}

/// Relocates every `refs` entry from wherever `gateway` resolves it to
/// `config.dest_registry`/`config.dest_repository`, parallelized across
/// `config.concurrency` workers.
///
/// On the first worker failure, queued-but-not-yet-started work is
/// cancelled (surfaced as [`Error::Cancelled`]); already in-flight workers
/// run to completion, and anything they already pushed is left in place —
/// safe, since all pushed content is addressed by digest (§4.H, §7).
pub async fn relocate(
    gateway: &Arc<dyn RegistryGateway>,
    refs: &[UnprocessedImageRef],
    config: &CopyConfig,
    sink: &dyn Sink,
) -> Result<Vec<ProcessedImage>> {
    let failed = Arc::new(AtomicBool::new(false));
    let first_error: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));
    let processed = Arc::new(Mutex::new(Vec::new()));

    stream::iter(refs.iter().cloned())
        .map(|item| {
            let gateway = gateway.clone();
            let config = config.clone();
            let failed = failed.clone();
            let first_error = first_error.clone();
            let processed = processed.clone();
            async move {
                if failed.load(Ordering::SeqCst) {
                    return;
                }
                match relocate_one(&gateway, &item, &config).await {
                    Ok(result) => processed.lock().unwrap().push(result),
                    Err(e) => {
                        failed.store(true, Ordering::SeqCst);
                        let mut slot = first_error.lock().unwrap();
                        if slot.is_none() {
                            *slot = Some(e);
                        }
                    }
                }
            }
        })
        .buffer_unordered(config.concurrency.max(1))
        .for_each(|()| async {})
        .await;

    if let Some(err) = first_error.lock().unwrap().take() {
        return Err(err);
    }
    let _ = sink;
    Ok(Arc::try_unwrap(processed)
        .map_err(|_| Error::Internal("relocate: processed accumulator still shared after join".into()))?
        .into_inner()
        .unwrap())
}

async fn relocate_one(
    gateway: &Arc<dyn RegistryGateway>,
    item: &UnprocessedImageRef,
    config: &CopyConfig,
) -> Result<ProcessedImage> {
    let src = &item.digest_ref;
    let src_digest = src.as_digest()?.clone();

    let manifest = gateway.get_manifest(src).await?;
    let raw: RawManifest = serde_json::from_slice(&manifest.bytes).map_err(|e| Error::Format(e.to_string()))?;

    for layer in &raw.layers {
        let digest = Digest::parse(&layer.digest)?;
        if is_non_distributable(&layer.media_type) && !config.include_non_distributable {
            continue;
        }
        let mounted = gateway
            .mount_blob(src.repository(), &config.dest_repository, &digest)
            .await?;
        if !mounted {
            let reader = gateway.get_layer(src.repository(), &digest).await?;
            gateway
                .put_blob(&config.dest_repository, &digest, layer.size, reader)
                .await?;
        }
    }

    let config_digest = Digest::parse(&raw.config.digest)?;
    let config_bytes = gateway.get_config(src.repository(), &config_digest).await?;
    let is_bundle = config_has_bundle_label(&config_bytes)?;
    gateway
        .put_blob(
            &config.dest_repository,
            &config_digest,
            raw.config.size,
            Box::new(Cursor::new(config_bytes)),
        )
        .await?;

    let dest_reference = Reference::from_parts(
        config.dest_registry.clone(),
        config.dest_repository.clone(),
        Selector::Digest(src_digest.clone()),
    );
    let pushed_digest = gateway
        .put_manifest(&dest_reference, &manifest.bytes, &manifest.media_type)
        .await?;
    if pushed_digest != src_digest {
        return Err(Error::DigestMismatch {
            reference: dest_reference.to_string(),
            expected: src_digest.as_str().to_owned(),
            actual: pushed_digest.as_str().to_owned(),
        });
    }

    if let Some(tag) = &item.tag {
        gateway.tag(&dest_reference, tag).await?;
    }

    Ok(ProcessedImage {
        unprocessed_ref: item.clone(),
        digest_ref: dest_reference,
        is_bundle,
    })
}

const NON_DISTRIBUTABLE_MEDIA_TYPES: &[&str] = &[
    "application/vnd.oci.image.layer.nondistributable.v1.tar",
    "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip",
    "application/vnd.oci.image.layer.nondistributable.v1.tar+zstd",
    "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip",
];

fn is_non_distributable(media_type: &str) -> bool {
    NON_DISTRIBUTABLE_MEDIA_TYPES.contains(&media_type)
}

/// A single layer's descriptor as recorded in the exported tar's
/// `manifest.json` (§6.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TarLayerEntry {
    /// Content digest.
    pub digest: String,
    /// Manifest-declared media type.
    pub media_type: String,
    /// `false` if this layer was flagged non-distributable and skipped, so
    /// the archive carries no corresponding `<digest>.tar.gz` entry for it.
    pub present: bool,
}

/// One entry of the exported tar's `manifest.json` (§6.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TarManifestEntry {
    /// The source digest reference this entry was exported from.
    pub image_ref: String,
    /// Digest of the image manifest.
    pub manifest_digest: String,
    /// Digest of the config blob.
    pub config_digest: String,
    /// Every layer descriptor from the source manifest, in manifest order,
    /// each flagged with whether its blob was actually written to the
    /// archive.
    pub layers: Vec<TarLayerEntry>,
}

/// Serializes every `refs` entry into a single tar archive at `writer`:
/// `manifest.json`, one `<digest>.json` per config blob, one
/// `<digest>.tar.gz` per included layer blob (§6.4).
///
/// `manifest.json` lists every layer descriptor from the source manifest,
/// including skipped non-distributable ones (marked `present: false`);
/// only included layers get a corresponding `<digest>.tar.gz` entry. One
/// advisory line per skipped media type is written to `sink`.
pub async fn export<W: std::io::Write>(
    gateway: &Arc<dyn RegistryGateway>,
    refs: &[UnprocessedImageRef],
    include_non_distributable: bool,
    writer: W,
    sink: &dyn Sink,
) -> Result<()> {
    let mut builder = tar::Builder::new(writer);
    let mut manifest_entries = Vec::new();
    let mut skipped_media_types = std::collections::BTreeSet::new();

    for item in refs {
        let src = &item.digest_ref;
        let manifest = gateway.get_manifest(src).await?;
        let raw: RawManifest = serde_json::from_slice(&manifest.bytes).map_err(|e| Error::Format(e.to_string()))?;

        append_entry(
            &mut builder,
            &format!("{}.manifest.json", manifest.digest.as_dirname()),
            &manifest.bytes,
        )?;

        let config_digest = Digest::parse(&raw.config.digest)?;
        let config_bytes = gateway.get_config(src.repository(), &config_digest).await?;
        append_entry(&mut builder, &format!("{}.json", config_digest.as_dirname()), &config_bytes)?;

        let mut layers = Vec::new();
        for layer in &raw.layers {
            let digest = Digest::parse(&layer.digest)?;
            if is_non_distributable(&layer.media_type) && !include_non_distributable {
                skipped_media_types.insert(layer.media_type.clone());
                layers.push(TarLayerEntry {
                    digest: digest.as_str().to_owned(),
                    media_type: layer.media_type.clone(),
                    present: false,
                });
                continue;
            }
            let mut reader = gateway.get_layer(src.repository(), &digest).await?;
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf).await?;
            append_entry(&mut builder, &format!("{}.tar.gz", digest.as_dirname()), &buf)?;
            layers.push(TarLayerEntry {
                digest: digest.as_str().to_owned(),
                media_type: layer.media_type.clone(),
                present: true,
            });
        }

        manifest_entries.push(TarManifestEntry {
            image_ref: src.to_string(),
            manifest_digest: manifest.digest.as_str().to_owned(),
            config_digest: config_digest.as_str().to_owned(),
            layers,
        });
    }

    let manifest_json = serde_json::to_vec(&manifest_entries).map_err(|e| Error::Format(e.to_string()))?;
    append_entry(&mut builder, "manifest.json", &manifest_json)?;
    builder.finish()?;

    for media_type in skipped_media_types {
        sink.warn(&format!("excluded non-distributable layer media type: {media_type}"));
    }
    Ok(())
}

fn append_entry<W: std::io::Write>(builder: &mut tar::Builder<W>, name: &str, data: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::FakeGateway;
    use crate::sink::NoopSink;

    fn seed_image(gateway: &FakeGateway, registry: &str, repository: &str, layer_data: &[u8]) -> Digest {
        let layer_digest = gateway.seed_blob(registry, repository, layer_data.to_vec());
        let config_digest = gateway.seed_blob(registry, repository, b"{}".to_vec());
        let manifest = serde_json::json!({
            "config": {"digest": config_digest.as_str(), "size": 2},
            "layers": [{"digest": layer_digest.as_str(), "size": layer_data.len(), "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip"}],
        });
        let reference = Reference::parse(&format!("{registry}/{repository}:latest")).unwrap();
        gateway.seed_manifest(&reference, serde_json::to_vec(&manifest).unwrap(), "application/vnd.oci.image.manifest.v1+json")
    }

    #[tokio::test]
    async fn relocate_preserves_digest_identity() {
        let fake = FakeGateway::new();
        let digest = seed_image(&fake, "src.example.com", "repo", b"layer-bytes");
        let gateway: Arc<dyn RegistryGateway> = Arc::new(fake);
        let src_ref = Reference::from_parts("src.example.com", "repo", Selector::Digest(digest.clone()));
        let refs = vec![UnprocessedImageRef::new(src_ref)];
        let config = CopyConfig {
            dest_registry: "dst.example.com".into(),
            dest_repository: "home/repo".into(),
            concurrency: 2,
            include_non_distributable: true,
        };
        let processed = relocate(&gateway, &refs, &config, &NoopSink).await.unwrap();
        assert_eq!(processed.len(), 1);
        assert_eq!(processed[0].digest_ref.as_digest().unwrap(), &digest);
        assert_eq!(processed[0].digest_ref.registry(), "dst.example.com");
    }

    #[tokio::test]
    async fn export_excludes_non_distributable_layers() {
        let fake = FakeGateway::new();
        let distributable = fake.seed_blob("src.example.com", "repo", b"plain".to_vec());
        let non_distributable = fake.seed_blob("src.example.com", "repo", b"restricted".to_vec());
        let config_digest = fake.seed_blob("src.example.com", "repo", b"{}".to_vec());
        let manifest = serde_json::json!({
            "config": {"digest": config_digest.as_str(), "size": 2},
            "layers": [
                {"digest": distributable.as_str(), "size": 5, "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip"},
                {"digest": non_distributable.as_str(), "size": 10, "mediaType": "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip"},
            ],
        });
        let reference = Reference::parse("src.example.com/repo:latest").unwrap();
        let digest = fake.seed_manifest(&reference, serde_json::to_vec(&manifest).unwrap(), "application/vnd.oci.image.manifest.v1+json");
        let gateway: Arc<dyn RegistryGateway> = Arc::new(fake);
        let src_ref = Reference::from_parts("src.example.com", "repo", Selector::Digest(digest));
        let mut out = Vec::new();
        export(&gateway, &[UnprocessedImageRef::new(src_ref)], false, &mut out, &NoopSink)
            .await
            .unwrap();

        let mut archive = tar::Archive::new(Cursor::new(out));
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().any(|n| n.contains(distributable.hex())));
        assert!(!names.iter().any(|n| n.contains(non_distributable.hex())));
    }
}
