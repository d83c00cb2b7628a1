//! Bundle model: detection, embedded `ImagesLock` extraction, nested-bundle
//! traversal, on-disk materialization, and the post-copy Locations note
//! (§4.E).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use futures::stream::{self, StreamExt};
use tokio::sync::OnceCell;

use crate::error::{Error, Result};
use crate::extract;
use crate::gateway::RegistryGateway;
use crate::image::PlainImage;
use crate::lock::{ImageLocation, ImagesLock, LocationEntry};
use crate::localize;
use crate::locations;
use crate::model::ProcessedImage;
use crate::reference::{Digest, Reference};
use crate::sink::Sink;

/// The manifest config label that marks an image as a bundle. Its value is
/// ignored; only presence with a non-empty string matters (§6.1).
pub(crate) const BUNDLE_CONFIG_LABEL: &str = "dev.carvel.imgpkg.bundle";

const RESERVED_DIR: &str = ".imgpkg";
const IMAGES_LOCK_PATH: &str = ".imgpkg/images.yml";

/// A [`PlainImage`] known (or suspected) to carry the bundle label, plus
/// the auxiliary state the Bundle's public contract needs: a bundle-ness
/// cache and an in-memory index of known image references for the
/// Locations recorder.
pub struct Bundle {
    image: PlainImage,
    gateway: Arc<dyn RegistryGateway>,
    is_bundle_cache: OnceCell<bool>,
    images_ref: Mutex<Vec<ImageLocation>>,
}

/// Outcome of [`Bundle::pull`].
#[derive(Debug, Clone, Default)]
pub struct PullResult {
    /// Number of nested bundles materialized (not counting the root).
    pub nested_bundles_pulled: usize,
}

impl Bundle {
    /// Builds a handle over `reference`, probing bundle-ness lazily.
    #[must_use]
    pub fn new(reference: Reference, gateway: Arc<dyn RegistryGateway>) -> Self {
        Self::from_plain_image(PlainImage::new(reference, gateway))
    }

    /// Wraps an already-constructed [`PlainImage`] handle — used when the
    /// caller already resolved/fetched the underlying image (e.g. the
    /// planner, after it has determined an input is a bundle reference).
    #[must_use]
    pub fn from_plain_image(image: PlainImage) -> Self {
        let gateway = image.gateway().clone();
        Self {
            image,
            gateway,
            is_bundle_cache: OnceCell::new(),
            images_ref: Mutex::new(Vec::new()),
        }
    }

    /// The underlying reference.
    #[must_use]
    pub fn reference(&self) -> &Reference {
        self.image.reference()
    }

    /// `true` iff the underlying image carries the bundle label.
    /// Delegates to [`PlainImage::is_bundle`] and caches the result.
    pub async fn is_bundle(&self) -> Result<bool> {
        self.is_bundle_cache
            .get_or_try_init(|| self.image.is_bundle())
            .await
            .copied()
    }

    /// Registers additional known image references (used by the planner
    /// and transport to build up the index the Locations recorder reads).
    pub fn add_images_ref(&self, refs: impl IntoIterator<Item = ImageLocation>) {
        self.images_ref.lock().unwrap().extend(refs);
    }

    /// Looks up a previously registered reference by digest string.
    #[must_use]
    pub fn image_ref(&self, digest: &str) -> Option<ImageLocation> {
        self.images_ref.lock().unwrap().iter().find(|r| r.image.contains(digest)).cloned()
    }

    /// All registered references, in registration order.
    #[must_use]
    pub fn images_ref(&self) -> Vec<ImageLocation> {
        self.images_ref.lock().unwrap().clone()
    }

    /// Extracts and parses the embedded `ImagesLock` from the bundle's
    /// single content layer.
    ///
    /// Fails with [`Error::FormatError`]-class errors (via
    /// [`Error::Format`]) if the bundle has no layer, more than one layer,
    /// or the layer lacks `.imgpkg/images.yml` (§3 invariant on Bundle).
    pub async fn images_lock(&self) -> Result<ImagesLock> {
        let fetched = self.image.fetch().await?;
        let [layer] = fetched.layers.as_slice() else {
            return Err(Error::Format(format!(
                "bundle {} must have exactly one content layer, found {}",
                self.reference(),
                fetched.layers.len()
            )));
        };
        let repository = self.reference().repository();
        let layer_bytes = read_layer_bytes(self.gateway.as_ref(), repository, &layer.digest).await?;
        let Some(images_yml) = extract::read_tar_entry(&layer_bytes, IMAGES_LOCK_PATH)? else {
            return Err(Error::Format(format!(
                "bundle {} is missing {IMAGES_LOCK_PATH}",
                self.reference()
            )));
        };
        ImagesLock::read(&images_yml)
    }

    /// Returns the fully expanded lock for this bundle, including every
    /// transitively referenced bundle's own entries, deduplicated by
    /// digest (§4.E). Probes of sibling entries within one `ImagesLock`
    /// are bounded by `concurrency`; descent into nested bundles is
    /// sequential (each recursion needs the previous probe's result).
    pub async fn all_images_lock(&self, concurrency: usize) -> Result<ImagesLock> {
        let own_digest = self.image.digest_ref().await?.as_digest()?.clone();
        let visited: Mutex<HashMap<String, bool>> = Mutex::new(HashMap::new());
        visited.lock().unwrap().insert(own_digest.as_str().to_owned(), true);
        let mut out = Vec::new();
        self.collect_all_images_lock(concurrency, &visited, &mut out).await?;
        Ok(ImagesLock::new(out))
    }

    fn collect_all_images_lock<'a>(
        &'a self,
        concurrency: usize,
        visited: &'a Mutex<HashMap<String, bool>>,
        out: &'a mut Vec<ImageLocation>,
    ) -> futures::future::BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let lock = self.images_lock().await?;

            // Claim a visited-map slot for every not-yet-seen entry before
            // firing any probes, so concurrent sibling probes below never
            // race on the same digest (each distinct digest is claimed by
            // exactly one entry, satisfying invariant 5 exactly rather than
            // by chance).
            let mut claimed = Vec::new();
            for entry in lock.images {
                let reference = Reference::parse(&entry.image)?;
                let digest = reference.as_digest()?.clone();
                let mut v = visited.lock().unwrap();
                if v.contains_key(digest.as_str()) {
                    continue;
                }
                v.insert(digest.as_str().to_owned(), false);
                drop(v);
                claimed.push((entry, reference, digest));
            }

            let probed = stream::iter(claimed)
                .map(|(entry, reference, digest)| {
                    let gateway = self.gateway.clone();
                    async move {
                        let probe = PlainImage::new(reference.clone(), gateway);
                        let is_bundle = probe.is_bundle().await?;
                        Ok::<_, Error>((entry, reference, digest, is_bundle))
                    }
                })
                .buffer_unordered(concurrency.max(1))
                .collect::<Vec<_>>()
                .await;

            for item in probed {
                let (entry, reference, digest, is_bundle) = item?;
                visited.lock().unwrap().insert(digest.as_str().to_owned(), is_bundle);
                out.push(entry);
                if is_bundle {
                    let nested = Bundle::new(reference, self.gateway.clone());
                    nested.collect_all_images_lock(concurrency, visited, out).await?;
                }
            }
            Ok(())
        })
    }

    /// Materializes this bundle under `output_path`.
    ///
    /// The root bundle extracts directly into `output_path`; if
    /// `pull_nested_bundles` is `true`, every bundle transitively
    /// referenced from its `ImagesLock` is also extracted, into
    /// `output_path/.imgpkg/bundles/sha256-<hex>/` keyed by its own
    /// digest — mirroring the Go original's `Pull(outputPath, ui,
    /// pullNestedBundles)`. When `false`, only the root bundle's own
    /// content is written. After extraction, the embedded `ImagesLock` is
    /// localized against this bundle's own repository and rewritten to
    /// disk only if localization fully succeeds.
    pub async fn pull(&self, output_path: &Path, pull_nested_bundles: bool, sink: &dyn Sink) -> Result<PullResult> {
        if !self.is_bundle().await? {
            return Err(Error::NotABundle(self.reference().to_string()));
        }
        let visited: Mutex<HashMap<String, bool>> = Mutex::new(HashMap::new());
        let own_digest = self.image.digest_ref().await?.as_digest()?.clone();
        visited.lock().unwrap().insert(own_digest.as_str().to_owned(), true);
        let mut header_printed = false;
        let mut result = PullResult::default();
        self.pull_into(output_path, pull_nested_bundles, &visited, sink, &mut header_printed, &mut result)
            .await?;
        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    fn pull_into<'a>(
        &'a self,
        output_path: &'a Path,
        pull_nested_bundles: bool,
        visited: &'a Mutex<HashMap<String, bool>>,
        sink: &'a dyn Sink,
        header_printed: &'a mut bool,
        result: &'a mut PullResult,
    ) -> futures::future::BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let fetched = self.image.fetch().await?;
            let [layer] = fetched.layers.as_slice() else {
                return Err(Error::Format(format!(
                    "bundle {} must have exactly one content layer, found {}",
                    self.reference(),
                    fetched.layers.len()
                )));
            };
            let repository = self.reference().repository();
            let layer_bytes = read_layer_bytes(self.gateway.as_ref(), repository, &layer.digest).await?;
            extract::extract_layer(&layer_bytes, output_path)?;

            let lock_path = output_path.join(IMAGES_LOCK_PATH);
            let on_disk = tokio::fs::read(&lock_path).await?;
            let lock = ImagesLock::read(&on_disk)?;
            let own_digest = self.image.digest_ref().await?.as_digest()?.clone();
            let (rewritten, all_found) = localize::localize_with_hint(
                self.gateway.as_ref(),
                &lock,
                self.reference().registry(),
                repository,
                Some(&own_digest),
            )
            .await?;
            if all_found {
                tokio::fs::write(&lock_path, rewritten.write()?).await?;
            }
            let lock_for_traversal = if all_found { rewritten } else { lock };

            if !pull_nested_bundles {
                return Ok(());
            }

            for entry in lock_for_traversal.images {
                let reference = Reference::parse(&entry.image)?;
                let digest = reference.as_digest()?.clone();
                let already_seen = visited.lock().unwrap().contains_key(digest.as_str());
                if already_seen {
                    continue;
                }
                let probe = PlainImage::new(reference.clone(), self.gateway.clone());
                let is_bundle = probe.is_bundle().await?;
                visited.lock().unwrap().insert(digest.as_str().to_owned(), is_bundle);
                if !is_bundle {
                    continue;
                }
                if !*header_printed {
                    sink.line("\nNested bundles\n");
                    *header_printed = true;
                }
                let nested_path = output_path
                    .join(RESERVED_DIR)
                    .join("bundles")
                    .join(digest.as_dirname());
                let nested = Bundle::new(reference, self.gateway.clone());
                let nested_sink = sink.indented();
                nested
                    .pull_into(&nested_path, pull_nested_bundles, visited, nested_sink.as_ref(), header_printed, result)
                    .await?;
                result.nested_bundles_pulled += 1;
            }
            Ok(())
        })
    }

    /// After a successful copy, publishes a Locations record for this
    /// bundle's destination image, listing every processed image with its
    /// `isBundle` flag (§4.I).
    pub async fn note_copy(&self, processed: &[ProcessedImage], dst_registry: &str) -> Result<()> {
        let own_digest = self.image.digest_ref().await?.as_digest()?.clone();
        let own = processed
            .iter()
            .find(|p| p.digest_ref.as_digest().map(|d| d == &own_digest).unwrap_or(false))
            .ok_or_else(|| {
                Error::Internal(format!(
                    "note_copy: bundle {own_digest} not present among processed images"
                ))
            })?;

        let mut entries = vec![LocationEntry {
            image: own.digest_ref.to_string(),
            is_bundle: true,
        }];
        for p in processed {
            if p.digest_ref == own.digest_ref {
                continue;
            }
            entries.push(LocationEntry {
                image: p.digest_ref.to_string(),
                is_bundle: p.is_bundle,
            });
        }

        locations::push(
            self.gateway.as_ref(),
            dst_registry,
            own.digest_ref.repository(),
            &own_digest,
            entries,
        )
        .await?;
        Ok(())
    }
}

async fn read_layer_bytes(gateway: &dyn RegistryGateway, repository: &str, digest: &Digest) -> Result<Vec<u8>> {
    use tokio::io::AsyncReadExt;
    let mut reader = gateway.get_layer(repository, digest).await?;
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await?;
    Ok(buf)
}

#[allow(dead_code)]
fn sub_bundle_path(output_path: &Path, digest: &Digest) -> PathBuf {
    output_path.join(RESERVED_DIR).join("bundles").join(digest.as_dirname())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::FakeGateway;
    use crate::sink::{NoopSink, TracingSink};
    use std::io::Write;

    fn gzip_tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *data).unwrap();
        }
        let tar_bytes = builder.into_inner().unwrap();
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&tar_bytes).unwrap();
        encoder.finish().unwrap()
    }

    fn seed_bundle(gateway: &FakeGateway, registry: &str, repository: &str, images_yml: &[u8]) -> Digest {
        let layer = gzip_tar(&[(IMAGES_LOCK_PATH, images_yml)]);
        let layer_len = layer.len();
        let layer_digest = gateway.seed_blob(registry, repository, layer);
        let config = br#"{"config":{"Labels":{"dev.carvel.imgpkg.bundle":"yes"}}}"#.to_vec();
        let config_digest = gateway.seed_blob(registry, repository, config);
        let manifest = serde_json::json!({
            "config": {"digest": config_digest.as_str(), "size": 2},
            "layers": [{"digest": layer_digest.as_str(), "size": layer_len, "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip"}],
        });
        let manifest_bytes = serde_json::to_vec(&manifest).unwrap();
        let reference = Reference::parse(&format!("{registry}/{repository}:latest")).unwrap();
        gateway.seed_manifest(&reference, manifest_bytes, "application/vnd.oci.image.manifest.v1+json")
    }

    #[tokio::test]
    async fn images_lock_reads_embedded_entries() {
        let gateway = Arc::new(FakeGateway::new());
        let images_yml = b"apiVersion: imgpkg.carvel.dev/v1alpha1\nkind: ImagesLock\nimages:\n- image: registry.example.com/repo@sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\n";
        let digest = seed_bundle(&gateway, "src.example.com", "bundle", images_yml);
        let reference = Reference::from_parts(
            "src.example.com",
            "bundle",
            crate::reference::Selector::Digest(digest),
        );
        let bundle = Bundle::new(reference, gateway);
        let lock = bundle.images_lock().await.unwrap();
        assert_eq!(lock.images.len(), 1);
    }

    #[tokio::test]
    async fn diamond_dependency_visits_shared_image_once() {
        // Digests are content hashes, so two bundles cannot each embed the
        // other's real digest (that would require each to exist before the
        // other). The realistic shape invariant 5 guards against is a
        // diamond: root A depends on bundles B and C, which both depend on
        // the same plain image D — D must be traversed exactly once.
        let gateway = Arc::new(FakeGateway::new());

        let d_config = br#"{"config":{}}"#.to_vec();
        let d_config_digest = gateway.seed_blob("src.example.com", "d", d_config);
        let d_manifest = serde_json::json!({
            "config": {"digest": d_config_digest.as_str(), "size": 2},
            "layers": [],
        });
        let d_reference = Reference::parse("src.example.com/d:latest").unwrap();
        let d_digest = gateway.seed_manifest(
            &d_reference,
            serde_json::to_vec(&d_manifest).unwrap(),
            "application/vnd.oci.image.manifest.v1+json",
        );

        let leaf_images_yml = format!(
            "apiVersion: imgpkg.carvel.dev/v1alpha1\nkind: ImagesLock\nimages:\n- image: src.example.com/d@{d_digest}\n"
        );
        let b_digest = seed_bundle(&gateway, "src.example.com", "b", leaf_images_yml.as_bytes());
        let c_digest = seed_bundle(&gateway, "src.example.com", "c", leaf_images_yml.as_bytes());

        let a_images_yml = format!(
            "apiVersion: imgpkg.carvel.dev/v1alpha1\nkind: ImagesLock\nimages:\n- image: src.example.com/b@{b_digest}\n- image: src.example.com/c@{c_digest}\n"
        );
        let a_digest = seed_bundle(&gateway, "src.example.com", "a", a_images_yml.as_bytes());

        let a_reference = Reference::from_parts("src.example.com", "a", crate::reference::Selector::Digest(a_digest));
        let bundle = Bundle::new(a_reference, gateway);
        let all = bundle.all_images_lock(4).await.unwrap();

        let digests: Vec<&str> = all.images.iter().map(|e| e.image.as_str()).collect();
        assert_eq!(
            digests.iter().filter(|d| d.contains(d_digest.as_str())).count(),
            1,
            "D must appear exactly once despite being reachable via both B and C: {digests:?}"
        );
        assert_eq!(all.images.len(), 3, "B, C, and D once each, despite D being reachable via both B and C");
    }

    #[tokio::test]
    async fn pull_extracts_root_bundle_to_output_path() {
        let gateway = Arc::new(FakeGateway::new());
        let images_yml = b"apiVersion: imgpkg.carvel.dev/v1alpha1\nkind: ImagesLock\nimages: []\n";
        let digest = seed_bundle(&gateway, "src.example.com", "bundle", images_yml);
        let reference = Reference::from_parts(
            "src.example.com",
            "bundle",
            crate::reference::Selector::Digest(digest),
        );
        let bundle = Bundle::new(reference, gateway);
        let dir = tempfile::tempdir().unwrap();
        let result = bundle.pull(dir.path(), true, &NoopSink).await.unwrap();
        assert_eq!(result.nested_bundles_pulled, 0);
        assert!(dir.path().join(IMAGES_LOCK_PATH).exists());
    }

    #[tokio::test]
    async fn pull_with_nested_disabled_skips_nested_bundle() {
        let gateway = Arc::new(FakeGateway::new());
        let leaf_images_yml = b"apiVersion: imgpkg.carvel.dev/v1alpha1\nkind: ImagesLock\nimages: []\n";
        let leaf_digest = seed_bundle(&gateway, "src.example.com", "leaf", leaf_images_yml);
        let root_images_yml = format!(
            "apiVersion: imgpkg.carvel.dev/v1alpha1\nkind: ImagesLock\nimages:\n- image: src.example.com/leaf@{leaf_digest}\n"
        );
        let root_digest = seed_bundle(&gateway, "src.example.com", "root", root_images_yml.as_bytes());
        let reference = Reference::from_parts(
            "src.example.com",
            "root",
            crate::reference::Selector::Digest(root_digest),
        );
        let bundle = Bundle::new(reference, gateway);
        let dir = tempfile::tempdir().unwrap();
        let result = bundle.pull(dir.path(), false, &NoopSink).await.unwrap();
        assert_eq!(result.nested_bundles_pulled, 0);
        assert!(dir.path().join(IMAGES_LOCK_PATH).exists());
        assert!(!dir.path().join(RESERVED_DIR).join("bundles").exists());
    }

    #[test]
    fn tracing_sink_indents_without_panicking() {
        let sink = TracingSink::new(crate::sink::Level::Warn);
        let _ = sink.indented();
    }
}
