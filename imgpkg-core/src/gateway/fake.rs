//! In-memory [`RegistryGateway`] used by the core's own test suite and
//! available to downstream consumers that want to unit test code built on
//! `imgpkg-core` without a real registry.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use sha2::{Digest as _, Sha256};
use tokio::io::AsyncRead;

use super::{ManifestBytes, RegistryGateway};
use crate::error::{Error, Result};
use crate::reference::{Digest, Reference, Selector};

#[derive(Default)]
struct Repo {
    manifests_by_tag: HashMap<String, Digest>,
    manifests_by_digest: HashMap<String, ManifestBytes>,
    blobs: HashMap<String, Vec<u8>>,
}

/// An in-memory registry: repositories keyed by `registry/repository`,
/// each holding tag -> digest and digest -> content maps.
#[derive(Default)]
pub struct FakeGateway {
    repos: Mutex<HashMap<String, Repo>>,
}

impl FakeGateway {
    /// Creates an empty fake registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn key(registry: &str, repository: &str) -> String {
        format!("{registry}/{repository}")
    }

    /// Test helper: seed a manifest directly, as if it had been pushed.
    pub fn seed_manifest(&self, reference: &Reference, bytes: Vec<u8>, media_type: &str) -> Digest {
        let digest = content_digest(&bytes);
        let key = Self::key(reference.registry(), reference.repository());
        let mut repos = self.repos.lock().unwrap();
        let repo = repos.entry(key).or_default();
        repo.manifests_by_digest.insert(
            digest.as_str().to_owned(),
            ManifestBytes {
                bytes,
                media_type: media_type.to_owned(),
                digest: digest.clone(),
            },
        );
        if let Some(tag) = reference.tag() {
            repo.manifests_by_tag.insert(tag.to_owned(), digest.clone());
        }
        digest
    }

    /// Test helper: seed a blob directly.
    pub fn seed_blob(&self, registry: &str, repository: &str, data: Vec<u8>) -> Digest {
        let digest = content_digest(&data);
        let key = Self::key(registry, repository);
        let mut repos = self.repos.lock().unwrap();
        repos
            .entry(key)
            .or_default()
            .blobs
            .insert(digest.as_str().to_owned(), data);
        digest
    }

    /// `true` if the given digest exists as a manifest anywhere in
    /// `registry/repository`.
    #[must_use]
    pub fn has_manifest(&self, registry: &str, repository: &str, digest: &Digest) -> bool {
        let key = Self::key(registry, repository);
        self.repos
            .lock()
            .unwrap()
            .get(&key)
            .is_some_and(|r| r.manifests_by_digest.contains_key(digest.as_str()))
    }
}

fn content_digest(data: &[u8]) -> Digest {
    let hex = hex::encode(Sha256::digest(data));
    Digest::parse(&format!("sha256:{hex}")).expect("sha256 hex digest is always well-formed")
}

mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[async_trait]
impl RegistryGateway for FakeGateway {
    async fn get_manifest(&self, reference: &Reference) -> Result<ManifestBytes> {
        let key = Self::key(reference.registry(), reference.repository());
        let repos = self.repos.lock().unwrap();
        let repo = repos
            .get(&key)
            .ok_or_else(|| Error::RegistryPermanent(format!("no such repository: {key}")))?;
        let digest = match reference.selector() {
            Selector::Digest(d) => d.clone(),
            Selector::Tag(t) => repo
                .manifests_by_tag
                .get(t)
                .cloned()
                .ok_or_else(|| Error::RegistryPermanent(format!("tag not found: {t}")))?,
        };
        repo.manifests_by_digest
            .get(digest.as_str())
            .cloned()
            .ok_or_else(|| Error::RegistryPermanent(format!("manifest not found: {digest}")))
    }

    async fn get_config(&self, repository: &str, digest: &Digest) -> Result<Vec<u8>> {
        for (key, repo) in self.repos.lock().unwrap().iter() {
            if key.ends_with(repository) {
                if let Some(b) = repo.blobs.get(digest.as_str()) {
                    return Ok(b.clone());
                }
            }
        }
        Err(Error::RegistryPermanent(format!("blob not found: {digest}")))
    }

    async fn get_layer(&self, repository: &str, digest: &Digest) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        let data = self.get_config(repository, digest).await?;
        Ok(Box::new(std::io::Cursor::new(data)))
    }

    async fn head_manifest(&self, reference: &Reference) -> Result<Option<Digest>> {
        match self.get_manifest(reference).await {
            Ok(m) => Ok(Some(m.digest)),
            Err(Error::RegistryPermanent(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn put_manifest(&self, reference: &Reference, bytes: &[u8], media_type: &str) -> Result<Digest> {
        Ok(self.seed_manifest(reference, bytes.to_vec(), media_type))
    }

    async fn put_blob(
        &self,
        repository: &str,
        digest: &Digest,
        _size: u64,
        mut reader: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Result<()> {
        use tokio::io::AsyncReadExt;
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await?;
        let computed = content_digest(&data);
        if &computed != digest {
            return Err(Error::DigestMismatch {
                reference: repository.to_owned(),
                expected: digest.as_str().to_owned(),
                actual: computed.as_str().to_owned(),
            });
        }
        let key = format!("{repository}"); // registry-agnostic lookup key for test convenience
        let mut repos = self.repos.lock().unwrap();
        // Blobs are addressed by repository suffix in this fake; find or
        // create an entry under any registry using this repository path.
        let existing_key = repos.keys().find(|k| k.ends_with(repository)).cloned();
        let entry = repos.entry(existing_key.unwrap_or(key)).or_default();
        entry.blobs.insert(digest.as_str().to_owned(), data);
        Ok(())
    }

    async fn mount_blob(&self, src_repository: &str, dst_repository: &str, digest: &Digest) -> Result<bool> {
        let src = self.get_config(src_repository, digest).await?;
        let key = self
            .repos
            .lock()
            .unwrap()
            .keys()
            .find(|k| k.ends_with(dst_repository))
            .cloned();
        let mut repos = self.repos.lock().unwrap();
        let entry = repos.entry(key.unwrap_or_else(|| dst_repository.to_owned())).or_default();
        entry.blobs.insert(digest.as_str().to_owned(), src);
        Ok(true)
    }

    async fn tag(&self, reference: &Reference, tag: &str) -> Result<()> {
        let digest = reference.as_digest()?.clone();
        let key = Self::key(reference.registry(), reference.repository());
        self.repos
            .lock()
            .unwrap()
            .entry(key)
            .or_default()
            .manifests_by_tag
            .insert(tag.to_owned(), digest);
        Ok(())
    }

    async fn list_tags(&self, registry: &str, repository: &str) -> Result<Vec<String>> {
        let key = Self::key(registry, repository);
        Ok(self
            .repos
            .lock()
            .unwrap()
            .get(&key)
            .map(|r| r.manifests_by_tag.keys().cloned().collect())
            .unwrap_or_default())
    }
}
