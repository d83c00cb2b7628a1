//! Images-lock localizer (component F): rewrites image references to a
//! bundle's home repository when every referenced digest is verifiably
//! present there, honoring the all-or-nothing contract of §4.F.

use std::collections::HashSet;

use crate::error::Result;
use crate::gateway::RegistryGateway;
use crate::lock::ImageLocation;
use crate::lock::ImagesLock;
use crate::locations;
use crate::reference::{Digest, Reference, Selector};

/// Rewrites every entry of `lock` to point at `registry/home_repo`,
/// returning `(rewrittenLock, allFound)`.
///
/// `allFound` is `true` iff every entry's digest was confirmed present at
/// the home repo; on `false`, the returned lock is `lock` unchanged — this
/// function never returns a partially rewritten lock.
pub async fn localize(
    gateway: &dyn RegistryGateway,
    lock: &ImagesLock,
    registry: &str,
    home_repo: &str,
) -> Result<(ImagesLock, bool)> {
    localize_with_hint(gateway, lock, registry, home_repo, None).await
}

/// As [`localize`], but first consults a Locations side-record for
/// `bundle_digest` at the home repo. A hit covering every entry in `lock`
/// short-circuits the per-image HEAD calls with the single manifest fetch
/// already spent resolving the Locations record (§4.F).
pub async fn localize_with_hint(
    gateway: &dyn RegistryGateway,
    lock: &ImagesLock,
    registry: &str,
    home_repo: &str,
    bundle_digest: Option<&Digest>,
) -> Result<(ImagesLock, bool)> {
    if let Some(bundle_digest) = bundle_digest {
        if let Some(locations) = locations::fetch(gateway, registry, home_repo, bundle_digest).await? {
            let known: HashSet<String> = locations
                .images
                .iter()
                .filter_map(|e| digest_of(&e.image).ok())
                .map(|d| d.as_str().to_owned())
                .collect();
            let all_found = lock
                .images
                .iter()
                .all(|e| digest_of(&e.image).is_ok_and(|d| known.contains(d.as_str())));
            if all_found {
                return rewrite_all(lock, registry, home_repo).map(|rewritten| (rewritten, true));
            }
        }
    }

    let mut rewritten_entries = Vec::with_capacity(lock.images.len());
    for entry in &lock.images {
        let digest = digest_of(&entry.image)?;
        let candidate = Reference::from_parts(registry, home_repo, Selector::Digest(digest.clone()));
        match gateway.head_manifest(&candidate).await? {
            Some(found) if found == digest => {
                rewritten_entries.push(ImageLocation {
                    image: candidate.to_string(),
                    annotations: entry.annotations.clone(),
                });
            }
            _ => return Ok((lock.clone(), false)),
        }
    }
    Ok((ImagesLock::new(rewritten_entries), true))
}

fn digest_of(image: &str) -> Result<Digest> {
    Reference::parse(image)?.as_digest().cloned()
}

fn rewrite_all(lock: &ImagesLock, registry: &str, home_repo: &str) -> Result<ImagesLock> {
    let mut entries = Vec::with_capacity(lock.images.len());
    for entry in &lock.images {
        let digest = digest_of(&entry.image)?;
        let candidate = Reference::from_parts(registry, home_repo, Selector::Digest(digest));
        entries.push(ImageLocation {
            image: candidate.to_string(),
            annotations: entry.annotations.clone(),
        });
    }
    Ok(ImagesLock::new(entries))
}
