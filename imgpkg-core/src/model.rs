//! Shared domain types threaded between the planner, transport, bundle, and
//! locations-recorder components: what to copy, and what came of copying it.

use std::collections::HashSet;

use crate::reference::Reference;

/// An image named for copying, before the transport has touched it.
///
/// `tag` is present only on the top-level bundle (or a plain image named
/// directly by tag) so the destination can have it reapplied after the
/// digest-addressed push (§3, §4.G).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnprocessedImageRef {
    /// Digested source reference.
    pub digest_ref: Reference,
    /// Tag to reapply at the destination, if any.
    pub tag: Option<String>,
}

impl UnprocessedImageRef {
    /// Builds a ref with no tag to reapply.
    #[must_use]
    pub fn new(digest_ref: Reference) -> Self {
        Self { digest_ref, tag: None }
    }

    /// Builds a ref that should be retagged at the destination.
    #[must_use]
    pub fn with_tag(digest_ref: Reference, tag: String) -> Self {
        Self {
            digest_ref,
            tag: Some(tag),
        }
    }
}

/// The outcome of copying one [`UnprocessedImageRef`].
///
/// `digest_ref` may differ from `unprocessed_ref.digest_ref` only through
/// manifest-list platform selection, never through content mutation (§3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedImage {
    /// The input this image was copied from.
    pub unprocessed_ref: UnprocessedImageRef,
    /// The digested reference actually pushed at the destination.
    pub digest_ref: Reference,
    /// Whether this image is itself a bundle, for the Locations recorder.
    pub is_bundle: bool,
}

/// A deduplicated set of [`UnprocessedImageRef`], keyed by `digest_ref`.
///
/// Insertion order is irrelevant per §3; iteration order is whatever the
/// backing `Vec` happens to hold, which is insertion order in practice but
/// callers must not depend on it.
#[derive(Debug, Clone, Default)]
pub struct ImageSet {
    refs: Vec<UnprocessedImageRef>,
    seen: HashSet<String>,
}

impl ImageSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `item`, a no-op if its digest is already present.
    ///
    /// When a duplicate carries a `tag` and the existing entry does not,
    /// the tag is adopted onto the existing entry — this lets a bundle
    /// referenced both as a nested image and as the copy root keep its
    /// tag.
    pub fn add(&mut self, item: UnprocessedImageRef) {
        let key = item.digest_ref.to_string();
        if self.seen.insert(key.clone()) {
            self.refs.push(item);
            return;
        }
        if item.tag.is_some() {
            if let Some(existing) = self.refs.iter_mut().find(|r| r.digest_ref.to_string() == key) {
                if existing.tag.is_none() {
                    existing.tag = item.tag;
                }
            }
        }
    }

    /// Number of distinct images.
    #[must_use]
    pub fn len(&self) -> usize {
        self.refs.len()
    }

    /// `true` if no images have been added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    /// Consumes the set, returning its entries.
    #[must_use]
    pub fn into_vec(self) -> Vec<UnprocessedImageRef> {
        self.refs
    }

    /// Borrows the entries.
    #[must_use]
    pub fn as_slice(&self) -> &[UnprocessedImageRef] {
        &self.refs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::Reference;

    fn digest_ref(suffix: char) -> Reference {
        Reference::parse(&format!(
            "example.com/repo@sha256:{}",
            suffix.to_string().repeat(64)
        ))
        .unwrap()
    }

    #[test]
    fn dedups_by_digest() {
        let mut set = ImageSet::new();
        set.add(UnprocessedImageRef::new(digest_ref('a')));
        set.add(UnprocessedImageRef::new(digest_ref('a')));
        set.add(UnprocessedImageRef::new(digest_ref('b')));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn duplicate_tag_is_adopted_onto_existing_entry() {
        let mut set = ImageSet::new();
        set.add(UnprocessedImageRef::new(digest_ref('a')));
        set.add(UnprocessedImageRef::with_tag(digest_ref('a'), "v1".into()));
        assert_eq!(set.as_slice()[0].tag.as_deref(), Some("v1"));
    }
}
