//! Lock document models: `BundleLock`, `ImagesLock`, `Locations`, plus a
//! canonical serialization shared by all three (§4.D, §6.3).
//!
//! Generic YAML tooling for arbitrary on-disk config is out of scope for
//! this core (an external collaborator's job); these three schemas are
//! the core's own domain objects and their serialization is part of the
//! Lock-documents component, so they get real `serde_yaml` support rather
//! than a hand-rolled parser.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const API_VERSION: &str = "imgpkg.carvel.dev/v1alpha1";

/// One entry in an `ImagesLock` or the rewritten form the localizer
/// produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageLocation {
    /// Digested image reference string.
    pub image: String,
    /// Arbitrary caller-attached annotations, passed through unchanged by
    /// the localizer (only `image` is rewritten).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ImagesLockDoc {
    #[serde(rename = "apiVersion")]
    api_version: String,
    kind: String,
    images: Vec<ImageLocation>,
}

/// In-memory model of an `ImagesLock` document: an ordered list of
/// digested image references plus annotations.
///
/// Order is preserved across read/write round trips (§3 invariant on
/// `ImagesLock`).
#[derive(Debug, Clone)]
pub struct ImagesLock {
    api_version: String,
    kind: String,
    /// Entries in file order.
    pub images: Vec<ImageLocation>,
    original: Option<Vec<u8>>,
}

impl PartialEq for ImagesLock {
    fn eq(&self, other: &Self) -> bool {
        self.api_version == other.api_version && self.kind == other.kind && self.images == other.images
    }
}
impl Eq for ImagesLock {}

impl ImagesLock {
    /// The `kind` discriminator used for dispatch-on-read.
    pub const KIND: &'static str = "ImagesLock";

    /// Builds a fresh lock from entries (no backing bytes, so `write`
    /// always serializes canonically).
    #[must_use]
    pub fn new(images: Vec<ImageLocation>) -> Self {
        Self {
            api_version: API_VERSION.to_owned(),
            kind: Self::KIND.to_owned(),
            images,
            original: None,
        }
    }

    /// Parses an `ImagesLock` document from bytes.
    pub fn read(bytes: &[u8]) -> Result<Self> {
        let doc: ImagesLockDoc = serde_yaml::from_slice(bytes).map_err(|e| Error::LockDocument(e.to_string()))?;
        if doc.kind != Self::KIND {
            return Err(Error::LockDocument(format!(
                "expected kind {}, found {}",
                Self::KIND,
                doc.kind
            )));
        }
        Ok(Self {
            api_version: doc.api_version,
            kind: doc.kind,
            images: doc.images,
            original: Some(bytes.to_vec()),
        })
    }

    /// Serializes canonically (stable key order: `apiVersion`, `kind`,
    /// `images`).
    ///
    /// If this lock was produced by [`ImagesLock::read`] and has not been
    /// edited since, the original bytes are returned verbatim — this is
    /// what lets unknown keys survive an unchanged round trip while still
    /// being dropped on any real edit (§4.D).
    pub fn write(&self) -> Result<Vec<u8>> {
        if let Some(original) = &self.original {
            if let Ok(reparsed) = Self::read(original) {
                if &reparsed == self {
                    return Ok(original.clone());
                }
            }
        }
        let doc = ImagesLockDoc {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            images: self.images.clone(),
        };
        serde_yaml::to_string(&doc)
            .map(String::into_bytes)
            .map_err(|e| Error::LockDocument(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BundleLockDoc {
    #[serde(rename = "apiVersion")]
    api_version: String,
    kind: String,
    bundle: BundlePointer,
}

/// The `bundle` pointer record inside a `BundleLock` document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundlePointer {
    /// Digested bundle image reference.
    pub image: String,
    /// Tag the bundle was originally pulled under, reapplied on copy.
    pub tag: String,
}

/// In-memory model of a `BundleLock` document: a pointer to a single
/// bundle image plus its tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleLock {
    api_version: String,
    kind: String,
    /// The pointed-to bundle.
    pub bundle: BundlePointer,
}

impl BundleLock {
    /// The `kind` discriminator used for dispatch-on-read.
    pub const KIND: &'static str = "BundleLock";

    /// Builds a fresh `BundleLock`.
    #[must_use]
    pub fn new(bundle: BundlePointer) -> Self {
        Self {
            api_version: API_VERSION.to_owned(),
            kind: Self::KIND.to_owned(),
            bundle,
        }
    }

    /// Parses a `BundleLock` document from bytes.
    pub fn read(bytes: &[u8]) -> Result<Self> {
        let doc: BundleLockDoc = serde_yaml::from_slice(bytes).map_err(|e| Error::LockDocument(e.to_string()))?;
        if doc.kind != Self::KIND {
            return Err(Error::LockDocument(format!(
                "expected kind {}, found {}",
                Self::KIND,
                doc.kind
            )));
        }
        Ok(Self {
            api_version: doc.api_version,
            kind: doc.kind,
            bundle: doc.bundle,
        })
    }

    /// Serializes canonically.
    pub fn write(&self) -> Result<Vec<u8>> {
        let doc = BundleLockDoc {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            bundle: self.bundle.clone(),
        };
        serde_yaml::to_string(&doc)
            .map(String::into_bytes)
            .map_err(|e| Error::LockDocument(e.to_string()))
    }
}

/// One entry in a `Locations` side-record: an image digest plus whether it
/// is itself a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationEntry {
    /// Digested image reference.
    pub image: String,
    /// `true` if this image is itself a bundle.
    #[serde(rename = "isBundle")]
    pub is_bundle: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LocationsDoc {
    #[serde(rename = "apiVersion")]
    api_version: String,
    kind: String,
    images: Vec<LocationEntry>,
}

/// In-memory model of a `Locations` side-record document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locations {
    api_version: String,
    kind: String,
    /// Entries, one per image in scope of the bundle copy that produced
    /// this record.
    pub images: Vec<LocationEntry>,
}

impl Locations {
    /// The `kind` discriminator used for dispatch-on-read. Note this
    /// differs from the informal "Locations" name: on the wire the kind is
    /// `ImageLocations` (§6.3).
    pub const KIND: &'static str = "ImageLocations";

    /// Builds a fresh `Locations` record.
    #[must_use]
    pub fn new(images: Vec<LocationEntry>) -> Self {
        Self {
            api_version: API_VERSION.to_owned(),
            kind: Self::KIND.to_owned(),
            images,
        }
    }

    /// Parses a `Locations` document from bytes.
    pub fn read(bytes: &[u8]) -> Result<Self> {
        let doc: LocationsDoc = serde_yaml::from_slice(bytes).map_err(|e| Error::LockDocument(e.to_string()))?;
        if doc.kind != Self::KIND {
            return Err(Error::LockDocument(format!(
                "expected kind {}, found {}",
                Self::KIND,
                doc.kind
            )));
        }
        Ok(Self {
            api_version: doc.api_version,
            kind: doc.kind,
            images: doc.images,
        })
    }

    /// Serializes canonically.
    pub fn write(&self) -> Result<Vec<u8>> {
        let doc = LocationsDoc {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            images: self.images.clone(),
        };
        serde_yaml::to_string(&doc)
            .map(String::into_bytes)
            .map_err(|e| Error::LockDocument(e.to_string()))
    }
}

/// A lock document of unknown schema, resolved by dispatching on its
/// `kind` field (§6.3: "unknown kinds error").
#[derive(Debug, Clone)]
pub enum LockDocument {
    /// A `BundleLock`.
    Bundle(BundleLock),
    /// An `ImagesLock`.
    Images(ImagesLock),
}

#[derive(Debug, Deserialize)]
struct KindProbe {
    kind: String,
}

impl LockDocument {
    /// Reads a lock file of unknown kind, erroring on anything other than
    /// `BundleLock` or `ImagesLock` (the two kinds accepted as copy
    /// inputs; `ImageLocations` is never a copy input).
    pub fn read(bytes: &[u8]) -> Result<Self> {
        let probe: KindProbe = serde_yaml::from_slice(bytes).map_err(|e| Error::LockDocument(e.to_string()))?;
        match probe.kind.as_str() {
            BundleLock::KIND => Ok(Self::Bundle(BundleLock::read(bytes)?)),
            ImagesLock::KIND => Ok(Self::Images(ImagesLock::read(bytes)?)),
            other => Err(Error::LockDocument(format!("unknown lock kind: {other}"))),
        }
    }
}
