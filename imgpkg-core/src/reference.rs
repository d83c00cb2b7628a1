//! Registry reference parsing and repository-relative rewriting.
//!
//! A [`Reference`] is a value type: parse once, then derive new references
//! from it (`with_repository`, `as_digest`) rather than reassembling strings
//! by hand.

use std::fmt;

use crate::error::{Error, Result};

const DEFAULT_REGISTRY: &str = "docker.io";
const DEFAULT_REGISTRY_API_HOST: &str = "registry-1.docker.io";
const DEFAULT_TAG: &str = "latest";
const OFFICIAL_REPO_PREFIX: &str = "library";

/// A canonical textual identifier of an image: registry host, repository
/// path, and a selector that is either a mutable tag or an immutable
/// digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    registry: String,
    repository: String,
    selector: Selector,
}

/// The tag-or-digest portion of a [`Reference`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Selector {
    /// A mutable tag, e.g. `latest`.
    Tag(String),
    /// An immutable `sha256:<64 hex>` digest.
    Digest(Digest),
}

/// A `sha256:<64 lowercase hex>` content digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest(String);

impl Digest {
    /// Parses and validates a digest string.
    pub fn parse(s: &str) -> Result<Self> {
        let Some(hex) = s.strip_prefix("sha256:") else {
            return Err(Error::InvalidReference(
                s.to_owned(),
                "digest must use the sha256 algorithm".into(),
            ));
        };
        if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::InvalidReference(
                s.to_owned(),
                "digest must be 64 hex characters".into(),
            ));
        }
        Ok(Self(format!("sha256:{}", hex.to_ascii_lowercase())))
    }

    /// The full `sha256:<hex>` string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The hex portion with `:` elided, suitable for filesystem-safe
    /// directory names (e.g. pull layout, blob paths).
    #[must_use]
    pub fn hex(&self) -> &str {
        self.0.strip_prefix("sha256:").unwrap_or(&self.0)
    }

    /// Filesystem-safe form with `:` replaced by `-`, e.g. `sha256-<hex>`.
    #[must_use]
    pub fn as_dirname(&self) -> String {
        self.0.replace(':', "-")
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Reference {
    /// Parses a Docker-style image reference string.
    ///
    /// `ubuntu` -> `docker.io/library/ubuntu:latest`,
    /// `ghcr.io/org/app@sha256:...` -> digested reference at `ghcr.io`.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidReference(
                input.to_owned(),
                "empty reference".into(),
            ));
        }

        let (name, raw_selector) = if let Some((n, digest)) = trimmed.split_once('@') {
            (n, Some(Digest::parse(digest)?))
        } else {
            (trimmed, None)
        };

        let (registry, repo_with_tag) = match name.split_once('/') {
            Some((first, rest)) if looks_like_registry(first) => (first.to_owned(), rest.to_owned()),
            _ => {
                let repo = if name.contains('/') {
                    name.to_owned()
                } else {
                    format!("{OFFICIAL_REPO_PREFIX}/{name}")
                };
                (DEFAULT_REGISTRY.to_owned(), repo)
            }
        };

        let (repository, selector) = match raw_selector {
            Some(digest) => (repo_with_tag, Selector::Digest(digest)),
            None => match repo_with_tag.rsplit_once(':') {
                Some((repo, tag)) => (repo.to_owned(), Selector::Tag(tag.to_owned())),
                None => (repo_with_tag, Selector::Tag(DEFAULT_TAG.to_owned())),
            },
        };

        Ok(Self {
            registry: normalize_registry(&registry),
            repository: normalize_repository(&registry, &repository),
            selector,
        })
    }

    /// Builds a reference directly from already-known parts (used by
    /// components that construct references programmatically, e.g. the
    /// localizer and the planner).
    #[must_use]
    pub fn from_parts(registry: impl Into<String>, repository: impl Into<String>, selector: Selector) -> Self {
        let registry = registry.into();
        let repository = repository.into();
        Self {
            repository: normalize_repository(&registry, &repository),
            registry: normalize_registry(&registry),
            selector,
        }
    }

    /// The registry host.
    #[must_use]
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// The repository path within the registry.
    #[must_use]
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// The tag-or-digest selector.
    #[must_use]
    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    /// `true` if this reference carries a digest selector.
    #[must_use]
    pub fn is_digested(&self) -> bool {
        matches!(self.selector, Selector::Digest(_))
    }

    /// Projects this reference to its digest, failing if it carries a tag.
    ///
    /// Every reference that reaches the copy transport must satisfy this
    /// (invariant 2 of the design).
    pub fn as_digest(&self) -> Result<&Digest> {
        match &self.selector {
            Selector::Digest(d) => Ok(d),
            Selector::Tag(t) => Err(Error::Internal(format!(
                "reference {self} carries a tag ({t}) where a digest was required"
            ))),
        }
    }

    /// Returns the tag, if any.
    #[must_use]
    pub fn tag(&self) -> Option<&str> {
        match &self.selector {
            Selector::Tag(t) => Some(t),
            Selector::Digest(_) => None,
        }
    }

    /// Returns a copy of this reference with a different repository,
    /// preserving registry and selector. Repository is taken verbatim
    /// (already normalized by the caller's home repo).
    #[must_use]
    pub fn with_repository(&self, new_repository: &str) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: new_repository.to_owned(),
            selector: self.selector.clone(),
        }
    }

    /// Returns a copy of this reference with a different selector.
    #[must_use]
    pub fn with_selector(&self, selector: Selector) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            selector,
        }
    }

    /// The registry's OCI distribution API host (handles Docker Hub's
    /// historical `registry-1.docker.io` split from its user-facing
    /// `docker.io` hostname).
    #[must_use]
    pub fn api_host(&self) -> &str {
        if self.registry == DEFAULT_REGISTRY {
            DEFAULT_REGISTRY_API_HOST
        } else {
            &self.registry
        }
    }
}

/// Repository equality is exact string match after normalization; this is
/// the comparison the localizer uses to decide "home repo".
impl Reference {
    /// `true` if `self` and `other` name the same registry + repository,
    /// irrespective of selector.
    #[must_use]
    pub fn same_repository(&self, other: &Reference) -> bool {
        self.registry == other.registry && self.repository == other.repository
    }
}

fn looks_like_registry(s: &str) -> bool {
    s.contains('.') || s.contains(':') || s == "localhost"
}

fn normalize_registry(registry: &str) -> String {
    let lower = registry.to_ascii_lowercase();
    // Default-port elision for the well-known default registry host.
    lower
        .strip_suffix(":443")
        .map(str::to_owned)
        .unwrap_or(lower)
}

/// `library/` handling is specific to the default registry host: a
/// single-segment repository under `docker.io` implies the official
/// `library/` namespace, but other registries never get that prefix
/// injected (it is only added by [`Reference::parse`] when `docker.io` was
/// inferred, never retroactively here).
fn normalize_repository(registry_as_parsed: &str, repository: &str) -> String {
    let _ = registry_as_parsed;
    repository.to_owned()
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        match &self.selector {
            Selector::Tag(t) => write!(f, ":{t}"),
            Selector::Digest(d) => write!(f, "@{d}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple() {
        let r = Reference::parse("ubuntu").unwrap();
        assert_eq!(r.registry(), "docker.io");
        assert_eq!(r.repository(), "library/ubuntu");
        assert_eq!(r.tag(), Some("latest"));
    }

    #[test]
    fn parse_with_tag() {
        let r = Reference::parse("ubuntu:22.04").unwrap();
        assert_eq!(r.repository(), "library/ubuntu");
        assert_eq!(r.tag(), Some("22.04"));
    }

    #[test]
    fn parse_custom_registry() {
        let r = Reference::parse("ghcr.io/org/app:latest").unwrap();
        assert_eq!(r.registry(), "ghcr.io");
        assert_eq!(r.repository(), "org/app");
    }

    #[test]
    fn parse_localhost_port() {
        let r = Reference::parse("localhost:5000/test:v1").unwrap();
        assert_eq!(r.registry(), "localhost:5000");
        assert_eq!(r.repository(), "test");
    }

    #[test]
    fn parse_digest() {
        let digest = "sha256:".to_owned() + &"a".repeat(64);
        let r = Reference::parse(&format!("ghcr.io/org/app@{digest}")).unwrap();
        assert!(r.is_digested());
        assert_eq!(r.as_digest().unwrap().as_str(), digest);
    }

    #[test]
    fn rejects_short_digest() {
        assert!(Reference::parse("ghcr.io/org/app@sha256:abc123").is_err());
    }

    #[test]
    fn as_digest_rejects_tag() {
        let r = Reference::parse("ubuntu:latest").unwrap();
        assert!(r.as_digest().is_err());
    }

    #[test]
    fn with_repository_preserves_selector() {
        let digest = "sha256:".to_owned() + &"b".repeat(64);
        let r = Reference::parse(&format!("src.example.com/a/b@{digest}")).unwrap();
        let moved = r.with_repository("dst/repo");
        assert_eq!(moved.repository(), "dst/repo");
        assert_eq!(moved.registry(), "src.example.com");
        assert_eq!(moved.as_digest().unwrap().as_str(), digest);
    }

    #[test]
    fn registry_host_case_and_port_normalization() {
        let r = Reference::parse("Example.COM:443/foo/bar:v1").unwrap();
        assert_eq!(r.registry(), "example.com");
    }

    #[test]
    fn display_roundtrip() {
        let r = Reference::parse("ghcr.io/org/app:v2").unwrap();
        assert_eq!(r.to_string(), "ghcr.io/org/app:v2");
    }

    #[test]
    fn same_repository_ignores_selector() {
        let a = Reference::parse("ghcr.io/org/app:v1").unwrap();
        let digest = "sha256:".to_owned() + &"c".repeat(64);
        let b = Reference::parse(&format!("ghcr.io/org/app@{digest}")).unwrap();
        assert!(a.same_repository(&b));
    }
}
