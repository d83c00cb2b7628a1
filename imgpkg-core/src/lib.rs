//! Content-addressed image bundle engine: copies, relocates, and
//! materializes OCI bundles between registries and local tar archives,
//! rewriting internal references so a bundle's images always resolve
//! within its new home repository.
//!
//! The public surface is the nine components of the design, in dependency
//! order: [`reference`] and [`error`] underpin everything; [`gateway`] is
//! the one pluggable I/O seam; [`image`] and [`bundle`] model the domain;
//! [`lock`] is the on-disk/on-registry document format; [`localize`],
//! [`plan`], and [`copy`] make up the copy pipeline; [`locations`] writes
//! the side-record that accelerates repeat copies.

pub mod bundle;
pub mod copy;
pub mod error;
mod extract;
pub mod gateway;
pub mod image;
pub mod lock;
pub mod localize;
pub mod locations;
pub mod model;
pub mod plan;
pub mod reference;
pub mod sink;

pub use bundle::{Bundle, PullResult};
pub use copy::{export, relocate, CopyConfig, TarLayerEntry, TarManifestEntry};
pub use error::{Error, Result};
pub use gateway::{FakeGateway, ManifestBytes, OciDistributionGateway, RegistryGateway};
pub use image::{FetchedImage, LayerDescriptor, PlainImage};
pub use lock::{BundleLock, BundlePointer, ImageLocation, ImagesLock, LocationEntry, Locations, LockDocument};
pub use model::{ImageSet, ProcessedImage, UnprocessedImageRef};
pub use plan::{expand, RootInput};
pub use reference::{Digest, Reference, Selector};
pub use sink::{Level, NoopSink, Sink, TracingSink};
