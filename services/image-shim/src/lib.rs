//! # image-shim
//!
//! An image service that sits between the kubelet and a container runtime
//! and rewrites image references onto configured registries: an offline hub
//! that ships with the cluster, and any number of mirrors.
//!
//! ```text
//! kubelet ──▶ ImageServiceFacade ──▶ runtime ImageService
//!                  │
//!                  ▼
//!              Rewriter ──▶ RewriteCache (image tier, domain tier)
//!                  │
//!                  ▼
//!           RegistryResolver ──▶ ManifestProbe
//!                  │
//!                  ▼
//!           CredentialStore ◀── ConfigWatcher
//! ```
//!
//! The pieces:
//!
//! - [`CredentialStore`] holds an immutable [`CredentialSnapshot`] of every
//!   registry and swaps it atomically on reconfiguration.
//! - [`RegistryResolver`] decides which registry serves an image, asking a
//!   [`ManifestProbe`] implementation one registry at a time.
//! - [`Rewriter`] caches resolutions and shares concurrent lookups.
//! - [`ImageServiceFacade`] applies rewrites and credentials to CRI calls.
//! - [`ConfigWatcher`] reloads [`ShimConfig`] from disk.

mod cache;
mod config;
mod credentials;
pub mod cri;
mod facade;
mod probe;
mod reference;
mod reload;
mod resolver;
mod rewrite;

pub use cache::{
    Action, CacheOptions, CacheStats, ImageKey, Rewrite, RewriteCache, DEFAULT_DOMAIN_CACHE_TTL,
    DEFAULT_IMAGE_CACHE_SIZE, DEFAULT_IMAGE_CACHE_TTL,
};
pub use config::{
    CachePatch, ConfigError, ConfigPatch, RegistryConfig, RegistryPatch, ShimConfig,
    DEFAULT_RELOAD_INTERVAL,
};
pub use credentials::{
    normalize_priority, CredentialSnapshot, CredentialStore, RegistryCredential, RegistryEntry,
    SnapshotBuilder, MAX_PRIORITY, MIN_PRIORITY, OFFLINE_DEFAULT_PRIORITY,
    REGISTRY_DEFAULT_PRIORITY,
};
pub use facade::{FacadeBuilder, ImageServiceFacade};
pub use probe::{Candidates, ManifestProbe, ProbeError, ProbeErrorKind, ProbeMatch};
pub use reference::{
    domain_candidates, is_image_id, is_valid_domain, normalize_domain, ImageReference,
    ReferenceError, DEFAULT_DOMAIN,
};
pub use reload::ConfigWatcher;
pub use resolver::{RegistryResolver, Resolution, Source, DEFAULT_PROBE_TIMEOUT};
pub use rewrite::Rewriter;
pub use secret::{BasicAuth, Secret};
