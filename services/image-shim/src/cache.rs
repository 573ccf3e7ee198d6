//! Two-tier cache of rewrite results.
//!
//! The image tier maps `(image, action)` to a finished rewrite. The domain
//! tier maps an image's registry domain to the configured registry that
//! served it last, so the subdomain walk is not repeated for every image.
//!
//! Entries remember the credential generation they were computed under and
//! are rejected once the store has moved on.

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use chrono::{DateTime, Utc};
use rewritecache::{Lookup, Tier};
use serde::Serialize;

use crate::credentials::{CredentialSnapshot, RegistryCredential};

/// Default number of cached image rewrites.
pub const DEFAULT_IMAGE_CACHE_SIZE: usize = 1024;

/// Default lifetime of a cached image rewrite.
pub const DEFAULT_IMAGE_CACHE_TTL: Duration = Duration::from_secs(30 * 60);

/// Default lifetime of a cached domain match.
pub const DEFAULT_DOMAIN_CACHE_TTL: Duration = Duration::from_secs(10 * 60);

/// The CRI operation a rewrite is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Action {
    /// `PullImage`
    Pull,
    /// `ImageStatus`
    Status,
    /// `RemoveImage`
    Remove,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Pull => write!(f, "PullImage"),
            Action::Status => write!(f, "ImageStatus"),
            Action::Remove => write!(f, "RemoveImage"),
        }
    }
}

/// Key of the image tier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageKey {
    /// Image as the caller named it.
    pub image: String,
    /// Operation the rewrite was for.
    pub action: Action,
}

impl ImageKey {
    /// Key for `image` under `action`.
    pub fn new(image: impl Into<String>, action: Action) -> Self {
        Self {
            image: image.into(),
            action,
        }
    }
}

/// Result of rewriting one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewrite {
    /// Image to hand to the runtime.
    pub image: String,
    /// True when a configured registry serves the image.
    pub matched: bool,
    /// Credential to pull with, if the matched registry needs one.
    pub credential: Option<RegistryCredential>,
}

impl Rewrite {
    /// An image left as it was.
    pub fn unchanged(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            matched: false,
            credential: None,
        }
    }

    /// Whether the image differs from `original`.
    pub fn replaced(&self, original: &str) -> bool {
        self.image != original
    }
}

/// Sizing and lifetime of both tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheOptions {
    /// Image tier capacity. Zero disables both tiers.
    pub image_cache_size: usize,
    /// Image tier entry lifetime.
    pub image_cache_ttl: Duration,
    /// Domain tier entry lifetime.
    pub domain_cache_ttl: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            image_cache_size: DEFAULT_IMAGE_CACHE_SIZE,
            image_cache_ttl: DEFAULT_IMAGE_CACHE_TTL,
            domain_cache_ttl: DEFAULT_DOMAIN_CACHE_TTL,
        }
    }
}

impl CacheOptions {
    /// Replace zero lifetimes with the defaults.
    pub fn normalized(self) -> Self {
        let or_default = |ttl: Duration, default| if ttl.is_zero() { default } else { ttl };
        Self {
            image_cache_size: self.image_cache_size,
            image_cache_ttl: or_default(self.image_cache_ttl, DEFAULT_IMAGE_CACHE_TTL),
            domain_cache_ttl: or_default(self.domain_cache_ttl, DEFAULT_DOMAIN_CACHE_TTL),
        }
    }

    /// Domain tier capacity: a tenth of the image tier, at least one.
    pub fn domain_cache_size(&self) -> usize {
        match self.image_cache_size {
            0 => 0,
            size => (size / 10).max(1),
        }
    }
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Image tier hits.
    pub image_hits: u64,
    /// Image tier misses, including expired and stale entries.
    pub image_misses: u64,
    /// Image tier entries dropped for capacity, age or staleness.
    pub image_evictions: u64,
    /// Domain tier hits.
    pub domain_hits: u64,
    /// Domain tier misses.
    pub domain_misses: u64,
    /// Domain tier evictions.
    pub domain_evictions: u64,
    /// Number of times both tiers were flushed.
    pub invalidations: u64,
    /// When the counters were read.
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Tagged<V> {
    value: V,
    generation: u64,
}

/// Both tiers and the invalidation counter.
pub struct RewriteCache {
    images: Tier<ImageKey, Tagged<Rewrite>>,
    domains: Tier<String, Tagged<String>>,
    invalidations: AtomicU64,
}

impl fmt::Debug for RewriteCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RewriteCache")
            .field("images", &self.images)
            .field("domains", &self.domains)
            .field("invalidations", &self.invalidations.load(Ordering::Relaxed))
            .finish()
    }
}

impl RewriteCache {
    /// Empty tiers sized by `options`.
    pub fn new(options: CacheOptions) -> Self {
        let options = options.normalized();
        Self {
            images: Tier::new("image", options.image_cache_size, options.image_cache_ttl),
            domains: Tier::new("domain", options.domain_cache_size(), options.domain_cache_ttl),
            invalidations: AtomicU64::new(0),
        }
    }

    /// A cached rewrite computed under `generation`.
    pub fn image(&self, key: &ImageKey, generation: u64) -> Option<Rewrite> {
        match self.images.lookup_with(key, |entry| entry.generation == generation) {
            Lookup::Hit(entry) => Some(entry.value),
            Lookup::Rejected(_) => {
                tracing::debug!(image = %key.image, "dropped rewrite from an older configuration");
                None
            }
            Lookup::Miss | Lookup::Expired => None,
        }
    }

    /// Cache a rewrite.
    pub fn insert_image(&self, key: ImageKey, rewrite: Rewrite, generation: u64) {
        self.images.insert(
            key,
            Tagged {
                value: rewrite,
                generation,
            },
        );
    }

    /// The registry that last served images from `domain`, if it is still
    /// configured in `snapshot`.
    pub fn domain(&self, domain: &str, snapshot: &CredentialSnapshot, generation: u64) -> Option<String> {
        let lookup = self.domains.lookup_with(domain, |entry| {
            entry.generation == generation && snapshot.cri_configs().contains_key(&entry.value)
        });
        match lookup {
            Lookup::Hit(entry) => Some(entry.value),
            Lookup::Rejected(entry) => {
                tracing::debug!(domain, registry = %entry.value, "cached registry is no longer configured");
                None
            }
            Lookup::Miss | Lookup::Expired => None,
        }
    }

    /// Remember that `registry` serves images from `domain`.
    pub fn insert_domain(&self, domain: &str, registry: &str, generation: u64) {
        self.domains.insert(
            domain.to_owned(),
            Tagged {
                value: registry.to_owned(),
                generation,
            },
        );
    }

    /// Drop one domain match.
    pub fn forget_domain(&self, domain: &str) {
        if self.domains.remove(domain) {
            tracing::debug!(domain, "cached registry match dropped");
        }
    }

    /// Flush both tiers.
    pub fn invalidate(&self) {
        let images = self.images.clear();
        let domains = self.domains.clear();
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(images, domains, "rewrite cache invalidated");
    }

    /// Apply new sizes and lifetimes.
    ///
    /// Lifetimes apply to existing entries right away. A size change flushes
    /// both tiers and counts as one invalidation.
    pub fn apply(&self, options: CacheOptions) {
        let options = options.normalized();
        self.images.ttl().set(options.image_cache_ttl);
        self.domains.ttl().set(options.domain_cache_ttl);

        if self.images.capacity() != options.image_cache_size {
            let images = self.images.reset(options.image_cache_size);
            let domains = self.domains.reset(options.domain_cache_size());
            self.invalidations.fetch_add(1, Ordering::Relaxed);
            tracing::info!(
                images,
                domains,
                capacity = options.image_cache_size,
                "rewrite cache resized"
            );
        }
    }

    /// Current sizes and lifetimes.
    pub fn options(&self) -> CacheOptions {
        CacheOptions {
            image_cache_size: self.images.capacity(),
            image_cache_ttl: self.images.ttl().get(),
            domain_cache_ttl: self.domains.ttl().get(),
        }
    }

    /// Number of cached image rewrites.
    pub fn len(&self) -> usize {
        self.images.len()
    }

    /// True when no image rewrite is cached.
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Read every counter.
    pub fn stats(&self) -> CacheStats {
        let images = self.images.stats();
        let domains = self.domains.stats();
        CacheStats {
            image_hits: images.hits,
            image_misses: images.misses,
            image_evictions: images.evictions,
            domain_hits: domains.hits,
            domain_misses: domains.misses,
            domain_evictions: domains.evictions,
            invalidations: self.invalidations.load(Ordering::Relaxed),
            generated_at: Utc::now(),
        }
    }
}
