//! Image rewriting with caching and request coalescing.

use std::{fmt, sync::Arc, time::Duration};

use rewritecache::Coalesce;

use crate::{
    cache::{Action, CacheOptions, CacheStats, ImageKey, Rewrite, RewriteCache},
    credentials::{CredentialSnapshot, CredentialStore},
    probe::ManifestProbe,
    resolver::{RegistryResolver, Resolution, Source},
};

struct Inner {
    store: Arc<CredentialStore>,
    cache: Arc<RewriteCache>,
    resolver: RegistryResolver,
}

impl Inner {
    async fn resolve(&self, key: ImageKey, snapshot: &CredentialSnapshot, generation: u64) -> Rewrite {
        let Resolution {
            image,
            matched,
            credential,
            source,
            domain_match,
        } = self.resolver.resolve(&key.image, snapshot, generation).await;

        let rewrite = Rewrite {
            image,
            matched,
            credential,
        };
        log_rewrite(&key, &rewrite, &source, false);

        if self.store.generation() != generation {
            tracing::debug!(image = %key.image, "configuration changed while resolving, result not cached");
            return rewrite;
        }

        if let Some((domain, registry)) = domain_match {
            self.cache.insert_domain(&domain, &registry, generation);
        }
        self.cache.insert_image(key, rewrite.clone(), generation);
        rewrite
    }
}

/// Rewrites image references onto configured registries.
///
/// Results are cached per `(image, action)`, including images no registry
/// serves, until the entry expires or the credential snapshot is replaced.
/// Concurrent calls for the same key under the same snapshot share one
/// resolution; a call that starts after a replacement never joins one that
/// started before it.
///
/// Cloning is cheap and clones share everything.
#[derive(Clone)]
pub struct Rewriter {
    inner: Arc<Inner>,
    inflight: Coalesce<(ImageKey, u64), Rewrite>,
}

impl fmt::Debug for Rewriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rewriter")
            .field("store", &self.inner.store)
            .field("cache", &self.inner.cache)
            .field("resolver", &self.inner.resolver)
            .field("inflight", &self.inflight)
            .finish()
    }
}

impl Rewriter {
    /// A rewriter resolving against `store` with `probe`.
    ///
    /// Subscribes to `store` so that every snapshot replacement flushes the
    /// cache.
    pub fn new(
        store: Arc<CredentialStore>,
        probe: Arc<dyn ManifestProbe>,
        options: CacheOptions,
        probe_timeout: Duration,
    ) -> Self {
        let cache = Arc::new(RewriteCache::new(options));

        let flush = Arc::clone(&cache);
        store.subscribe(move |generation| {
            tracing::debug!(generation, "credentials replaced");
            flush.invalidate();
        });

        let resolver = RegistryResolver::new(probe, Arc::clone(&cache), probe_timeout);
        Self {
            inner: Arc::new(Inner {
                store,
                cache,
                resolver,
            }),
            inflight: Coalesce::new(),
        }
    }

    /// Rewrite `image` for `action`.
    ///
    /// Returns the image unchanged when no configured registry serves it.
    /// Never fails.
    #[tracing::instrument(level = "debug", skip(self, action), fields(action = %action))]
    pub async fn rewrite_image(&self, image: &str, action: Action) -> Rewrite {
        let key = ImageKey::new(image, action);
        if image.is_empty() {
            let rewrite = Rewrite::unchanged(image);
            log_rewrite(&key, &rewrite, &Source::InvalidReference, false);
            return rewrite;
        }

        let (snapshot, generation) = self.inner.store.current();
        if let Some(cached) = self.inner.cache.image(&key, generation) {
            log_rewrite(&key, &cached, &Source::Cache, true);
            return cached;
        }

        let inner = Arc::clone(&self.inner);
        let request = key.clone();
        let pinned = Arc::clone(&snapshot);
        match self
            .inflight
            .get((key.clone(), generation), move || {
                Box::pin(async move { inner.resolve(request, &pinned, generation).await })
            })
            .await
        {
            Ok(rewrite) => rewrite,
            Err(error) => {
                tracing::warn!(image, %error, "shared resolution failed, resolving again");
                self.inner.resolve(key, &snapshot, generation).await
            }
        }
    }

    /// Flush both cache tiers.
    pub fn invalidate(&self) {
        self.inner.cache.invalidate();
    }

    /// Current cache counters.
    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    /// Current cache sizes and lifetimes.
    pub fn cache_options(&self) -> CacheOptions {
        self.inner.cache.options()
    }

    /// Resize the cache or change entry lifetimes.
    pub fn update_cache_options(&self, options: CacheOptions) {
        self.inner.cache.apply(options);
    }

    /// Change the time allowed for each registry probe.
    pub fn set_probe_timeout(&self, timeout: Duration) {
        self.inner.resolver.set_timeout(timeout);
    }

    /// The store rewrites resolve against.
    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.inner.store
    }
}

fn log_rewrite(key: &ImageKey, rewrite: &Rewrite, source: &Source, cache_hit: bool) {
    tracing::info!(
        action = %key.action,
        cache_hit,
        source = %source,
        original = %key.image,
        result = %rewrite.image,
        replaced = rewrite.replaced(&key.image),
        "image rewrite"
    );
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use bytes::Bytes;

    use super::*;
    use crate::{
        credentials::{CredentialSnapshot, RegistryCredential},
        probe::{Candidates, ProbeError, ProbeMatch},
        reference::ImageReference,
    };

    #[derive(Debug, Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ManifestProbe for Counting {
        async fn probe(
            &self,
            image: &ImageReference,
            candidates: &Candidates,
        ) -> Result<ProbeMatch, ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let (domain, credential) = candidates
                .iter()
                .next()
                .ok_or_else(|| ProbeError::not_found(image))?;
            Ok(ProbeMatch {
                domain: domain.clone(),
                image: image.with_domain(domain),
                manifest: Bytes::new(),
                credential: Some(credential.clone()),
            })
        }
    }

    fn mirror() -> CredentialSnapshot {
        CredentialSnapshot::builder()
            .registry("mirror.example.com", RegistryCredential::anonymous("mirror"), 0)
            .build()
    }

    fn rewriter(snapshot: CredentialSnapshot) -> (Arc<Counting>, Rewriter) {
        let probe = Arc::new(Counting::default());
        let rewriter = Rewriter::new(
            Arc::new(CredentialStore::new(snapshot)),
            probe.clone(),
            CacheOptions::default(),
            Duration::from_secs(1),
        );
        (probe, rewriter)
    }

    #[tokio::test]
    async fn second_call_is_cached() {
        let (probe, rewriter) = rewriter(mirror());

        let first = rewriter.rewrite_image("nginx:latest", Action::Pull).await;
        let second = rewriter.rewrite_image("nginx:latest", Action::Pull).await;
        assert_eq!(first, second);
        assert_eq!(first.image, "mirror.example.com/library/nginx:latest");
        assert!(first.replaced("nginx:latest"));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);

        let stats = rewriter.cache_stats();
        assert_eq!(stats.image_hits, 1);
        assert_eq!(stats.image_misses, 1);
    }

    #[tokio::test]
    async fn empty_image_is_untouched() {
        let (probe, rewriter) = rewriter(mirror());
        let rewrite = rewriter.rewrite_image("", Action::Pull).await;
        assert_eq!(rewrite, Rewrite::unchanged(""));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
        assert_eq!(rewriter.cache_stats().image_misses, 0);
    }

    #[tokio::test]
    async fn unmatched_results_are_cached() {
        let (probe, rewriter) = rewriter(CredentialSnapshot::default());
        let first = rewriter.rewrite_image("nginx", Action::Pull).await;
        let second = rewriter.rewrite_image("nginx", Action::Pull).await;
        assert_eq!(first, second);
        assert!(!second.matched);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
        assert_eq!(rewriter.cache_stats().image_misses, 1);
        assert_eq!(rewriter.cache_stats().image_hits, 1);
    }

    #[tokio::test]
    async fn store_updates_flush_cache() {
        let (probe, rewriter) = rewriter(mirror());
        rewriter.rewrite_image("nginx", Action::Pull).await;

        rewriter.credentials().update(Some(mirror()));
        assert_eq!(rewriter.cache_stats().invalidations, 1);

        rewriter.rewrite_image("nginx", Action::Pull).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn probe_timeout_is_adjustable() {
        let (_, rewriter) = rewriter(mirror());
        rewriter.set_probe_timeout(Duration::from_millis(250));
        assert_eq!(rewriter.inner.resolver.timeout(), Duration::from_millis(250));
    }
}
