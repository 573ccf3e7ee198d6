//! Finding the configured registry that serves an image.

use std::{fmt, sync::Arc, time::Duration};

use rewritecache::SharedDuration;

use crate::{
    cache::RewriteCache,
    credentials::{CredentialSnapshot, RegistryCredential},
    probe::{Candidates, ManifestProbe, ProbeError, ProbeMatch},
    reference::{domain_candidates, ImageReference},
};

/// Default time allowed for one registry probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// How a resolution was reached. Used as the `source` field of rewrite logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// Served from the image tier.
    Cache,
    /// The image name could not be parsed.
    InvalidReference,
    /// No registry is configured.
    NoRegistries,
    /// The registry already named by the image (or a parent domain) has it.
    Domain(String),
    /// Found by walking registries in priority order.
    Registry(String),
    /// No registry has the image.
    NoMatch,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Cache => write!(f, "cache"),
            Source::InvalidReference => write!(f, "invalid-reference"),
            Source::NoRegistries => write!(f, "no-registries"),
            Source::Domain(domain) => write!(f, "domain:{domain}"),
            Source::Registry(domain) => write!(f, "registry:{domain}"),
            Source::NoMatch => write!(f, "no-match"),
        }
    }
}

/// Outcome of [`RegistryResolver::resolve`].
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Image to use; the input when nothing matched.
    pub image: String,
    /// True when a registry serves the image.
    pub matched: bool,
    /// Credential to pull with. `None` for anonymous or skip-login registries.
    pub credential: Option<RegistryCredential>,
    /// How the answer was found.
    pub source: Source,
    /// `(image domain, registry domain)` worth remembering in the domain tier.
    pub domain_match: Option<(String, String)>,
}

impl Resolution {
    fn unmatched(image: &str, source: Source) -> Self {
        Self {
            image: image.to_owned(),
            matched: false,
            credential: None,
            source,
            domain_match: None,
        }
    }
}

/// Walks configured registries and asks a [`ManifestProbe`] which of them
/// serves an image.
///
/// Order of attempts:
///
/// 1. The registry the image already names, or the closest configured parent
///    domain. A previous match for the domain is reused from the domain tier.
/// 2. Every other registry by descending priority, offline hub first on ties.
/// 3. If the reference carries a digest, steps 1 and 2 again without it.
///
/// Each registry is probed on its own, bounded by the probe timeout. A
/// probe failure only disqualifies that registry.
pub struct RegistryResolver {
    probe: Arc<dyn ManifestProbe>,
    cache: Arc<RewriteCache>,
    timeout: SharedDuration,
}

impl fmt::Debug for RegistryResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryResolver")
            .field("probe", &self.probe)
            .field("timeout", &self.timeout.get())
            .finish_non_exhaustive()
    }
}

impl RegistryResolver {
    /// A resolver using `probe`, reading domain matches from `cache`.
    pub fn new(probe: Arc<dyn ManifestProbe>, cache: Arc<RewriteCache>, timeout: Duration) -> Self {
        Self {
            probe,
            cache,
            timeout: SharedDuration::new(timeout),
        }
    }

    /// Change the per-probe timeout.
    pub fn set_timeout(&self, timeout: Duration) {
        self.timeout.set(timeout);
    }

    /// The per-probe timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout.get()
    }

    /// Resolve `image` against `snapshot`, which was current at `generation`.
    ///
    /// Never fails: anything that goes wrong leaves the image unmatched.
    pub async fn resolve(&self, image: &str, snapshot: &CredentialSnapshot, generation: u64) -> Resolution {
        let reference = match image.parse::<ImageReference>() {
            Ok(reference) => reference,
            Err(error) => {
                tracing::debug!(image, %error, "not a valid image reference");
                return Resolution::unmatched(image, Source::InvalidReference);
            }
        };

        if snapshot.is_empty() {
            return Resolution::unmatched(image, Source::NoRegistries);
        }

        if let Some(resolution) = self.resolve_reference(&reference, snapshot, generation).await {
            return resolution;
        }

        if let Some(undigested) = reference.without_digest() {
            tracing::debug!(image, "retrying without digest");
            if let Some(resolution) = self.resolve_reference(&undigested, snapshot, generation).await {
                return resolution;
            }
        }

        Resolution::unmatched(image, Source::NoMatch)
    }

    async fn resolve_reference(
        &self,
        reference: &ImageReference,
        snapshot: &CredentialSnapshot,
        generation: u64,
    ) -> Option<Resolution> {
        let own = self.matching_registry(reference.domain(), snapshot, generation);

        if let Some((registry, credential)) = &own {
            match self.probe_one(reference, registry, credential).await {
                Ok(found) => {
                    let mut resolution =
                        finish(found, credential, snapshot, Source::Domain(registry.clone()));
                    resolution.domain_match = Some((reference.domain().to_owned(), registry.clone()));
                    return Some(resolution);
                }
                Err(error) => {
                    tracing::debug!(registry = %registry, %error, "domain registry did not serve image");
                    self.cache.forget_domain(reference.domain());
                }
            }
        }

        for entry in snapshot.sorted_registries() {
            if own.as_ref().is_some_and(|(registry, _)| *registry == entry.domain) {
                continue;
            }
            match self.probe_one(reference, &entry.domain, &entry.credential).await {
                Ok(found) => {
                    return Some(finish(
                        found,
                        &entry.credential,
                        snapshot,
                        Source::Registry(entry.domain),
                    ));
                }
                Err(error) => {
                    tracing::debug!(
                        registry = %entry.domain,
                        priority = entry.priority,
                        offline = entry.is_offline,
                        %error,
                        "registry did not serve image"
                    );
                }
            }
        }

        None
    }

    /// The configured mirror for `domain`: a cached match, the exact domain,
    /// or the nearest parent domain.
    fn matching_registry(
        &self,
        domain: &str,
        snapshot: &CredentialSnapshot,
        generation: u64,
    ) -> Option<(String, RegistryCredential)> {
        let mirrors = snapshot.cri_configs();

        if let Some(registry) = self.cache.domain(domain, snapshot, generation) {
            if let Some(credential) = mirrors.get(&registry) {
                return Some((registry, credential.clone()));
            }
        }

        domain_candidates(domain).find_map(|candidate| {
            mirrors
                .get(candidate)
                .map(|credential| (candidate.to_owned(), credential.clone()))
        })
    }

    async fn probe_one(
        &self,
        reference: &ImageReference,
        registry: &str,
        credential: &RegistryCredential,
    ) -> Result<ProbeMatch, ProbeError> {
        let candidates = Candidates::from([(registry.to_owned(), credential.clone())]);
        let timeout = self.timeout.get();
        let result = match tokio::time::timeout(timeout, self.probe.probe(reference, &candidates)).await {
            Ok(result) => result,
            Err(_) => Err(ProbeError::timeout(reference, timeout)),
        };
        if let Err(error) = &result {
            if error.kind().is_retryable() {
                tracing::warn!(registry, %error, "registry unreachable");
            }
        }
        result
    }
}

fn finish(
    found: ProbeMatch,
    candidate: &RegistryCredential,
    snapshot: &CredentialSnapshot,
    source: Source,
) -> Resolution {
    let credential = found
        .credential
        .unwrap_or_else(|| candidate.clone());
    let credential = (!credential.is_empty() && !snapshot.should_skip_login(&found.domain))
        .then_some(credential);

    Resolution {
        image: found.image.to_string(),
        matched: true,
        credential,
        source,
        domain_match: None,
    }
}
