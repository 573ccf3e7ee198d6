//! Checking whether a registry can serve an image.

use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;

use crate::{credentials::RegistryCredential, reference::ImageReference};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Registries to try, keyed by normalized domain.
pub type Candidates = BTreeMap<String, RegistryCredential>;

/// A registry that was found to serve the image.
#[derive(Debug, Clone)]
pub struct ProbeMatch {
    /// Domain of the registry that answered.
    pub domain: String,
    /// The image as that registry names it.
    pub image: ImageReference,
    /// The manifest the registry returned.
    pub manifest: Bytes,
    /// Credential that was accepted, if the registry required one.
    pub credential: Option<RegistryCredential>,
}

/// Why a probe failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeErrorKind {
    /// None of the candidates has the image.
    NotFound,
    /// A candidate refused the credential.
    Unauthorized,
    /// The registry could not be reached.
    Network,
    /// The probe did not finish in time.
    Timeout,
    /// Anything else.
    Other,
}

impl ProbeErrorKind {
    /// Whether trying again later could give a different answer.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProbeErrorKind::Network | ProbeErrorKind::Timeout)
    }
}

impl fmt::Display for ProbeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeErrorKind::NotFound => write!(f, "not found"),
            ProbeErrorKind::Unauthorized => write!(f, "unauthorized"),
            ProbeErrorKind::Network => write!(f, "network error"),
            ProbeErrorKind::Timeout => write!(f, "timed out"),
            ProbeErrorKind::Other => write!(f, "failed"),
        }
    }
}

/// A failed probe.
#[derive(Debug, thiserror::Error)]
#[error("probing {image}: {kind}")]
pub struct ProbeError {
    kind: ProbeErrorKind,
    image: String,
    #[source]
    source: Option<BoxError>,
}

impl ProbeError {
    /// A probe error with an underlying cause.
    pub fn new<E>(kind: ProbeErrorKind, image: impl fmt::Display, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self {
            kind,
            image: image.to_string(),
            source: Some(source.into()),
        }
    }

    /// The image is not in any candidate registry.
    pub fn not_found(image: impl fmt::Display) -> Self {
        Self {
            kind: ProbeErrorKind::NotFound,
            image: image.to_string(),
            source: None,
        }
    }

    /// The probe ran out of time.
    pub fn timeout(image: impl fmt::Display, after: Duration) -> Self {
        Self::new(
            ProbeErrorKind::Timeout,
            image,
            format!("no answer after {after:?}"),
        )
    }

    /// What went wrong.
    pub fn kind(&self) -> ProbeErrorKind {
        self.kind
    }

    /// The image that was probed.
    pub fn image(&self) -> &str {
        &self.image
    }
}

/// Asks registries for an image manifest.
///
/// Implementations try the `candidates` and return the first one that serves
/// `image`, with the image renamed onto that registry. A probe must not
/// mutate shared state beyond its own connection pools.
#[async_trait]
pub trait ManifestProbe: fmt::Debug + Send + Sync {
    /// Find a registry among `candidates` that serves `image`.
    async fn probe(
        &self,
        image: &ImageReference,
        candidates: &Candidates,
    ) -> Result<ProbeMatch, ProbeError>;
}

#[async_trait]
impl<P> ManifestProbe for Arc<P>
where
    P: ManifestProbe + ?Sized,
{
    async fn probe(
        &self,
        image: &ImageReference,
        candidates: &Candidates,
    ) -> Result<ProbeMatch, ProbeError> {
        (**self).probe(image, candidates).await
    }
}
