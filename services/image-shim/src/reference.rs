//! Image references and registry domains.

use std::{fmt, str::FromStr};

use oci_distribution::{ParseError, Reference};

/// Domain that unqualified references (`nginx`, `library/nginx`) resolve to.
pub const DEFAULT_DOMAIN: &str = "docker.io";

const OFFICIAL_NAMESPACE: &str = "library";

/// Errors for references that cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReferenceError {
    /// Nothing to parse.
    #[error("image reference is empty")]
    Empty,

    /// The full name is longer than registries accept.
    #[error("repository name in {0:?} is too long")]
    NameTooLong(String),

    /// The repository must be lowercase.
    #[error("repository name in {0:?} must be lowercase")]
    Uppercase(String),

    /// The tag has characters outside `[A-Za-z0-9_.-]` or is too long.
    #[error("invalid tag in {0:?}")]
    InvalidTag(String),

    /// The digest is malformed or uses an unsupported algorithm.
    #[error("invalid digest in {0:?}")]
    InvalidDigest(String),

    /// Anything else the reference grammar rejects: bad registry host,
    /// empty or malformed path components.
    #[error("invalid image reference {reference:?}: {reason}")]
    Invalid {
        /// The input.
        reference: String,
        /// Why it was rejected.
        reason: String,
    },
}

impl ReferenceError {
    fn parse(reference: &str, error: ParseError) -> Self {
        let reference = reference.to_owned();
        match error {
            ParseError::NameEmpty => ReferenceError::Empty,
            ParseError::NameTooLong => ReferenceError::NameTooLong(reference),
            ParseError::NameContainsUppercase => ReferenceError::Uppercase(reference),
            ParseError::TagInvalidFormat => ReferenceError::InvalidTag(reference),
            ParseError::DigestInvalidFormat
            | ParseError::DigestInvalidLength
            | ParseError::DigestUnsupported => ReferenceError::InvalidDigest(reference),
            other => ReferenceError::Invalid {
                reference,
                reason: other.to_string(),
            },
        }
    }
}

/// Collapse the many spellings of a registry into one canonical domain.
///
/// Strips any scheme, path and trailing slash, lowercases the host, and maps
/// every alias of Docker Hub (including the empty string) to
/// [`DEFAULT_DOMAIN`]. Total and idempotent.
pub fn normalize_domain(input: &str) -> String {
    let lowered = input.trim().to_ascii_lowercase();
    let without_scheme = lowered
        .strip_prefix("https://")
        .or_else(|| lowered.strip_prefix("http://"))
        .unwrap_or(&lowered);
    let host = without_scheme.split('/').next().unwrap_or_default();

    match host {
        "" | "library" | "docker" | "docker.io" | "index.docker.io" | "registry-1.docker.io" => {
            DEFAULT_DOMAIN.to_owned()
        }
        _ => host.to_owned(),
    }
}

/// The domain itself, then each parent domain that still has at least two
/// labels: `a.b.example.com`, `b.example.com`, `example.com`.
///
/// Domains with a port or an IPv6 literal only yield themselves.
pub fn domain_candidates(domain: &str) -> impl Iterator<Item = &str> {
    let exact_only = domain.contains(':') || domain.starts_with('[');
    std::iter::successors(Some(domain), move |current| {
        if exact_only {
            return None;
        }
        let (_, parent) = current.split_once('.')?;
        parent.contains('.').then_some(parent)
    })
}

/// True for runtime image IDs (`sha256:<64 hex>` or bare 64 hex characters),
/// which are never rewritten.
pub fn is_image_id(image: &str) -> bool {
    let hex = image.strip_prefix("sha256:").unwrap_or(image);
    hex.len() == 64 && hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// A parsed, fully qualified image reference: `domain/path[:tag][@digest]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    domain: String,
    path: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl ImageReference {
    /// Registry domain, normalized.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Repository path within the registry (`library/nginx`).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Tag, if one was given.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Digest, if one was given.
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// `domain/path`, without tag or digest.
    pub fn repository(&self) -> String {
        format!("{}/{}", self.domain, self.path)
    }

    /// The same image served from another registry.
    pub fn with_domain(&self, domain: &str) -> Self {
        Self {
            domain: normalize_domain(domain),
            ..self.clone()
        }
    }

    /// The reference with its digest dropped, keeping any tag. `None` when
    /// there was no digest to drop.
    pub fn without_digest(&self) -> Option<Self> {
        self.digest.as_ref()?;
        Some(Self {
            digest: None,
            ..self.clone()
        })
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.domain, self.path)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

impl FromStr for ImageReference {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ReferenceError::Empty);
        }

        let parsed = Reference::try_from(s).map_err(|error| ReferenceError::parse(s, error))?;

        let domain = normalize_domain(parsed.registry());
        let mut path = parsed.repository().to_owned();
        if domain == DEFAULT_DOMAIN && !path.contains('/') {
            path = format!("{OFFICIAL_NAMESPACE}/{path}");
        }

        // The parser fills in `latest` for untagged names; keep what was written.
        let tag = parsed
            .tag()
            .filter(|_| has_explicit_tag(s))
            .map(str::to_owned);

        Ok(Self {
            domain,
            path,
            tag,
            digest: parsed.digest().map(str::to_owned),
        })
    }
}

fn has_explicit_tag(reference: &str) -> bool {
    let name = reference.split('@').next().unwrap_or_default();
    name.rsplit('/').next().is_some_and(|last| last.contains(':'))
}

/// True when `domain` is accepted as the registry part of a reference:
/// a host name (or bracketed IPv6 literal) with an optional numeric port.
pub fn is_valid_domain(domain: &str) -> bool {
    if domain.is_empty() {
        return false;
    }
    Reference::try_from(format!("{domain}/{OFFICIAL_NAMESPACE}"))
        .is_ok_and(|parsed| parsed.registry().eq_ignore_ascii_case(domain))
}
