//! Shim configuration, read from YAML.

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use secret::{BasicAuth, BasicAuthError};
use serde::Deserialize;

use crate::{
    cache::{CacheOptions, DEFAULT_IMAGE_CACHE_SIZE},
    credentials::{CredentialSnapshot, RegistryCredential},
    reference::{is_valid_domain, normalize_domain},
    resolver::DEFAULT_PROBE_TIMEOUT,
};

/// Default interval between configuration file checks.
pub const DEFAULT_RELOAD_INTERVAL: Duration = Duration::from_secs(15);

/// Errors loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("reading {path}")]
    Io {
        /// File that was read.
        path: Utf8PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The document is not valid YAML for this schema.
    #[error("parsing configuration")]
    Yaml(#[from] serde_yaml::Error),

    /// A registry `auth` is not `user:password`.
    #[error("invalid auth for registry {address}")]
    Auth {
        /// Registry the auth belongs to.
        address: String,
        /// Underlying error.
        #[source]
        source: BasicAuthError,
    },

    /// A registry address is not a host name.
    #[error("invalid registry address {0:?}")]
    Address(String),
}

/// One registry entry of a [`ConfigPatch`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryPatch {
    /// Registry address, with or without scheme.
    pub address: String,
    /// `user:password`. Without it the registry is used without logging in.
    #[serde(default)]
    pub auth: Option<String>,
    /// Probe priority; larger is tried first.
    #[serde(default)]
    pub priority: Option<i32>,
}

/// The `cache` section of a [`ConfigPatch`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachePatch {
    /// Image tier capacity. Zero means the default, negative disables caching.
    #[serde(default)]
    pub image_cache_size: Option<i64>,
    /// Image tier entry lifetime.
    #[serde(default, rename = "imageCacheTTL", with = "humantime_serde")]
    pub image_cache_ttl: Option<Duration>,
    /// Domain tier entry lifetime.
    #[serde(default, rename = "domainCacheTTL", with = "humantime_serde")]
    pub domain_cache_ttl: Option<Duration>,
}

/// A configuration document as written. Every field is optional; absent
/// fields leave the current value alone when merged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigPatch {
    /// Offline hub address.
    #[serde(default)]
    pub address: Option<String>,
    /// Offline hub `user:password`.
    #[serde(default)]
    pub auth: Option<String>,
    /// Offline hub priority.
    #[serde(default)]
    pub offline_priority: Option<i32>,
    /// Mirror registries. When present, replaces the whole list.
    #[serde(default)]
    pub registries: Option<Vec<RegistryPatch>>,
    /// Cache sizing.
    #[serde(default)]
    pub cache: Option<CachePatch>,
    /// Time allowed for one registry probe.
    #[serde(default, with = "humantime_serde")]
    pub probe_timeout: Option<Duration>,
    /// Interval between configuration file checks.
    #[serde(default, with = "humantime_serde")]
    pub reload_interval: Option<Duration>,
}

impl ConfigPatch {
    /// Parse a YAML document. An empty document is an empty patch.
    pub fn from_slice(document: &[u8]) -> Result<Self, ConfigError> {
        if document.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_slice(document)?)
    }
}

/// A configured registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Address as written.
    pub address: String,
    /// `user:password`, if any.
    pub auth: Option<String>,
    /// Priority as written; normalized when the snapshot is built.
    pub priority: i32,
}

/// Effective shim configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShimConfig {
    /// Offline hub, if any.
    pub offline: Option<RegistryConfig>,
    /// Offline hub priority as written.
    pub offline_priority: i32,
    /// Mirror registries.
    pub registries: Vec<RegistryConfig>,
    /// Raw image cache size; see [`CachePatch::image_cache_size`].
    pub image_cache_size: i64,
    /// Image tier entry lifetime.
    pub image_cache_ttl: Duration,
    /// Domain tier entry lifetime.
    pub domain_cache_ttl: Duration,
    /// Time allowed for one registry probe.
    pub probe_timeout: Duration,
    /// Interval between configuration file checks.
    pub reload_interval: Duration,
}

impl Default for ShimConfig {
    fn default() -> Self {
        let cache = CacheOptions::default();
        Self {
            offline: None,
            offline_priority: 0,
            registries: Vec::new(),
            image_cache_size: 0,
            image_cache_ttl: cache.image_cache_ttl,
            domain_cache_ttl: cache.domain_cache_ttl,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            reload_interval: DEFAULT_RELOAD_INTERVAL,
        }
    }
}

impl ShimConfig {
    /// Parse a YAML document over the defaults.
    pub fn from_slice(document: &[u8]) -> Result<Self, ConfigError> {
        Ok(Self::default().merge(ConfigPatch::from_slice(document)?))
    }

    /// Read and parse a YAML file over the defaults.
    pub async fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let document = tokio::fs::read(path).await.map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::from_slice(&document)
    }

    /// Overwrite the fields present in `patch`.
    pub fn merge(mut self, patch: ConfigPatch) -> Self {
        if let Some(address) = patch.address {
            let auth = self.offline.take().and_then(|offline| offline.auth);
            self.offline = (!address.trim().is_empty()).then(|| RegistryConfig {
                address,
                auth,
                priority: 0,
            });
        }
        if let Some(auth) = patch.auth {
            if let Some(offline) = self.offline.as_mut() {
                offline.auth = Some(auth).filter(|auth| !auth.is_empty());
            }
        }
        if let Some(priority) = patch.offline_priority {
            self.offline_priority = priority;
        }
        if let Some(registries) = patch.registries {
            self.registries = registries
                .into_iter()
                .map(|registry| RegistryConfig {
                    address: registry.address,
                    auth: registry.auth.filter(|auth| !auth.is_empty()),
                    priority: registry.priority.unwrap_or(0),
                })
                .collect();
        }
        if let Some(cache) = patch.cache {
            if let Some(size) = cache.image_cache_size {
                self.image_cache_size = size;
            }
            if let Some(ttl) = cache.image_cache_ttl {
                self.image_cache_ttl = ttl;
            }
            if let Some(ttl) = cache.domain_cache_ttl {
                self.domain_cache_ttl = ttl;
            }
        }
        if let Some(timeout) = patch.probe_timeout.filter(|t| !t.is_zero()) {
            self.probe_timeout = timeout;
        }
        if let Some(interval) = patch.reload_interval.filter(|i| !i.is_zero()) {
            self.reload_interval = interval;
        }
        self
    }

    /// Cache sizing with defaults applied.
    pub fn cache_options(&self) -> CacheOptions {
        let image_cache_size = match self.image_cache_size {
            0 => DEFAULT_IMAGE_CACHE_SIZE,
            size if size < 0 => 0,
            size => usize::try_from(size).unwrap_or(usize::MAX),
        };
        CacheOptions {
            image_cache_size,
            image_cache_ttl: self.image_cache_ttl,
            domain_cache_ttl: self.domain_cache_ttl,
        }
        .normalized()
    }

    /// Build the credential snapshot for this configuration.
    pub fn snapshot(&self) -> Result<CredentialSnapshot, ConfigError> {
        let mut builder = CredentialSnapshot::builder().offline_priority(self.offline_priority);

        if let Some(offline) = &self.offline {
            let domain = registry_domain(&offline.address)?;
            builder = builder.offline(&domain, credential(offline)?);
        }
        for registry in &self.registries {
            let domain = registry_domain(&registry.address)?;
            builder = builder.registry(&domain, credential(registry)?, registry.priority);
        }

        Ok(builder.build())
    }
}

fn registry_domain(address: &str) -> Result<String, ConfigError> {
    let domain = normalize_domain(address);
    if !is_valid_domain(&domain) {
        return Err(ConfigError::Address(address.to_owned()));
    }
    Ok(domain)
}

fn credential(registry: &RegistryConfig) -> Result<RegistryCredential, ConfigError> {
    let Some(auth) = registry.auth.as_deref() else {
        return Ok(RegistryCredential::anonymous(registry.address.as_str()));
    };
    // `user:password`, or the base64 form docker keeps in its config.json.
    let auth = BasicAuth::parse(auth)
        .or_else(|error| BasicAuth::decode(auth).map_err(|_| error))
        .map_err(|source| ConfigError::Auth {
            address: registry.address.clone(),
            source,
        })?;
    Ok(RegistryCredential::basic(registry.address.as_str(), auth))
}
