//! Picking up configuration changes from disk.

use std::sync::Arc;

use arc_swap::ArcSwap;
use camino::{Utf8Path, Utf8PathBuf};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{ConfigError, ShimConfig},
    rewrite::Rewriter,
};

/// Watches a configuration file and applies it to a [`Rewriter`] and its
/// credential store.
///
/// The file is polled every `reload_interval`. Unchanged content (by SHA-256)
/// is skipped. A file that fails to parse is logged and leaves the last good
/// configuration in place.
#[derive(Debug)]
pub struct ConfigWatcher {
    path: Utf8PathBuf,
    rewriter: Rewriter,
    current: ArcSwap<ShimConfig>,
    digest: Mutex<Option<[u8; 32]>>,
}

impl ConfigWatcher {
    /// Watch `path`, starting from `initial`.
    pub fn new(path: impl Into<Utf8PathBuf>, rewriter: Rewriter, initial: ShimConfig) -> Self {
        Self {
            path: path.into(),
            rewriter,
            current: ArcSwap::from_pointee(initial),
            digest: Mutex::new(None),
        }
    }

    /// The watched file.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// The configuration last applied.
    pub fn current(&self) -> Arc<ShimConfig> {
        self.current.load_full()
    }

    /// Read the file once and apply it if it changed.
    ///
    /// Returns `true` when a new configuration was applied.
    pub async fn reload(&self) -> Result<bool, ConfigError> {
        let document = tokio::fs::read(&self.path)
            .await
            .map_err(|source| ConfigError::Io {
                path: self.path.clone(),
                source,
            })?;

        let digest: [u8; 32] = Sha256::digest(&document).into();
        {
            let mut last = self.digest.lock();
            if *last == Some(digest) {
                return Ok(false);
            }
            *last = Some(digest);
        }

        let config = ShimConfig::from_slice(&document)?;
        let snapshot = config.snapshot()?;

        self.rewriter.credentials().update(Some(snapshot));
        self.rewriter.update_cache_options(config.cache_options());
        self.rewriter.set_probe_timeout(config.probe_timeout);

        tracing::info!(
            path = %self.path,
            digest = %hex::encode(&digest[..8]),
            registries = config.registries.len(),
            offline = config.offline.is_some(),
            "configuration applied"
        );
        self.current.store(Arc::new(config));
        Ok(true)
    }

    /// Poll until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.current().reload_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(path = %self.path, "configuration watcher stopped");
                    return;
                }
                _ = interval.tick() => {}
            }

            let period = self.current().reload_interval;
            match self.reload().await {
                Ok(true) if self.current().reload_interval != period => {
                    interval = tokio::time::interval(self.current().reload_interval);
                    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    interval.reset();
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(path = %self.path, error = %error, "configuration not applied, keeping last good");
                }
            }
        }
    }
}
