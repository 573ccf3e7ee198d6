#![allow(dead_code)]

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::oneshot;
use image_shim::{
    cri::{
        Image, ImageFsInfoRequest, ImageFsInfoResponse, ImageService, ImageStatusRequest,
        ImageStatusResponse, ListImagesRequest, ListImagesResponse, PullImageRequest,
        PullImageResponse, RemoveImageRequest, RemoveImageResponse, RuntimeError,
    },
    BasicAuth, Candidates, ImageReference, ManifestProbe, ProbeError, ProbeMatch,
    RegistryCredential, Secret,
};

pub fn login(user: &str) -> RegistryCredential {
    RegistryCredential::basic(
        format!("https://{user}.example.com"),
        BasicAuth::new(user, Secret::from(format!("{user}-password"))),
    )
}

/// Serves images from a fixed set of registries (or all of them) by renaming
/// the image onto the candidate domain.
#[derive(Debug, Default)]
pub struct FakeProbe {
    serves: Option<BTreeSet<String>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    probed: Mutex<Vec<String>>,
    held: Mutex<Option<oneshot::Receiver<()>>>,
}

impl FakeProbe {
    pub fn serving_all() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serving(domains: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            serves: Some(domains.iter().map(|d| d.to_string()).collect()),
            ..Self::default()
        })
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Self::default()
        })
    }

    /// The first lookup waits until the returned sender fires (or is dropped);
    /// later lookups answer straight away.
    pub fn held() -> (Arc<Self>, oneshot::Sender<()>) {
        let (release, held) = oneshot::channel();
        let probe = Arc::new(Self {
            held: Mutex::new(Some(held)),
            ..Self::default()
        });
        (probe, release)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Registry domains in the order they were probed.
    pub fn probed(&self) -> Vec<String> {
        self.probed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ManifestProbe for FakeProbe {
    async fn probe(
        &self,
        image: &ImageReference,
        candidates: &Candidates,
    ) -> Result<ProbeMatch, ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let held = self.held.lock().unwrap().take();
        if let Some(held) = held {
            let _ = held.await;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        for (domain, credential) in candidates {
            self.probed.lock().unwrap().push(domain.clone());
            let serves = self
                .serves
                .as_ref()
                .map_or(true, |serves| serves.contains(domain));
            if serves {
                return Ok(ProbeMatch {
                    domain: domain.clone(),
                    image: image.with_domain(domain),
                    manifest: Bytes::from_static(br#"{"schemaVersion":2}"#),
                    credential: Some(credential.clone()),
                });
            }
        }
        Err(ProbeError::not_found(image))
    }
}

#[derive(Debug, Default)]
struct RuntimeState {
    local: Mutex<BTreeMap<String, String>>,
    pulls: Mutex<Vec<PullImageRequest>>,
    statuses: Mutex<Vec<String>>,
    removals: Mutex<Vec<String>>,
    fail_pulls: bool,
}

/// An in-memory runtime that records what it was asked. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct FakeRuntime {
    state: Arc<RuntimeState>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            state: Arc::new(RuntimeState {
                fail_pulls: true,
                ..RuntimeState::default()
            }),
        }
    }

    /// Pretend `name` was pulled as image `id`.
    pub fn add_local(&self, name: &str, id: &str) {
        self.state
            .local
            .lock()
            .unwrap()
            .insert(name.to_owned(), id.to_owned());
    }

    pub fn pulls(&self) -> Vec<PullImageRequest> {
        self.state.pulls.lock().unwrap().clone()
    }

    pub fn last_pull(&self) -> PullImageRequest {
        self.pulls().pop().unwrap()
    }

    pub fn statuses(&self) -> Vec<String> {
        self.state.statuses.lock().unwrap().clone()
    }

    pub fn last_removal(&self) -> String {
        self.state.removals.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl ImageService for FakeRuntime {
    async fn list_images(&self, _: ListImagesRequest) -> Result<ListImagesResponse, RuntimeError> {
        let images = self
            .state
            .local
            .lock()
            .unwrap()
            .iter()
            .map(|(name, id)| Image {
                id: id.clone(),
                repo_tags: vec![name.clone()],
                ..Image::default()
            })
            .collect();
        Ok(ListImagesResponse { images })
    }

    async fn image_status(&self, request: ImageStatusRequest) -> Result<ImageStatusResponse, RuntimeError> {
        let image = request.image.map(|spec| spec.image).unwrap_or_default();
        self.state.statuses.lock().unwrap().push(image.clone());
        let found = self
            .state
            .local
            .lock()
            .unwrap()
            .iter()
            .find(|(name, id)| **name == image || **id == image)
            .map(|(name, id)| Image {
                id: id.clone(),
                repo_tags: vec![name.clone()],
                ..Image::default()
            });
        Ok(ImageStatusResponse {
            image: found,
            ..ImageStatusResponse::default()
        })
    }

    async fn pull_image(&self, request: PullImageRequest) -> Result<PullImageResponse, RuntimeError> {
        self.state.pulls.lock().unwrap().push(request.clone());
        if self.state.fail_pulls {
            return Err(RuntimeError::unavailable("runtime is shutting down"));
        }
        let image_ref = request.image.map(|spec| spec.image).unwrap_or_default();
        Ok(PullImageResponse { image_ref })
    }

    async fn remove_image(&self, request: RemoveImageRequest) -> Result<RemoveImageResponse, RuntimeError> {
        let image = request.image.map(|spec| spec.image).unwrap_or_default();
        self.state.removals.lock().unwrap().push(image);
        Ok(RemoveImageResponse {})
    }

    async fn image_fs_info(&self, _: ImageFsInfoRequest) -> Result<ImageFsInfoResponse, RuntimeError> {
        Ok(ImageFsInfoResponse::default())
    }
}
