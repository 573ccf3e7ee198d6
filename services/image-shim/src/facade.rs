//! The image service the kubelet talks to.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{
    cache::{Action, CacheOptions, CacheStats},
    credentials::CredentialStore,
    cri::{
        ArcImageService, AuthConfig, ImageFsInfoRequest, ImageFsInfoResponse, ImageService,
        ImageStatusRequest, ImageStatusResponse, ListImagesRequest, ListImagesResponse,
        PullImageRequest, PullImageResponse, RemoveImageRequest, RemoveImageResponse,
        RuntimeError,
    },
    probe::ManifestProbe,
    reference::{is_image_id, ImageReference},
    resolver::DEFAULT_PROBE_TIMEOUT,
    rewrite::Rewriter,
};

/// Builder for [`ImageServiceFacade`].
#[derive(Debug, Default)]
pub struct FacadeBuilder {
    store: Option<Arc<CredentialStore>>,
    options: CacheOptions,
    probe_timeout: Option<Duration>,
}

impl FacadeBuilder {
    /// Share an existing credential store. Without one, the facade starts
    /// with no registries.
    pub fn credentials(mut self, store: Arc<CredentialStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Cache sizing.
    pub fn cache_options(mut self, options: CacheOptions) -> Self {
        self.options = options;
        self
    }

    /// Time allowed for each registry probe.
    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = Some(timeout);
        self
    }

    /// Wrap `runtime`, resolving images with `probe`.
    pub fn build<R, P>(self, runtime: R, probe: P) -> ImageServiceFacade
    where
        R: ImageService + 'static,
        P: ManifestProbe + 'static,
    {
        let store = self.store.unwrap_or_default();
        let rewriter = Rewriter::new(
            Arc::clone(&store),
            Arc::new(probe),
            self.options,
            self.probe_timeout.unwrap_or(DEFAULT_PROBE_TIMEOUT),
        );
        ImageServiceFacade {
            runtime: Arc::new(runtime),
            rewriter,
            store,
        }
    }
}

/// Wraps a runtime image service and rewrites image references onto
/// configured registries before forwarding.
///
/// `ListImages` and `ImageFsInfo` pass through. `PullImage`, `ImageStatus`
/// and `RemoveImage` rewrite the image unless it is an image ID, and
/// `PullImage` also fills in registry credentials. Runtime errors are
/// returned unchanged.
pub struct ImageServiceFacade {
    runtime: ArcImageService,
    rewriter: Rewriter,
    store: Arc<CredentialStore>,
}

impl fmt::Debug for ImageServiceFacade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageServiceFacade")
            .field("rewriter", &self.rewriter)
            .finish_non_exhaustive()
    }
}

impl ImageServiceFacade {
    /// Start configuring a facade.
    pub fn builder() -> FacadeBuilder {
        FacadeBuilder::default()
    }

    /// The rewriter, for reconfiguration and stats.
    pub fn rewriter(&self) -> &Rewriter {
        &self.rewriter
    }

    /// The credential store rewrites resolve against.
    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// Current cache counters.
    pub fn cache_stats(&self) -> CacheStats {
        self.rewriter.cache_stats()
    }

    /// Resize the cache or change entry lifetimes.
    pub fn update_cache_options(&self, options: CacheOptions) {
        self.rewriter.update_cache_options(options);
    }

    /// The ID of `image` if the runtime already has it under that name.
    async fn local_image_id(&self, image: &str) -> Option<String> {
        match self.runtime.image_status(ImageStatusRequest::new(image)).await {
            Ok(response) => response
                .image
                .map(|found| found.id)
                .filter(|id| !id.is_empty()),
            Err(error) => {
                tracing::debug!(image, %error, "local image lookup failed");
                None
            }
        }
    }

    /// Point `image` at the local image ID if the runtime has it, otherwise
    /// at the rewritten reference.
    async fn resolve_local(&self, image: &mut String, action: Action) {
        if image.is_empty() || is_image_id(image) {
            return;
        }
        if let Some(id) = self.local_image_id(image).await {
            tracing::debug!(action = %action, image = %image, id = %id, "using local image ID");
            *image = id;
            return;
        }
        let rewrite = self.rewriter.rewrite_image(image, action).await;
        if rewrite.replaced(image) {
            *image = rewrite.image;
        }
    }

    /// Credential for the registry named by `image`, by exact domain.
    fn registry_auth(&self, image: &str) -> Option<AuthConfig> {
        let reference = image.parse::<ImageReference>().ok()?;
        let domain = reference.domain();
        if self.store.should_skip_login(domain) {
            return None;
        }
        self.store
            .lookup(domain)
            .filter(|credential| !credential.is_empty())
            .map(AuthConfig::from)
    }
}

#[async_trait]
impl ImageService for ImageServiceFacade {
    async fn list_images(&self, request: ListImagesRequest) -> Result<ListImagesResponse, RuntimeError> {
        self.runtime.list_images(request).await
    }

    async fn image_status(&self, mut request: ImageStatusRequest) -> Result<ImageStatusResponse, RuntimeError> {
        if let Some(spec) = request.image.as_mut() {
            self.resolve_local(&mut spec.image, Action::Status).await;
        }
        self.runtime.image_status(request).await
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn pull_image(&self, mut request: PullImageRequest) -> Result<PullImageResponse, RuntimeError> {
        if let Some(spec) = request.image.as_mut() {
            if !spec.image.is_empty() && !is_image_id(&spec.image) {
                let rewrite = self.rewriter.rewrite_image(&spec.image, Action::Pull).await;
                if rewrite.matched {
                    // A credential for the original registry means nothing to a mirror.
                    let moved = rewrite.replaced(&spec.image);
                    match rewrite.credential {
                        Some(credential) => request.auth = Some(AuthConfig::from(credential)),
                        None if moved => request.auth = None,
                        None => {}
                    }
                    spec.image = rewrite.image;
                }
            }

            if request.auth.is_none() {
                request.auth = self.registry_auth(&spec.image);
            }
        }
        self.runtime.pull_image(request).await
    }

    async fn remove_image(&self, mut request: RemoveImageRequest) -> Result<RemoveImageResponse, RuntimeError> {
        if let Some(spec) = request.image.as_mut() {
            self.resolve_local(&mut spec.image, Action::Remove).await;
        }
        self.runtime.remove_image(request).await
    }

    async fn image_fs_info(&self, request: ImageFsInfoRequest) -> Result<ImageFsInfoResponse, RuntimeError> {
        self.runtime.image_fs_info(request).await
    }
}

static_assertions::assert_impl_all!(ImageServiceFacade: Send, Sync);
