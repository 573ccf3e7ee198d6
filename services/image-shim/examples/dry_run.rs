//! Show how a configuration would rewrite images, without touching a registry.
//!
//! Every configured registry is assumed to serve every image, so the output
//! shows the priority order in action.
//!
//! Run with: cargo run -p image-shim --example dry_run -- config.yaml nginx:latest quay.io/app:1

use async_trait::async_trait;
use bytes::Bytes;
use camino::Utf8PathBuf;
use image_shim::{
    cri::{
        ImageFsInfoRequest, ImageFsInfoResponse, ImageService, ImageStatusRequest,
        ImageStatusResponse, ListImagesRequest, ListImagesResponse, PullImageRequest,
        PullImageResponse, RemoveImageRequest, RemoveImageResponse, RuntimeError,
    },
    Candidates, CredentialStore, ImageReference, ImageServiceFacade, ManifestProbe, ProbeError,
    ProbeMatch, ShimConfig,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Debug)]
struct AlwaysServes;

#[async_trait]
impl ManifestProbe for AlwaysServes {
    async fn probe(
        &self,
        image: &ImageReference,
        candidates: &Candidates,
    ) -> Result<ProbeMatch, ProbeError> {
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

/// Answers pulls with the image it was asked for.
#[derive(Debug)]
struct EchoRuntime;

#[async_trait]
impl ImageService for EchoRuntime {
    async fn list_images(&self, _: ListImagesRequest) -> Result<ListImagesResponse, RuntimeError> {
        Ok(ListImagesResponse::default())
    }

    async fn image_status(&self, _: ImageStatusRequest) -> Result<ImageStatusResponse, RuntimeError> {
        Ok(ImageStatusResponse::default())
    }

    async fn pull_image(&self, request: PullImageRequest) -> Result<PullImageResponse, RuntimeError> {
        let image_ref = request.image.map(|spec| spec.image).unwrap_or_default();
        Ok(PullImageResponse { image_ref })
    }

    async fn remove_image(&self, _: RemoveImageRequest) -> Result<RemoveImageResponse, RuntimeError> {
        Ok(RemoveImageResponse {})
    }

    async fn image_fs_info(&self, _: ImageFsInfoRequest) -> Result<ImageFsInfoResponse, RuntimeError> {
        Ok(ImageFsInfoResponse::default())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let path: Utf8PathBuf = args.next().ok_or("usage: dry_run CONFIG IMAGE...")?.into();
    let config = ShimConfig::load(&path).await?;

    let store = Arc::new(CredentialStore::new(config.snapshot()?));
    let facade = ImageServiceFacade::builder()
        .credentials(store)
        .cache_options(config.cache_options())
        .probe_timeout(config.probe_timeout)
        .build(EchoRuntime, AlwaysServes);

    for image in args {
        let response = facade.pull_image(PullImageRequest::new(image.as_str())).await?;
        println!("{image} -> {}", response.image_ref);
    }

    println!("{:#?}", facade.cache_stats());
    Ok(())
}
