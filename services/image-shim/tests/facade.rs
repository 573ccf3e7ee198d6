mod common;

use std::sync::Arc;

use common::{login, FakeProbe, FakeRuntime};
use image_shim::{
    cri::{
        AuthConfig, ImageFsInfoRequest, ImageService, ImageStatusRequest, ListImagesRequest,
        PullImageRequest, RemoveImageRequest, RuntimeErrorCode,
    },
    CredentialSnapshot, CredentialStore, ImageServiceFacade, RegistryCredential,
};

const IMAGE_ID: &str = "sha256:8f2b1a5c4d3e6f7a9b0c1d2e3f4a5b6c7d8e9f0a1b2c3d4e5f6a7b8c9d0e1f2a";

fn facade(snapshot: CredentialSnapshot, runtime: &FakeRuntime, probe: &Arc<FakeProbe>) -> ImageServiceFacade {
    ImageServiceFacade::builder()
        .credentials(Arc::new(CredentialStore::new(snapshot)))
        .build(runtime.clone(), probe.clone())
}

fn pulled_image(runtime: &FakeRuntime) -> String {
    runtime.last_pull().image.unwrap().image
}

#[tokio::test]
async fn pull_through_skip_login_mirror() {
    let runtime = FakeRuntime::new();
    let probe = FakeProbe::serving_all();
    let snapshot = CredentialSnapshot::builder()
        .registry("mirror.example.com", RegistryCredential::anonymous("mirror.example.com"), 0)
        .build();
    let facade = facade(snapshot, &runtime, &probe);

    let response = facade
        .pull_image(PullImageRequest::new("docker.io/library/nginx:latest"))
        .await
        .unwrap();

    assert_eq!(response.image_ref, "mirror.example.com/library/nginx:latest");
    let pull = runtime.last_pull();
    assert_eq!(pull.image.unwrap().image, "mirror.example.com/library/nginx:latest");
    assert_eq!(pull.auth, None);
}

#[tokio::test]
async fn rewritten_pull_carries_registry_credential() {
    let runtime = FakeRuntime::new();
    let probe = FakeProbe::serving_all();
    let snapshot = CredentialSnapshot::builder()
        .registry("mirror.example.com", login("mirror"), 0)
        .build();
    let facade = facade(snapshot, &runtime, &probe);

    let caller = AuthConfig {
        username: "caller".into(),
        ..AuthConfig::default()
    };
    let request = PullImageRequest {
        auth: Some(caller),
        ..PullImageRequest::new("nginx:1.25")
    };
    facade.pull_image(request).await.unwrap();

    let pull = runtime.last_pull();
    assert_eq!(pull.image.unwrap().image, "mirror.example.com/library/nginx:1.25");
    let auth = pull.auth.unwrap();
    assert_eq!(auth.username, "mirror");
    assert_eq!(auth.password.revealed(), "mirror-password");
}

#[tokio::test]
async fn unrewritten_pull_keeps_caller_auth() {
    let runtime = FakeRuntime::new();
    let probe = FakeProbe::serving(&[]);
    let snapshot = CredentialSnapshot::builder()
        .registry("docker.io", login("hub"), 0)
        .build();
    let facade = facade(snapshot, &runtime, &probe);

    let caller = AuthConfig {
        username: "caller".into(),
        ..AuthConfig::default()
    };
    let request = PullImageRequest {
        auth: Some(caller.clone()),
        ..PullImageRequest::new("nginx")
    };
    facade.pull_image(request).await.unwrap();
    assert_eq!(runtime.last_pull().auth, Some(caller));
}

#[tokio::test]
async fn matched_pull_in_place_uses_registry_credential() {
    let runtime = FakeRuntime::new();
    let probe = FakeProbe::serving_all();
    let snapshot = CredentialSnapshot::builder()
        .registry("registry.example.com", login("registry"), 0)
        .build();
    let facade = facade(snapshot, &runtime, &probe);

    let caller = AuthConfig {
        username: "caller".into(),
        ..AuthConfig::default()
    };
    let request = PullImageRequest {
        auth: Some(caller),
        ..PullImageRequest::new("registry.example.com/app/nginx:1.0")
    };
    facade.pull_image(request).await.unwrap();

    let pull = runtime.last_pull();
    assert_eq!(pull.image.unwrap().image, "registry.example.com/app/nginx:1.0");
    assert_eq!(pull.auth.unwrap().username, "registry");
    assert_eq!(probe.calls(), 1);
}

#[tokio::test]
async fn missing_auth_is_filled_by_exact_domain() {
    let runtime = FakeRuntime::new();
    let probe = FakeProbe::serving(&[]);
    let snapshot = CredentialSnapshot::builder()
        .registry("registry.example.com", login("registry"), 0)
        .build();
    let facade = facade(snapshot, &runtime, &probe);

    facade
        .pull_image(PullImageRequest::new("registry.example.com/app/nginx:1.0"))
        .await
        .unwrap();
    let pull = runtime.last_pull();
    assert_eq!(pull.image.unwrap().image, "registry.example.com/app/nginx:1.0");
    assert_eq!(pull.auth.unwrap().username, "registry");

    facade
        .pull_image(PullImageRequest::new("cache.registry.example.com/app/nginx:1.0"))
        .await
        .unwrap();
    assert_eq!(runtime.last_pull().auth, None);
}

#[tokio::test]
async fn image_ids_pass_through() {
    let runtime = FakeRuntime::new();
    let probe = FakeProbe::serving_all();
    let facade = facade(
        CredentialSnapshot::builder()
            .registry("mirror.example.com", login("mirror"), 0)
            .build(),
        &runtime,
        &probe,
    );

    facade.pull_image(PullImageRequest::new(IMAGE_ID)).await.unwrap();
    facade.remove_image(RemoveImageRequest::new(IMAGE_ID)).await.unwrap();
    facade.image_status(ImageStatusRequest::new(IMAGE_ID)).await.unwrap();

    assert_eq!(pulled_image(&runtime), IMAGE_ID);
    assert_eq!(runtime.last_removal(), IMAGE_ID);
    assert_eq!(runtime.statuses(), [IMAGE_ID]);
    assert_eq!(probe.calls(), 0);
}

#[tokio::test]
async fn status_and_remove_prefer_local_image_ids() {
    let runtime = FakeRuntime::new();
    runtime.add_local("nginx:latest", IMAGE_ID);
    let probe = FakeProbe::serving_all();
    let facade = facade(
        CredentialSnapshot::builder()
            .registry("mirror.example.com", login("mirror"), 0)
            .build(),
        &runtime,
        &probe,
    );

    let status = facade
        .image_status(ImageStatusRequest::new("nginx:latest"))
        .await
        .unwrap();
    assert_eq!(status.image.unwrap().id, IMAGE_ID);
    assert_eq!(runtime.statuses(), ["nginx:latest", IMAGE_ID]);

    facade.remove_image(RemoveImageRequest::new("nginx:latest")).await.unwrap();
    assert_eq!(runtime.last_removal(), IMAGE_ID);
    assert_eq!(probe.calls(), 0);
}

#[tokio::test]
async fn status_and_remove_rewrite_unknown_images() {
    let runtime = FakeRuntime::new();
    let probe = FakeProbe::serving_all();
    let facade = facade(
        CredentialSnapshot::builder()
            .registry("mirror.example.com", login("mirror"), 0)
            .build(),
        &runtime,
        &probe,
    );

    facade.image_status(ImageStatusRequest::new("redis:7")).await.unwrap();
    assert_eq!(
        runtime.statuses(),
        ["redis:7", "mirror.example.com/library/redis:7"]
    );

    facade.remove_image(RemoveImageRequest::new("redis:7")).await.unwrap();
    assert_eq!(runtime.last_removal(), "mirror.example.com/library/redis:7");

    let stats = facade.cache_stats();
    assert_eq!(stats.image_misses, 2, "status and remove are cached separately");
}

#[tokio::test]
async fn empty_and_invalid_images_are_forwarded() {
    let runtime = FakeRuntime::new();
    let probe = FakeProbe::serving_all();
    let facade = facade(
        CredentialSnapshot::builder()
            .registry("mirror.example.com", login("mirror"), 0)
            .build(),
        &runtime,
        &probe,
    );

    facade.pull_image(PullImageRequest::new("")).await.unwrap();
    assert_eq!(pulled_image(&runtime), "");

    facade.pull_image(PullImageRequest::new("bad@@@")).await.unwrap();
    assert_eq!(pulled_image(&runtime), "bad@@@");
    assert_eq!(runtime.last_pull().auth, None);

    facade.pull_image(PullImageRequest::default()).await.unwrap();
    assert_eq!(runtime.last_pull().image, None);
    assert_eq!(probe.calls(), 0);
}

#[tokio::test]
async fn runtime_errors_are_returned_unchanged() {
    let runtime = FakeRuntime::failing();
    let probe = FakeProbe::serving_all();
    let facade = facade(CredentialSnapshot::default(), &runtime, &probe);

    let err = facade
        .pull_image(PullImageRequest::new("nginx"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), RuntimeErrorCode::Unavailable);
    assert_eq!(err.message(), "runtime is shutting down");
}

#[tokio::test]
async fn list_and_fs_info_pass_through() {
    let runtime = FakeRuntime::new();
    runtime.add_local("nginx:latest", IMAGE_ID);
    let probe = FakeProbe::serving_all();
    let facade = facade(CredentialSnapshot::default(), &runtime, &probe);

    let listed = facade.list_images(ListImagesRequest::default()).await.unwrap();
    assert_eq!(listed.images.len(), 1);
    assert_eq!(listed.images[0].id, IMAGE_ID);

    let info = facade.image_fs_info(ImageFsInfoRequest::default()).await.unwrap();
    assert!(info.image_filesystems.is_empty());
}

#[tokio::test]
async fn shared_store_updates_reach_the_facade() {
    let runtime = FakeRuntime::new();
    let probe = FakeProbe::serving_all();
    let facade = facade(CredentialSnapshot::default(), &runtime, &probe);

    facade.pull_image(PullImageRequest::new("nginx")).await.unwrap();
    assert_eq!(pulled_image(&runtime), "nginx");

    facade.credentials().update(Some(
        CredentialSnapshot::builder()
            .offline("sealos.hub", login("hub"))
            .build(),
    ));
    facade.pull_image(PullImageRequest::new("nginx")).await.unwrap();
    assert_eq!(pulled_image(&runtime), "sealos.hub/library/nginx");
    assert_eq!(runtime.last_pull().auth.unwrap().username, "hub");
    assert_eq!(facade.cache_stats().invalidations, 1);
}
