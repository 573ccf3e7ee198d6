//! The image half of the container runtime interface.
//!
//! Messages carry only the fields the shim reads or rewrites; a transport
//! layer maps them to and from the wire types.

use std::{collections::BTreeMap, fmt, sync::Arc};

use async_trait::async_trait;
use secret::Secret;

use crate::credentials::RegistryCredential;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// An image as named in a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageSpec {
    /// Image reference or ID.
    pub image: String,
    /// Opaque annotations, passed through.
    pub annotations: BTreeMap<String, String>,
}

impl ImageSpec {
    /// A spec naming `image`.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            annotations: BTreeMap::new(),
        }
    }
}

/// Registry login attached to a pull.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthConfig {
    #[allow(missing_docs)]
    pub username: String,
    #[allow(missing_docs)]
    pub password: Secret,
    /// Base64 `user:password`.
    pub auth: Secret,
    #[allow(missing_docs)]
    pub server_address: String,
    #[allow(missing_docs)]
    pub identity_token: Secret,
    #[allow(missing_docs)]
    pub registry_token: Secret,
}

impl From<&RegistryCredential> for AuthConfig {
    fn from(credential: &RegistryCredential) -> Self {
        Self {
            username: credential.username.clone(),
            password: credential.password.clone(),
            auth: credential.auth.clone(),
            server_address: credential.server_address.clone(),
            identity_token: credential.identity_token.clone(),
            registry_token: credential.registry_token.clone(),
        }
    }
}

impl From<RegistryCredential> for AuthConfig {
    fn from(credential: RegistryCredential) -> Self {
        Self::from(&credential)
    }
}

/// An image known to the runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct Image {
    pub id: String,
    pub repo_tags: Vec<String>,
    pub repo_digests: Vec<String>,
    pub size: u64,
    pub pinned: bool,
}

/// Restricts [`ImageService::list_images`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageFilter {
    /// Only list this image.
    pub image: Option<ImageSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct ListImagesRequest {
    pub filter: Option<ImageFilter>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct ListImagesResponse {
    pub images: Vec<Image>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct ImageStatusRequest {
    pub image: Option<ImageSpec>,
    pub verbose: bool,
}

impl ImageStatusRequest {
    /// Status of `image`.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: Some(ImageSpec::new(image)),
            verbose: false,
        }
    }
}

/// `image` is `None` when the runtime does not have the image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct ImageStatusResponse {
    pub image: Option<Image>,
    pub info: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct PullImageRequest {
    pub image: Option<ImageSpec>,
    pub auth: Option<AuthConfig>,
}

impl PullImageRequest {
    /// Pull `image` without credentials.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: Some(ImageSpec::new(image)),
            auth: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct PullImageResponse {
    /// Reference or ID of the pulled image.
    pub image_ref: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct RemoveImageRequest {
    pub image: Option<ImageSpec>,
}

impl RemoveImageRequest {
    /// Remove `image`.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: Some(ImageSpec::new(image)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct RemoveImageResponse {}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct ImageFsInfoRequest {}

/// Usage of one filesystem holding images.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct FilesystemUsage {
    /// Nanoseconds since the epoch.
    pub timestamp: i64,
    pub mountpoint: String,
    pub used_bytes: u64,
    pub inodes_used: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct ImageFsInfoResponse {
    pub image_filesystems: Vec<FilesystemUsage>,
    pub container_filesystems: Vec<FilesystemUsage>,
}

/// Status code of a failed runtime call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum RuntimeErrorCode {
    NotFound,
    InvalidArgument,
    Unavailable,
    DeadlineExceeded,
    Internal,
    Unknown,
}

impl fmt::Display for RuntimeErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RuntimeErrorCode::NotFound => "not found",
            RuntimeErrorCode::InvalidArgument => "invalid argument",
            RuntimeErrorCode::Unavailable => "unavailable",
            RuntimeErrorCode::DeadlineExceeded => "deadline exceeded",
            RuntimeErrorCode::Internal => "internal",
            RuntimeErrorCode::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Error returned by the runtime, passed back to the caller unchanged.
#[derive(Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RuntimeError {
    code: RuntimeErrorCode,
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl RuntimeError {
    /// An error with a code and message.
    pub fn new(code: RuntimeErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
        }
    }

    /// Attach the underlying cause.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        self.source = Some(source.into());
        self
    }

    /// The image does not exist.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(RuntimeErrorCode::NotFound, message)
    }

    /// The runtime cannot be reached.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(RuntimeErrorCode::Unavailable, message)
    }

    /// Status code.
    pub fn code(&self) -> RuntimeErrorCode {
        self.code
    }

    /// Message from the runtime.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// The image service of a container runtime.
#[async_trait]
pub trait ImageService: Send + Sync {
    /// List images, optionally filtered.
    async fn list_images(&self, request: ListImagesRequest) -> Result<ListImagesResponse, RuntimeError>;

    /// Status of one image.
    async fn image_status(&self, request: ImageStatusRequest) -> Result<ImageStatusResponse, RuntimeError>;

    /// Pull an image.
    async fn pull_image(&self, request: PullImageRequest) -> Result<PullImageResponse, RuntimeError>;

    /// Remove an image.
    async fn remove_image(&self, request: RemoveImageRequest) -> Result<RemoveImageResponse, RuntimeError>;

    /// Filesystem usage of the image store.
    async fn image_fs_info(&self, request: ImageFsInfoRequest) -> Result<ImageFsInfoResponse, RuntimeError>;
}

/// A shared, type-erased image service.
pub type ArcImageService = Arc<dyn ImageService>;
