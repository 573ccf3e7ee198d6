//! Secret strings and docker-style basic auth.

use std::{borrow::Cow, fmt, ops::Deref};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

/// A password, token or any other semi-secret string.
///
/// This wrapper just prevents the value from appearing in debug reprs.
///
/// Use [Secret::revealed] to get the underlying value.
#[derive(Clone, Default, Deserialize, Serialize)]
#[serde(from = "String")]
pub struct Secret(Cow<'static, str>);

impl Secret {
    /// An empty secret, used for registries that need no login.
    pub const fn empty() -> Self {
        Secret(Cow::Borrowed(""))
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        if let Cow::Owned(ref mut s) = self.0 {
            s.zeroize()
        }
    }
}

/// Tiny wrapper struct to indicate that the inner object should
/// be directly printed in fmt::Debug implementations.
struct DirectDebug<D>(D);

impl<D> fmt::Debug for DirectDebug<D>
where
    D: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            f.debug_tuple("Secret").field(&DirectDebug("")).finish()
        } else {
            f.debug_tuple("Secret").field(&DirectDebug("****")).finish()
        }
    }
}

impl PartialEq for Secret {
    fn eq(&self, other: &Self) -> bool {
        self.revealed() == other.revealed()
    }
}

impl Eq for Secret {}

impl Secret {
    /// Expose the underlying value of this secret
    pub fn revealed(&self) -> &str {
        self.0.deref()
    }

    /// True when there is nothing to hide.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copy a borrowed string into a secret.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Self {
        Secret(s.to_owned().into())
    }
}

impl From<Cow<'static, str>> for Secret {
    fn from(inner: Cow<'static, str>) -> Self {
        Secret(inner)
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Secret(value.into())
    }
}

impl From<&'static str> for Secret {
    fn from(value: &'static str) -> Self {
        Secret(value.into())
    }
}

/// Errors from parsing basic auth strings.
#[derive(Debug, thiserror::Error)]
pub enum BasicAuthError {
    /// The value did not contain a `:` separating user and password.
    #[error("expected <username>:<password>")]
    MissingSeparator,

    /// The username part was empty.
    #[error("username is empty")]
    EmptyUsername,

    /// The `auth` field was not valid base64.
    #[error("invalid base64 in auth field: {0}")]
    Base64(#[from] base64::DecodeError),

    /// The decoded `auth` field was not UTF-8.
    #[error("auth field is not utf-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// A username and password pair, as written `user:pass` in configuration
/// files and base64 encoded in docker's `auth` field.
#[derive(Clone, PartialEq, Eq)]
pub struct BasicAuth {
    username: String,
    password: Secret,
}

impl fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .field("password", &self.password)
            .finish()
    }
}

impl BasicAuth {
    /// Create a pair from its parts.
    pub fn new(username: impl Into<String>, password: impl Into<Secret>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Parse `user:pass`. The password may itself contain `:`.
    pub fn parse(value: &str) -> Result<Self, BasicAuthError> {
        let (username, password) = value
            .split_once(':')
            .ok_or(BasicAuthError::MissingSeparator)?;
        if username.is_empty() {
            return Err(BasicAuthError::EmptyUsername);
        }
        Ok(Self::new(username, Secret::from(password.to_owned())))
    }

    /// Decode docker's base64 `auth` field.
    pub fn decode(auth: &str) -> Result<Self, BasicAuthError> {
        let mut decoded = String::from_utf8(STANDARD.decode(auth.trim())?)?;
        let parsed = Self::parse(&decoded);
        decoded.zeroize();
        parsed
    }

    /// Encode as docker's base64 `auth` field.
    pub fn encode(&self) -> Secret {
        let mut plain = format!("{}:{}", self.username, self.password.revealed());
        let encoded = STANDARD.encode(plain.as_bytes());
        plain.zeroize();
        Secret::from(encoded)
    }

    /// The login name.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// The password.
    pub fn password(&self) -> &Secret {
        &self.password
    }

    /// Split into username and password.
    pub fn into_parts(self) -> (String, Secret) {
        (self.username, self.password)
    }
}
