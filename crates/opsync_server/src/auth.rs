//! Authentication support for the sync server.
//!
//! Tokens bind a device of a user to the server secret using HMAC-SHA256 and
//! carry their issue time for expiration checking.
//!
//! ## Token Format
//!
//! ```text
//! | user len (2) | user | device len (2) | device | issued at (8) | hmac (32) |
//! ```
//!
//! Lengths and the issue time (Unix millis) are big-endian. The HTTP layer is
//! free to base64-encode tokens for transport.

use crate::error::{ServerError, ServerResult};
use hmac::{Hmac, Mac};
use opsync_core::{Clock, SystemClock};
use opsync_protocol::{DeviceId, UserId};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_LEN: usize = 32;
const TIMESTAMP_LEN: usize = 8;

/// Authentication configuration.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Secret key for HMAC.
    pub secret: Vec<u8>,
    /// Token expiration duration.
    pub token_expiry: Duration,
}

impl AuthConfig {
    /// Creates a new auth configuration.
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret,
            token_expiry: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Sets the token expiration duration.
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }
}

/// The identity a request acts as once its token checked out.
///
/// The operation log trusts this pair: every call is scoped to `user` and
/// cursor state is kept for `device`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AuthenticatedDevice {
    /// Account the device belongs to.
    pub user: UserId,
    /// The calling device.
    pub device: DeviceId,
}

impl AuthenticatedDevice {
    /// Creates an identity without checking credentials.
    ///
    /// For deployments that authenticate in front of the server.
    pub fn trusted(user: impl Into<UserId>, device: impl Into<DeviceId>) -> Self {
        Self {
            user: user.into(),
            device: device.into(),
        }
    }
}

/// Token validator for incoming requests.
#[derive(Clone)]
pub struct TokenValidator {
    config: AuthConfig,
    clock: Arc<dyn Clock>,
}

impl TokenValidator {
    /// Creates a new token validator.
    pub fn new(config: AuthConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the clock used for issue and expiry times.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Creates a new auth token for `device` of `user`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` if an id is empty or too long.
    pub fn create_token(&self, user: &UserId, device: &DeviceId) -> ServerResult<Vec<u8>> {
        if !user.is_valid() || !device.is_valid() {
            return Err(ServerError::InvalidRequest(
                "token ids must be non-empty and bounded".into(),
            ));
        }

        let mut token = Vec::with_capacity(
            4 + user.as_str().len() + device.as_str().len() + TIMESTAMP_LEN + SIGNATURE_LEN,
        );
        put_field(&mut token, user.as_str())?;
        put_field(&mut token, device.as_str())?;
        token.extend_from_slice(&self.clock.now_ms().to_be_bytes());

        let signature = self.mac(&token)?.finalize().into_bytes();
        token.extend_from_slice(&signature);
        Ok(token)
    }

    /// Validates a token and returns the identity it was issued for.
    ///
    /// # Errors
    ///
    /// Returns `NotAuthorized` for malformed, forged or expired tokens.
    pub fn validate_token(&self, token: &[u8]) -> ServerResult<AuthenticatedDevice> {
        if token.len() < 4 + TIMESTAMP_LEN + SIGNATURE_LEN {
            return Err(ServerError::NotAuthorized("Invalid token length".into()));
        }
        let (data, signature) = token.split_at(token.len() - SIGNATURE_LEN);

        self.mac(data)?
            .verify_slice(signature)
            .map_err(|_| ServerError::NotAuthorized("Invalid signature".into()))?;

        let mut rest = data;
        let user = UserId::new(take_field(&mut rest)?);
        let device = DeviceId::new(take_field(&mut rest)?);
        let issued_at: [u8; TIMESTAMP_LEN] = rest
            .try_into()
            .map_err(|_| ServerError::NotAuthorized("Invalid token length".into()))?;
        if !user.is_valid() || !device.is_valid() {
            return Err(ServerError::NotAuthorized("Invalid token ids".into()));
        }

        let issued_at = u64::from_be_bytes(issued_at);
        let expiry_millis = u64::try_from(self.config.token_expiry.as_millis()).unwrap_or(u64::MAX);
        if self.clock.now_ms() > issued_at.saturating_add(expiry_millis) {
            return Err(ServerError::NotAuthorized("Token expired".into()));
        }

        Ok(AuthenticatedDevice { user, device })
    }

    fn mac(&self, data: &[u8]) -> ServerResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.config.secret)
            .map_err(|e| ServerError::Internal(format!("invalid HMAC key: {e}")))?;
        mac.update(data);
        Ok(mac)
    }
}

impl std::fmt::Debug for TokenValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenValidator")
            .field("token_expiry", &self.config.token_expiry)
            .finish_non_exhaustive()
    }
}

fn put_field(out: &mut Vec<u8>, value: &str) -> ServerResult<()> {
    let len = u16::try_from(value.len())
        .map_err(|_| ServerError::InvalidRequest("token field too long".into()))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(value.as_bytes());
    Ok(())
}

fn take_field<'a>(rest: &mut &'a [u8]) -> ServerResult<String> {
    let malformed = || ServerError::NotAuthorized("Malformed token".into());
    let data: &'a [u8] = *rest;
    let (len, tail) = data.split_first_chunk::<2>().ok_or_else(malformed)?;
    let len = usize::from(u16::from_be_bytes(*len));
    if tail.len() < len {
        return Err(malformed());
    }
    let (value, tail) = tail.split_at(len);
    *rest = tail;
    String::from_utf8(value.to_vec()).map_err(|_| malformed())
}
