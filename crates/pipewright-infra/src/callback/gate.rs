//! Resumption gate with HMAC-SHA256 and bearer token authentication.
//!
//! A signal carrying a valid `sha256=` signature over its body, or a valid
//! bearer token, speaks for [`Caller::Privileged`]. A signal with no
//! credentials at all is [`Caller::Anonymous`]; whether that is enough is
//! decided by the stage's `CallbackAccess`. Invalid credentials are
//! rejected outright.

use hmac::{Hmac, Mac};
use pipewright_types::config::EngineConfig;
use pipewright_types::stage::Caller;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("HMAC signature verification failed")]
    InvalidSignature,

    #[error("bearer token verification failed")]
    InvalidToken,

    #[error("invalid HMAC key: {0}")]
    InvalidKey(String),

    /// Credentials were presented but no secret is configured to check them.
    #[error("signal credentials presented but no callback secret is configured")]
    NotConfigured,
}

/// Authenticates resumption signals against the configured shared secret.
#[derive(Clone, Default)]
pub struct CallbackGate {
    secret: Option<SecretString>,
}

impl std::fmt::Debug for CallbackGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackGate")
            .field("configured", &self.secret.is_some())
            .finish()
    }
}

impl CallbackGate {
    pub fn new(secret: Option<SecretString>) -> Self {
        Self { secret }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.callback_secret.clone().map(SecretString::from))
    }

    pub fn is_configured(&self) -> bool {
        self.secret.is_some()
    }

    /// Decide who a signal speaks for.
    ///
    /// `signature` is the value of the signature header (`sha256=<hex>` or
    /// plain hex); `authorization` the value of the authorization header.
    /// A signature is checked first when both are present.
    pub fn authenticate(
        &self,
        body: &[u8],
        signature: Option<&str>,
        authorization: Option<&str>,
    ) -> Result<Caller, GateError> {
        if signature.is_none() && authorization.is_none() {
            return Ok(Caller::Anonymous);
        }
        let secret = self.secret.as_ref().ok_or(GateError::NotConfigured)?;
        let secret = secret.expose_secret();

        if let Some(signature) = signature {
            verify_hmac_sha256_with_prefix(secret.as_bytes(), body, signature)?;
        } else if let Some(authorization) = authorization {
            verify_bearer_token(secret, authorization)?;
        }
        Ok(Caller::Privileged)
    }

    /// Signature header value for `body`, for senders sharing the secret.
    pub fn sign(&self, body: &[u8]) -> Result<String, GateError> {
        let secret = self.secret.as_ref().ok_or(GateError::NotConfigured)?;
        let hex = compute_hmac_sha256_hex(secret.expose_secret().as_bytes(), body)?;
        Ok(format!("sha256={hex}"))
    }
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

/// Verify a hex HMAC-SHA256 signature; the comparison is constant-time.
pub fn verify_hmac_sha256(secret: &[u8], body: &[u8], signature_hex: &str) -> Result<(), GateError> {
    let expected = hex_decode(signature_hex).ok_or(GateError::InvalidSignature)?;
    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|e| GateError::InvalidKey(e.to_string()))?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| GateError::InvalidSignature)
}

/// Same as [`verify_hmac_sha256`], accepting an optional `sha256=` prefix.
pub fn verify_hmac_sha256_with_prefix(
    secret: &[u8],
    body: &[u8],
    signature: &str,
) -> Result<(), GateError> {
    let hex = signature.strip_prefix("sha256=").unwrap_or(signature);
    verify_hmac_sha256(secret, body, hex)
}

/// Compare a bearer token (with or without the `Bearer ` prefix).
pub fn verify_bearer_token(expected: &str, provided: &str) -> Result<(), GateError> {
    let token = provided.strip_prefix("Bearer ").unwrap_or(provided);
    if constant_time_eq(expected.as_bytes(), token.as_bytes()) {
        Ok(())
    } else {
        Err(GateError::InvalidToken)
    }
}

pub fn compute_hmac_sha256_hex(secret: &[u8], body: &[u8]) -> Result<String, GateError> {
    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|e| GateError::InvalidKey(e.to_string()))?;
    mac.update(body);
    Ok(hex_encode(&mac.finalize().into_bytes()))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn hex_decode(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 || !hex.is_ascii() {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Time taken does not depend on where the inputs differ.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
