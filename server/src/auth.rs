//! Viewer and publisher authentication.
//!
//! Two kinds of callers reach the hub:
//!
//! - **Viewers** open a WebSocket with an opaque access token. An
//!   [`Authenticator`] resolves the token to a [`UserId`].
//! - **Publishers** (the contest, vote and chat services) push events over
//!   HTTP. Each request body is signed with the publisher's Ed25519 key and
//!   checked by [`verify_signature`] against the keys configured in
//!   `TOPPET_PUBLIC_KEYS`:
//!   - `X-Source-ID` header: the publisher's identifier
//!   - `X-Signature` header: base64 Ed25519 signature of the raw body

use std::collections::HashMap;

use async_trait::async_trait;
use base64::prelude::*;
use ed25519_dalek::{Signature, VerifyingKey, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::types::UserId;

/// Authentication failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No access token was presented.
    #[error("missing access token")]
    MissingToken,

    /// The access token is not recognized.
    #[error("invalid access token")]
    InvalidToken,

    /// The publisher is not registered in the key configuration.
    #[error("unknown source: {0}")]
    UnknownSource(String),

    /// The signature does not match the body and the publisher's key.
    #[error("invalid signature")]
    InvalidSignature,

    /// A base64 field could not be decoded.
    #[error("invalid base64 encoding for {0}")]
    InvalidBase64(&'static str),

    /// The key bytes are not a valid Ed25519 public key.
    #[error("invalid public key format")]
    InvalidPublicKey,
}

impl AuthError {
    pub fn unknown_source(source_id: impl Into<String>) -> Self {
        Self::UnknownSource(source_id.into())
    }

    /// Returns `true` for viewer token failures.
    pub fn is_token_error(&self) -> bool {
        matches!(self, Self::MissingToken | Self::InvalidToken)
    }

    /// Returns `true` if the input was malformed rather than wrong.
    pub fn is_format_error(&self) -> bool {
        matches!(self, Self::InvalidBase64(_) | Self::InvalidPublicKey)
    }
}

/// Resolves a viewer access token to the user it belongs to.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<UserId, AuthError>;
}

/// Authenticator backed by a fixed token → user table.
///
/// Tokens are compared in constant time and every entry is checked, so
/// the lookup time does not depend on which (if any) entry matches.
pub struct StaticTokenAuthenticator {
    tokens: Vec<(Vec<u8>, UserId)>,
}

impl StaticTokenAuthenticator {
    pub fn new(tokens: &HashMap<String, UserId>) -> Self {
        Self {
            tokens: tokens
                .iter()
                .map(|(token, user)| (token.as_bytes().to_vec(), *user))
                .collect(),
        }
    }

    /// Number of configured tokens.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl std::fmt::Debug for StaticTokenAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the tokens themselves.
        f.debug_struct("StaticTokenAuthenticator")
            .field("tokens", &self.tokens.len())
            .finish()
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<UserId, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }

        let presented = token.as_bytes();
        let mut matched = None;
        for (candidate, user) in &self.tokens {
            if bool::from(candidate.as_slice().ct_eq(presented)) {
                matched = Some(*user);
            }
        }
        matched.ok_or(AuthError::InvalidToken)
    }
}

/// Decodes a base64 Ed25519 public key.
pub fn parse_public_key(public_key_base64: &str) -> Result<VerifyingKey, AuthError> {
    let bytes = BASE64_STANDARD
        .decode(public_key_base64.trim())
        .map_err(|_| AuthError::InvalidBase64("public_key"))?;
    let bytes: [u8; PUBLIC_KEY_LENGTH] =
        bytes.try_into().map_err(|_| AuthError::InvalidPublicKey)?;
    VerifyingKey::from_bytes(&bytes).map_err(|_| AuthError::InvalidPublicKey)
}

/// Verifies the Ed25519 signature a publisher attached to `message`.
///
/// `message` must be the exact request body bytes that were signed.
pub fn verify_signature(
    source_id: &str,
    signature_base64: &str,
    message: &[u8],
    public_keys: &HashMap<String, VerifyingKey>,
) -> Result<(), AuthError> {
    let verifying_key = public_keys
        .get(source_id)
        .ok_or_else(|| AuthError::unknown_source(source_id))?;

    let signature_bytes = BASE64_STANDARD
        .decode(signature_base64)
        .map_err(|_| AuthError::InvalidBase64("signature"))?;
    let signature_bytes: [u8; SIGNATURE_LENGTH] = signature_bytes
        .try_into()
        .map_err(|_| AuthError::InvalidSignature)?;
    let signature = Signature::from_bytes(&signature_bytes);

    verifying_key
        .verify_strict(message, &signature)
        .map_err(|_| AuthError::InvalidSignature)
}
