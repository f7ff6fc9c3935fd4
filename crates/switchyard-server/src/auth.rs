//! Token verification boundary.
//!
//! Token issuance lives outside Switchyard. Tiers only ask a
//! [`TokenVerifier`] to turn a presented token into [`Claims`]. The static
//! table verifier exists so the binary runs without an external identity
//! service.

use async_trait::async_trait;
use std::collections::HashMap;
use switchyard_protocol::InstanceType;
use thiserror::Error;

use crate::config::AuthConfig;

/// Identity asserted by a verified token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    /// User id, or instance id for tier tokens.
    pub subject: String,
    /// Set for tier tokens only.
    pub instance_type: Option<InstanceType>,
    pub device_id: String,
    pub platform: String,
}

impl Claims {
    /// Claims for an edge user.
    #[must_use]
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            subject: user_id.into(),
            instance_type: None,
            device_id: String::new(),
            platform: String::new(),
        }
    }

    /// Claims for a tier instance.
    #[must_use]
    pub fn instance(instance_type: InstanceType, instance_id: impl Into<String>) -> Self {
        Self {
            subject: instance_id.into(),
            instance_type: Some(instance_type),
            device_id: String::new(),
            platform: String::new(),
        }
    }

    /// Whether these claims belong to a tier instance.
    #[must_use]
    pub fn is_instance(&self) -> bool {
        self.instance_type.is_some()
    }

    /// Check that these claims name exactly `instance_type:instance_id`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::IdentityMismatch`] for user claims or another
    /// instance's claims.
    pub fn ensure_instance(
        &self,
        instance_type: InstanceType,
        instance_id: &str,
    ) -> Result<(), AuthError> {
        if self.instance_type == Some(instance_type) && self.subject == instance_id {
            Ok(())
        } else {
            Err(AuthError::IdentityMismatch(format!("{instance_type}:{instance_id}")))
        }
    }
}

/// Authentication errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// Unknown, malformed or expired token.
    #[error("Invalid token")]
    InvalidToken,

    /// The token is valid but names a different identity.
    #[error("Token does not belong to {0}")]
    IdentityMismatch(String),

    /// Bad entry in the token table.
    #[error("Invalid token entry: {0}")]
    InvalidEntry(String),
}

/// Verifies connect-time tokens.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Resolve `token` into claims.
    async fn verify(&self, token: &str) -> Result<Claims, AuthError>;
}

/// Verifier backed by a fixed token table.
#[derive(Debug, Default)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, Claims>,
}

impl StaticTokenVerifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the `[auth]` config section.
    ///
    /// # Errors
    ///
    /// Returns an error if an entry names an unknown instance type.
    pub fn from_config(config: &AuthConfig) -> Result<Self, AuthError> {
        let mut verifier = Self::new();
        for entry in &config.tokens {
            let instance_type = entry
                .instance_type
                .as_deref()
                .map(|t| {
                    t.parse::<InstanceType>()
                        .map_err(|_| AuthError::InvalidEntry(format!("instance type {t}")))
                })
                .transpose()?;
            verifier.tokens.insert(
                entry.token.clone(),
                Claims {
                    subject: entry.subject.clone(),
                    instance_type,
                    device_id: entry.device_id.clone(),
                    platform: entry.platform.clone(),
                },
            );
        }
        Ok(verifier)
    }

    /// Accept `token` as `claims`.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>, claims: Claims) -> Self {
        self.tokens.insert(token.into(), claims);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        if token.is_empty() {
            return Err(AuthError::InvalidToken);
        }
        self.tokens.get(token).cloned().ok_or(AuthError::InvalidToken)
    }
}
