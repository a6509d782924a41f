//! # cf-auth-jwt
//!
//! `IdentityVerifier` over HS256-signed JSON Web Tokens issued by the
//! identity provider. Signature, expiry and (when configured) issuer and
//! audience are checked locally, so this verifier never reports the
//! provider as unreachable.

use async_trait::async_trait;
use cf_core::error::IdentityError;
use cf_core::models::IdentityClaims;
use cf_core::traits::IdentityVerifier;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// Claims the provider puts in its tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderClaims {
    pub sub: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub picture: Option<String>,
    pub exp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
}

impl From<ProviderClaims> for IdentityClaims {
    fn from(claims: ProviderClaims) -> Self {
        Self {
            subject: claims.sub,
            display_name: claims.name,
            email: claims.email,
            avatar_url: claims.picture,
        }
    }
}

pub struct JwtIdentityVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtIdentityVerifier {
    pub fn hs256(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    pub fn with_issuer(mut self, issuer: &str) -> Self {
        self.validation.set_issuer(&[issuer]);
        self
    }

    pub fn with_audience(mut self, audience: &str) -> Self {
        self.validation.set_audience(&[audience]);
        self.validation.validate_aud = true;
        self
    }
}

#[async_trait]
impl IdentityVerifier for JwtIdentityVerifier {
    async fn verify(&self, token: &str) -> Result<IdentityClaims, IdentityError> {
        let data = decode::<ProviderClaims>(token, &self.key, &self.validation).map_err(|e| {
            tracing::debug!(error = %e, "identity token rejected");
            IdentityError::Invalid(e.to_string())
        })?;
        if data.claims.sub.trim().is_empty() {
            return Err(IdentityError::Invalid("token has an empty subject".into()));
        }
        Ok(data.claims.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &[u8] = b"test-secret-that-is-long-enough";

    fn claims(exp_offset_secs: i64) -> ProviderClaims {
        ProviderClaims {
            sub: "google-oauth2|1234".into(),
            name: Some("Carla".into()),
            email: Some("carla@example.org".into()),
            picture: None,
            exp: (chrono::Utc::now().timestamp() + exp_offset_secs) as u64,
            iss: Some("https://id.example.org".into()),
            aud: Some("civic-fix".into()),
        }
    }

    fn sign(claims: &ProviderClaims, secret: &[u8]) -> String {
        encode(&Header::default(), claims, &EncodingKey::from_secret(secret)).unwrap()
    }

    #[tokio::test]
    async fn valid_token_yields_profile() {
        let verifier = JwtIdentityVerifier::hs256(SECRET)
            .with_issuer("https://id.example.org")
            .with_audience("civic-fix");
        let identity = verifier.verify(&sign(&claims(3600), SECRET)).await.unwrap();
        assert_eq!(identity.subject, "google-oauth2|1234");
        assert_eq!(identity.display_name.as_deref(), Some("Carla"));
        assert_eq!(identity.email.as_deref(), Some("carla@example.org"));
    }

    #[tokio::test]
    async fn wrong_secret_is_invalid() {
        let verifier = JwtIdentityVerifier::hs256(SECRET);
        let err = verifier
            .verify(&sign(&claims(3600), b"someone-elses-secret-entirely"))
            .await
            .unwrap_err();
        assert!(matches!(err, IdentityError::Invalid(_)));
    }

    #[tokio::test]
    async fn expired_token_is_invalid() {
        let verifier = JwtIdentityVerifier::hs256(SECRET);
        let err = verifier.verify(&sign(&claims(-3600), SECRET)).await.unwrap_err();
        assert!(matches!(err, IdentityError::Invalid(_)));
    }

    #[tokio::test]
    async fn audience_mismatch_is_invalid() {
        let verifier = JwtIdentityVerifier::hs256(SECRET).with_audience("another-app");
        let err = verifier.verify(&sign(&claims(3600), SECRET)).await.unwrap_err();
        assert!(matches!(err, IdentityError::Invalid(_)));
    }

    #[tokio::test]
    async fn garbage_is_invalid() {
        let verifier = JwtIdentityVerifier::hs256(SECRET);
        let err = verifier.verify("not.a.jwt").await.unwrap_err();
        assert!(matches!(err, IdentityError::Invalid(_)));
    }
}
