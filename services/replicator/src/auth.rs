//! Auth Module (§4.5): mints a signed service assertion and exchanges it
//! for a session/secret pair at the provider's token endpoint.
//!
//! The assertion is a JWT with issuer, audience, issued-at, and a 1-hour
//! expiry, signed HS256 over the provider secret. The exchange is a
//! `POST application/x-www-form-urlencoded` carrying
//! `grant_type=urn:ietf:params:oauth:grant-type:jwt-bearer&assertion=<jwt>`.

use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Credentials read once at startup from the file named by
/// `process.replication.oauth2`.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderCredentials {
    pub key_id: String,
    /// Shared secret the assertion is signed with (HS256).
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    pub token_endpoint: String,
}

#[derive(Debug, Serialize)]
struct Claims {
    iss: String,
    aud: String,
    iat: i64,
    exp: i64,
}

/// Result of a successful token exchange: the session/secret pair stored
/// on the controller and forwarded to every Peer Client.
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeResult {
    pub session: String,
    pub secret: String,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("failed to mint service assertion: {0}")]
    Mint(#[from] jsonwebtoken::errors::Error),
    #[error("token exchange request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("token endpoint returned status {0}")]
    NonSuccessStatus(reqwest::StatusCode),
}

/// Build the signed JWT assertion for `creds`, valid for 1 hour from now.
pub fn mint_assertion(creds: &ProviderCredentials) -> Result<String, AuthError> {
    let now = Utc::now().timestamp();
    let claims = Claims {
        iss: creds.issuer.clone(),
        aud: creds.audience.clone(),
        iat: now,
        exp: now + 3600,
    };
    let mut header = Header::default();
    header.kid = Some(creds.key_id.clone());
    let token = encode(&header, &claims, &EncodingKey::from_secret(creds.secret.as_bytes()))?;
    Ok(token)
}

/// Exchange the assertion for a session/secret pair at `creds.token_endpoint`.
///
/// On success, the caller is responsible for setting `status = Authorized`
/// and `checkDate = now + 55m` (§4.5's re-auth schedule).
pub async fn exchange_for_session(
    client: &reqwest::Client,
    creds: &ProviderCredentials,
) -> Result<ExchangeResult, AuthError> {
    let assertion = mint_assertion(creds)?;
    let response = client
        .post(&creds.token_endpoint)
        .form(&[("grant_type", GRANT_TYPE), ("assertion", &assertion)])
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(AuthError::NonSuccessStatus(response.status()));
    }

    let result: ExchangeResult = response.json().await?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> ProviderCredentials {
        ProviderCredentials {
            key_id: "k1".to_owned(),
            secret: "shared-secret".to_owned(),
            issuer: "replication-controller".to_owned(),
            audience: "https://auth.example.com".to_owned(),
            token_endpoint: "https://auth.example.com/token".to_owned(),
        }
    }

    #[test]
    fn mint_assertion_produces_a_three_part_jwt() {
        let token = mint_assertion(&creds()).unwrap();
        assert_eq!(token.split('.').count(), 3);
    }

    #[test]
    fn mint_assertion_embeds_issuer_and_audience_claims() {
        let token = mint_assertion(&creds()).unwrap();
        let parts: Vec<&str> = token.split('.').collect();
        use base64::Engine;
        let payload_json = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(parts[1])
            .unwrap();
        let payload: serde_json::Value = serde_json::from_slice(&payload_json).unwrap();
        assert_eq!(payload["iss"], "replication-controller");
        assert_eq!(payload["aud"], "https://auth.example.com");
        assert_eq!(payload["exp"].as_i64().unwrap() - payload["iat"].as_i64().unwrap(), 3600);
    }
}
