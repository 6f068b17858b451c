use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WebClientError {
    #[error("jwt signing failed: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("credentials service request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("credentials service returned {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("no jwt secret configured")]
    NoSecret,
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    sub: &'a str,
    exp: i64,
    iat: i64,
}

const TOKEN_LIFETIME_SECONDS: i64 = 300;

/// JWT-authenticated HTTP client for the credentials service.
///
/// Tokens are HS256, signed with the shared secret from config, and assert
/// only the requesting user plus a short expiry.
pub struct CredentialsWebClient {
    url: String,
    secret: String,
    client: reqwest::Client,
}

impl CredentialsWebClient {
    pub fn new(url: impl Into<String>, secret: Option<String>) -> Result<Self, WebClientError> {
        Ok(Self {
            url: url.into(),
            secret: secret.ok_or(WebClientError::NoSecret)?,
            client: reqwest::Client::new(),
        })
    }

    fn token(&self, requesting_user: &str) -> Result<String, WebClientError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: requesting_user,
            exp: now + TOKEN_LIFETIME_SECONDS,
            iat: now,
        };
        Ok(encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )?)
    }

    /// POST a JSON payload to the given path on the credentials service.
    pub async fn post(
        &self,
        path: &str,
        requesting_user: &str,
        payload: &Value,
    ) -> Result<Value, WebClientError> {
        let token = self.token(requesting_user)?;
        let url = format!("{}{}", self.url, path.trim_start_matches('/'));

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(WebClientError::Rejected {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{decode, DecodingKey, Validation};
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct DecodedClaims {
        sub: String,
        exp: i64,
    }

    #[test]
    fn test_requires_secret() {
        assert!(matches!(
            CredentialsWebClient::new("http://localhost:8080/", None),
            Err(WebClientError::NoSecret)
        ));
    }

    #[test]
    fn test_token_claims() {
        let client =
            CredentialsWebClient::new("http://localhost:8080/", Some("super.secret".into()))
                .unwrap();
        let token = client.token("user1").unwrap();

        let decoded = decode::<DecodedClaims>(
            &token,
            &DecodingKey::from_secret(b"super.secret"),
            &Validation::default(),
        )
        .unwrap();

        assert_eq!(decoded.claims.sub, "user1");
        assert!(decoded.claims.exp > Utc::now().timestamp());
    }
}
