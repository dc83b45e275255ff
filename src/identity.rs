use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

use crate::error::JamError;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Identity provider denied the token (status {0})")]
    Denied(u16),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl From<IdentityError> for JamError {
    fn from(e: IdentityError) -> Self {
        JamError::Identity(e.to_string())
    }
}

/// A verified or guest principal. Guests carry a sanitized nickname and
/// `authenticated: false`; verified subjects carry the provider's user id.
#[derive(Debug, Clone)]
pub struct Subject {
    pub id: String,
    pub display_name: String,
    pub authenticated: bool,
}

/// Thin client for the external identity provider. The provider is treated
/// as an opaque source of a subject id and a display name.
pub struct IdentityClient {
    client: Client,
    base_url: String,
}

#[derive(Deserialize)]
struct UserResponse {
    id: String,
    email: Option<String>,
    user_metadata: Option<UserMetadata>,
}

#[derive(Deserialize)]
struct UserMetadata {
    nickname: Option<String>,
}

impl IdentityClient {
    pub fn new(base_url: String, timeout_ms: u64) -> Result<Self, IdentityError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(IdentityError::Http)?;

        Ok(Self { client, base_url })
    }

    /// Exchanges a bearer token for the subject behind it.
    pub async fn verify(&self, token: &str) -> Result<Subject, IdentityError> {
        let response = self
            .client
            .get(format!("{}/auth/v1/user", self.base_url))
            .bearer_auth(token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(IdentityError::Denied(response.status().as_u16()));
        }

        let user: UserResponse = response.json().await?;
        if user.id.trim().is_empty() {
            return Err(IdentityError::InvalidResponse("missing user id".into()));
        }

        let nickname = user.user_metadata.and_then(|m| m.nickname);
        Ok(Subject {
            id: user.id,
            display_name: resolve_display_name(nickname, user.email),
            authenticated: true,
        })
    }
}

/// Nickname wins, then the email local part, then a generic fallback.
fn resolve_display_name(nickname: Option<String>, email: Option<String>) -> String {
    if let Some(name) = nickname {
        let name = name.trim().to_string();
        if !name.is_empty() {
            return name;
        }
    }
    if let Some(email) = email {
        let local = email.split('@').next().unwrap_or("").trim().to_string();
        if !local.is_empty() {
            return local;
        }
    }
    "player".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nickname_takes_priority() {
        let name = resolve_display_name(
            Some("Hooper".to_string()),
            Some("luca@example.com".to_string()),
        );
        assert_eq!(name, "Hooper");
    }

    #[test]
    fn email_local_part_backs_up_missing_nickname() {
        let name = resolve_display_name(None, Some("luca@example.com".to_string()));
        assert_eq!(name, "luca");
    }

    #[test]
    fn blank_everything_falls_back_to_generic() {
        assert_eq!(resolve_display_name(Some("  ".to_string()), None), "player");
        assert_eq!(
            resolve_display_name(None, Some("@example.com".to_string())),
            "player"
        );
        assert_eq!(resolve_display_name(None, None), "player");
    }
}
