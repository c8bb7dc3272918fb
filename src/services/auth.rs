use bcrypt::verify;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::{
    config::AdminConfig,
    error::{AppError, AppResult},
};

const ADMIN_ROLE: &str = "admin";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String,  // admin username
    pub role: String, // always "admin"
    pub iss: String,  // issuer
    pub exp: i64,     // expiry
    pub iat: i64,     // issued at
}

#[derive(Debug, Serialize)]
pub struct AdminToken {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

pub struct AuthService {
    config: AdminConfig,
}

impl AuthService {
    pub fn new(config: AdminConfig) -> Self {
        Self { config }
    }

    /// Admin access needs both a password hash and a signing secret.
    pub fn is_enabled(&self) -> bool {
        !self.config.password_hash.is_empty() && !self.config.jwt_secret.is_empty()
    }

    /// Exchange the configured admin credential for a bearer token.
    pub fn login(&self, username: &str, password: &str) -> AppResult<AdminToken> {
        if !self.is_enabled() || username != self.config.username {
            return Err(AppError::InvalidCredentials);
        }

        let valid = verify(password, &self.config.password_hash).map_err(|e| {
            tracing::error!("Admin password hash is unusable: {}", e);
            AppError::InvalidCredentials
        })?;
        if !valid {
            tracing::warn!("Failed admin login for {}", username);
            return Err(AppError::InvalidCredentials);
        }

        self.issue_token(username)
    }

    pub fn validate_token(&self, token: &str) -> AppResult<Claims> {
        if !self.is_enabled() {
            return Err(AppError::InvalidToken);
        }

        let key = DecodingKey::from_secret(self.config.jwt_secret.as_bytes());
        let mut validation = Validation::default();
        validation.set_issuer(&[self.config.issuer.as_str()]);

        let token_data = decode::<Claims>(token, &key, &validation)?;
        if token_data.claims.role != ADMIN_ROLE {
            return Err(AppError::InvalidToken);
        }
        Ok(token_data.claims)
    }

    fn issue_token(&self, username: &str) -> AppResult<AdminToken> {
        let now = Utc::now();
        let expires_at = now + Duration::seconds(self.config.token_ttl.as_secs() as i64);

        let claims = Claims {
            sub: username.to_string(),
            role: ADMIN_ROLE.to_string(),
            iss: self.config.issuer.clone(),
            exp: expires_at.timestamp(),
            iat: now.timestamp(),
        };

        let key = EncodingKey::from_secret(self.config.jwt_secret.as_bytes());
        let access_token = encode(&Header::default(), &claims, &key)?;

        Ok(AdminToken {
            access_token,
            expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(password_hash: String) -> AdminConfig {
        AdminConfig {
            username: "admin".to_string(),
            password_hash,
            jwt_secret: "test-secret".to_string(),
            token_ttl: std::time::Duration::from_secs(3600),
            issuer: "sticker-gallery".to_string(),
        }
    }

    #[test]
    fn login_issues_a_token_that_validates() {
        let hash = bcrypt::hash("hunter2", 4).unwrap();
        let auth = AuthService::new(config(hash));

        let token = auth.login("admin", "hunter2").unwrap();
        let claims = auth.validate_token(&token.access_token).unwrap();
        assert_eq!(claims.sub, "admin");
        assert_eq!(claims.role, "admin");
    }

    #[test]
    fn wrong_password_or_user_is_rejected() {
        let hash = bcrypt::hash("hunter2", 4).unwrap();
        let auth = AuthService::new(config(hash));

        assert!(matches!(
            auth.login("admin", "nope"),
            Err(AppError::InvalidCredentials)
        ));
        assert!(matches!(
            auth.login("root", "hunter2"),
            Err(AppError::InvalidCredentials)
        ));
    }

    #[test]
    fn login_is_disabled_without_a_hash() {
        let auth = AuthService::new(config(String::new()));
        assert!(matches!(
            auth.login("admin", ""),
            Err(AppError::InvalidCredentials)
        ));
    }

    #[test]
    fn tokens_are_rejected_while_admin_is_disabled() {
        let hash = bcrypt::hash("hunter2", 4).unwrap();
        let token = AuthService::new(config(hash))
            .login("admin", "hunter2")
            .unwrap();

        // Same secret, but no password hash configured.
        let disabled = AuthService::new(config(String::new()));
        assert!(!disabled.is_enabled());
        assert!(matches!(
            disabled.validate_token(&token.access_token),
            Err(AppError::InvalidToken)
        ));
    }

    #[test]
    fn an_empty_secret_disables_login_and_validation() {
        let hash = bcrypt::hash("hunter2", 4).unwrap();
        let mut unsigned = config(hash.clone());
        unsigned.jwt_secret = String::new();
        let auth = AuthService::new(unsigned);

        assert!(matches!(
            auth.login("admin", "hunter2"),
            Err(AppError::InvalidCredentials)
        ));

        let token = jsonwebtoken::encode(
            &Header::default(),
            &Claims {
                sub: "attacker".to_string(),
                role: ADMIN_ROLE.to_string(),
                iss: "sticker-gallery".to_string(),
                exp: Utc::now().timestamp() + 3600,
                iat: Utc::now().timestamp(),
            },
            &EncodingKey::from_secret(b""),
        )
        .unwrap();
        assert!(auth.validate_token(&token).is_err());
    }

    #[test]
    fn tokens_from_another_secret_are_rejected() {
        let hash = bcrypt::hash("hunter2", 4).unwrap();
        let auth = AuthService::new(config(hash.clone()));
        let mut other = config(hash);
        other.jwt_secret = "other-secret".to_string();

        let token = AuthService::new(other).login("admin", "hunter2").unwrap();
        assert!(auth.validate_token(&token.access_token).is_err());
    }
}
