use actix_web::{dev::Payload, Error, FromRequest, HttpRequest};
use actix_web_httpauth::extractors::bearer::BearerAuth;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::env;
use std::future::{ready, Ready};

/// Author recorded on posts submitted without a token.
pub const ANONYMOUS: &str = "anonymous";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    #[error("JWT_SECRET not set")]
    MissingSecret,
    #[error(transparent)]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

fn secret() -> Result<String, AuthError> {
    env::var("JWT_SECRET").map_err(|_| AuthError::MissingSecret)
}

/// Validate a JWT and return its claims.
fn decode_jwt(token: &str) -> Result<Claims, AuthError> {
    let secret = secret()?;
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    let data = decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)?;
    Ok(data.claims)
}

/// Extractor yielding validated `Claims`. Use `Option<Auth>` for the
/// "current user or nobody" accessor.
pub struct Auth(pub Claims);

impl Auth {
    pub fn subject(&self) -> &str {
        &self.0.sub
    }
}

/// Identity a request acts as: the token subject, or [`ANONYMOUS`].
pub fn current_user(auth: Option<&Auth>) -> &str {
    auth.map(Auth::subject).unwrap_or(ANONYMOUS)
}

impl FromRequest for Auth {
    type Error = Error;
    type Future = Ready<Result<Self, Error>>;

    fn from_request(req: &HttpRequest, pl: &mut Payload) -> Self::Future {
        if let Ok(bearer) = BearerAuth::from_request(req, pl).into_inner() {
            return match decode_jwt(bearer.token()) {
                Ok(claims) => ready(Ok(Auth(claims))),
                Err(_) => ready(Err(actix_web::error::ErrorUnauthorized("Invalid JWT"))),
            };
        }
        ready(Err(actix_web::error::ErrorUnauthorized("Authorization required")))
    }
}

/// Issue a 24h token for `subject`.
pub fn create_jwt(subject: &str, email: Option<&str>) -> Result<String, AuthError> {
    let secret = secret()?;
    let expiration = (chrono::Utc::now() + chrono::Duration::hours(24)).timestamp() as usize;
    let claims = Claims { sub: subject.to_string(), exp: expiration, email: email.map(str::to_string) };
    Ok(encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes()))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[serial_test::serial]
    fn token_round_trips_subject() {
        env::set_var("JWT_SECRET", "test-secret-must-be-32-bytes-long!!");
        let token = create_jwt("user-42", Some("a@example.org")).unwrap();
        let claims = decode_jwt(&token).unwrap();
        assert_eq!(claims.sub, "user-42");
        assert_eq!(claims.email.as_deref(), Some("a@example.org"));
        assert!(decode_jwt("not-a-token").is_err());
    }

    #[test]
    fn anonymous_without_auth() {
        assert_eq!(current_user(None), ANONYMOUS);
    }
}
