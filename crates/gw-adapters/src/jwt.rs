//! HS256 bearer token validation, per §4.A.
//!
//! Grounded in the teacher's `sr-api::auth::OidcProvider`, simplified
//! from RS256 + JWKS fetch down to HS256 with a shared secret per
//! spec §6 (`jwt.secret`), and generalized from Zitadel's role/claim
//! shape to `pub`/`subscribe` subject pattern lists.

use gw_domain::config::JwtConfig;
use gw_domain::device_context::{DeviceContext, RawClaims, Role};
use gw_domain::errors::AuthTokenError;
use gw_ports::TokenValidator;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};

pub struct JwtTokenValidator {
    decoding_key: DecodingKey,
    validation: Validation,
    expected_audience: Option<String>,
}

impl JwtTokenValidator {
    pub fn new(config: &JwtConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = config.clock_skew.as_secs();
        validation.validate_nbf = true;
        if let Some(issuer) = &config.issuer {
            validation.set_issuer(&[issuer]);
        }
        if let Some(audience) = &config.audience {
            validation.set_audience(&[audience]);
        }
        // `aud` is checked manually below against `AudienceClaim`'s
        // string-or-array shape; jsonwebtoken's own audience check
        // only understands a plain string claim.
        validation.validate_aud = false;

        Self {
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
            expected_audience: config.audience.clone(),
        }
    }
}

impl TokenValidator for JwtTokenValidator {
    async fn validate(&self, token: &str) -> Result<DeviceContext, AuthTokenError> {
        if token.is_empty() {
            return Err(AuthTokenError::MissingToken);
        }

        let token_data = decode::<RawClaims>(token, &self.decoding_key, &self.validation)
            .map_err(map_jwt_error)?;
        let claims = token_data.claims;

        if let Some(expected) = &self.expected_audience {
            match &claims.aud {
                Some(aud) if aud.contains(expected) => {}
                _ => return Err(AuthTokenError::WrongAudience),
            }
        }

        let client_id = match claims.sub {
            Some(sub) if !sub.is_empty() => sub,
            _ => {
                return Err(AuthTokenError::MissingSubject {
                    claim: "sub".to_string(),
                })
            }
        };

        let pub_patterns = claims.pub_.map(|p| p.into_patterns()).unwrap_or_default();
        let sub_patterns = claims
            .subscribe
            .map(|p| p.into_patterns())
            .unwrap_or_default();

        let expires_at = chrono::DateTime::from_timestamp(claims.exp, 0)
            .ok_or_else(|| AuthTokenError::MalformedToken {
                reason: "exp claim out of range".to_string(),
            })?;

        Ok(DeviceContext {
            client_id,
            role: claims.role.map(Role).unwrap_or_default(),
            pub_patterns,
            sub_patterns,
            expires_at,
        })
    }
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthTokenError {
    use jsonwebtoken::errors::ErrorKind::*;
    match err.kind() {
        ExpiredSignature => AuthTokenError::Expired,
        InvalidSignature => AuthTokenError::BadSignature,
        InvalidIssuer => AuthTokenError::WrongIssuer,
        InvalidAudience => AuthTokenError::WrongAudience,
        MissingRequiredClaim(claim) if claim == "sub" => AuthTokenError::MissingSubject {
            claim: claim.clone(),
        },
        _ => AuthTokenError::MalformedToken {
            reason: err.to_string(),
        },
    }
}
