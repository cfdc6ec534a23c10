//! HS256 tokens carrying [`VisibilityClaims`].

use core::error::Error;

use jsonwebtoken::decode;
use jsonwebtoken::encode;
use jsonwebtoken::Algorithm;
use jsonwebtoken::DecodingKey;
use jsonwebtoken::EncodingKey;
use jsonwebtoken::Header;
use jsonwebtoken::Validation;

use crate::VisibilityClaims;

#[derive(Debug, derive_more::Display)]
pub enum TokenError {
    #[display("Invalid token: {reason}")]
    Invalid { reason: String },
    #[display("Failed to sign token: {reason}")]
    Sign { reason: String },
}

impl Error for TokenError {}

pub fn sign(claims: &VisibilityClaims, secret: &[u8]) -> Result<String, TokenError> {
    encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(secret),
    )
    .map_err(|e| TokenError::Sign {
        reason: e.to_string(),
    })
}

/// Checks the signature and, when present, the expiry of `token`.
pub fn verify(token: &str, secret: &[u8]) -> Result<VisibilityClaims, TokenError> {
    let mut validation = Validation::new(Algorithm::HS256);
    // exp is enforced only when present
    validation.required_spec_claims.clear();
    validation.validate_exp = true;

    decode::<VisibilityClaims>(token, &DecodingKey::from_secret(secret), &validation)
        .map(|data| data.claims)
        .map_err(|e| TokenError::Invalid {
            reason: e.to_string(),
        })
}
