use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};

use crate::error::AuthError;
use crate::models::auth::TokenClaims;

/// Encodes and verifies compact `header.payload.signature` tokens (HS256).
/// Pure function of its inputs and the clock: no storage, no user lookup.
pub struct TokenCodec;

impl TokenCodec {
    /// Serialize and sign the claims. Deterministic for identical inputs.
    pub fn encode(claims: &TokenClaims, secret: &[u8]) -> Result<String, AuthError> {
        jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(secret),
        )
        .map_err(|_| AuthError::InvalidToken)
    }

    /// Verify the signature and parse the payload. Fails with `InvalidToken`
    /// on any structural or signature problem, `TokenExpired` when `exp` is
    /// in the past.
    pub fn decode(token: &str, secret: &[u8]) -> Result<TokenClaims, AuthError> {
        Self::decode_at(token, secret, Utc::now().timestamp())
    }

    /// Expiry is evaluated against the supplied clock with zero leeway.
    pub(crate) fn decode_at(
        token: &str,
        secret: &[u8],
        now: i64,
    ) -> Result<TokenClaims, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        // The signature check stays inside jsonwebtoken (constant-time);
        // expiry is checked below against the caller's clock.
        validation.validate_exp = false;
        let data = jsonwebtoken::decode::<TokenClaims>(
            token,
            &DecodingKey::from_secret(secret),
            &validation,
        )
        .map_err(|_| AuthError::InvalidToken)?;
        if (data.claims.exp as i64) < now {
            return Err(AuthError::TokenExpired);
        }
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"test-signing-secret";

    fn claims_expiring_at(exp: usize) -> TokenClaims {
        let mut extra = serde_json::Map::new();
        extra.insert("team".into(), serde_json::json!("seniors"));
        TokenClaims {
            iss: "https://clubhouse.local".into(),
            iat: exp.saturating_sub(900),
            exp,
            user_id: 42,
            username: Some("anna".into()),
            email: Some("anna@example.org".into()),
            roles: vec!["coach".into()],
            extra,
        }
    }

    #[test]
    fn round_trip_preserves_claims() {
        let exp = Utc::now().timestamp() as usize + 900;
        let claims = claims_expiring_at(exp);
        let token = TokenCodec::encode(&claims, SECRET).unwrap();
        let decoded = TokenCodec::decode(&token, SECRET).unwrap();
        assert_eq!(decoded, claims);
    }

    #[test]
    fn encoding_is_deterministic() {
        let claims = claims_expiring_at(Utc::now().timestamp() as usize + 900);
        let a = TokenCodec::encode(&claims, SECRET).unwrap();
        let b = TokenCodec::encode(&claims, SECRET).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let claims = claims_expiring_at(Utc::now().timestamp() as usize + 900);
        let token = TokenCodec::encode(&claims, SECRET).unwrap();

        // Flip one character in the signature segment
        let dot = token.rfind('.').unwrap();
        let mut bytes = token.into_bytes();
        let target = dot + 1 + (bytes.len() - dot - 1) / 2;
        bytes[target] = if bytes[target] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(bytes).unwrap();

        assert!(matches!(
            TokenCodec::decode(&tampered, SECRET),
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let claims = claims_expiring_at(Utc::now().timestamp() as usize + 900);
        let token = TokenCodec::encode(&claims, SECRET).unwrap();
        assert!(matches!(
            TokenCodec::decode(&token, b"another-secret"),
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn wrong_segment_count_is_rejected() {
        assert!(matches!(
            TokenCodec::decode("only.two", SECRET),
            Err(AuthError::InvalidToken)
        ));
        assert!(matches!(
            TokenCodec::decode("a.b.c.d", SECRET),
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn expired_token_is_rejected_even_with_valid_signature() {
        let now = Utc::now().timestamp();
        let claims = claims_expiring_at((now - 1) as usize);
        let token = TokenCodec::encode(&claims, SECRET).unwrap();
        assert!(matches!(
            TokenCodec::decode(&token, SECRET),
            Err(AuthError::TokenExpired)
        ));
    }

    #[test]
    fn expiry_is_exact_with_no_leeway() {
        let now = Utc::now().timestamp();
        let claims = claims_expiring_at((now + 900) as usize);
        let token = TokenCodec::encode(&claims, SECRET).unwrap();

        assert!(TokenCodec::decode_at(&token, SECRET, now + 900).is_ok());
        assert!(matches!(
            TokenCodec::decode_at(&token, SECRET, now + 901),
            Err(AuthError::TokenExpired)
        ));
    }
}
