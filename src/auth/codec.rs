// Client-side JWT payload decoding
// No signature check: this is a convenience read of the claims, not a trust boundary

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::types::Identity;
use crate::error::DecodeError;

/// Claims read from a bearer token
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedClaims {
    /// `None` means the token carries no expiry; never schedule a refresh for it
    pub expires_at: Option<DateTime<Utc>>,
    /// `sub`, or WordPress's `data.user.id`
    pub subject: Option<String>,
    pub raw: Value,
}

impl DecodedClaims {
    /// Whether the token is past its expiry at `now`. Unknown expiry never expires.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |exp| exp <= now)
    }

    /// Minimal identity derivable from the claims alone
    pub fn identity(&self) -> Option<Identity> {
        let id = self.subject.clone()?;
        let claim_str = |name: &str| {
            self.raw
                .get(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let roles = self
            .raw
            .get("roles")
            .and_then(Value::as_array)
            .map(|roles| {
                roles
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Some(Identity {
            id,
            display_name: claim_str("name"),
            email: claim_str("email"),
            roles,
        })
    }
}

/// Decode a bearer token into its claims
pub fn decode(token: &str) -> Result<DecodedClaims, DecodeError> {
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != 3 {
        return Err(DecodeError::Malformed(format!(
            "expected 3 segments, got {}",
            segments.len()
        )));
    }

    let payload = URL_SAFE_NO_PAD
        .decode(segments[1].trim_end_matches('='))
        .map_err(|e| DecodeError::Malformed(format!("payload is not base64url: {}", e)))?;

    let raw: Value = serde_json::from_slice(&payload)
        .map_err(|e| DecodeError::Malformed(format!("payload is not JSON: {}", e)))?;

    if !raw.is_object() {
        return Err(DecodeError::Malformed(
            "payload is not a JSON object".to_string(),
        ));
    }

    let expires_at = match raw.get("exp") {
        None | Some(Value::Null) => None,
        Some(exp) => Some(expiry_from_claim(exp)?),
    };

    Ok(DecodedClaims {
        expires_at,
        subject: subject_from_claims(&raw),
        raw,
    })
}

/// Convert an `exp` claim (seconds since epoch) to an instant
fn expiry_from_claim(exp: &Value) -> Result<DateTime<Utc>, DecodeError> {
    let millis = if let Some(secs) = exp.as_i64() {
        secs.checked_mul(1000)
    } else if let Some(secs) = exp.as_f64() {
        let millis = (secs * 1000.0).round();
        millis.is_finite().then_some(millis as i64)
    } else {
        return Err(DecodeError::Malformed(format!(
            "exp claim is not numeric: {}",
            exp
        )));
    };

    millis
        .and_then(DateTime::from_timestamp_millis)
        .ok_or_else(|| DecodeError::Malformed(format!("exp claim out of range: {}", exp)))
}

fn subject_from_claims(raw: &Value) -> Option<String> {
    let sub = raw.get("sub").or_else(|| raw.pointer("/data/user/id"))?;
    match sub {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
