use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::str::FromStr;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Field that carries the signature itself and is never part of the signed string.
pub const SIGN_FIELD: &str = "sign";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignType {
    #[default]
    Md5,
    HmacSha256,
}

impl SignType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Md5 => "MD5",
            Self::HmacSha256 => "HMAC-SHA256",
        }
    }
}

impl FromStr for SignType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "MD5" => Ok(Self::Md5),
            "HMAC-SHA256" => Ok(Self::HmacSha256),
            other => Err(anyhow::anyhow!("Unsupported sign type: {}", other)),
        }
    }
}

/// Builds `k1=v1&k2=v2&...&key=<api_key>` over the non-empty fields in key
/// order, skipping the signature field.
fn canonical_string(params: &BTreeMap<String, String>, api_key: &str) -> String {
    let mut joined = params
        .iter()
        .filter(|(k, v)| k.as_str() != SIGN_FIELD && !v.is_empty())
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");
    if !joined.is_empty() {
        joined.push('&');
    }
    joined.push_str("key=");
    joined.push_str(api_key);
    joined
}

/// Generate a sorted-parameter signature as uppercase hex.
pub fn sign_params(
    params: &BTreeMap<String, String>,
    api_key: &str,
    sign_type: SignType,
) -> Result<String, anyhow::Error> {
    let payload = canonical_string(params, api_key);

    let digest = match sign_type {
        SignType::Md5 => hex::encode(Md5::digest(payload.as_bytes())),
        SignType::HmacSha256 => {
            let mut mac = HmacSha256::new_from_slice(api_key.as_bytes())
                .map_err(|e| anyhow::anyhow!("Invalid key length: {}", e))?;
            mac.update(payload.as_bytes());
            hex::encode(mac.finalize().into_bytes())
        }
    };

    Ok(digest.to_uppercase())
}

/// Verify a sorted-parameter signature using constant-time comparison.
pub fn verify_params(
    params: &BTreeMap<String, String>,
    api_key: &str,
    sign_type: SignType,
    signature: &str,
) -> Result<bool, anyhow::Error> {
    let expected_signature = sign_params(params, api_key, sign_type)?;

    // Hex digests compare case-insensitively.
    let supplied = signature.trim().to_ascii_uppercase();
    let expected_bytes = expected_signature.as_bytes();
    let signature_bytes = supplied.as_bytes();

    if expected_bytes.len() != signature_bytes.len() {
        return Ok(false);
    }

    Ok(expected_bytes.ct_eq(signature_bytes).into())
}
