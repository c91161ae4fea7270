//! Signed query strings for unsubscribe links.
//!
//! A link carries its parameters followed by `_signature`, the hex encoded
//! HMAC-SHA256 of everything before it:
//!
//! ```text
//! email=test%40example.com&doctype=User&name=Administrator&_signature=9f86d0…
//! ```

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::QueueError;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_PARAM: &str = "&_signature=";

fn mac(secret: &str) -> Result<HmacSha256, QueueError> {
    if secret.is_empty() {
        return Err(QueueError::MissingSigningSecret);
    }
    HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| QueueError::InvalidSignature)
}

/// Hex signature of `payload`
///
/// # Errors
/// [`QueueError::MissingSigningSecret`] if `secret` is empty
pub fn sign(secret: &str, payload: &str) -> Result<String, QueueError> {
    let mut mac = mac(secret)?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Encode `params` and append their signature
///
/// # Errors
/// See [`sign`]
pub fn signed_query(secret: &str, params: &[(&str, &str)]) -> Result<String, QueueError> {
    let payload = params
        .iter()
        .map(|(key, value)| format!("{key}={}", urlencoding::encode(value)))
        .collect::<Vec<_>>()
        .join("&");
    let signature = sign(secret, &payload)?;
    Ok(format!("{payload}{SIGNATURE_PARAM}{signature}"))
}

/// Check the signature of a query string and decode its parameters
///
/// A leading `?` is ignored. The comparison is constant time.
///
/// # Errors
/// - [`QueueError::InvalidSignature`] if the signature is missing, malformed,
///   or does not match
/// - [`QueueError::MissingSigningSecret`] if `secret` is empty
pub fn verify_query(secret: &str, query: &str) -> Result<Vec<(String, String)>, QueueError> {
    let query = query.trim().trim_start_matches('?');
    let (payload, signature) = query
        .rsplit_once(SIGNATURE_PARAM)
        .ok_or(QueueError::InvalidSignature)?;
    let signature = hex::decode(signature).map_err(|_| QueueError::InvalidSignature)?;

    let mut mac = mac(secret)?;
    mac.update(payload.as_bytes());
    mac.verify_slice(&signature)
        .map_err(|_| QueueError::InvalidSignature)?;

    payload
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let value = urlencoding::decode(value).map_err(|_| QueueError::InvalidSignature)?;
            Ok((key.to_string(), value.into_owned()))
        })
        .collect()
}
