use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Protected header of the detached JWS produced for webhooks without a
/// secret key.
const JWS_HEADER: &str = r#"{"alg":"HS256","b64":false,"crit":["b64"]}"#;

/// Signature sent with every delivery.
///
/// With a webhook secret this is the hex HMAC-SHA256 of the payload.
/// Without one, a detached JWS (`<header>..<signature>`) keyed by the
/// app-wide default key is produced so receivers can always verify.
pub fn signature_for_payload(payload: &[u8], secret_key: Option<&str>, default_key: &[u8]) -> String {
    match secret_key {
        Some(secret) if !secret.is_empty() => compute_signature(secret.as_bytes(), payload),
        _ => detached_jws(default_key, payload),
    }
}

/// Compute hex HMAC-SHA256 of the payload.
pub fn compute_signature(secret: &[u8], payload: &[u8]) -> String {
    hex::encode(hmac_bytes(secret, &[payload]))
}

fn hmac_bytes(key: &[u8], parts: &[&[u8]]) -> Vec<u8> {
    // HMAC accepts keys of any length.
    let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
        return Vec::new();
    };
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().to_vec()
}

fn detached_jws(key: &[u8], payload: &[u8]) -> String {
    let header = URL_SAFE_NO_PAD.encode(JWS_HEADER);
    let signature = hmac_bytes(key, &[header.as_bytes(), &b"."[..], payload]);
    format!("{}..{}", header, URL_SAFE_NO_PAD.encode(signature))
}

/// Verify a received signature in either format.
pub fn verify_signature(payload: &[u8], secret_key: Option<&str>, default_key: &[u8], signature: &str) -> bool {
    match secret_key {
        Some(secret) if !secret.is_empty() => {
            let Ok(expected) = hex::decode(signature) else {
                return false;
            };
            let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
                return false;
            };
            mac.update(payload);
            mac.verify_slice(&expected).is_ok()
        }
        _ => {
            let Some((header, rest)) = signature.split_once("..") else {
                return false;
            };
            let Ok(expected) = URL_SAFE_NO_PAD.decode(rest) else {
                return false;
            };
            let Ok(mut mac) = HmacSha256::new_from_slice(default_key) else {
                return false;
            };
            mac.update(header.as_bytes());
            mac.update(b".");
            mac.update(payload);
            mac.verify_slice(&expected).is_ok()
        }
    }
}

/// Find the signature header, preferring the current name over the
/// deprecated `X-` prefixed one.
pub fn parse_signature_header<'a, I>(headers: I) -> Option<String>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut legacy = None;
    for (name, value) in headers {
        let key = name.to_ascii_lowercase();
        if key == "saleor-signature" {
            return Some(value.to_string());
        }
        if key == "x-saleor-signature" {
            legacy = Some(value.to_string());
        }
    }
    legacy
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    MissingSignature,
    InvalidSignature,
}

/// Verify an incoming webhook request in one call.
pub fn verify_webhook_request<'a, I>(
    headers: I,
    payload: &[u8],
    secret_key: Option<&str>,
    default_key: &[u8],
) -> Result<(), VerificationError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let signature = parse_signature_header(headers).ok_or(VerificationError::MissingSignature)?;
    if verify_signature(payload, secret_key, default_key, &signature) {
        Ok(())
    } else {
        Err(VerificationError::InvalidSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &[u8] = br#"{"order":{"id":"T3JkZXI6NDI="}}"#;

    #[test]
    fn secret_key_produces_hex_hmac() {
        let signature = signature_for_payload(PAYLOAD, Some("s3cr3t"), b"default");
        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(verify_signature(PAYLOAD, Some("s3cr3t"), b"default", &signature));
        assert!(!verify_signature(PAYLOAD, Some("other"), b"default", &signature));
    }

    #[test]
    fn missing_secret_falls_back_to_detached_jws() {
        let signature = signature_for_payload(PAYLOAD, None, b"default");
        assert!(signature.contains(".."));
        assert_eq!(signature, signature_for_payload(PAYLOAD, Some(""), b"default"));
        assert!(verify_signature(PAYLOAD, None, b"default", &signature));
        assert!(!verify_signature(b"tampered", None, b"default", &signature));
    }

    #[test]
    fn verifies_request_headers() {
        let signature = signature_for_payload(PAYLOAD, Some("s3cr3t"), b"default");
        let headers = vec![("X-Saleor-Signature", "stale"), ("Saleor-Signature", signature.as_str())];
        assert_eq!(
            verify_webhook_request(headers.iter().map(|(k, v)| (*k, *v)), PAYLOAD, Some("s3cr3t"), b"default"),
            Ok(())
        );
        assert_eq!(
            verify_webhook_request(std::iter::empty(), PAYLOAD, Some("s3cr3t"), b"default"),
            Err(VerificationError::MissingSignature)
        );
    }
}
