#![allow(dead_code)]
//! HTTP Signatures for ActivityPub (C1).
//!
//! Signs outgoing POSTs and verifies incoming ones per draft-cavage
//! http-signatures, RSA-SHA256 over `(request-target) host date digest`.

use crate::clock::Clock;
use crate::error::AppError;
use crate::metrics::SIGNATURE_VERIFICATIONS_TOTAL;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::Verifier;
use rsa::{RsaPublicKey, pkcs1v15::Signature as Pkcs1v15Signature};
use sha2::{Digest, Sha256};

/// Maximum allowed clock skew between the `Date` header and verification
/// time, in either direction.
const MAX_DATE_SKEW_SECONDS: i64 = 12 * 3600;

/// Sign an HTTP request, returning the headers to attach.
pub fn sign_request(
    method: &str,
    url: &str,
    body: Option<&[u8]>,
    private_key_pem: &str,
    key_id: &str,
) -> Result<SignatureHeaders, AppError> {
    let parsed_url =
        url::Url::parse(url).map_err(|e| AppError::BadRequest(format!("invalid URL: {e}")))?;

    let host = parsed_url
        .host_str()
        .ok_or_else(|| AppError::BadRequest("missing host in URL".to_string()))?;

    let path = parsed_url.path();
    let path_and_query = match parsed_url.query() {
        Some(q) => format!("{path}?{q}"),
        None => path.to_string(),
    };

    let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
    let digest = body.map(generate_digest);

    let request_target = format!("{} {}", method.to_lowercase(), path_and_query);

    let mut signing_parts = vec![
        format!("(request-target): {request_target}"),
        format!("host: {host}"),
        format!("date: {date}"),
    ];
    let mut headers_list = vec!["(request-target)", "host", "date"];

    if let Some(ref digest_value) = digest {
        signing_parts.push(format!("digest: {digest_value}"));
        headers_list.push("digest");
    }

    let signing_string = signing_parts.join("\n");

    use rsa::pkcs8::DecodePrivateKey;
    use rsa::signature::{RandomizedSigner, SignatureEncoding};

    let private_key = rsa::RsaPrivateKey::from_pkcs8_pem(private_key_pem)
        .map_err(|e| AppError::SigKeyUnavailable(format!("invalid private key: {e}")))?;

    let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new_unprefixed(private_key);
    let mut rng = rand::thread_rng();
    let signature = signing_key.sign_with_rng(&mut rng, signing_string.as_bytes());
    let signature_b64 = BASE64.encode(signature.to_bytes());

    let signature_header = format!(
        "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
        key_id,
        headers_list.join(" "),
        signature_b64
    );

    Ok(SignatureHeaders {
        signature: signature_header,
        date,
        digest,
    })
}

#[derive(Debug, Clone)]
pub struct SignatureHeaders {
    pub signature: String,
    pub date: String,
    pub digest: Option<String>,
}

/// Verify an incoming request's HTTP Signature.
///
/// Fails with `SigInvalid` (malformed header, unsupported signed header, or
/// a signed-header list that omits one of the required headers), `SigStale`
/// (`Date` outside `±12h` of `clock.now()`), or `DigestMismatch` (body hash
/// doesn't match the `Digest` header).
pub fn verify_signature(
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    body: Option<&[u8]>,
    public_key_pem: &str,
    clock: &dyn Clock,
) -> Result<(), AppError> {
    let signature_header = headers
        .get("signature")
        .ok_or(AppError::SigInvalid)?
        .to_str()
        .map_err(|_| AppError::SigInvalid)?;

    let parsed = parse_signature_header(signature_header)?;

    // The peer picks which headers it signed over, but a signed-header list
    // that omits `(request-target)`/`host`/`date`/`digest` lets it drop body
    // integrity from the signature entirely while still "verifying".
    let required: &[&str] = if body.is_some() {
        &["(request-target)", "host", "date", "digest"]
    } else {
        &["(request-target)", "host", "date"]
    };
    if !required.iter().all(|h| parsed.headers.iter().any(|signed| signed == h)) {
        SIGNATURE_VERIFICATIONS_TOTAL.with_label_values(&["invalid"]).inc();
        return Err(AppError::SigInvalid);
    }

    if let Some(date_header) = headers.get("date") {
        let date_str = date_header.to_str().map_err(|_| AppError::SigInvalid)?;
        let date = DateTime::parse_from_rfc2822(date_str).map_err(|_| AppError::SigInvalid)?;

        let diff = (clock.now().timestamp() - date.timestamp()).abs();
        if diff > MAX_DATE_SKEW_SECONDS {
            SIGNATURE_VERIFICATIONS_TOTAL.with_label_values(&["stale"]).inc();
            return Err(AppError::SigStale);
        }
    }

    if let Some(body_data) = body {
        if let Some(digest_header) = headers.get("digest") {
            let digest_str = digest_header.to_str().map_err(|_| AppError::SigInvalid)?;
            if digest_str != generate_digest(body_data) {
                SIGNATURE_VERIFICATIONS_TOTAL.with_label_values(&["digest_mismatch"]).inc();
                return Err(AppError::DigestMismatch);
            }
        }
    }

    let mut signing_parts = Vec::new();
    for header_name in &parsed.headers {
        let value = match header_name.as_str() {
            "(request-target)" => format!("{} {}", method.to_lowercase(), path),
            "host" => headers
                .get("host")
                .ok_or(AppError::SigInvalid)?
                .to_str()
                .map_err(|_| AppError::SigInvalid)?
                .to_string(),
            "date" => headers
                .get("date")
                .ok_or(AppError::SigInvalid)?
                .to_str()
                .map_err(|_| AppError::SigInvalid)?
                .to_string(),
            "digest" => headers
                .get("digest")
                .ok_or(AppError::SigInvalid)?
                .to_str()
                .map_err(|_| AppError::SigInvalid)?
                .to_string(),
            _ => return Err(AppError::SigInvalid),
        };
        signing_parts.push(format!("{header_name}: {value}"));
    }

    let signing_string = signing_parts.join("\n");

    let signature_bytes = BASE64.decode(&parsed.signature).map_err(|_| AppError::SigInvalid)?;
    let public_key =
        RsaPublicKey::from_public_key_pem(public_key_pem).map_err(|_| AppError::SigInvalid)?;
    let verifier = rsa::pkcs1v15::VerifyingKey::<Sha256>::new_unprefixed(public_key);
    let signature =
        Pkcs1v15Signature::try_from(signature_bytes.as_slice()).map_err(|_| AppError::SigInvalid)?;

    match verifier.verify(signing_string.as_bytes(), &signature) {
        Ok(()) => {
            SIGNATURE_VERIFICATIONS_TOTAL.with_label_values(&["valid"]).inc();
            Ok(())
        }
        Err(_) => {
            SIGNATURE_VERIFICATIONS_TOTAL.with_label_values(&["invalid"]).inc();
            Err(AppError::SigInvalid)
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParsedSignature {
    pub key_id: String,
    pub algorithm: String,
    pub headers: Vec<String>,
    pub signature: String,
}

/// Parse a `Signature:` header value: `keyId="...",algorithm="...",headers="...",signature="..."`.
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, AppError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;

    for part in header.split(',') {
        let part = part.trim();
        if let Some((key, value)) = part.split_once('=') {
            let key = key.trim();
            let value = value.trim().trim_matches('"');

            match key {
                "keyId" => key_id = Some(value.to_string()),
                "algorithm" => algorithm = Some(value.to_string()),
                "headers" => headers = Some(value.split_whitespace().map(|s| s.to_string()).collect()),
                "signature" => signature = Some(value.to_string()),
                _ => {}
            }
        }
    }

    Ok(ParsedSignature {
        key_id: key_id.ok_or(AppError::SigInvalid)?,
        algorithm: algorithm.ok_or(AppError::SigInvalid)?,
        headers: headers.ok_or(AppError::SigInvalid)?,
        signature: signature.ok_or(AppError::SigInvalid)?,
    })
}

/// `SHA-256=<base64(sha256(body))>`
pub fn generate_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    let hash = hasher.finalize();
    format!("SHA-256={}", BASE64.encode(hash))
}

/// Extract the `keyId` fragment-stripped actor URI from a full `keyId` value
/// such as `https://peer/users/bob#main-key`.
pub fn extract_actor_uri_from_key_id(key_id: &str) -> &str {
    key_id.split('#').next().unwrap_or(key_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{SystemClock, TestClock};

    #[test]
    fn digest_is_stable_for_same_body() {
        let a = generate_digest(b"hello world");
        let b = generate_digest(b"hello world");
        assert_eq!(a, b);
        assert!(a.starts_with("SHA-256="));
    }

    #[test]
    fn parse_signature_header_extracts_fields() {
        let header = r#"keyId="https://peer/users/bob#main-key",algorithm="rsa-sha256",headers="(request-target) host date digest",signature="abc123""#;
        let parsed = parse_signature_header(header).unwrap();
        assert_eq!(parsed.key_id, "https://peer/users/bob#main-key");
        assert_eq!(parsed.algorithm, "rsa-sha256");
        assert_eq!(parsed.headers, vec!["(request-target)", "host", "date", "digest"]);
        assert_eq!(parsed.signature, "abc123");
    }

    #[test]
    fn sign_then_verify_round_trips() {
        let private_pem = include_str!("../../tests/fixtures/test_private_key.pem");
        let public_pem = include_str!("../../tests/fixtures/test_public_key.pem");

        let body = b"{\"type\":\"Create\"}";
        let signed = sign_request(
            "POST",
            "https://self.example/inbox",
            Some(body),
            private_pem,
            "https://self.example/users/alice#main-key",
        )
        .unwrap();

        let mut headers = http::HeaderMap::new();
        headers.insert("signature", signed.signature.parse().unwrap());
        headers.insert("date", signed.date.parse().unwrap());
        headers.insert("host", "self.example".parse().unwrap());
        if let Some(digest) = &signed.digest {
            headers.insert("digest", digest.parse().unwrap());
        }

        verify_signature("POST", "/inbox", &headers, Some(body), public_pem, &SystemClock).unwrap();
    }

    #[test]
    fn verify_rejects_signed_header_list_omitting_digest() {
        let private_pem = include_str!("../../tests/fixtures/test_private_key.pem");
        let public_pem = include_str!("../../tests/fixtures/test_public_key.pem");

        let body = b"{\"type\":\"Create\"}";
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let request_target = "post /inbox";

        // Sign over only (request-target)/host/date, omitting digest even
        // though a body is present — a peer trying to sidestep body-integrity
        // checking while still presenting a "valid" signature.
        let signing_string = format!("(request-target): {request_target}\nhost: self.example\ndate: {date}");

        use rsa::pkcs1v15::SigningKey;
        use rsa::pkcs8::DecodePrivateKey;
        use rsa::signature::{RandomizedSigner, SignatureEncoding};

        let private_key = rsa::RsaPrivateKey::from_pkcs8_pem(private_pem).unwrap();
        let signing_key = SigningKey::<Sha256>::new_unprefixed(private_key);
        let mut rng = rand::thread_rng();
        let signature = signing_key.sign_with_rng(&mut rng, signing_string.as_bytes());
        let signature_b64 = BASE64.encode(signature.to_bytes());

        let signature_header = format!(
            "keyId=\"https://self.example/users/alice#main-key\",algorithm=\"rsa-sha256\",headers=\"(request-target) host date\",signature=\"{signature_b64}\""
        );

        let mut headers = http::HeaderMap::new();
        headers.insert("signature", signature_header.parse().unwrap());
        headers.insert("date", date.parse().unwrap());
        headers.insert("host", "self.example".parse().unwrap());
        headers.insert("digest", generate_digest(body).parse().unwrap());

        let err = verify_signature("POST", "/inbox", &headers, Some(body), public_pem, &SystemClock)
            .unwrap_err();
        assert!(matches!(err, AppError::SigInvalid));
    }

    #[test]
    fn verify_rejects_stale_date_past_skew_boundary() {
        let private_pem = include_str!("../../tests/fixtures/test_private_key.pem");
        let public_pem = include_str!("../../tests/fixtures/test_public_key.pem");

        let clock = TestClock::new(Utc::now());
        let body = b"{\"type\":\"Create\"}";
        let signed = sign_request(
            "POST",
            "https://self.example/inbox",
            Some(body),
            private_pem,
            "https://self.example/users/alice#main-key",
        )
        .unwrap();

        let mut headers = http::HeaderMap::new();
        headers.insert("signature", signed.signature.parse().unwrap());
        headers.insert("date", signed.date.parse().unwrap());
        headers.insert("host", "self.example".parse().unwrap());
        if let Some(digest) = &signed.digest {
            headers.insert("digest", digest.parse().unwrap());
        }

        // Just past the 12h skew window, the same request must now be stale.
        clock.advance(chrono::Duration::hours(12) + chrono::Duration::seconds(1));
        let err = verify_signature("POST", "/inbox", &headers, Some(body), public_pem, &clock).unwrap_err();
        assert!(matches!(err, AppError::SigStale));
    }

    #[test]
    fn verify_rejects_tampered_body() {
        let private_pem = include_str!("../../tests/fixtures/test_private_key.pem");
        let public_pem = include_str!("../../tests/fixtures/test_public_key.pem");

        let body = b"{\"type\":\"Create\"}";
        let signed = sign_request(
            "POST",
            "https://self.example/inbox",
            Some(body),
            private_pem,
            "https://self.example/users/alice#main-key",
        )
        .unwrap();

        let mut headers = http::HeaderMap::new();
        headers.insert("signature", signed.signature.parse().unwrap());
        headers.insert("date", signed.date.parse().unwrap());
        headers.insert("host", "self.example".parse().unwrap());
        if let Some(digest) = &signed.digest {
            headers.insert("digest", digest.parse().unwrap());
        }

        let tampered = b"{\"type\":\"Delete\"}";
        let err = verify_signature("POST", "/inbox", &headers, Some(tampered), public_pem, &SystemClock)
            .unwrap_err();
        assert!(matches!(err, AppError::DigestMismatch));
    }
}
