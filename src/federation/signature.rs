//! HTTP signatures
//!
//! Signing and verification in the draft-cavage style used across the
//! Fediverse: RSA-SHA256 over a signing string of lowercased headers in
//! `(request-target)` order, with a `SHA-256=` body digest.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use rsa::pkcs1v15::{Signature as Pkcs1v15Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::collections::HashSet;

use crate::error::{AppError, SignatureError};

/// Maximum tolerated distance between the Date header and server time
const MAX_CLOCK_SKEW_SECS: i64 = 3600;

/// RSA key size for the relay's own keypair
const KEY_BITS: usize = 2048;

/// The relay's signing identity
///
/// The private key is parsed once at startup and read-only afterwards.
pub struct Signer {
    key: RsaPrivateKey,
    key_id: String,
}

impl Signer {
    /// Generate a fresh 2048-bit keypair
    pub fn generate(key_id: String) -> Result<Self, AppError> {
        let mut rng = rand::thread_rng();
        let key = RsaPrivateKey::new(&mut rng, KEY_BITS)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("keypair generation failed: {e}")))?;

        Ok(Self { key, key_id })
    }

    /// Load the persisted key
    pub fn from_pem(pem: &str, key_id: String) -> Result<Self, AppError> {
        let key = RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|e| AppError::Config(format!("invalid stored private key: {e}")))?;

        Ok(Self { key, key_id })
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// The private key as PKCS#8 PEM, for persistence
    pub fn private_key_pem(&self) -> Result<String, AppError> {
        Ok(self
            .key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("key encoding failed: {e}")))?
            .to_string())
    }

    /// The public key as SPKI PEM, embedded in the actor document
    pub fn public_key_pem(&self) -> Result<String, AppError> {
        RsaPublicKey::from(&self.key)
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("key encoding failed: {e}")))
    }

    /// Sign an outbound request
    ///
    /// Produces the `Signature`, `Date` and (for bodies) `Digest` header
    /// values. POSTs additionally cover `content-type`.
    pub fn sign_request(
        &self,
        method: &str,
        url: &str,
        body: Option<&[u8]>,
        content_type: Option<&str>,
    ) -> Result<SignatureHeaders, AppError> {
        let parsed_url = url::Url::parse(url)
            .map_err(|e| AppError::Validation(format!("invalid URL: {e}")))?;

        let host = parsed_url
            .host_str()
            .ok_or_else(|| AppError::Validation("missing host in URL".to_string()))?;
        let host = match parsed_url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        let path_and_query = match parsed_url.query() {
            Some(query) => format!("{}?{}", parsed_url.path(), query),
            None => parsed_url.path().to_string(),
        };

        let date = http_date(Utc::now());
        let digest = body.map(generate_digest);
        let request_target = format!("{} {}", method.to_lowercase(), path_and_query);

        let mut signing_parts = vec![
            format!("(request-target): {request_target}"),
            format!("host: {host}"),
            format!("date: {date}"),
        ];
        let mut headers_list = vec!["(request-target)", "host", "date"];

        if let Some(digest_value) = &digest {
            signing_parts.push(format!("digest: {digest_value}"));
            headers_list.push("digest");
        }

        if let Some(content_type) = content_type {
            signing_parts.push(format!("content-type: {content_type}"));
            headers_list.push("content-type");
        }

        let signing_string = signing_parts.join("\n");

        let signing_key = SigningKey::<Sha256>::new(self.key.clone());
        let mut rng = rand::thread_rng();
        let signature = signing_key.sign_with_rng(&mut rng, signing_string.as_bytes());
        let signature_b64 = BASE64.encode(signature.to_bytes());

        let signature_header = format!(
            "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
            self.key_id,
            headers_list.join(" "),
            signature_b64
        );

        Ok(SignatureHeaders {
            signature: signature_header,
            date,
            host,
            digest,
        })
    }
}

/// Header values produced for a signed request
#[derive(Debug, Clone)]
pub struct SignatureHeaders {
    pub signature: String,
    pub date: String,
    pub host: String,
    pub digest: Option<String>,
}

/// Format an instant as an RFC 7231 HTTP date
pub fn http_date(ts: DateTime<Utc>) -> String {
    ts.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Compute the `Digest` header value for a body
pub fn generate_digest(body: &[u8]) -> String {
    let hash = Sha256::digest(body);
    format!("SHA-256={}", BASE64.encode(hash))
}

/// Parsed `Signature` header
#[derive(Debug, Clone)]
pub struct ParsedSignature {
    pub key_id: String,
    pub algorithm: String,
    pub headers: Vec<String>,
    pub signature: String,
}

/// Parse a `Signature` header value
///
/// # Format
/// ```text
/// keyId="...",algorithm="...",headers="...",signature="..."
/// ```
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, SignatureError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;

    for part in header.split(',') {
        let Some((name, value)) = part.trim().split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"');

        match name.trim() {
            "keyId" => key_id = Some(value.to_string()),
            "algorithm" => algorithm = Some(value.to_string()),
            "headers" => {
                headers = Some(
                    value
                        .split_whitespace()
                        .map(str::to_ascii_lowercase)
                        .collect::<Vec<_>>(),
                )
            }
            "signature" => signature = Some(value.to_string()),
            _ => {} // ignore unknown parameters
        }
    }

    let missing = |field: &str| SignatureError::SignatureMalformed(format!("missing {field}"));

    Ok(ParsedSignature {
        key_id: key_id.ok_or_else(|| missing("keyId"))?,
        algorithm: algorithm.ok_or_else(|| missing("algorithm"))?,
        headers: headers.ok_or_else(|| missing("headers"))?,
        signature: signature.ok_or_else(|| missing("signature"))?,
    })
}

fn is_supported_algorithm(algorithm: &str) -> bool {
    algorithm.eq_ignore_ascii_case("rsa-sha256") || algorithm.eq_ignore_ascii_case("hs2019")
}

/// Verify an inbound request signature
///
/// # Errors
/// One of the [`SignatureError`] kinds; every kind maps to 401 at the
/// HTTP edge.
pub fn verify_signature(
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    body: Option<&[u8]>,
    public_key_pem: &str,
) -> Result<(), SignatureError> {
    // 1. Parse the Signature header
    let signature_header = headers
        .get("signature")
        .ok_or(SignatureError::SignatureMissing)?
        .to_str()
        .map_err(|_| SignatureError::SignatureMalformed("non-ascii header".to_string()))?;

    let parsed = parse_signature_header(signature_header)?;

    if !is_supported_algorithm(&parsed.algorithm) {
        return Err(SignatureError::SignatureMalformed(format!(
            "unsupported algorithm {}",
            parsed.algorithm
        )));
    }

    let signed_headers: HashSet<&str> = parsed.headers.iter().map(String::as_str).collect();
    for required in ["(request-target)", "host", "date"] {
        if !signed_headers.contains(required) {
            return Err(SignatureError::SignatureMalformed(format!(
                "signature must cover {required}"
            )));
        }
    }

    // 2. Reject requests signed too far from server time
    let date_value = header_value(headers, "date")?;
    let date = DateTime::parse_from_rfc2822(&date_value)
        .map_err(|_| SignatureError::SignatureMalformed("unparseable date".to_string()))?;
    let skew = Utc::now() - date.with_timezone(&Utc);
    if skew.abs() > Duration::seconds(MAX_CLOCK_SKEW_SECS) {
        return Err(SignatureError::ClockSkew);
    }

    // 3. If a body is present, the digest must be covered and match
    if let Some(body) = body {
        if !signed_headers.contains("digest") {
            return Err(SignatureError::SignatureMalformed(
                "signature must cover digest for requests with a body".to_string(),
            ));
        }

        let digest_value = header_value(headers, "digest")?;
        if digest_value != generate_digest(body) {
            return Err(SignatureError::DigestMismatch);
        }
    }

    // 4. Reconstruct the signing string
    let mut signing_parts = Vec::with_capacity(parsed.headers.len());
    for name in &parsed.headers {
        let value = match name.as_str() {
            "(request-target)" => format!("{} {}", method.to_lowercase(), path),
            other => header_value(headers, other)?,
        };
        signing_parts.push(format!("{name}: {value}"));
    }
    let signing_string = signing_parts.join("\n");

    // 5. Verify
    let signature_bytes = BASE64
        .decode(&parsed.signature)
        .map_err(|_| SignatureError::SignatureMalformed("signature not base64".to_string()))?;

    let public_key = RsaPublicKey::from_public_key_pem(public_key_pem)
        .map_err(|e| SignatureError::KeyUnavailable(format!("bad public key: {e}")))?;
    let verifying_key = VerifyingKey::<Sha256>::new(public_key);

    let signature = Pkcs1v15Signature::try_from(signature_bytes.as_slice())
        .map_err(|_| SignatureError::SignatureMalformed("bad signature length".to_string()))?;

    verifying_key
        .verify(signing_string.as_bytes(), &signature)
        .map_err(|_| SignatureError::SignatureInvalid)
}

fn header_value(headers: &http::HeaderMap, name: &str) -> Result<String, SignatureError> {
    headers
        .get(name)
        .ok_or_else(|| SignatureError::SignatureMalformed(format!("missing {name} header")))?
        .to_str()
        .map(str::to_string)
        .map_err(|_| SignatureError::SignatureMalformed(format!("non-ascii {name} header")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::HeaderValue;

    fn test_signer() -> (Signer, String) {
        let signer = Signer::generate("https://relay.example/actor#main-key".to_string()).unwrap();
        let public_pem = signer.public_key_pem().unwrap();
        (signer, public_pem)
    }

    fn signed_headers(signed: &SignatureHeaders, content_type: Option<&str>) -> http::HeaderMap {
        let mut headers = http::HeaderMap::new();
        headers.insert("host", HeaderValue::from_str(&signed.host).unwrap());
        headers.insert("date", HeaderValue::from_str(&signed.date).unwrap());
        headers.insert("signature", HeaderValue::from_str(&signed.signature).unwrap());
        if let Some(digest) = &signed.digest {
            headers.insert("digest", HeaderValue::from_str(digest).unwrap());
        }
        if let Some(content_type) = content_type {
            headers.insert("content-type", HeaderValue::from_str(content_type).unwrap());
        }
        headers
    }

    #[test]
    fn sign_then_verify_round_trips() {
        let (signer, public_pem) = test_signer();
        let body = br#"{"type":"Follow"}"#;

        let signed = signer
            .sign_request(
                "POST",
                "https://remote.example/inbox",
                Some(body),
                Some("application/activity+json"),
            )
            .unwrap();

        let headers = signed_headers(&signed, Some("application/activity+json"));
        verify_signature("POST", "/inbox", &headers, Some(body), &public_pem)
            .expect("signature must round-trip");
    }

    #[test]
    fn get_requests_sign_without_digest() {
        let (signer, public_pem) = test_signer();

        let signed = signer
            .sign_request("GET", "https://remote.example/actor?full=1", None, None)
            .unwrap();
        assert!(signed.digest.is_none());

        let headers = signed_headers(&signed, None);
        verify_signature("GET", "/actor?full=1", &headers, None, &public_pem).unwrap();
    }

    #[test]
    fn body_tamper_is_a_digest_mismatch() {
        let (signer, public_pem) = test_signer();
        let body = br#"{"type":"Create","id":"x"}"#.to_vec();

        let signed = signer
            .sign_request("POST", "https://remote.example/inbox", Some(&body), None)
            .unwrap();
        let headers = signed_headers(&signed, None);

        let mut tampered = body.clone();
        tampered[10] ^= 0x01;

        let error =
            verify_signature("POST", "/inbox", &headers, Some(&tampered), &public_pem).unwrap_err();
        assert_eq!(error, SignatureError::DigestMismatch);
    }

    #[test]
    fn signed_header_tamper_fails_verification() {
        let (signer, public_pem) = test_signer();
        let body = br#"{}"#;

        let signed = signer
            .sign_request("POST", "https://remote.example/inbox", Some(body), None)
            .unwrap();
        let mut headers = signed_headers(&signed, None);
        headers.insert("host", HeaderValue::from_static("evil.example"));

        let error =
            verify_signature("POST", "/inbox", &headers, Some(body), &public_pem).unwrap_err();
        assert_eq!(error, SignatureError::SignatureInvalid);
    }

    #[test]
    fn signature_parameter_tamper_fails_verification() {
        let (signer, public_pem) = test_signer();
        let body = br#"{}"#;

        let signed = signer
            .sign_request("POST", "https://remote.example/inbox", Some(body), None)
            .unwrap();

        // flip one character inside the base64 signature parameter
        let tampered = if signed.signature.contains("AA") {
            signed.signature.replacen("AA", "AB", 1)
        } else {
            signed.signature.replacen("signature=\"", "signature=\"A", 1)
        };

        let mut headers = signed_headers(&signed, None);
        headers.insert("signature", HeaderValue::from_str(&tampered).unwrap());

        let error =
            verify_signature("POST", "/inbox", &headers, Some(body), &public_pem).unwrap_err();
        assert!(matches!(
            error,
            SignatureError::SignatureInvalid | SignatureError::SignatureMalformed(_)
        ));
    }

    #[test]
    fn missing_signature_header_is_reported_as_missing() {
        let (_, public_pem) = test_signer();
        let headers = http::HeaderMap::new();

        let error = verify_signature("POST", "/inbox", &headers, None, &public_pem).unwrap_err();
        assert_eq!(error, SignatureError::SignatureMissing);
    }

    #[test]
    fn garbage_signature_header_is_malformed() {
        let (_, public_pem) = test_signer();
        let mut headers = http::HeaderMap::new();
        headers.insert("signature", HeaderValue::from_static("keyId=\"x\""));

        let error = verify_signature("POST", "/inbox", &headers, None, &public_pem).unwrap_err();
        assert!(matches!(error, SignatureError::SignatureMalformed(_)));
    }

    #[test]
    fn stale_date_is_clock_skew() {
        let (signer, public_pem) = test_signer();
        let body = br#"{}"#;

        let signed = signer
            .sign_request("POST", "https://remote.example/inbox", Some(body), None)
            .unwrap();
        let mut headers = signed_headers(&signed, None);

        let stale = http_date(Utc::now() - Duration::seconds(MAX_CLOCK_SKEW_SECS + 120));
        headers.insert("date", HeaderValue::from_str(&stale).unwrap());

        let error =
            verify_signature("POST", "/inbox", &headers, Some(body), &public_pem).unwrap_err();
        assert_eq!(error, SignatureError::ClockSkew);
    }

    #[test]
    fn key_round_trips_through_pem() {
        let (signer, _) = test_signer();
        let pem = signer.private_key_pem().unwrap();

        let restored = Signer::from_pem(&pem, signer.key_id().to_string()).unwrap();
        assert_eq!(
            restored.public_key_pem().unwrap(),
            signer.public_key_pem().unwrap()
        );
    }

    #[test]
    fn hs2019_algorithm_token_is_accepted() {
        let (signer, public_pem) = test_signer();
        let body = br#"{}"#;

        let signed = signer
            .sign_request("POST", "https://remote.example/inbox", Some(body), None)
            .unwrap();
        let relabeled =
            signed
                .signature
                .replacen("algorithm=\"rsa-sha256\"", "algorithm=\"hs2019\"", 1);

        let mut headers = signed_headers(&signed, None);
        headers.insert("signature", HeaderValue::from_str(&relabeled).unwrap());

        verify_signature("POST", "/inbox", &headers, Some(body), &public_pem).unwrap();
    }
}
