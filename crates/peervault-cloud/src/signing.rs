//! AWS SigV4-style request signing for S3-compatible endpoints.
//!
//! Canonicalization: method, URI, sorted query, sorted signed headers
//! (always including `host` and `x-amz-date`), and the SHA-256 of the
//! body. The signing key is the HMAC chain
//! `kDate → kRegion → kService → kRequest` over the credential scope.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// Credential scope of a signature.
#[derive(Debug, Clone)]
pub struct SigningScope {
    /// `YYYYMMDD`
    pub date: String,
    /// e.g. `us-east-1`
    pub region: String,
    /// e.g. `s3`
    pub service: String,
}

impl SigningScope {
    fn credential_scope(&self) -> String {
        format!(
            "{}/{}/{}/aws4_request",
            self.date, self.region, self.service
        )
    }
}

/// A request reduced to the fields that get signed.
#[derive(Debug, Clone)]
pub struct CanonicalRequest {
    /// HTTP method, uppercase
    pub method: String,
    /// URI path, already URI-encoded
    pub uri: String,
    /// Canonical query string (sorted, encoded), may be empty
    pub query: String,
    /// `(lowercase-name, trimmed-value)` pairs; must include `host` and
    /// `x-amz-date`
    pub headers: Vec<(String, String)>,
    /// Hex SHA-256 of the request body
    pub payload_sha256: String,
}

impl CanonicalRequest {
    /// Hex SHA-256 helper for request bodies.
    #[must_use]
    pub fn hash_payload(body: &[u8]) -> String {
        hex::encode(Sha256::digest(body))
    }

    fn sorted_headers(&self) -> Vec<(String, String)> {
        let mut headers: Vec<(String, String)> = self
            .headers
            .iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value.trim().to_string()))
            .collect();
        headers.sort();
        headers
    }

    /// The `;`-joined list of signed header names.
    #[must_use]
    pub fn signed_header_names(&self) -> String {
        self.sorted_headers()
            .iter()
            .map(|(name, _)| name.as_str())
            .collect::<Vec<_>>()
            .join(";")
    }

    /// The canonical request string that gets hashed into the string to
    /// sign.
    #[must_use]
    pub fn canonical_string(&self) -> String {
        let headers = self.sorted_headers();
        let canonical_headers: String = headers
            .iter()
            .map(|(name, value)| format!("{name}:{value}\n"))
            .collect();
        format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            self.method,
            self.uri,
            self.query,
            canonical_headers,
            self.signed_header_names(),
            self.payload_sha256
        )
    }
}

/// Signs canonical requests with a secret key.
pub struct SigV4Signer {
    access_key: String,
    secret_key: String,
}

impl SigV4Signer {
    /// Create a signer for the given credentials.
    #[must_use]
    pub fn new(access_key: &str, secret_key: &str) -> Self {
        Self {
            access_key: access_key.to_string(),
            secret_key: secret_key.to_string(),
        }
    }

    fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }

    /// Derive the request signing key: `kDate → kRegion → kService →
    /// kRequest`.
    #[must_use]
    pub fn signing_key(&self, scope: &SigningScope) -> Vec<u8> {
        let k_secret = format!("AWS4{}", self.secret_key);
        let k_date = Self::hmac(k_secret.as_bytes(), scope.date.as_bytes());
        let k_region = Self::hmac(&k_date, scope.region.as_bytes());
        let k_service = Self::hmac(&k_region, scope.service.as_bytes());
        Self::hmac(&k_service, b"aws4_request")
    }

    /// The string-to-sign for a request at `datetime`
    /// (`YYYYMMDDTHHMMSSZ`).
    #[must_use]
    pub fn string_to_sign(
        &self,
        request: &CanonicalRequest,
        scope: &SigningScope,
        datetime: &str,
    ) -> String {
        let request_hash = hex::encode(Sha256::digest(request.canonical_string().as_bytes()));
        format!(
            "{ALGORITHM}\n{datetime}\n{}\n{request_hash}",
            scope.credential_scope()
        )
    }

    /// Hex signature for a request.
    #[must_use]
    pub fn signature(
        &self,
        request: &CanonicalRequest,
        scope: &SigningScope,
        datetime: &str,
    ) -> String {
        let key = self.signing_key(scope);
        let string_to_sign = self.string_to_sign(request, scope, datetime);
        hex::encode(Self::hmac(&key, string_to_sign.as_bytes()))
    }

    /// Full `Authorization` header value.
    #[must_use]
    pub fn authorization_header(
        &self,
        request: &CanonicalRequest,
        scope: &SigningScope,
        datetime: &str,
    ) -> String {
        format!(
            "{ALGORITHM} Credential={}/{}, SignedHeaders={}, Signature={}",
            self.access_key,
            scope.credential_scope(),
            request.signed_header_names(),
            self.signature(request, scope, datetime)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> SigningScope {
        SigningScope {
            date: "20230901".into(),
            region: "us-east-1".into(),
            service: "s3".into(),
        }
    }

    fn request() -> CanonicalRequest {
        CanonicalRequest {
            method: "PUT".into(),
            uri: "/vault/deltas/1700-beef.enc".into(),
            query: String::new(),
            headers: vec![
                ("Host".into(), "bucket.example.com".into()),
                ("x-amz-date".into(), "20230901T120000Z".into()),
                ("x-amz-content-sha256".into(), "abc123".into()),
            ],
            payload_sha256: CanonicalRequest::hash_payload(b"delta bytes"),
        }
    }

    #[test]
    fn test_canonical_string_shape() {
        let canonical = request().canonical_string();
        let lines: Vec<&str> = canonical.split('\n').collect();
        assert_eq!(lines[0], "PUT");
        assert_eq!(lines[1], "/vault/deltas/1700-beef.enc");
        assert_eq!(lines[2], "");
        // Headers are lowercased and sorted
        assert_eq!(lines[3], "host:bucket.example.com");
        assert!(lines[4].starts_with("x-amz-content-sha256:"));
        assert!(lines[5].starts_with("x-amz-date:"));
        // Then the blank separator, signed header list, payload hash
        assert_eq!(lines[6], "");
        assert_eq!(lines[7], "host;x-amz-content-sha256;x-amz-date");
        assert_eq!(lines[8].len(), 64);
    }

    #[test]
    fn test_signature_is_deterministic_hex() {
        let signer = SigV4Signer::new("AKIDEXAMPLE", "secret");
        let a = signer.signature(&request(), &scope(), "20230901T120000Z");
        let b = signer.signature(&request(), &scope(), "20230901T120000Z");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_signature_depends_on_every_input() {
        let signer = SigV4Signer::new("AKIDEXAMPLE", "secret");
        let base = signer.signature(&request(), &scope(), "20230901T120000Z");

        let other_signer = SigV4Signer::new("AKIDEXAMPLE", "other-secret");
        assert_ne!(
            base,
            other_signer.signature(&request(), &scope(), "20230901T120000Z")
        );

        let mut other_request = request();
        other_request.payload_sha256 = CanonicalRequest::hash_payload(b"tampered");
        assert_ne!(
            base,
            signer.signature(&other_request, &scope(), "20230901T120000Z")
        );

        let mut other_scope = scope();
        other_scope.region = "eu-west-1".into();
        assert_ne!(
            base,
            signer.signature(&request(), &other_scope, "20230901T120000Z")
        );

        assert_ne!(
            base,
            signer.signature(&request(), &scope(), "20230902T120000Z")
        );
    }

    #[test]
    fn test_authorization_header_format() {
        let signer = SigV4Signer::new("AKIDEXAMPLE", "secret");
        let header = signer.authorization_header(&request(), &scope(), "20230901T120000Z");
        assert!(header.starts_with(
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20230901/us-east-1/s3/aws4_request, "
        ));
        assert!(header.contains("SignedHeaders=host;x-amz-content-sha256;x-amz-date"));
        assert!(header.contains("Signature="));
    }

    #[test]
    fn test_signing_key_chain_changes_per_scope() {
        let signer = SigV4Signer::new("AKIDEXAMPLE", "secret");
        let key_a = signer.signing_key(&scope());
        let mut other = scope();
        other.service = "sqs".into();
        let key_b = signer.signing_key(&other);
        assert_ne!(key_a, key_b);
        assert_eq!(key_a.len(), 32);
    }
}
