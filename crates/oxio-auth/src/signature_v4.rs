use hmac::{Hmac, Mac};
use oxio_common::error::Result;
use oxio_common::verify::PayloadVerifier;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

const AWS_URI_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'!')
    .add(b'"')
    .add(b'#')
    .add(b'$')
    .add(b'%')
    .add(b'&')
    .add(b'\'')
    .add(b'(')
    .add(b')')
    .add(b'*')
    .add(b'+')
    .add(b',')
    .add(b'/')
    .add(b':')
    .add(b';')
    .add(b'=')
    .add(b'?')
    .add(b'@')
    .add(b'[')
    .add(b']');

/// One request's AWS Signature V4 context.
///
/// The HTTP front end extracts the signed request parts at parse time and
/// binds them here; the storage engine later calls [`PayloadVerifier::matches`]
/// with the hex SHA-256 of whatever payload it actually consumed, so a body
/// swapped after signing never verifies.
#[derive(Debug, Clone)]
pub struct SignatureV4 {
    secret_key: String,
    region: String,
    method: String,
    canonical_uri: String,
    canonical_query: String,
    canonical_headers: String,
    signed_headers: String,
    date: String,
    date_time: String,
    signature: String,
}

impl SignatureV4 {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        secret_key: impl Into<String>,
        region: impl Into<String>,
        method: impl Into<String>,
        path: &str,
        query_string: &str,
        headers: &[(String, String)],
        date_time: impl Into<String>,
        signature: impl Into<String>,
    ) -> Self {
        let date_time = date_time.into();
        let date = date_time.chars().take(8).collect();
        let (canonical_headers, signed_headers) = canonicalize_headers(headers);
        Self {
            secret_key: secret_key.into(),
            region: region.into(),
            method: method.into(),
            canonical_uri: canonical_uri(path),
            canonical_query: canonical_query_string(query_string),
            canonical_headers,
            signed_headers,
            date,
            date_time,
            signature: signature.into(),
        }
    }

    /// Compute the V4 signature for a payload hash under this request
    /// context. This is the value `matches` checks the bound signature
    /// against; clients and tests use it to produce valid signatures.
    pub fn sign(&self, payload_sha256: &str) -> String {
        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            self.method,
            self.canonical_uri,
            self.canonical_query,
            self.canonical_headers,
            self.signed_headers,
            payload_sha256,
        );
        let scope = format!("{}/{}/s3/aws4_request", self.date, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            self.date_time,
            scope,
            sha256_hex(canonical_request.as_bytes()),
        );
        let signing_key = signing_key(&self.secret_key, &self.date, &self.region);
        hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()))
    }
}

impl PayloadVerifier for SignatureV4 {
    fn matches(&self, payload_sha256: &str) -> Result<bool> {
        let computed = self.sign(payload_sha256);
        Ok(constant_time_eq(
            computed.as_bytes(),
            self.signature.as_bytes(),
        ))
    }
}

pub fn signing_key(secret_key: &str, date: &str, region: &str) -> Vec<u8> {
    let date_key = hmac_sha256(format!("AWS4{secret_key}").as_bytes(), date.as_bytes());
    let region_key = hmac_sha256(&date_key, region.as_bytes());
    let service_key = hmac_sha256(&region_key, b"s3");
    hmac_sha256(&service_key, b"aws4_request")
}

pub fn canonical_uri(path: &str) -> String {
    let encoded = path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(percent_encode)
        .collect::<Vec<_>>();
    if encoded.is_empty() {
        return "/".to_string();
    }

    let mut out = String::from("/");
    out.push_str(&encoded.join("/"));
    if path.ends_with('/') {
        out.push('/');
    }
    out
}

pub fn canonical_query_string(query: &str) -> String {
    let mut pairs = query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => (percent_encode(key), percent_encode(value)),
            None => (percent_encode(pair), String::new()),
        })
        .collect::<Vec<_>>();
    pairs.sort();
    pairs
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn canonicalize_headers(headers: &[(String, String)]) -> (String, String) {
    let mut entries = headers
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value.trim().to_string()))
        .collect::<Vec<_>>();
    entries.sort();

    let canonical = entries
        .iter()
        .map(|(name, value)| format!("{name}:{value}\n"))
        .collect::<String>();
    let signed = entries
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(";");
    (canonical, signed)
}

fn percent_encode(value: &str) -> String {
    utf8_percent_encode(value, AWS_URI_ENCODE_SET).to_string()
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0_u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxio_common::time;

    fn request_headers() -> Vec<(String, String)> {
        vec![
            ("Host".to_string(), "localhost:9000".to_string()),
            (
                "x-amz-date".to_string(),
                time::format_amz_date(&time::now()),
            ),
        ]
    }

    fn verifier(signature: &str) -> SignatureV4 {
        SignatureV4::new(
            "wJalrXUtnFEMI/K7MDENG/bPxRfiCYEXAMPLEKEY",
            "us-east-1",
            "PUT",
            "/bucket/my object",
            "partNumber=1&uploadId=abc",
            &request_headers(),
            time::format_amz_date(&time::now()),
            signature,
        )
    }

    #[test]
    fn accepts_its_own_signature() {
        let payload_sha256 = sha256_hex(b"hello");
        let signature = verifier("").sign(&payload_sha256);
        assert!(verifier(&signature).matches(&payload_sha256).unwrap());
    }

    #[test]
    fn rejects_tampered_payload() {
        let signature = verifier("").sign(&sha256_hex(b"hello"));
        assert!(!verifier(&signature).matches(&sha256_hex(b"world")).unwrap());
    }

    #[test]
    fn canonical_uri_encodes_segments() {
        assert_eq!(canonical_uri(""), "/");
        assert_eq!(canonical_uri("/"), "/");
        assert_eq!(canonical_uri("/bucket/my key"), "/bucket/my%20key");
        assert_eq!(canonical_uri("bucket/prefix/"), "/bucket/prefix/");
    }

    #[test]
    fn canonical_query_sorts_pairs() {
        assert_eq!(canonical_query_string(""), "");
        assert_eq!(
            canonical_query_string("uploadId=a b&partNumber=1"),
            "partNumber=1&uploadId=a%20b"
        );
    }
}
