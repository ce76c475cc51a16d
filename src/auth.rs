//! BitMEX API request signing.
//!
//! The websocket handshake authenticates with the same scheme as the REST
//! API: an expiry nonce plus an HMAC-SHA256 signature over
//! `verb + path + expires + body`.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// How far in the future the auth nonce expires, in seconds.
const EXPIRES_HORIZON_SECS: i64 = 3600;

/// Generate an expiry nonce one hour from now (unix seconds).
pub fn generate_expires() -> i64 {
    chrono::Utc::now().timestamp() + EXPIRES_HORIZON_SECS
}

/// Sign `verb + path + expires + body` with the API secret, hex-encoded.
pub fn generate_signature(secret: &str, verb: &str, path: &str, expires: i64, body: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(verb.as_bytes());
    mac.update(path.as_bytes());
    mac.update(expires.to_string().as_bytes());
    mac.update(body.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Build the credential headers for the websocket handshake.
pub fn auth_headers(api_key: &str, api_secret: &str) -> Vec<(String, String)> {
    let expires = generate_expires();
    vec![
        ("api-expires".to_string(), expires.to_string()),
        (
            "api-signature".to_string(),
            generate_signature(api_secret, "GET", "/realtime", expires, ""),
        ),
        ("api-key".to_string(), api_key.to_string()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_matches_known_vector() {
        // Published signature example from the BitMEX API docs.
        let secret = "chNOOS4KvNXR_Xq4k4c9qsfoKWvnDecLATCRlcBwyKDYnWgO";
        let signature = generate_signature(secret, "GET", "/api/v1/instrument", 1518064236, "");
        assert_eq!(
            signature,
            "c7682d435d0cfe87c16098df34ef2eb5a549d4c5a3c2b1f0f77b8af73423bf00"
        );
    }

    #[test]
    fn test_body_included_in_signature() {
        let secret = "chNOOS4KvNXR_Xq4k4c9qsfoKWvnDecLATCRlcBwyKDYnWgO";
        let empty = generate_signature(secret, "GET", "/realtime", 1518064236, "");
        let with_body = generate_signature(secret, "GET", "/realtime", 1518064236, "{}");
        assert_ne!(empty, with_body);
    }

    #[test]
    fn test_auth_headers_shape() {
        let headers = auth_headers("my-key", "my-secret");
        assert_eq!(headers.len(), 3);
        assert_eq!(headers[0].0, "api-expires");
        assert_eq!(headers[1].0, "api-signature");
        assert_eq!(headers[2], ("api-key".to_string(), "my-key".to_string()));
        // Signature is hex of a 32-byte digest
        assert_eq!(headers[1].1.len(), 64);
    }

    #[test]
    fn test_expires_is_in_the_future() {
        let expires = generate_expires();
        assert!(expires > chrono::Utc::now().timestamp());
    }
}
