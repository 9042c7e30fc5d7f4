//! RSA-PSS-SHA256 request signing for the broker API.
//!
//! Signature input is `timestamp_ms ‖ METHOD ‖ full_path`, where full_path
//! includes the API prefix (`/trade-api/v2/...` or `/trade-api/ws/v2`).

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::pss::BlindedSigningKey;
use rsa::sha2::Sha256;
use rsa::signature::{RandomizedSigner, SignatureEncoding};
use rsa::RsaPrivateKey;
use std::path::Path;
use std::sync::Arc;

pub const ACCESS_KEY_HEADER: &str = "KALSHI-ACCESS-KEY";
pub const ACCESS_TIMESTAMP_HEADER: &str = "KALSHI-ACCESS-TIMESTAMP";
pub const ACCESS_SIGNATURE_HEADER: &str = "KALSHI-ACCESS-SIGNATURE";

#[derive(Clone)]
pub struct RequestSigner {
    key_id: String,
    signing_key: Arc<BlindedSigningKey<Sha256>>,
}

impl RequestSigner {
    pub fn from_pem(key_id: &str, pem: &str) -> Result<Self> {
        let key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| anyhow!("parse broker private key: {e}"))?;
        Ok(Self {
            key_id: key_id.to_string(),
            signing_key: Arc::new(BlindedSigningKey::<Sha256>::new(key)),
        })
    }

    pub fn from_pem_file(key_id: &str, path: &Path) -> Result<Self> {
        let pem = std::fs::read_to_string(path)
            .with_context(|| format!("read broker private key {}", path.display()))?;
        Self::from_pem(key_id, &pem)
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Base64 signature over `ts ‖ METHOD ‖ full_path`.
    pub fn sign(&self, timestamp_ms: i64, method: &str, full_path: &str) -> String {
        let message = format!("{timestamp_ms}{}{full_path}", method.to_ascii_uppercase());
        let signature = self
            .signing_key
            .sign_with_rng(&mut rand::thread_rng(), message.as_bytes());
        BASE64.encode(signature.to_bytes())
    }

    /// The three auth headers for a request signed now.
    pub fn auth_headers(&self, method: &str, full_path: &str) -> Vec<(&'static str, String)> {
        let ts = chrono::Utc::now().timestamp_millis();
        vec![
            (ACCESS_KEY_HEADER, self.key_id.clone()),
            (ACCESS_TIMESTAMP_HEADER, ts.to_string()),
            (ACCESS_SIGNATURE_HEADER, self.sign(ts, method, full_path)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::EncodePrivateKey;

    fn test_signer() -> RequestSigner {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let pem = key.to_pkcs8_pem(rsa::pkcs8::LineEnding::LF).unwrap();
        RequestSigner::from_pem("test-key-id", &pem).unwrap()
    }

    #[test]
    fn signatures_are_base64_and_nonempty() {
        let signer = test_signer();
        let sig = signer.sign(1_700_000_000_000, "GET", "/trade-api/v2/portfolio/balance");
        assert!(!sig.is_empty());
        assert!(BASE64.decode(&sig).is_ok());
    }

    #[test]
    fn auth_headers_carry_key_ts_sig() {
        let signer = test_signer();
        let headers = signer.auth_headers("GET", "/trade-api/ws/v2");
        assert_eq!(headers.len(), 3);
        assert_eq!(headers[0].0, ACCESS_KEY_HEADER);
        assert_eq!(headers[0].1, "test-key-id");
        assert!(headers[1].1.parse::<i64>().is_ok());
    }

    #[test]
    fn garbage_pem_is_rejected() {
        assert!(RequestSigner::from_pem("k", "not a pem").is_err());
    }
}
