//! Content encoding applied between the conversation views and the wire.
//!
//! [`StaticKeyObfuscation`] reproduces the shared-secret scheme the backend
//! expects for message bodies. Every client holds the same secret, so it hides
//! content from casual inspection only and gives no confidentiality against
//! anyone with access to the client build or its environment. Transport
//! confidentiality comes from TLS on the WebSocket and REST connections.

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    ChaCha20Poly1305, Key, Nonce,
};
use zeroize::Zeroize;

const OBFUSCATION_KEY_LEN: usize = 32;
const OBFUSCATION_NONCE_LEN: usize = 12;
const OBFUSCATION_SALT: &[u8] = b"buddyfinder/chat-content-salt";
const OBFUSCATION_INFO: &[u8] = b"buddyfinder/chat-content/v1";

pub trait CryptoProvider: Send + Sync {
    fn encode_content(&self, plaintext: &str) -> Result<String>;
    fn decode_content(&self, wire: &str) -> Result<String>;
}

pub struct PassthroughCrypto;

impl CryptoProvider for PassthroughCrypto {
    fn encode_content(&self, plaintext: &str) -> Result<String> {
        Ok(plaintext.to_string())
    }

    fn decode_content(&self, wire: &str) -> Result<String> {
        Ok(wire.to_string())
    }
}

/// ChaCha20-Poly1305 under a key derived from one process-wide secret.
/// Wire form is base64(nonce || ciphertext).
pub struct StaticKeyObfuscation {
    key: [u8; OBFUSCATION_KEY_LEN],
}

impl StaticKeyObfuscation {
    pub fn from_secret(secret: &str) -> Result<Self> {
        if secret.is_empty() {
            return Err(anyhow!("payload secret must not be empty"));
        }
        let hk = hkdf::Hkdf::<sha2::Sha256>::new(Some(OBFUSCATION_SALT), secret.as_bytes());
        let mut key = [0u8; OBFUSCATION_KEY_LEN];
        hk.expand(OBFUSCATION_INFO, &mut key)
            .map_err(|_| anyhow!("hkdf expansion failed"))?;
        Ok(Self { key })
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.key))
    }
}

impl CryptoProvider for StaticKeyObfuscation {
    fn encode_content(&self, plaintext: &str) -> Result<String> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher()
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| anyhow!("content encryption failed"))?;
        let mut framed = Vec::with_capacity(OBFUSCATION_NONCE_LEN + ciphertext.len());
        framed.extend_from_slice(&nonce);
        framed.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(framed))
    }

    fn decode_content(&self, wire: &str) -> Result<String> {
        let framed = STANDARD
            .decode(wire.as_bytes())
            .context("content is not valid base64")?;
        if framed.len() <= OBFUSCATION_NONCE_LEN {
            return Err(anyhow!("content is too short to carry a nonce"));
        }
        let (nonce, ciphertext) = framed.split_at(OBFUSCATION_NONCE_LEN);
        let plaintext = self
            .cipher()
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow!("content authentication failed"))?;
        String::from_utf8(plaintext).context("content is not valid utf-8")
    }
}

impl Drop for StaticKeyObfuscation {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}
