//! Keypair, signing and peer encryption.
//!
//! Peer encryption derives a conversation key from the secp256k1 ECDH shared
//! point (x coordinate) through HKDF-SHA256 and seals with ChaCha20-Poly1305.
//! Ciphertext travels as `base64(nonce || ciphertext || tag)`. Both parties
//! derive the same key, so the author of a DM can read it back with the
//! recipient's public key.

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine};
use bech32::{Bech32, Hrp};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use secp256k1::{ecdh, All, Keypair, Message, Parity, PublicKey, Secp256k1, XOnlyPublicKey};
use sha2::{Digest, Sha256};

use crate::error::{ClientError, Result};
use crate::event::{canonical_hash, Event, UnsignedEvent};

/// Nonce length for ChaCha20-Poly1305.
const NONCE_SIZE: usize = 12;
const KDF_SALT: &[u8] = b"relaysync-dm-v1";

/// Shortest accepted bech32 private key string.
pub const NSEC_MIN_LEN: usize = 60;
pub const NSEC_PREFIX: &str = "nsec1";
pub const NPUB_PREFIX: &str = "npub1";

/// A private/public keypair and the primitives that use it.
#[derive(Clone)]
pub struct Identity {
    secp: Secp256k1<All>,
    keypair: Keypair,
    pubkey: String,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("pubkey", &self.pubkey)
            .finish_non_exhaustive()
    }
}

impl Identity {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let keypair = Keypair::new(&secp, &mut rand::thread_rng());
        Self::from_keypair(secp, keypair)
    }

    /// Load from a 32-byte secret key in hex.
    pub fn from_secret_hex(secret: &str) -> Result<Self> {
        let bytes = hex::decode(secret.trim()).map_err(|e| ClientError::Crypto(e.to_string()))?;
        Self::from_secret_bytes(&bytes)
    }

    /// Load from a bech32 `nsec1...` string.
    pub fn from_nsec(nsec: &str) -> Result<Self> {
        let bytes = decode_bech32(nsec.trim(), "nsec")?;
        Self::from_secret_bytes(&bytes)
    }

    fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        let secp = Secp256k1::new();
        let keypair = Keypair::from_seckey_slice(&secp, bytes)
            .map_err(|e| ClientError::Crypto(e.to_string()))?;
        Ok(Self::from_keypair(secp, keypair))
    }

    fn from_keypair(secp: Secp256k1<All>, keypair: Keypair) -> Self {
        let pubkey = hex::encode(keypair.x_only_public_key().0.serialize());
        Self {
            secp,
            keypair,
            pubkey,
        }
    }

    /// Public key as x-only hex.
    pub fn pubkey(&self) -> &str {
        &self.pubkey
    }

    /// Secret key as hex.
    pub fn secret_hex(&self) -> String {
        hex::encode(self.keypair.secret_bytes())
    }

    pub fn npub(&self) -> String {
        encode_bech32("npub", &self.keypair.x_only_public_key().0.serialize())
    }

    pub fn nsec(&self) -> String {
        encode_bech32("nsec", &self.keypair.secret_bytes())
    }

    /// Sign an event. Signing uses no auxiliary randomness, so the same key and
    /// payload always produce the same signature.
    pub fn sign(&self, unsigned: UnsignedEvent) -> Result<Event> {
        let content = serde_json::Value::String(unsigned.content.clone());
        let hash = canonical_hash(
            &self.pubkey,
            unsigned.created_at,
            unsigned.kind,
            &unsigned.tags,
            &content,
        )?;
        Ok(Event {
            id: hex::encode(hash),
            pubkey: self.pubkey.clone(),
            created_at: unsigned.created_at,
            kind: unsigned.kind,
            tags: unsigned.tags,
            content: unsigned.content,
            sig: self.sign_digest(&hash)?,
        })
    }

    /// Signature over `sha256([0, pubkey, name])`, proving key ownership to the
    /// name registry.
    pub fn sign_name(&self, name: &str) -> Result<String> {
        let ser = serde_json::to_vec(&serde_json::json!([0, self.pubkey, name]))?;
        let hash: [u8; 32] = Sha256::digest(&ser).into();
        self.sign_digest(&hash)
    }

    fn sign_digest(&self, hash: &[u8; 32]) -> Result<String> {
        let msg = Message::from_digest_slice(hash).map_err(|e| ClientError::Crypto(e.to_string()))?;
        let sig = self.secp.sign_schnorr_no_aux_rand(&msg, &self.keypair);
        Ok(hex::encode(sig.as_ref()))
    }

    /// Encrypt `plaintext` so only `peer` (and this identity) can read it.
    pub fn encrypt_for(&self, peer: &str, plaintext: &str) -> Result<String> {
        let cipher = self.conversation_cipher(peer)?;
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|e| ClientError::Crypto(format!("encryption failed: {e}")))?;
        let mut out = nonce_bytes.to_vec();
        out.extend_from_slice(&sealed);
        Ok(STANDARD.encode(out))
    }

    /// Decrypt content produced by `encrypt_for` between this identity and `peer`.
    pub fn decrypt_from(&self, peer: &str, ciphertext: &str) -> Result<String> {
        let cipher = self.conversation_cipher(peer)?;
        let raw = STANDARD
            .decode(ciphertext.trim())
            .map_err(|e| ClientError::Decryption(e.to_string()))?;
        if raw.len() <= NONCE_SIZE {
            return Err(ClientError::Decryption("ciphertext too short".into()));
        }
        let (nonce, sealed) = raw.split_at(NONCE_SIZE);
        let plain = cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| ClientError::Decryption("not addressed to this keypair".into()))?;
        String::from_utf8(plain).map_err(|e| ClientError::Decryption(e.to_string()))
    }

    fn conversation_cipher(&self, peer: &str) -> Result<ChaCha20Poly1305> {
        let xonly = parse_xonly(peer)?;
        let point = PublicKey::from_x_only_public_key(xonly, Parity::Even);
        let shared = ecdh::shared_secret_point(&point, &self.keypair.secret_key());
        let hk = Hkdf::<Sha256>::new(Some(KDF_SALT), &shared[..32]);
        let mut key = [0u8; 32];
        hk.expand(b"conversation", &mut key)
            .map_err(|e| ClientError::Crypto(e.to_string()))?;
        Ok(ChaCha20Poly1305::new(Key::from_slice(&key)))
    }
}

/// Accept a public key as hex or `npub1...` and return it as hex.
pub fn parse_pubkey(input: &str) -> Result<String> {
    let input = input.trim();
    if input.starts_with(NPUB_PREFIX) {
        let bytes = decode_bech32(input, "npub")?;
        let key = XOnlyPublicKey::from_slice(&bytes).map_err(|e| ClientError::Crypto(e.to_string()))?;
        return Ok(hex::encode(key.serialize()));
    }
    parse_xonly(input).map(|k| hex::encode(k.serialize()))
}

/// Encode a hex public key as `npub1...`.
pub fn npub_from_hex(pubkey: &str) -> Result<String> {
    let key = parse_xonly(pubkey)?;
    Ok(encode_bech32("npub", &key.serialize()))
}

fn parse_xonly(hex_key: &str) -> Result<XOnlyPublicKey> {
    let bytes = hex::decode(hex_key).map_err(|e| ClientError::Crypto(format!("pubkey: {e}")))?;
    XOnlyPublicKey::from_slice(&bytes).map_err(|e| ClientError::Crypto(format!("pubkey: {e}")))
}

fn encode_bech32(hrp: &str, data: &[u8]) -> String {
    // Both prefixes are valid HRPs and 32 bytes is far below the length limit.
    Hrp::parse(hrp)
        .ok()
        .and_then(|hrp| bech32::encode::<Bech32>(hrp, data).ok())
        .unwrap_or_default()
}

fn decode_bech32(input: &str, expected: &str) -> Result<Vec<u8>> {
    let (hrp, data) = bech32::decode(input).map_err(|e| ClientError::Crypto(e.to_string()))?;
    if hrp.to_lowercase() != expected {
        return Err(ClientError::Crypto(format!(
            "expected {expected} prefix, found {}",
            hrp.to_lowercase()
        )));
    }
    if data.len() != 32 {
        return Err(ClientError::Crypto(format!("expected 32 bytes, got {}", data.len())));
    }
    Ok(data)
}
