//! Nostr event model.

use secp256k1::{schnorr::Signature, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{ClientError, Result};

/// Event kinds understood by the client.
pub mod kind {
    /// Profile metadata (`{name, picture, ...}` JSON).
    pub const METADATA: u32 = 0;
    /// Public follow list; `p` tags carry followed keys.
    pub const CONTACTS: u32 = 3;
    /// Encrypted direct message addressed with a `p` tag.
    pub const DIRECT_MESSAGE: u32 = 4;
    /// Channel creation; the event id is the channel id.
    pub const CHANNEL_CREATE: u32 = 40;
    /// Channel metadata update tagged with the channel id.
    pub const CHANNEL_METADATA: u32 = 41;
    /// Message posted into a channel.
    pub const CHANNEL_MESSAGE: u32 = 42;
    /// Encrypted explicit contact list (`d` = `arcade-contacts`).
    pub const CONTACT_LIST: u32 = 30000;
    /// Encrypted joined-channel list (`d` = `arcade-channels`).
    pub const JOINED_CHANNELS: u32 = 30001;
    /// Parameterized-replaceable settings keyed by their `d` tag.
    pub const SETTINGS: u32 = 30199;
}

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// Tags appear as small arrays where the first element denotes the type and the
/// following elements hold data:
///
/// - `p` – references another author's public key (DM recipient, follow)
/// - `e` – links to another event ID (the channel a message belongs to)
/// - `d` – unique identifier for parameterized-replaceable events
/// - `x` – free-form marker such as `listing`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Tag(fields.into_iter().map(Into::into).collect())
    }

    /// Tag name, e.g. `p`.
    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// First data element after the name.
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }
}

/// Signed, immutable Nostr event.
///
/// ```json
/// {
///   "id": "aa11",
///   "pubkey": "3bf0c63f...",
///   "kind": 42,
///   "created_at": 1700000000,
///   "tags": [["e", "<channel id>", "", "root"]],
///   "content": "hello",
///   "sig": "deadbeef"
/// }
/// ```
///
/// Some producers emit non-string `content` (usually a bare number). Such
/// content is coerced to its JSON text on deserialization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (x-only, hex).
    pub pubkey: String,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Kind number, e.g. `4` or `30199`.
    pub kind: u32,
    /// Kind-specific tags.
    pub tags: Vec<Tag>,
    /// Event content body; ciphertext for encrypted kinds.
    #[serde(deserialize_with = "coerce_content")]
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

/// Event as received from a relay, before content coercion.
#[derive(Deserialize)]
struct WireEvent {
    id: String,
    pubkey: String,
    created_at: u64,
    kind: u32,
    #[serde(default)]
    tags: Vec<Tag>,
    #[serde(default)]
    content: Value,
    #[serde(default)]
    sig: String,
}

impl Event {
    /// Parse an event from relay JSON, checking that `id` matches the hash of
    /// the fields exactly as they were sent.
    pub fn from_wire(value: Value) -> Result<Self> {
        let wire: WireEvent = serde_json::from_value(value)?;
        let hash = canonical_hash(
            &wire.pubkey,
            wire.created_at,
            wire.kind,
            &wire.tags,
            &wire.content,
        )?;
        if hex::encode(hash) != wire.id {
            return Err(ClientError::InvalidEvent(format!("id mismatch for {}", wire.id)));
        }
        Ok(Event {
            id: wire.id,
            pubkey: wire.pubkey,
            created_at: wire.created_at,
            kind: wire.kind,
            tags: wire.tags,
            content: content_string(wire.content),
            sig: wire.sig,
        })
    }

    /// Recompute the event hash from its fields.
    pub fn hash(&self) -> Result<[u8; 32]> {
        canonical_hash(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &Value::String(self.content.clone()),
        )
    }

    /// Verify the event id and, when `check_sig` is set, its Schnorr signature.
    pub fn verify(&self, check_sig: bool) -> Result<()> {
        let hash = self.hash()?;
        if hex::encode(hash) != self.id {
            return Err(ClientError::InvalidEvent(format!("id mismatch for {}", self.id)));
        }
        if check_sig {
            verify_signature(&hash, &self.pubkey, &self.sig)?;
        }
        Ok(())
    }

    /// Value of the first tag named `name`.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.name() == Some(name))
            .and_then(Tag::value)
    }

    /// Values of every tag named `name`, in tag order.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.name() == Some(name))
            .filter_map(Tag::value)
    }

    /// Identifier of a parameterized-replaceable event.
    pub fn d_tag(&self) -> Option<&str> {
        self.tag_value("d")
    }

    /// Whether the event carries a tag with exactly this name and value.
    pub fn has_tag(&self, name: &str, value: &str) -> bool {
        self.tag_values(name).any(|v| v == value)
    }
}

/// Event fields prior to signing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedEvent {
    pub created_at: u64,
    pub kind: u32,
    pub tags: Vec<Tag>,
    pub content: String,
}

impl UnsignedEvent {
    /// New event stamped with the current time.
    pub fn new(kind: u32, content: impl Into<String>) -> Self {
        Self {
            created_at: now(),
            kind,
            tags: Vec::new(),
            content: content.into(),
        }
    }

    /// Append a tag.
    pub fn tag<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.push(Tag::new(fields));
        self
    }

    pub fn created_at(mut self, ts: u64) -> Self {
        self.created_at = ts;
        self
    }

    /// Stamp strictly after `prev`, so a replacement published within the same
    /// second as the event it replaces still wins latest-wins resolution.
    pub fn replacing(mut self, prev: Option<&Event>) -> Self {
        if let Some(prev) = prev {
            self.created_at = self.created_at.max(prev.created_at + 1);
        }
        self
    }
}

/// Current Unix time in seconds.
pub fn now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Hash `[0, pubkey, created_at, kind, tags, content]` as NIP-01 prescribes.
pub(crate) fn canonical_hash(
    pubkey: &str,
    created_at: u64,
    kind: u32,
    tags: &[Tag],
    content: &Value,
) -> Result<[u8; 32]> {
    let arr = serde_json::json!([0, pubkey, created_at, kind, tags, content]);
    let data = serde_json::to_vec(&arr)?;
    Ok(Sha256::digest(&data).into())
}

fn verify_signature(hash: &[u8; 32], pubkey: &str, sig: &str) -> Result<()> {
    let bad = |e: String| ClientError::InvalidEvent(format!("signature: {e}"));
    let sig_bytes = hex::decode(sig).map_err(|e| bad(e.to_string()))?;
    let pk_bytes = hex::decode(pubkey).map_err(|e| bad(e.to_string()))?;
    let sig = Signature::from_slice(&sig_bytes).map_err(|e| bad(e.to_string()))?;
    let pk = XOnlyPublicKey::from_slice(&pk_bytes).map_err(|e| bad(e.to_string()))?;
    let msg = Message::from_digest_slice(hash).map_err(|e| bad(e.to_string()))?;
    Secp256k1::verification_only()
        .verify_schnorr(&sig, &msg, &pk)
        .map_err(|e| bad(e.to_string()))
}

/// String form of a content value: strings verbatim, anything else as JSON text.
pub fn content_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn coerce_content<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(content_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::Keypair;

    fn signed(content: Value, kind: u32) -> Value {
        let secp = Secp256k1::new();
        let kp = Keypair::from_seckey_slice(&secp, &[1u8; 32]).unwrap();
        let pubkey = hex::encode(kp.x_only_public_key().0.serialize());
        let tags: Vec<Tag> = vec![];
        let hash = canonical_hash(&pubkey, 1, kind, &tags, &content).unwrap();
        let msg = Message::from_digest_slice(&hash).unwrap();
        let sig = secp.sign_schnorr_no_aux_rand(&msg, &kp);
        serde_json::json!({
            "id": hex::encode(hash),
            "pubkey": pubkey,
            "created_at": 1,
            "kind": kind,
            "tags": tags,
            "content": content,
            "sig": hex::encode(sig.as_ref()),
        })
    }

    #[test]
    fn hash_matches_reference_serialization() {
        let ev = Event {
            id: String::new(),
            pubkey: "00".repeat(32),
            kind: 1,
            created_at: 1,
            tags: vec![],
            content: String::new(),
            sig: String::new(),
        };
        let obj = serde_json::json!([0, ev.pubkey, ev.created_at, ev.kind, ev.tags, ev.content]);
        let expected: [u8; 32] = Sha256::digest(serde_json::to_vec(&obj).unwrap()).into();
        assert_eq!(ev.hash().unwrap(), expected);
    }

    #[test]
    fn from_wire_accepts_signed_event() {
        let ev = Event::from_wire(signed(Value::String("hi".into()), 42)).unwrap();
        assert_eq!(ev.content, "hi");
        ev.verify(true).unwrap();
    }

    #[test]
    fn numeric_content_is_coerced_after_id_check() {
        let ev = Event::from_wire(signed(serde_json::json!(12345), 42)).unwrap();
        assert_eq!(ev.content, "12345");
    }

    #[test]
    fn from_wire_rejects_id_mismatch() {
        let mut raw = signed(Value::String("hi".into()), 1);
        raw["content"] = Value::String("tampered".into());
        assert!(matches!(
            Event::from_wire(raw),
            Err(ClientError::InvalidEvent(_))
        ));
    }

    #[test]
    fn verify_rejects_bad_signature() {
        let mut ev = Event::from_wire(signed(Value::String("hi".into()), 1)).unwrap();
        ev.sig = "00".repeat(64);
        assert!(ev.verify(false).is_ok());
        assert!(ev.verify(true).is_err());
    }

    #[test]
    fn deserialize_coerces_number_content() {
        let ev: Event = serde_json::from_value(serde_json::json!({
            "id": "aa", "pubkey": "p", "created_at": 3, "kind": 42,
            "tags": [["e", "chan"]], "content": 7, "sig": ""
        }))
        .unwrap();
        assert_eq!(ev.content, "7");
        assert_eq!(ev.tag_value("e"), Some("chan"));
    }

    #[test]
    fn tag_helpers() {
        let ev = Event {
            id: "x".into(),
            pubkey: "p".into(),
            created_at: 0,
            kind: kind::SETTINGS,
            tags: vec![
                Tag::new(["d", "arcade-push"]),
                Tag::new(["p", "a"]),
                Tag::new(["p", "b"]),
            ],
            content: String::new(),
            sig: String::new(),
        };
        assert_eq!(ev.d_tag(), Some("arcade-push"));
        assert_eq!(ev.tag_values("p").collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(ev.has_tag("p", "b"));
        assert!(!ev.has_tag("e", "b"));
    }
}
