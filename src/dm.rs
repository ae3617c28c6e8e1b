//! Encrypted direct messages and the one-entry-per-peer inbox view.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ClientError, Result};
use crate::event::{kind, Event, UnsignedEvent};
use crate::filter::Filter;
use crate::identity::Identity;
use crate::merge;
use crate::source::EventSource;

/// Inbox fetches ask each relay for at most this many DMs per direction.
pub const INBOX_LIMIT: usize = 500;

/// Latest message exchanged with one peer, content decrypted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectMessage {
    /// The DM event with `content` replaced by its plaintext.
    pub event: Event,
    /// The other party, whichever side authored the event.
    pub peer: String,
    pub last_message_at: u64,
}

impl DirectMessage {
    fn new(event: Event, peer: String) -> Self {
        Self {
            last_message_at: event.created_at,
            event,
            peer,
        }
    }
}

/// The party other than `me` in a DM event.
fn counterpart<'a>(ev: &'a Event, me: &str) -> Option<&'a str> {
    if ev.pubkey == me {
        ev.tag_value("p")
    } else if ev.has_tag("p", me) {
        Some(ev.pubkey.as_str())
    } else {
        None
    }
}

/// Reduce already-decrypted DMs to one entry per peer, newest first.
pub fn inbox_view(me: &str, events: impl IntoIterator<Item = Event>) -> Vec<DirectMessage> {
    let latest = merge::latest_by(events, |ev| counterpart(ev, me).map(str::to_string));
    let mut view: Vec<DirectMessage> = latest
        .into_iter()
        .map(|(peer, ev)| DirectMessage::new(ev, peer))
        .collect();
    view.sort_by(|a, b| merge::canonical_order(&a.event, &b.event));
    view
}

/// Builds, decrypts and reduces DM events for one identity.
#[derive(Clone)]
pub struct PrivateMessageManager {
    source: Arc<dyn EventSource>,
}

impl PrivateMessageManager {
    pub fn new(source: Arc<dyn EventSource>) -> Self {
        Self { source }
    }

    /// Latest DM per peer among `peers`.
    ///
    /// `base` supplies limit/time bounds for both directions. Events that fail
    /// to decrypt are skipped, never reported.
    pub async fn list(
        &self,
        ident: &Identity,
        base: Filter,
        local_only: bool,
        peers: &[String],
    ) -> Vec<DirectMessage> {
        if peers.is_empty() {
            return vec![];
        }
        let me = ident.pubkey();
        let incoming = base
            .clone()
            .kinds([kind::DIRECT_MESSAGE])
            .authors(peers.iter().cloned())
            .tag("p", [me]);
        let outgoing = base
            .kinds([kind::DIRECT_MESSAGE])
            .authors([me])
            .tag("p", peers.iter().cloned());
        let events = self.source.fetch(&[incoming, outgoing], local_only).await;

        let wanted: HashSet<&str> = peers.iter().map(String::as_str).collect();
        let decrypted = events.into_iter().filter_map(|mut ev| {
            let peer = counterpart(&ev, me).filter(|p| wanted.contains(p))?.to_string();
            match ident.decrypt_from(&peer, &ev.content) {
                Ok(plain) => {
                    ev.content = plain;
                    Some(ev)
                }
                Err(e) => {
                    debug!(id = %ev.id, peer = %peer, "skipping DM: {e}");
                    None
                }
            }
        });
        inbox_view(me, decrypted)
    }

    /// Encrypt, sign and publish a DM to `peer`. The returned entry carries the
    /// plaintext so callers can insert it without refetching.
    pub async fn send(&self, ident: &Identity, peer: &str, plaintext: &str) -> Result<DirectMessage> {
        if plaintext.trim().is_empty() {
            return Err(ClientError::Validation("Message too short".into()));
        }
        let ciphertext = ident.encrypt_for(peer, plaintext)?;
        let event = ident.sign(UnsignedEvent::new(kind::DIRECT_MESSAGE, ciphertext).tag(["p", peer]))?;
        self.source.publish(&event).await?;
        let mut shown = event;
        shown.content = plaintext.to_string();
        Ok(DirectMessage::new(shown, peer.to_string()))
    }
}
