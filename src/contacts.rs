//! Contacts and the remote contact list.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ClientError, Result};
use crate::event::{kind, Event, UnsignedEvent};
use crate::filter::Filter;
use crate::identity::Identity;
use crate::merge;
use crate::source::EventSource;

/// `d` tag of the encrypted explicit contact list.
pub const CONTACT_LIST_D: &str = "arcade-contacts";

/// A known peer. Unique by `pubkey`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub pubkey: String,
    /// The contact uses our encrypted messaging.
    #[serde(default)]
    pub secret: bool,
    /// Inferred from a public follow list rather than added explicitly.
    #[serde(default)]
    pub legacy: bool,
}

impl Contact {
    pub fn new(pubkey: impl Into<String>) -> Self {
        Self {
            pubkey: pubkey.into(),
            secret: false,
            legacy: false,
        }
    }

    pub fn legacy(pubkey: impl Into<String>) -> Self {
        Self {
            legacy: true,
            ..Self::new(pubkey)
        }
    }
}

/// Contacts implied by a kind-3 follow list.
pub fn follows_to_contacts(follows: &Event) -> Vec<Contact> {
    let mut seen = std::collections::HashSet::new();
    follows
        .tag_values("p")
        .filter(|pk| seen.insert(pk.to_string()))
        .map(Contact::legacy)
        .collect()
}

/// Remote mirror of the user's contact set.
#[async_trait]
pub trait ContactDirectory: Send + Sync {
    async fn list(&self, ident: &Identity) -> Result<Vec<Contact>>;
    async fn add(&self, ident: &Identity, contact: &Contact) -> Result<()>;
    async fn remove(&self, ident: &Identity, pubkey: &str) -> Result<()>;
}

/// Contact directory stored on relays.
///
/// Legacy contacts come from the latest kind-3 follow list; explicit ones live
/// in a kind-30000 list encrypted to the user's own key.
pub struct RelayContacts {
    source: Arc<dyn EventSource>,
    /// `(owner, kind)` pairs whose list has been read or written here.
    known_lists: Mutex<HashSet<(String, u32)>>,
}

/// Current state of both remote lists.
struct Lists {
    follows: Option<Event>,
    explicit_event: Option<Event>,
    explicit: Vec<Contact>,
}

impl RelayContacts {
    pub fn new(source: Arc<dyn EventSource>) -> Self {
        Self {
            source,
            known_lists: Mutex::new(HashSet::new()),
        }
    }

    fn filter(ident: &Identity) -> Filter {
        Filter::new()
            .authors([ident.pubkey()])
            .kinds([kind::CONTACTS, kind::CONTACT_LIST])
    }

    fn known(&self) -> std::sync::MutexGuard<'_, HashSet<(String, u32)>> {
        self.known_lists.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn mark_known(&self, ident: &Identity, kind: u32) {
        self.known().insert((ident.pubkey().to_string(), kind));
    }

    fn split(&self, ident: &Identity, events: Vec<Event>) -> (Option<Event>, Option<Event>) {
        let follows = merge::latest_of_kind(events.iter().cloned(), kind::CONTACTS);
        let list_event = merge::latest_with_d(events, kind::CONTACT_LIST, CONTACT_LIST_D);
        if follows.is_some() {
            self.mark_known(ident, kind::CONTACTS);
        }
        if list_event.is_some() {
            self.mark_known(ident, kind::CONTACT_LIST);
        }
        (follows, list_event)
    }

    /// Best-effort read. An unreadable explicit list contributes nothing.
    async fn fetch_lists(&self, ident: &Identity) -> Lists {
        let events = self.source.fetch(&[Self::filter(ident)], false).await;
        let (follows, explicit_event) = self.split(ident, events);
        let explicit = match &explicit_event {
            Some(ev) => decode_list(ident, ev).unwrap_or_else(|e| {
                warn!(id = %ev.id, "unreadable contact list: {e}");
                vec![]
            }),
            None => vec![],
        };
        Lists {
            follows,
            explicit_event,
            explicit,
        }
    }

    /// Read ahead of a rewrite. Fails when no relay answered, when a list seen
    /// earlier is missing, or when the explicit list cannot be decrypted.
    async fn lists_for_update(&self, ident: &Identity) -> Result<Lists> {
        let events = self.source.fetch_confirmed(&[Self::filter(ident)]).await?;
        let (follows, explicit_event) = self.split(ident, events);
        let known = self.known();
        for (present, list_kind) in [
            (follows.is_some(), kind::CONTACTS),
            (explicit_event.is_some(), kind::CONTACT_LIST),
        ] {
            if !present && known.contains(&(ident.pubkey().to_string(), list_kind)) {
                return Err(ClientError::Transport(format!(
                    "kind {list_kind} contact list missing from relays"
                )));
            }
        }
        drop(known);
        let explicit = match &explicit_event {
            Some(ev) => decode_list(ident, ev)?,
            None => vec![],
        };
        Ok(Lists {
            follows,
            explicit_event,
            explicit,
        })
    }

    async fn publish_list(&self, ident: &Identity, prev: Option<&Event>, contacts: &[Contact]) -> Result<()> {
        let content = ident.encrypt_for(ident.pubkey(), &serde_json::to_string(contacts)?)?;
        let ev = ident.sign(
            UnsignedEvent::new(kind::CONTACT_LIST, content)
                .tag(["d", CONTACT_LIST_D])
                .replacing(prev),
        )?;
        self.source.publish(&ev).await?;
        self.mark_known(ident, kind::CONTACT_LIST);
        Ok(())
    }
}

fn decode_list(ident: &Identity, ev: &Event) -> Result<Vec<Contact>> {
    let plain = ident.decrypt_from(ident.pubkey(), &ev.content)?;
    Ok(serde_json::from_str(&plain)?)
}

#[async_trait]
impl ContactDirectory for RelayContacts {
    async fn list(&self, ident: &Identity) -> Result<Vec<Contact>> {
        let Lists { follows, explicit, .. } = self.fetch_lists(ident).await;
        let mut merged: BTreeMap<String, Contact> = BTreeMap::new();
        if let Some(follows) = follows {
            for c in follows_to_contacts(&follows) {
                merged.insert(c.pubkey.clone(), c);
            }
        }
        for c in explicit {
            merged.insert(c.pubkey.clone(), c);
        }
        Ok(merged.into_values().collect())
    }

    async fn add(&self, ident: &Identity, contact: &Contact) -> Result<()> {
        let Lists {
            explicit_event: prev,
            mut explicit,
            ..
        } = self.lists_for_update(ident).await?;
        match explicit.iter_mut().find(|c| c.pubkey == contact.pubkey) {
            Some(existing) => *existing = contact.clone(),
            None => explicit.push(contact.clone()),
        }
        self.publish_list(ident, prev.as_ref(), &explicit).await
    }

    async fn remove(&self, ident: &Identity, pubkey: &str) -> Result<()> {
        let Lists {
            follows,
            explicit_event: prev,
            mut explicit,
        } = self.lists_for_update(ident).await?;
        let before = explicit.len();
        explicit.retain(|c| c.pubkey != pubkey);
        if explicit.len() != before {
            self.publish_list(ident, prev.as_ref(), &explicit).await?;
        }
        if let Some(follows) = follows.filter(|f| f.has_tag("p", pubkey)) {
            let mut unsigned =
                UnsignedEvent::new(kind::CONTACTS, follows.content.clone()).replacing(Some(&follows));
            unsigned.tags = follows
                .tags
                .iter()
                .filter(|t| !(t.name() == Some("p") && t.value() == Some(pubkey)))
                .cloned()
                .collect();
            self.source.publish(&ident.sign(unsigned)?).await?;
        }
        Ok(())
    }
}
