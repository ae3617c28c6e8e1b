//! Channel aggregate, the arena that owns channels, and the relay-backed
//! channel directory.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ClientError, Result};
use crate::event::{kind, Event, UnsignedEvent};
use crate::filter::Filter;
use crate::identity::Identity;
use crate::merge;
use crate::source::EventSource;

/// Messages requested per channel fetch.
pub const MESSAGE_LIMIT: usize = 100;
/// `d` tag of the joined-channel list.
pub const JOINED_CHANNELS_D: &str = "arcade-channels";

/// Display metadata carried by kind 40/41 events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub picture: Option<String>,
    #[serde(default)]
    pub about: String,
}

/// Everything needed to address and decrypt a channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub picture: Option<String>,
    #[serde(default)]
    pub about: String,
    #[serde(default)]
    pub is_private: bool,
    /// Symmetric channel key (hex secret); empty for public channels.
    #[serde(default)]
    pub privkey: String,
}

impl ChannelInfo {
    pub fn public(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Uninitialized,
    Loading,
    Ready,
}

/// Result of a metadata refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaOutcome {
    Updated,
    /// No metadata event was found; existing metadata was kept.
    NotFound,
}

/// Remote channel membership and content.
#[async_trait]
pub trait ChannelDirectory: Send + Sync {
    /// Messages of one channel, decrypted when `privkey` is set.
    async fn list_messages(
        &self,
        channel_id: &str,
        privkey: &str,
        limit: usize,
        local_only: bool,
    ) -> Result<Vec<Event>>;

    async fn get_meta(&self, channel_id: &str, privkey: &str, refresh: bool) -> Result<Option<ChannelMeta>>;

    /// Make the remote joined set include every id in `ids`.
    async fn join_all(&self, ident: &Identity, ids: &[String]) -> Result<()>;

    async fn leave(&self, ident: &Identity, id: &str) -> Result<()>;

    async fn list_joined(&self, ident: &Identity) -> Result<Vec<String>>;

    /// Joined channels with metadata and, for private ones, their keys.
    async fn list_channels(&self, ident: &Identity, refresh: bool) -> Result<Vec<ChannelInfo>>;

    async fn create(&self, ident: &Identity, meta: &ChannelMeta, private: bool) -> Result<ChannelInfo>;

    /// Publish a message; the returned event carries the plaintext content.
    async fn send_message(
        &self,
        ident: &Identity,
        channel_id: &str,
        privkey: &str,
        text: &str,
    ) -> Result<Event>;
}

/// One channel's metadata, membership and message history.
///
/// Messages are held in canonical read order (newest first, ties by id) with
/// no duplicate ids. The "last message" accessors are derived from that
/// sequence on every call.
#[derive(Debug, Clone)]
pub struct Channel {
    id: String,
    name: String,
    picture: Option<String>,
    about: String,
    is_private: bool,
    privkey: String,
    members: BTreeSet<String>,
    messages: Vec<Event>,
    status: ChannelStatus,
}

impl Channel {
    pub fn new(id: impl Into<String>) -> Self {
        Self::from_info(ChannelInfo::public(id))
    }

    pub fn from_info(info: ChannelInfo) -> Self {
        Self {
            is_private: info.is_private || !info.privkey.is_empty(),
            id: info.id,
            name: info.name,
            picture: info.picture,
            about: info.about,
            privkey: info.privkey,
            members: BTreeSet::new(),
            messages: Vec::new(),
            status: ChannelStatus::Uninitialized,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn picture(&self) -> Option<&str> {
        self.picture.as_deref()
    }

    pub fn about(&self) -> &str {
        &self.about
    }

    pub fn is_private(&self) -> bool {
        self.is_private
    }

    pub fn privkey(&self) -> &str {
        &self.privkey
    }

    pub fn status(&self) -> ChannelStatus {
        self.status
    }

    /// Attach a decryption key without touching history.
    pub fn set_privkey(&mut self, privkey: impl Into<String>) {
        self.privkey = privkey.into();
        self.is_private = !self.privkey.is_empty();
    }

    pub fn messages(&self) -> &[Event] {
        &self.messages
    }

    /// Messages marked as marketplace listings (`["x", "listing"]`).
    pub fn listing(&self) -> Vec<&Event> {
        self.messages
            .iter()
            .filter(|m| m.has_tag("x", "listing"))
            .collect()
    }

    pub fn members(&self) -> Vec<String> {
        self.members.iter().cloned().collect()
    }

    /// Newest message.
    pub fn last_message(&self) -> Option<&Event> {
        self.messages.first()
    }

    pub fn last_message_text(&self) -> Option<&str> {
        self.last_message().map(|m| m.content.as_str())
    }

    pub fn last_message_pubkey(&self) -> Option<&str> {
        self.last_message().map(|m| m.pubkey.as_str())
    }

    pub fn last_message_at(&self) -> Option<u64> {
        self.last_message().map(|m| m.created_at)
    }

    pub fn info(&self) -> ChannelInfo {
        ChannelInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            picture: self.picture.clone(),
            about: self.about.clone(),
            is_private: self.is_private,
            privkey: self.privkey.clone(),
        }
    }

    /// Replace the message history with the reduced remote view.
    pub async fn fetch_messages(&mut self, dir: &dyn ChannelDirectory) -> Result<()> {
        let previous = self.status;
        self.status = ChannelStatus::Loading;
        match dir
            .list_messages(&self.id, &self.privkey, MESSAGE_LIMIT, false)
            .await
        {
            Ok(events) => {
                self.messages = merge::ordered(events);
                self.status = ChannelStatus::Ready;
                debug!(channel = %self.id, count = self.messages.len(), "messages fetched");
                Ok(())
            }
            Err(e) => {
                self.status = previous;
                Err(e)
            }
        }
    }

    /// Refresh name, picture and about. Absence keeps what is there.
    pub async fn fetch_meta(&mut self, dir: &dyn ChannelDirectory) -> Result<MetaOutcome> {
        match dir.get_meta(&self.id, &self.privkey, true).await? {
            Some(meta) => {
                self.name = meta.name;
                self.picture = meta.picture;
                self.about = meta.about;
                Ok(MetaOutcome::Updated)
            }
            None => {
                warn!(channel = %self.id, "channel metadata not found");
                Ok(MetaOutcome::NotFound)
            }
        }
    }

    /// Insert a locally-originated or pushed message. Returns false when the
    /// id is already present.
    pub fn add_message(&mut self, event: Event) -> bool {
        if self.messages.iter().any(|m| m.id == event.id) {
            return false;
        }
        let pos = self
            .messages
            .partition_point(|m| merge::canonical_order(m, &event).is_lt());
        self.messages.insert(pos, event);
        true
    }

    pub fn add_members<I, S>(&mut self, list: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.members.extend(list.into_iter().map(Into::into));
    }

    /// Back to loading with an empty history, e.g. after an identity switch.
    pub fn reset(&mut self) {
        self.messages.clear();
        self.status = ChannelStatus::Loading;
    }

    /// Post `text`, then insert the published message locally.
    pub async fn send_message(
        &mut self,
        dir: &dyn ChannelDirectory,
        ident: &Identity,
        text: &str,
    ) -> Result<Event> {
        if text.trim().is_empty() {
            return Err(ClientError::Validation("Message too short".into()));
        }
        let ev = dir.send_message(ident, &self.id, &self.privkey, text).await?;
        self.add_message(ev.clone());
        Ok(ev)
    }
}

/// Every channel the process knows about, addressed by id.
#[derive(Debug, Default)]
pub struct ChannelArena {
    channels: HashMap<String, Channel>,
}

impl ChannelArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&Channel> {
        self.channels.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Channel> {
        self.channels.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.channels.contains_key(id)
    }

    /// The channel with `id`, created empty if unknown.
    pub fn ensure(&mut self, id: &str) -> &mut Channel {
        self.channels
            .entry(id.to_string())
            .or_insert_with(|| Channel::new(id))
    }

    /// Insert from `info` unless already known; a known channel only picks up
    /// a key it was missing.
    pub fn insert_info(&mut self, info: ChannelInfo) -> &mut Channel {
        let id = info.id.clone();
        let channel = self
            .channels
            .entry(id)
            .or_insert_with(|| Channel::from_info(info.clone()));
        if channel.privkey.is_empty() && !info.privkey.is_empty() {
            channel.set_privkey(info.privkey);
        }
        channel
    }

    pub fn remove(&mut self, id: &str) -> Option<Channel> {
        self.channels.remove(id)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Addressing data for every channel, sorted by id.
    pub fn snapshot(&self) -> Vec<ChannelInfo> {
        let mut out: Vec<ChannelInfo> = self.channels.values().map(Channel::info).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn restore(&mut self, infos: Vec<ChannelInfo>) {
        for info in infos {
            self.insert_info(info);
        }
    }
}

/// One entry of the joined-channel list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct JoinedChannel {
    id: String,
    #[serde(default)]
    privkey: String,
}

/// Channel directory stored on relays (NIP-28 channels plus an encrypted
/// joined-channel list).
pub struct RelayChannels {
    source: Arc<dyn EventSource>,
    /// Owners whose joined list has been read or written through this directory.
    known_lists: Mutex<HashSet<String>>,
}

impl RelayChannels {
    pub fn new(source: Arc<dyn EventSource>) -> Self {
        Self {
            source,
            known_lists: Mutex::new(HashSet::new()),
        }
    }

    fn joined_filter(ident: &Identity) -> Filter {
        Filter::new()
            .authors([ident.pubkey()])
            .kinds([kind::JOINED_CHANNELS])
            .tag("d", [JOINED_CHANNELS_D])
    }

    fn mark_known(&self, pubkey: &str) {
        self.known_lists
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(pubkey.to_string());
    }

    fn is_known(&self, pubkey: &str) -> bool {
        self.known_lists
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(pubkey)
    }

    fn decode_joined(ident: &Identity, ev: &Event) -> Result<Vec<JoinedChannel>> {
        let plain = ident.decrypt_from(ident.pubkey(), &ev.content)?;
        Ok(serde_json::from_str(&plain)?)
    }

    /// Best-effort read for display. Outages and unreadable lists give nothing.
    async fn joined(&self, ident: &Identity) -> Vec<JoinedChannel> {
        let events = self.source.fetch(&[Self::joined_filter(ident)], false).await;
        let Some(ev) = merge::latest_with_d(events, kind::JOINED_CHANNELS, JOINED_CHANNELS_D) else {
            return vec![];
        };
        self.mark_known(ident.pubkey());
        Self::decode_joined(ident, &ev).unwrap_or_else(|e| {
            warn!(id = %ev.id, "unreadable joined-channel list: {e}");
            vec![]
        })
    }

    /// Read ahead of a rewrite. Fails unless the current list is known exactly:
    /// no relay answered, a previously seen list went missing, or the list
    /// cannot be decrypted.
    async fn joined_for_update(&self, ident: &Identity) -> Result<(Option<Event>, Vec<JoinedChannel>)> {
        let events = self.source.fetch_confirmed(&[Self::joined_filter(ident)]).await?;
        let Some(ev) = merge::latest_with_d(events, kind::JOINED_CHANNELS, JOINED_CHANNELS_D) else {
            if self.is_known(ident.pubkey()) {
                return Err(ClientError::Transport("joined-channel list missing from relays".into()));
            }
            return Ok((None, vec![]));
        };
        self.mark_known(ident.pubkey());
        let list = Self::decode_joined(ident, &ev)?;
        Ok((Some(ev), list))
    }

    async fn save_joined(&self, ident: &Identity, prev: Option<&Event>, list: &[JoinedChannel]) -> Result<()> {
        let content = ident.encrypt_for(ident.pubkey(), &serde_json::to_string(list)?)?;
        let ev = ident.sign(
            UnsignedEvent::new(kind::JOINED_CHANNELS, content)
                .tag(["d", JOINED_CHANNELS_D])
                .replacing(prev),
        )?;
        self.source.publish(&ev).await?;
        self.mark_known(ident.pubkey());
        Ok(())
    }
}

fn channel_key(privkey: &str) -> Result<Option<Identity>> {
    if privkey.is_empty() {
        return Ok(None);
    }
    Identity::from_secret_hex(privkey).map(Some)
}

fn seal(key: &Identity, text: &str) -> Result<String> {
    key.encrypt_for(key.pubkey(), text)
}

fn open(key: &Identity, text: &str) -> Result<String> {
    key.decrypt_from(key.pubkey(), text)
}

#[async_trait]
impl ChannelDirectory for RelayChannels {
    async fn list_messages(
        &self,
        channel_id: &str,
        privkey: &str,
        limit: usize,
        local_only: bool,
    ) -> Result<Vec<Event>> {
        let key = channel_key(privkey)?;
        let filter = Filter::new()
            .kinds([kind::CHANNEL_MESSAGE])
            .tag("e", [channel_id])
            .limit(limit);
        let events = self.source.fetch(&[filter], local_only).await;
        let Some(key) = key else {
            return Ok(events);
        };
        Ok(events
            .into_iter()
            .filter_map(|mut ev| match open(&key, &ev.content) {
                Ok(plain) => {
                    ev.content = plain;
                    Some(ev)
                }
                Err(e) => {
                    debug!(id = %ev.id, "skipping channel message: {e}");
                    None
                }
            })
            .collect())
    }

    async fn get_meta(&self, channel_id: &str, privkey: &str, refresh: bool) -> Result<Option<ChannelMeta>> {
        let key = channel_key(privkey)?;
        let filters = [
            Filter::new().ids([channel_id]).kinds([kind::CHANNEL_CREATE]),
            Filter::new().kinds([kind::CHANNEL_METADATA]).tag("e", [channel_id]),
        ];
        let events = self.source.fetch(&filters, !refresh).await;
        let creator = events
            .iter()
            .find(|ev| ev.kind == kind::CHANNEL_CREATE && ev.id == channel_id)
            .map(|ev| ev.pubkey.clone());
        // Only the creator may update metadata once the creation event is known.
        let candidates = events.into_iter().filter(|ev| match ev.kind {
            kind::CHANNEL_CREATE => ev.id == channel_id,
            kind::CHANNEL_METADATA => creator.as_ref().map_or(true, |c| c == &ev.pubkey),
            _ => false,
        });
        let Some(latest) = merge::latest_by(candidates, |_| Some(())).remove(&()) else {
            return Ok(None);
        };
        let content = match &key {
            Some(key) => open(key, &latest.content)?,
            None => latest.content,
        };
        Ok(Some(serde_json::from_str(&content)?))
    }

    async fn join_all(&self, ident: &Identity, ids: &[String]) -> Result<()> {
        let (prev, mut list) = self.joined_for_update(ident).await?;
        let mut changed = false;
        for id in ids {
            if !list.iter().any(|j| &j.id == id) {
                list.push(JoinedChannel {
                    id: id.clone(),
                    privkey: String::new(),
                });
                changed = true;
            }
        }
        if !changed && prev.is_some() {
            return Ok(());
        }
        self.save_joined(ident, prev.as_ref(), &list).await
    }

    async fn leave(&self, ident: &Identity, id: &str) -> Result<()> {
        let (prev, mut list) = self.joined_for_update(ident).await?;
        let before = list.len();
        list.retain(|j| j.id != id);
        if list.len() == before {
            return Ok(());
        }
        self.save_joined(ident, prev.as_ref(), &list).await
    }

    async fn list_joined(&self, ident: &Identity) -> Result<Vec<String>> {
        Ok(self.joined(ident).await.into_iter().map(|j| j.id).collect())
    }

    async fn list_channels(&self, ident: &Identity, refresh: bool) -> Result<Vec<ChannelInfo>> {
        let list = self.joined(ident).await;
        let mut out = Vec::with_capacity(list.len());
        for entry in list {
            let meta = match self.get_meta(&entry.id, &entry.privkey, refresh).await {
                Ok(meta) => meta.unwrap_or_default(),
                Err(e) => {
                    warn!(channel = %entry.id, "metadata unavailable: {e}");
                    ChannelMeta::default()
                }
            };
            out.push(ChannelInfo {
                is_private: !entry.privkey.is_empty(),
                id: entry.id,
                name: meta.name,
                picture: meta.picture,
                about: meta.about,
                privkey: entry.privkey,
            });
        }
        Ok(out)
    }

    async fn create(&self, ident: &Identity, meta: &ChannelMeta, private: bool) -> Result<ChannelInfo> {
        // The list must be readable before the channel exists remotely.
        let (prev, mut list) = self.joined_for_update(ident).await?;
        let plain = serde_json::to_string(meta)?;
        let key = private.then(Identity::generate);
        let content = match &key {
            Some(key) => seal(key, &plain)?,
            None => plain,
        };
        let ev = ident.sign(UnsignedEvent::new(kind::CHANNEL_CREATE, content))?;
        self.source.publish(&ev).await?;

        let privkey = key.map(|k| k.secret_hex()).unwrap_or_default();
        list.push(JoinedChannel {
            id: ev.id.clone(),
            privkey: privkey.clone(),
        });
        self.save_joined(ident, prev.as_ref(), &list).await?;
        Ok(ChannelInfo {
            id: ev.id,
            name: meta.name.clone(),
            picture: meta.picture.clone(),
            about: meta.about.clone(),
            is_private: private,
            privkey,
        })
    }

    async fn send_message(
        &self,
        ident: &Identity,
        channel_id: &str,
        privkey: &str,
        text: &str,
    ) -> Result<Event> {
        let content = match channel_key(privkey)? {
            Some(key) => seal(&key, text)?,
            None => text.to_string(),
        };
        let ev = ident.sign(
            UnsignedEvent::new(kind::CHANNEL_MESSAGE, content).tag(["e", channel_id, "", "root"]),
        )?;
        self.source.publish(&ev).await?;
        Ok(Event {
            content: text.to_string(),
            ..ev
        })
    }
}
