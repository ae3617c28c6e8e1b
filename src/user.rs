//! User aggregate: the root state and its orchestration flows.
//!
//! Every transition builds a complete next [`UserState`] and swaps it in, so
//! observers (see [`UserStore::subscribe`]) never see a half-applied change.
//! The private key lives only in the store's [`Identity`] and in secure
//! storage; it is never part of a published snapshot.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelArena, ChannelDirectory, ChannelInfo, ChannelMeta, RelayChannels};
use crate::contacts::{Contact, ContactDirectory, RelayContacts};
use crate::dm::{inbox_view, DirectMessage, PrivateMessageManager, INBOX_LIMIT};
use crate::error::{ClientError, Result};
use crate::event::{kind, Event, UnsignedEvent};
use crate::filter::Filter;
use crate::identity::{Identity, NSEC_MIN_LEN, NSEC_PREFIX};
use crate::naming::NameRegistry;
use crate::profile::{self, Metadata, Profile, PushChannel, PushTokenProvider};
use crate::source::{EventSource, DEFAULT_RELAYS};
use crate::store::{BlobStore, SecureStore};

/// Channels a new account starts in.
pub const DEFAULT_CHANNELS: [&str; 3] = [
    "8b28c7374ba5891ea65db9a2d1234ecc369755c35f6db1a54f18424500dea4a0",
    "5b93e807c4bc055693be881f8cfe65b36d1f7e6d3b473ee58e8275216ff74393",
    "3ff1f0a932e0a51f8a7d0241d5882f0b26c76de83f83c1b4c1efe42adadb27bd",
];

/// Secure-storage key of the private key.
pub const PRIVKEY_KEY: &str = "privkey";
const META_BLOB: &str = "meta";
const SESSION_BLOB: &str = "session";

/// Snapshot of everything the user aggregate holds, minus key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserState {
    pub pubkey: String,
    pub metadata: Option<Metadata>,
    pub is_logged_in: bool,
    /// Joined channel ids; channel state itself lives in the arena.
    pub channels: Vec<String>,
    pub contacts: Vec<Contact>,
    /// Latest DM per peer, newest first.
    pub priv_messages: Vec<DirectMessage>,
    pub relays: Vec<String>,
}

impl Default for UserState {
    fn default() -> Self {
        Self {
            pubkey: String::new(),
            metadata: None,
            is_logged_in: false,
            channels: Vec::new(),
            contacts: Vec::new(),
            priv_messages: Vec::new(),
            relays: DEFAULT_RELAYS.iter().map(|r| r.to_string()).collect(),
        }
    }
}

impl UserState {
    pub fn find_contact(&self, pubkey: &str) -> Option<&Contact> {
        self.contacts.iter().find(|c| c.pubkey == pubkey)
    }
}

/// Persisted between runs alongside the metadata blob.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Session {
    #[serde(default)]
    channels: Vec<ChannelInfo>,
    #[serde(default)]
    contacts: Vec<Contact>,
    #[serde(default)]
    relays: Vec<String>,
}

/// Fields collected at signup.
#[derive(Debug, Clone, Default)]
pub struct SignupForm {
    pub username: String,
    pub display_name: String,
    pub about: String,
    pub picture: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginOutcome {
    /// Input does not look like an encoded private key; nothing happened.
    Ignored,
    /// Input looked like a key but login failed; state is unchanged.
    InvalidKey,
    LoggedIn,
}

/// External collaborators of the user aggregate.
#[derive(Clone)]
pub struct Services {
    pub source: Arc<dyn EventSource>,
    pub channels: Arc<dyn ChannelDirectory>,
    pub contacts: Arc<dyn ContactDirectory>,
    pub names: Arc<dyn NameRegistry>,
    pub secure: Arc<dyn SecureStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub push: PushChannel,
    pub tokens: Arc<dyn PushTokenProvider>,
}

impl Services {
    /// Channel and contact directories backed by `source`.
    pub fn relay_backed(
        source: Arc<dyn EventSource>,
        names: Arc<dyn NameRegistry>,
        secure: Arc<dyn SecureStore>,
        blobs: Arc<dyn BlobStore>,
        push: PushChannel,
        tokens: Arc<dyn PushTokenProvider>,
    ) -> Self {
        Self {
            channels: Arc::new(RelayChannels::new(source.clone())),
            contacts: Arc::new(RelayContacts::new(source.clone())),
            source,
            names,
            secure,
            blobs,
            push,
            tokens,
        }
    }
}

/// Owner of the user state, the identity and the channel arena.
///
/// Mutating flows take `&mut self`, so two flows can never interleave on
/// the same store.
pub struct UserStore {
    services: Services,
    identity: Option<Identity>,
    state: UserState,
    arena: ChannelArena,
    /// Relays of the logged-out state and of sessions that saved none.
    base_relays: Vec<String>,
    tx: watch::Sender<UserState>,
}

impl UserStore {
    pub fn new(services: Services) -> Self {
        let state = UserState::default();
        let (tx, _) = watch::channel(state.clone());
        Self {
            services,
            identity: None,
            base_relays: state.relays.clone(),
            state,
            arena: ChannelArena::new(),
            tx,
        }
    }

    /// Use `relays` instead of the built-in defaults. They should match the
    /// relays the event source was built with.
    pub fn with_relays(mut self, relays: Vec<String>) -> Self {
        self.base_relays = relays.clone();
        self.update(|s| s.relays = relays);
        self
    }

    pub fn state(&self) -> &UserState {
        &self.state
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Receiver of every snapshot from now on, starting with the current one.
    pub fn subscribe(&self) -> watch::Receiver<UserState> {
        self.tx.subscribe()
    }

    pub fn arena(&self) -> &ChannelArena {
        &self.arena
    }

    /// Joined channels in join order.
    pub fn joined_channels(&self) -> Vec<&Channel> {
        self.state
            .channels
            .iter()
            .filter_map(|id| self.arena.get(id))
            .collect()
    }

    fn require_identity(&self) -> Result<Identity> {
        self.identity.clone().ok_or(ClientError::NotLoggedIn)
    }

    fn replace(&mut self, next: UserState) {
        self.state = next;
        self.tx.send_replace(self.state.clone());
    }

    fn update(&mut self, f: impl FnOnce(&mut UserState)) {
        let mut next = self.state.clone();
        f(&mut next);
        self.replace(next);
    }

    /// Reload identity, metadata and session from local storage. Returns
    /// whether a stored identity was found.
    pub async fn restore(&mut self) -> Result<bool> {
        let Some(secret) = self.services.secure.get(PRIVKEY_KEY).await? else {
            return Ok(false);
        };
        let ident = match Identity::from_secret_hex(&secret) {
            Ok(ident) => ident,
            Err(e) => {
                warn!("stored private key unusable: {e}");
                return Ok(false);
            }
        };
        let metadata = self.load_blob::<Metadata>(META_BLOB).await;
        let session = self.load_blob::<Session>(SESSION_BLOB).await.unwrap_or_default();

        let channels = session.channels.iter().map(|c| c.id.clone()).collect();
        self.arena.restore(session.channels);
        let relays = if session.relays.is_empty() {
            self.base_relays.clone()
        } else {
            session.relays
        };
        self.services.source.set_relays(relays.clone()).await;
        let next = UserState {
            pubkey: ident.pubkey().to_string(),
            metadata,
            is_logged_in: true,
            channels,
            contacts: session.contacts,
            priv_messages: Vec::new(),
            relays,
        };
        self.identity = Some(ident);
        self.replace(next);
        debug!(pubkey = %self.state.pubkey, "session restored");
        Ok(true)
    }

    async fn load_blob<T: serde::de::DeserializeOwned>(&self, name: &str) -> Option<T> {
        match self.services.blobs.load(name).await {
            Ok(Some(value)) => serde_json::from_value(value)
                .map_err(|e| warn!(blob = name, "unreadable blob: {e}"))
                .ok(),
            Ok(None) => None,
            Err(e) => {
                warn!(blob = name, "blob load failed: {e}");
                None
            }
        }
    }

    /// Persist joined channels (with their keys), contacts and relays.
    pub async fn save_session(&self) -> Result<()> {
        let session = Session {
            channels: self
                .state
                .channels
                .iter()
                .map(|id| {
                    self.arena
                        .get(id)
                        .map(Channel::info)
                        .unwrap_or_else(|| ChannelInfo::public(id.clone()))
                })
                .collect(),
            contacts: self.state.contacts.clone(),
            relays: self.state.relays.clone(),
        };
        self.services
            .blobs
            .save(SESSION_BLOB, &serde_json::to_value(&session)?)
            .await
    }

    async fn save_metadata(&self, metadata: &Metadata) -> Result<()> {
        self.services
            .blobs
            .save(META_BLOB, &serde_json::to_value(metadata)?)
            .await
    }

    /// Create an account: new key, registered name, published profile.
    ///
    /// Nothing is persisted or replaced unless registration and publishing
    /// both succeed.
    pub async fn signup(&mut self, form: SignupForm) -> Result<()> {
        let ident = Identity::generate();
        let nip05 = self.services.names.register(&ident, &form.username).await?;
        let profile = Profile {
            picture: form.picture,
            username: Some(form.username),
            display_name: Some(form.display_name),
            about: Some(form.about),
            nip05: Some(nip05),
            ..Profile::default()
        };
        let ev = ident.sign(UnsignedEvent::new(kind::METADATA, serde_json::to_string(&profile)?))?;
        self.services.source.publish(&ev).await?;

        let metadata = Metadata {
            profile,
            ..Metadata::default()
        };
        self.services.secure.set(PRIVKEY_KEY, &ident.secret_hex()).await?;
        if let Err(e) = self.save_metadata(&metadata).await {
            if let Err(rollback) = self.services.secure.delete(PRIVKEY_KEY).await {
                warn!("stored key not rolled back: {rollback}");
            }
            return Err(e);
        }

        self.arena = ChannelArena::new();
        let channels: Vec<String> = DEFAULT_CHANNELS.iter().map(|c| c.to_string()).collect();
        for id in &channels {
            self.arena.ensure(id);
        }
        let next = UserState {
            pubkey: ident.pubkey().to_string(),
            metadata: Some(metadata),
            is_logged_in: true,
            channels,
            relays: self.state.relays.clone(),
            ..UserState::default()
        };
        info!(pubkey = %ident.pubkey(), "signed up");
        self.identity = Some(ident);
        self.replace(next);
        self.save_session().await
    }

    /// Log in with a bech32 private key.
    ///
    /// Input without the `nsec1` prefix or shorter than a real key is
    /// ignored. Any failure after that is reported as [`LoginOutcome::InvalidKey`]
    /// with the store untouched.
    pub async fn login_with_nsec(&mut self, nsec: &str) -> LoginOutcome {
        let nsec = nsec.trim();
        if !nsec.starts_with(NSEC_PREFIX) || nsec.len() < NSEC_MIN_LEN {
            return LoginOutcome::Ignored;
        }
        match self.login(nsec).await {
            Ok(()) => LoginOutcome::LoggedIn,
            Err(e) => {
                warn!("login failed: {e}");
                LoginOutcome::InvalidKey
            }
        }
    }

    async fn login(&mut self, nsec: &str) -> Result<()> {
        let ident = Identity::from_nsec(nsec)?;
        let source = self.services.source.as_ref();
        let (profile, contacts) = profile::fetch_profile(source, ident.pubkey()).await;
        let settings = profile::load_private_settings(source, &ident).await;
        let keys: Vec<String> = contacts.iter().map(|c| c.pubkey.clone()).collect();
        let priv_messages = PrivateMessageManager::new(self.services.source.clone())
            .list(&ident, Filter::new().limit(INBOX_LIMIT), false, &keys)
            .await;
        let joined = self.services.channels.list_joined(&ident).await?;
        let channels = if joined.is_empty() {
            DEFAULT_CHANNELS.iter().map(|c| c.to_string()).collect()
        } else {
            joined
        };

        self.services.secure.set(PRIVKEY_KEY, &ident.secret_hex()).await?;
        let metadata = Metadata { profile, settings };
        if let Err(e) = self.save_metadata(&metadata).await {
            warn!("metadata not cached: {e}");
        }

        self.arena = ChannelArena::new();
        for id in &channels {
            self.arena.ensure(id);
        }
        let next = UserState {
            pubkey: ident.pubkey().to_string(),
            metadata: Some(metadata),
            is_logged_in: true,
            channels,
            contacts,
            priv_messages,
            relays: self.state.relays.clone(),
        };
        info!(pubkey = %ident.pubkey(), dms = next.priv_messages.len(), "logged in");
        self.identity = Some(ident);
        self.replace(next);
        if let Err(e) = self.save_session().await {
            warn!("session not saved: {e}");
        }
        Ok(())
    }

    /// Forget the identity locally and in secure storage.
    pub async fn logout(&mut self) -> Result<()> {
        self.services.secure.delete(PRIVKEY_KEY).await?;
        self.identity = None;
        self.arena = ChannelArena::new();
        self.services.source.set_relays(self.base_relays.clone()).await;
        self.replace(UserState {
            relays: self.base_relays.clone(),
            ..UserState::default()
        });
        info!("logged out");
        Ok(())
    }

    /// Join locally, then mirror remotely. Joining a channel already in the
    /// list does nothing and returns `false`.
    pub async fn join_channel(&mut self, info: ChannelInfo) -> Result<bool> {
        let ident = self.require_identity()?;
        if self.state.channels.contains(&info.id) {
            return Ok(false);
        }
        let id = info.id.clone();
        self.arena.insert_info(info);
        self.update(|s| s.channels.push(id));
        self.services.channels.join_all(&ident, &self.state.channels).await?;
        Ok(true)
    }

    /// Leave locally, then remotely. A failed remote call leaves the local
    /// list ahead until the next [`UserStore::update_channels`].
    pub async fn leave_channel(&mut self, id: &str) -> Result<()> {
        let ident = self.require_identity()?;
        if self.state.channels.iter().any(|c| c == id) {
            self.arena.remove(id);
            self.update(|s| s.channels.retain(|c| c != id));
        }
        self.services.channels.leave(&ident, id).await
    }

    /// Attach keys of remotely-joined private channels to channels already
    /// known here. Returns how many channels received a key.
    pub async fn update_channels(&mut self) -> Result<usize> {
        let ident = self.require_identity()?;
        let list = self.services.channels.list_channels(&ident, true).await?;
        let mut patched = 0;
        for info in list.into_iter().filter(|c| c.is_private) {
            if !self.state.channels.contains(&info.id) {
                continue;
            }
            if let Some(channel) = self.arena.get_mut(&info.id) {
                channel.set_privkey(info.privkey);
                patched += 1;
            }
        }
        debug!(patched, "channel keys updated");
        Ok(patched)
    }

    /// Create a channel and add it to the joined list.
    pub async fn create_channel(&mut self, meta: ChannelMeta, private: bool) -> Result<ChannelInfo> {
        let ident = self.require_identity()?;
        let info = self.services.channels.create(&ident, &meta, private).await?;
        self.arena.insert_info(info.clone());
        let id = info.id.clone();
        self.update(|s| {
            if !s.channels.contains(&id) {
                s.channels.push(id);
            }
        });
        Ok(info)
    }

    /// Refresh one channel's messages and metadata.
    pub async fn sync_channel(&mut self, id: &str) -> Result<&Channel> {
        let dir = self.services.channels.clone();
        let channel = self.arena.ensure(id);
        channel.fetch_messages(dir.as_ref()).await?;
        if let Err(e) = channel.fetch_meta(dir.as_ref()).await {
            warn!(channel = id, "metadata refresh failed: {e}");
        }
        Ok(&*channel)
    }

    pub async fn post_to_channel(&mut self, id: &str, text: &str) -> Result<Event> {
        let ident = self.require_identity()?;
        let dir = self.services.channels.clone();
        self.arena.ensure(id).send_message(dir.as_ref(), &ident, text).await
    }

    /// DM view for `contacts`, or for the current contact list.
    pub async fn fetch_priv_messages(&self, contacts: Option<&[Contact]>) -> Result<Vec<DirectMessage>> {
        let ident = self.require_identity()?;
        let keys: Vec<String> = contacts
            .unwrap_or(&self.state.contacts)
            .iter()
            .map(|c| c.pubkey.clone())
            .collect();
        Ok(PrivateMessageManager::new(self.services.source.clone())
            .list(&ident, Filter::new().limit(INBOX_LIMIT), false, &keys)
            .await)
    }

    pub async fn refresh_inbox(&mut self) -> Result<()> {
        let list = self.fetch_priv_messages(None).await?;
        self.update_priv_messages(list);
        Ok(())
    }

    pub fn update_priv_messages(&mut self, list: Vec<DirectMessage>) {
        self.update(|s| s.priv_messages = list);
    }

    /// Optimistically add a DM, keeping one entry per peer.
    pub fn add_priv_message(&mut self, message: DirectMessage) {
        let me = self.state.pubkey.clone();
        self.update(|s| {
            let events: Vec<Event> = s
                .priv_messages
                .drain(..)
                .map(|m| m.event)
                .chain(std::iter::once(message.event))
                .collect();
            s.priv_messages = inbox_view(&me, events);
        });
    }

    pub async fn send_direct_message(&mut self, peer: &str, text: &str) -> Result<DirectMessage> {
        let ident = self.require_identity()?;
        let sent = PrivateMessageManager::new(self.services.source.clone())
            .send(&ident, peer, text)
            .await?;
        self.add_priv_message(sent.clone());
        Ok(sent)
    }

    pub async fn fetch_contacts(&mut self) -> Result<()> {
        let ident = self.require_identity()?;
        let list = self.services.contacts.list(&ident).await?;
        self.update(|s| s.contacts = list);
        Ok(())
    }

    /// Add remotely, then insert locally or update the flags of an existing
    /// entry.
    pub async fn add_contact(&mut self, contact: Contact) -> Result<()> {
        let ident = self.require_identity()?;
        self.services.contacts.add(&ident, &contact).await?;
        self.update(|s| match s.contacts.iter_mut().find(|c| c.pubkey == contact.pubkey) {
            Some(existing) => {
                existing.legacy = contact.legacy;
                existing.secret = contact.secret;
            }
            None => s.contacts.push(contact),
        });
        Ok(())
    }

    pub async fn remove_contact(&mut self, pubkey: &str) -> Result<()> {
        let ident = self.require_identity()?;
        self.services.contacts.remove(&ident, pubkey).await?;
        self.update(|s| s.contacts.retain(|c| c.pubkey != pubkey));
        Ok(())
    }

    /// Returns whether the relay was added.
    pub async fn add_relay(&mut self, url: &str) -> bool {
        if self.state.relays.iter().any(|r| r == url) {
            return false;
        }
        self.update(|s| s.relays.push(url.to_string()));
        self.services.source.set_relays(self.state.relays.clone()).await;
        true
    }

    pub async fn remove_relay(&mut self, url: &str) -> bool {
        if !self.state.relays.iter().any(|r| r == url) {
            return false;
        }
        self.update(|s| s.relays.retain(|r| r != url));
        self.services.source.set_relays(self.state.relays.clone()).await;
        true
    }

    /// Reload profile and private settings from relays.
    pub async fn fetch_metadata(&mut self) -> Result<()> {
        let ident = self.require_identity()?;
        let source = self.services.source.as_ref();
        let (profile, _) = profile::fetch_profile(source, ident.pubkey()).await;
        let settings = profile::load_private_settings(source, &ident).await;
        let metadata = Metadata { profile, settings };
        self.save_metadata(&metadata).await?;
        self.update(|s| s.metadata = Some(metadata));
        Ok(())
    }

    /// Store new metadata locally; with `publish`, also publish it and
    /// forward push preferences to the operator.
    pub async fn update_metadata(&mut self, metadata: Metadata, publish: bool) -> Result<()> {
        if publish {
            let ident = self.require_identity()?;
            profile::update_profile(
                self.services.source.as_ref(),
                &ident,
                &metadata,
                &self.services.push,
                self.services.tokens.as_ref(),
            )
            .await?;
        }
        self.save_metadata(&metadata).await?;
        self.update(|s| s.metadata = Some(metadata));
        Ok(())
    }

    /// Raw metadata blob, for display without deserializing.
    pub async fn cached_metadata(&self) -> Result<Option<Value>> {
        self.services.blobs.load(META_BLOB).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::NameRegistry;
    use crate::profile::StaticToken;
    use crate::source::MemorySource;
    use crate::store::{MemoryBlobStore, MemorySecureStore};
    use async_trait::async_trait;

    struct Unreachable;

    #[async_trait]
    impl NameRegistry for Unreachable {
        async fn register(&self, _: &Identity, _: &str) -> Result<String> {
            Err(ClientError::Naming("offline".into()))
        }
    }

    fn store() -> UserStore {
        let source = Arc::new(MemorySource::default());
        let push = PushChannel::with_factory(
            Identity::generate().pubkey(),
            Arc::new(|_: &str| Arc::new(MemorySource::default()) as Arc<dyn EventSource>),
        );
        UserStore::new(Services::relay_backed(
            source,
            Arc::new(Unreachable),
            Arc::new(MemorySecureStore::default()),
            Arc::new(MemoryBlobStore::default()),
            push,
            Arc::new(StaticToken(None)),
        ))
    }

    fn dm_event(id: &str, from: &str, to: &str, ts: u64) -> DirectMessage {
        let event = Event {
            id: id.into(),
            pubkey: from.into(),
            created_at: ts,
            kind: kind::DIRECT_MESSAGE,
            tags: vec![crate::event::Tag::new(["p", to])],
            content: format!("msg {id}"),
            sig: String::new(),
        };
        DirectMessage {
            peer: if from == "me" { to.into() } else { from.into() },
            last_message_at: ts,
            event,
        }
    }

    #[test]
    fn add_priv_message_keeps_one_entry_per_peer() {
        let mut store = store();
        store.update(|s| s.pubkey = "me".into());
        store.add_priv_message(dm_event("a", "alice", "me", 5));
        store.add_priv_message(dm_event("b", "me", "alice", 9));
        store.add_priv_message(dm_event("c", "alice", "me", 7));
        store.add_priv_message(dm_event("d", "bob", "me", 1));
        let view = &store.state().priv_messages;
        assert_eq!(view.len(), 2);
        assert_eq!(view[0].event.id, "b");
        assert_eq!(view[0].peer, "alice");
        assert_eq!(view[1].peer, "bob");
    }

    #[tokio::test]
    async fn subscribers_see_each_snapshot() {
        let mut store = store();
        let mut rx = store.subscribe();
        assert!(store.add_relay("wss://extra.example").await);
        assert!(!store.add_relay("wss://extra.example").await);
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().relays.contains(&"wss://extra.example".to_string()));
        assert!(store.remove_relay("wss://extra.example").await);
        assert!(!rx.borrow_and_update().relays.iter().any(|r| r == "wss://extra.example"));
    }

    #[tokio::test]
    async fn flows_require_login() {
        let mut store = store();
        let err = store.join_channel(ChannelInfo::public("x")).await.unwrap_err();
        assert!(matches!(err, ClientError::NotLoggedIn));
        assert!(store.state().channels.is_empty());
        assert!(matches!(
            store.send_direct_message("peer", "hi").await,
            Err(ClientError::NotLoggedIn)
        ));
    }

    struct Registered;

    #[async_trait]
    impl NameRegistry for Registered {
        async fn register(&self, _: &Identity, name: &str) -> Result<String> {
            Ok(format!("{name}@arcade.chat"))
        }
    }

    /// Blob store whose saves always fail.
    struct FullDisk;

    #[async_trait]
    impl BlobStore for FullDisk {
        async fn load(&self, _: &str) -> Result<Option<Value>> {
            Ok(None)
        }

        async fn save(&self, _: &str, _: &Value) -> Result<()> {
            Err(ClientError::Storage("disk full".into()))
        }
    }

    /// Secure store that keeps what it is given and refuses deletes.
    #[derive(Default)]
    struct Sticky(MemorySecureStore);

    #[async_trait]
    impl SecureStore for Sticky {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.0.get(key).await
        }

        async fn set(&self, key: &str, value: &str) -> Result<()> {
            self.0.set(key, value).await
        }

        async fn delete(&self, _: &str) -> Result<()> {
            Err(ClientError::Storage("keychain locked".into()))
        }
    }

    fn store_with(secure: Arc<dyn SecureStore>, blobs: Arc<dyn BlobStore>) -> UserStore {
        let push = PushChannel::with_factory(
            Identity::generate().pubkey(),
            Arc::new(|_: &str| Arc::new(MemorySource::default()) as Arc<dyn EventSource>),
        );
        UserStore::new(Services::relay_backed(
            Arc::new(MemorySource::default()),
            Arc::new(Registered),
            secure,
            blobs,
            push,
            Arc::new(StaticToken(None)),
        ))
    }

    fn form() -> SignupForm {
        SignupForm {
            username: "alice".into(),
            ..SignupForm::default()
        }
    }

    #[tokio::test]
    async fn signup_rolls_back_key_when_metadata_cannot_be_saved() {
        let secure = Arc::new(MemorySecureStore::default());
        let mut store = store_with(secure.clone(), Arc::new(FullDisk));
        let err = store.signup(form()).await.unwrap_err();
        assert!(matches!(err, ClientError::Storage(ref m) if m == "disk full"));
        assert_eq!(secure.get(PRIVKEY_KEY).await.unwrap(), None);
        assert_eq!(store.state(), &UserState::default());
        assert!(store.identity().is_none());
    }

    #[tokio::test]
    async fn failed_rollback_still_reports_original_error() {
        let mut store = store_with(Arc::new(Sticky::default()), Arc::new(FullDisk));
        let err = store.signup(form()).await.unwrap_err();
        assert!(matches!(err, ClientError::Storage(ref m) if m == "disk full"));
        assert!(!store.state().is_logged_in);
    }

    #[tokio::test]
    async fn configured_relays_replace_defaults() {
        let relays = vec!["ws://127.0.0.1:9".to_string()];
        let store = store().with_relays(relays.clone());
        assert_eq!(store.state().relays, relays);
        assert_eq!(store.subscribe().borrow().relays, relays);
    }

    #[tokio::test]
    async fn restore_without_key_is_a_no_op() {
        let mut store = store();
        assert!(!store.restore().await.unwrap());
        assert!(!store.state().is_logged_in);
    }
}
