//! Public profile metadata, encrypted private settings, and the operator
//! push-settings side channel.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::contacts::{follows_to_contacts, Contact};
use crate::error::Result;
use crate::event::{kind, Event, UnsignedEvent};
use crate::filter::Filter;
use crate::identity::Identity;
use crate::merge;
use crate::relay::RelayOptions;
use crate::source::{EventSource, RelayPool};

/// Key that receives push settings.
pub const OPERATOR_PUBKEY: &str = "c4899d1312a7ccf42cc4bfd0559826d20f7564293de4588cb8b089a574d71757";

/// Relays the operator watches, with a few non-operator backups.
pub const OPERATOR_RELAYS: [&str; 5] = [
    "wss://relay.arcade.city",
    "wss://arc1.arcadelabs.co",
    "wss://relay.nostr.band/all",
    "wss://relay.damus.io",
    "wss://nos.lol",
];

pub const PRIVATE_SETTINGS_D: &str = "arcade-settings";
pub const PUSH_SETTINGS_D: &str = "arcade-push";

/// Public kind-0 metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub banner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nip05: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub about: Option<String>,
    /// Fields written by other clients (`name`, `lud16`, `website`, ...),
    /// republished untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Notification preferences, stored encrypted to self.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateSettings {
    #[serde(default)]
    pub privchat_push_enabled: bool,
    #[serde(default)]
    pub channel_push_enabled: bool,
    #[serde(default)]
    pub buyoffer_push_enabled: bool,
    #[serde(default)]
    pub selloffer_push_enabled: bool,
}

impl PrivateSettings {
    pub fn any_enabled(&self) -> bool {
        self.privchat_push_enabled
            || self.channel_push_enabled
            || self.buyoffer_push_enabled
            || self.selloffer_push_enabled
    }
}

/// Profile and private settings as held by the user aggregate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub profile: Profile,
    #[serde(default)]
    pub settings: PrivateSettings,
}

/// What the operator learns: who to notify, where, and for what.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushSettings {
    pub pubkey: String,
    pub token: String,
    pub privchat_push_enabled: bool,
    pub channel_push_enabled: bool,
    pub selloffer_push_enabled: bool,
    pub buyoffer_push_enabled: bool,
}

impl PushSettings {
    pub fn new(pubkey: impl Into<String>, token: impl Into<String>, settings: &PrivateSettings) -> Self {
        Self {
            pubkey: pubkey.into(),
            token: token.into(),
            privchat_push_enabled: settings.privchat_push_enabled,
            channel_push_enabled: settings.channel_push_enabled,
            selloffer_push_enabled: settings.selloffer_push_enabled,
            buyoffer_push_enabled: settings.buyoffer_push_enabled,
        }
    }
}

/// Source of the device push token.
#[async_trait]
pub trait PushTokenProvider: Send + Sync {
    async fn token(&self) -> Result<Option<String>>;
}

/// A token known up front (from configuration), or none.
#[derive(Debug, Clone, Default)]
pub struct StaticToken(pub Option<String>);

#[async_trait]
impl PushTokenProvider for StaticToken {
    async fn token(&self) -> Result<Option<String>> {
        Ok(self.0.clone())
    }
}

/// Latest profile of `pubkey` and the legacy contacts of its follow list.
///
/// Unparseable metadata yields an empty profile.
pub async fn fetch_profile(source: &dyn EventSource, pubkey: &str) -> (Profile, Vec<Contact>) {
    let filter = Filter::new()
        .authors([pubkey])
        .kinds([kind::METADATA, kind::CONTACTS]);
    let events = source.fetch(&[filter], false).await;
    let profile = match merge::latest_of_kind(events.iter().cloned(), kind::METADATA) {
        Some(ev) => serde_json::from_str(&ev.content).unwrap_or_else(|e| {
            warn!(id = %ev.id, "unreadable profile: {e}");
            Profile::default()
        }),
        None => Profile::default(),
    };
    let contacts = merge::latest_of_kind(events, kind::CONTACTS)
        .map(|ev| follows_to_contacts(&ev))
        .unwrap_or_default();
    (profile, contacts)
}

async fn latest_settings_event(source: &dyn EventSource, ident: &Identity) -> Option<Event> {
    let filter = Filter::new()
        .authors([ident.pubkey()])
        .kinds([kind::SETTINGS])
        .tag("d", [PRIVATE_SETTINGS_D]);
    let events = source.fetch(&[filter], false).await;
    merge::latest_with_d(events, kind::SETTINGS, PRIVATE_SETTINGS_D)
}

/// The user's own settings; defaults when absent or unreadable.
pub async fn load_private_settings(source: &dyn EventSource, ident: &Identity) -> PrivateSettings {
    let Some(ev) = latest_settings_event(source, ident).await else {
        return PrivateSettings::default();
    };
    ident
        .decrypt_from(ident.pubkey(), &ev.content)
        .and_then(|plain| Ok(serde_json::from_str(&plain)?))
        .unwrap_or_else(|e| {
            debug!(id = %ev.id, "unreadable private settings: {e}");
            PrivateSettings::default()
        })
}

/// Publish the public profile and the encrypted private settings.
pub async fn save_profile(source: &dyn EventSource, ident: &Identity, metadata: &Metadata) -> Result<()> {
    let prev_meta = source
        .fetch(&[Filter::new().authors([ident.pubkey()]).kinds([kind::METADATA])], false)
        .await;
    let prev_meta = merge::latest_of_kind(prev_meta, kind::METADATA);
    let public = ident.sign(
        UnsignedEvent::new(kind::METADATA, serde_json::to_string(&metadata.profile)?)
            .replacing(prev_meta.as_ref()),
    )?;
    source.publish(&public).await?;

    let prev_settings = latest_settings_event(source, ident).await;
    let sealed = ident.encrypt_for(ident.pubkey(), &serde_json::to_string(&metadata.settings)?)?;
    let private = ident.sign(
        UnsignedEvent::new(kind::SETTINGS, sealed)
            .tag(["d", PRIVATE_SETTINGS_D])
            .replacing(prev_settings.as_ref()),
    )?;
    source.publish(&private).await
}

type PoolFactory = dyn Fn(&str) -> Arc<dyn EventSource> + Send + Sync;

/// Publishes push settings to the operator through a pool that lives for one
/// push only.
#[derive(Clone)]
pub struct PushChannel {
    operator: String,
    factory: Arc<PoolFactory>,
}

impl PushChannel {
    /// The operator key and relay set, reached with `opts`.
    pub fn operator(opts: RelayOptions) -> Self {
        Self::with_factory(
            OPERATOR_PUBKEY,
            Arc::new(move |pubkey: &str| {
                Arc::new(RelayPool::scoped(&OPERATOR_RELAYS, pubkey, opts.clone())) as Arc<dyn EventSource>
            }),
        )
    }

    pub fn with_factory(operator: impl Into<String>, factory: Arc<PoolFactory>) -> Self {
        Self {
            operator: operator.into(),
            factory,
        }
    }

    /// Encrypt `settings` to the operator and publish them. The pool is
    /// closed whether or not the publish succeeds.
    pub async fn push(&self, ident: &Identity, settings: &PushSettings) -> Result<()> {
        let pool = (self.factory)(ident.pubkey());
        let result = self.publish_on(pool.as_ref(), ident, settings).await;
        pool.close().await;
        result
    }

    async fn publish_on(&self, pool: &dyn EventSource, ident: &Identity, settings: &PushSettings) -> Result<()> {
        let content = ident.encrypt_for(&self.operator, &serde_json::to_string(settings)?)?;
        let ev = ident.sign(
            UnsignedEvent::new(kind::SETTINGS, content)
                .tag(["d", PUSH_SETTINGS_D])
                .tag(["p", self.operator.as_str()]),
        )?;
        pool.publish(&ev).await?;
        info!(operator = %self.operator, "push settings published");
        Ok(())
    }
}

/// Save profile and settings, then tell the operator about enabled pushes.
pub async fn update_profile(
    source: &dyn EventSource,
    ident: &Identity,
    metadata: &Metadata,
    push: &PushChannel,
    tokens: &dyn PushTokenProvider,
) -> Result<()> {
    save_profile(source, ident, metadata).await?;
    if !metadata.settings.any_enabled() {
        return Ok(());
    }
    let Some(token) = tokens.token().await? else {
        info!("no push token available, operator not notified");
        return Ok(());
    };
    push.push(ident, &PushSettings::new(ident.pubkey(), token, &metadata.settings))
        .await
}
