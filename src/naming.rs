//! Human-readable name registration (`name@domain`).

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;
use url::Url;

use crate::error::{ClientError, Result};
use crate::identity::Identity;

pub const DEFAULT_NAME_DOMAIN: &str = "arcade.chat";

/// Registers a name for a fresh identity and returns the full address.
#[async_trait]
pub trait NameRegistry: Send + Sync {
    async fn register(&self, ident: &Identity, name: &str) -> Result<String>;
}

/// Reject names that are already addresses: those belong to existing
/// accounts, which should log in instead.
pub fn validate_name(name: &str) -> Result<()> {
    if name.contains('@') {
        return Err(ClientError::Validation("Log in with your private key instead".into()));
    }
    if name.trim().is_empty() {
        return Err(ClientError::Validation("Name must not be empty".into()));
    }
    Ok(())
}

#[derive(Deserialize)]
struct RegistryReply {
    #[serde(default)]
    error: Option<String>,
}

/// Registry reached over HTTP: `GET <endpoint>?name=&pubkey=&sig=`.
pub struct HttpNameRegistry {
    client: reqwest::Client,
    endpoint: Url,
    domain: String,
}

impl HttpNameRegistry {
    pub fn new(endpoint: &str, domain: impl Into<String>) -> Result<Self> {
        let endpoint =
            Url::parse(endpoint).map_err(|e| ClientError::Naming(format!("bad registry url {endpoint}: {e}")))?;
        Ok(Self {
            client: reqwest::Client::new(),
            endpoint,
            domain: domain.into(),
        })
    }
}

#[async_trait]
impl NameRegistry for HttpNameRegistry {
    async fn register(&self, ident: &Identity, name: &str) -> Result<String> {
        validate_name(name)?;
        let sig = ident.sign_name(name)?;
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("name", name)
            .append_pair("pubkey", ident.pubkey())
            .append_pair("sig", &sig);
        let reply: RegistryReply = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ClientError::Naming(e.to_string()))?
            .json()
            .await
            .map_err(|e| ClientError::Naming(e.to_string()))?;
        if let Some(err) = reply.error {
            return Err(ClientError::Naming(err));
        }
        info!(name, "name registered");
        Ok(format!("{name}@{}", self.domain))
    }
}
