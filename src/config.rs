//! Configuration loading from `.env` files.

use std::{env, path::PathBuf, time::Duration};

use anyhow::{Context, Result};

use crate::naming::DEFAULT_NAME_DOMAIN;
use crate::relay::RelayOptions;
use crate::source::DEFAULT_RELAYS;

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root directory for keys, blobs and the event cache.
    pub data_root: PathBuf,
    /// Relays to read from and publish to.
    pub relays: Vec<String>,
    /// Optional Tor SOCKS proxy (host:port).
    pub tor_socks: Option<String>,
    /// Per-relay round-trip deadline.
    pub fetch_timeout: Duration,
    /// Verify Schnorr signatures of fetched events.
    pub verify_sig: bool,
    /// Keep fetched events in an on-disk cache.
    pub local_cache: bool,
    /// Name registration endpoint; signup is unavailable without it.
    pub name_registry_url: Option<String>,
    pub name_domain: String,
    /// Device token forwarded with push settings.
    pub push_token: Option<String>,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let data_root = PathBuf::from(env::var("DATA_ROOT").context("DATA_ROOT not set")?);
        let mut relays = csv_strings(env::var("RELAYS").unwrap_or_default());
        if relays.is_empty() {
            relays = DEFAULT_RELAYS.iter().map(|r| r.to_string()).collect();
        }
        let tor_socks = non_empty("TOR_SOCKS");
        let fetch_timeout = env::var("FETCH_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .map(Duration::from_millis)
            .unwrap_or_else(|| RelayOptions::default().timeout);
        let verify_sig = env::var("VERIFY_SIG").unwrap_or_else(|_| "0".into()) == "1";
        let local_cache = env::var("LOCAL_CACHE").unwrap_or_else(|_| "1".into()) != "0";
        let name_registry_url = non_empty("NAME_REGISTRY_URL");
        let name_domain = non_empty("NAME_DOMAIN").unwrap_or_else(|| DEFAULT_NAME_DOMAIN.into());
        let push_token = non_empty("PUSH_TOKEN");
        Ok(Self {
            data_root,
            relays,
            tor_socks,
            fetch_timeout,
            verify_sig,
            local_cache,
            name_registry_url,
            name_domain,
            push_token,
        })
    }

    /// Connection options for every relay.
    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            tor_socks: self.tor_socks.clone(),
            timeout: self.fetch_timeout,
            verify_sig: self.verify_sig,
        }
    }
}

fn non_empty(var: &str) -> Option<String> {
    env::var(var).ok().filter(|s| !s.trim().is_empty())
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    input
        .as_ref()
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::{fs, sync::Mutex};
    use tempfile::tempdir;

    pub(crate) static ENV_MUTEX: Mutex<()> = Mutex::new(());

    pub(crate) const VARS: [&str; 9] = [
        "DATA_ROOT",
        "RELAYS",
        "TOR_SOCKS",
        "FETCH_TIMEOUT_MS",
        "VERIFY_SIG",
        "LOCAL_CACHE",
        "NAME_REGISTRY_URL",
        "NAME_DOMAIN",
        "PUSH_TOKEN",
    ];

    pub(crate) fn clear_env() {
        for v in VARS {
            env::remove_var(v);
        }
    }

    #[test]
    fn loads_env() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            concat!(
                "DATA_ROOT=/tmp/rs\n",
                "RELAYS=ws://r1, ws://r2\n",
                "TOR_SOCKS=\n",
                "FETCH_TIMEOUT_MS=250\n",
                "VERIFY_SIG=1\n",
                "LOCAL_CACHE=0\n",
                "NAME_REGISTRY_URL=http://names.test/register\n",
                "NAME_DOMAIN=example.test\n",
                "PUSH_TOKEN=tok\n",
            ),
        )
        .unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.data_root, PathBuf::from("/tmp/rs"));
        assert_eq!(cfg.relays, vec!["ws://r1", "ws://r2"]);
        assert!(cfg.tor_socks.is_none());
        assert_eq!(cfg.fetch_timeout, Duration::from_millis(250));
        assert!(cfg.verify_sig);
        assert!(!cfg.local_cache);
        assert_eq!(cfg.name_registry_url.as_deref(), Some("http://names.test/register"));
        assert_eq!(cfg.name_domain, "example.test");
        assert_eq!(cfg.push_token.as_deref(), Some("tok"));
        let opts = cfg.relay_options();
        assert!(opts.verify_sig);
        assert_eq!(opts.timeout, Duration::from_millis(250));
    }

    #[test]
    fn defaults_when_optional_absent() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(&env_path, "DATA_ROOT=/tmp/rs\nRELAYS=\n").unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.relays.len(), DEFAULT_RELAYS.len());
        assert_eq!(cfg.fetch_timeout, Duration::from_millis(4000));
        assert!(!cfg.verify_sig);
        assert!(cfg.local_cache);
        assert!(cfg.name_registry_url.is_none());
        assert_eq!(cfg.name_domain, DEFAULT_NAME_DOMAIN);
        assert!(cfg.push_token.is_none());
    }

    #[test]
    fn tor_socks_parsed() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(&env_path, "DATA_ROOT=/tmp/rs\nTOR_SOCKS=127.0.0.1:9050\n").unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.tor_socks, Some("127.0.0.1:9050".into()));
    }

    #[test]
    fn bad_timeout_falls_back_to_default() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(&env_path, "DATA_ROOT=/tmp/rs\nFETCH_TIMEOUT_MS=soon\n").unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.fetch_timeout, Duration::from_millis(4000));
    }

    #[test]
    fn missing_data_root_errors() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(&env_path, "RELAYS=ws://r1\n").unwrap();
        assert!(Settings::from_env(env_path.to_str().unwrap()).is_err());
    }

    #[test]
    fn csv_helper() {
        assert_eq!(csv_strings("a, b , ,c"), vec!["a", "b", "c"]);
        assert!(csv_strings("").is_empty());
    }
}
