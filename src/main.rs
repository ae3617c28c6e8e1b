//! Command line client: account login, inbox, channels, contacts and relay
//! configuration on top of the synchronization library.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Context};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use relaysync::{
    cache::EventCache,
    channel::{ChannelInfo, ChannelMeta},
    config::Settings,
    contacts::Contact,
    event::Event,
    filter::Filter,
    identity::{npub_from_hex, parse_pubkey, Identity},
    naming::{HttpNameRegistry, NameRegistry},
    profile::{PushChannel, StaticToken},
    relay,
    source::{EventSource, RelayPool},
    store::{FileBlobStore, FileSecureStore},
    user::{Services, SignupForm},
    ClientError, LoginOutcome, UserStore,
};

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "relaysync",
    author,
    version,
    about = "Nostr channel and direct message client",
    short_flag = 'v',
    long_flag = "version"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Create a new account and register a name for it.
    Signup {
        #[arg(long)]
        username: String,
        #[arg(long, default_value = "")]
        display_name: String,
        #[arg(long, default_value = "")]
        about: String,
        #[arg(long)]
        picture: Option<String>,
    },
    /// Log in with an `nsec1...` private key.
    Login { nsec: String },
    /// Forget the stored private key.
    Logout,
    /// Show the logged-in identity.
    Whoami,
    /// Latest direct message per contact.
    Inbox,
    /// Send a direct message.
    Dm { peer: String, text: String },
    /// List joined channels.
    Channels {
        /// Fetch keys of private channels from relays first.
        #[arg(long)]
        sync: bool,
    },
    /// Work with one channel.
    Channel {
        #[command(subcommand)]
        action: ChannelAction,
    },
    /// Manage contacts.
    Contacts {
        #[command(subcommand)]
        action: ContactAction,
    },
    /// Manage the configured relays.
    Relay {
        #[command(subcommand)]
        action: RelayAction,
    },
    /// Update push notification preferences.
    Settings {
        #[arg(long)]
        privchat: Option<bool>,
        #[arg(long)]
        channel: Option<bool>,
        #[arg(long)]
        buyoffer: Option<bool>,
        #[arg(long)]
        selloffer: Option<bool>,
    },
    /// Check the id and signature of an event file.
    Verify { file: String },
}

#[derive(Subcommand)]
enum ChannelAction {
    Join {
        id: String,
        /// Key of a private channel.
        #[arg(long)]
        privkey: Option<String>,
    },
    Leave { id: String },
    /// Print recent messages, oldest last.
    Read {
        id: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    Post { id: String, text: String },
    Create {
        name: String,
        #[arg(long, default_value = "")]
        about: String,
        #[arg(long)]
        picture: Option<String>,
        #[arg(long)]
        private: bool,
    },
}

#[derive(Subcommand)]
enum ContactAction {
    List,
    Add {
        pubkey: String,
        /// The contact uses encrypted messaging.
        #[arg(long)]
        secret: bool,
    },
    Remove { pubkey: String },
}

/// Operations available under `relaysync relay`.
#[derive(Subcommand)]
enum RelayAction {
    /// Add a relay after verifying connectivity.
    Add { url: String },
    /// Remove a relay from the configuration.
    Remove { url: String },
}

/// Stands in for the registry when none is configured.
struct NoRegistry;

#[async_trait]
impl NameRegistry for NoRegistry {
    async fn register(&self, _: &Identity, _: &str) -> relaysync::Result<String> {
        Err(ClientError::Naming("NAME_REGISTRY_URL is not configured".into()))
    }
}

/// Wire the user store to relays and local storage under `DATA_ROOT`.
fn open_store(cfg: &Settings) -> anyhow::Result<UserStore> {
    let mut pool = RelayPool::new(cfg.relays.clone(), cfg.relay_options());
    if cfg.local_cache {
        pool = pool.with_cache(EventCache::open(cfg.data_root.join("cache"))?);
    }
    let source: Arc<dyn EventSource> = Arc::new(pool);
    let names: Arc<dyn NameRegistry> = match &cfg.name_registry_url {
        Some(url) => Arc::new(HttpNameRegistry::new(url, cfg.name_domain.clone())?),
        None => Arc::new(NoRegistry),
    };
    Ok(UserStore::new(Services::relay_backed(
        source,
        names,
        Arc::new(FileSecureStore::new(&cfg.data_root)),
        Arc::new(FileBlobStore::new(&cfg.data_root)),
        PushChannel::operator(cfg.relay_options()),
        Arc::new(StaticToken(cfg.push_token.clone())),
    ))
    .with_relays(cfg.relays.clone()))
}

/// Restore the stored session or fail with a hint.
async fn logged_in(cfg: &Settings) -> anyhow::Result<UserStore> {
    let mut store = open_store(cfg)?;
    if !store.restore().await? {
        bail!("not logged in; run `relaysync login <nsec>` first");
    }
    Ok(store)
}

fn display_name(pubkey: &str) -> String {
    npub_from_hex(pubkey).unwrap_or_else(|_| pubkey.to_string())
}

fn timestamp(ts: u64) -> String {
    i64::try_from(ts)
        .ok()
        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    ensure_env_file(&cli.env)?;
    let cfg = Settings::from_env(&cli.env)?;
    match cli.command {
        Commands::Signup {
            username,
            display_name,
            about,
            picture,
        } => {
            let mut store = open_store(&cfg)?;
            store
                .signup(SignupForm {
                    username,
                    display_name,
                    about,
                    picture,
                })
                .await?;
            let ident = store.identity().context("signup left no identity")?;
            println!("{}", ident.npub());
            println!("{}", ident.nsec());
        }
        Commands::Login { nsec } => {
            let mut store = open_store(&cfg)?;
            match store.login_with_nsec(&nsec).await {
                LoginOutcome::Ignored => bail!("expected an nsec1... private key"),
                LoginOutcome::InvalidKey => bail!("Invalid key. Did you copy it correctly?"),
                LoginOutcome::LoggedIn => println!("{}", display_name(&store.state().pubkey)),
            }
        }
        Commands::Logout => {
            let mut store = open_store(&cfg)?;
            store.logout().await?;
        }
        Commands::Whoami => {
            let store = logged_in(&cfg).await?;
            let state = store.state();
            println!("{}", display_name(&state.pubkey));
            if let Some(meta) = &state.metadata {
                if let Some(nip05) = &meta.profile.nip05 {
                    println!("{nip05}");
                }
            }
        }
        Commands::Inbox => {
            let mut store = logged_in(&cfg).await?;
            if store.state().contacts.is_empty() {
                store.fetch_contacts().await?;
            }
            store.refresh_inbox().await?;
            for m in &store.state().priv_messages {
                println!(
                    "{}  {}  {}",
                    timestamp(m.last_message_at),
                    display_name(&m.peer),
                    m.event.content
                );
            }
            store.save_session().await?;
        }
        Commands::Dm { peer, text } => {
            let mut store = logged_in(&cfg).await?;
            let peer = parse_pubkey(&peer)?;
            let sent = store.send_direct_message(&peer, &text).await?;
            println!("{}", sent.event.id);
        }
        Commands::Channels { sync } => {
            let mut store = logged_in(&cfg).await?;
            if sync {
                let patched = store.update_channels().await?;
                tracing::info!(patched, "channel keys synced");
                store.save_session().await?;
            }
            for ch in store.joined_channels() {
                let marker = if ch.is_private() { "private" } else { "public" };
                println!("{}  {}  {}", ch.id(), marker, ch.name());
            }
        }
        Commands::Channel { action } => handle_channel(action, &cfg).await?,
        Commands::Contacts { action } => handle_contacts(action, &cfg).await?,
        Commands::Relay { action } => handle_relay(action, &cli.env, &cfg).await?,
        Commands::Settings {
            privchat,
            channel,
            buyoffer,
            selloffer,
        } => {
            let mut store = logged_in(&cfg).await?;
            let mut metadata = store.state().metadata.clone().unwrap_or_default();
            let s = &mut metadata.settings;
            s.privchat_push_enabled = privchat.unwrap_or(s.privchat_push_enabled);
            s.channel_push_enabled = channel.unwrap_or(s.channel_push_enabled);
            s.buyoffer_push_enabled = buyoffer.unwrap_or(s.buyoffer_push_enabled);
            s.selloffer_push_enabled = selloffer.unwrap_or(s.selloffer_push_enabled);
            println!("{}", serde_json::to_string_pretty(&metadata.settings)?);
            store.update_metadata(metadata, true).await?;
        }
        Commands::Verify { file } => {
            let data = fs::read_to_string(&file).with_context(|| format!("reading {file}"))?;
            let ev = Event::from_wire(serde_json::from_str(&data)?)?;
            ev.verify(true)?;
            println!("ok {}", ev.id);
        }
    }
    Ok(())
}

async fn handle_channel(action: ChannelAction, cfg: &Settings) -> anyhow::Result<()> {
    let mut store = logged_in(cfg).await?;
    match action {
        ChannelAction::Join { id, privkey } => {
            let info = ChannelInfo {
                is_private: privkey.is_some(),
                privkey: privkey.unwrap_or_default(),
                ..ChannelInfo::public(id)
            };
            // the local join stands even if the remote mirror fails
            let joined = store.join_channel(info).await;
            store.save_session().await?;
            if !joined? {
                println!("already joined");
            }
        }
        ChannelAction::Leave { id } => {
            let left = store.leave_channel(&id).await;
            store.save_session().await?;
            left?;
        }
        ChannelAction::Read { id, limit } => {
            let channel = store.sync_channel(&id).await?;
            if !channel.name().is_empty() {
                println!("# {}", channel.name());
            }
            for m in channel.messages().iter().take(limit).rev() {
                println!("{}  {}  {}", timestamp(m.created_at), display_name(&m.pubkey), m.content);
            }
        }
        ChannelAction::Post { id, text } => {
            let ev = store.post_to_channel(&id, &text).await?;
            println!("{}", ev.id);
        }
        ChannelAction::Create {
            name,
            about,
            picture,
            private,
        } => {
            let info = store
                .create_channel(ChannelMeta { name, picture, about }, private)
                .await?;
            println!("{}", info.id);
        }
    }
    store.save_session().await?;
    Ok(())
}

async fn handle_contacts(action: ContactAction, cfg: &Settings) -> anyhow::Result<()> {
    let mut store = logged_in(cfg).await?;
    match action {
        ContactAction::List => {
            store.fetch_contacts().await?;
            for c in &store.state().contacts {
                let flag = if c.legacy { "follow" } else if c.secret { "secret" } else { "contact" };
                println!("{}  {}", display_name(&c.pubkey), flag);
            }
        }
        ContactAction::Add { pubkey, secret } => {
            let contact = Contact {
                secret,
                ..Contact::new(parse_pubkey(&pubkey)?)
            };
            store.add_contact(contact).await?;
        }
        ContactAction::Remove { pubkey } => store.remove_contact(&parse_pubkey(&pubkey)?).await?,
    }
    store.save_session().await?;
    Ok(())
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> anyhow::Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    if let Some(parent) = env_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let base_dir = match env_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    let data_root = base_dir.join("relaysync-data");
    let mut content = String::new();
    content.push_str(&format!("DATA_ROOT={}\n", display_path(&data_root)));
    content.push_str("RELAYS=\n");
    content.push_str("FETCH_TIMEOUT_MS=4000\n");
    content.push_str("VERIFY_SIG=0\n");
    content.push_str("LOCAL_CACHE=1\n");
    content.push_str("NAME_REGISTRY_URL=\n");
    content.push_str("NAME_DOMAIN=arcade.chat\n");
    content.push_str("PUSH_TOKEN=\n");
    content.push_str("TOR_SOCKS=\n");
    fs::write(env_path, content)?;
    Ok(())
}

fn display_path(path: &PathBuf) -> String {
    path.to_string_lossy().into_owned()
}

async fn handle_relay(action: RelayAction, env_path: &str, cfg: &Settings) -> anyhow::Result<()> {
    match action {
        RelayAction::Add { url } => add_relay(env_path, cfg, url).await?,
        RelayAction::Remove { url } => remove_relay(env_path, cfg, url).await?,
    }
    Ok(())
}

async fn add_relay(env_path: &str, cfg: &Settings, url: String) -> anyhow::Result<()> {
    if cfg.relays.iter().any(|existing| existing == &url) {
        bail!("relay already configured: {url}");
    }
    relay::fetch(&url, &[Filter::new().limit(1)], &cfg.relay_options())
        .await
        .with_context(|| format!("relay unreachable: {url}"))?;
    let mut relays = cfg.relays.clone();
    relays.push(url.clone());
    write_relays_to_env(env_path, &relays)?;
    mirror_relay_change(cfg, &url, true).await
}

async fn remove_relay(env_path: &str, cfg: &Settings, url: String) -> anyhow::Result<()> {
    let mut relays = cfg.relays.clone();
    let before = relays.len();
    relays.retain(|existing| existing != &url);
    if relays.len() == before {
        bail!("relay not configured: {url}");
    }
    write_relays_to_env(env_path, &relays)?;
    mirror_relay_change(cfg, &url, false).await
}

/// Keep the session's relay list in step with the `.env` file when logged in.
async fn mirror_relay_change(cfg: &Settings, url: &str, added: bool) -> anyhow::Result<()> {
    let mut store = open_store(cfg)?;
    if !store.restore().await? {
        return Ok(());
    }
    if added {
        store.add_relay(url).await;
    } else {
        store.remove_relay(url).await;
    }
    store.save_session().await?;
    Ok(())
}

fn write_relays_to_env(env_path: &str, relays: &[String]) -> anyhow::Result<()> {
    let content = fs::read_to_string(env_path)?;
    let relays_joined = relays.join(",");
    let mut new_content = String::new();
    let mut replaced = false;
    for line in content.lines() {
        if line.starts_with("RELAYS=") {
            new_content.push_str(&format!("RELAYS={relays_joined}\n"));
            replaced = true;
        } else {
            new_content.push_str(line);
            new_content.push('\n');
        }
    }
    if !replaced {
        new_content.push_str(&format!("RELAYS={relays_joined}\n"));
    }
    fs::write(env_path, new_content)?;
    std::env::set_var("RELAYS", relays_joined);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("relaysync=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    run(cli).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::{net::TcpListener, task};
    use tokio_tungstenite::{accept_async, tungstenite::Message as TMsg};

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: [&str; 9] = [
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

    fn write_env(dir: &TempDir, relays: &str) -> String {
        for v in VARS {
            std::env::remove_var(v);
        }
        let env_path = dir.path().join(".env");
        let content = format!(
            "DATA_ROOT={}\nRELAYS={relays}\nFETCH_TIMEOUT_MS=300\nLOCAL_CACHE=0\n",
            dir.path().to_str().unwrap(),
        );
        fs::write(&env_path, content).unwrap();
        env_path.to_str().unwrap().into()
    }

    #[tokio::test]
    async fn creates_default_env() {
        let _g = ENV_MUTEX.lock().unwrap();
        for v in VARS {
            std::env::remove_var(v);
        }
        let dir = TempDir::new().unwrap();
        let env_path = dir.path().join("conf/.env");
        ensure_env_file(env_path.to_str().unwrap()).unwrap();
        let data = fs::read_to_string(&env_path).unwrap();
        let expected_root = dir.path().join("conf/relaysync-data");
        assert!(data.contains(&format!("DATA_ROOT={}", expected_root.to_string_lossy())));
        assert!(data.contains("RELAYS=\n"));
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.data_root, expected_root);
    }

    #[tokio::test]
    async fn relay_add_validates_and_updates_env() {
        let _g = ENV_MUTEX.lock().unwrap();
        let dir = TempDir::new().unwrap();
        let env_file = write_env(&dir, "ws://127.0.0.1:9");

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = task::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                match msg {
                    TMsg::Text(text) => {
                        let req: serde_json::Value = serde_json::from_str(&text).unwrap();
                        if req[0] == "REQ" {
                            let eose = serde_json::json!(["EOSE", req[1]]);
                            ws.send(TMsg::Text(eose.to_string())).await.unwrap();
                        }
                    }
                    TMsg::Close(_) => break,
                    _ => {}
                }
            }
        });

        let url = format!("ws://{addr}");
        run(Cli {
            env: env_file.clone(),
            command: Commands::Relay {
                action: RelayAction::Add { url: url.clone() },
            },
        })
        .await
        .unwrap();
        server.abort();

        let data = fs::read_to_string(&env_file).unwrap();
        assert!(data.contains(&format!("RELAYS=ws://127.0.0.1:9,{url}")));
    }

    #[tokio::test]
    async fn relay_add_rejects_unreachable() {
        let _g = ENV_MUTEX.lock().unwrap();
        let dir = TempDir::new().unwrap();
        let env_file = write_env(&dir, "ws://127.0.0.1:9");
        let res = run(Cli {
            env: env_file.clone(),
            command: Commands::Relay {
                action: RelayAction::Add {
                    url: "ws://127.0.0.1:1".into(),
                },
            },
        })
        .await;
        assert!(res.is_err());
        assert!(!fs::read_to_string(&env_file).unwrap().contains("127.0.0.1:1,"));
    }

    #[tokio::test]
    async fn relay_remove_updates_env() {
        let _g = ENV_MUTEX.lock().unwrap();
        let dir = TempDir::new().unwrap();
        let env_file = write_env(&dir, "ws://one,ws://two");
        run(Cli {
            env: env_file.clone(),
            command: Commands::Relay {
                action: RelayAction::Remove {
                    url: "ws://one".into(),
                },
            },
        })
        .await
        .unwrap();
        let data = fs::read_to_string(&env_file).unwrap();
        assert!(data.contains("RELAYS=ws://two"));
        assert!(!data.contains("ws://one"));
    }

    #[tokio::test]
    async fn login_whoami_logout_offline() {
        let _g = ENV_MUTEX.lock().unwrap();
        let dir = TempDir::new().unwrap();
        let env_file = write_env(&dir, "ws://127.0.0.1:9");
        let ident = Identity::generate();
        run(Cli {
            env: env_file.clone(),
            command: Commands::Login { nsec: ident.nsec() },
        })
        .await
        .unwrap();
        assert!(dir.path().join("secure/privkey").exists());
        run(Cli {
            env: env_file.clone(),
            command: Commands::Whoami,
        })
        .await
        .unwrap();
        run(Cli {
            env: env_file.clone(),
            command: Commands::Logout,
        })
        .await
        .unwrap();
        assert!(!dir.path().join("secure/privkey").exists());
        assert!(run(Cli {
            env: env_file,
            command: Commands::Whoami,
        })
        .await
        .is_err());
    }
}
