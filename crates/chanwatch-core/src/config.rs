use std::{
    env, fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    crawler::CrawlConfig,
    domain::{strip_channel_prefix, PeerRef},
    errors::Error,
    gateway::throttled::ThrottleConfig,
    identity::ResolverConfig,
    media::MediaConfig,
    monitor::MonitorConfig,
    Result,
};

/// Which session adapter talks to Telegram.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Backend {
    /// MTProto user session: crawl and monitor.
    #[default]
    User,
    /// Bot API: monitor only.
    Bot,
}

impl FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" | "mtproto" => Ok(Backend::User),
            "bot" => Ok(Backend::Bot),
            other => Err(Error::Config(format!(
                "unknown backend {other:?} (expected user or bot)"
            ))),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Backend::User => "user",
            Backend::Bot => "bot",
        })
    }
}

/// Credentials of the MTProto user session.
#[derive(Clone, Debug, Default)]
pub struct UserSessionConfig {
    pub api_id: i32,
    pub api_hash: String,
    /// Only needed by `login`.
    pub phone: Option<String>,
    pub session_path: PathBuf,
}

/// Typed configuration, built once per invocation and shared as `Arc<Config>`.
#[derive(Clone, Debug)]
pub struct Config {
    // Session
    pub backend: Backend,
    pub bot_token: String,
    pub user_session: UserSessionConfig,

    // Paths
    pub data_dir: PathBuf,
    pub database_path: PathBuf,
    pub topology_path: PathBuf,
    pub export_dir: PathBuf,

    // Components
    pub crawl: CrawlConfig,
    pub resolver: ResolverConfig,
    pub media: MediaConfig,
    pub monitor: MonitorConfig,
    pub throttle: ThrottleConfig,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let backend = match env_str("CHANWATCH_BACKEND") {
            Some(raw) if !raw.trim().is_empty() => raw.parse()?,
            _ => Backend::default(),
        };
        let bot_token = env_str("CHANWATCH_BOT_TOKEN").unwrap_or_default();

        let data_dir = match env_path("CHANWATCH_DATA_DIR") {
            Some(p) => p,
            None => home_dir()
                .ok_or_else(|| Error::Config("HOME is not set".to_string()))?
                .join(".config")
                .join("chanwatch"),
        };
        fs::create_dir_all(&data_dir)?;

        let database_path =
            env_path("CHANWATCH_DB_PATH").unwrap_or_else(|| data_dir.join("chanwatch.db"));
        let topology_path =
            env_path("CHANWATCH_TOPOLOGY").unwrap_or_else(|| data_dir.join("monitor.json"));
        let export_dir = env_path("CHANWATCH_EXPORT_DIR").unwrap_or_else(|| PathBuf::from("."));

        let user_session = UserSessionConfig {
            api_id: match env_str("CHANWATCH_API_ID") {
                Some(raw) if !raw.trim().is_empty() => raw.trim().parse().map_err(|_| {
                    Error::Config(format!("CHANWATCH_API_ID is not a number: {raw:?}"))
                })?,
                _ => 0,
            },
            api_hash: env_str("CHANWATCH_API_HASH").unwrap_or_default(),
            phone: env_str("CHANWATCH_PHONE").filter(|p| !p.trim().is_empty()),
            session_path: env_path("CHANWATCH_SESSION_PATH")
                .unwrap_or_else(|| data_dir.join("chanwatch.session")),
        };
        check_session(backend, &bot_token, &user_session)?;

        let crawl_defaults = CrawlConfig::default();
        let crawl = CrawlConfig {
            page_size: env_usize("CHANWATCH_PAGE_SIZE")
                .filter(|n| *n > 0)
                .unwrap_or(crawl_defaults.page_size),
            page_delay: env_u64("CHANWATCH_PAGE_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(crawl_defaults.page_delay),
            channel_delay: env_u64("CHANWATCH_CHANNEL_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(crawl_defaults.channel_delay),
        };

        let resolver_defaults = ResolverConfig::default();
        let resolver = ResolverConfig {
            member_page_size: env_usize("CHANWATCH_MEMBER_PAGE_SIZE")
                .filter(|n| *n > 0)
                .unwrap_or(resolver_defaults.member_page_size),
            max_member_pages: env_usize("CHANWATCH_MEMBER_MAX_PAGES")
                .unwrap_or(resolver_defaults.max_member_pages),
        };

        let media = MediaConfig {
            chunk_size: env_usize("CHANWATCH_CHUNK_SIZE")
                .filter(|n| *n > 0)
                .unwrap_or(MediaConfig::default().chunk_size),
        };

        let monitor = MonitorConfig {
            queue_capacity: env_usize("CHANWATCH_QUEUE_CAPACITY")
                .filter(|n| *n > 0)
                .unwrap_or(MonitorConfig::default().queue_capacity),
        };

        Ok(Self {
            backend,
            bot_token,
            user_session,
            data_dir,
            database_path,
            topology_path,
            export_dir,
            crawl,
            resolver,
            media,
            monitor,
            throttle: ThrottleConfig::default(),
        })
    }
}

/// Each backend needs its own credentials; the other backend's may be absent.
fn check_session(backend: Backend, bot_token: &str, user: &UserSessionConfig) -> Result<()> {
    match backend {
        Backend::Bot if bot_token.trim().is_empty() => Err(Error::Config(
            "CHANWATCH_BOT_TOKEN is required for the bot backend".to_string(),
        )),
        Backend::User if user.api_id <= 0 || user.api_hash.trim().is_empty() => {
            Err(Error::Config(
                "CHANWATCH_API_ID and CHANWATCH_API_HASH are required for the user backend"
                    .to_string(),
            ))
        }
        _ => Ok(()),
    }
}

/// One `{id}` or `{username}` entry of the monitor topology file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl PeerSpec {
    /// Numeric id wins over username when both are present.
    pub fn to_peer(&self) -> Option<PeerRef> {
        if let Some(id) = self.id.filter(|id| *id != 0) {
            return Some(PeerRef::Id(strip_channel_prefix(id)));
        }
        self.username.as_deref().and_then(PeerRef::parse)
    }
}

/// Sources, targets and watched users for monitor mode.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorTopologyConfig {
    #[serde(default)]
    pub source_channels: Vec<PeerSpec>,
    #[serde(default)]
    pub source_groups: Vec<PeerSpec>,
    #[serde(default)]
    pub target_channels: Vec<PeerSpec>,
    #[serde(default)]
    pub monitor_users: Vec<PeerSpec>,
}

impl MonitorTopologyConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let txt = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "monitor topology not readable at {}: {e}",
                path.display()
            ))
        })?;
        Self::parse(&txt)
    }

    pub fn parse(txt: &str) -> Result<Self> {
        Ok(serde_json::from_str(txt)?)
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // never override the real environment
        }

        let mut val = v.trim().to_string();
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|s| s.trim().parse::<usize>().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn home_dir() -> Option<PathBuf> {
    env::var_os("HOME").map(PathBuf::from)
}
