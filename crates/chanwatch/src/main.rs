use std::{path::PathBuf, sync::Arc};

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

use chanwatch_core::{
    channel_list::parse_channel_list,
    commands::{self, Services},
    config::{Backend, Config, MonitorTopologyConfig},
    domain::PeerRef,
    errors::Error,
    export::ExportFormat,
    filter::{render_filter_table, RuleDraft},
    gateway::{throttled::ThrottledGateway, SessionGateway},
    monitor::MonitorStats,
};
use chanwatch_mtproto::{LoginPrompt, UserGateway};
use chanwatch_store::SqliteStore;
use chanwatch_telegram::BotGateway;

#[derive(Parser)]
#[command(name = "chanwatch", about = "Crawl and monitor Telegram channels")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Collect a user's posts across channels and print a summary.
    Crawl {
        /// `@handle`, bare handle or numeric user id.
        query: String,
        /// File with one channel per line, or t.me links.
        #[arg(long)]
        channels_file: Option<PathBuf>,
        /// Extra channel reference; repeatable.
        #[arg(long = "channel")]
        channels: Vec<String>,
        /// Export format: json or csv. Nothing is exported when omitted.
        #[arg(long)]
        format: Option<String>,
    },
    /// Forward new posts from source channels until interrupted.
    Monitor {
        /// Topology JSON (defaults to CHANWATCH_TOPOLOGY).
        #[arg(long)]
        topology: Option<PathBuf>,
        /// Extra target channel; repeatable.
        #[arg(long = "target")]
        targets: Vec<String>,
    },
    /// Log the user session in (phone, code, optional 2FA password).
    Login {
        /// Defaults to CHANWATCH_PHONE.
        #[arg(long)]
        phone: Option<String>,
    },
    /// Manage forwarding rules.
    Filter {
        #[command(subcommand)]
        action: FilterAction,
    },
}

#[derive(Subcommand)]
enum FilterAction {
    Add {
        name: String,
        /// keyword, regex, user, channel or length.
        #[arg(long)]
        kind: String,
        #[arg(long)]
        pattern: String,
        /// forward, ignore or highlight.
        #[arg(long, default_value = "forward")]
        action: String,
        #[arg(long, default_value_t = 0)]
        priority: i32,
    },
    List,
    Enable {
        id: i64,
    },
    Disable {
        id: i64,
    },
}

fn parse_peers(raw: &[String]) -> anyhow::Result<Vec<PeerRef>> {
    raw.iter()
        .map(|s| PeerRef::parse(s).ok_or_else(|| anyhow!("invalid peer reference: {s:?}")))
        .collect()
}

fn print_stats(stats: &MonitorStats) {
    println!(
        "received {} / forwarded {} / highlighted {} / ignored {} / duplicates {} / dropped {} / failures {} / status updates {}",
        stats.received,
        stats.forwarded,
        stats.highlighted,
        stats.ignored,
        stats.duplicates,
        stats.dropped,
        stats.failures,
        stats.status_updates,
    );
}

/// Reads login answers from the terminal.
struct TerminalPrompt {
    lines: tokio::io::Lines<BufReader<tokio::io::Stdin>>,
}

impl TerminalPrompt {
    fn new() -> Self {
        Self {
            lines: BufReader::new(tokio::io::stdin()).lines(),
        }
    }

    async fn ask(&mut self, question: &str) -> chanwatch_core::Result<String> {
        let mut out = tokio::io::stdout();
        out.write_all(question.as_bytes()).await?;
        out.flush().await?;
        self.lines
            .next_line()
            .await?
            .ok_or_else(|| Error::Auth("login aborted: stdin closed".to_string()))
    }
}

#[async_trait]
impl LoginPrompt for TerminalPrompt {
    async fn code(&mut self) -> chanwatch_core::Result<String> {
        self.ask("Login code: ").await
    }

    async fn password(&mut self, hint: Option<String>) -> chanwatch_core::Result<String> {
        match hint {
            Some(hint) => self.ask(&format!("2FA password (hint: {hint}): ")).await,
            None => self.ask("2FA password: ").await,
        }
    }
}

/// The configured session adapter behind the send pacer. The user session is
/// also returned bare so its state can be saved on exit.
async fn open_gateway(
    cfg: &Config,
) -> anyhow::Result<(Arc<dyn SessionGateway>, Option<Arc<UserGateway>>)> {
    let mut user = None;
    let inner: Arc<dyn SessionGateway> = match cfg.backend {
        Backend::User => {
            let session = Arc::new(UserGateway::connect(&cfg.user_session).await?);
            user = Some(session.clone());
            session
        }
        Backend::Bot => Arc::new(BotGateway::from_token(&cfg.bot_token)),
    };
    tracing::info!(backend = %cfg.backend, "session gateway ready");
    Ok((Arc::new(ThrottledGateway::new(inner, cfg.throttle)), user))
}

fn cancel_on_ctrl_c(message: &'static str) -> CancellationToken {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("{message}");
        }
        on_signal.cancel();
    });
    cancel
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    chanwatch_core::logging::init("chanwatch")?;
    let cli = Cli::parse();

    let cfg = Arc::new(Config::load()?);
    let store = Arc::new(
        SqliteStore::open(&cfg.database_path)
            .await
            .with_context(|| format!("opening {}", cfg.database_path.display()))?,
    );

    match cli.command {
        Commands::Crawl {
            query,
            channels_file,
            channels,
            format,
        } => {
            let mut peers = Vec::new();
            if let Some(path) = channels_file {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?;
                peers.extend(parse_channel_list(&text)?);
            }
            peers.extend(parse_peers(&channels)?);
            if peers.is_empty() {
                bail!("no channels given; use --channels-file or --channel");
            }
            let format = format
                .as_deref()
                .map(str::parse::<ExportFormat>)
                .transpose()?;

            let (gateway, user) = open_gateway(&cfg).await?;
            if !gateway.capabilities().supports_history_search {
                bail!(
                    "the {} backend cannot search history; crawl with CHANWATCH_BACKEND=user",
                    cfg.backend
                );
            }
            let svc = Services {
                cfg: cfg.clone(),
                gateway,
                store: store.clone(),
            };

            let cancel = cancel_on_ctrl_c("crawl interrupted; keeping partial results");
            let output = commands::crawl_and_export(&svc, &query, &peers, format, cancel).await?;
            println!("{}", output.report.render_summary());
            for file in &output.files {
                println!("wrote {}", file.display());
            }
            if let Some(user) = user {
                user.save_session()?;
            }
        }
        Commands::Monitor { topology, targets } => {
            let path = topology.unwrap_or_else(|| cfg.topology_path.clone());
            let topology = MonitorTopologyConfig::load(&path)
                .with_context(|| format!("loading topology {}", path.display()))?;
            let targets = parse_peers(&targets)?;
            let (gateway, _user) = open_gateway(&cfg).await?;
            let svc = Services {
                cfg: cfg.clone(),
                gateway,
                store: store.clone(),
            };

            let cancel = cancel_on_ctrl_c("shutdown requested");
            let stats = commands::start_monitor(&svc, &topology, &targets, cancel).await?;
            print_stats(&stats);
        }
        Commands::Login { phone } => {
            if cfg.backend != Backend::User {
                bail!("login applies to the user backend only");
            }
            let phone = phone
                .or_else(|| cfg.user_session.phone.clone())
                .ok_or_else(|| anyhow!("no phone number; pass --phone or set CHANWATCH_PHONE"))?;
            let user = UserGateway::connect(&cfg.user_session).await?;
            user.login(&phone, &mut TerminalPrompt::new()).await?;
            println!("session saved to {}", user.session_path().display());
        }
        Commands::Filter { action } => match action {
            FilterAction::Add {
                name,
                kind,
                pattern,
                action,
                priority,
            } => {
                let rule = commands::add_filter_rule(
                    store.as_ref(),
                    RuleDraft {
                        name,
                        kind,
                        pattern,
                        action,
                        priority,
                    },
                )
                .await?;
                println!("added rule {}", rule.id);
            }
            FilterAction::List => {
                let rules = commands::list_filter_rules(store.as_ref()).await?;
                println!("{}", render_filter_table(&rules));
            }
            FilterAction::Enable { id } => {
                commands::set_filter_rule_enabled(store.as_ref(), id, true).await?;
            }
            FilterAction::Disable { id } => {
                commands::set_filter_rule_enabled(store.as_ref(), id, false).await?;
            }
        },
    }

    Ok(())
}
