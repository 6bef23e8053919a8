//! Entry points used by the command-line layer.

use std::{path::PathBuf, sync::Arc};

use tokio_util::sync::CancellationToken;

use crate::{
    config::{Config, MonitorTopologyConfig, PeerSpec},
    crawler::{ChannelCrawler, CrawlReport},
    domain::{ChannelRef, Identity, PeerRef, UserId},
    errors::Error,
    export::{export_report, ExportFormat},
    filter::{FilterEngine, FilterRule, RuleDraft},
    gateway::{AuthState, SessionGateway},
    identity::IdentityResolver,
    media::MediaRelay,
    monitor::{resolve_topology, MonitorDispatcher, MonitorStats},
    store::Store,
    Result,
};

/// Everything a command needs, built once by the binary.
#[derive(Clone)]
pub struct Services {
    pub cfg: Arc<Config>,
    pub gateway: Arc<dyn SessionGateway>,
    pub store: Arc<dyn Store>,
}

pub struct CrawlOutput {
    pub report: CrawlReport,
    pub files: Vec<PathBuf>,
}

async fn ensure_authorized(gateway: &dyn SessionGateway) -> Result<()> {
    match gateway.auth_state().await? {
        AuthState::Authorized => Ok(()),
        AuthState::Unauthorized { reason } => Err(Error::Auth(reason)),
    }
}

/// Search `query`'s posts in `channels` and optionally export the result.
///
/// Cancelling `cancel` stops the crawl early; whatever was collected is still
/// exported and the report is marked interrupted.
pub async fn crawl_and_export(
    svc: &Services,
    query: &str,
    channels: &[PeerRef],
    format: Option<ExportFormat>,
    cancel: CancellationToken,
) -> Result<CrawlOutput> {
    ensure_authorized(svc.gateway.as_ref()).await?;

    let user_ref = PeerRef::parse(query)
        .ok_or_else(|| Error::Config(format!("invalid user reference: {query:?}")))?;
    let resolver = Arc::new(IdentityResolver::new(
        svc.gateway.clone(),
        svc.cfg.resolver,
    ));

    let mut report = CrawlReport::new(query.trim());
    let mut resolved: Vec<ChannelRef> = Vec::with_capacity(channels.len());
    for peer in channels {
        match resolver.resolve_channel(peer).await {
            Ok(ch) => resolved.push(ch),
            Err(e) => {
                tracing::warn!(channel = %peer, error = %e, "channel not resolved");
                report.push_unresolved(peer.to_string(), e.to_string());
            }
        }
    }

    let user = resolve_user(&resolver, &user_ref, &resolved).await?;
    tracing::info!(
        user_id = user.id,
        placeholder = user.is_placeholder(),
        channels = resolved.len(),
        "starting crawl"
    );

    let crawler =
        ChannelCrawler::new(svc.gateway.clone(), resolver, svc.cfg.crawl).with_cancel(cancel);
    crawler.crawl_into(&mut report, &resolved, &user).await?;

    let files = match format {
        Some(format) => export_report(&svc.cfg.export_dir, format, &report)?,
        None => Vec::new(),
    };

    Ok(CrawlOutput { report, files })
}

/// Handles resolve directly. Bare ids first try membership recovery, then
/// fall back to a placeholder token.
async fn resolve_user(
    resolver: &IdentityResolver,
    user_ref: &PeerRef,
    channels: &[ChannelRef],
) -> Result<Identity> {
    let identity = resolver.resolve(user_ref).await?;
    if !identity.is_placeholder() {
        return Ok(identity);
    }

    match resolver.recover_handle(UserId(identity.id), channels).await {
        Some(handle) => tracing::info!(user_id = identity.id, %handle, "handle recovered"),
        None => tracing::warn!(
            user_id = identity.id,
            "handle not recovered; crawling with placeholder token"
        ),
    }
    Ok(resolver.cached(identity.id).unwrap_or(identity))
}

/// Resolve the topology (plus any extra targets) and run the monitor until
/// `cancel` fires.
pub async fn start_monitor(
    svc: &Services,
    topology: &MonitorTopologyConfig,
    extra_targets: &[PeerRef],
    cancel: CancellationToken,
) -> Result<MonitorStats> {
    ensure_authorized(svc.gateway.as_ref()).await?;

    let mut topology = topology.clone();
    for peer in extra_targets {
        topology.target_channels.push(match peer {
            PeerRef::Id(id) => PeerSpec {
                id: Some(*id),
                username: None,
            },
            PeerRef::Handle(h) => PeerSpec {
                id: None,
                username: Some(h.clone()),
            },
        });
    }

    let resolver = Arc::new(IdentityResolver::new(
        svc.gateway.clone(),
        svc.cfg.resolver,
    ));
    let resolved = resolve_topology(&resolver, &topology).await?;
    let filters = FilterEngine::from_store(svc.store.as_ref()).await?;
    let relay = MediaRelay::new(svc.gateway.clone(), svc.cfg.media);

    let dispatcher = MonitorDispatcher::new(
        svc.gateway.clone(),
        svc.store.clone(),
        resolver,
        filters,
        relay,
        resolved,
        svc.cfg.monitor,
    );
    dispatcher.run(cancel).await
}

pub async fn add_filter_rule(store: &dyn Store, draft: RuleDraft) -> Result<FilterRule> {
    let valid = draft.validate()?;
    let rule = store.add_filter(&valid).await?;
    tracing::info!(id = rule.id, kind = %rule.kind, action = %rule.action, "filter rule added");
    Ok(rule)
}

pub async fn list_filter_rules(store: &dyn Store) -> Result<Vec<FilterRule>> {
    store.list_filters().await
}

pub async fn set_filter_rule_enabled(store: &dyn Store, id: i64, enabled: bool) -> Result<()> {
    store.set_filter_enabled(id, enabled).await?;
    tracing::info!(id, enabled, "filter rule updated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::{
        config::{Backend, UserSessionConfig},
        crawler::{ChannelOutcome, CrawlConfig},
        domain::{AccessToken, ChannelId, MessageId},
        gateway::{InboundPost, MemberInfo, PeerCandidate, PeerKind, PushEvent, RawMessage},
        gateway::throttled::ThrottleConfig,
        identity::ResolverConfig,
        media::MediaConfig,
        monitor::MonitorConfig,
        testing::{FakeGateway, FakeStore},
    };

    fn services(fake: Arc<FakeGateway>, store: Arc<FakeStore>, export_dir: PathBuf) -> Services {
        let cfg = Config {
            backend: Backend::User,
            bot_token: String::new(),
            user_session: UserSessionConfig::default(),
            data_dir: export_dir.clone(),
            database_path: export_dir.join("test.db"),
            topology_path: export_dir.join("monitor.json"),
            export_dir,
            crawl: CrawlConfig {
                page_size: 100,
                page_delay: Duration::ZERO,
                channel_delay: Duration::ZERO,
            },
            resolver: ResolverConfig::default(),
            media: MediaConfig::default(),
            monitor: MonitorConfig::default(),
            throttle: ThrottleConfig::default(),
        };
        Services {
            cfg: Arc::new(cfg),
            gateway: fake,
            store,
        }
    }

    fn raw(id: i32, secs: i64) -> RawMessage {
        RawMessage {
            id: MessageId(id),
            date: Utc.timestamp_opt(secs, 0).unwrap(),
            text: format!("post {id}"),
            has_media: false,
            sender: Some(UserId(7)),
            sender_token: None,
        }
    }

    #[tokio::test]
    async fn crawl_by_handle_exports_messages_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeGateway::default());
        fake.add_candidate(
            "alice",
            PeerCandidate {
                kind: PeerKind::User,
                id: 7,
                handle: Some("alice".to_string()),
                token: AccessToken(70),
                title: None,
                first_name: Some("Alice".to_string()),
                last_name: None,
            },
        );
        fake.add_channel(100, Some("tech"), "Tech", 500);
        fake.push_search_page(ChannelId(100), vec![raw(1, 300), raw(2, 100), raw(3, 200)]);
        let svc = services(fake, Arc::new(FakeStore::default()), dir.path().to_path_buf());

        let out = crawl_and_export(
            &svc,
            "@alice",
            &[PeerRef::Handle("tech".to_string())],
            Some(ExportFormat::Json),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(out.report.messages.len(), 3);
        let meta = &out.report.metadata[0].channel;
        assert_eq!(meta.member_count, 500);
        assert_eq!(meta.first_contact, Some(Utc.timestamp_opt(100, 0).unwrap()));
        assert_eq!(out.files.len(), 2);
        assert!(out.files[0].ends_with("alice_messages.json"));
    }

    #[tokio::test]
    async fn unresolved_channels_are_reported_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeGateway::default());
        fake.add_channel(100, Some("tech"), "Tech", 5);
        let svc = services(fake, Arc::new(FakeStore::default()), dir.path().to_path_buf());

        let out = crawl_and_export(
            &svc,
            "7",
            &[
                PeerRef::Handle("ghost".to_string()),
                PeerRef::Handle("tech".to_string()),
            ],
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(matches!(
            out.report.summaries[0].outcome,
            ChannelOutcome::Unresolved { .. }
        ));
        assert_eq!(out.report.summaries[1].outcome, ChannelOutcome::Complete);
        assert!(out.files.is_empty());
    }

    #[tokio::test]
    async fn numeric_user_recovers_token_from_membership() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeGateway::default());
        fake.add_channel(100, Some("tech"), "Tech", 5);
        fake.set_members(
            ChannelId(100),
            vec![MemberInfo {
                user_id: UserId(7),
                handle: Some("alice".to_string()),
                token: AccessToken(70),
                first_name: None,
                last_name: None,
            }],
        );
        fake.push_search_page(ChannelId(100), vec![raw(1, 1)]);
        let svc = services(fake, Arc::new(FakeStore::default()), dir.path().to_path_buf());

        let out = crawl_and_export(
            &svc,
            "7",
            &[PeerRef::Handle("tech".to_string())],
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(out.report.messages.len(), 1);
    }

    #[tokio::test]
    async fn unauthorized_session_stops_crawl() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeGateway::default());
        fake.set_authorized(false);
        let svc = services(fake, Arc::new(FakeStore::default()), dir.path().to_path_buf());

        let err = crawl_and_export(&svc, "@alice", &[], None, CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(err.is_run_fatal());
    }

    #[tokio::test]
    async fn interrupted_crawl_still_exports_what_it_has() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeGateway::default());
        fake.add_candidate(
            "alice",
            PeerCandidate {
                kind: PeerKind::User,
                id: 7,
                handle: Some("alice".to_string()),
                token: AccessToken(70),
                title: None,
                first_name: None,
                last_name: None,
            },
        );
        fake.add_channel(100, Some("tech"), "Tech", 5);
        fake.add_channel(200, Some("news"), "News", 5);
        fake.push_search_page(ChannelId(100), vec![raw(1, 10)]);
        fake.push_search_page(ChannelId(200), vec![raw(2, 20)]);
        let mut svc = services(fake, Arc::new(FakeStore::default()), dir.path().to_path_buf());
        let mut cfg = (*svc.cfg).clone();
        cfg.crawl.channel_delay = Duration::from_secs(30);
        svc.cfg = Arc::new(cfg);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let out = crawl_and_export(
            &svc,
            "@alice",
            &[
                PeerRef::Handle("tech".to_string()),
                PeerRef::Handle("news".to_string()),
            ],
            Some(ExportFormat::Csv),
            cancel,
        )
        .await
        .unwrap();

        assert!(out.report.interrupted);
        assert_eq!(out.report.messages.len(), 1);
        assert_eq!(out.files.len(), 2);
        assert!(out.report.render_summary().starts_with("Crawl interrupted"));
    }

    #[tokio::test]
    async fn monitor_applies_stored_rules() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeGateway::default());
        fake.add_channel(100, None, "Source", 10);
        fake.add_channel(200, None, "Target", 1);
        for (id, text) in [(1, "spam offer"), (2, "useful post")] {
            fake.queue_event(PushEvent::NewPost(InboundPost {
                channel_id: ChannelId(100),
                message_id: MessageId(id),
                sender: None,
                sender_token: None,
                date: Utc::now(),
                text: text.to_string(),
                media: None,
                is_protected: false,
            }));
        }
        let store = Arc::new(FakeStore::default());
        add_filter_rule(
            store.as_ref(),
            RuleDraft {
                name: "no spam".to_string(),
                kind: "keyword".to_string(),
                pattern: "spam".to_string(),
                action: "ignore".to_string(),
                priority: 5,
            },
        )
        .await
        .unwrap();
        let svc = services(fake.clone(), store, dir.path().to_path_buf());
        let topo = MonitorTopologyConfig {
            source_channels: vec![PeerSpec {
                id: Some(100),
                username: None,
            }],
            ..MonitorTopologyConfig::default()
        };

        let stats = start_monitor(&svc, &topo, &[PeerRef::Id(200)], CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stats.ignored, 1);
        let sent = fake.sent_texts();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, ChannelId(200));
        assert_eq!(sent[0].1, "Forwarded from: Source\n\nuseful post");
    }

    #[tokio::test]
    async fn filter_commands_round_trip_enable_state() {
        let store = FakeStore::default();
        let rule = add_filter_rule(
            &store,
            RuleDraft {
                name: String::new(),
                kind: "regex".to_string(),
                pattern: r"^\d+$".to_string(),
                action: "highlight".to_string(),
                priority: 1,
            },
        )
        .await
        .unwrap();
        assert!(rule.enabled);

        set_filter_rule_enabled(&store, rule.id, false).await.unwrap();
        let listed = list_filter_rules(&store).await.unwrap();
        assert!(!listed[0].enabled);

        let err = set_filter_rule_enabled(&store, 99, true).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let err = add_filter_rule(
            &store,
            RuleDraft {
                kind: "regex".to_string(),
                pattern: "[".to_string(),
                action: "ignore".to_string(),
                ..RuleDraft::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::InvalidRule(_)));
        assert_eq!(list_filter_rules(&store).await.unwrap().len(), 1);
    }
}
