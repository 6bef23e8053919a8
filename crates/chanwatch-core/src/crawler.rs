//! Historical search of one user's posts across a list of channels.

use std::{fmt::Write as _, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::{
    domain::{normalize_handle, AccessToken, ChannelRef, Identity, Message, UserId},
    errors::Error,
    gateway::{MemberInfo, SearchRequest, SessionGateway},
    identity::IdentityResolver,
    Result,
};

#[derive(Clone, Copy, Debug)]
pub struct CrawlConfig {
    pub page_size: usize,
    pub page_delay: Duration,
    pub channel_delay: Duration,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            page_delay: Duration::from_millis(500),
            channel_delay: Duration::from_secs(2),
        }
    }
}

/// What the crawl learned about one channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelMetadata {
    pub channel: ChannelRef,
    /// The searched user is among the channel admins.
    pub user_is_admin: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelOutcome {
    Complete,
    /// Pagination stopped on an error; messages up to that point are kept.
    Partial { reason: String },
    Unresolved { reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelSummary {
    pub label: String,
    pub message_count: usize,
    pub outcome: ChannelOutcome,
}

/// Result of crawling one channel.
#[derive(Debug)]
pub struct ChannelCrawl {
    pub metadata: ChannelMetadata,
    pub messages: Vec<Message>,
    pub error: Option<Error>,
}

impl ChannelCrawl {
    pub fn outcome(&self) -> ChannelOutcome {
        match &self.error {
            None => ChannelOutcome::Complete,
            Some(e) => ChannelOutcome::Partial {
                reason: failure_reason(e),
            },
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct CrawlReport {
    /// Handle or id that was searched for.
    pub query: String,
    pub summaries: Vec<ChannelSummary>,
    pub messages: Vec<Message>,
    /// Only channels with at least one message.
    pub metadata: Vec<ChannelMetadata>,
    /// Cancelled before every channel was visited.
    pub interrupted: bool,
}

impl CrawlReport {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    pub fn push_unresolved(&mut self, label: impl Into<String>, reason: impl Into<String>) {
        self.summaries.push(ChannelSummary {
            label: label.into(),
            message_count: 0,
            outcome: ChannelOutcome::Unresolved {
                reason: reason.into(),
            },
        });
    }

    fn push_crawl(&mut self, crawl: ChannelCrawl) {
        let outcome = crawl.outcome();
        self.summaries.push(ChannelSummary {
            label: summary_label(&crawl.metadata.channel),
            message_count: crawl.messages.len(),
            outcome,
        });
        if !crawl.messages.is_empty() {
            self.metadata.push(crawl.metadata);
        }
        self.messages.extend(crawl.messages);
    }

    pub fn total_members(&self) -> u64 {
        self.metadata
            .iter()
            .map(|m| u64::from(m.channel.member_count))
            .sum()
    }

    /// Human summary: one block per channel with messages, totals, then any
    /// channels that failed or could not be resolved.
    pub fn render_summary(&self) -> String {
        let mut out = String::new();
        if self.interrupted {
            let _ = writeln!(out, "Crawl interrupted; results below are partial.");
            out.push('\n');
        }
        let _ = writeln!(out, "Summary of channels with messages:");
        let _ = writeln!(out, "==================================");

        for meta in &self.metadata {
            let ch = &meta.channel;
            let count = self
                .messages
                .iter()
                .filter(|m| m.channel_id == ch.id)
                .count();
            let _ = writeln!(out, "{}", summary_label(ch));
            if meta.user_is_admin {
                let _ = writeln!(out, "  * Admin status: yes");
            }
            let _ = writeln!(out, "  * Messages: {count}");
            let _ = writeln!(out, "  * Members: {}", ch.member_count);
            let first = ch
                .first_contact
                .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .unwrap_or_else(|| "-".to_string());
            let _ = writeln!(out, "  * First message: {first}");
            let _ = writeln!(out, "  * Link: {}", ch.link());
            out.push('\n');
        }

        if self.metadata.is_empty() {
            let _ = writeln!(out, "No messages found in any channels.");
        } else {
            let channels = self.metadata.len();
            let total = self.messages.len();
            let _ = writeln!(out, "Total statistics:");
            let _ = writeln!(out, "=================");
            let _ = writeln!(out, "Channels with messages: {channels}");
            let _ = writeln!(out, "Total messages found: {total}");
            let _ = writeln!(out, "Total members in channels: {}", self.total_members());
            let _ = writeln!(
                out,
                "Average messages per channel: {:.1}",
                total as f64 / channels as f64
            );
        }

        let failures: Vec<&ChannelSummary> = self
            .summaries
            .iter()
            .filter(|s| s.outcome != ChannelOutcome::Complete)
            .collect();
        if !failures.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "Channels with problems:");
            for s in failures {
                match &s.outcome {
                    ChannelOutcome::Partial { reason } if s.message_count == 0 => {
                        let _ = writeln!(out, "  {}: failed ({reason})", s.label);
                    }
                    ChannelOutcome::Partial { reason } => {
                        let _ = writeln!(
                            out,
                            "  {}: partial, {} messages kept ({reason})",
                            s.label, s.message_count
                        );
                    }
                    ChannelOutcome::Unresolved { reason } => {
                        let _ = writeln!(out, "  {}: unresolved ({reason})", s.label);
                    }
                    ChannelOutcome::Complete => {}
                }
            }
        }

        out
    }
}

fn summary_label(ch: &ChannelRef) -> String {
    let title = ch.display_name();
    match &ch.handle {
        Some(h) => format!("{title} (@{h})"),
        None => format!("{title} ({})", ch.link()),
    }
}

fn failure_reason(e: &Error) -> String {
    match e {
        Error::TokenRejected(_) => "token rejected".to_string(),
        other => other.to_string(),
    }
}

/// Sequential, rate-limited crawler over one session.
pub struct ChannelCrawler {
    gateway: Arc<dyn SessionGateway>,
    resolver: Arc<IdentityResolver>,
    cfg: CrawlConfig,
    cancel: CancellationToken,
}

impl ChannelCrawler {
    pub fn new(
        gateway: Arc<dyn SessionGateway>,
        resolver: Arc<IdentityResolver>,
        cfg: CrawlConfig,
    ) -> Self {
        Self {
            gateway,
            resolver,
            cfg,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop between pages and channels once `cancel` fires, keeping what was
    /// collected so far.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Sleep for `delay`; true when cancelled first.
    async fn pause(&self, delay: Duration) -> bool {
        if delay.is_zero() {
            return self.cancel.is_cancelled();
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => true,
            _ = sleep(delay) => false,
        }
    }

    /// Crawl every channel in order. Per-channel failures are contained in the
    /// report; only run-fatal errors (auth) abort.
    pub async fn crawl_all(
        &self,
        query: &str,
        channels: &[ChannelRef],
        user: &Identity,
    ) -> Result<CrawlReport> {
        let mut report = CrawlReport::new(query);
        self.crawl_into(&mut report, channels, user).await?;
        Ok(report)
    }

    /// Like [`crawl_all`](Self::crawl_all) but appends to an existing report,
    /// so callers can record unresolved channels first.
    pub async fn crawl_into(
        &self,
        report: &mut CrawlReport,
        channels: &[ChannelRef],
        user: &Identity,
    ) -> Result<()> {
        for (idx, channel) in channels.iter().enumerate() {
            let cancelled = if idx > 0 {
                self.pause(self.cfg.channel_delay).await
            } else {
                self.cancel.is_cancelled()
            };
            if cancelled {
                tracing::warn!(remaining = channels.len() - idx, "crawl interrupted");
                report.interrupted = true;
                return Ok(());
            }

            let mut crawl = self.crawl(channel, user).await;
            match crawl.error.take() {
                Some(e) if e.is_run_fatal() => return Err(e),
                Some(e) => {
                    tracing::warn!(
                        channel_id = channel.id.0,
                        kept = crawl.messages.len(),
                        error = %e,
                        "channel crawl stopped early"
                    );
                    crawl.error = Some(e);
                }
                None => {}
            }
            tracing::info!(
                channel_id = channel.id.0,
                messages = crawl.messages.len(),
                "channel crawled"
            );
            report.push_crawl(crawl);
        }
        if self.cancel.is_cancelled() {
            report.interrupted = true;
        }
        Ok(())
    }

    /// Crawl one channel for posts by `user`. Never fails as a whole: errors
    /// are carried in the result next to whatever was collected.
    pub async fn crawl(&self, channel: &ChannelRef, user: &Identity) -> ChannelCrawl {
        let mut channel = channel.clone();
        let mut messages: Vec<Message> = Vec::new();
        let mut error = None;

        if self.gateway.capabilities().supports_history_search {
            if let Err(e) = self.paginate(&mut channel, user, &mut messages).await {
                error = Some(e);
            }
        } else {
            error = Some(Error::Unsupported("history search".to_string()));
        }

        channel.first_contact = earliest(&messages);
        let mut user_is_admin = false;
        if !messages.is_empty() {
            user_is_admin = self.fill_metadata(&mut channel, user).await;
        }

        ChannelCrawl {
            metadata: ChannelMetadata {
                channel,
                user_is_admin,
            },
            messages,
            error,
        }
    }

    async fn paginate(
        &self,
        channel: &mut ChannelRef,
        user: &Identity,
        out: &mut Vec<Message>,
    ) -> Result<()> {
        let page_size = self.cfg.page_size.max(1);
        let mut user_token: AccessToken = user.token;
        let mut offset = 0usize;

        loop {
            let req = SearchRequest {
                channel: channel.id,
                channel_token: channel.token,
                from_user: UserId(user.id),
                user_token,
                offset,
                limit: page_size,
            };
            let page = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Error::Interrupted),
                page = self.gateway.search_messages(&req) => page?,
            };
            tracing::debug!(
                channel_id = channel.id.0,
                offset,
                got = page.len(),
                "search page"
            );

            for raw in &page {
                if let (Some(sender), Some(token)) = (raw.sender, raw.sender_token) {
                    if sender.0 == user.id && token != user_token {
                        self.resolver.upgrade_token(user.id, token);
                        user_token = token;
                    }
                }
                out.push(Message {
                    channel_id: channel.id,
                    channel_title: channel.title.clone(),
                    channel_handle: channel.handle.clone(),
                    message_id: raw.id,
                    timestamp: raw.date,
                    body: raw.text.clone(),
                    permalink: channel.permalink(raw.id),
                    has_media: raw.has_media,
                });
            }

            if page.len() < page_size {
                return Ok(());
            }
            offset += page.len();
            if self.pause(self.cfg.page_delay).await {
                return Err(Error::Interrupted);
            }
        }
    }

    /// Best effort; failures leave fields at their zero values.
    async fn fill_metadata(&self, channel: &mut ChannelRef, user: &Identity) -> bool {
        match self.gateway.channel_info(channel.id, channel.token).await {
            Ok(info) => {
                if channel.title.is_empty() {
                    channel.title = info.title;
                }
                if channel.handle.is_none() {
                    channel.handle = info.handle;
                }
            }
            Err(e) => tracing::warn!(channel_id = channel.id.0, error = %e, "channel info failed"),
        }

        match self.gateway.member_count(channel.id, channel.token).await {
            Ok(n) => channel.member_count = n,
            Err(e) => tracing::warn!(channel_id = channel.id.0, error = %e, "member count failed"),
        }

        match self.gateway.admins(channel.id, channel.token).await {
            Ok(admins) => {
                channel.admin_handles = admins.iter().filter_map(admin_label).collect();
            }
            Err(e) => tracing::warn!(channel_id = channel.id.0, error = %e, "admin list failed"),
        }

        let Some(handle) = user.handle.as_deref().map(normalize_handle) else {
            return false;
        };
        channel
            .admin_handles
            .iter()
            .any(|a| normalize_handle(a) == handle)
    }
}

/// Handle when the admin has one, otherwise "First Last".
fn admin_label(admin: &MemberInfo) -> Option<String> {
    if let Some(h) = admin.handle.as_deref().filter(|h| !h.is_empty()) {
        return Some(h.to_string());
    }
    let name = [admin.first_name.as_deref(), admin.last_name.as_deref()]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    (!name.is_empty()).then_some(name)
}

fn earliest(messages: &[Message]) -> Option<DateTime<Utc>> {
    messages.iter().map(|m| m.timestamp).min()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::{
        domain::{ChannelId, MessageId},
        gateway::{MemberInfo, RawMessage},
        identity::ResolverConfig,
        testing::FakeGateway,
    };

    fn fast() -> CrawlConfig {
        CrawlConfig {
            page_size: 100,
            page_delay: Duration::ZERO,
            channel_delay: Duration::ZERO,
        }
    }

    fn raw(id: i32, secs: i64, text: &str) -> RawMessage {
        RawMessage {
            id: MessageId(id),
            date: Utc.timestamp_opt(secs, 0).unwrap(),
            text: text.to_string(),
            has_media: false,
            sender: Some(UserId(7)),
            sender_token: None,
        }
    }

    fn crawler(fake: Arc<FakeGateway>, cfg: CrawlConfig) -> (ChannelCrawler, Arc<IdentityResolver>) {
        let resolver = Arc::new(IdentityResolver::new(fake.clone(), ResolverConfig::default()));
        (ChannelCrawler::new(fake, resolver.clone(), cfg), resolver)
    }

    fn alice() -> Identity {
        Identity::resolved(7, Some("alice".to_string()), AccessToken(70))
    }

    fn tech() -> ChannelRef {
        let mut ch = ChannelRef::new(ChannelId(100), Some("tech".to_string()), AccessToken(100));
        ch.title = "Tech".to_string();
        ch
    }

    #[tokio::test]
    async fn collects_messages_and_metadata() {
        let fake = Arc::new(FakeGateway::default());
        fake.add_channel(100, Some("tech"), "Tech", 1234);
        fake.push_search_page(
            ChannelId(100),
            vec![raw(3, 3000, "c"), raw(1, 1000, "a"), raw(2, 2000, "b")],
        );
        let (crawler, _) = crawler(fake, fast());

        let report = crawler.crawl_all("alice", &[tech()], &alice()).await.unwrap();

        assert_eq!(report.messages.len(), 3);
        assert_eq!(report.metadata.len(), 1);
        let meta = &report.metadata[0].channel;
        assert_eq!(meta.member_count, 1234);
        assert_eq!(meta.first_contact, Some(Utc.timestamp_opt(1000, 0).unwrap()));
        assert_eq!(report.messages[0].permalink, "https://t.me/tech/3");
        assert_eq!(report.summaries[0].outcome, ChannelOutcome::Complete);
    }

    #[tokio::test]
    async fn short_page_ends_pagination() {
        let fake = Arc::new(FakeGateway::default());
        fake.push_search_page(ChannelId(100), vec![raw(1, 1, "a"), raw(2, 2, "b")]);
        fake.push_search_page(ChannelId(100), vec![raw(3, 3, "c")]);
        fake.push_search_page(ChannelId(100), vec![raw(4, 4, "never")]);
        let (crawler, _) = crawler(
            fake.clone(),
            CrawlConfig {
                page_size: 2,
                ..fast()
            },
        );

        let crawl = crawler.crawl(&tech(), &alice()).await;
        assert!(crawl.error.is_none());
        assert_eq!(crawl.messages.len(), 3);
        assert_eq!(fake.search_calls(), 2);
    }

    #[tokio::test]
    async fn page_error_keeps_partial_results_and_continues() {
        let fake = Arc::new(FakeGateway::default());
        fake.push_search_page(ChannelId(100), vec![raw(1, 1, "a"), raw(2, 2, "b")]);
        fake.push_search_error(ChannelId(100), "boom");
        fake.push_search_page(ChannelId(300), vec![raw(9, 9, "z")]);
        let (crawler, _) = crawler(
            fake,
            CrawlConfig {
                page_size: 2,
                ..fast()
            },
        );

        let other = ChannelRef::new(ChannelId(300), Some("other".to_string()), AccessToken(3));
        let report = crawler
            .crawl_all("alice", &[tech(), other], &alice())
            .await
            .unwrap();

        assert_eq!(report.messages.len(), 3);
        assert!(matches!(
            report.summaries[0].outcome,
            ChannelOutcome::Partial { .. }
        ));
        assert_eq!(report.summaries[0].message_count, 2);
        assert_eq!(report.summaries[1].outcome, ChannelOutcome::Complete);
    }

    #[tokio::test]
    async fn rejected_placeholder_token_fails_only_that_channel() {
        let fake = Arc::new(FakeGateway::default());
        fake.reject_placeholder_tokens();
        fake.push_search_page(ChannelId(300), vec![raw(5, 5, "ok")]);
        let (crawler, resolver) = crawler(fake, fast());

        let private = resolver
            .resolve_channel(&crate::domain::PeerRef::Id(555))
            .await
            .unwrap();
        let good = ChannelRef::new(ChannelId(300), Some("good".to_string()), AccessToken(3));
        let report = crawler
            .crawl_all("alice", &[private, good], &alice())
            .await
            .unwrap();

        assert_eq!(
            report.summaries[0].outcome,
            ChannelOutcome::Partial {
                reason: "token rejected".to_string()
            }
        );
        assert_eq!(report.summaries[0].message_count, 0);
        assert_eq!(report.summaries[1].message_count, 1);
        assert!(report.render_summary().contains("failed (token rejected)"));
    }

    #[tokio::test]
    async fn metadata_failures_leave_zero_values() {
        let fake = Arc::new(FakeGateway::default());
        fake.push_search_page(ChannelId(100), vec![raw(1, 1, "a")]);
        let (crawler, _) = crawler(fake, fast());

        let crawl = crawler.crawl(&tech(), &alice()).await;
        assert!(crawl.error.is_none());
        assert_eq!(crawl.metadata.channel.member_count, 0);
        assert!(crawl.metadata.channel.admin_handles.is_empty());
    }

    #[tokio::test]
    async fn sender_token_upgrades_cached_identity() {
        let fake = Arc::new(FakeGateway::default());
        let mut m = raw(1, 1, "a");
        m.sender_token = Some(AccessToken(777));
        fake.push_search_page(ChannelId(100), vec![m]);
        let (crawler, resolver) = crawler(fake, fast());

        crawler.crawl(&tech(), &Identity::placeholder(7)).await;
        let cached = resolver.cached(7).unwrap();
        assert_eq!(cached.token, AccessToken(777));
        assert!(!cached.is_placeholder());
    }

    #[tokio::test]
    async fn summary_flags_admin_channels() {
        let fake = Arc::new(FakeGateway::default());
        fake.add_channel(100, Some("tech"), "Tech", 10);
        fake.set_admins(
            ChannelId(100),
            vec![MemberInfo {
                user_id: UserId(7),
                handle: Some("Alice".to_string()),
                token: AccessToken(70),
                first_name: None,
                last_name: None,
            }],
        );
        fake.push_search_page(ChannelId(100), vec![raw(1, 1, "a"), raw(2, 2, "b")]);
        let (crawler, _) = crawler(fake, fast());

        let mut report = crawler.crawl_all("alice", &[tech()], &alice()).await.unwrap();
        report.push_unresolved("@gone", "not found: @gone");
        assert!(report.metadata[0].user_is_admin);

        let text = report.render_summary();
        assert!(text.contains("Tech (@tech)"));
        assert!(text.contains("Admin status: yes"));
        assert!(text.contains("Total messages found: 2"));
        assert!(text.contains("Average messages per channel: 2.0"));
        assert!(text.contains("@gone: unresolved"));
    }

    #[tokio::test]
    async fn admins_without_handle_are_listed_by_name() {
        let fake = Arc::new(FakeGateway::default());
        fake.add_channel(100, Some("tech"), "Tech", 10);
        fake.set_admins(
            ChannelId(100),
            vec![
                MemberInfo {
                    user_id: UserId(8),
                    handle: None,
                    token: AccessToken(80),
                    first_name: Some("Bob".to_string()),
                    last_name: Some("Stone".to_string()),
                },
                MemberInfo {
                    user_id: UserId(9),
                    handle: Some("carol".to_string()),
                    token: AccessToken(90),
                    first_name: Some("Carol".to_string()),
                    last_name: None,
                },
                MemberInfo {
                    user_id: UserId(10),
                    handle: None,
                    token: AccessToken(100),
                    first_name: None,
                    last_name: None,
                },
            ],
        );
        fake.push_search_page(ChannelId(100), vec![raw(1, 1, "a")]);
        let (crawler, _) = crawler(fake, fast());

        let crawl = crawler.crawl(&tech(), &alice()).await;
        assert_eq!(
            crawl.metadata.channel.admin_handles,
            vec!["Bob Stone".to_string(), "carol".to_string()]
        );
        assert!(!crawl.metadata.user_is_admin);
    }

    #[tokio::test]
    async fn cancelled_before_start_visits_nothing() {
        let fake = Arc::new(FakeGateway::default());
        fake.push_search_page(ChannelId(100), vec![raw(1, 1, "a")]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (crawler, _) = crawler(fake.clone(), fast());
        let crawler = crawler.with_cancel(cancel);

        let report = crawler.crawl_all("alice", &[tech()], &alice()).await.unwrap();
        assert!(report.interrupted);
        assert!(report.summaries.is_empty());
        assert_eq!(fake.search_calls(), 0);
        assert!(report.render_summary().starts_with("Crawl interrupted"));
    }

    #[tokio::test]
    async fn cancel_during_page_delay_keeps_collected_messages() {
        let fake = Arc::new(FakeGateway::default());
        fake.add_channel(100, Some("tech"), "Tech", 10);
        fake.push_search_page(ChannelId(100), vec![raw(1, 1, "a"), raw(2, 2, "b")]);
        fake.push_search_page(ChannelId(300), vec![raw(9, 9, "z")]);
        let cancel = CancellationToken::new();
        let (crawler, _) = crawler(
            fake.clone(),
            CrawlConfig {
                page_size: 2,
                page_delay: Duration::from_secs(30),
                channel_delay: Duration::ZERO,
            },
        );
        let crawler = crawler.with_cancel(cancel.clone());

        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let other = ChannelRef::new(ChannelId(300), Some("other".to_string()), AccessToken(3));
        let report = crawler
            .crawl_all("alice", &[tech(), other], &alice())
            .await
            .unwrap();

        assert!(report.interrupted);
        assert_eq!(report.messages.len(), 2);
        assert_eq!(report.summaries.len(), 1);
        assert_eq!(
            report.summaries[0].outcome,
            ChannelOutcome::Partial {
                reason: "interrupted".to_string()
            }
        );
        assert_eq!(report.metadata[0].channel.member_count, 10);
        assert_eq!(fake.search_calls(), 1);
    }

    #[tokio::test]
    async fn empty_report_says_so() {
        let report = CrawlReport::new("alice");
        assert!(report
            .render_summary()
            .contains("No messages found in any channels."));
    }
}
