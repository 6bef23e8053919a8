//! Live monitor: one dispatch loop over the session's push updates.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    config::MonitorTopologyConfig,
    domain::{ChannelId, ChannelRef, Identity, UserId},
    errors::Error,
    filter::{FilterEngine, Verdict},
    gateway::{AuthState, InboundPost, PushEvent, SessionGateway, UserStatusEvent},
    identity::IdentityResolver,
    media::{MediaRelay, PROTECTED_MARKER},
    store::{ChannelMetadataRecord, MessageRecord, MonitoredUser, StatusUpdate, Store},
    Result,
};

pub const HIGHLIGHT_BANNER: &str = "*** HIGHLIGHT ***";
const MEDIA_FAILED_NOTICE: &str = "[Media could not be relayed]";

#[derive(Clone, Copy, Debug)]
pub struct MonitorConfig {
    /// Capacity of the queue between the update pump and the dispatch loop.
    pub queue_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Authenticating,
    Listening,
    ShuttingDown,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MonitorStats {
    pub received: u64,
    pub dropped: u64,
    pub duplicates: u64,
    pub ignored: u64,
    pub forwarded: u64,
    pub highlighted: u64,
    pub failures: u64,
    pub status_updates: u64,
}

/// Topology after resolution. Entries that failed to resolve are kept as
/// `(label, reason)` for reporting.
#[derive(Clone, Debug, Default)]
pub struct ResolvedTopology {
    pub sources: HashMap<ChannelId, ChannelRef>,
    pub targets: Vec<ChannelRef>,
    pub users: HashMap<UserId, Identity>,
    pub unresolved: Vec<(String, String)>,
}

/// Resolve every topology entry. Individual failures are logged and skipped;
/// ending up with no sources or no targets is a config error.
pub async fn resolve_topology(
    resolver: &IdentityResolver,
    topo: &MonitorTopologyConfig,
) -> Result<ResolvedTopology> {
    let mut out = ResolvedTopology::default();

    let sources = topo.source_channels.iter().chain(topo.source_groups.iter());
    for spec in sources {
        let Some(peer) = spec.to_peer() else {
            out.unresolved
                .push(("<empty>".to_string(), "entry has no id or username".to_string()));
            continue;
        };
        match resolver.resolve_channel(&peer).await {
            Ok(ch) => {
                out.sources.insert(ch.id, ch);
            }
            Err(e) => {
                tracing::warn!(source = %peer, error = %e, "source not resolved");
                out.unresolved.push((peer.to_string(), e.to_string()));
            }
        }
    }

    for spec in &topo.target_channels {
        let Some(peer) = spec.to_peer() else {
            out.unresolved
                .push(("<empty>".to_string(), "entry has no id or username".to_string()));
            continue;
        };
        match resolver.resolve_channel(&peer).await {
            Ok(ch) => {
                if !out.targets.iter().any(|t| t.id == ch.id) {
                    out.targets.push(ch);
                }
            }
            Err(e) => {
                tracing::warn!(dest = %peer, error = %e, "target not resolved");
                out.unresolved.push((peer.to_string(), e.to_string()));
            }
        }
    }

    for spec in &topo.monitor_users {
        let Some(peer) = spec.to_peer() else {
            continue;
        };
        match resolver.resolve(&peer).await {
            Ok(identity) => {
                out.users.insert(UserId(identity.id), identity);
            }
            Err(e) => {
                tracing::warn!(user = %peer, error = %e, "monitored user not resolved");
                out.unresolved.push((peer.to_string(), e.to_string()));
            }
        }
    }

    if out.sources.is_empty() {
        return Err(Error::Config(
            "no source channel or group could be resolved".to_string(),
        ));
    }
    if out.targets.is_empty() {
        return Err(Error::Config(
            "no target channel could be resolved".to_string(),
        ));
    }

    tracing::info!(
        sources = out.sources.len(),
        targets = out.targets.len(),
        users = out.users.len(),
        unresolved = out.unresolved.len(),
        "monitor topology resolved"
    );
    Ok(out)
}

pub struct MonitorDispatcher {
    gateway: Arc<dyn SessionGateway>,
    store: Arc<dyn Store>,
    resolver: Arc<IdentityResolver>,
    filters: FilterEngine,
    relay: MediaRelay,
    topology: ResolvedTopology,
    cfg: MonitorConfig,
    state: Mutex<MonitorState>,
    stats: Mutex<MonitorStats>,
}

impl MonitorDispatcher {
    pub fn new(
        gateway: Arc<dyn SessionGateway>,
        store: Arc<dyn Store>,
        resolver: Arc<IdentityResolver>,
        filters: FilterEngine,
        relay: MediaRelay,
        topology: ResolvedTopology,
        cfg: MonitorConfig,
    ) -> Self {
        Self {
            gateway,
            store,
            resolver,
            filters,
            relay,
            topology,
            cfg,
            state: Mutex::new(MonitorState::Idle),
            stats: Mutex::new(MonitorStats::default()),
        }
    }

    pub fn state(&self) -> MonitorState {
        match self.state.lock() {
            Ok(s) => *s,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn stats(&self) -> MonitorStats {
        match self.stats.lock() {
            Ok(s) => *s,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Run until `cancel` fires or the update stream ends.
    ///
    /// Events are handled one at a time in arrival order. Once cancelled, the
    /// event in hand finishes and nothing else is dispatched.
    pub async fn run(&self, cancel: CancellationToken) -> Result<MonitorStats> {
        self.set_state(MonitorState::Authenticating);
        match self.gateway.auth_state().await {
            Ok(AuthState::Authorized) => {}
            Ok(AuthState::Unauthorized { reason }) => {
                self.set_state(MonitorState::ShuttingDown);
                return Err(Error::Auth(reason));
            }
            Err(e) => {
                self.set_state(MonitorState::ShuttingDown);
                return Err(Error::Auth(e.to_string()));
            }
        }

        self.mirror_topology().await;

        let (tx, mut rx) = mpsc::channel::<PushEvent>(self.cfg.queue_capacity.max(1));
        let pump_cancel = cancel.child_token();
        let pump = {
            let gateway = self.gateway.clone();
            let pump_cancel = pump_cancel.clone();
            tokio::spawn(async move { gateway.pump_updates(tx, pump_cancel).await })
        };

        self.set_state(MonitorState::Listening);
        tracing::info!(
            sources = self.topology.sources.len(),
            targets = self.topology.targets.len(),
            rules = self.filters.len(),
            "monitor listening"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!("monitor cancelled");
                    break;
                }
                ev = rx.recv() => match ev {
                    Some(ev) => self.handle_event(ev).await,
                    None => {
                        tracing::info!("update stream ended");
                        break;
                    }
                },
            }
        }

        self.set_state(MonitorState::ShuttingDown);
        pump_cancel.cancel();
        rx.close();

        match pump.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_run_fatal() => return Err(e),
            Ok(Err(e)) => tracing::warn!(error = %e, "update pump ended with error"),
            Err(e) => tracing::warn!(error = %e, "update pump task failed"),
        }

        let stats = self.stats();
        tracing::info!(?stats, "monitor stopped");
        Ok(stats)
    }

    pub async fn handle_event(&self, ev: PushEvent) {
        match ev {
            PushEvent::NewPost(post) => self.handle_post(post).await,
            PushEvent::UserStatus(status) => self.handle_status(status).await,
            PushEvent::Other => {}
        }
    }

    async fn handle_post(&self, post: InboundPost) {
        self.bump(|s| s.received += 1);

        let Some(channel) = self.topology.sources.get(&post.channel_id) else {
            self.bump(|s| s.dropped += 1);
            return;
        };

        if let (Some(sender), Some(token)) = (post.sender, post.sender_token) {
            self.resolver.upgrade_token(sender.0, token);
        }

        let verdict = self
            .filters
            .evaluate(&post.text, post.channel_id, post.sender);

        let record = MessageRecord {
            channel_id: post.channel_id,
            message_id: post.message_id,
            title: channel.display_name(),
            username: channel.handle.clone(),
            timestamp: post.date,
            body: post.text.clone(),
            url: channel.permalink(post.message_id),
            verdict,
        };
        match self.store.save_message(&record).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(
                    channel_id = post.channel_id.0,
                    message_id = post.message_id.0,
                    "duplicate delivery skipped"
                );
                self.bump(|s| s.duplicates += 1);
                return;
            }
            Err(e) => {
                tracing::warn!(
                    channel_id = post.channel_id.0,
                    message_id = post.message_id.0,
                    error = %e,
                    "could not record message; dropping event"
                );
                self.bump(|s| s.failures += 1);
                return;
            }
        }

        if verdict == Verdict::Ignored {
            self.bump(|s| s.ignored += 1);
            return;
        }

        let text = self.clip(&compose(&channel.display_name(), &post, verdict));
        for target in &self.topology.targets {
            self.forward_to(target, &post, &text).await;
        }

        match verdict {
            Verdict::Highlight => self.bump(|s| s.highlighted += 1),
            _ => self.bump(|s| s.forwarded += 1),
        }
    }

    async fn forward_to(&self, target: &ChannelRef, post: &InboundPost, text: &str) {
        let sent = match &post.media {
            Some(media) => match self
                .relay
                .relay(media, target.id, text, post.is_protected)
                .await
            {
                Ok(_) => Ok(()),
                Err(e) => {
                    tracing::warn!(
                        target_id = target.id.0,
                        message_id = post.message_id.0,
                        error = %e,
                        "media relay failed; sending text only"
                    );
                    let room = MEDIA_FAILED_NOTICE.chars().count() + 2;
                    let fallback = format!(
                        "{}\n\n{MEDIA_FAILED_NOTICE}",
                        self.clip_reserving(text, room)
                    );
                    self.gateway
                        .send_text(target.id, &fallback)
                        .await
                        .map(|_| ())
                }
            },
            None => self.gateway.send_text(target.id, text).await.map(|_| ()),
        };

        if let Err(e) = sent {
            tracing::warn!(
                target_id = target.id.0,
                message_id = post.message_id.0,
                error = %e,
                "forward failed"
            );
            self.bump(|s| s.failures += 1);
        }
    }

    async fn handle_status(&self, ev: UserStatusEvent) {
        if !self.topology.users.contains_key(&ev.user_id) {
            self.bump(|s| s.dropped += 1);
            return;
        }
        let update = StatusUpdate {
            user_id: ev.user_id,
            status: ev.status,
            at: ev.at,
        };
        match self.store.append_status(&update).await {
            Ok(()) => self.bump(|s| s.status_updates += 1),
            Err(e) => {
                tracing::warn!(user_id = ev.user_id.0, error = %e, "status not recorded");
                self.bump(|s| s.failures += 1);
            }
        }
    }

    async fn mirror_topology(&self) {
        for ch in self.topology.sources.values() {
            let record = ChannelMetadataRecord {
                channel_id: ch.id,
                title: ch.display_name(),
                username: ch.handle.clone(),
                member_count: ch.member_count,
                is_public: ch.handle.is_some(),
            };
            if let Err(e) = self.store.save_channel_metadata(&record).await {
                tracing::warn!(channel_id = ch.id.0, error = %e, "channel metadata not stored");
            }
        }

        for identity in self.topology.users.values() {
            let user = MonitoredUser {
                user_id: UserId(identity.id),
                handle: identity.handle.clone(),
                first_name: None,
                last_name: None,
            };
            if let Err(e) = self.store.add_monitored_user(&user).await {
                tracing::warn!(user_id = identity.id, error = %e, "monitored user not stored");
            }
        }
    }

    fn clip(&self, text: &str) -> String {
        self.clip_reserving(text, 0)
    }

    /// Clip so that `reserve` more chars still fit in one message.
    fn clip_reserving(&self, text: &str, reserve: usize) -> String {
        let max = self.gateway.capabilities().max_message_len;
        if max == 0 {
            return text.to_string();
        }
        let budget = max.saturating_sub(reserve);
        if text.chars().count() <= budget {
            return text.to_string();
        }
        text.chars().take(budget).collect()
    }

    fn set_state(&self, next: MonitorState) {
        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        tracing::debug!(from = ?*state, to = ?next, "monitor state");
        *state = next;
    }

    fn bump(&self, f: impl FnOnce(&mut MonitorStats)) {
        let mut stats = match self.stats.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut stats);
    }
}

/// Outgoing body: optional banner, attribution line, then the original text.
fn compose(title: &str, post: &InboundPost, verdict: Verdict) -> String {
    let mut out = String::new();
    if verdict == Verdict::Highlight {
        out.push_str(HIGHLIGHT_BANNER);
        out.push('\n');
    }
    if post.is_protected {
        out.push_str(&format!("{PROTECTED_MARKER} Originally posted in: {title}"));
    } else {
        out.push_str(&format!("Forwarded from: {title}"));
    }
    if !post.text.is_empty() {
        out.push_str("\n\n");
        out.push_str(&post.text);
    }
    out
}
