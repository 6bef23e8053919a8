use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use crate::{
    domain::{normalize_handle, AccessToken, ChannelId, ChannelRef, Identity, PeerRef, UserId},
    errors::Error,
    gateway::{PeerCandidate, SessionGateway},
    Result,
};

#[derive(Clone, Copy, Debug)]
pub struct ResolverConfig {
    pub member_page_size: usize,
    /// Hard cap on membership pages read per channel during handle recovery.
    pub max_member_pages: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            member_page_size: 200,
            max_member_pages: 5,
        }
    }
}

/// Maps handles and numeric ids to identities, caching what it learns.
pub struct IdentityResolver {
    gateway: Arc<dyn SessionGateway>,
    cfg: ResolverConfig,
    cache: Mutex<HashMap<i64, Identity>>,
}

impl IdentityResolver {
    pub fn new(gateway: Arc<dyn SessionGateway>, cfg: ResolverConfig) -> Self {
        Self {
            gateway,
            cfg,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn resolve(&self, peer: &PeerRef) -> Result<Identity> {
        match peer {
            PeerRef::Id(id) => Ok(self.identity_for_id(*id)),
            PeerRef::Handle(handle) => {
                let found = self.lookup_handle(handle).await?;
                let identity = Identity::resolved(found.id, found.handle.clone(), found.token);
                self.remember(identity.clone());
                Ok(identity)
            }
        }
    }

    /// Resolve plus a best-effort title lookup.
    pub async fn resolve_channel(&self, peer: &PeerRef) -> Result<ChannelRef> {
        let mut channel = match peer {
            PeerRef::Handle(handle) => {
                let found = self.lookup_handle(handle).await?;
                self.remember(Identity::resolved(
                    found.id,
                    found.handle.clone(),
                    found.token,
                ));
                let mut channel =
                    ChannelRef::new(ChannelId(found.id), found.handle.clone(), found.token);
                channel.title = found.title.unwrap_or_default();
                channel
            }
            PeerRef::Id(id) => {
                let identity = self.identity_for_id(*id);
                ChannelRef::new(ChannelId(*id), identity.handle, identity.token)
            }
        };

        if channel.title.is_empty() || channel.handle.is_none() {
            match self.gateway.channel_info(channel.id, channel.token).await {
                Ok(info) => {
                    if channel.title.is_empty() {
                        channel.title = info.title;
                    }
                    if channel.handle.is_none() {
                        channel.handle = info.handle;
                    }
                }
                Err(e) => {
                    tracing::warn!(channel_id = channel.id.0, error = %e, "channel info unavailable");
                }
            }
        }

        Ok(channel)
    }

    /// Scan membership pages of `channels` looking for `user`.
    ///
    /// A page failure ends the scan of that channel only. No match is `None`,
    /// not an error.
    pub async fn recover_handle(&self, user: UserId, channels: &[ChannelRef]) -> Option<String> {
        if !self.gateway.capabilities().supports_member_scan {
            tracing::debug!(user_id = user.0, "member scan unsupported; skipping handle recovery");
            return None;
        }

        let page_size = self.cfg.member_page_size.max(1);
        for channel in channels {
            for page in 0..self.cfg.max_member_pages {
                let offset = page * page_size;
                let members = match self
                    .gateway
                    .members(channel.id, channel.token, offset, page_size)
                    .await
                {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::warn!(
                            channel_id = channel.id.0,
                            offset,
                            error = %e,
                            "member page failed; moving to next channel"
                        );
                        break;
                    }
                };

                if let Some(member) = members.iter().find(|m| m.user_id == user) {
                    self.upgrade_token(user.0, member.token);
                    if let Some(handle) = &member.handle {
                        self.set_handle(user.0, handle);
                    }
                    tracing::info!(
                        user_id = user.0,
                        channel_id = channel.id.0,
                        "recovered identity from channel membership"
                    );
                    return member.handle.clone();
                }

                if members.len() < page_size {
                    break;
                }
            }
        }

        None
    }

    /// Adopt a backend-issued token. Returns true when the cache changed.
    pub fn upgrade_token(&self, id: i64, token: AccessToken) -> bool {
        let mut cache = match self.cache.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        match cache.get_mut(&id) {
            Some(identity) => identity.upgrade_token(token),
            None => {
                cache.insert(id, Identity::resolved(id, None, token));
                true
            }
        }
    }

    pub fn cached(&self, id: i64) -> Option<Identity> {
        let cache = match self.cache.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        cache.get(&id).cloned()
    }

    fn identity_for_id(&self, id: i64) -> Identity {
        if let Some(known) = self.cached(id) {
            return known;
        }
        tracing::warn!(id, "no access token known; using placeholder token");
        let identity = Identity::placeholder(id);
        self.remember(identity.clone());
        identity
    }

    async fn lookup_handle(&self, handle: &str) -> Result<PeerCandidate> {
        let wanted = normalize_handle(handle);
        let candidates = self.gateway.resolve_handle(&wanted).await?;

        let mut matches: Vec<PeerCandidate> = Vec::new();
        for c in candidates {
            let same_handle = c
                .handle
                .as_deref()
                .is_some_and(|h| normalize_handle(h) == wanted);
            if same_handle && !matches.iter().any(|m| m.id == c.id) {
                matches.push(c);
            }
        }

        match matches.len() {
            0 => Err(Error::NotFound(format!("@{wanted}"))),
            1 => Ok(matches.remove(0)),
            n => Err(Error::Ambiguous {
                handle: wanted,
                candidates: n,
            }),
        }
    }

    fn remember(&self, identity: Identity) {
        let mut cache = match self.cache.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        cache.insert(identity.id, identity);
    }

    fn set_handle(&self, id: i64, handle: &str) {
        let mut cache = match self.cache.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(identity) = cache.get_mut(&id) {
            identity.handle = Some(handle.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::TokenOrigin,
        gateway::{MemberInfo, PeerKind},
        testing::FakeGateway,
    };

    fn candidate(id: i64, handle: &str, token: i64) -> PeerCandidate {
        PeerCandidate {
            kind: PeerKind::User,
            id,
            handle: Some(handle.to_string()),
            token: AccessToken(token),
            title: None,
            first_name: None,
            last_name: None,
        }
    }

    fn member(id: i64, handle: &str, token: i64) -> MemberInfo {
        MemberInfo {
            user_id: UserId(id),
            handle: Some(handle.to_string()),
            token: AccessToken(token),
            first_name: None,
            last_name: None,
        }
    }

    fn resolver(fake: Arc<FakeGateway>, cfg: ResolverConfig) -> IdentityResolver {
        IdentityResolver::new(fake, cfg)
    }

    #[tokio::test]
    async fn resolves_unique_handle() {
        let fake = Arc::new(FakeGateway::default());
        fake.add_candidate("alice", candidate(7, "Alice", 70));
        let r = resolver(fake, ResolverConfig::default());

        let id = r.resolve(&PeerRef::Handle("@ALICE".to_string())).await.unwrap();
        assert_eq!(id.id, 7);
        assert_eq!(id.token, AccessToken(70));
        assert_eq!(id.origin, TokenOrigin::Resolved);
        assert_eq!(r.cached(7).unwrap().token, AccessToken(70));
    }

    #[tokio::test]
    async fn two_identities_for_one_handle_is_ambiguous() {
        let fake = Arc::new(FakeGateway::default());
        fake.add_candidate("bob", candidate(1, "bob", 10));
        fake.add_candidate("bob", candidate(2, "Bob", 20));
        let r = resolver(fake, ResolverConfig::default());

        let err = r.resolve(&PeerRef::Handle("bob".to_string())).await.unwrap_err();
        assert!(matches!(err, Error::Ambiguous { candidates: 2, .. }));
    }

    #[tokio::test]
    async fn near_matches_do_not_count() {
        let fake = Arc::new(FakeGateway::default());
        fake.add_candidate("bob", candidate(1, "bobby", 10));
        let r = resolver(fake, ResolverConfig::default());

        let err = r.resolve(&PeerRef::Handle("bob".to_string())).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn unknown_numeric_id_gets_placeholder() {
        let fake = Arc::new(FakeGateway::default());
        let r = resolver(fake, ResolverConfig::default());

        let id = r.resolve(&PeerRef::Id(55)).await.unwrap();
        assert!(id.is_placeholder());
        assert_eq!(id.token, AccessToken(55));
    }

    #[tokio::test]
    async fn recovery_stops_at_first_match_and_upgrades_token() {
        let fake = Arc::new(FakeGateway::default());
        fake.set_members(ChannelId(100), vec![member(1, "one", 11), member(2, "two", 22)]);
        fake.set_members(ChannelId(200), vec![member(9, "nine", 99)]);
        let r = resolver(
            fake.clone(),
            ResolverConfig {
                member_page_size: 1,
                max_member_pages: 5,
            },
        );
        r.resolve(&PeerRef::Id(9)).await.unwrap();

        let channels = vec![
            ChannelRef::new(ChannelId(100), None, AccessToken(1)),
            ChannelRef::new(ChannelId(200), None, AccessToken(2)),
        ];
        let handle = r.recover_handle(UserId(9), &channels).await;

        assert_eq!(handle.as_deref(), Some("nine"));
        let cached = r.cached(9).unwrap();
        assert_eq!(cached.token, AccessToken(99));
        assert!(!cached.is_placeholder());
        // Three pages of channel 100 (the last one empty), then one hit.
        assert_eq!(fake.member_calls(), 4);
    }

    #[tokio::test]
    async fn recovery_respects_page_cap() {
        let fake = Arc::new(FakeGateway::default());
        let many: Vec<MemberInfo> = (1..=10).map(|i| member(i, "x", i)).collect();
        fake.set_members(ChannelId(100), many);
        let r = resolver(
            fake.clone(),
            ResolverConfig {
                member_page_size: 2,
                max_member_pages: 2,
            },
        );

        let channels = vec![ChannelRef::new(ChannelId(100), None, AccessToken(1))];
        assert_eq!(r.recover_handle(UserId(9), &channels).await, None);
        assert_eq!(fake.member_calls(), 2);
    }

    #[tokio::test]
    async fn failing_channel_does_not_stop_recovery() {
        let fake = Arc::new(FakeGateway::default());
        fake.fail_channel(ChannelId(100));
        fake.set_members(ChannelId(200), vec![member(9, "nine", 99)]);
        let r = resolver(fake, ResolverConfig::default());

        let channels = vec![
            ChannelRef::new(ChannelId(100), None, AccessToken(1)),
            ChannelRef::new(ChannelId(200), None, AccessToken(2)),
        ];
        assert_eq!(
            r.recover_handle(UserId(9), &channels).await.as_deref(),
            Some("nine")
        );
    }

    #[tokio::test]
    async fn channel_resolution_fills_title() {
        let fake = Arc::new(FakeGateway::default());
        fake.add_channel(100, Some("tech"), "Tech News", 10);
        let r = resolver(fake, ResolverConfig::default());

        let channel = r
            .resolve_channel(&PeerRef::Handle("tech".to_string()))
            .await
            .unwrap();
        assert_eq!(channel.id, ChannelId(100));
        assert_eq!(channel.title, "Tech News");
        assert_eq!(channel.handle.as_deref(), Some("tech"));
    }
}
