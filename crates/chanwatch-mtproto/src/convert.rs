//! MTProto types -> core gateway types.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, TimeZone, Utc};
use grammers_client::types::{Chat, Media};
use grammers_session::{PackedChat, PackedType};
use grammers_tl_types as tl;

use chanwatch_core::{
    domain::{AccessToken, ChannelId, MessageId, UserId},
    gateway::{MediaRef, MemberInfo, PeerCandidate, PeerKind, RawMessage},
};

const MEDIA_CACHE: usize = 512;

/// Basic groups have no access hash and share nothing with channel ids, so
/// they are kept negative on the core side, as the Bot API does.
pub(crate) fn core_id(packed: &PackedChat) -> i64 {
    match packed.ty {
        PackedType::Chat => -packed.id,
        _ => packed.id,
    }
}

pub(crate) fn input_peer(channel: ChannelId, access_hash: i64) -> tl::enums::InputPeer {
    if channel.0 < 0 {
        tl::enums::InputPeer::Chat(tl::types::InputPeerChat {
            chat_id: -channel.0,
        })
    } else {
        tl::enums::InputPeer::Channel(tl::types::InputPeerChannel {
            channel_id: channel.0,
            access_hash,
        })
    }
}

pub(crate) fn input_channel(channel: ChannelId, access_hash: i64) -> tl::enums::InputChannel {
    tl::enums::InputChannel::Channel(tl::types::InputChannel {
        channel_id: channel.0,
        access_hash,
    })
}

pub(crate) fn input_user(user: UserId, token: AccessToken) -> tl::enums::InputPeer {
    tl::enums::InputPeer::User(tl::types::InputPeerUser {
        user_id: user.0,
        access_hash: token.0,
    })
}

pub(crate) fn packed_channel(ch: &tl::types::Channel) -> PackedChat {
    let ty = if ch.gigagroup {
        PackedType::Gigagroup
    } else if ch.megagroup {
        PackedType::Megagroup
    } else {
        PackedType::Broadcast
    };
    PackedChat {
        ty,
        id: ch.id,
        access_hash: ch.access_hash,
    }
}

pub(crate) fn is_protected_chat(chat: &Chat) -> bool {
    match chat {
        Chat::Channel(ch) => ch.raw.noforwards,
        Chat::Group(g) => match &g.raw {
            tl::enums::Chat::Channel(ch) => ch.noforwards,
            tl::enums::Chat::Chat(c) => c.noforwards,
            _ => false,
        },
        _ => false,
    }
}

pub(crate) fn chat_candidate(chat: &Chat) -> PeerCandidate {
    let packed = chat.pack();
    let token = AccessToken(packed.access_hash.unwrap_or_default());
    match chat {
        Chat::User(u) => PeerCandidate {
            kind: PeerKind::User,
            id: u.raw.id,
            handle: u.raw.username.clone(),
            token,
            title: None,
            first_name: u.raw.first_name.clone(),
            last_name: u.raw.last_name.clone(),
        },
        Chat::Channel(ch) => PeerCandidate {
            kind: PeerKind::Channel,
            id: ch.raw.id,
            handle: ch.raw.username.clone(),
            token,
            title: Some(ch.raw.title.clone()),
            first_name: None,
            last_name: None,
        },
        Chat::Group(g) => {
            let (handle, title) = match &g.raw {
                tl::enums::Chat::Channel(ch) => (ch.username.clone(), Some(ch.title.clone())),
                tl::enums::Chat::Chat(c) => (None, Some(c.title.clone())),
                _ => (None, None),
            };
            PeerCandidate {
                kind: PeerKind::Channel,
                id: core_id(&packed),
                handle,
                token,
                title,
                first_name: None,
                last_name: None,
            }
        }
    }
}

pub(crate) fn member_of(user: &tl::types::User) -> MemberInfo {
    MemberInfo {
        user_id: UserId(user.id),
        handle: user.username.clone(),
        token: AccessToken(user.access_hash.unwrap_or_default()),
        first_name: user.first_name.clone(),
        last_name: user.last_name.clone(),
    }
}

pub(crate) fn members_of(users: &[tl::enums::User]) -> Vec<MemberInfo> {
    users
        .iter()
        .filter_map(|u| match u {
            tl::enums::User::User(u) if !u.deleted => Some(member_of(u)),
            _ => None,
        })
        .collect()
}

fn unix(secs: i32) -> DateTime<Utc> {
    Utc.timestamp_opt(i64::from(secs), 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Search results carry sender access hashes in the `users` vector only.
pub(crate) fn raw_messages(
    messages: Vec<tl::enums::Message>,
    users: &[tl::enums::User],
) -> Vec<RawMessage> {
    let hashes: HashMap<i64, i64> = users
        .iter()
        .filter_map(|u| match u {
            tl::enums::User::User(u) => u.access_hash.map(|h| (u.id, h)),
            _ => None,
        })
        .collect();

    messages
        .into_iter()
        .filter_map(|m| match m {
            tl::enums::Message::Message(m) => Some(m),
            _ => None,
        })
        .map(|m| {
            let sender = match &m.from_id {
                Some(tl::enums::Peer::User(p)) => Some(UserId(p.user_id)),
                _ => None,
            };
            RawMessage {
                id: MessageId(m.id),
                date: unix(m.date),
                text: m.message,
                has_media: m.media.is_some(),
                sender,
                sender_token: sender.and_then(|u| hashes.get(&u.0).copied().map(AccessToken)),
            }
        })
        .collect()
}

/// Labels stored in the status history.
pub(crate) fn status_label(
    status: &tl::enums::UserStatus,
) -> (&'static str, Option<DateTime<Utc>>) {
    match status {
        tl::enums::UserStatus::Online(_) => ("online", None),
        tl::enums::UserStatus::Offline(s) => ("offline", Some(unix(s.was_online))),
        tl::enums::UserStatus::Recently(_) => ("recently", None),
        tl::enums::UserStatus::LastWeek(_) => ("last_week", None),
        tl::enums::UserStatus::LastMonth(_) => ("last_month", None),
        tl::enums::UserStatus::Empty => ("unknown", None),
    }
}

pub(crate) fn media_key(chat: i64, message: i32) -> String {
    format!("{chat}:{message}")
}

pub(crate) fn parse_media_key(key: &str) -> Option<(i64, i32)> {
    let (chat, msg) = key.split_once(':')?;
    Some((chat.parse().ok()?, msg.parse().ok()?))
}

/// Photos and documents only; stickers, polls and the rest are not relayed.
pub(crate) fn media_ref(key: String, media: &Media) -> Option<MediaRef> {
    match media {
        Media::Photo(_) => Some(MediaRef {
            file_id: key,
            file_name: Some("photo.jpg".to_string()),
            mime_type: Some("image/jpeg".to_string()),
        }),
        Media::Document(doc) => Some(MediaRef {
            file_id: key,
            file_name: Some(doc.name().to_string()).filter(|n| !n.is_empty()),
            mime_type: doc.mime_type().map(str::to_string),
        }),
        _ => None,
    }
}

/// Recently seen attachments, so a relay does not refetch the message.
pub(crate) type MediaCache = BoundedCache<Media>;

impl Default for MediaCache {
    fn default() -> Self {
        Self::with_capacity(MEDIA_CACHE)
    }
}

/// Insertion-ordered map that forgets its oldest keys past `cap`.
pub(crate) struct BoundedCache<V> {
    items: HashMap<String, V>,
    order: VecDeque<String>,
    cap: usize,
}

impl<V: Clone> BoundedCache<V> {
    pub(crate) fn with_capacity(cap: usize) -> Self {
        Self {
            items: HashMap::new(),
            order: VecDeque::new(),
            cap: cap.max(1),
        }
    }

    pub(crate) fn get(&self, key: &str) -> Option<V> {
        self.items.get(key).cloned()
    }

    pub(crate) fn insert(&mut self, key: String, value: V) {
        if self.items.insert(key.clone(), value).is_none() {
            self.order.push_back(key);
        }
        while self.order.len() > self.cap {
            if let Some(old) = self.order.pop_front() {
                self.items.remove(&old);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_groups_are_negative_on_the_core_side() {
        let chat = PackedChat {
            ty: PackedType::Chat,
            id: 4521,
            access_hash: None,
        };
        let channel = PackedChat {
            ty: PackedType::Broadcast,
            id: 1987654321,
            access_hash: Some(99),
        };
        assert_eq!(core_id(&chat), -4521);
        assert_eq!(core_id(&channel), 1987654321);
    }

    #[test]
    fn input_peers_follow_the_id_sign() {
        match input_peer(ChannelId(-4521), 0) {
            tl::enums::InputPeer::Chat(c) => assert_eq!(c.chat_id, 4521),
            other => panic!("unexpected peer {other:?}"),
        }
        match input_peer(ChannelId(1234), 77) {
            tl::enums::InputPeer::Channel(c) => {
                assert_eq!(c.channel_id, 1234);
                assert_eq!(c.access_hash, 77);
            }
            other => panic!("unexpected peer {other:?}"),
        }
    }

    #[test]
    fn status_labels() {
        let online = tl::enums::UserStatus::Online(tl::types::UserStatusOnline { expires: 0 });
        assert_eq!(status_label(&online), ("online", None));

        let offline = tl::enums::UserStatus::Offline(tl::types::UserStatusOffline {
            was_online: 1_700_000_000,
        });
        let (label, at) = status_label(&offline);
        assert_eq!(label, "offline");
        assert_eq!(at.map(|t| t.timestamp()), Some(1_700_000_000));

        assert_eq!(status_label(&tl::enums::UserStatus::Empty).0, "unknown");
    }

    #[test]
    fn bounded_cache_forgets_oldest() {
        let mut cache = BoundedCache::with_capacity(2);
        cache.insert("a".to_string(), 1);
        cache.insert("b".to_string(), 2);
        cache.insert("a".to_string(), 10);
        cache.insert("c".to_string(), 3);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some(2));
        assert_eq!(cache.get("c"), Some(3));
    }

    #[test]
    fn media_keys_round_trip() {
        let key = media_key(-4521, 17);
        assert_eq!(parse_media_key(&key), Some((-4521, 17)));
        assert_eq!(parse_media_key("DOC1"), None);
        assert_eq!(parse_media_key("1:x"), None);
    }
}
