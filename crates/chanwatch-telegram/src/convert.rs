//! Bot API updates -> core push events.

use teloxide::types::{Chat, Message, MessageKind, Update, UpdateKind};

use chanwatch_core::{
    domain::{AccessToken, ChannelId, MessageId, UserId},
    gateway::{InboundPost, MediaRef, PeerCandidate, PeerKind, PushEvent},
};

/// Bot API ids double as access tokens; the API has no separate capability value.
pub(crate) fn token_for(id: i64) -> AccessToken {
    AccessToken(id)
}

pub(crate) fn update_to_event(update: Update) -> PushEvent {
    match update.kind {
        UpdateKind::ChannelPost(msg) => post_event(&msg),
        UpdateKind::Message(msg) if msg.chat.is_group() || msg.chat.is_supergroup() => {
            post_event(&msg)
        }
        _ => PushEvent::Other,
    }
}

fn post_event(msg: &Message) -> PushEvent {
    let sender = msg.from().map(|u| UserId(u.id.0 as i64));
    let text = msg
        .text()
        .or_else(|| msg.caption())
        .unwrap_or_default()
        .to_string();

    PushEvent::NewPost(InboundPost {
        channel_id: ChannelId::from_bot_api(msg.chat.id.0),
        message_id: MessageId(msg.id.0),
        sender,
        sender_token: sender.map(|u| token_for(u.0)),
        date: msg.date,
        text,
        media: media_of(msg),
        is_protected: is_protected(msg),
    })
}

fn is_protected(msg: &Message) -> bool {
    match &msg.kind {
        MessageKind::Common(common) => common.has_protected_content,
        _ => false,
    }
}

/// The single attachment worth relaying, largest photo size for photos.
pub(crate) fn media_of(msg: &Message) -> Option<MediaRef> {
    if let Some(doc) = msg.document() {
        return Some(MediaRef {
            file_id: doc.file.id.clone(),
            file_name: doc.file_name.clone(),
            mime_type: doc.mime_type.as_ref().map(|m| m.to_string()),
        });
    }
    if let Some(sizes) = msg.photo() {
        return sizes
            .iter()
            .max_by_key(|p| u64::from(p.width) * u64::from(p.height))
            .map(|p| MediaRef {
                file_id: p.file.id.clone(),
                file_name: Some("photo.jpg".to_string()),
                mime_type: Some("image/jpeg".to_string()),
            });
    }
    if let Some(video) = msg.video() {
        return Some(MediaRef {
            file_id: video.file.id.clone(),
            file_name: video.file_name.clone().or_else(|| Some("video.mp4".to_string())),
            mime_type: video.mime_type.as_ref().map(|m| m.to_string()),
        });
    }
    if let Some(anim) = msg.animation() {
        return Some(MediaRef {
            file_id: anim.file.id.clone(),
            file_name: anim.file_name.clone().or_else(|| Some("animation.mp4".to_string())),
            mime_type: anim.mime_type.as_ref().map(|m| m.to_string()),
        });
    }
    if let Some(audio) = msg.audio() {
        return Some(MediaRef {
            file_id: audio.file.id.clone(),
            file_name: audio.file_name.clone(),
            mime_type: audio.mime_type.as_ref().map(|m| m.to_string()),
        });
    }
    if let Some(voice) = msg.voice() {
        return Some(MediaRef {
            file_id: voice.file.id.clone(),
            file_name: Some("voice.ogg".to_string()),
            mime_type: voice.mime_type.as_ref().map(|m| m.to_string()),
        });
    }
    None
}

pub(crate) fn chat_candidate(chat: &Chat) -> PeerCandidate {
    let (kind, id) = if chat.is_private() {
        (PeerKind::User, chat.id.0)
    } else {
        (PeerKind::Channel, ChannelId::from_bot_api(chat.id.0).0)
    };
    PeerCandidate {
        kind,
        id,
        handle: chat.username().map(str::to_string),
        token: token_for(id),
        title: chat.title().map(str::to_string),
        first_name: chat.first_name().map(str::to_string),
        last_name: chat.last_name().map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(json: &str) -> Update {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn channel_post_becomes_new_post() {
        let ev = update_to_event(update(
            r#"{
              "update_id": 10,
              "channel_post": {
                "message_id": 42,
                "chat": {"id": -1001234, "title": "Source", "username": "src", "type": "channel"},
                "date": 1700000000,
                "text": "hello",
                "has_protected_content": true
              }
            }"#,
        ));

        let PushEvent::NewPost(post) = ev else {
            panic!("expected a post");
        };
        assert_eq!(post.channel_id, ChannelId(1234));
        assert_eq!(post.message_id, MessageId(42));
        assert_eq!(post.text, "hello");
        assert!(post.is_protected);
        assert!(post.media.is_none());
        assert!(post.sender.is_none());
    }

    #[test]
    fn document_caption_is_the_text() {
        let ev = update_to_event(update(
            r#"{
              "update_id": 11,
              "channel_post": {
                "message_id": 7,
                "chat": {"id": -1001999000111, "title": "Files", "type": "channel"},
                "date": 1700000000,
                "caption": "report attached",
                "document": {
                  "file_id": "DOC1",
                  "file_unique_id": "U1",
                  "file_name": "report.pdf",
                  "mime_type": "application/pdf",
                  "file_size": 2048
                }
              }
            }"#,
        ));

        let PushEvent::NewPost(post) = ev else {
            panic!("expected a post");
        };
        assert_eq!(post.text, "report attached");
        assert_eq!(post.channel_id, ChannelId(1999000111));
        let media = post.media.unwrap();
        assert_eq!(media.file_id, "DOC1");
        assert_eq!(media.file_name.as_deref(), Some("report.pdf"));
        assert!(!post.is_protected);
    }

    #[test]
    fn private_messages_are_not_posts() {
        let ev = update_to_event(update(
            r#"{
              "update_id": 12,
              "message": {
                "message_id": 1,
                "from": {"id": 5, "is_bot": false, "first_name": "A"},
                "chat": {"id": 5, "first_name": "A", "type": "private"},
                "date": 1700000000,
                "text": "hi"
              }
            }"#,
        ));
        assert!(matches!(ev, PushEvent::Other));
    }
}
