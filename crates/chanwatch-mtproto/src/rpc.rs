//! RPC error names -> core error classes.

use std::time::Duration;

use grammers_mtsender::{InvocationError, RpcError};

use chanwatch_core::errors::Error;

/// Longest server-requested wait honoured before giving up on a call.
pub(crate) const MAX_FLOOD_WAIT: Duration = Duration::from_secs(300);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RpcClass {
    FloodWait,
    TokenRejected,
    NotFound,
    Auth,
    Forbidden,
    Other,
}

pub(crate) fn classify_rpc(name: &str) -> RpcClass {
    match name {
        "FLOOD_WAIT" | "FLOOD_PREMIUM_WAIT" | "SLOWMODE_WAIT" => RpcClass::FloodWait,
        "CHANNEL_INVALID" | "PEER_ID_INVALID" | "USER_ID_INVALID" | "CHAT_ID_INVALID"
        | "CHANNEL_PRIVATE" | "INPUT_USER_DEACTIVATED" => RpcClass::TokenRejected,
        "USERNAME_NOT_OCCUPIED" | "USERNAME_INVALID" | "MSG_ID_INVALID"
        | "FILE_REFERENCE_EXPIRED" => RpcClass::NotFound,
        "AUTH_KEY_UNREGISTERED" | "AUTH_KEY_INVALID" | "SESSION_REVOKED" | "SESSION_EXPIRED"
        | "USER_DEACTIVATED" | "USER_DEACTIVATED_BAN" => RpcClass::Auth,
        "CHAT_ADMIN_REQUIRED" | "CHAT_WRITE_FORBIDDEN" | "CHAT_SEND_MEDIA_FORBIDDEN" => {
            RpcClass::Forbidden
        }
        _ => RpcClass::Other,
    }
}

/// Server-requested pause, when the error is a flood wait within bounds.
pub(crate) fn flood_wait(err: &InvocationError) -> Option<Duration> {
    let InvocationError::Rpc(rpc) = err else {
        return None;
    };
    if classify_rpc(&rpc.name) != RpcClass::FloodWait {
        return None;
    }
    let wait = Duration::from_secs(u64::from(rpc.value.unwrap_or(1)));
    (wait <= MAX_FLOOD_WAIT).then_some(wait)
}

/// `peer` is what a rejected access hash is reported against.
pub(crate) fn map_invocation(err: InvocationError, peer: Option<i64>) -> Error {
    match err {
        InvocationError::Rpc(rpc) => map_rpc(&rpc, peer),
        other => Error::Transport(format!("mtproto: {other}")),
    }
}

fn map_rpc(rpc: &RpcError, peer: Option<i64>) -> Error {
    match classify_rpc(&rpc.name) {
        RpcClass::TokenRejected => match peer {
            Some(id) => Error::TokenRejected(id),
            None => Error::NotFound(format!("mtproto: {}", rpc.name)),
        },
        RpcClass::NotFound => Error::NotFound(format!("mtproto: {}", rpc.name)),
        RpcClass::Auth => Error::Auth(format!("mtproto: {}", rpc.name)),
        RpcClass::FloodWait => Error::Transport(format!(
            "mtproto: {} for {}s",
            rpc.name,
            rpc.value.unwrap_or_default()
        )),
        RpcClass::Forbidden | RpcClass::Other => {
            Error::Transport(format!("mtproto: {} ({})", rpc.name, rpc.code))
        }
    }
}
