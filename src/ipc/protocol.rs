//! Wire protocol message types for the browser bridge.
//!
//! All messages are MessagePack-encoded maps with at minimum `type` and
//! `id` fields. The shim (the browser-side half of the bridge) sends
//! `hello`, `event` and `reply`; the daemon sends `hello_ack` and the
//! browser requests. Request ids are assigned by the daemon and are
//! never zero; unsolicited messages carry id 0.

use serde::{Deserialize, Serialize};

use crate::browser::{BrowserEvent, Tab, TabId, TabQuery, WindowId};

/// All wire protocol messages.
///
/// Serialized as a tagged union on the `type` field via MessagePack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    // -- Handshake --
    Hello {
        id: u32,
        version: u32,
    },

    HelloAck {
        id: u32,
        status: Status,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    // -- Shim → daemon --
    Event {
        id: u32,
        event: BrowserEvent,
    },

    Reply(Reply),

    // -- Daemon → shim requests --
    Query {
        id: u32,
        query: TabQuery,
    },

    Get {
        id: u32,
        tab_id: TabId,
    },

    Remove {
        id: u32,
        tab_id: TabId,
    },

    Activate {
        id: u32,
        tab_id: TabId,
    },

    FocusWindow {
        id: u32,
        window_id: WindowId,
    },

    FocusedWindow {
        id: u32,
    },
}

impl Message {
    pub fn id(&self) -> u32 {
        match self {
            Self::Hello { id, .. }
            | Self::HelloAck { id, .. }
            | Self::Event { id, .. }
            | Self::Query { id, .. }
            | Self::Get { id, .. }
            | Self::Remove { id, .. }
            | Self::Activate { id, .. }
            | Self::FocusWindow { id, .. }
            | Self::FocusedWindow { id } => *id,
            Self::Reply(reply) => reply.id,
        }
    }
}

/// Shim's answer to a daemon request, correlated by `id`.
///
/// Which payload field is set depends on the request: `tabs` for
/// `query`, `tab` for `get`, `window_id` for `focused_window` (absent
/// when no window has focus). Mutations carry no payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Reply {
    pub id: u32,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tabs: Option<Vec<Tab>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab: Option<Tab>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_id: Option<WindowId>,
}

impl Reply {
    pub fn ok(id: u32) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    pub fn error(id: u32, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            id,
            status: Status::Error,
            error_kind: Some(kind),
            error: Some(message.into()),
            ..Self::default()
        }
    }
}

/// Response status.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Ok,
    Error,
}

/// Failure class reported by the shim.
///
/// `transient` is the lock-contention class ("tabs cannot be edited
/// right now"); `not_found` means the tab or window no longer exists.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    NotFound,
    Permanent,
}

/// Bridge protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum payload size (16 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Minimal envelope for extracting `{type, id}` from unknown messages.
///
/// Used as a fallback when [`Message`] deserialization fails, so a
/// newer shim's unknown message can be logged and skipped instead of
/// dropping the connection.
#[derive(Debug, PartialEq, Eq, Deserialize)]
pub struct RawEnvelope {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub id: u32,
}
