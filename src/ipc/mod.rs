//! Bridge IPC: MessagePack framing and the daemon ↔ shim protocol.

pub mod codec;
pub mod protocol;
