//! sente-lite: bidirectional WebSocket messaging with a Sente-compatible
//! event-vector wire format.
//!
//! This crate is a thin re-export over its three building blocks:
//!
//! - [`sente_lite_wire`] — the EDN subset and event-vector codec shared by
//!   both sides of the wire.
//! - [`sente_lite_client`] — connection lifecycle, reconnect/backoff, send
//!   queue, and handler registry for the client side.
//! - [`sente_lite_server`] — the WebSocket accept loop, channel pub/sub,
//!   heartbeat sweeper, and HTTP introspection routes for the server side.
//!
//! Most applications only need one side; import the relevant sub-crate
//! directly if you don't need both in the same binary.

pub use sente_lite_wire as wire;

pub mod client {
    pub use sente_lite_client::*;
}

pub mod server {
    pub use sente_lite_server::*;
}

pub use sente_lite_wire::{
    chsk, decode, encode, is_reserved, sente_lite, DecodeError, EdnParseError, EdnValue, Envelope,
    EventId, EventVector, Ident,
};
