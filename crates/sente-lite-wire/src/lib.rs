//! Sente-compatible event-vector wire format: EDN encoding plus the
//! `chsk/*` system and `sente-lite/*` extension event taxonomy.

pub mod edn;
pub mod event;
pub mod system;

pub use edn::{EdnParseError, EdnValue, Ident};
pub use event::{decode, encode, DecodeError, Envelope, EventId, EventVector};
pub use system::{chsk, is_reserved, sente_lite};
