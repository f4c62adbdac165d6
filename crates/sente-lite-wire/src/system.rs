//! Well-known event-id constants for the `chsk/*` system taxonomy and the
//! `sente-lite/*` extension events this implementation adds on top of it.

/// System event ids, namespaced `chsk/*`, matching Sente's own handshake
/// and lifecycle vocabulary.
pub mod chsk {
    pub const HANDSHAKE: &str = "chsk/handshake";
    /// Local-only lifecycle notification dispatched to client handlers on
    /// connect/disconnect; never sent on the wire.
    pub const STATE: &str = "chsk/state";
    pub const RECV: &str = "chsk/recv";
    pub const WS_PING: &str = "chsk/ws-ping";
    pub const WS_PONG: &str = "chsk/ws-pong";
    pub const BAD_EVENT: &str = "chsk/bad-event";
    /// Reserved for protocol-level termination; not actively emitted.
    pub const CLOSE: &str = "chsk/close";
}

/// Extension event ids specific to this implementation, namespaced
/// `sente-lite/*` so they can never collide with a `chsk/*` system event or
/// an application event id.
pub mod sente_lite {
    pub const SUBSCRIBE: &str = "sente-lite/subscribe";
    pub const UNSUBSCRIBE: &str = "sente-lite/unsubscribe";
    pub const SUBSCRIBED: &str = "sente-lite/subscribed";
    pub const PUBLISH: &str = "sente-lite/publish";
    pub const CHANNEL_MSG: &str = "sente-lite/channel-msg";
    /// Test-friendly default reply for any event the server has no
    /// registered handler for; applications override it by registering
    /// their own handler for the incoming event id.
    pub const ECHO: &str = "sente-lite/echo";
}

/// All event ids beginning with this prefix are reserved for the wire
/// protocol itself; application code must not publish under it.
pub const SYSTEM_NAMESPACE: &str = "chsk";

/// All event ids beginning with this prefix are reserved for this
/// implementation's own extensions.
pub const EXTENSION_NAMESPACE: &str = "sente-lite";

/// Returns `true` for any event id in the `chsk/*` or `sente-lite/*`
/// namespaces — i.e. anything application code should not treat as its own.
pub fn is_reserved(event_id: &str) -> bool {
    event_id
        .split_once('/')
        .is_some_and(|(ns, _)| ns == SYSTEM_NAMESPACE || ns == EXTENSION_NAMESPACE)
}
