//! Typed event and operation multiplexing over server-side WebSockets.
//!
//! A plain WebSocket carries opaque messages. This crate layers a small
//! sub-protocol on top (see [`hermes_wire`]) so one connection can carry any
//! number of named events and operations, each with its own typed handler:
//!
//! ```text
//! $chat\n{"user":"ada","text":"hi"}     event "chat"
//! $$sync$full\n{"rev":41}               operation "sync", config "full"
//! hello                                 plain message, passed through
//! ```
//!
//! The pieces:
//!
//! - [`WsRoute`]: one endpoint. Carries the accept/reject policy, the
//!   optional init handshake, handler templates and route-wide hooks.
//!   Templates registered after sockets have connected are stamped onto the
//!   already-connected sockets too.
//! - [`EventSocket`]: one live connection. Per-socket handlers, lifecycle
//!   hooks, `send`/`emit`/`emit_operation`, graceful `close` and immediate
//!   `terminate`.
//! - [`Validator`]: three-tier payload validation (raw bytes, then UTF-8
//!   text, then parsed JSON). [`JsonValidator`] covers the common case of
//!   deserializing into a serde type.
//! - [`UpgradeResponder`]: the seam towards the HTTP layer. Any server stack
//!   that can finish a 101 handshake and hand over the stream can drive a
//!   route; [`StreamResponder`] covers streams that are already upgraded.
//!
//! Decoding fails open: a frame that does not parse as an event or operation
//! is delivered as a plain message instead of being dropped, and binary
//! frames are never interpreted as events.
//!
//! # Example
//!
//! ```ignore
//! use hermes_ws::{JsonValidator, StreamResponder, WsConfig, WsRoute};
//!
//! let route = WsRoute::new("/live");
//! route
//!     .accept_reject(|request| async move {
//!         request.uri().query() == Some("token=secret")
//!     })
//!     .event(
//!         "double",
//!         |value: i64, socket| {
//!             let _ = socket.emit("result", value * 2);
//!         },
//!         JsonValidator::<i64>::new(),
//!     );
//!
//! // for each incoming upgrade, once the HTTP layer has switched protocols:
//! Arc::clone(&route)
//!     .handle(request, StreamResponder::new(io, WsConfig::default()))
//!     .await;
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod route;
pub mod socket;
pub mod upgrade;
pub mod validate;

mod log;

pub use config::WsConfig;
pub use error::{CloseCode, WsError, WsResult};
pub use events::{HookId, HookKind, Hooks, SocketEvent};
pub use route::{AcceptDecision, InitData, WsRoute};
pub use socket::{ConnectionId, EventSocket, SocketSender, SocketState};
pub use upgrade::{
    compute_accept_key, reject_response, switching_protocols_response, validate_upgrade_request,
    StreamResponder, UpgradeResponder,
};
pub use validate::{
    parse_with, BytesValidator, JsonValidator, RawValue, TextValidator, ValidationError, Validator,
};

pub use hermes_wire as wire;
pub use hermes_wire::{Frame, WireValue};
