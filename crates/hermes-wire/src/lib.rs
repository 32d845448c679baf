//! # Hermes wire format
//!
//! The textual sub-protocol Hermes uses to multiplex named events and
//! operations over a single WebSocket connection, independent of the
//! transport's own framing.
//!
//! ## Wire format
//!
//! Every logical message is one WebSocket frame. Text frames whose first
//! line starts with the marker `$` carry an event or an operation; all
//! other frames (including every binary frame) are plain messages.
//!
//! ```text
//! $eventName
//! <payload, may span further lines>
//! ```
//!
//! ```text
//! $$operationName$<config, may itself contain '$'>
//! <payload>
//! ```
//!
//! The head is everything before the first newline; the payload is the
//! rest, rejoined verbatim. Event and operation names must not contain the
//! marker; violating this is a programming error and panics at call time.
//!
//! ## Payload stringification
//!
//! Outbound payloads go through a deliberately lossy, human-debuggable
//! stringification ([`WireValue::to_wire_string`]): strings and byte
//! buffers pass through as text, `Undefined` renders as the literal
//! `undefined`, NaN as `NaN`, and everything else JSON-serializes. This
//! asymmetry is the wire contract; peers interoperate on these exact bytes.
//!
//! ## Decoding is fail-open
//!
//! A malformed head never produces an error: the decoder degrades to
//! [`Frame::Plain`] through an explicit fallback branch, so an unparseable
//! message can never take a connection down.

mod frame;
mod value;

pub use frame::{check_event_name, decode, encode_event, encode_operation, Frame, MARKER};
pub use value::{RawMessage, WireError, WireValue};
