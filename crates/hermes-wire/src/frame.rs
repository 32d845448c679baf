//! Frame classification and the encode/decode pair.

use bytes::Bytes;

use crate::value::WireValue;

/// The reserved marker character introducing event and operation heads.
pub const MARKER: char = '$';

/// One decoded unit of the sub-protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A message that is not part of the event sub-protocol.
    Plain {
        /// The raw message bytes, untouched.
        data: Bytes,
        /// Whether the transport frame was binary.
        binary: bool,
    },
    /// A named event.
    Event {
        /// The event name (trimmed, marker-free).
        name: String,
        /// The payload: everything after the first newline.
        payload: Bytes,
    },
    /// A named operation with a free-text configuration string.
    Operation {
        /// The operation name (trimmed, marker-free).
        name: String,
        /// The configuration text from the head; may contain the marker.
        config: String,
        /// The payload: everything after the first newline.
        payload: Bytes,
    },
}

impl Frame {
    /// Whether this frame is a plain message.
    pub fn is_plain(&self) -> bool {
        matches!(self, Self::Plain { .. })
    }

    /// The event or operation name, if any.
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Event { name, .. } | Self::Operation { name, .. } => Some(name),
            Self::Plain { .. } => None,
        }
    }
}

/// Check that a name is usable as an event or operation name.
///
/// # Panics
///
/// Panics if the name contains the reserved marker. Registering or
/// emitting under such a name is a programming error and fails
/// immediately rather than producing a corrupt head on the wire.
pub fn check_event_name(name: &str) {
    assert!(
        !name.contains(MARKER),
        "event name cannot contain '{MARKER}'"
    );
}

/// Encode an event frame: `$name` followed by the stringified payload.
///
/// # Panics
///
/// Panics if `name` contains the reserved marker.
pub fn encode_event(name: &str, payload: &WireValue) -> String {
    check_event_name(name);
    format!("{MARKER}{name}\n{}", payload.to_wire_string())
}

/// Encode an operation frame: `$$name$config` followed by the
/// stringified payload.
///
/// # Panics
///
/// Panics if `name` contains the reserved marker.
pub fn encode_operation(name: &str, config: &WireValue, payload: &WireValue) -> String {
    check_event_name(name);
    format!(
        "{MARKER}{MARKER}{name}{MARKER}{}\n{}",
        config.to_wire_string(),
        payload.to_wire_string()
    )
}

/// Decode one inbound transport message into a [`Frame`].
///
/// Binary messages are always plain. For text, the head is everything
/// before the first newline; a head that does not start with the marker
/// is plain; a non-empty segment right after the marker names an event;
/// otherwise two consecutive markers introduce an operation whose config
/// is rejoined across any further markers. A head that fits none of
/// these shapes falls back to plain classification instead of failing,
/// so a malformed message can never crash the connection.
pub fn decode(data: &Bytes, binary: bool) -> Frame {
    if binary {
        return Frame::Plain {
            data: data.clone(),
            binary: true,
        };
    }

    // Split raw bytes at the first newline so the payload is passed on
    // untouched; only the head needs to be text.
    let (head_bytes, payload) = match data.iter().position(|&b| b == b'\n') {
        Some(i) => (&data[..i], data.slice(i + 1..)),
        None => (&data[..], Bytes::new()),
    };
    let head = String::from_utf8_lossy(head_bytes);

    if !head.starts_with(MARKER) {
        return Frame::Plain {
            data: data.clone(),
            binary: false,
        };
    }

    let mut segments = head.split(MARKER);
    segments.next(); // the empty segment before the leading marker

    let name = segments.next().unwrap_or("").trim();
    if !name.is_empty() {
        return Frame::Event {
            name: name.to_string(),
            payload,
        };
    }

    // Two consecutive markers: `$$name$config...`. Config parts are
    // rejoined with the marker since the config text may contain it.
    let rest: Vec<&str> = segments.collect();
    match rest.split_first() {
        Some((op, config)) => Frame::Operation {
            name: op.trim().to_string(),
            config: config.join("$").trim().to_string(),
            payload,
        },
        // A bare marker head with nothing after it: fail open.
        None => Frame::Plain {
            data: data.clone(),
            binary: false,
        },
    }
}
