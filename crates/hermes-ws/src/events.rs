//! Lifecycle hooks for sockets and routes.
//!
//! Every socket carries its own [`Hooks`] registry and every route carries a
//! second one; lifecycle moments are delivered to the socket's listeners
//! first, then to the route's. Callbacks run synchronously on the connection
//! task, outside the registry lock, so a hook may register or remove other
//! hooks without deadlocking.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::socket::EventSocket;

/// The lifecycle moments a hook can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    /// A connection passed the accept policy and its socket was constructed.
    Accept,
    /// A connection was turned away by the accept policy.
    Reject,
    /// Any inbound data message, after event dispatch.
    Message,
    /// Any inbound data message, before event dispatch.
    MessageBeforeEvents,
    /// An inbound message that was not dispatched as an event or operation.
    NotEventMessage,
    /// An event frame whose name has no registered handler.
    UnknownEvent,
    /// An event payload that failed its handler's validator.
    ParsingFailed,
    /// An init payload that failed the init validator.
    InitParsingFailed,
    /// An init callback that refused the connection.
    InitFailed,
    /// The connection closed.
    Close,
    /// The connection failed with a transport error.
    Error,
    /// A ping frame arrived.
    Ping,
    /// A pong frame arrived.
    Pong,
    /// The connection was torn down locally via terminate.
    Terminate,
}

/// A lifecycle moment together with its context.
#[derive(Clone)]
pub enum SocketEvent {
    /// See [`HookKind::Accept`].
    Accept {
        /// The freshly constructed socket.
        socket: Arc<EventSocket>,
    },
    /// See [`HookKind::Reject`]. No socket exists for rejected connections.
    Reject {
        /// Route path the connection targeted.
        path: String,
        /// Status code chosen by the policy, if any.
        status: Option<u16>,
        /// Reason chosen by the policy, if any.
        reason: Option<String>,
    },
    /// See [`HookKind::Message`].
    Message {
        /// The receiving socket.
        socket: Arc<EventSocket>,
        /// Raw message bytes.
        data: Bytes,
        /// Whether the frame was binary.
        binary: bool,
    },
    /// See [`HookKind::MessageBeforeEvents`].
    MessageBeforeEvents {
        /// The receiving socket.
        socket: Arc<EventSocket>,
        /// Raw message bytes.
        data: Bytes,
        /// Whether the frame was binary.
        binary: bool,
    },
    /// See [`HookKind::NotEventMessage`].
    NotEventMessage {
        /// The receiving socket.
        socket: Arc<EventSocket>,
        /// Raw message bytes.
        data: Bytes,
        /// Whether the frame was binary.
        binary: bool,
    },
    /// See [`HookKind::UnknownEvent`].
    UnknownEvent {
        /// The receiving socket.
        socket: Arc<EventSocket>,
        /// Event name with no handler.
        name: String,
        /// The undecoded payload.
        payload: Bytes,
    },
    /// See [`HookKind::ParsingFailed`].
    ParsingFailed {
        /// The receiving socket.
        socket: Arc<EventSocket>,
        /// Name of the event whose payload was rejected.
        event: String,
        /// The rejected payload.
        payload: Bytes,
    },
    /// See [`HookKind::InitParsingFailed`]. No socket exists yet.
    InitParsingFailed {
        /// Route path the connection targeted.
        path: String,
        /// The rejected init payload.
        data: Bytes,
    },
    /// See [`HookKind::InitFailed`]. No socket exists yet.
    InitFailed {
        /// Route path the connection targeted.
        path: String,
    },
    /// See [`HookKind::Close`].
    Close {
        /// The closed socket.
        socket: Arc<EventSocket>,
        /// Close code from the close frame, or 1005/1006 when absent.
        code: u16,
        /// Close reason bytes.
        reason: Bytes,
    },
    /// See [`HookKind::Error`].
    Error {
        /// The failed socket.
        socket: Arc<EventSocket>,
        /// Description of the transport error.
        message: String,
    },
    /// See [`HookKind::Ping`].
    Ping {
        /// The receiving socket.
        socket: Arc<EventSocket>,
        /// Ping payload.
        data: Bytes,
    },
    /// See [`HookKind::Pong`].
    Pong {
        /// The receiving socket.
        socket: Arc<EventSocket>,
        /// Pong payload.
        data: Bytes,
    },
    /// See [`HookKind::Terminate`].
    Terminate {
        /// The terminated socket.
        socket: Arc<EventSocket>,
    },
}

impl SocketEvent {
    /// The hook kind this event is delivered to.
    #[must_use]
    pub fn kind(&self) -> HookKind {
        match self {
            Self::Accept { .. } => HookKind::Accept,
            Self::Reject { .. } => HookKind::Reject,
            Self::Message { .. } => HookKind::Message,
            Self::MessageBeforeEvents { .. } => HookKind::MessageBeforeEvents,
            Self::NotEventMessage { .. } => HookKind::NotEventMessage,
            Self::UnknownEvent { .. } => HookKind::UnknownEvent,
            Self::ParsingFailed { .. } => HookKind::ParsingFailed,
            Self::InitParsingFailed { .. } => HookKind::InitParsingFailed,
            Self::InitFailed { .. } => HookKind::InitFailed,
            Self::Close { .. } => HookKind::Close,
            Self::Error { .. } => HookKind::Error,
            Self::Ping { .. } => HookKind::Ping,
            Self::Pong { .. } => HookKind::Pong,
            Self::Terminate { .. } => HookKind::Terminate,
        }
    }
}

type HookFn = Arc<dyn Fn(&SocketEvent) + Send + Sync>;

/// Handle returned by [`Hooks::on`] and [`Hooks::once`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

#[derive(Clone)]
struct Entry {
    id: HookId,
    callback: HookFn,
    once: bool,
}

#[derive(Default)]
struct Table {
    next_id: u64,
    entries: HashMap<HookKind, Vec<Entry>>,
}

/// A registry of lifecycle hooks keyed by [`HookKind`].
#[derive(Default)]
pub struct Hooks {
    inner: Mutex<Table>,
}

impl Hooks {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for every occurrence of `kind`.
    pub fn on(
        &self,
        kind: HookKind,
        callback: impl Fn(&SocketEvent) + Send + Sync + 'static,
    ) -> HookId {
        self.subscribe(kind, Arc::new(callback), false)
    }

    /// Register `callback` for the next occurrence of `kind` only.
    pub fn once(
        &self,
        kind: HookKind,
        callback: impl Fn(&SocketEvent) + Send + Sync + 'static,
    ) -> HookId {
        self.subscribe(kind, Arc::new(callback), true)
    }

    /// Remove a previously registered hook. Returns whether it was present.
    pub fn off(&self, id: HookId) -> bool {
        let mut table = self.inner.lock();
        for entries in table.entries.values_mut() {
            if let Some(pos) = entries.iter().position(|entry| entry.id == id) {
                entries.remove(pos);
                return true;
            }
        }
        false
    }

    /// Deliver `event` to every listener of its kind, in registration order.
    ///
    /// One-shot listeners are unregistered before their callback runs, so a
    /// `once` hook fires at most one time even if a callback re-emits.
    pub fn emit(&self, event: &SocketEvent) {
        let to_run: Vec<HookFn> = {
            let mut table = self.inner.lock();
            match table.entries.get_mut(&event.kind()) {
                Some(entries) => {
                    let callbacks = entries
                        .iter()
                        .map(|entry| Arc::clone(&entry.callback))
                        .collect();
                    entries.retain(|entry| !entry.once);
                    callbacks
                }
                None => Vec::new(),
            }
        };
        for callback in to_run {
            callback(event);
        }
    }

    /// Number of listeners currently registered for `kind`.
    #[must_use]
    pub fn listener_count(&self, kind: HookKind) -> usize {
        self.inner
            .lock()
            .entries
            .get(&kind)
            .map_or(0, Vec::len)
    }

    fn subscribe(&self, kind: HookKind, callback: HookFn, once: bool) -> HookId {
        let mut table = self.inner.lock();
        table.next_id += 1;
        let id = HookId(table.next_id);
        table
            .entries
            .entry(kind)
            .or_default()
            .push(Entry { id, callback, once });
        id
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn init_failed() -> SocketEvent {
        SocketEvent::InitFailed {
            path: "/test".into(),
        }
    }

    #[test]
    fn on_fires_every_time() {
        let hooks = Hooks::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        hooks.on(HookKind::InitFailed, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        hooks.emit(&init_failed());
        hooks.emit(&init_failed());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn once_fires_exactly_once() {
        let hooks = Hooks::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        hooks.once(HookKind::InitFailed, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        hooks.emit(&init_failed());
        hooks.emit(&init_failed());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.listener_count(HookKind::InitFailed), 0);
    }

    #[test]
    fn off_removes_listener() {
        let hooks = Hooks::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let id = hooks.on(HookKind::InitFailed, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(hooks.off(id));
        assert!(!hooks.off(id));
        hooks.emit(&init_failed());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn listeners_run_in_registration_order() {
        let hooks = Hooks::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            hooks.on(HookKind::InitFailed, move |_| order.lock().push(tag));
        }
        hooks.emit(&init_failed());
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn emit_without_listeners_is_noop() {
        let hooks = Hooks::new();
        hooks.emit(&init_failed());
        assert_eq!(hooks.listener_count(HookKind::InitFailed), 0);
    }
}
