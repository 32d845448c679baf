//! Per-connection socket: dispatch tables, lifecycle state and sending.
//!
//! An [`EventSocket`] sits on top of one upgraded WebSocket connection. The
//! transport is owned by two background tasks (a reader and a writer) and the
//! socket itself is a plain shared handle, so all of its methods are
//! synchronous and it can be captured freely inside event callbacks.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_tungstenite::WebSocketStream;
use tungstenite::Message;
use uuid::Uuid;

use hermes_wire::{check_event_name, decode, encode_event, encode_operation, Frame, RawMessage, WireValue};

use crate::config::WsConfig;
use crate::error::{CloseCode, WsError, WsResult};
use crate::events::{HookId, HookKind, Hooks, SocketEvent};
use crate::log;
use crate::route::WsRoute;
use crate::validate::{parse_with, Validator};

/// Unique identifier for a connection, ordered by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generate a new identifier (UUIDv7, so roughly sortable by time).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// The upgrade is still in flight. Sockets handed to user code have
    /// already left this state.
    Connecting,
    /// The connection is live and carrying messages.
    Open,
    /// The connection closed, cleanly or not.
    Closed,
    /// The connection failed with a transport error.
    Errored,
    /// The connection was torn down locally via [`EventSocket::terminate`].
    Terminated,
}

impl SocketState {
    /// Whether the connection can no longer carry messages.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Errored | Self::Terminated)
    }
}

pub(crate) type EventDispatchFn = Arc<dyn Fn(Bytes, &Arc<EventSocket>) + Send + Sync>;
pub(crate) type OperationFn = Arc<dyn Fn(Bytes, &str, &Arc<EventSocket>) + Send + Sync>;

#[derive(Default)]
struct DispatchTable {
    events: HashMap<String, EventDispatchFn>,
    operations: HashMap<String, Vec<OperationFn>>,
    /// Set once the first event handler is registered. Before that, inbound
    /// messages are never decoded and flow through as plain data.
    use_events: bool,
}

/// Wrap a typed event callback and its validator into an erased dispatch
/// function. Payloads that fail validation surface as `ParsingFailed` hooks
/// instead of reaching the callback.
pub(crate) fn erase_event<T, V, F>(name: &str, callback: F, validator: V) -> (String, EventDispatchFn)
where
    T: Send + 'static,
    V: Validator<T> + 'static,
    F: Fn(T, &Arc<EventSocket>) + Send + Sync + 'static,
{
    let name = name.trim().to_owned();
    check_event_name(&name);
    let event_name = name.clone();
    let dispatch: EventDispatchFn = Arc::new(move |payload, socket| {
        match parse_with(&payload, &validator) {
            Ok(value) => callback(value, socket),
            Err(_) => socket.fan_out(&SocketEvent::ParsingFailed {
                socket: Arc::clone(socket),
                event: event_name.clone(),
                payload,
            }),
        }
    });
    (name, dispatch)
}

/// Wrap a raw event callback; the payload is delivered undecoded.
pub(crate) fn erase_event_raw<F>(name: &str, callback: F) -> (String, EventDispatchFn)
where
    F: Fn(Bytes, &Arc<EventSocket>) + Send + Sync + 'static,
{
    let name = name.trim().to_owned();
    check_event_name(&name);
    let dispatch: EventDispatchFn = Arc::new(move |payload, socket| callback(payload, socket));
    (name, dispatch)
}

/// Cheap cloneable handle for sending on a connection.
///
/// Useful where the full socket is not available yet, such as inside an init
/// callback, or where a callback only ever needs to write.
#[derive(Clone)]
pub struct SocketSender {
    id: ConnectionId,
    path: Arc<str>,
    tx: mpsc::UnboundedSender<Message>,
    config: WsConfig,
}

impl SocketSender {
    pub(crate) fn new(
        id: ConnectionId,
        path: Arc<str>,
        tx: mpsc::UnboundedSender<Message>,
        config: WsConfig,
    ) -> Self {
        Self {
            id,
            path,
            tx,
            config,
        }
    }

    /// Identifier of the connection this handle writes to.
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Send a payload following the stringification rules of the wire layer:
    /// text and bytes pass through untouched, everything else is serialized.
    pub fn send(&self, payload: impl Into<WireValue>) -> WsResult<()> {
        let message = match payload.into().into_message() {
            RawMessage::Text(text) => {
                log::ws_output(&self.config, &self.path, text.as_bytes());
                Message::Text(text.into())
            }
            RawMessage::Binary(data) => {
                log::ws_output(&self.config, &self.path, &data);
                Message::Binary(data)
            }
        };
        self.send_raw(message)
    }

    /// Send a text frame.
    pub fn send_text(&self, text: impl Into<String>) -> WsResult<()> {
        self.send(WireValue::Text(text.into()))
    }

    /// Send a binary frame.
    pub fn send_binary(&self, data: impl Into<Bytes>) -> WsResult<()> {
        self.send(WireValue::Bytes(data.into()))
    }

    /// Send a named event with a payload.
    ///
    /// # Panics
    ///
    /// Panics if `event` contains the `$` marker.
    pub fn emit(&self, event: &str, payload: impl Into<WireValue>) -> WsResult<()> {
        self.send(encode_event(event, &payload.into()))
    }

    /// Serialize `payload` as JSON and send it as a named event.
    ///
    /// # Panics
    ///
    /// Panics if `event` contains the `$` marker.
    pub fn emit_json<T: Serialize>(&self, event: &str, payload: &T) -> WsResult<()> {
        self.emit(event, WireValue::json(payload)?)
    }

    /// Send a named operation with a config string and a payload.
    ///
    /// # Panics
    ///
    /// Panics if `operation` contains the `$` marker.
    pub fn emit_operation(
        &self,
        operation: &str,
        config: impl Into<WireValue>,
        payload: impl Into<WireValue>,
    ) -> WsResult<()> {
        self.send(encode_operation(operation, &config.into(), &payload.into()))
    }

    pub(crate) fn send_raw(&self, message: Message) -> WsResult<()> {
        self.tx
            .send(message)
            .map_err(|_| WsError::connection_closed(None, "connection is no longer writable"))
    }
}

/// One live WebSocket connection with event dispatch attached.
pub struct EventSocket {
    id: ConnectionId,
    path: Arc<str>,
    sender: SocketSender,
    /// Handle to this socket's own `Arc`, for passing `Arc<Self>` into
    /// dispatch callbacks and hook payloads.
    weak_self: Weak<EventSocket>,
    route: Weak<WsRoute>,
    init_data: Option<Box<dyn Any + Send + Sync>>,
    dispatch: Mutex<DispatchTable>,
    hooks: Hooks,
    state: Mutex<SocketState>,
    finished: AtomicBool,
    tasks: Mutex<Vec<AbortHandle>>,
    config: WsConfig,
}

impl EventSocket {
    pub(crate) fn new(
        id: ConnectionId,
        path: Arc<str>,
        tx: mpsc::UnboundedSender<Message>,
        route: Weak<WsRoute>,
        init_data: Option<Box<dyn Any + Send + Sync>>,
        config: WsConfig,
    ) -> Arc<Self> {
        let sender = SocketSender::new(id, Arc::clone(&path), tx, config.clone());
        Arc::new_cyclic(|weak_self| Self {
            id,
            path,
            sender,
            weak_self: Weak::clone(weak_self),
            route,
            init_data,
            dispatch: Mutex::default(),
            hooks: Hooks::new(),
            state: Mutex::new(SocketState::Connecting),
            finished: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            config,
        })
    }

    /// Identifier of this connection.
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Path of the route this connection arrived on.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SocketState {
        *self.state.lock()
    }

    /// A cloneable write-only handle for this connection.
    #[must_use]
    pub fn sender(&self) -> SocketSender {
        self.sender.clone()
    }

    /// The value produced by the route's init callback, downcast to `T`.
    ///
    /// `None` when the route has no init handshake or when `T` does not match
    /// the type the init callback stored.
    #[must_use]
    pub fn init_data<T: 'static>(&self) -> Option<&T> {
        self.init_data.as_ref()?.downcast_ref()
    }

    /// Register a typed event handler on this connection only.
    ///
    /// The payload runs through `validator` first; values it rejects surface
    /// as [`HookKind::ParsingFailed`] hooks. Registering a second handler for
    /// the same name replaces the first.
    ///
    /// # Panics
    ///
    /// Panics if `name` contains the `$` marker.
    pub fn event<T, V, F>(&self, name: &str, callback: F, validator: V)
    where
        T: Send + 'static,
        V: Validator<T> + 'static,
        F: Fn(T, &Arc<EventSocket>) + Send + Sync + 'static,
    {
        let (name, dispatch) = erase_event(name, callback, validator);
        self.install_event(name, dispatch);
    }

    /// Register an event handler that receives the raw payload bytes.
    ///
    /// # Panics
    ///
    /// Panics if `name` contains the `$` marker.
    pub fn event_raw<F>(&self, name: &str, callback: F)
    where
        F: Fn(Bytes, &Arc<EventSocket>) + Send + Sync + 'static,
    {
        let (name, dispatch) = erase_event_raw(name, callback);
        self.install_event(name, dispatch);
    }

    /// Register an operation handler on this connection only.
    ///
    /// Unlike events, every handler registered for an operation name runs,
    /// in registration order.
    ///
    /// # Panics
    ///
    /// Panics if `name` contains the `$` marker.
    pub fn operation<F>(&self, name: &str, callback: F)
    where
        F: Fn(Bytes, &str, &Arc<EventSocket>) + Send + Sync + 'static,
    {
        let name = name.trim().to_owned();
        check_event_name(&name);
        self.install_operation(name, Arc::new(callback));
    }

    /// Register a lifecycle hook on this connection.
    pub fn on(
        &self,
        kind: HookKind,
        callback: impl Fn(&SocketEvent) + Send + Sync + 'static,
    ) -> HookId {
        self.hooks.on(kind, callback)
    }

    /// Register a one-shot lifecycle hook on this connection.
    pub fn once(
        &self,
        kind: HookKind,
        callback: impl Fn(&SocketEvent) + Send + Sync + 'static,
    ) -> HookId {
        self.hooks.once(kind, callback)
    }

    /// Remove a hook registered with [`on`](Self::on) or [`once`](Self::once).
    pub fn off(&self, id: HookId) -> bool {
        self.hooks.off(id)
    }

    /// Send a plain payload. See [`SocketSender::send`].
    pub fn send(&self, payload: impl Into<WireValue>) -> WsResult<()> {
        if self.state().is_terminal() {
            return Err(WsError::connection_closed(None, "connection already closed"));
        }
        self.sender.send(payload)
    }

    /// Send a named event. See [`SocketSender::emit`].
    pub fn emit(&self, event: &str, payload: impl Into<WireValue>) -> WsResult<()> {
        if self.state().is_terminal() {
            return Err(WsError::connection_closed(None, "connection already closed"));
        }
        self.sender.emit(event, payload)
    }

    /// Serialize `payload` as JSON and send it as a named event. See
    /// [`SocketSender::emit_json`].
    pub fn emit_json<T: Serialize>(&self, event: &str, payload: &T) -> WsResult<()> {
        self.emit(event, WireValue::json(payload)?)
    }

    /// Send a named operation. See [`SocketSender::emit_operation`].
    pub fn emit_operation(
        &self,
        operation: &str,
        config: impl Into<WireValue>,
        payload: impl Into<WireValue>,
    ) -> WsResult<()> {
        if self.state().is_terminal() {
            return Err(WsError::connection_closed(None, "connection already closed"));
        }
        self.sender.emit_operation(operation, config, payload)
    }

    /// Initiate a graceful close with the given code and reason.
    ///
    /// The state transitions to [`SocketState::Closed`] once the transport
    /// confirms, at which point the `Close` hook fires.
    pub fn close(&self, code: CloseCode, reason: impl Into<String>) -> WsResult<()> {
        if self.state().is_terminal() {
            return Ok(());
        }
        let frame = tungstenite::protocol::CloseFrame {
            code: code.as_u16().into(),
            reason: reason.into().into(),
        };
        self.sender.send_raw(Message::Close(Some(frame)))
    }

    /// Tear the connection down immediately.
    ///
    /// Aborts the reader and writer tasks without a closing handshake,
    /// unregisters the socket from its route and fires the `Terminate` hook.
    pub fn terminate(&self) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.state.lock() = SocketState::Terminated;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(route) = self.route.upgrade() {
            route.unregister(self.id);
        }
        if let Some(this) = self.weak_self.upgrade() {
            self.fan_out(&SocketEvent::Terminate { socket: this });
        }
        log::ws_terminate(&self.config, &self.path);
    }

    /// Transition out of [`SocketState::Connecting`] once setup is done.
    pub(crate) fn mark_open(&self) {
        let mut state = self.state.lock();
        if matches!(*state, SocketState::Connecting) {
            *state = SocketState::Open;
        }
    }

    pub(crate) fn install_event(&self, name: String, dispatch: EventDispatchFn) {
        let mut table = self.dispatch.lock();
        table.use_events = true;
        // Last registration for a name wins.
        table.events.insert(name, dispatch);
    }

    pub(crate) fn install_operation(&self, name: String, callback: OperationFn) {
        self.dispatch.lock().operations.entry(name).or_default().push(callback);
    }

    pub(crate) fn register_task(&self, handle: AbortHandle) {
        self.tasks.lock().push(handle);
    }

    /// Deliver an event to this socket's hooks, then to the route's.
    pub(crate) fn fan_out(&self, event: &SocketEvent) {
        self.hooks.emit(event);
        if let Some(route) = self.route.upgrade() {
            route.hooks().emit(event);
        }
    }

    /// Dispatch one inbound data message.
    ///
    /// In event mode the message is decoded and routed to its handler; in
    /// plain mode it only surfaces through the message hooks. The `Message`
    /// hook fires last in both modes.
    pub(crate) fn handle_message(&self, data: Bytes, binary: bool) {
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        log::ws_input(&self.config, &self.path, &data);
        let use_events = self.dispatch.lock().use_events;
        if use_events {
            self.fan_out(&SocketEvent::MessageBeforeEvents {
                socket: Arc::clone(&this),
                data: data.clone(),
                binary,
            });
            match decode(&data, binary) {
                Frame::Event { name, payload } => {
                    let handler = self.dispatch.lock().events.get(&name).cloned();
                    match handler {
                        Some(dispatch) => dispatch(payload, &this),
                        None => self.fan_out(&SocketEvent::UnknownEvent {
                            socket: Arc::clone(&this),
                            name,
                            payload,
                        }),
                    }
                }
                Frame::Operation {
                    name,
                    config,
                    payload,
                } => {
                    let handlers = self
                        .dispatch
                        .lock()
                        .operations
                        .get(&name)
                        .cloned()
                        .unwrap_or_default();
                    for handler in &handlers {
                        handler(payload.clone(), &config, &this);
                    }
                }
                Frame::Plain { .. } => self.fan_out(&SocketEvent::NotEventMessage {
                    socket: Arc::clone(&this),
                    data: data.clone(),
                    binary,
                }),
            }
        } else {
            self.fan_out(&SocketEvent::NotEventMessage {
                socket: Arc::clone(&this),
                data: data.clone(),
                binary,
            });
        }
        self.fan_out(&SocketEvent::Message {
            socket: this,
            data,
            binary,
        });
    }

    fn finish_close(&self, code: u16, reason: Bytes) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut state = self.state.lock();
            if !state.is_terminal() {
                *state = SocketState::Closed;
            }
        }
        if let Some(route) = self.route.upgrade() {
            route.unregister(self.id);
        }
        if let Some(this) = self.weak_self.upgrade() {
            self.fan_out(&SocketEvent::Close {
                socket: this,
                code,
                reason,
            });
        }
        log::ws_close(&self.config, &self.path, code);
    }

    fn finish_error(&self, error: &tungstenite::Error) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut state = self.state.lock();
            if !state.is_terminal() {
                *state = SocketState::Errored;
            }
        }
        if let Some(route) = self.route.upgrade() {
            route.unregister(self.id);
        }
        let message = error.to_string();
        log::ws_error(&self.config, &self.path, &message);
        if let Some(this) = self.weak_self.upgrade() {
            self.fan_out(&SocketEvent::Error {
                socket: this,
                message,
            });
        }
    }
}

impl fmt::Debug for EventSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSocket")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Drive the inbound half of a connection until it ends.
pub(crate) async fn read_loop<S>(socket: Arc<EventSocket>, mut stream: SplitStream<WebSocketStream<S>>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(next) = stream.next().await {
        match next {
            Ok(Message::Text(text)) => {
                socket.handle_message(Bytes::from(text.to_string()), false);
            }
            Ok(Message::Binary(data)) => socket.handle_message(data, true),
            Ok(Message::Ping(data)) => {
                let _ = socket.sender.send_raw(Message::Pong(data.clone()));
                socket.fan_out(&SocketEvent::Ping {
                    socket: Arc::clone(&socket),
                    data,
                });
            }
            Ok(Message::Pong(data)) => socket.fan_out(&SocketEvent::Pong {
                socket: Arc::clone(&socket),
                data,
            }),
            Ok(Message::Close(frame)) => {
                let (code, reason) = frame.map_or_else(
                    || (CloseCode::NoStatus.as_u16(), Bytes::new()),
                    |frame| {
                        (
                            frame.code.into(),
                            Bytes::copy_from_slice(frame.reason.as_bytes()),
                        )
                    },
                );
                socket.finish_close(code, reason);
                break;
            }
            Ok(_) => {}
            Err(error) => {
                socket.finish_error(&error);
                break;
            }
        }
    }
    // stream ended without a close frame
    socket.finish_close(CloseCode::Abnormal.as_u16(), Bytes::new());
}
