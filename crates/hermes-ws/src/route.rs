//! Route-level connection handling.
//!
//! A [`WsRoute`] owns everything that outlives a single connection: the
//! accept/reject policy, the optional init handshake, handler templates that
//! are stamped onto every socket (including retroactively onto sockets that
//! are already connected), route-wide lifecycle hooks and the registry of
//! live sockets.

use std::any::Any;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tracing::warn;
use tungstenite::Message;

use hermes_wire::{check_event_name, encode_event, WireValue};

use crate::config::WsConfig;
use crate::events::{HookId, HookKind, Hooks, SocketEvent};
use crate::log;
use crate::socket::{
    self, ConnectionId, EventDispatchFn, EventSocket, OperationFn, SocketSender,
};
use crate::upgrade::UpgradeResponder;
use crate::validate::{parse_with, Validator};

/// Outcome of an accept policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptDecision {
    /// Proceed with the upgrade.
    Accept,
    /// Turn the connection away before the upgrade completes.
    Reject {
        /// HTTP status to answer with. The responder picks a default when
        /// absent.
        status: Option<u16>,
        /// Reason to include in the response body and the reject hook.
        reason: Option<String>,
    },
}

impl AcceptDecision {
    /// Reject with the responder's default status and no reason.
    #[must_use]
    pub const fn reject() -> Self {
        Self::Reject {
            status: None,
            reason: None,
        }
    }

    /// Reject with an explicit status and reason.
    #[must_use]
    pub fn reject_with(status: u16, reason: impl Into<String>) -> Self {
        Self::Reject {
            status: Some(status),
            reason: Some(reason.into()),
        }
    }

    /// Whether this decision lets the connection through.
    #[must_use]
    pub const fn is_accept(&self) -> bool {
        matches!(self, Self::Accept)
    }
}

impl From<bool> for AcceptDecision {
    fn from(accept: bool) -> Self {
        if accept {
            Self::Accept
        } else {
            Self::reject()
        }
    }
}

/// Type-erased value produced by an init callback and attached to the socket.
pub type InitData = Box<dyn Any + Send + Sync>;

type AcceptFn =
    Arc<dyn Fn(Arc<http::Request<()>>) -> BoxFuture<'static, AcceptDecision> + Send + Sync>;

enum InitVerdict {
    Ready(InitData),
    Rejected,
    ParseFailed,
}

type InitFn = Arc<dyn Fn(Bytes, SocketSender) -> BoxFuture<'static, InitVerdict> + Send + Sync>;

enum Template {
    Event {
        name: String,
        dispatch: EventDispatchFn,
    },
    Operation {
        name: String,
        callback: OperationFn,
    },
}

enum InitOutcome {
    Ready(Option<InitData>),
    Inert,
    Gone,
}

/// A WebSocket endpoint: policy, handshake, handlers and live sockets.
pub struct WsRoute {
    path: Arc<str>,
    config: WsConfig,
    accept_policy: Mutex<Option<AcceptFn>>,
    init_policy: Mutex<Option<InitFn>>,
    templates: Mutex<Vec<Template>>,
    hooks: Hooks,
    sockets: DashMap<ConnectionId, Arc<EventSocket>>,
}

impl WsRoute {
    /// Create a route for `path` with default configuration.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Arc<Self> {
        Self::with_config(path, WsConfig::default())
    }

    /// Create a route for `path` with an explicit configuration.
    #[must_use]
    pub fn with_config(path: impl Into<String>, config: WsConfig) -> Arc<Self> {
        Arc::new(Self {
            path: Arc::from(path.into()),
            config,
            accept_policy: Mutex::new(None),
            init_policy: Mutex::new(None),
            templates: Mutex::new(Vec::new()),
            hooks: Hooks::new(),
            sockets: DashMap::new(),
        })
    }

    /// Path this route serves.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Configuration applied to connections on this route.
    #[must_use]
    pub const fn config(&self) -> &WsConfig {
        &self.config
    }

    /// Install the accept policy, replacing any previous one.
    ///
    /// The policy sees the upgrade request and decides before the handshake
    /// completes. Returning `bool` works too: `false` rejects with defaults.
    pub fn accept_reject<F, Fut, D>(&self, policy: F) -> &Self
    where
        F: Fn(Arc<http::Request<()>>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = D> + Send + 'static,
        D: Into<AcceptDecision>,
    {
        let wrapped: AcceptFn = Arc::new(move |request| {
            let fut = policy(request);
            Box::pin(async move { fut.await.into() })
        });
        *self.accept_policy.lock() = Some(wrapped);
        self
    }

    /// Require an init handshake, replacing any previous one.
    ///
    /// The first message on each accepted connection is treated as the init
    /// payload and run through `validator`; `callback` then decides whether
    /// the connection becomes live, and whatever it returns is attached to the
    /// socket as [`InitData`]. A connection whose init fails stays upgraded
    /// but never dispatches anything.
    pub fn require_init<T, V, F, Fut>(&self, validator: V, callback: F) -> &Self
    where
        T: Send + 'static,
        V: Validator<T> + 'static,
        F: Fn(T, SocketSender) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Option<InitData>> + Send + 'static,
    {
        let wrapped: InitFn = Arc::new(move |data, sender| -> BoxFuture<'static, InitVerdict> {
            match parse_with(&data, &validator) {
                Ok(value) => {
                    let fut = callback(value, sender);
                    Box::pin(async move {
                        fut.await.map_or(InitVerdict::Rejected, InitVerdict::Ready)
                    })
                }
                Err(_) => Box::pin(std::future::ready(InitVerdict::ParseFailed)),
            }
        });
        *self.init_policy.lock() = Some(wrapped);
        self
    }

    /// Register a typed event handler template.
    ///
    /// The template is stamped onto every connected socket immediately and
    /// onto every future socket at construction.
    ///
    /// # Panics
    ///
    /// Panics if `name` contains the `$` marker.
    pub fn event<T, V, F>(&self, name: &str, callback: F, validator: V) -> &Self
    where
        T: Send + 'static,
        V: Validator<T> + 'static,
        F: Fn(T, &Arc<EventSocket>) + Send + Sync + 'static,
    {
        let (name, dispatch) = socket::erase_event(name, callback, validator);
        self.install_template(Template::Event { name, dispatch });
        self
    }

    /// Register a raw event handler template. See [`event`](Self::event).
    ///
    /// # Panics
    ///
    /// Panics if `name` contains the `$` marker.
    pub fn event_raw<F>(&self, name: &str, callback: F) -> &Self
    where
        F: Fn(Bytes, &Arc<EventSocket>) + Send + Sync + 'static,
    {
        let (name, dispatch) = socket::erase_event_raw(name, callback);
        self.install_template(Template::Event { name, dispatch });
        self
    }

    /// Register an operation handler template. All handlers for a name run.
    ///
    /// # Panics
    ///
    /// Panics if `name` contains the `$` marker.
    pub fn operation<F>(&self, name: &str, callback: F) -> &Self
    where
        F: Fn(Bytes, &str, &Arc<EventSocket>) + Send + Sync + 'static,
    {
        let name = name.trim().to_owned();
        check_event_name(&name);
        self.install_template(Template::Operation {
            name,
            callback: Arc::new(callback),
        });
        self
    }

    /// Register a route-wide lifecycle hook.
    pub fn on(
        &self,
        kind: HookKind,
        callback: impl Fn(&SocketEvent) + Send + Sync + 'static,
    ) -> HookId {
        self.hooks.on(kind, callback)
    }

    /// Register a one-shot route-wide lifecycle hook.
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

    /// Number of live sockets on this route.
    #[must_use]
    pub fn socket_count(&self) -> usize {
        self.sockets.len()
    }

    /// Look up a live socket by id.
    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<Arc<EventSocket>> {
        self.sockets.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Snapshot of all live sockets.
    #[must_use]
    pub fn sockets(&self) -> Vec<Arc<EventSocket>> {
        self.sockets
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Send a plain payload to every live socket. Returns how many accepted.
    pub fn send_all(&self, payload: &WireValue) -> usize {
        self.sockets
            .iter()
            .filter(|entry| entry.value().send(payload.clone()).is_ok())
            .count()
    }

    /// Emit an event to every live socket. Returns how many accepted.
    ///
    /// # Panics
    ///
    /// Panics if `event` contains the `$` marker.
    pub fn emit_all(&self, event: &str, payload: &WireValue) -> usize {
        let encoded = encode_event(event, payload);
        self.sockets
            .iter()
            .filter(|entry| entry.value().send(encoded.clone()).is_ok())
            .count()
    }

    pub(crate) fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    pub(crate) fn unregister(&self, id: ConnectionId) {
        self.sockets.remove(&id);
    }

    /// Handle one upgrade request end to end.
    ///
    /// Runs the accept policy, completes the handshake through `responder`,
    /// performs the init handshake if the route requires one, constructs the
    /// socket and drives the connection until it ends. The future resolves
    /// when the connection is rejected or fully set up; the connection
    /// itself lives on background tasks.
    pub async fn handle<R>(self: Arc<Self>, request: http::Request<()>, responder: R)
    where
        R: UpgradeResponder,
    {
        let request = Arc::new(request);
        let policy = self.accept_policy.lock().clone();
        if let Some(policy) = policy {
            if let AcceptDecision::Reject { status, reason } = policy(Arc::clone(&request)).await {
                responder.reject(status, reason.as_deref());
                log::ws_rejected(&self.config, &self.path, status, reason.as_deref());
                self.hooks.emit(&SocketEvent::Reject {
                    path: self.path.to_string(),
                    status,
                    reason,
                });
                return;
            }
        }

        let stream = match responder.accept().await {
            Ok(stream) => stream,
            Err(error) => {
                warn!(target: "hermes::ws", url = %self.path, %error, "websocket upgrade failed");
                return;
            }
        };
        log::ws_connected(&self.config, &self.path);

        let id = ConnectionId::new();
        let (sink, mut stream) = stream.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(sink, rx));
        let sender = SocketSender::new(id, Arc::clone(&self.path), tx.clone(), self.config.clone());

        let init_policy = self.init_policy.lock().clone();
        let init_data = if let Some(init) = init_policy {
            match self.run_init(&init, &mut stream, sender.clone()).await {
                InitOutcome::Ready(data) => data,
                InitOutcome::Inert => {
                    // stays upgraded but never dispatches; keep the writer
                    // alive so the peer can still receive a close later
                    tokio::spawn(async move {
                        let _keep_writable = sender;
                        while stream.next().await.is_some() {}
                    });
                    return;
                }
                InitOutcome::Gone => return,
            }
        } else {
            None
        };

        let socket = EventSocket::new(
            id,
            Arc::clone(&self.path),
            tx,
            Arc::downgrade(&self),
            init_data,
            self.config.clone(),
        );
        socket.mark_open();
        socket.fan_out(&SocketEvent::Accept {
            socket: Arc::clone(&socket),
        });
        {
            // insert and replay under the template lock so a concurrent
            // registration cannot stamp this socket twice
            let templates = self.templates.lock();
            self.sockets.insert(id, Arc::clone(&socket));
            for template in templates.iter() {
                Self::apply(template, &socket);
            }
        }

        let reader = tokio::spawn(socket::read_loop(Arc::clone(&socket), stream));
        socket.register_task(reader.abort_handle());
        socket.register_task(writer.abort_handle());
    }

    async fn run_init<S>(
        &self,
        init: &InitFn,
        stream: &mut SplitStream<WebSocketStream<S>>,
        sender: SocketSender,
    ) -> InitOutcome
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let first = match self.config.init_timeout {
            Some(limit) => match tokio::time::timeout(limit, first_data_message(stream)).await {
                Ok(first) => first,
                Err(_) => {
                    log::ws_init_failed(&self.config, &self.path, "timed out waiting for init");
                    return InitOutcome::Gone;
                }
            },
            None => first_data_message(stream).await,
        };
        let Some(data) = first else {
            return InitOutcome::Gone;
        };
        match init(data.clone(), sender).await {
            InitVerdict::Ready(value) => {
                log::ws_init_done(&self.config, &self.path);
                InitOutcome::Ready(Some(value))
            }
            InitVerdict::Rejected => {
                log::ws_init_failed(&self.config, &self.path, "init callback refused");
                self.hooks.emit(&SocketEvent::InitFailed {
                    path: self.path.to_string(),
                });
                InitOutcome::Inert
            }
            InitVerdict::ParseFailed => {
                log::ws_init_failed(&self.config, &self.path, "init payload failed validation");
                self.hooks.emit(&SocketEvent::InitParsingFailed {
                    path: self.path.to_string(),
                    data,
                });
                InitOutcome::Inert
            }
        }
    }

    fn apply(template: &Template, socket: &Arc<EventSocket>) {
        match template {
            Template::Event { name, dispatch } => {
                socket.install_event(name.clone(), Arc::clone(dispatch));
            }
            Template::Operation { name, callback } => {
                socket.install_operation(name.clone(), Arc::clone(callback));
            }
        }
    }

    fn install_template(&self, template: Template) {
        let mut templates = self.templates.lock();
        for entry in self.sockets.iter() {
            Self::apply(&template, entry.value());
        }
        templates.push(template);
    }
}

impl std::fmt::Debug for WsRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsRoute")
            .field("path", &self.path)
            .field("sockets", &self.sockets.len())
            .finish_non_exhaustive()
    }
}

async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        if sink.send(message).await.is_err() {
            break;
        }
    }
}

/// Read until the first text or binary frame; control frames are skipped.
async fn first_data_message<S>(stream: &mut SplitStream<WebSocketStream<S>>) -> Option<Bytes>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(next) = stream.next().await {
        match next {
            Ok(Message::Text(text)) => return Some(Bytes::from(text.to_string())),
            Ok(Message::Binary(data)) => return Some(data),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
    None
}
