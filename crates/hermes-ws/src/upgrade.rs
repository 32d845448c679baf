//! HTTP upgrade handshake helpers.
//!
//! Route handling is transport-agnostic: [`WsRoute::handle`] only needs an
//! [`UpgradeResponder`] that can finish (or refuse) the handshake. This
//! module provides the RFC 6455 pieces a responder is built from, plus
//! [`StreamResponder`] for stacks where the HTTP layer has already answered
//! with `101 Switching Protocols` and handed over the raw stream.
//!
//! [`WsRoute::handle`]: crate::WsRoute::handle

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use http::{header, Request, Response, StatusCode};
use http_body_util::Full;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tungstenite::protocol::{Role, WebSocketConfig};

use crate::config::WsConfig;
use crate::error::{WsError, WsResult};

/// GUID from RFC 6455 section 1.3, appended to the client key before hashing.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Compute the `Sec-WebSocket-Accept` value for a client key.
#[must_use]
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Check that `request` is a well-formed WebSocket upgrade request and
/// return the client's `Sec-WebSocket-Key`.
pub fn validate_upgrade_request<B>(request: &Request<B>) -> WsResult<String> {
    let headers = request.headers();

    let upgrade = headers
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| WsError::not_websocket("missing Upgrade header"))?;
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return Err(WsError::not_websocket(format!(
            "Upgrade header is {upgrade:?}, expected \"websocket\""
        )));
    }

    let connection = headers
        .get(header::CONNECTION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| WsError::not_websocket("missing Connection header"))?;
    if !connection
        .split(',')
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
    {
        return Err(WsError::not_websocket(
            "Connection header does not include \"Upgrade\"",
        ));
    }

    let version = headers
        .get(header::SEC_WEBSOCKET_VERSION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| WsError::not_websocket("missing Sec-WebSocket-Version header"))?;
    if version != "13" {
        return Err(WsError::not_websocket(format!(
            "unsupported Sec-WebSocket-Version {version:?}"
        )));
    }

    let key = headers
        .get(header::SEC_WEBSOCKET_KEY)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| WsError::not_websocket("missing Sec-WebSocket-Key header"))?;

    Ok(key.to_owned())
}

/// Build the `101 Switching Protocols` response for an accepted upgrade.
///
/// # Panics
///
/// Panics if `accept_key` contains bytes that are not valid in a header
/// value, which cannot happen for base64 output.
#[must_use]
pub fn switching_protocols_response(accept_key: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::UPGRADE, "websocket")
        .header(header::CONNECTION, "Upgrade")
        .header(header::SEC_WEBSOCKET_ACCEPT, accept_key)
        .body(Full::new(Bytes::new()))
        .unwrap_or_else(|_| unreachable!("static response parts are valid"))
}

/// Build the HTTP response for a rejected upgrade.
///
/// Falls back to `403 Forbidden` when the policy did not pick a status, and
/// to `400 Bad Request` when it picked an invalid one.
#[must_use]
pub fn reject_response(status: Option<u16>, reason: Option<&str>) -> Response<Full<Bytes>> {
    let status = status
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(StatusCode::FORBIDDEN);
    let body = reason.map_or_else(Bytes::new, |reason| Bytes::from(reason.to_owned()));
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(body))
        .unwrap_or_else(|_| unreachable!("static response parts are valid"))
}

/// Finishes or refuses one upgrade on behalf of the HTTP layer.
pub trait UpgradeResponder: Send + 'static {
    /// The byte stream the WebSocket runs over once upgraded.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Complete the handshake and return the upgraded stream.
    fn accept(
        self,
    ) -> impl std::future::Future<Output = WsResult<WebSocketStream<Self::Stream>>> + Send;

    /// Refuse the connection with an optional status and reason.
    fn reject(self, status: Option<u16>, reason: Option<&str>);
}

/// Responder over a raw stream whose HTTP handshake is already done.
///
/// This fits upgrade mechanisms that hand back the underlying I/O after
/// sending `101 Switching Protocols` themselves (hyper's `on_upgrade`, or a
/// test harness holding one end of a duplex pipe). Rejection is expected to
/// have been answered at the HTTP layer, so `reject` simply drops the stream.
#[derive(Debug)]
pub struct StreamResponder<S> {
    stream: S,
    config: WsConfig,
}

impl<S> StreamResponder<S> {
    /// Wrap an already-upgraded stream.
    pub fn new(stream: S, config: WsConfig) -> Self {
        Self { stream, config }
    }
}

impl<S> UpgradeResponder for StreamResponder<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Stream = S;

    async fn accept(self) -> WsResult<WebSocketStream<S>> {
        let ws_config = WebSocketConfig::default()
            .max_message_size(Some(self.config.max_message_size))
            .max_frame_size(Some(self.config.max_frame_size));
        Ok(WebSocketStream::from_raw_socket(self.stream, Role::Server, Some(ws_config)).await)
    }

    fn reject(self, _status: Option<u16>, _reason: Option<&str>) {}
}
