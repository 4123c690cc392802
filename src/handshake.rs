//! The opening handshake, RFC 6455 Section 4.2.
//!
//! Negotiation runs in a fixed order and stops at the first failure:
//!
//! 1. [`validate_handshake`]: method, `Upgrade`, `Connection`, version and key headers.
//! 2. The [`OriginPolicy`].
//! 3. The optional pre-upgrade hook.
//! 4. Subprotocol selection, failing only when a protocol is required.
//!
//! Every failure up to here is answered with an HTTP status (see [`rejection`]) while
//! the HTTP layer still owns the stream. Only then is the stream hijacked and the
//! `101 Switching Protocols` head written by hand.
use std::{fmt, sync::Arc};

use base64::{prelude::BASE64_STANDARD, Engine};
use bytes::Bytes;
use http_body_util::Empty;
use hyper::{header, Method, Response, StatusCode};
use sha1::{Digest, Sha1};
use tokio::io::AsyncWriteExt;

use crate::{Exchange, Hijacked, OriginPolicy, RequestView, Result, WebSocketError};

/// Type alias for the bodiless HTTP responses used around an upgrade.
pub type HttpResponse = Response<Empty<Bytes>>;

/// The GUID appended to the client key before hashing.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version spoken.
pub const WEBSOCKET_VERSION: &str = "13";

/// Error type a pre-upgrade hook may return.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A hook run after the origin check and before the upgrade, typically for authentication.
pub type BeforeUpgrade = Arc<dyn Fn(&RequestView<'_>) -> std::result::Result<(), BoxError> + Send + Sync>;

/// Configuration for negotiating an upgrade.
///
/// ```rust
/// use hyperserve_ws::{HandshakeOptions, OriginPolicy};
///
/// let options = HandshakeOptions::default()
///     .with_origin_policy(OriginPolicy::allow_list(["https://app.example.com"]))
///     .with_subprotocols(["graphql-ws", "chat.v1"])
///     .with_before_upgrade(|req| match req.header("authorization") {
///         Some(_) => Ok(()),
///         None => Err("missing credentials".into()),
///     })
///     .require_protocol();
/// ```
#[derive(Clone, Default)]
pub struct HandshakeOptions {
    /// Origin check. Same-origin by default.
    pub origin_policy: OriginPolicy,
    /// Supported subprotocols. Order does not matter: the client's preference wins.
    pub subprotocols: Vec<String>,
    /// Hook whose error aborts the upgrade with `403 Forbidden`.
    pub before_upgrade: Option<BeforeUpgrade>,
    /// Fail the upgrade when no subprotocol could be agreed on.
    pub require_protocol: bool,
}

impl HandshakeOptions {
    pub fn with_origin_policy(self, origin_policy: OriginPolicy) -> Self {
        Self {
            origin_policy,
            ..self
        }
    }

    pub fn with_subprotocols<I, S>(self, subprotocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            subprotocols: subprotocols.into_iter().map(Into::into).collect(),
            ..self
        }
    }

    pub fn with_before_upgrade<F>(self, hook: F) -> Self
    where
        F: Fn(&RequestView<'_>) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        Self {
            before_upgrade: Some(Arc::new(hook)),
            ..self
        }
    }

    pub fn require_protocol(self) -> Self {
        Self {
            require_protocol: true,
            ..self
        }
    }
}

impl fmt::Debug for HandshakeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeOptions")
            .field("origin_policy", &self.origin_policy)
            .field("subprotocols", &self.subprotocols)
            .field("before_upgrade", &self.before_upgrade.is_some())
            .field("require_protocol", &self.require_protocol)
            .finish()
    }
}

/// Result of a successful negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    /// Value of the `Sec-WebSocket-Accept` header.
    pub accept_key: String,
    /// The negotiated subprotocol, if any.
    pub protocol: Option<String>,
}

/// Checks that `request` is a well-formed WebSocket upgrade.
///
/// # Errors
/// - [`WebSocketError::NotWebSocket`] unless the method is `GET`, `Upgrade` is
///   `websocket` and `Connection` contains `upgrade` (both case-insensitive).
/// - [`WebSocketError::UnsupportedVersion`] if `Sec-WebSocket-Version` is missing or not `13`.
/// - [`WebSocketError::MissingSecWebSocketKey`] if `Sec-WebSocket-Key` is missing or empty.
pub fn validate_handshake(request: &RequestView<'_>) -> Result<()> {
    if request.method() != Method::GET {
        return Err(WebSocketError::NotWebSocket);
    }

    let upgrade = request
        .header(header::UPGRADE)
        .is_some_and(|value| value.trim().eq_ignore_ascii_case("websocket"));
    let connection = request
        .header(header::CONNECTION)
        .is_some_and(|value| value.to_ascii_lowercase().contains("upgrade"));
    if !upgrade || !connection {
        return Err(WebSocketError::NotWebSocket);
    }

    if request.header(header::SEC_WEBSOCKET_VERSION).map(str::trim) != Some(WEBSOCKET_VERSION) {
        return Err(WebSocketError::UnsupportedVersion);
    }

    match request.header(header::SEC_WEBSOCKET_KEY) {
        Some(key) if !key.trim().is_empty() => Ok(()),
        _ => Err(WebSocketError::MissingSecWebSocketKey),
    }
}

/// Computes the `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(key: impl AsRef<[u8]>) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_ref());
    sha1.update(WEBSOCKET_GUID);
    BASE64_STANDARD.encode(sha1.finalize())
}

/// Splits a `Sec-WebSocket-Protocol` header into its offers, in client order.
pub fn parse_subprotocols(header: &str) -> impl Iterator<Item = &str> {
    header
        .split(',')
        .map(str::trim)
        .filter(|offer| !offer.is_empty())
}

/// Picks the first offer in `offered` that appears in `supported`.
pub fn negotiate_subprotocol<'a>(offered: &'a str, supported: &[String]) -> Option<&'a str> {
    parse_subprotocols(offered).find(|offer| supported.iter().any(|s| s == offer))
}

/// Runs every check that precedes the hijack.
pub fn negotiate(request: &RequestView<'_>, options: &HandshakeOptions) -> Result<Accepted> {
    validate_handshake(request)?;

    if !options.origin_policy.check(request) {
        return Err(WebSocketError::OriginRejected);
    }

    if let Some(hook) = &options.before_upgrade {
        hook(request).map_err(|err| WebSocketError::UpgradeRejected(err.to_string()))?;
    }

    let key = request
        .header(header::SEC_WEBSOCKET_KEY)
        .map(str::trim)
        .ok_or(WebSocketError::MissingSecWebSocketKey)?;

    let protocol = request
        .header(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|offered| negotiate_subprotocol(offered, &options.subprotocols))
        .map(str::to_owned);
    if protocol.is_none() && options.require_protocol {
        return Err(WebSocketError::NoSubprotocol);
    }

    Ok(Accepted {
        accept_key: accept_key(key),
        protocol,
    })
}

/// The literal `101 Switching Protocols` response head.
pub fn switching_protocols(accepted: &Accepted) -> String {
    let mut head = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n",
        accepted.accept_key
    );
    if let Some(protocol) = &accepted.protocol {
        head.push_str("Sec-WebSocket-Protocol: ");
        head.push_str(protocol);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    head
}

/// The HTTP response refusing an upgrade that failed with `err`.
///
/// Returns `None` for errors that do not map to a status.
pub fn rejection(err: &WebSocketError) -> Option<HttpResponse> {
    let status = err.status_code()?;
    let mut response = Response::new(Empty::new());
    *response.status_mut() = status;
    if matches!(err, WebSocketError::UnsupportedVersion) {
        response.headers_mut().insert(
            header::SEC_WEBSOCKET_VERSION,
            header::HeaderValue::from_static(WEBSOCKET_VERSION),
        );
    }
    if status == StatusCode::SERVICE_UNAVAILABLE {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, header::HeaderValue::from_static("1"));
    }
    Some(response)
}

/// Negotiates, then hijacks the stream and writes the `101` response.
///
/// A failed negotiation rejects the exchange with the matching status before returning
/// the error. A failure to deliver the rejection is logged and otherwise ignored.
pub async fn perform_handshake<E: Exchange>(
    exchange: E,
    options: &HandshakeOptions,
) -> Result<(Hijacked<E::Io>, Accepted)> {
    let negotiated = negotiate(&exchange.request(), options);
    let accepted = match negotiated {
        Ok(accepted) => accepted,
        Err(err) => {
            #[cfg(feature = "logging")]
            log::debug!("refusing websocket upgrade: {err}");

            if let Some(response) = rejection(&err) {
                if let Err(_reject_err) = exchange.reject(response).await {
                    #[cfg(feature = "logging")]
                    log::debug!("failed to deliver upgrade rejection: {_reject_err}");
                }
            }
            return Err(err);
        }
    };

    let mut hijacked = exchange.hijack().await?;
    hijacked
        .io
        .write_all(switching_protocols(&accepted).as_bytes())
        .await?;
    hijacked.io.flush().await?;

    #[cfg(feature = "logging")]
    log::debug!(
        "websocket upgrade complete (protocol={:?})",
        accepted.protocol
    );

    Ok((hijacked, accepted))
}
