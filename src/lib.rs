//! # hyperserve-ws
//! Server-side implementation of the WebSocket protocol (RFC 6455) meant to be embedded in an
//! HTTP server: a frame codec, an opening-handshake negotiator, a full-duplex [`Connection`]
//! over a hijacked byte stream, and an endpoint-keyed connection [`Pool`](pool::Pool) with
//! health checks and idle eviction.
//!
//! The HTTP router, TLS termination and whatever protocol rides inside the messages stay
//! outside of this crate. The upgrade boundary is the [`Exchange`] trait: anything that can
//! show the request head and hand over the raw stream can be upgraded.
//! [`RawExchange`] does this for a plain `AsyncRead + AsyncWrite` stream, and
//! [`Upgrader::upgrade_request`] plugs into hyper services.
//!
//! Extensions (permessage-deflate) are not negotiated and fragmented data messages are
//! rejected: every message is a single final frame.
//!
//! # Features
//! - `logging`: debug logging of negotiation and pool activity through the `log` crate.
//!   Enabled by default.
//! - `simd`: SIMD accelerated UTF-8 validation of text frames with `simdutf8`.
//! - `json`: `serde_json` helpers on [`Connection`] and serde support for the pool config.
//!
//! # Server Example
//! ```rust,no_run
//! use hyperserve_ws::{OpCode, RawExchange, Upgrader};
//! use tokio::net::TcpListener;
//!
//! async fn serve(listener: TcpListener) -> hyperserve_ws::Result<()> {
//!     let upgrader = Upgrader::default();
//!     loop {
//!         let (stream, _) = listener.accept().await?;
//!         let exchange = RawExchange::read(stream).await?;
//!         let conn = upgrader.upgrade(exchange).await?;
//!
//!         tokio::spawn(async move {
//!             while let Ok((opcode, payload)) = conn.read_message().await {
//!                 if opcode.is_data() && conn.write_message(opcode, payload).await.is_err() {
//!                     break;
//!                 }
//!             }
//!         });
//!     }
//! }
//! ```
//!
//! # Memory Safety
//! - Maximum payload size limit, 1 MiB by default ([`MAX_PAYLOAD_READ`])
//! - Control frame constraints checked before their payload is buffered
//! - 64-bit frame lengths are checked against the address space
//! - Optional UTF-8 validation for text frames

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod close;
pub mod codec;
mod connection;
mod exchange;
pub mod frame;
pub mod handshake;
mod mask;
pub mod origin;
pub mod pool;
mod upgrade;

use hyper::StatusCode;
use thiserror::Error;

pub use close::CloseCode;
pub use connection::{Connection, Options, Role, DEFAULT_CONTROL_TIMEOUT, MAX_PAYLOAD_READ};
pub use exchange::{Exchange, Hijacked, RawExchange, RequestView};
pub use frame::{Frame, OpCode};
pub use handshake::{HandshakeOptions, HttpResponse};
pub use origin::OriginPolicy;
pub use pool::{Pool, PoolConfig};
pub use upgrade::{UpgradeFut, UpgradeResult, Upgrader};

/// A result type for WebSocket operations, using `WebSocketError` as the error type.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Broad category of a [`WebSocketError`].
///
/// The category tells the caller what the failure means for the resource involved:
/// handshake failures are answered with an HTTP status before any upgrade, protocol and
/// I/O failures end the connection, pool failures leave everything usable.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The upgrade request was refused. Nothing was hijacked.
    Handshake,
    /// The peer broke RFC 6455. The connection is closed.
    Protocol,
    /// The transport failed or a deadline passed. The connection is closed.
    Io,
    /// The pool refused to hand out a connection.
    Pool,
    /// A message could not be (de)serialized.
    Payload,
}

/// Represents errors that can occur during WebSocket operations.
///
/// Each variant belongs to exactly one [`ErrorKind`]; see [`WebSocketError::kind`].
#[derive(Error, Debug)]
pub enum WebSocketError {
    // ----------------------------------------------------------------------------------
    // handshake
    // ----------------------------------------------------------------------------------
    /// The request is not a WebSocket upgrade: wrong method, or the `Upgrade` /
    /// `Connection` headers are missing or carry the wrong values.
    #[error("Not a websocket upgrade request")]
    NotWebSocket,

    /// The `Sec-WebSocket-Key` header is missing or empty.
    #[error("Sec-WebSocket-Key header is missing")]
    MissingSecWebSocketKey,

    /// The `Sec-WebSocket-Version` header is missing or not `13`.
    #[error("Sec-WebSocket-Version must be 13")]
    UnsupportedVersion,

    /// The origin policy refused the request's `Origin`.
    #[error("Origin not allowed")]
    OriginRejected,

    /// The pre-upgrade hook refused the request.
    #[error("Upgrade rejected: {0}")]
    UpgradeRejected(String),

    /// A subprotocol was required but the client offered none the server supports.
    #[error("No acceptable subprotocol was offered")]
    NoSubprotocol,

    /// The bytes read from a raw stream are not a well-formed HTTP/1.1 request head.
    #[error("Malformed HTTP request")]
    MalformedRequest,

    /// Building an HTTP response failed.
    #[error(transparent)]
    Http(#[from] hyper::http::Error),

    // ----------------------------------------------------------------------------------
    // protocol
    // ----------------------------------------------------------------------------------
    /// Indicates receipt of a frame with a reserved opcode value.
    #[error("Invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// Reserved bits in the frame header are set while no extension was negotiated.
    #[error("Reserved bits are not zero")]
    ReservedBitsNotZero,

    /// A client sent a frame without a mask.
    #[error("Client frame is not masked")]
    UnmaskedFrame,

    /// A server sent a masked frame.
    #[error("Server frame must not be masked")]
    UnexpectedMask,

    /// A control frame (ping, pong, or close) has the FIN bit clear.
    #[error("Control frame must not be fragmented")]
    ControlFrameFragmented,

    /// A control frame payload exceeds 125 bytes.
    #[error("Control frame too large")]
    ControlFrameTooLarge,

    /// A frame's payload length exceeds the configured maximum.
    #[error("Frame too large")]
    FrameTooLarge,

    /// A 64-bit payload length has its top bit set or does not fit in memory.
    #[error("Payload length overflow")]
    PayloadLengthOverflow,

    /// A data frame has the FIN bit clear. Message reassembly is not supported.
    #[error("Fragmented messages are not supported")]
    FragmentedMessage,

    /// A continuation frame arrived, which can only follow a fragmented message.
    #[error("Invalid continuation frame")]
    InvalidContinuationFrame,

    /// Indicates that a text frame or close frame reason contains invalid UTF-8 data.
    #[error("Invalid UTF-8")]
    InvalidUTF8,

    /// A close frame payload of exactly one byte.
    #[error("Invalid close frame")]
    InvalidCloseFrame,

    /// A close frame carrying a code peers are not allowed to send.
    #[error("Invalid close code")]
    InvalidCloseCode,

    // ----------------------------------------------------------------------------------
    // io
    // ----------------------------------------------------------------------------------
    /// A read or write deadline passed.
    #[error("Deadline exceeded")]
    Timeout,

    /// The connection is closed. Once closed no further communication is possible.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// Wraps standard I/O errors such as connection resets.
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// Wraps errors from hyper while completing an upgrade.
    #[error(transparent)]
    HTTPError(#[from] hyper::Error),

    // ----------------------------------------------------------------------------------
    // pool
    // ----------------------------------------------------------------------------------
    /// The endpoint already holds its maximum number of connections.
    #[error("Connection limit reached for endpoint {0:?}")]
    PoolExhausted(String),

    /// The pool has been shut down.
    #[error("Connection pool is shut down")]
    PoolShutdown,

    /// Occurs when serialization of JSON data fails.
    /// Only available when the `json` feature is enabled.
    #[cfg(feature = "json")]
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<tokio::time::error::Elapsed> for WebSocketError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        WebSocketError::Timeout
    }
}

impl WebSocketError {
    /// Returns the category of this error.
    pub fn kind(&self) -> ErrorKind {
        use WebSocketError::*;
        match self {
            NotWebSocket
            | MissingSecWebSocketKey
            | UnsupportedVersion
            | OriginRejected
            | UpgradeRejected(_)
            | NoSubprotocol
            | MalformedRequest
            | Http(_) => ErrorKind::Handshake,

            InvalidOpCode(_)
            | ReservedBitsNotZero
            | UnmaskedFrame
            | UnexpectedMask
            | ControlFrameFragmented
            | ControlFrameTooLarge
            | FrameTooLarge
            | PayloadLengthOverflow
            | FragmentedMessage
            | InvalidContinuationFrame
            | InvalidUTF8
            | InvalidCloseFrame
            | InvalidCloseCode => ErrorKind::Protocol,

            Timeout | ConnectionClosed | IoError(_) | HTTPError(_) => ErrorKind::Io,

            PoolExhausted(_) | PoolShutdown => ErrorKind::Pool,

            #[cfg(feature = "json")]
            Json(_) => ErrorKind::Payload,
        }
    }

    /// Returns `true` if the peer violated the protocol.
    pub fn is_protocol_error(&self) -> bool {
        self.kind() == ErrorKind::Protocol
    }

    /// Returns `true` if a deadline passed.
    pub fn is_timeout(&self) -> bool {
        match self {
            WebSocketError::Timeout => true,
            WebSocketError::IoError(err) => err.kind() == std::io::ErrorKind::TimedOut,
            _ => false,
        }
    }

    /// HTTP status to answer a refused upgrade with.
    ///
    /// Returns `None` for errors that happen after the stream changed hands.
    pub fn status_code(&self) -> Option<StatusCode> {
        use WebSocketError::*;
        match self {
            NotWebSocket | MissingSecWebSocketKey | UnsupportedVersion | NoSubprotocol
            | MalformedRequest => Some(StatusCode::BAD_REQUEST),
            OriginRejected | UpgradeRejected(_) => Some(StatusCode::FORBIDDEN),
            Http(_) => Some(StatusCode::INTERNAL_SERVER_ERROR),
            PoolExhausted(_) | PoolShutdown => Some(StatusCode::SERVICE_UNAVAILABLE),
            _ => None,
        }
    }

    /// Close code to send to the peer before dropping a connection over this error.
    pub fn close_code(&self) -> Option<CloseCode> {
        use WebSocketError::*;
        match self {
            FrameTooLarge | PayloadLengthOverflow => Some(CloseCode::Size),
            InvalidOpCode(_) | FragmentedMessage | InvalidContinuationFrame => {
                Some(CloseCode::Unsupported)
            }
            InvalidUTF8 => Some(CloseCode::Invalid),
            err if err.is_protocol_error() => Some(CloseCode::Protocol),
            _ => None,
        }
    }
}
