//! A live, upgraded WebSocket connection.
//!
//! The stream is split in two halves, each behind its own async lock: one task may read
//! while another writes, but two concurrent writes queue up on the writer lock.
//!
//! Protocol and I/O failures are fatal. The connection sends a best-effort Close frame
//! carrying the matching [`CloseCode`] when the failure is the peer's fault, releases the
//! stream, and answers every later call with [`WebSocketError::ConnectionClosed`].
use std::{
    fmt,
    io::Cursor,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, Chain, ReadHalf, WriteHalf},
    sync::Mutex as AsyncMutex,
    time::{self, Instant},
};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::{
    close::CloseCode,
    codec::{Decoder, Encoder},
    frame::{Frame, OpCode},
    Hijacked, Result, WebSocketError,
};

/// The maximum allowed payload size for reading, set to 1 MiB.
///
/// Frames with a payload size larger than this limit will be rejected to ensure memory safety
/// and prevent excessively large messages from impacting performance.
pub const MAX_PAYLOAD_READ: usize = 1024 * 1024;

/// Deadline applied to automatic Pong and Close replies.
pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Which side of the connection this endpoint is.
///
/// A server never masks what it sends and requires masked frames from the client.
/// A client does the opposite.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Role {
    Server,
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server => write!(f, "server"),
            Self::Client => write!(f, "client"),
        }
    }
}

/// Configuration for a [`Connection`].
#[derive(Clone, Debug)]
pub struct Options {
    /// Maximum allowed payload size for incoming frames, in bytes.
    ///
    /// A larger frame closes the connection with [`CloseCode::Size`].
    ///
    /// Default: 1 MiB as defined in [`MAX_PAYLOAD_READ`]
    pub max_payload_read: Option<usize>,

    /// Whether incoming text frames are validated as UTF-8.
    ///
    /// Default: `false`
    pub check_utf8: bool,

    /// Whether a received Ping is answered with a Pong automatically.
    /// The Ping is still returned to the reader either way.
    ///
    /// Default: `true`
    pub auto_pong: bool,

    /// Deadline for the automatic Pong, Close and Close-echo frames.
    ///
    /// Default: [`DEFAULT_CONTROL_TIMEOUT`]
    pub control_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_payload_read: None,
            check_utf8: false,
            auto_pong: true,
            control_timeout: DEFAULT_CONTROL_TIMEOUT,
        }
    }
}

impl Options {
    /// Sets the maximum payload size for incoming frames.
    pub fn with_max_payload_read(self, size: usize) -> Self {
        Self {
            max_payload_read: Some(size),
            ..self
        }
    }

    /// Enables UTF-8 validation of text frames.
    pub fn with_utf8(self) -> Self {
        Self {
            check_utf8: true,
            ..self
        }
    }

    /// Leaves Ping frames unanswered; the reader is expected to reply.
    pub fn without_auto_pong(self) -> Self {
        Self {
            auto_pong: false,
            ..self
        }
    }

    /// Sets the deadline for automatic control replies.
    pub fn with_control_timeout(self, timeout: Duration) -> Self {
        Self {
            control_timeout: timeout,
            ..self
        }
    }
}

/// Bytes the HTTP layer buffered past the request head, followed by the stream itself.
type Prefixed<S> = Chain<Cursor<BytesMut>, ReadHalf<S>>;

/// One upgraded WebSocket connection.
///
/// Each call to [`read_message`](Self::read_message) or [`write_message`](Self::write_message)
/// is one frame. Fragmented data messages are refused, see [`WebSocketError::FragmentedMessage`].
pub struct Connection<S> {
    id: u64,
    role: Role,
    protocol: Option<String>,
    reader: AsyncMutex<FramedRead<Prefixed<S>, Decoder>>,
    writer: AsyncMutex<FramedWrite<WriteHalf<S>, Encoder>>,
    read_deadline: Mutex<Option<Instant>>,
    write_deadline: Mutex<Option<Instant>>,
    /// Set once the stream has been released.
    closed: AtomicBool,
    /// Set once a Close frame went out, or was attempted.
    close_sent: AtomicBool,
    check_utf8: bool,
    auto_pong: bool,
    control_timeout: Duration,
}

impl<S> Connection<S> {
    /// Process-unique identifier of this connection.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    /// The subprotocol negotiated during the handshake.
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    /// Returns `true` once the connection has been closed or failed.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Sets the deadline for subsequent reads. `None` waits forever.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        *self.read_deadline.lock() = deadline;
    }

    /// Sets the deadline for subsequent [`write_message`](Self::write_message) calls.
    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        *self.write_deadline.lock() = deadline;
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Wraps a hijacked stream.
    pub(crate) fn new(
        role: Role,
        hijacked: Hijacked<S>,
        protocol: Option<String>,
        options: &Options,
    ) -> Self {
        let max_payload_read = options.max_payload_read.unwrap_or(MAX_PAYLOAD_READ);
        let (read_half, write_half) = tokio::io::split(hijacked.io);
        let read_half = Cursor::new(hijacked.read_buf).chain(read_half);

        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "logging")]
        log::debug!("connection {id} established as {role} (protocol={protocol:?})");

        Self {
            id,
            role,
            protocol,
            reader: AsyncMutex::new(FramedRead::new(
                read_half,
                Decoder::new(role, max_payload_read),
            )),
            writer: AsyncMutex::new(FramedWrite::new(write_half, Encoder::new(role))),
            read_deadline: Mutex::new(None),
            write_deadline: Mutex::new(None),
            closed: AtomicBool::new(false),
            close_sent: AtomicBool::new(false),
            check_utf8: options.check_utf8,
            auto_pong: options.auto_pong,
            control_timeout: options.control_timeout,
        }
    }

    /// Reads the next frame.
    ///
    /// Control frames are returned as well. A Ping is answered before it is returned
    /// (unless [`Options::auto_pong`] is off). A Close is validated, echoed, and ends
    /// the connection; it is still returned so the caller can inspect the code.
    ///
    /// # Errors
    /// - [`WebSocketError::Timeout`] if the read deadline passes.
    /// - Any protocol error raised by the decoder or by the checks above.
    /// - [`WebSocketError::ConnectionClosed`] if the connection is closed or the peer hung up.
    pub async fn read_message(&self) -> Result<(OpCode, Bytes)> {
        self.ensure_open()?;

        let next = {
            let mut reader = self.reader.lock().await;
            let deadline = *self.read_deadline.lock();
            match deadline {
                Some(deadline) => time::timeout_at(deadline, reader.next())
                    .await
                    .map_err(WebSocketError::from),
                None => Ok(reader.next().await),
            }
        };

        let frame = match next {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(err))) | Err(err) => return Err(self.fail(err).await),
            Ok(None) => return Err(self.fail(WebSocketError::ConnectionClosed).await),
        };

        self.on_frame(frame).await
    }

    /// Writes one final frame of type `opcode`.
    ///
    /// Blocks until the frame is flushed or the write deadline passes.
    pub async fn write_message(&self, opcode: OpCode, data: impl AsRef<[u8]>) -> Result<()> {
        if opcode == OpCode::Continuation {
            return Err(WebSocketError::InvalidContinuationFrame);
        }
        let deadline = *self.write_deadline.lock();
        let frame = Frame::from_parts(opcode, data);
        if opcode.is_control() {
            frame.validate()?;
        }
        if opcode == OpCode::Close {
            self.close_sent.store(true, Ordering::Release);
        }
        self.write_frame(frame, deadline).await
    }

    /// Writes a Ping, Pong or Close frame under its own `deadline`.
    ///
    /// The deadline covers waiting for a concurrent writer as well, so keepalives
    /// fail promptly against a stalled peer instead of queueing forever.
    pub async fn write_control(
        &self,
        opcode: OpCode,
        data: impl AsRef<[u8]>,
        deadline: Instant,
    ) -> Result<()> {
        if !opcode.is_control() {
            return Err(WebSocketError::InvalidOpCode(u8::from(opcode)));
        }
        let frame = Frame::from_parts(opcode, data);
        frame.validate()?;
        if opcode == OpCode::Close {
            self.close_sent.store(true, Ordering::Release);
        }
        self.write_frame(frame, Some(deadline)).await
    }

    /// Sends a Ping under the control timeout.
    pub async fn ping(&self, payload: impl AsRef<[u8]>) -> Result<()> {
        let deadline = Instant::now() + self.control_timeout;
        self.write_control(OpCode::Ping, payload, deadline).await
    }

    /// Sends a Close frame (best-effort) and releases the stream.
    ///
    /// Closing an already closed connection does nothing.
    pub async fn close(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        if !self.close_sent.swap(true, Ordering::AcqRel) {
            let deadline = Instant::now() + self.control_timeout;
            if let Err(_err) = self
                .send_frame(Frame::close(CloseCode::Normal, ""), Some(deadline))
                .await
            {
                #[cfg(feature = "logging")]
                log::debug!("connection {}: close frame not delivered: {_err}", self.id);
            }
        }
        self.release().await;
        Ok(())
    }

    /// Serializes `value` to JSON and sends it as a text frame.
    #[cfg(feature = "json")]
    #[cfg_attr(docsrs, doc(cfg(feature = "json")))]
    pub async fn write_json<T: serde::Serialize>(&self, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.write_message(OpCode::Text, bytes).await
    }

    /// Reads the next data frame and deserializes it from JSON.
    ///
    /// Ping and Pong frames are skipped. A Close ends the call with
    /// [`WebSocketError::ConnectionClosed`].
    #[cfg(feature = "json")]
    #[cfg_attr(docsrs, doc(cfg(feature = "json")))]
    pub async fn read_json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        loop {
            match self.read_message().await? {
                (OpCode::Text | OpCode::Binary, payload) => {
                    return Ok(serde_json::from_slice(&payload)?)
                }
                (OpCode::Close, _) => return Err(WebSocketError::ConnectionClosed),
                _ => continue,
            }
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(WebSocketError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    async fn on_frame(&self, frame: Frame) -> Result<(OpCode, Bytes)> {
        match frame.opcode {
            OpCode::Text | OpCode::Binary if !frame.fin => {
                return Err(self.fail(WebSocketError::FragmentedMessage).await);
            }
            OpCode::Continuation => {
                return Err(self.fail(WebSocketError::InvalidContinuationFrame).await);
            }
            OpCode::Text if self.check_utf8 && !is_utf8(&frame.payload) => {
                return Err(self.fail(WebSocketError::InvalidUTF8).await);
            }
            OpCode::Ping if self.auto_pong => {
                let deadline = Instant::now() + self.control_timeout;
                self.write_control(OpCode::Pong, &frame.payload, deadline)
                    .await?;
            }
            OpCode::Close => self.on_close(&frame).await?,
            _ => {}
        }

        Ok(frame.into_parts())
    }

    async fn on_close(&self, frame: &Frame) -> Result<()> {
        let code = match close_code(&frame.payload) {
            Ok(code) => code,
            Err(err) => return Err(self.fail(err).await),
        };

        #[cfg(feature = "logging")]
        log::debug!(
            "connection {}: peer closed (code={code:?}, reason={:?})",
            self.id,
            frame.close_reason()
        );

        if !self.close_sent.swap(true, Ordering::AcqRel) {
            let echo = match code {
                Some(code) => Frame::close(code, ""),
                None => Frame::close_raw(b""),
            };
            let deadline = Instant::now() + self.control_timeout;
            if let Err(_err) = self.send_frame(echo, Some(deadline)).await {
                #[cfg(feature = "logging")]
                log::debug!("connection {}: close echo not delivered: {_err}", self.id);
            }
        }

        self.release().await;
        Ok(())
    }

    /// Sends a frame on behalf of a caller. Failures other than a rejected frame end the connection.
    async fn write_frame(&self, frame: Frame, deadline: Option<Instant>) -> Result<()> {
        self.ensure_open()?;
        match self.send_frame(frame, deadline).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail(err).await),
        }
    }

    async fn send_frame(&self, frame: Frame, deadline: Option<Instant>) -> Result<()> {
        let send = async {
            let mut writer = self.writer.lock().await;
            writer.send(frame).await
        };
        match deadline {
            Some(deadline) => time::timeout_at(deadline, send).await?,
            None => send.await,
        }
    }

    /// Tears the connection down over `err`, which is handed back.
    async fn fail(&self, err: WebSocketError) -> WebSocketError {
        if let Some(code) = err.close_code() {
            if !self.close_sent.swap(true, Ordering::AcqRel) {
                let deadline = Instant::now() + self.control_timeout;
                let _ = self
                    .send_frame(Frame::close(code, err.to_string()), Some(deadline))
                    .await;
            }
        }

        #[cfg(feature = "logging")]
        log::debug!("connection {} failed: {err}", self.id);

        self.release().await;
        err
    }

    /// Marks the connection closed and shuts the write side down, once.
    async fn release(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let shutdown = async {
            let mut writer = self.writer.lock().await;
            writer.get_mut().shutdown().await
        };
        match time::timeout(self.control_timeout, shutdown).await {
            Ok(Ok(())) => {}
            Ok(Err(_err)) => {
                #[cfg(feature = "logging")]
                log::debug!("connection {}: shutdown failed: {_err}", self.id);
            }
            Err(_) => {
                #[cfg(feature = "logging")]
                log::debug!("connection {}: shutdown timed out", self.id);
            }
        }
    }
}

impl<S> fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("protocol", &self.protocol)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

/// Validates a received Close payload, returning its code if it has one.
fn close_code(payload: &[u8]) -> Result<Option<CloseCode>> {
    match payload {
        [] => Ok(None),
        [_] => Err(WebSocketError::InvalidCloseFrame),
        [hi, lo, reason @ ..] => {
            let code = CloseCode::from(u16::from_be_bytes([*hi, *lo]));
            if !code.is_allowed() {
                return Err(WebSocketError::InvalidCloseCode);
            }
            if !is_utf8(reason) {
                return Err(WebSocketError::InvalidUTF8);
            }
            Ok(Some(code))
        }
    }
}

#[inline]
fn is_utf8(bytes: &[u8]) -> bool {
    #[cfg(feature = "simd")]
    {
        simdutf8::basic::from_utf8(bytes).is_ok()
    }
    #[cfg(not(feature = "simd"))]
    {
        std::str::from_utf8(bytes).is_ok()
    }
}
