//! The upgrade boundary between an HTTP server and this crate.
//!
//! An [`Exchange`] is one HTTP request that may become a WebSocket: the handshake
//! inspects its head through a [`RequestView`], then either rejects it with an HTTP
//! response or hijacks the underlying stream.
use std::{fmt::Write as _, future::Future};

use bytes::BytesMut;
use hyper::{
    header::{self, AsHeaderName},
    http::request,
    HeaderMap, Method, Request, Uri,
};
use nom::{
    bytes::complete::{tag, take_till, take_till1, take_while1},
    character::complete::{char, crlf, space0},
    combinator::all_consuming,
    multi::many0,
    sequence::{preceded, separated_pair, terminated},
    IResult, Parser,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{HttpResponse, Result, WebSocketError};

/// Largest request head a [`RawExchange`] accepts.
pub const MAX_REQUEST_HEAD: usize = 16 * 1024;

/// Borrowed view of an HTTP request head.
#[derive(Debug, Clone, Copy)]
pub struct RequestView<'a> {
    method: &'a Method,
    uri: &'a Uri,
    headers: &'a HeaderMap,
}

impl<'a> RequestView<'a> {
    pub fn new(method: &'a Method, uri: &'a Uri, headers: &'a HeaderMap) -> Self {
        Self {
            method,
            uri,
            headers,
        }
    }

    pub fn method(&self) -> &'a Method {
        self.method
    }

    pub fn uri(&self) -> &'a Uri {
        self.uri
    }

    pub fn headers(&self) -> &'a HeaderMap {
        self.headers
    }

    /// Case-insensitive header lookup. Values that are not visible ASCII read as absent.
    pub fn header(&self, name: impl AsHeaderName) -> Option<&'a str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// The `Host` header, falling back to the authority of an absolute request target.
    pub fn host(&self) -> Option<&'a str> {
        self.header(header::HOST)
            .or_else(|| self.uri.authority().map(|authority| authority.as_str()))
    }
}

impl<'a, B> From<&'a Request<B>> for RequestView<'a> {
    fn from(request: &'a Request<B>) -> Self {
        Self::new(request.method(), request.uri(), request.headers())
    }
}

impl<'a> From<&'a request::Parts> for RequestView<'a> {
    fn from(parts: &'a request::Parts) -> Self {
        Self::new(&parts.method, &parts.uri, &parts.headers)
    }
}

/// A stream taken over from the HTTP layer.
#[derive(Debug)]
pub struct Hijacked<S> {
    /// The raw byte stream.
    pub io: S,
    /// Bytes the HTTP layer had already read past the request head.
    pub read_buf: BytesMut,
}

/// One HTTP request that may be upgraded.
///
/// Both `hijack` and `reject` consume the exchange: after either, the HTTP layer
/// no longer owns the connection.
pub trait Exchange: Send {
    /// The stream handed over on hijack.
    type Io: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// The request head.
    fn request(&self) -> RequestView<'_>;

    /// Takes exclusive ownership of the underlying stream.
    fn hijack(self) -> impl Future<Output = Result<Hijacked<Self::Io>>> + Send;

    /// Answers the request with `response` instead of upgrading it.
    fn reject(self, response: HttpResponse) -> impl Future<Output = Result<()>> + Send;
}

/// An [`Exchange`] over a bare stream whose request head has not been consumed by anyone else.
///
/// [`RawExchange::read`] reads and parses the HTTP/1.1 request head itself. Bytes that
/// arrive after the head stay buffered and are handed to the connection on hijack.
#[derive(Debug)]
pub struct RawExchange<S> {
    io: S,
    parts: request::Parts,
    read_buf: BytesMut,
}

impl<S> RawExchange<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Reads a request head from `io`.
    ///
    /// # Errors
    /// - [`WebSocketError::ConnectionClosed`] if the peer hangs up before sending anything.
    /// - [`WebSocketError::MalformedRequest`] if the head cannot be parsed, is truncated,
    ///   or grows past [`MAX_REQUEST_HEAD`].
    pub async fn read(mut io: S) -> Result<Self> {
        let mut buf = BytesMut::with_capacity(1024);

        let head_len = loop {
            if let Some(end) = find_head_end(&buf) {
                break end;
            }
            if buf.len() >= MAX_REQUEST_HEAD {
                return Err(WebSocketError::MalformedRequest);
            }
            buf.reserve(1024);
            if io.read_buf(&mut buf).await? == 0 {
                return Err(if buf.is_empty() {
                    WebSocketError::ConnectionClosed
                } else {
                    WebSocketError::MalformedRequest
                });
            }
        };

        let head = buf.split_to(head_len);
        let parts = parse_request_head(&head)?;

        Ok(Self {
            io,
            parts,
            read_buf: buf,
        })
    }

    /// The parsed request head.
    pub fn parts(&self) -> &request::Parts {
        &self.parts
    }
}

impl<S> Exchange for RawExchange<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    type Io = S;

    fn request(&self) -> RequestView<'_> {
        RequestView::from(&self.parts)
    }

    async fn hijack(self) -> Result<Hijacked<S>> {
        Ok(Hijacked {
            io: self.io,
            read_buf: self.read_buf,
        })
    }

    async fn reject(mut self, response: HttpResponse) -> Result<()> {
        let head = encode_response_head(&response);
        self.io.write_all(&head).await?;
        self.io.flush().await?;
        self.io.shutdown().await?;
        Ok(())
    }
}

/// Serializes the head of a bodiless response. The connection is always marked for closing.
pub(crate) fn encode_response_head(response: &HttpResponse) -> BytesMut {
    let status = response.status();
    let mut buf = BytesMut::with_capacity(256);

    let _ = write!(
        buf,
        "HTTP/1.1 {} {}\r\n",
        status.as_str(),
        status.canonical_reason().unwrap_or("")
    );
    for (name, value) in response.headers() {
        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    if !response.headers().contains_key(header::CONTENT_LENGTH) {
        buf.extend_from_slice(b"content-length: 0\r\n");
    }
    buf.extend_from_slice(b"connection: close\r\n\r\n");

    buf
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

fn is_token(c: u8) -> bool {
    c.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&c)
}

type RequestLine<'a> = (&'a [u8], &'a [u8], &'a [u8]);

fn request_line(input: &[u8]) -> IResult<&[u8], RequestLine<'_>> {
    (
        terminated(take_while1(is_token), char(' ')),
        terminated(take_till1(|c: u8| c == b' '), char(' ')),
        terminated(
            preceded(tag("HTTP/"), take_while1(|c: u8| c.is_ascii_digit() || c == b'.')),
            crlf,
        ),
    )
        .parse(input)
}

fn header_field(input: &[u8]) -> IResult<&[u8], (&[u8], &[u8])> {
    terminated(
        separated_pair(
            take_while1(is_token),
            (char(':'), space0),
            take_till(|c: u8| c == b'\r' || c == b'\n'),
        ),
        crlf,
    )
    .parse(input)
}

fn request_head(input: &[u8]) -> IResult<&[u8], (RequestLine<'_>, Vec<(&[u8], &[u8])>)> {
    terminated((request_line, many0(header_field)), crlf).parse(input)
}

fn parse_request_head(head: &[u8]) -> Result<request::Parts> {
    let (_, ((method, target, version), fields)) = all_consuming(request_head)
        .parse(head)
        .map_err(|_| WebSocketError::MalformedRequest)?;

    let version = match version {
        b"1.1" => hyper::Version::HTTP_11,
        b"1.0" => hyper::Version::HTTP_10,
        _ => return Err(WebSocketError::MalformedRequest),
    };

    let mut builder = Request::builder()
        .method(method)
        .uri(target)
        .version(version);
    for (name, value) in fields {
        builder = builder.header(name, value.trim_ascii_end());
    }

    let (parts, ()) = builder
        .body(())
        .map_err(|_| WebSocketError::MalformedRequest)?
        .into_parts();
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::StatusCode;
    use tokio::io::duplex;

    const UPGRADE: &[u8] = b"GET /chat?room=1 HTTP/1.1\r\n\
        Host: server.example.com\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\r\n";

    mod parser_tests {
        use super::*;

        #[test]
        fn test_parse_upgrade_request() {
            let parts = parse_request_head(UPGRADE).unwrap();
            assert_eq!(parts.method, Method::GET);
            assert_eq!(parts.uri.path(), "/chat");
            assert_eq!(parts.uri.query(), Some("room=1"));
            assert_eq!(parts.version, hyper::Version::HTTP_11);

            let view = RequestView::from(&parts);
            assert_eq!(view.header("upgrade"), Some("websocket"));
            assert_eq!(view.header("SEC-WEBSOCKET-VERSION"), Some("13"));
            assert_eq!(view.host(), Some("server.example.com"));
        }

        #[test]
        fn test_header_value_whitespace() {
            let parts = parse_request_head(b"GET / HTTP/1.1\r\nX-Pad:   padded  \r\n\r\n").unwrap();
            assert_eq!(RequestView::from(&parts).header("x-pad"), Some("padded"));
        }

        #[test]
        fn test_rejects_garbage() {
            for head in [
                &b"\r\n\r\n"[..],
                b"GET /\r\n\r\n",
                b"GET / HTTP/2.0\r\n\r\n",
                b"GET / HTTP/1.1\r\nno colon here\r\n\r\n",
                b"G(T / HTTP/1.1\r\n\r\n",
            ] {
                assert!(
                    matches!(parse_request_head(head), Err(WebSocketError::MalformedRequest)),
                    "{:?}",
                    String::from_utf8_lossy(head)
                );
            }
        }
    }

    mod raw_exchange_tests {
        use super::*;

        #[tokio::test]
        async fn test_read_keeps_trailing_bytes() {
            let (mut client, server) = duplex(4096);
            client.write_all(UPGRADE).await.unwrap();
            client.write_all(&[0x81, 0x80]).await.unwrap();

            let exchange = RawExchange::read(server).await.unwrap();
            assert_eq!(exchange.parts().uri.path(), "/chat");

            let hijacked = exchange.hijack().await.unwrap();
            assert_eq!(&hijacked.read_buf[..], &[0x81, 0x80]);
        }

        #[tokio::test]
        async fn test_head_split_across_reads() {
            let (mut client, server) = duplex(4096);
            let reader = tokio::spawn(RawExchange::read(server));

            for chunk in UPGRADE.chunks(7) {
                client.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }

            let exchange = reader.await.unwrap().unwrap();
            assert_eq!(exchange.request().header("connection"), Some("Upgrade"));
        }

        #[tokio::test]
        async fn test_closed_before_request() {
            let (client, server) = duplex(64);
            drop(client);
            assert!(matches!(
                RawExchange::read(server).await,
                Err(WebSocketError::ConnectionClosed)
            ));
        }

        #[tokio::test]
        async fn test_oversized_head() {
            let (mut client, server) = duplex(64 * 1024);
            let mut head = b"GET / HTTP/1.1\r\n".to_vec();
            head.extend(std::iter::repeat(b'a').take(MAX_REQUEST_HEAD));
            client.write_all(&head).await.unwrap();

            assert!(matches!(
                RawExchange::read(server).await,
                Err(WebSocketError::MalformedRequest)
            ));
        }

        #[tokio::test]
        async fn test_reject_writes_response() {
            let (mut client, server) = duplex(4096);
            client.write_all(UPGRADE).await.unwrap();

            let exchange = RawExchange::read(server).await.unwrap();
            let response = hyper::Response::builder()
                .status(StatusCode::FORBIDDEN)
                .body(http_body_util::Empty::new())
                .unwrap();
            exchange.reject(response).await.unwrap();

            let mut received = String::new();
            client.read_to_string(&mut received).await.unwrap();
            assert_eq!(
                received,
                "HTTP/1.1 403 Forbidden\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
            );
        }
    }
}
