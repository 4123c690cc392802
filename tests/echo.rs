//! End-to-end upgrades over real TCP sockets.
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use http_body_util::Empty;
use hyper::{
    body::{Bytes, Incoming},
    server::conn::http1,
    service::service_fn,
    Request, Response,
};
use hyper_util::rt::TokioIo;
use hyperserve_ws::{
    codec::Codec, handshake, CloseCode, Connection, Frame, HandshakeOptions, OpCode, OriginPolicy, Pool,
    PoolConfig, RawExchange, Role, Upgrader, WebSocketError, MAX_PAYLOAD_READ,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tokio_util::codec::Framed;

const KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
const ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

fn upgrader() -> Upgrader {
    Upgrader::default().with_handshake(
        HandshakeOptions::default()
            .with_origin_policy(OriginPolicy::allow_list(["http://localhost"]))
            .with_subprotocols(["echo"]),
    )
}

/// Sends the upgrade request and returns the response head plus a framed client.
async fn connect(addr: std::net::SocketAddr, origin: &str) -> (String, Framed<TcpStream, Codec>) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET /echo HTTP/1.1\r\n\
         Host: {addr}\r\n\
         Origin: {origin}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {KEY}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Protocol: chat, echo\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    // read byte by byte so no frame bytes are consumed with the head
    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        let byte = stream.read_u8().await.unwrap();
        head.push(byte);
    }

    let head = String::from_utf8(head).unwrap();
    (head, Framed::new(stream, Codec::new(Role::Client, MAX_PAYLOAD_READ)))
}

async fn echo_until_close<S>(conn: Connection<S>)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    while let Ok((opcode, payload)) = conn.read_message().await {
        if opcode.is_data() && conn.write_message(opcode, payload).await.is_err() {
            break;
        }
    }
}

#[tokio::test]
async fn test_raw_exchange_echo() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let exchange = RawExchange::read(stream).await.unwrap();
        let conn = upgrader().upgrade(exchange).await.unwrap();
        assert_eq!(conn.protocol(), Some("echo"));
        echo_until_close(conn).await;
    });

    let (head, mut client) = connect(addr, "http://localhost").await;
    assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"), "{head}");
    assert!(head.contains(&format!("Sec-WebSocket-Accept: {ACCEPT}\r\n")), "{head}");
    assert!(head.contains("Sec-WebSocket-Protocol: echo\r\n"), "{head}");

    client.send(Frame::text("Hello, WebSocket!")).await.unwrap();
    let echoed = client.next().await.unwrap().unwrap();
    assert_eq!(echoed.opcode, OpCode::Text);
    assert!(!echoed.is_masked());
    assert_eq!(echoed.payload, "Hello, WebSocket!");

    client.send(Frame::close(CloseCode::Normal, "done")).await.unwrap();
    let reply = client.next().await.unwrap().unwrap();
    assert_eq!(reply.opcode, OpCode::Close);
    assert_eq!(reply.close_code(), Some(CloseCode::Normal));

    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_raw_exchange_origin_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let exchange = RawExchange::read(stream).await.unwrap();
        upgrader().upgrade(exchange).await.unwrap_err()
    });

    let (head, _client) = connect(addr, "https://evil.example").await;
    assert!(head.starts_with("HTTP/1.1 403"), "{head}");

    let err = server.await.unwrap();
    assert_eq!(err.status_code(), Some(hyper::StatusCode::FORBIDDEN));
}

#[tokio::test]
async fn test_hyper_upgrade_echo() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    async fn serve(mut req: Request<Incoming>) -> hyper::http::Result<Response<Empty<Bytes>>> {
        match upgrader().upgrade_request(&mut req) {
            Ok((response, fut)) => {
                tokio::spawn(async move {
                    if let Ok(conn) = fut.await {
                        echo_until_close(conn).await;
                    }
                });
                Ok(response)
            }
            Err(err) => Ok(handshake::rejection(&err).unwrap_or_default()),
        }
    }

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service_fn(serve))
            .with_upgrades()
            .await
            .unwrap();
    });

    let (head, mut client) = connect(addr, "http://localhost").await;
    let lower = head.to_ascii_lowercase();
    assert!(lower.starts_with("http/1.1 101"), "{head}");
    assert!(lower.contains(&format!("sec-websocket-accept: {}", ACCEPT.to_ascii_lowercase())));

    for payload in ["one", "two", "three"] {
        client.send(Frame::binary(payload)).await.unwrap();
        let echoed = client.next().await.unwrap().unwrap();
        assert_eq!(echoed.opcode, OpCode::Binary);
        assert_eq!(echoed.payload, payload);
    }

    client.send(Frame::ping("are you there")).await.unwrap();
    let pong = client.next().await.unwrap().unwrap();
    assert_eq!(pong.opcode, OpCode::Pong);
    assert_eq!(pong.payload, "are you there");
}

#[tokio::test]
async fn test_pooled_connections() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let pool = Pool::new(PoolConfig::default().with_max_connections_per_endpoint(1));

    let client_task = tokio::spawn(async move {
        let (first, _c1) = connect(addr, "http://localhost").await;
        let (second, _c2) = connect(addr, "http://localhost").await;
        (first, second)
    });

    let upgrader = upgrader();
    let (stream, _) = listener.accept().await.unwrap();
    let conn = pool
        .get("/echo", &upgrader, RawExchange::read(stream).await.unwrap())
        .await
        .unwrap();

    let (stream, _) = listener.accept().await.unwrap();
    let err = pool
        .get("/echo", &upgrader, RawExchange::read(stream).await.unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, WebSocketError::PoolExhausted(_)));

    let (first, second) = client_task.await.unwrap();
    assert!(first.starts_with("HTTP/1.1 101"));
    assert!(second.starts_with("HTTP/1.1 503"));

    pool.put(conn).await;
    assert_eq!(pool.stats().idle, 1);
    pool.shutdown(Duration::from_secs(1)).await.unwrap();
    assert_eq!(pool.stats().total, 0);
}
