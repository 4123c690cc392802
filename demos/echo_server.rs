//! A WebSocket echo server on top of hyper.
//! Text and binary messages are sent back as they are received.

use http_body_util::Empty;
use hyper::{
    body::{Bytes, Incoming},
    server::conn::http1,
    service::service_fn,
    Request, Response,
};
use hyperserve_ws::{handshake, HandshakeOptions, Options, OriginPolicy, UpgradeFut, Upgrader};
use tokio::net::TcpListener;

async fn handle_client(fut: UpgradeFut) -> hyperserve_ws::Result<()> {
    let conn = fut.await?;

    loop {
        let (opcode, payload) = conn.read_message().await?;
        if opcode.is_data() {
            conn.write_message(opcode, payload).await?;
        } else if conn.is_closed() {
            break;
        }
    }

    log::debug!("client {} disconnected", conn.id());

    Ok(())
}

async fn server_upgrade(
    mut req: Request<Incoming>,
) -> hyperserve_ws::Result<Response<Empty<Bytes>>> {
    let upgrader = Upgrader::new(
        HandshakeOptions::default().with_origin_policy(OriginPolicy::Any),
        Options::default()
            .with_utf8()
            .with_max_payload_read(16 * 1024 * 1024),
    );

    let (response, fut) = match upgrader.upgrade_request(&mut req) {
        Ok(upgrade) => upgrade,
        Err(err) => {
            log::warn!("refusing upgrade: {err}");
            return handshake::rejection(&err).ok_or(err);
        }
    };

    tokio::task::spawn(async move {
        if let Err(e) = handle_client(fut).await {
            log::error!("Error in websocket connection: {}", e);
        }
    });

    Ok(response)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    simple_logger::init_with_level(log::Level::Debug)?;

    let listener = TcpListener::bind("0.0.0.0:8080").await?;

    log::info!("Listening on {}", listener.local_addr()?);

    loop {
        let (stream, _) = listener.accept().await?;
        log::info!("Client connected");

        tokio::spawn(async move {
            let io = hyper_util::rt::TokioIo::new(stream);
            let conn_fut = http1::Builder::new()
                .serve_connection(io, service_fn(server_upgrade))
                .with_upgrades();
            if let Err(e) = conn_fut.await {
                log::error!("An error occurred: {:?}", e);
            }
        });
    }
}
