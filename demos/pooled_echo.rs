//! Echo server that reads upgrade requests straight off the socket and pools the
//! connections per request path.
//!
//! Each client gets one message echoed, then its connection goes back to the pool.
//! Ctrl-C shuts the pool down.

use std::{sync::Arc, time::Duration};

use hyperserve_ws::{
    pool::PoolHooks, HandshakeOptions, OriginPolicy, Pool, PoolConfig, RawExchange, Upgrader,
};
use tokio::net::{TcpListener, TcpStream};

async fn serve(
    pool: Arc<Pool<TcpStream>>,
    upgrader: Arc<Upgrader>,
    stream: TcpStream,
) -> hyperserve_ws::Result<()> {
    let exchange = RawExchange::read(stream).await?;
    let endpoint = exchange.parts().uri.path().to_owned();

    let conn = pool.get(&endpoint, &upgrader, exchange).await?;
    match conn.read_message().await {
        Ok((opcode, payload)) if opcode.is_data() => {
            conn.write_message(opcode, payload).await?;
            pool.put(conn).await;
        }
        _ => pool.discard(conn).await,
    }

    log::info!("{endpoint}: {:?}", pool.stats());
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    simple_logger::init_with_level(log::Level::Debug)?;

    let hooks = PoolHooks::<TcpStream>::default()
        .on_created(|endpoint, conn| log::info!("{endpoint}: new connection {}", conn.id()))
        .on_closed(|endpoint, conn, reason| {
            log::info!("{endpoint}: connection {} closed ({reason})", conn.id())
        });
    let pool = Arc::new(Pool::with_hooks(
        PoolConfig::default()
            .with_max_connections_per_endpoint(4)
            .with_idle_timeout(Duration::from_secs(15)),
        hooks,
    ));
    let upgrader = Arc::new(Upgrader::default().with_handshake(
        HandshakeOptions::default().with_origin_policy(OriginPolicy::Any),
    ));

    let listener = TcpListener::bind("0.0.0.0:8080").await?;
    log::info!("Listening on {}", listener.local_addr()?);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                let pool = Arc::clone(&pool);
                let upgrader = Arc::clone(&upgrader);
                tokio::spawn(async move {
                    if let Err(e) = serve(pool, upgrader, stream).await {
                        log::warn!("connection failed: {e}");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    pool.shutdown(Duration::from_secs(5)).await?;
    Ok(())
}
