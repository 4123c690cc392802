//! Turning HTTP requests into [`Connection`]s.
use std::{
    borrow::BorrowMut,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use http_body_util::Empty;
use hyper::{header, upgrade::Upgraded, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use pin_project::pin_project;

use crate::{
    handshake::{self, HandshakeOptions, HttpResponse},
    Connection, Exchange, Hijacked, Options, RequestView, Result, Role, WebSocketError,
};

/// The result type returned by [`Upgrader::upgrade_request`].
///
/// Both components must be handled for a successful upgrade:
/// 1. Send the HTTP response to the client
/// 2. Await the future to obtain the WebSocket connection
pub type UpgradeResult = Result<(HttpResponse, UpgradeFut)>;

/// Handshake policy plus the options of the connections it produces.
///
/// An `Upgrader` is cheap to clone and is meant to be shared by every request
/// handler serving the same route.
#[derive(Clone, Debug, Default)]
pub struct Upgrader {
    pub handshake: HandshakeOptions,
    pub options: Options,
}

impl Upgrader {
    pub fn new(handshake: HandshakeOptions, options: Options) -> Self {
        Self { handshake, options }
    }

    pub fn with_handshake(self, handshake: HandshakeOptions) -> Self {
        Self { handshake, ..self }
    }

    pub fn with_options(self, options: Options) -> Self {
        Self { options, ..self }
    }

    /// Upgrades `exchange`, writing the `101` response on its stream.
    ///
    /// On a handshake error the exchange has already been answered with the matching
    /// HTTP status when this returns.
    pub async fn upgrade<E: Exchange>(&self, exchange: E) -> Result<Connection<E::Io>> {
        let (hijacked, accepted) = handshake::perform_handshake(exchange, &self.handshake).await?;
        Ok(Connection::new(
            Role::Server,
            hijacked,
            accepted.protocol,
            &self.options,
        ))
    }

    /// Upgrades a request served by hyper.
    ///
    /// Returns the `101` response for the service to hand back, and a future that
    /// resolves to the connection once hyper gives up the stream. The future only
    /// completes after the response is sent, so it must be awaited on its own task.
    ///
    /// A handshake error is returned as is; [`handshake::rejection`] turns it into a
    /// response.
    ///
    /// ```rust,no_run
    /// use http_body_util::Empty;
    /// use hyper::{body::{Bytes, Incoming}, Request, Response};
    /// use hyperserve_ws::{handshake, Upgrader};
    ///
    /// async fn serve(upgrader: Upgrader, mut req: Request<Incoming>) -> hyperserve_ws::Result<Response<Empty<Bytes>>> {
    ///     match upgrader.upgrade_request(&mut req) {
    ///         Ok((response, fut)) => {
    ///             tokio::spawn(async move {
    ///                 if let Ok(conn) = fut.await {
    ///                     while let Ok((opcode, payload)) = conn.read_message().await {
    ///                         let _ = conn.write_message(opcode, payload).await;
    ///                     }
    ///                 }
    ///             });
    ///             Ok(response)
    ///         }
    ///         Err(err) => handshake::rejection(&err).ok_or(err),
    ///     }
    /// }
    /// ```
    pub fn upgrade_request<B>(&self, mut request: impl BorrowMut<Request<B>>) -> UpgradeResult {
        let request = request.borrow_mut();
        let accepted = handshake::negotiate(&RequestView::from(&*request), &self.handshake)?;

        let mut builder = Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(header::UPGRADE, "websocket")
            .header(header::CONNECTION, "Upgrade")
            .header(header::SEC_WEBSOCKET_ACCEPT, &accepted.accept_key);
        if let Some(protocol) = &accepted.protocol {
            builder = builder.header(header::SEC_WEBSOCKET_PROTOCOL, protocol);
        }
        let response = builder.body(Empty::new())?;

        let fut = UpgradeFut {
            inner: hyper::upgrade::on(request),
            negotiated: Some((accepted.protocol, self.options.clone())),
        };

        Ok((response, fut))
    }
}

/// Future that resolves to a [`Connection`] once hyper hands over an upgraded stream.
#[pin_project]
#[derive(Debug)]
pub struct UpgradeFut {
    #[pin]
    inner: hyper::upgrade::OnUpgrade,
    negotiated: Option<(Option<String>, Options)>,
}

impl Future for UpgradeFut {
    type Output = Result<Connection<TokioIo<Upgraded>>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let upgraded = match this.inner.poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(upgraded) => upgraded?,
        };

        let Some((protocol, options)) = this.negotiated.take() else {
            return Poll::Ready(Err(WebSocketError::ConnectionClosed));
        };

        let hijacked = Hijacked {
            io: TokioIo::new(upgraded),
            read_buf: Default::default(),
        };
        Poll::Ready(Ok(Connection::new(
            Role::Server,
            hijacked,
            protocol,
            &options,
        )))
    }
}
