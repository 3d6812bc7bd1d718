//! Control-plane listener.
//!
//! One TCP port carries the HTTP API, engine upgrades and watch upgrades.
//! Each accepted connection is optionally wrapped in TLS and served by
//! hyper with upgrades enabled, dispatching into an axum [`Router`].

use crate::core::error::KvsqlResult;
use axum::Router;
use hyper::body::Incoming;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tower::Service;

/// Accept connections until `shutdown` flips to `true`.
pub async fn serve(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    router: Router,
    mut shutdown: watch::Receiver<bool>,
) -> KvsqlResult<()> {
    let local = listener.local_addr()?;
    tracing::info!(address = %local, tls = acceptor.is_some(), "control plane listening");

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let _ = stream.set_nodelay(true);
                let acceptor = acceptor.clone();
                let router = router.clone();
                tokio::spawn(async move {
                    match acceptor {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(tls) => serve_connection(tls, router).await,
                            Err(e) => tracing::debug!(%peer, error = %e, "TLS handshake failed"),
                        },
                        None => serve_connection(stream, router).await,
                    }
                });
            }
        }
    }

    tracing::info!(address = %local, "control plane stopped");
    Ok(())
}

/// Serve HTTP/1.1 on one connection.
pub async fn serve_connection<S>(io: S, router: Router)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service =
        hyper::service::service_fn(move |req: Request<Incoming>| router.clone().call(req));
    if let Err(e) = hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(io), service)
        .with_upgrades()
        .await
    {
        tracing::debug!(error = %e, "connection closed with error");
    }
}
