//! Node-to-node networking.
//!
//! - [`tls`] - mTLS configuration, acceptor and dialer
//! - [`tunnel`] - Bidirectional byte pipe between two streams
//! - [`upgrade`] - HTTP/1.1 `Upgrade` handshakes and the engine dialer
//! - [`listener`] - Control-plane accept loop

pub mod listener;
pub mod tls;
pub mod tunnel;
pub mod upgrade;

use crate::core::error::KvsqlResult;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// A bidirectional byte stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Type-erased connection returned by a [`Transport`].
pub type BoxStream = Box<dyn AsyncStream>;

/// Opens connections to other nodes' control-plane listeners.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, address: &str) -> KvsqlResult<BoxStream>;
}

/// Plain TCP transport, for `insecure` deployments.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainTransport;

#[async_trait]
impl Transport for PlainTransport {
    async fn connect(&self, address: &str) -> KvsqlResult<BoxStream> {
        let stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}
