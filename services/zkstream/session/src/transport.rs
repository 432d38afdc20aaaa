//! TCP transport for ZooKeeper connections.

use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::Backend;
use crate::error::ZkError;

/// Connect to a backend, giving up after `timeout`
pub async fn connect_tcp(backend: &Backend, timeout: Duration) -> Result<TcpStream, ZkError> {
    let addr = (backend.address.as_str(), backend.port);
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| ZkError::ConnectTimeout)??;

    stream.set_nodelay(true)?;
    debug!("TCP connection established to {}", backend);
    Ok(stream)
}
