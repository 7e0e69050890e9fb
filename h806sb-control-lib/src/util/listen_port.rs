//! Exclusive use of the local port the device answers to.
//!
//! The device sends discovery and liveness replies to a fixed port, so only one
//! socket may own that port at a time. Liveness checks and discoveries in this
//! process queue on a shared lock; a foreign process holding the port makes the bind
//! fail with `AddrInUse` instead of splitting the replies.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use lazy_static::lazy_static;
use log::debug;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, OwnedMutexGuard};

lazy_static! {
    static ref LISTEN_PORT_LOCK: Arc<Mutex<()>> = Arc::new(Mutex::new(()));
}

/// A socket bound to the listen port. The port is released on drop.
#[derive(Debug)]
pub struct ListenSocket {
    socket: UdpSocket,
    _claim: OwnedMutexGuard<()>,
}

impl ListenSocket {
    /// Waits for the port to be free in this process, then binds it with
    /// broadcast enabled.
    pub async fn bind(port: u16) -> std::io::Result<Self> {
        let claim = LISTEN_PORT_LOCK.clone().lock_owned().await;
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
        socket.set_broadcast(true)?;
        debug!("Listen socket bound to {}", socket.local_addr()?);

        Ok(ListenSocket {
            socket,
            _claim: claim,
        })
    }

    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[cfg(test)]
pub(crate) fn free_port() -> u16 {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| s.local_addr())
        .map(|addr| addr.port())
        .unwrap()
}
