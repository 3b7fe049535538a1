//! Datagram I/O: one multicast socket per network interface, and the seams through which the
//!  rest of the transport sends and receives raw datagrams.

pub mod multiplexer;
pub mod netif;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;

/// Sends a datagram to all nodes in the multicast group
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramBroadcaster: Send + Sync + 'static {
    async fn broadcast(&self, datagram: &[u8]) -> anyhow::Result<()>;
}

/// Callback for every datagram received on any socket
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramHandler: Send + Sync + 'static {
    async fn on_datagram(&self, from: SocketAddr, datagram: &[u8]);
}
