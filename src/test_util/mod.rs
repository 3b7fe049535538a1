//! Utilities for testing code on top of the transport without sockets. They are part of the
//!  crate's regular (non-#[cfg(test)]) code so that applications can use them in their tests.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::trace;

use crate::config::CourierConfig;
use crate::transport::{DatagramBroadcaster, DatagramHandler};

/// An in-memory stand-in for the multicast group: every datagram broadcast by any node is
///  delivered to all registered handlers, including the sender's own, the way multicast
///  loopback does it.
///
/// Delivery happens inline, i.e. `broadcast()` returns after all handlers processed the
///  datagram.
#[derive(Default)]
pub struct LoopbackNetwork {
    handlers: RwLock<Vec<Arc<dyn DatagramHandler>>>,
    drop_remaining: AtomicUsize,
    num_delivered: AtomicUsize,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<LoopbackNetwork> {
        Default::default()
    }

    pub fn register(&self, handler: Arc<dyn DatagramHandler>) {
        self.handlers.write().unwrap().push(handler);
    }

    /// Silently lose the next `n` datagrams, regardless of which node sends them
    pub fn drop_next(&self, n: usize) {
        self.drop_remaining.store(n, Ordering::SeqCst);
    }

    /// Number of datagrams that were broadcast and not dropped
    pub fn num_delivered(&self) -> usize {
        self.num_delivered.load(Ordering::SeqCst)
    }

    fn source_addr() -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, CourierConfig::DEFAULT_PORT))
    }

    fn should_drop(&self) -> bool {
        self.drop_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl DatagramBroadcaster for LoopbackNetwork {
    async fn broadcast(&self, datagram: &[u8]) -> anyhow::Result<()> {
        if self.should_drop() {
            trace!("dropping datagram of {} bytes", datagram.len());
            return Ok(());
        }
        self.num_delivered.fetch_add(1, Ordering::SeqCst);

        let handlers = self.handlers.read().unwrap().clone();
        for handler in handlers {
            handler.on_datagram(Self::source_addr(), datagram).await;
        }
        Ok(())
    }
}
