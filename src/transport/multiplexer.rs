use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::UdpSocket;
use tokio::select;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, error, info, trace};

use crate::config::CourierConfig;
use crate::shutdown::ShutdownToken;
use crate::stats::TransportStats;
use crate::transport::netif::{enumerate_multicast_interfaces, MulticastInterface};
use crate::transport::{DatagramBroadcaster, DatagramHandler};
use crate::util::datagram_buf::DatagramBuf;
use crate::util::object_pool::ObjectPool;

/// The SocketMultiplexer owns one multicast socket per eligible network interface. It sends
///  every outbound datagram through all of them, and runs a receive loop per socket that feeds
///  a single [DatagramHandler].
///
/// All sockets are bound to the same port and joined to the same group, with multicast loopback
///  enabled so that nodes on the same host see each other. A consequence is that a datagram can
///  be received more than once, so upper layers must suppress duplicates.
pub struct SocketMultiplexer {
    sockets: RwLock<Vec<Arc<UdpSocket>>>,
    target: SocketAddr,
    receive_buffers: Arc<ObjectPool<DatagramBuf>>,
    is_shutdown: AtomicBool,
    shutdown: ShutdownToken,
    stats: Arc<TransportStats>,
}

impl SocketMultiplexer {
    pub async fn new(config: &CourierConfig, stats: Arc<TransportStats>) -> anyhow::Result<Arc<SocketMultiplexer>> {
        config.validate()?;

        let interfaces = enumerate_multicast_interfaces()?;
        if interfaces.is_empty() {
            bail!("no network interface supports multicast");
        }

        let mut sockets = Vec::with_capacity(interfaces.len());
        for iface in &interfaces {
            let socket = Self::create_socket(config, iface)?;
            info!("bound multicast socket on interface {} ({}) to port {}, group {}", iface.name, iface.addr, config.port, config.multicast_group);
            sockets.push(socket);
        }

        Ok(Self::with_sockets(sockets, config.multicast_endpoint(), config, stats))
    }

    /// Sends go to `target` on every socket
    pub(crate) fn with_sockets(sockets: Vec<UdpSocket>, target: SocketAddr, config: &CourierConfig, stats: Arc<TransportStats>) -> Arc<SocketMultiplexer> {
        // a received datagram can never exceed the maximum UDP payload, regardless of the
        //  configured transport size for outbound datagrams
        let receive_buffers = ObjectPool::new(config.buffer_pool_size, || DatagramBuf::with_capacity(crate::config::MAX_IPV4_UDP_PAYLOAD));

        Arc::new(SocketMultiplexer {
            sockets: RwLock::new(sockets.into_iter().map(Arc::new).collect()),
            target,
            receive_buffers,
            is_shutdown: AtomicBool::new(false),
            shutdown: ShutdownToken::new(),
            stats,
        })
    }

    fn create_socket(config: &CourierConfig, iface: &MulticastInterface) -> anyhow::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.set_nonblocking(true)?;

        socket.set_multicast_loop_v4(true)?;
        socket.set_multicast_ttl_v4(config.multicast_ttl)?;
        socket.set_multicast_if_v4(&iface.addr)?;
        socket.join_multicast_v4(&config.multicast_group, &iface.addr)?;

        socket.bind(&SockAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port)))?;

        let std_socket: std::net::UdpSocket = socket.into();
        Ok(UdpSocket::from_std(std_socket)?)
    }

    pub fn num_sockets(&self) -> usize {
        self.sockets.read().unwrap().len()
    }

    fn current_sockets(&self) -> Vec<Arc<UdpSocket>> {
        self.sockets.read().unwrap().clone()
    }

    /// Start a receive loop for every socket, passing each received datagram to the handler.
    ///  Handling happens in a task of its own so the socket is read again right away.
    pub fn start_receiving(self: &Arc<Self>, handler: Arc<dyn DatagramHandler>) {
        for socket in self.current_sockets() {
            let handle = tokio::spawn(self.clone().recv_loop(socket, handler.clone()));
            self.shutdown.add_task(handle);
        }
    }

    async fn recv_loop(self: Arc<Self>, socket: Arc<UdpSocket>, handler: Arc<dyn DatagramHandler>) {
        info!("starting receive loop on {:?}", socket.local_addr().ok());

        let mut stop_signal = self.shutdown.subscribe();
        let mut in_flight = JoinSet::new();
        let mut consecutive_errors: u32 = 0;

        loop {
            let mut buf = self.receive_buffers.take();

            let received = select! {
                _ = stop_signal.cancelled() => break,
                r = socket.recv_from(buf.receive_area()) => r,
            };

            match received {
                Ok((num_read, from)) => {
                    consecutive_errors = 0;
                    buf.set_filled(num_read);
                    trace!("received datagram of {} bytes from {:?}", num_read, from);
                    self.stats.on_datagram_received();

                    let handler = handler.clone();
                    in_flight.spawn(async move {
                        handler.on_datagram(from, &buf).await;
                    });
                }
                Err(e) => {
                    if self.is_shutdown.load(Ordering::Acquire) {
                        debug!("socket error during shutdown: {}", e);
                        break;
                    }
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    let backoff = receive_error_backoff(consecutive_errors);
                    error!("socket error ({} in a row), pausing receive for {:?}: {}", consecutive_errors, backoff, e);
                    select! {
                        _ = stop_signal.cancelled() => break,
                        _ = sleep(backoff) => {}
                    }
                }
            }

            // reap finished handlers without waiting for the others
            while in_flight.try_join_next().is_some() {}
        }

        debug!("receive loop terminated, aborting {} datagrams in flight", in_flight.len());
    }

    /// Stop all receive loops and close the sockets. Sends racing with this are not reported as
    ///  errors.
    pub async fn shutdown(&self) {
        self.is_shutdown.store(true, Ordering::Release);
        self.shutdown.signal_stop();
        self.shutdown.join_all().await;

        self.sockets.write().unwrap().clear();
        info!("socket multiplexer shut down");
    }
}

#[async_trait]
impl DatagramBroadcaster for SocketMultiplexer {
    /// Sends the datagram through all sockets concurrently. All sockets are attempted even if
    ///  one of them fails, and the first error is returned after all sends completed.
    async fn broadcast(&self, datagram: &[u8]) -> anyhow::Result<()> {
        let datagram = Bytes::copy_from_slice(datagram);

        let mut sends = JoinSet::new();
        for socket in self.current_sockets() {
            let datagram = datagram.clone();
            let target = self.target;
            sends.spawn(async move {
                let result = socket.send_to(&datagram, target).await;
                (socket, result)
            });
        }

        let mut first_error: Option<anyhow::Error> = None;
        while let Some(joined) = sends.join_next().await {
            match joined {
                Ok((_, Ok(_))) => self.stats.on_datagram_sent(),
                Ok((socket, Err(e))) => {
                    if self.is_shutdown.load(Ordering::Acquire) {
                        debug!("send failed during shutdown: {}", e);
                        return Ok(());
                    }
                    debug!("error sending datagram on {:?}: {}", socket.local_addr().ok(), e);
                    first_error.get_or_insert(e.into());
                }
                Err(e) => {
                    error!("send task failed: {}", e);
                    first_error.get_or_insert(e.into());
                }
            }
        }

        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

/// Pause after the n-th consecutive receive error: doubling from 10ms, capped at one second
fn receive_error_backoff(consecutive_errors: u32) -> Duration {
    let multiplier = 1u32.checked_shl(consecutive_errors.saturating_sub(1))
        .unwrap_or(u32::MAX)
        .min(100);
    Duration::from_millis(10) * multiplier
}
