use std::sync::Arc;

use bytes::Bytes;
use tracing::info;
use uuid::Uuid;

use crate::acknowledgement::AcknowledgementCoordinator;
use crate::announcer::Announcer;
use crate::config::CourierConfig;
use crate::dispatcher::{PacketDispatcher, PayloadHandler};
use crate::identity::{LocalIdentity, LocalIdentityProvider};
use crate::packet::PacketDto;
use crate::packet_sender::PacketSender;
use crate::peer::{PeerDiscoverySink, PeerTable};
use crate::shutdown::ShutdownToken;
use crate::stats::{TransportStats, TransportStatsSnapshot};
use crate::transport::multiplexer::SocketMultiplexer;
use crate::transport::{DatagramBroadcaster, DatagramHandler};

/// A running transport instance: everything that is needed to send to and receive from the
///  other nodes in the multicast group, wired together.
///
/// ```no_run
/// use std::sync::Arc;
/// use async_trait::async_trait;
/// use bytes::Bytes;
/// use courier::config::CourierConfig;
/// use courier::courier::Courier;
/// use courier::dispatcher::{InboundPayloadEvent, PayloadHandler};
/// use courier::identity::LocalIdentity;
/// use courier::peer::PeerDiscoveryNotifier;
///
/// struct Printer;
///
/// #[async_trait]
/// impl PayloadHandler for Printer {
///     async fn on_payload(&self, event: InboundPayloadEvent) {
///         println!("{} bytes from {}", event.payload.len(), event.sender_id);
///     }
/// }
///
/// # async fn run() -> anyhow::Result<()> {
/// let courier = Courier::start(
///     CourierConfig::default_ipv4(),
///     Arc::new(LocalIdentity::random("worker-1")),
///     Arc::new(Printer),
///     Arc::new(PeerDiscoveryNotifier::new()),
/// ).await?;
///
/// courier.broadcast(Bytes::from_static(b"hello"), true).await?;
/// courier.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct Courier {
    config: Arc<CourierConfig>,
    local_identity: Arc<LocalIdentity>,
    sender: PacketSender,
    dispatcher: Arc<PacketDispatcher>,
    peers: Arc<PeerTable>,
    multiplexer: Option<Arc<SocketMultiplexer>>,
    stats: Arc<TransportStats>,
    shutdown: ShutdownToken,
}

impl Courier {
    /// Bind sockets on all multicast capable interfaces, start receiving and start announcing
    ///  the local identity
    pub async fn start(
        config: CourierConfig,
        local_identity: Arc<LocalIdentity>,
        payload_handler: Arc<dyn PayloadHandler>,
        discovery_sink: Arc<dyn PeerDiscoverySink>,
    ) -> anyhow::Result<Courier> {
        let stats = Arc::new(TransportStats::new());
        let multiplexer = SocketMultiplexer::new(&config, stats.clone()).await?;

        let mut courier = Self::build(config, local_identity, multiplexer.clone(), payload_handler, discovery_sink, stats)?;
        multiplexer.start_receiving(courier.dispatcher.clone());
        courier.multiplexer = Some(multiplexer);
        courier.spawn_announcer();

        info!("node {} started", courier.local_identity.id());
        Ok(courier)
    }

    /// Build the stack on top of a given broadcaster, without sockets and without an announce
    ///  loop. Inbound datagrams are passed to [Courier::datagram_handler] by the caller.
    pub fn with_broadcaster(
        config: CourierConfig,
        local_identity: Arc<LocalIdentity>,
        broadcaster: Arc<dyn DatagramBroadcaster>,
        payload_handler: Arc<dyn PayloadHandler>,
        discovery_sink: Arc<dyn PeerDiscoverySink>,
    ) -> anyhow::Result<Courier> {
        let stats = Arc::new(TransportStats::new());
        Self::build(config, local_identity, broadcaster, payload_handler, discovery_sink, stats)
    }

    fn build(
        config: CourierConfig,
        local_identity: Arc<LocalIdentity>,
        broadcaster: Arc<dyn DatagramBroadcaster>,
        payload_handler: Arc<dyn PayloadHandler>,
        discovery_sink: Arc<dyn PeerDiscoverySink>,
        stats: Arc<TransportStats>,
    ) -> anyhow::Result<Courier> {
        config.validate()?;
        let config = Arc::new(config);

        let shutdown = ShutdownToken::new();
        let acknowledgements = AcknowledgementCoordinator::new();
        let peers = Arc::new(PeerTable::new(discovery_sink));
        let sender = PacketSender::new(config.clone(), broadcaster, acknowledgements.clone(), shutdown.subscribe(), stats.clone());
        let dispatcher = PacketDispatcher::new(
            local_identity.id(),
            &config,
            sender.clone(),
            acknowledgements,
            peers.clone(),
            payload_handler,
            shutdown.subscribe(),
            stats.clone(),
        );

        Ok(Courier {
            config,
            local_identity,
            sender,
            dispatcher,
            peers,
            multiplexer: None,
            stats,
            shutdown,
        })
    }

    fn spawn_announcer(&self) {
        let announcer = Announcer::new(
            self.local_identity.clone(),
            self.sender.clone(),
            self.config.announce_interval,
            self.shutdown.subscribe(),
        );
        self.shutdown.add_task(tokio::spawn(announcer.run()));
    }

    /// The entry point for inbound datagrams
    pub fn datagram_handler(&self) -> Arc<dyn DatagramHandler> {
        self.dispatcher.clone()
    }

    /// Broadcast the local identity once, independent of the announce loop
    pub async fn announce(&self) -> anyhow::Result<()> {
        let announcement = PacketDto::announcement(self.local_identity.local_identity());
        self.sender.send(&announcement).await
    }

    pub async fn send(&self, packet: &PacketDto) -> anyhow::Result<()> {
        self.sender.send(packet).await
    }

    /// Send a payload to a single node. A reliable send returns when the receiver acknowledged it.
    pub async fn send_to(&self, receiver_id: Uuid, payload: Bytes, reliable: bool) -> anyhow::Result<()> {
        let packet = PacketDto::payload(self.local_identity.id(), Some(receiver_id), payload, reliable);
        self.sender.send(&packet).await
    }

    /// Send a payload to all nodes. A reliable broadcast returns when the first node acknowledged
    ///  it, there is no tracking of individual receivers.
    pub async fn broadcast(&self, payload: Bytes, reliable: bool) -> anyhow::Result<()> {
        let packet = PacketDto::payload(self.local_identity.id(), None, payload, reliable);
        self.sender.send(&packet).await
    }

    pub fn peer_table(&self) -> &Arc<PeerTable> {
        &self.peers
    }

    pub fn local_identity(&self) -> &Arc<LocalIdentity> {
        &self.local_identity
    }

    pub fn stats(&self) -> TransportStatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop announcing and receiving. Pending reliable sends fail with
    ///  [SendCancelled](crate::packet_sender::SendCancelled), incomplete multi-part messages are
    ///  discarded.
    pub async fn shutdown(&self) {
        info!("shutting down node {}", self.local_identity.id());
        self.shutdown.signal_stop();
        if let Some(multiplexer) = &self.multiplexer {
            multiplexer.shutdown().await;
        }
        self.shutdown.join_all().await;
        self.dispatcher.shutdown().await;
    }
}
