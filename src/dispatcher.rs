use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use tracing::{debug, span, trace, warn, Instrument, Level};
use uuid::Uuid;

use crate::acknowledgement::AcknowledgementCoordinator;
use crate::config::CourierConfig;
use crate::packet::{PacketBody, PacketDto};
use crate::packet_sender::PacketSender;
use crate::peer::PeerTable;
use crate::reassembler::{InboundDataEvent, InboundDataHandler, MultiPartReassembler};
use crate::shutdown::ShutdownSignal;
use crate::stats::TransportStats;
use crate::transport::DatagramHandler;
use crate::util::dedup::PacketIdFilter;

/// An application payload addressed to this node (or to all nodes)
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InboundPayloadEvent {
    pub message_id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Option<Uuid>,
    pub payload: Bytes,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait PayloadHandler: Send + Sync + 'static {
    async fn on_payload(&self, event: InboundPayloadEvent);
}

/// The PacketDispatcher is the entry point for inbound traffic. It parses datagrams, filters
///  out traffic that is not for this node, acknowledges reliable packets and routes each packet
///  by its body: payloads to the [PayloadHandler], announcements to the [PeerTable],
///  acknowledgements to the [AcknowledgementCoordinator], and chunks to the reassembler.
///  Reassembled messages come back here to be dispatched like any other packet.
pub struct PacketDispatcher {
    local_id: Uuid,
    sender: PacketSender,
    acknowledgements: AcknowledgementCoordinator,
    reassembler: MultiPartReassembler,
    peers: Arc<PeerTable>,
    payload_handler: Arc<dyn PayloadHandler>,
    seen_packet_ids: Mutex<PacketIdFilter>,
}

impl PacketDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_id: Uuid,
        config: &CourierConfig,
        sender: PacketSender,
        acknowledgements: AcknowledgementCoordinator,
        peers: Arc<PeerTable>,
        payload_handler: Arc<dyn PayloadHandler>,
        shutdown: ShutdownSignal,
        stats: Arc<TransportStats>,
    ) -> Arc<PacketDispatcher> {
        Arc::new_cyclic(|dispatcher| PacketDispatcher {
            local_id,
            sender,
            acknowledgements,
            reassembler: MultiPartReassembler::new(
                config.reassembly_expiry,
                config.max_chunk_count(),
                config.buffer_pool_size,
                Arc::new(ReassembledDataForwarder { dispatcher: dispatcher.clone() }),
                shutdown,
                stats,
            ),
            peers,
            payload_handler,
            seen_packet_ids: Mutex::new(PacketIdFilter::new(config.dedup_rotation_threshold)),
        })
    }

    pub fn num_pending_reassemblies(&self) -> usize {
        self.reassembler.num_pending()
    }

    async fn handle_datagram(&self, from: SocketAddr, datagram: &[u8]) {
        match PacketDto::deser(datagram) {
            Ok(packet) => {
                trace!("received {:?} from {:?}", packet, from);
                self.handle_packet(packet, false).await;
            }
            Err(e) => {
                warn!("received unparsable datagram of {} bytes from {:?}: {} - dropping", datagram.len(), from, e);
            }
        }
    }

    /// `from_reassembly` marks packets that were reassembled from chunks: their chunks were
    ///  acknowledged individually, and they must not contain chunks themselves.
    pub async fn handle_packet(&self, packet: PacketDto, from_reassembly: bool) {
        if packet.sender_id == self.local_id {
            trace!("dropping own packet {}", packet.id);
            return;
        }
        if let Some(receiver_id) = packet.receiver_id {
            if receiver_id != self.local_id {
                trace!("dropping packet {} addressed to {}", packet.id, receiver_id);
                return;
            }
        }

        // acknowledge duplicates as well: the sender may have missed the first acknowledgement
        if packet.is_reliable() && !from_reassembly {
            let ack = PacketDto::acknowledgement(self.local_id, &packet);
            if let Err(e) = self.sender.send(&ack).await {
                warn!("error acknowledging packet {}: {}", packet.id, e);
            }
        }

        let is_new = self.seen_packet_ids.lock().unwrap().insert(packet.id);
        if !is_new {
            debug!("dropping duplicate packet {}", packet.id);
            return;
        }

        match packet.body {
            PacketBody::Payload(payload) => {
                self.payload_handler.on_payload(InboundPayloadEvent {
                    message_id: packet.id,
                    sender_id: packet.sender_id,
                    receiver_id: packet.receiver_id,
                    payload,
                }).await;
            }
            PacketBody::Announcement(announcement) => {
                if announcement.identity.id != packet.sender_id {
                    debug!("announcement for {} sent by {} - dropping", announcement.identity.id, packet.sender_id);
                    return;
                }
                self.peers.handle_announcement(&announcement).await;
            }
            PacketBody::Acknowledgement(ack) => {
                self.acknowledgements.on_acknowledgement(ack.message_id);
            }
            PacketBody::MultiPartChunk(chunk) => {
                if from_reassembly {
                    warn!("reassembled message {} is a multi-part chunk itself - dropping", packet.id);
                    return;
                }
                self.reassembler.handle_inbound_chunk(chunk);
            }
        }
    }

    /// Discard incomplete multi-part messages and wait for reassembled ones to be dispatched
    pub async fn shutdown(&self) {
        self.reassembler.shutdown().await;
    }
}

#[async_trait]
impl DatagramHandler for PacketDispatcher {
    async fn on_datagram(&self, from: SocketAddr, datagram: &[u8]) {
        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "datagram_received", ?correlation_id);
        self.handle_datagram(from, datagram)
            .instrument(span)
            .await;
    }
}

/// Feeds reassembled messages back into the dispatcher. This holds a weak reference to break
///  the cycle between the dispatcher and the reassembler it owns.
struct ReassembledDataForwarder {
    dispatcher: Weak<PacketDispatcher>,
}

#[async_trait]
impl InboundDataHandler for ReassembledDataForwarder {
    async fn on_inbound_data(&self, event: &InboundDataEvent) {
        let Some(dispatcher) = self.dispatcher.upgrade() else {
            debug!("dispatcher was dropped - discarding reassembled message");
            return;
        };

        match PacketDto::deser(&event.data) {
            Ok(packet) => dispatcher.handle_packet(packet, true).await,
            Err(e) => warn!("unparsable reassembled message of {} bytes: {} - dropping", event.data.len(), e),
        }
    }
}
