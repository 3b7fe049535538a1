use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

use courier::config::CourierConfig;
use courier::courier::Courier;
use courier::dispatcher::{InboundPayloadEvent, PayloadHandler};
use courier::identity::LocalIdentity;
use courier::packet::PacketDto;
use courier::peer::PeerDiscoveryNotifier;
use courier::test_util::LoopbackNetwork;
use courier::transport::DatagramHandler;

struct ChannelPayloadHandler {
    tx: mpsc::UnboundedSender<InboundPayloadEvent>,
}

#[async_trait]
impl PayloadHandler for ChannelPayloadHandler {
    async fn on_payload(&self, event: InboundPayloadEvent) {
        let _ = self.tx.send(event);
    }
}

struct Node {
    courier: Courier,
    payloads: mpsc::UnboundedReceiver<InboundPayloadEvent>,
    discovery: Arc<PeerDiscoveryNotifier>,
}

fn node(network: &Arc<LoopbackNetwork>, name: &str) -> Node {
    let (tx, payloads) = mpsc::unbounded_channel();
    let discovery = Arc::new(PeerDiscoveryNotifier::new());

    let courier = Courier::with_broadcaster(
        CourierConfig::default_ipv4(),
        Arc::new(LocalIdentity::random(name)),
        network.clone(),
        Arc::new(ChannelPayloadHandler { tx }),
        discovery.clone(),
    ).unwrap();
    network.register(courier.datagram_handler());

    Node { courier, payloads, discovery }
}

#[tokio::test]
async fn test_nodes_discover_each_other() {
    let network = LoopbackNetwork::new();
    let a = node(&network, "a");
    let b = node(&network, "b");
    let mut a_events = a.discovery.subscribe();

    a.courier.local_identity().set_attribute("role", "leader");
    a.courier.announce().await.unwrap();
    b.courier.announce().await.unwrap();

    let a_id = a.courier.local_identity().id();
    let peer_a = b.courier.peer_table().get(&a_id).unwrap();
    assert!(peer_a.is_discovered());
    assert_eq!(peer_a.identity().name, "a");
    assert_eq!(peer_a.identity().attributes.get("role").map(String::as_str), Some("leader"));

    let event = timeout(Duration::from_secs(1), a_events.recv()).await.unwrap().unwrap();
    assert_eq!(event.peer_id, b.courier.local_identity().id());

    // nodes receive their own announcements through loopback, but do not track themselves
    assert_eq!(a.courier.peer_table().len(), 1);
    assert_eq!(b.courier.peer_table().len(), 1);

    // identity changes are propagated with the next announcement
    a.courier.local_identity().set_name("a2");
    a.courier.announce().await.unwrap();
    assert_eq!(peer_a.identity().name, "a2");
}

#[tokio::test]
async fn test_reliable_multi_part_message() {
    let network = LoopbackNetwork::new();
    let a = node(&network, "a");
    let mut b = node(&network, "b");

    let payload = Bytes::from((0..500_000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>());
    let b_id = b.courier.local_identity().id();
    a.courier.send_to(b_id, payload.clone(), true).await.unwrap();

    let event = timeout(Duration::from_secs(5), b.payloads.recv()).await.unwrap().unwrap();
    assert_eq!(event.sender_id, a.courier.local_identity().id());
    assert_eq!(event.receiver_id, Some(b_id));
    assert_eq!(event.payload, payload);

    let stats = a.courier.stats();
    assert_eq!(stats.multi_part_messages_sent, 1);
    assert_eq!(stats.multi_part_chunks_sent, 9);
    assert_eq!(stats.reliable_sends, 9);
    assert_eq!(stats.reliable_send_attempts, 9);
    assert_eq!(b.courier.stats().messages_reassembled, 1);

    b.courier.shutdown().await;
    assert!(b.payloads.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_lost_datagram_is_resent() {
    let network = LoopbackNetwork::new();
    let a = node(&network, "a");
    let mut b = node(&network, "b");

    network.drop_next(1);
    let b_id = b.courier.local_identity().id();
    a.courier.send_to(b_id, Bytes::from_static(b"second time lucky"), true).await.unwrap();

    let event = b.payloads.recv().await.unwrap();
    assert_eq!(event.payload, Bytes::from_static(b"second time lucky"));
    assert_eq!(a.courier.stats().reliable_send_attempts, 2);
}

#[tokio::test]
async fn test_duplicate_datagram_is_acknowledged_but_delivered_once() {
    let network = LoopbackNetwork::new();
    let mut b = node(&network, "b");

    // a resend after a lost acknowledgement looks exactly like this
    let sender_id = Uuid::new_v4();
    let packet = PacketDto::payload(sender_id, Some(b.courier.local_identity().id()), Bytes::from_static(b"once"), true);
    let datagram = packet.to_bytes().unwrap();
    let from = "10.0.0.1:21337".parse().unwrap();

    let handler = b.courier.datagram_handler();
    handler.on_datagram(from, &datagram).await;
    handler.on_datagram(from, &datagram).await;

    assert_eq!(network.num_delivered(), 2);
    let event = b.payloads.recv().await.unwrap();
    assert_eq!(event.message_id, packet.id);
    assert_eq!(event.sender_id, sender_id);
    assert!(b.payloads.try_recv().is_err());
}

#[tokio::test]
async fn test_broadcast_reaches_all_other_nodes() {
    let network = LoopbackNetwork::new();
    let mut a = node(&network, "a");
    let mut b = node(&network, "b");
    let mut c = node(&network, "c");

    a.courier.broadcast(Bytes::from_static(b"to everyone"), false).await.unwrap();

    for receiver in [&mut b, &mut c] {
        let event = receiver.payloads.recv().await.unwrap();
        assert_eq!(event.receiver_id, None);
        assert_eq!(event.payload, Bytes::from_static(b"to everyone"));
    }
    assert!(a.payloads.try_recv().is_err());
}
