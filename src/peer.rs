use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::identity::Identity;
use crate::packet::AnnouncementDto;
use crate::revision_counter::RevisionCounterImpl;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PeerDiscoveryEvent {
    pub peer_id: Uuid,
    /// the peer's identity at the time of discovery
    pub identity: Identity,
}

/// Receives an event for every peer the first time it is discovered
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PeerDiscoverySink: Send + Sync + 'static {
    async fn on_peer_discovered(&self, event: PeerDiscoveryEvent);
}

/// A [PeerDiscoverySink] that publishes discovery events to any number of subscribers
pub struct PeerDiscoveryNotifier {
    sender: broadcast::Sender<PeerDiscoveryEvent>,
}

impl PeerDiscoveryNotifier {
    pub fn new() -> PeerDiscoveryNotifier {
        let (sender, _) = broadcast::channel(128);

        PeerDiscoveryNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerDiscoveryEvent> {
        self.sender.subscribe()
    }
}

impl Default for PeerDiscoveryNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerDiscoverySink for PeerDiscoveryNotifier {
    async fn on_peer_discovered(&self, event: PeerDiscoveryEvent) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}

/// The local view of a single remote node: its identity as far as it was announced, and whether
///  it was discovered yet.
pub struct PeerContext {
    peer_id: Uuid,
    identity: Mutex<Identity>,
    revisions: RevisionCounterImpl,
    discovered: AtomicBool,
    discovery_lock: tokio::sync::Mutex<()>,
    discovery_latch: watch::Sender<bool>,
    discovery_sink: Arc<dyn PeerDiscoverySink>,
}

impl PeerContext {
    pub fn new(peer_id: Uuid, discovery_sink: Arc<dyn PeerDiscoverySink>) -> PeerContext {
        let (discovery_latch, _) = watch::channel(false);

        PeerContext {
            peer_id,
            identity: Mutex::new(Identity::unknown(peer_id)),
            revisions: RevisionCounterImpl::new(),
            discovered: AtomicBool::new(false),
            discovery_lock: Default::default(),
            discovery_latch,
            discovery_sink,
        }
    }

    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    pub fn identity(&self) -> Identity {
        self.identity.lock().unwrap().clone()
    }

    pub fn is_discovered(&self) -> bool {
        self.discovered.load(Ordering::Acquire)
    }

    /// Apply an announced identity if it is newer than what we have. The first announcement
    ///  that is applied discovers the peer: this happens exactly once per peer, even with
    ///  concurrent announcements.
    ///
    /// Returns `true` if the announcement was applied, `false` if it was stale.
    pub async fn handle_announcement(&self, announcement: &AnnouncementDto) -> bool {
        let applied = self.identity.lock().unwrap()
            .update_from(&announcement.identity, &self.revisions);
        if !applied {
            return false;
        }

        if self.is_discovered() {
            return true;
        }

        let _guard = self.discovery_lock.lock().await;
        if self.is_discovered() {
            return true;
        }

        let identity = self.identity();
        info!("discovered peer {}", identity);
        self.discovered.store(true, Ordering::Release);
        self.discovery_sink.on_peer_discovered(PeerDiscoveryEvent {
            peer_id: self.peer_id,
            identity,
        }).await;
        self.discovery_latch.send_replace(true);
        true
    }

    /// Completes when the peer is discovered, immediately if it was discovered before
    pub async fn wait_for_discovery(&self) {
        let mut latch = self.discovery_latch.subscribe();
        // the sender is owned by self, so it can not be dropped while we wait
        let _ = latch.wait_for(|discovered| *discovered).await;
    }
}

/// All peers known to the local node, by node id
pub struct PeerTable {
    peers: RwLock<FxHashMap<Uuid, Arc<PeerContext>>>,
    discovery_sink: Arc<dyn PeerDiscoverySink>,
}

impl PeerTable {
    pub fn new(discovery_sink: Arc<dyn PeerDiscoverySink>) -> PeerTable {
        PeerTable {
            peers: Default::default(),
            discovery_sink,
        }
    }

    pub fn get(&self, peer_id: &Uuid) -> Option<Arc<PeerContext>> {
        self.peers.read().unwrap().get(peer_id).cloned()
    }

    /// If several callers race to add the same peer, exactly one context is created and all
    ///  callers get that one.
    pub fn get_or_add(&self, peer_id: Uuid) -> Arc<PeerContext> {
        if let Some(peer) = self.get(&peer_id) {
            return peer;
        }

        let mut peers = self.peers.write().unwrap();
        peers.entry(peer_id)
            .or_insert_with(|| {
                debug!("new peer context for {}", peer_id);
                Arc::new(PeerContext::new(peer_id, self.discovery_sink.clone()))
            })
            .clone()
    }

    pub fn peers(&self) -> Vec<Arc<PeerContext>> {
        self.peers.read().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn handle_announcement(&self, announcement: &AnnouncementDto) -> bool {
        self.get_or_add(announcement.identity.id)
            .handle_announcement(announcement)
            .await
    }
}
