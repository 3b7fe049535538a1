use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for observing a transport instance. All updates are relaxed: the counters are
///  independent of each other, and a snapshot is not an atomic view across all of them.
#[derive(Default, Debug)]
pub struct TransportStats {
    datagrams_sent: AtomicU64,
    datagrams_received: AtomicU64,
    reliable_sends: AtomicU64,
    reliable_send_attempts: AtomicU64,
    multi_part_messages_sent: AtomicU64,
    multi_part_chunks_sent: AtomicU64,
    messages_reassembled: AtomicU64,
    reassemblies_expired: AtomicU64,
}

#[derive(Clone, Copy, Default, Debug, Eq, PartialEq)]
pub struct TransportStatsSnapshot {
    pub datagrams_sent: u64,
    pub datagrams_received: u64,
    pub reliable_sends: u64,
    /// sum of send attempts over all completed reliable sends
    pub reliable_send_attempts: u64,
    pub multi_part_messages_sent: u64,
    pub multi_part_chunks_sent: u64,
    pub messages_reassembled: u64,
    pub reassemblies_expired: u64,
}

impl TransportStats {
    pub fn new() -> TransportStats {
        Default::default()
    }

    pub fn on_datagram_sent(&self) {
        self.datagrams_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_datagram_received(&self) {
        self.datagrams_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_reliable_send_completed(&self, num_attempts: u32) {
        self.reliable_sends.fetch_add(1, Ordering::Relaxed);
        self.reliable_send_attempts.fetch_add(num_attempts as u64, Ordering::Relaxed);
    }

    pub fn on_multi_part_message_sent(&self) {
        self.multi_part_messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_multi_part_chunk_sent(&self) {
        self.multi_part_chunks_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_message_reassembled(&self) {
        self.messages_reassembled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_reassembly_expired(&self) {
        self.reassemblies_expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TransportStatsSnapshot {
        TransportStatsSnapshot {
            datagrams_sent: self.datagrams_sent.load(Ordering::Relaxed),
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            reliable_sends: self.reliable_sends.load(Ordering::Relaxed),
            reliable_send_attempts: self.reliable_send_attempts.load(Ordering::Relaxed),
            multi_part_messages_sent: self.multi_part_messages_sent.load(Ordering::Relaxed),
            multi_part_chunks_sent: self.multi_part_chunks_sent.load(Ordering::Relaxed),
            messages_reassembled: self.messages_reassembled.load(Ordering::Relaxed),
            reassemblies_expired: self.reassemblies_expired.load(Ordering::Relaxed),
        }
    }
}
