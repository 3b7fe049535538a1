use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::select;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::sleep;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::packet::MultiPartChunkDto;
use crate::shutdown::ShutdownSignal;
use crate::stats::TransportStats;
use crate::util::object_pool::{ObjectPool, Poolable};
use crate::util::safe_converter::SafeCast;

/// A reassembled multi-part message, handed out from a pool
#[derive(Default, Debug)]
pub struct InboundDataEvent {
    pub data: Bytes,
}

impl Poolable for InboundDataEvent {
    fn reset(&mut self) {
        self.data = Bytes::new();
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait InboundDataHandler: Send + Sync + 'static {
    async fn on_inbound_data(&self, event: &InboundDataEvent);
}

/// Reconstructs messages that were split into chunks.
///
/// There is a reassembly context per multi-part id, created by whichever chunk arrives first.
///  Contexts are removed when they are complete, or after a fixed expiry time regardless of
///  progress. Incomplete messages are dropped silently on expiry: it is up to the sender to
///  notice that chunks were not acknowledged.
pub struct MultiPartReassembler {
    inner: Arc<ReassemblerInner>,
}

struct ReassemblerInner {
    contexts: Mutex<FxHashMap<Uuid, ReassemblyEntry>>,
    next_serial: AtomicU64,
    expiry: Duration,
    /// chunks announcing more than this are dropped before a context is allocated for them
    max_chunk_count: usize,
    events: Arc<ObjectPool<InboundDataEvent>>,
    handler: Arc<dyn InboundDataHandler>,
    dispatch_tasks: Mutex<JoinSet<()>>,
    shutdown: ShutdownSignal,
    stats: Arc<TransportStats>,
}

struct ReassemblyEntry {
    context: Arc<ChunkReassemblyContext>,
    /// distinguishes this context from a later one for the same multi-part id
    serial: u64,
    expiry: JoinHandle<()>,
}

impl MultiPartReassembler {
    pub fn new(expiry: Duration, max_chunk_count: usize, pool_size: usize, handler: Arc<dyn InboundDataHandler>, shutdown: ShutdownSignal, stats: Arc<TransportStats>) -> MultiPartReassembler {
        MultiPartReassembler {
            inner: Arc::new(ReassemblerInner {
                contexts: Default::default(),
                next_serial: AtomicU64::new(0),
                expiry,
                max_chunk_count,
                events: ObjectPool::new(pool_size, InboundDataEvent::default),
                handler,
                dispatch_tasks: Mutex::new(JoinSet::new()),
                shutdown,
                stats,
            }),
        }
    }

    pub fn handle_inbound_chunk(&self, chunk: MultiPartChunkDto) {
        if chunk.chunk_count == 0 || chunk.chunk_index >= chunk.chunk_count {
            debug!("dropping chunk with index {} of {}", chunk.chunk_index, chunk.chunk_count);
            return;
        }

        let chunk_count: usize = chunk.chunk_count.safe_cast();
        if chunk_count > self.inner.max_chunk_count {
            debug!("dropping {:?}: chunk count exceeds the maximum of {}", chunk, self.inner.max_chunk_count);
            return;
        }

        let multi_part_id = chunk.multi_part_id;
        let (context, serial) = self.get_or_create_context(&chunk);

        if context.chunk_count() != chunk_count {
            debug!("chunk count {} of {:?} does not match reassembly context with {} chunks - dropping", chunk.chunk_count, chunk, context.chunk_count());
            return;
        }

        trace!("received {:?}", chunk);
        if let Some(chunks) = context.add_chunk(chunk) {
            self.on_complete(multi_part_id, serial, chunks);
        }
    }

    fn get_or_create_context(&self, chunk: &MultiPartChunkDto) -> (Arc<ChunkReassemblyContext>, u64) {
        let mut contexts = self.inner.contexts.lock().unwrap();
        match contexts.entry(chunk.multi_part_id) {
            Entry::Occupied(e) => (e.get().context.clone(), e.get().serial),
            Entry::Vacant(e) => {
                debug!("starting reassembly of multi-part message {} with {} chunks", chunk.multi_part_id, chunk.chunk_count);
                let serial = self.inner.next_serial.fetch_add(1, Ordering::Relaxed);
                let context = Arc::new(ChunkReassemblyContext::new(chunk.chunk_count.safe_cast()));
                e.insert(ReassemblyEntry {
                    context: context.clone(),
                    serial,
                    expiry: self.spawn_expiry(chunk.multi_part_id, serial),
                });
                (context, serial)
            }
        }
    }

    fn spawn_expiry(&self, multi_part_id: Uuid, serial: u64) -> JoinHandle<()> {
        let inner: Weak<ReassemblerInner> = Arc::downgrade(&self.inner);
        let expiry = self.inner.expiry;
        let mut stop_signal = self.inner.shutdown.clone();

        tokio::spawn(async move {
            select! {
                _ = sleep(expiry) => {}
                _ = stop_signal.cancelled() => return,
            }
            if let Some(inner) = inner.upgrade() {
                inner.remove_expired(multi_part_id, serial);
            }
        })
    }

    fn on_complete(&self, multi_part_id: Uuid, serial: u64, chunks: Vec<MultiPartChunkDto>) {
        {
            let mut contexts = self.inner.contexts.lock().unwrap();
            if contexts.get(&multi_part_id).is_some_and(|e| e.serial == serial) {
                if let Some(entry) = contexts.remove(&multi_part_id) {
                    entry.expiry.abort();
                }
            }
        }

        let total_len = chunks.iter()
            .map(|c| -> usize { c.body_length.safe_cast() })
            .sum::<usize>();
        let mut data = BytesMut::with_capacity(total_len);
        for chunk in &chunks {
            data.put_slice(&chunk.body);
        }
        debug!("reassembled multi-part message {} with {} bytes from {} chunks", multi_part_id, total_len, chunks.len());
        self.inner.stats.on_message_reassembled();

        let mut event = self.inner.events.take();
        event.data = data.freeze();
        let handler = self.inner.handler.clone();

        let mut dispatch_tasks = self.inner.dispatch_tasks.lock().unwrap();
        while dispatch_tasks.try_join_next().is_some() {}
        dispatch_tasks.spawn(async move {
            handler.on_inbound_data(&event).await;
        });
    }

    pub fn num_pending(&self) -> usize {
        self.inner.contexts.lock().unwrap().len()
    }

    /// Discard all incomplete messages, and wait for reassembled messages being dispatched
    pub async fn shutdown(&self) {
        for (_, entry) in self.inner.contexts.lock().unwrap().drain() {
            entry.expiry.abort();
        }

        let mut dispatch_tasks = std::mem::take(&mut *self.inner.dispatch_tasks.lock().unwrap());
        while dispatch_tasks.join_next().await.is_some() {}
    }
}

impl ReassemblerInner {
    fn remove_expired(&self, multi_part_id: Uuid, serial: u64) {
        let mut contexts = self.contexts.lock().unwrap();
        if contexts.get(&multi_part_id).is_some_and(|e| e.serial == serial) {
            contexts.remove(&multi_part_id);
            debug!("multi-part message {} expired before it was complete - discarding", multi_part_id);
            self.stats.on_reassembly_expired();
        }
    }
}

/// The chunks received so far for a single multi-part message
struct ChunkReassemblyContext {
    slots: Vec<OnceLock<MultiPartChunkDto>>,
    remaining: AtomicUsize,
}

impl ChunkReassemblyContext {
    fn new(chunk_count: usize) -> ChunkReassemblyContext {
        ChunkReassemblyContext {
            slots: (0..chunk_count).map(|_| OnceLock::new()).collect(),
            remaining: AtomicUsize::new(chunk_count),
        }
    }

    fn chunk_count(&self) -> usize {
        self.slots.len()
    }

    /// Returns all chunks in index order if this chunk completed the message. Chunks for an
    ///  index that is already filled are ignored.
    fn add_chunk(&self, chunk: MultiPartChunkDto) -> Option<Vec<MultiPartChunkDto>> {
        let index: usize = chunk.chunk_index.safe_cast();
        if self.slots[index].set(chunk).is_err() {
            trace!("duplicate chunk {} - ignoring", index);
            return None;
        }

        if self.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
            return None;
        }
        Some(self.slots.iter()
            .filter_map(|slot| slot.get().cloned())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use crate::packet_sender::split_into_chunks;
    use crate::shutdown::ShutdownToken;
    use super::*;

    struct ChannelHandler {
        tx: mpsc::UnboundedSender<Bytes>,
    }

    #[async_trait]
    impl InboundDataHandler for ChannelHandler {
        async fn on_inbound_data(&self, event: &InboundDataEvent) {
            let _ = self.tx.send(event.data.clone());
        }
    }

    const MAX_CHUNK_COUNT: usize = 1024;

    fn reassembler(shutdown: &ShutdownToken) -> (MultiPartReassembler, mpsc::UnboundedReceiver<Bytes>, Arc<TransportStats>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(TransportStats::new());
        let reassembler = MultiPartReassembler::new(
            Duration::from_secs(300),
            MAX_CHUNK_COUNT,
            4,
            Arc::new(ChannelHandler { tx }),
            shutdown.subscribe(),
            stats.clone(),
        );
        (reassembler, rx, stats)
    }

    fn test_data(len: usize) -> Bytes {
        (0..len).map(|i| (i % 253) as u8).collect::<Vec<_>>().into()
    }

    #[rstest]
    #[case::in_order(vec![0, 1, 2, 3, 4])]
    #[case::reverse(vec![4, 3, 2, 1, 0])]
    #[case::interleaved(vec![1, 3, 0, 4, 2])]
    #[case::last_first(vec![4, 0, 1, 2, 3])]
    #[case::with_duplicates(vec![2, 2, 0, 4, 0, 1, 3])]
    #[tokio::test]
    async fn test_any_order_yields_same_bytes(#[case] order: Vec<usize>) {
        let shutdown = ShutdownToken::new();
        let (reassembler, mut rx, _) = reassembler(&shutdown);

        let data = test_data(4 * 100 + 17);
        let chunks = split_into_chunks(&data, 100);
        assert_eq!(chunks.len(), 5);

        for i in order {
            reassembler.handle_inbound_chunk(chunks[i].clone());
        }

        let reassembled = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(reassembled, data);
        assert_eq!(reassembler.num_pending(), 0);
    }

    #[tokio::test]
    async fn test_large_message_in_reverse_order() {
        let shutdown = ShutdownToken::new();
        let (reassembler, mut rx, stats) = reassembler(&shutdown);

        let data = test_data(2_000_000);
        let chunks = split_into_chunks(&data, 60_000);
        assert_eq!(chunks.len(), 34);
        assert_eq!(chunks[33].body_length, 20_000);

        for chunk in chunks.into_iter().rev() {
            reassembler.handle_inbound_chunk(chunk);
        }

        let reassembled = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(reassembled.len(), 2_000_000);
        assert_eq!(reassembled, data);
        assert_eq!(stats.snapshot().messages_reassembled, 1);
    }

    #[tokio::test]
    async fn test_completes_exactly_once() {
        let shutdown = ShutdownToken::new();
        let (reassembler, mut rx, stats) = reassembler(&shutdown);

        let chunks = split_into_chunks(&test_data(250), 100);
        for chunk in &chunks {
            reassembler.handle_inbound_chunk(chunk.clone());
        }
        // duplicates arriving after completion
        reassembler.handle_inbound_chunk(chunks[0].clone());
        reassembler.handle_inbound_chunk(chunks[2].clone());

        timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        reassembler.shutdown().await;
        assert!(rx.try_recv().is_err());
        assert_eq!(stats.snapshot().messages_reassembled, 1);
    }

    #[tokio::test]
    async fn test_mock_handler_is_called_once() {
        let shutdown = ShutdownToken::new();
        let data = test_data(10);
        let expected = data.clone();

        let mut handler = MockInboundDataHandler::new();
        handler.expect_on_inbound_data()
            .withf(move |event| event.data == expected)
            .once()
            .return_const(());

        let reassembler = MultiPartReassembler::new(Duration::from_secs(300), MAX_CHUNK_COUNT, 4, Arc::new(handler), shutdown.subscribe(), Arc::new(TransportStats::new()));
        for chunk in split_into_chunks(&data, 3) {
            reassembler.handle_inbound_chunk(chunk);
        }
        reassembler.shutdown().await;
    }

    #[tokio::test]
    async fn test_mismatched_chunk_count_is_dropped() {
        let shutdown = ShutdownToken::new();
        let (reassembler, mut rx, _) = reassembler(&shutdown);

        let chunks = split_into_chunks(&test_data(200), 100);
        reassembler.handle_inbound_chunk(chunks[0].clone());

        let mut inconsistent = chunks[1].clone();
        inconsistent.chunk_count = 3;
        reassembler.handle_inbound_chunk(inconsistent);
        assert_eq!(reassembler.num_pending(), 1);

        reassembler.handle_inbound_chunk(chunks[1].clone());
        timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    }

    #[rstest]
    #[case::just_above_limit(MAX_CHUNK_COUNT as u32 + 1)]
    #[case::max_u32(u32::MAX)]
    #[tokio::test]
    async fn test_excessive_chunk_count_is_dropped(#[case] chunk_count: u32) {
        let shutdown = ShutdownToken::new();
        let (reassembler, mut rx, _) = reassembler(&shutdown);

        reassembler.handle_inbound_chunk(MultiPartChunkDto {
            multi_part_id: Uuid::new_v4(),
            chunk_index: 0,
            chunk_count,
            body_offset: 0,
            body_length: 1,
            body: Bytes::from_static(b"x"),
        });
        assert_eq!(reassembler.num_pending(), 0);

        // the limit itself is accepted
        let mut chunks = split_into_chunks(&test_data(MAX_CHUNK_COUNT), 1);
        assert_eq!(chunks.len(), MAX_CHUNK_COUNT);
        let last = chunks.pop().unwrap();
        for chunk in chunks {
            reassembler.handle_inbound_chunk(chunk);
        }
        assert_eq!(reassembler.num_pending(), 1);
        reassembler.handle_inbound_chunk(last);
        timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_independent_messages() {
        let shutdown = ShutdownToken::new();
        let (reassembler, mut rx, _) = reassembler(&shutdown);

        let a = split_into_chunks(&Bytes::from_static(b"aaaa"), 2);
        let b = split_into_chunks(&Bytes::from_static(b"bbbb"), 2);
        reassembler.handle_inbound_chunk(a[0].clone());
        reassembler.handle_inbound_chunk(b[1].clone());
        assert_eq!(reassembler.num_pending(), 2);

        reassembler.handle_inbound_chunk(b[0].clone());
        assert_eq!(timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap(), Bytes::from_static(b"bbbb"));
        assert_eq!(reassembler.num_pending(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_starts_new_context() {
        let shutdown = ShutdownToken::new();
        let (reassembler, mut rx, stats) = reassembler(&shutdown);

        let chunks = split_into_chunks(&test_data(200), 100);
        reassembler.handle_inbound_chunk(chunks[0].clone());
        assert_eq!(reassembler.num_pending(), 1);

        sleep(Duration::from_secs(299)).await;
        assert_eq!(reassembler.num_pending(), 1);

        sleep(Duration::from_secs(2)).await;
        assert_eq!(reassembler.num_pending(), 0);
        assert_eq!(stats.snapshot().reassemblies_expired, 1);

        // the late chunk does not complete the expired message
        reassembler.handle_inbound_chunk(chunks[1].clone());
        assert_eq!(reassembler.num_pending(), 1);
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());

        // ... but the new context completes normally
        reassembler.handle_inbound_chunk(chunks[0].clone());
        assert_eq!(rx.recv().await.unwrap().len(), 200);
        assert_eq!(reassembler.num_pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_cancels_expiry() {
        let shutdown = ShutdownToken::new();
        let (reassembler, mut rx, stats) = reassembler(&shutdown);

        let chunks = split_into_chunks(&test_data(200), 100);
        reassembler.handle_inbound_chunk(chunks[0].clone());
        reassembler.handle_inbound_chunk(chunks[1].clone());
        rx.recv().await.unwrap();

        sleep(Duration::from_secs(600)).await;
        assert_eq!(stats.snapshot().reassemblies_expired, 0);
    }

    #[tokio::test]
    async fn test_shutdown_discards_pending() {
        let shutdown = ShutdownToken::new();
        let (reassembler, _rx, _) = reassembler(&shutdown);

        let chunks = split_into_chunks(&test_data(200), 100);
        reassembler.handle_inbound_chunk(chunks[0].clone());

        shutdown.signal_stop();
        reassembler.shutdown().await;
        assert_eq!(reassembler.num_pending(), 0);
    }
}
