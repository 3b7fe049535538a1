use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::select;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::acknowledgement::{AcknowledgementCoordinator, ExpectationOutcome};
use crate::config::CourierConfig;
use crate::packet::{MultiPartChunkDto, PacketDto, SerError};
use crate::shutdown::ShutdownSignal;
use crate::stats::TransportStats;
use crate::transport::DatagramBroadcaster;
use crate::util::datagram_buf::DatagramBuf;
use crate::util::object_pool::ObjectPool;
use crate::util::safe_converter::PrecheckedCast;

/// Returned by a reliable send that was cancelled by shutdown before it was acknowledged
#[derive(Debug, thiserror::Error, Eq, PartialEq)]
#[error("reliable send of message {0} was cancelled before it was acknowledged")]
pub struct SendCancelled(pub Uuid);

/// The PacketSender decides for every outbound message how it goes on the wire:
///
/// * a message that fits into a single datagram is sent as is, either once (unreliable) or
///   repeatedly with exponential backoff until it is acknowledged (reliable)
/// * a message that is too big is serialized, split into chunks, and every chunk is sent in an
///   envelope of its own, inheriting the original message's reliability
///
/// PacketSender is cheap to clone, all clones share the same state.
#[derive(Clone)]
pub struct PacketSender {
    config: Arc<CourierConfig>,
    broadcaster: Arc<dyn DatagramBroadcaster>,
    acknowledgements: AcknowledgementCoordinator,
    send_buffers: Arc<ObjectPool<DatagramBuf>>,
    shutdown: ShutdownSignal,
    stats: Arc<TransportStats>,
}

impl PacketSender {
    pub fn new(
        config: Arc<CourierConfig>,
        broadcaster: Arc<dyn DatagramBroadcaster>,
        acknowledgements: AcknowledgementCoordinator,
        shutdown: ShutdownSignal,
        stats: Arc<TransportStats>,
    ) -> PacketSender {
        let max_transport_size = config.max_transport_size;
        let send_buffers = ObjectPool::new(config.buffer_pool_size, move || DatagramBuf::with_capacity(max_transport_size));

        PacketSender {
            config,
            broadcaster,
            acknowledgements,
            send_buffers,
            shutdown,
            stats,
        }
    }

    /// Send a message, returning when it was sent (unreliable) or acknowledged (reliable).
    ///
    /// A reliable send is retried until it is acknowledged, and there is no timeout: it fails
    ///  only with [SendCancelled] on shutdown.
    pub async fn send(&self, packet: &PacketDto) -> anyhow::Result<()> {
        let mut buf = self.send_buffers.take();

        match packet.ser_into(&mut *buf) {
            Ok(()) => self.send_datagram(packet, &buf).await,
            Err(SerError::CapacityExceeded { required, capacity }) => {
                drop(buf);
                debug!("message {} requires {} bytes, exceeding the transport size of {}: sending as multi-part message", packet.id, required, capacity);
                self.send_multi_part(packet).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn send_datagram(&self, packet: &PacketDto, datagram: &[u8]) -> anyhow::Result<()> {
        if packet.is_reliable() {
            self.send_reliably(packet.id, datagram).await
        }
        else {
            trace!("sending {:?}", packet);
            self.broadcaster.broadcast(datagram).await
        }
    }

    async fn send_reliably(&self, message_id: Uuid, datagram: &[u8]) -> anyhow::Result<()> {
        let mut expectation = self.acknowledgements.expect(message_id, self.shutdown.clone())?;

        let mut send_count: u32 = 0;
        let outcome = loop {
            send_count += 1;
            if let Err(e) = self.broadcaster.broadcast(datagram).await {
                warn!("error sending reliable message {} (attempt {}): {}", message_id, send_count, e);
            }

            let delay = resend_delay(self.config.resend_base_delay, self.config.resend_max_multiplier, send_count);
            select! {
                biased;
                outcome = expectation.wait() => break outcome,
                _ = sleep(delay) => {
                    trace!("no acknowledgement for {} after {:?}, resending", message_id, delay);
                }
            }
        };

        self.stats.on_reliable_send_completed(send_count);
        match outcome {
            ExpectationOutcome::Acknowledged => {
                trace!("message {} acknowledged after {} attempts", message_id, send_count);
                Ok(())
            }
            ExpectationOutcome::Cancelled => {
                debug!("reliable send of {} cancelled after {} attempts", message_id, send_count);
                Err(SendCancelled(message_id).into())
            }
        }
    }

    async fn send_multi_part(&self, packet: &PacketDto) -> anyhow::Result<()> {
        let serialized = packet.to_bytes()?;
        if serialized.len() > u32::MAX as usize {
            return Err(SerError::Schema(format!("message of {} bytes is too big for a multi-part message", serialized.len())).into());
        }

        let chunks = split_into_chunks(&serialized, self.config.multi_part_chunk_size);
        debug!("sending message {} as {} chunks", packet.id, chunks.len());
        self.stats.on_multi_part_message_sent();

        let admission = Arc::new(Semaphore::new(self.config.multi_part_concurrency_limit));
        let mut stop_signal = self.shutdown.clone();
        let mut chunk_sends = JoinSet::new();
        let mut first_error: Option<anyhow::Error> = None;

        for chunk in chunks {
            let permit = select! {
                permit = admission.clone().acquire_owned() => permit?,
                _ = stop_signal.cancelled() => {
                    first_error.get_or_insert(SendCancelled(packet.id).into());
                    break;
                }
            };

            let envelope = packet.chunk_envelope(chunk);
            let sender = self.clone();
            chunk_sends.spawn(async move {
                let _permit = permit;
                sender.send_chunk(&envelope).await
            });

            while let Some(result) = chunk_sends.try_join_next() {
                Self::keep_first_error(&mut first_error, result);
            }
        }

        while let Some(result) = chunk_sends.join_next().await {
            Self::keep_first_error(&mut first_error, result);
        }

        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    fn keep_first_error(first_error: &mut Option<anyhow::Error>, result: Result<anyhow::Result<()>, tokio::task::JoinError>) {
        let result = match result {
            Ok(r) => r,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            first_error.get_or_insert(e);
        }
    }

    async fn send_chunk(&self, envelope: &PacketDto) -> anyhow::Result<()> {
        let mut buf = self.send_buffers.take();
        // configuration validation ensures that a chunk's envelope fits into a datagram
        envelope.ser_into(&mut *buf)?;
        self.stats.on_multi_part_chunk_sent();
        self.send_datagram(envelope, &buf).await
    }
}

/// Delay after the n-th (1-based) send attempt of a reliable message: doubling with every
///  attempt, capped at `max_multiplier` times the base delay
pub fn resend_delay(base: Duration, max_multiplier: u32, attempt: u32) -> Duration {
    let multiplier = 1u32.checked_shl(attempt.saturating_sub(1))
        .unwrap_or(u32::MAX)
        .min(max_multiplier);
    base * multiplier
}

/// Split a serialized message into chunks of `chunk_size` bytes (the last one holding the
///  remainder), sharing a fresh multi-part id. The chunks share the underlying buffer.
pub fn split_into_chunks(serialized: &Bytes, chunk_size: usize) -> Vec<MultiPartChunkDto> {
    let multi_part_id = Uuid::new_v4();
    let chunk_count = serialized.len().div_ceil(chunk_size);

    (0..chunk_count)
        .map(|chunk_index| {
            let start = chunk_index * chunk_size;
            let end = (start + chunk_size).min(serialized.len());
            MultiPartChunkDto {
                multi_part_id,
                chunk_index: chunk_index.prechecked_cast(),
                chunk_count: chunk_count.prechecked_cast(),
                body_offset: start.prechecked_cast(),
                body_length: (end - start).prechecked_cast(),
                body: serialized.slice(start..end),
            }
        })
        .collect()
}
