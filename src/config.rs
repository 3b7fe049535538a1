use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use anyhow::bail;

use crate::packet::PacketDto;

/// The largest UDP payload that fits into an IPv4 datagram: `65535 - 20 - 8`
pub const MAX_IPV4_UDP_PAYLOAD: usize = 65_507;

pub struct CourierConfig {
    /// All nodes bind to this port and send to it, there is no per-node port.
    pub port: u16,
    pub multicast_group: Ipv4Addr,
    /// 0 keeps traffic on the local host, 1 restricts it to the local network segment (i.e.
    ///  it is not forwarded by routers).
    pub multicast_ttl: u32,

    /// This is the maximum size of a single serialized envelope. Messages exceeding it are split
    ///  into multi-part chunks.
    ///
    /// The transport relies on IP-level fragmentation for datagrams bigger than the path MTU, so
    ///  this can be (and is by default) the maximum UDP payload rather than something derived
    ///  from the MTU.
    pub max_transport_size: usize,
    /// The number of bytes of a serialized message that go into a single multi-part chunk. This
    ///  must leave room for the chunk's envelope inside `max_transport_size`.
    pub multi_part_chunk_size: usize,
    /// Incomplete multi-part messages are discarded after this time
    pub reassembly_expiry: Duration,

    /// Delay before the first resend of an unacknowledged reliable datagram. The delay doubles
    ///  with every attempt, up to `resend_max_multiplier` times this value.
    pub resend_base_delay: Duration,
    pub resend_max_multiplier: u32,
    /// The maximum number of chunks of a single multi-part message that are in flight (i.e. sent
    ///  but not yet acknowledged) at any given time
    pub multi_part_concurrency_limit: usize,

    /// This is the number of buffers that will be pooled at a given time - buffers in excess of this
    ///  number are discarded when they are returned.
    pub buffer_pool_size: usize,

    /// Pause between two announcements of the local identity. `None` announces back-to-back,
    ///  paced only by the send path.
    pub announce_interval: Option<Duration>,

    /// Number of recently seen packet ids that are remembered for duplicate suppression, per
    ///  generation (there are two generations)
    pub dedup_rotation_threshold: usize,
}

impl CourierConfig {
    pub const DEFAULT_PORT: u16 = 21337;
    pub const DEFAULT_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(235, 13, 33, 37);

    /// link-local multicast with datagrams up to the maximum UDP payload size
    pub fn default_ipv4() -> CourierConfig {
        CourierConfig {
            port: Self::DEFAULT_PORT,
            multicast_group: Self::DEFAULT_MULTICAST_GROUP,
            multicast_ttl: 1,
            max_transport_size: MAX_IPV4_UDP_PAYLOAD,
            multi_part_chunk_size: 60_000,
            reassembly_expiry: Duration::from_secs(5 * 60),
            resend_base_delay: Duration::from_millis(500),
            resend_max_multiplier: 8,
            multi_part_concurrency_limit: 32,
            buffer_pool_size: 256,
            announce_interval: None,
            dedup_rotation_threshold: 16 * 1024,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.multicast_group.is_multicast() {
            bail!("{} is not a multicast address", self.multicast_group);
        }
        if self.max_transport_size > MAX_IPV4_UDP_PAYLOAD {
            bail!("maximum transport size {} exceeds the maximum UDP payload of {}", self.max_transport_size, MAX_IPV4_UDP_PAYLOAD);
        }
        if self.multi_part_chunk_size == 0 {
            bail!("multi-part chunk size must not be 0");
        }
        if self.multi_part_chunk_size + PacketDto::MULTI_PART_CHUNK_OVERHEAD > self.max_transport_size {
            bail!("multi-part chunk size {} plus envelope overhead of {} bytes does not fit into the maximum transport size {}",
                self.multi_part_chunk_size, PacketDto::MULTI_PART_CHUNK_OVERHEAD, self.max_transport_size);
        }
        if self.resend_max_multiplier == 0 {
            bail!("resend multiplier cap must be at least 1");
        }
        if self.multi_part_concurrency_limit == 0 {
            bail!("multi-part concurrency limit must be at least 1");
        }
        if self.buffer_pool_size == 0 {
            bail!("buffer pool size must be at least 1");
        }
        if self.dedup_rotation_threshold == 0 {
            bail!("dedup rotation threshold must be at least 1");
        }
        Ok(())
    }

    /// The largest chunk count of a valid multi-part message: the serialized message is limited
    ///  to `u32::MAX` bytes, so no sender with this configuration produces more chunks
    pub fn max_chunk_count(&self) -> usize {
        (u32::MAX as usize).div_ceil(self.multi_part_chunk_size.max(1))
    }

    pub fn multicast_endpoint(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.multicast_group, self.port))
    }
}
