//! A peer-to-peer messaging transport on top of IPv4 multicast UDP. Nodes find each other by
//!  announcing their identities to a multicast group, and exchange messages of arbitrary size
//!  with optional reliable (i.e. acknowledged and resent) delivery.
//!
//! ## Design goals
//!
//! * There is no central broker or coordinator: every node binds the same port, joins the same
//!   multicast group, and sends everything to the group
//!   * nodes are discovered by their periodic announcements, and changes to a node's identity
//!     (name, attributes) are propagated the same way, with a revision number to reject stale
//!     announcements
//! * Messages are addressed to a single node or to all nodes
//! * Reliability is per message: a reliable message is resent with exponential backoff until it
//!   is acknowledged, or until the transport shuts down. There is no delivery timeout.
//!   * the receiver acknowledges every copy it gets, and delivers each message at most once
//! * Messages bigger than a single datagram are split into chunks which are sent (and, for reliable
//!   messages, acknowledged) individually and reassembled on the receiving side
//!   * incomplete messages are discarded after a configurable expiry
//! * There is no ordering guarantee, neither between messages nor between chunks
//! * There is no encryption
//!
//! ## Wire format
//!
//! Every datagram contains exactly one envelope. All numbers are big-endian.
//!
//! ```ascii
//!  0: protocol version (u8) - currently 1
//!  1: message id (UUID, 16 bytes)
//! 17: sender id (UUID, 16 bytes)
//! 33: has receiver (u8) - 0 for a message to all nodes, 1 if a receiver id follows
//! 34: receiver id (UUID, 16 bytes) - only present if 'has receiver' is 1
//!  *: flags (u8) - bit 0 marks a reliable message
//!  *: body kind (u8)
//!  *: body
//! ```
//!
//! Body kinds:
//!
//! ```ascii
//! 1: payload           payload length (u32), payload bytes
//! 2: announcement      node id (UUID), revision (i32), name, attribute count (varint),
//!                       (key, value) pairs - strings are a varint length followed by UTF-8
//! 3: acknowledgement   acknowledged message id (UUID)
//! 4: multi-part chunk  multi-part id (UUID), chunk index (u32), chunk count (u32),
//!                       offset of the chunk in the reassembled message (u32),
//!                       chunk length (u32), chunk bytes
//! ```
//!
//! A multi-part message is the complete serialized envelope of the original message, split into
//!  chunks. Each chunk travels in an envelope of its own with a fresh message id, and the
//!  reassembled bytes are parsed as an envelope again.

pub mod acknowledgement;
pub mod announcer;
pub mod config;
pub mod courier;
pub mod dispatcher;
pub mod identity;
pub mod packet;
pub mod packet_sender;
pub mod peer;
pub mod reassembler;
pub mod revision_counter;
pub mod shutdown;
pub mod stats;
pub mod transport;
pub mod util;
pub mod test_util;
