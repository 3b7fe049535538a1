use std::fmt::{Debug, Formatter};

use anyhow::{anyhow, bail};
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use uuid::Uuid;

use crate::identity::Identity;
use crate::util::buf::{put_uuid, try_get_uuid};
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

bitflags! {
    #[derive(Default, Debug, PartialEq, Eq, Copy, Clone)]
    pub struct PacketFlags: u8 {
        const RELIABLE = 0b0000_0001;
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
enum BodyKind {
    Payload = 1,
    Announcement = 2,
    Acknowledgement = 3,
    MultiPartChunk = 4,
}

/// Serialization failure. The distinction matters to the sender: a message exceeding the buffer
///  is sent as a multi-part message, while an invalid message is the caller's problem.
#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum SerError {
    #[error("serialized message requires {required} bytes, but only {capacity} are available")]
    CapacityExceeded { required: usize, capacity: usize },
    #[error("invalid message: {0}")]
    Schema(String),
}

/// The outermost unit on the wire: one envelope per datagram
#[derive(Clone, Eq, PartialEq)]
pub struct PacketDto {
    /// unique per logical message, shared by all transmissions of it
    pub id: Uuid,
    pub sender_id: Uuid,
    /// `None` for messages addressed to all nodes
    pub receiver_id: Option<Uuid>,
    pub flags: PacketFlags,
    pub body: PacketBody,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PacketBody {
    Payload(Bytes),
    Announcement(AnnouncementDto),
    Acknowledgement(AcknowledgementDto),
    MultiPartChunk(MultiPartChunkDto),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AnnouncementDto {
    pub identity: Identity,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AcknowledgementDto {
    pub message_id: Uuid,
}

/// One fragment of a serialized envelope that was too big for a single datagram
#[derive(Clone, Eq, PartialEq)]
pub struct MultiPartChunkDto {
    pub multi_part_id: Uuid,
    pub chunk_index: u32,
    pub chunk_count: u32,
    /// position of this chunk's first byte in the reassembled message
    pub body_offset: u32,
    pub body_length: u32,
    pub body: Bytes,
}

impl Debug for MultiPartChunkDto {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "CHUNK{{{}:{}/{}@{}+{}}}", self.multi_part_id, self.chunk_index, self.chunk_count, self.body_offset, self.body_length)
    }
}

impl MultiPartChunkDto {
    const SERIALIZED_HEADER_LEN: usize = 16 + 4 * size_of::<u32>();
}

impl Debug for PacketDto {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let receiver = self.receiver_id
            .map(|id| id.to_string())
            .unwrap_or("*".to_string());
        let kind = match &self.body {
            PacketBody::Payload(p) => format!("PAYLOAD[{}]", p.len()),
            PacketBody::Announcement(a) => format!("ANNOUNCE[{}]", a.identity),
            PacketBody::Acknowledgement(a) => format!("ACK[{}]", a.message_id),
            PacketBody::MultiPartChunk(c) => format!("{:?}", c),
        };
        let reliable = if self.is_reliable() { "!" } else { "" };
        write!(f, "PCKT{{{}{}:{}->{}:{}}}", self.id, reliable, self.sender_id, receiver, kind)
    }
}

impl PacketDto {
    pub const PROTOCOL_VERSION_1: u8 = 1;

    /// The largest possible envelope without its body
    pub const ENVELOPE_HEADER_MAX_LEN: usize = size_of::<u8>()  // version
        + 16                   // id
        + 16                   // sender id
        + size_of::<u8>()      // has receiver
        + 16                   // receiver id
        + size_of::<u8>()      // flags
        + size_of::<u8>();     // body kind

    /// The number of bytes a multi-part chunk's envelope adds to the chunk's data
    pub const MULTI_PART_CHUNK_OVERHEAD: usize = Self::ENVELOPE_HEADER_MAX_LEN + MultiPartChunkDto::SERIALIZED_HEADER_LEN;

    pub fn payload(sender_id: Uuid, receiver_id: Option<Uuid>, payload: Bytes, reliable: bool) -> PacketDto {
        PacketDto {
            id: Uuid::new_v4(),
            sender_id,
            receiver_id,
            flags: if reliable { PacketFlags::RELIABLE } else { PacketFlags::empty() },
            body: PacketBody::Payload(payload),
        }
    }

    pub fn announcement(identity: Identity) -> PacketDto {
        PacketDto {
            id: Uuid::new_v4(),
            sender_id: identity.id,
            receiver_id: None,
            flags: PacketFlags::empty(),
            body: PacketBody::Announcement(AnnouncementDto { identity }),
        }
    }

    /// acknowledgements are sent unreliably: a lost acknowledgement is compensated for by the
    ///  sender's next resend
    pub fn acknowledgement(sender_id: Uuid, acknowledged: &PacketDto) -> PacketDto {
        PacketDto {
            id: Uuid::new_v4(),
            sender_id,
            receiver_id: Some(acknowledged.sender_id),
            flags: PacketFlags::empty(),
            body: PacketBody::Acknowledgement(AcknowledgementDto { message_id: acknowledged.id }),
        }
    }

    /// Wrap a chunk of this message in an envelope of its own, with a fresh id and this message's
    ///  addressing and flags
    pub fn chunk_envelope(&self, chunk: MultiPartChunkDto) -> PacketDto {
        PacketDto {
            id: Uuid::new_v4(),
            sender_id: self.sender_id,
            receiver_id: self.receiver_id,
            flags: self.flags,
            body: PacketBody::MultiPartChunk(chunk),
        }
    }

    pub fn is_reliable(&self) -> bool {
        self.flags.contains(PacketFlags::RELIABLE)
    }

    pub fn serialized_len(&self) -> usize {
        let header_len = if self.receiver_id.is_some() {
            Self::ENVELOPE_HEADER_MAX_LEN
        }
        else {
            Self::ENVELOPE_HEADER_MAX_LEN - 16
        };

        let body_len = match &self.body {
            PacketBody::Payload(payload) => size_of::<u32>() + payload.len(),
            PacketBody::Announcement(a) => a.identity.serialized_len(),
            PacketBody::Acknowledgement(_) => 16,
            PacketBody::MultiPartChunk(c) => MultiPartChunkDto::SERIALIZED_HEADER_LEN + c.body.len(),
        };

        header_len + body_len
    }

    /// Checks the message for consistency without serializing it
    pub fn validate(&self) -> Result<(), SerError> {
        match &self.body {
            PacketBody::Payload(payload) => {
                if payload.len() > SafeCast::<usize>::safe_cast(u32::MAX) {
                    return Err(SerError::Schema(format!("payload of {} bytes exceeds the maximum length", payload.len())));
                }
            }
            PacketBody::MultiPartChunk(chunk) => {
                if chunk.chunk_count == 0 {
                    return Err(SerError::Schema("multi-part chunk count must not be 0".to_string()));
                }
                if chunk.chunk_index >= chunk.chunk_count {
                    return Err(SerError::Schema(format!("chunk index {} out of range for {} chunks", chunk.chunk_index, chunk.chunk_count)));
                }
                if SafeCast::<usize>::safe_cast(chunk.body_length) != chunk.body.len() {
                    return Err(SerError::Schema(format!("declared chunk length {} does not match actual length {}", chunk.body_length, chunk.body.len())));
                }
            }
            PacketBody::Announcement(_) | PacketBody::Acknowledgement(_) => {}
        }
        Ok(())
    }

    /// Serialize into a buffer whose `remaining_mut()` is the limit for the serialized message.
    ///  Nothing is written if the message does not fit.
    pub fn ser_into(&self, buf: &mut impl BufMut) -> Result<(), SerError> {
        self.validate()?;

        let required = self.serialized_len();
        if required > buf.remaining_mut() {
            return Err(SerError::CapacityExceeded {
                required,
                capacity: buf.remaining_mut(),
            });
        }

        buf.put_u8(Self::PROTOCOL_VERSION_1);
        put_uuid(buf, self.id);
        put_uuid(buf, self.sender_id);
        match self.receiver_id {
            Some(receiver_id) => {
                buf.put_u8(1);
                put_uuid(buf, receiver_id);
            }
            None => buf.put_u8(0),
        }
        buf.put_u8(self.flags.bits());

        match &self.body {
            PacketBody::Payload(payload) => {
                buf.put_u8(BodyKind::Payload.into());
                buf.put_u32(payload.len().prechecked_cast());
                buf.put_slice(payload);
            }
            PacketBody::Announcement(a) => {
                buf.put_u8(BodyKind::Announcement.into());
                a.identity.ser(buf);
            }
            PacketBody::Acknowledgement(a) => {
                buf.put_u8(BodyKind::Acknowledgement.into());
                put_uuid(buf, a.message_id);
            }
            PacketBody::MultiPartChunk(c) => {
                buf.put_u8(BodyKind::MultiPartChunk.into());
                put_uuid(buf, c.multi_part_id);
                buf.put_u32(c.chunk_index);
                buf.put_u32(c.chunk_count);
                buf.put_u32(c.body_offset);
                buf.put_u32(c.body_length);
                buf.put_slice(&c.body);
            }
        }
        Ok(())
    }

    /// Serialize into a freshly allocated buffer, without a size limit
    pub fn to_bytes(&self) -> Result<Bytes, SerError> {
        let mut buf = BytesMut::with_capacity(self.serialized_len());
        self.ser_into(&mut buf)?;
        Ok(buf.freeze())
    }

    pub fn deser(mut buf: &[u8]) -> anyhow::Result<PacketDto> {
        let protocol_version = buf.try_get_u8()?;
        if protocol_version != Self::PROTOCOL_VERSION_1 {
            bail!("unsupported protocol version {}", protocol_version);
        }

        let id = try_get_uuid(&mut buf)?;
        let sender_id = try_get_uuid(&mut buf)?;
        let receiver_id = match buf.try_get_u8()? {
            0 => None,
            1 => Some(try_get_uuid(&mut buf)?),
            other => bail!("invalid receiver marker {}", other),
        };
        let flags = PacketFlags::from_bits(buf.try_get_u8()?)
            .ok_or_else(|| anyhow!("unsupported packet flags"))?;

        let kind = BodyKind::try_from(buf.try_get_u8()?)?;
        let body = match kind {
            BodyKind::Payload => {
                let len = buf.try_get_u32()?.safe_cast();
                PacketBody::Payload(Self::try_get_bytes(&mut buf, len)?)
            }
            BodyKind::Announcement => PacketBody::Announcement(AnnouncementDto {
                identity: Identity::deser(&mut buf)?,
            }),
            BodyKind::Acknowledgement => PacketBody::Acknowledgement(AcknowledgementDto {
                message_id: try_get_uuid(&mut buf)?,
            }),
            BodyKind::MultiPartChunk => {
                let multi_part_id = try_get_uuid(&mut buf)?;
                let chunk_index = buf.try_get_u32()?;
                let chunk_count = buf.try_get_u32()?;
                let body_offset = buf.try_get_u32()?;
                let body_length = buf.try_get_u32()?;
                let body = Self::try_get_bytes(&mut buf, body_length.safe_cast())?;
                PacketBody::MultiPartChunk(MultiPartChunkDto {
                    multi_part_id,
                    chunk_index,
                    chunk_count,
                    body_offset,
                    body_length,
                    body,
                })
            }
        };

        if buf.has_remaining() {
            bail!("{} trailing bytes after message body", buf.remaining());
        }

        let result = PacketDto {
            id,
            sender_id,
            receiver_id,
            flags,
            body,
        };
        result.validate()?;
        Ok(result)
    }

    fn try_get_bytes(buf: &mut &[u8], len: usize) -> anyhow::Result<Bytes> {
        if buf.remaining() < len {
            bail!("buffer underflow: {} bytes declared, {} remaining", len, buf.remaining());
        }
        Ok(buf.copy_to_bytes(len))
    }
}
