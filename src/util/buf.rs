use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use uuid::Uuid;

pub fn put_string(buf: &mut impl BufMut, s: &str) {
    buf.put_usize_varint(s.len());
    buf.put_slice(s.as_bytes());
}

pub fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let len = try_get_len_varint(buf)?;
    if buf.remaining() < len {
        bail!("buffer underflow: string of length {} with {} bytes remaining", len, buf.remaining());
    }

    let s = String::from_utf8(buf.copy_to_bytes(len).to_vec())?;
    Ok(s)
}

/// number of bytes for a serialized string, including its length prefix
pub fn string_len(s: &str) -> usize {
    varint_len(s.len() as u64) + s.len()
}

pub fn try_get_len_varint(buf: &mut impl Buf) -> anyhow::Result<usize> {
    buf.try_get_usize_varint()
        .map_err(|e| anyhow!("invalid varint: {:?}", e))
}

/// number of bytes in the variable-length encoding (7 bits per byte) of a given number
pub fn varint_len(value: u64) -> usize {
    let significant_bits = 64 - value.leading_zeros() as usize;
    significant_bits.div_ceil(7).max(1)
}

pub fn put_uuid(buf: &mut impl BufMut, id: Uuid) {
    buf.put_u128(id.as_u128());
}

pub fn try_get_uuid(buf: &mut impl Buf) -> anyhow::Result<Uuid> {
    Ok(Uuid::from_u128(buf.try_get_u128()?))
}
