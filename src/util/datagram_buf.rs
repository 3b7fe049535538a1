//! Pre-allocated buffers holding a single datagram, reused through an
//!  [ObjectPool](crate::util::object_pool::ObjectPool).
//!
//! The buffer's capacity is the limit for serialization: `remaining_mut()` reports the space
//!  left, so writing a message that does not fit is detected before anything is written.

use std::fmt::{Debug, Formatter};
use std::ops::Deref;

use bytes::buf::UninitSlice;

use crate::util::object_pool::Poolable;

pub struct DatagramBuf {
    storage: Box<[u8]>,
    filled: usize,
}

impl DatagramBuf {
    pub fn with_capacity(capacity: usize) -> DatagramBuf {
        DatagramBuf {
            storage: vec![0; capacity].into_boxed_slice(),
            filled: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// The entire storage, for a socket to receive into. Follow up with [DatagramBuf::set_filled].
    pub fn receive_area(&mut self) -> &mut [u8] {
        self.filled = 0;
        &mut self.storage
    }

    /// Mark the first `num_bytes` as holding data, e.g. after receiving a datagram
    pub fn set_filled(&mut self, num_bytes: usize) {
        assert!(num_bytes <= self.capacity(), "{} bytes exceed buffer capacity {}", num_bytes, self.capacity());
        self.filled = num_bytes;
    }

    pub fn clear(&mut self) {
        self.filled = 0;
    }
}

impl Deref for DatagramBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.storage[..self.filled]
    }
}

impl Poolable for DatagramBuf {
    fn reset(&mut self) {
        self.clear();
    }
}

impl Debug for DatagramBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "DatagramBuf[{} of {}]", self.filled, self.capacity())
    }
}

unsafe impl bytes::BufMut for DatagramBuf {
    fn remaining_mut(&self) -> usize {
        self.capacity() - self.filled
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        self.set_filled(self.filled + cnt);
    }

    fn chunk_mut(&mut self) -> &mut UninitSlice {
        UninitSlice::new(&mut self.storage[self.filled..])
    }
}
