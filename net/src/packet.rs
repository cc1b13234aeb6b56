/*
Shared byte buffer used for everything sent or received. Each `Packet` value is
one reference; cloning acquires another and dropping releases it. Storage is
freed, or handed back to its buffer pool, when the last reference goes away.
*/
use bytes::{Bytes, BytesMut};
use std::{
    fmt, mem,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use crate::sockets::buffer_pool::BufferPool;

pub struct Packet {
    inner: Arc<PacketInner>,
}

struct PacketInner {
    payload: RwLock<BytesMut>,
    pool: Option<Arc<BufferPool>>,
}

impl Packet {
    /// Creates a zero filled packet of `size` bytes
    pub fn new(size: usize) -> Self {
        Self::from_bytes_mut(BytesMut::zeroed(size), None)
    }

    pub fn from_slice(payload: &[u8]) -> Self {
        Self::from_bytes_mut(BytesMut::from(payload), None)
    }

    /// Creates a zero filled packet whose storage returns to `pool` on final release
    pub fn from_pool(pool: &Arc<BufferPool>, size: usize) -> Self {
        Self::from_bytes_mut(pool.get(size), Some(pool.clone()))
    }

    /// Wraps storage that was taken from `pool`
    pub(crate) fn from_pooled(pool: &Arc<BufferPool>, payload: BytesMut) -> Self {
        Self::from_bytes_mut(payload, Some(pool.clone()))
    }

    fn from_bytes_mut(payload: BytesMut, pool: Option<Arc<BufferPool>>) -> Self {
        Self {
            inner: Arc::new(PacketInner {
                payload: RwLock::new(payload),
                pool,
            }),
        }
    }

    /// Takes another reference to the same storage
    pub fn acquire(self: &Self) -> Packet {
        Packet {
            inner: self.inner.clone(),
        }
    }

    /// Gives up this reference
    pub fn release(self: Self) {
        drop(self)
    }

    pub fn ref_count(self: &Self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn size(self: &Self) -> usize {
        self.read().len()
    }

    pub fn is_empty(self: &Self) -> bool {
        self.size() == 0
    }

    /// Grows the payload with zeros or truncates it
    pub fn set_size(self: &Self, size: usize) {
        self.write().resize(size, 0);
    }

    /// Replaces the payload, resizing to fit
    pub fn set_payload(self: &Self, payload: &[u8]) {
        let mut buffer = self.write();
        buffer.clear();
        buffer.extend_from_slice(payload);
    }

    /// Copies `bytes` in at `offset`, growing the payload when the write runs past the end
    pub fn write_at(self: &Self, offset: usize, bytes: &[u8]) {
        let mut buffer = self.write();
        let end = offset + bytes.len();
        if end > buffer.len() {
            buffer.resize(end, 0);
        }
        buffer[offset..end].copy_from_slice(bytes);
    }

    pub fn with_payload<R>(self: &Self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.read())
    }

    pub fn with_payload_mut<R>(self: &Self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.write())
    }

    pub fn to_vec(self: &Self) -> Vec<u8> {
        self.read().to_vec()
    }

    pub fn to_bytes(self: &Self) -> Bytes {
        Bytes::copy_from_slice(&self.read())
    }

    fn read(self: &Self) -> RwLockReadGuard<'_, BytesMut> {
        self.inner.payload.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(self: &Self) -> RwLockWriteGuard<'_, BytesMut> {
        self.inner.payload.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[cfg(test)]
    pub(crate) fn downgrade(self: &Self) -> std::sync::Weak<impl Sized> {
        Arc::downgrade(&self.inner)
    }
}

impl Clone for Packet {
    fn clone(&self) -> Self {
        self.acquire()
    }
}

impl Drop for PacketInner {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            let payload = self.payload.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
            pool.reuse(mem::take(payload));
        }
    }
}

impl From<Vec<u8>> for Packet {
    fn from(payload: Vec<u8>) -> Self {
        Self::from_bytes_mut(BytesMut::from(&payload[..]), None)
    }
}

impl From<&[u8]> for Packet {
    fn from(payload: &[u8]) -> Self {
        Self::from_slice(payload)
    }
}

impl From<&str> for Packet {
    fn from(payload: &str) -> Self {
        Self::from_slice(payload.as_bytes())
    }
}

impl PartialEq for Packet {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) || *self.read() == *other.read()
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("size", &self.size())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn should_share_storage_between_references() {
        let packet = Packet::from("PING");
        let other = packet.acquire();
        assert_eq!(packet.ref_count(), 2);

        other.write_at(0, b"PONG");
        assert_eq!(packet.to_vec(), b"PONG");

        other.release();
        assert_eq!(packet.ref_count(), 1);
    }

    #[test]
    fn should_grow_and_truncate() {
        let packet = Packet::from("abc");
        packet.set_size(5);
        assert_eq!(packet.to_vec(), b"abc\0\0");

        packet.set_size(1);
        assert_eq!(packet.to_vec(), b"a");

        packet.write_at(3, b"z");
        assert_eq!(packet.to_vec(), b"a\0\0z");
    }

    #[test]
    fn should_return_storage_to_pool_on_last_release() {
        let pool = Arc::new(BufferPool::new());
        let packet = Packet::from_pool(&pool, 300);
        let reader = packet.acquire();

        packet.release();
        assert_eq!(pool.pooled_count(), 0);

        reader.release();
        assert_eq!(pool.pooled_count(), 1);
    }

    proptest! {
        #[test]
        fn should_free_only_after_every_reference_is_released(
            acquires in 0usize..32,
            order in proptest::collection::vec(any::<usize>(), 32),
        ) {
            let original = Packet::new(16);
            let weak = original.downgrade();
            let mut references: Vec<Packet> = (0..acquires).map(|_| original.acquire()).collect();
            references.push(original);

            let mut step = 0;
            while !references.is_empty() {
                prop_assert!(weak.upgrade().is_some());
                let index = order[step % order.len()] % references.len();
                references.swap_remove(index).release();
                step += 1;
            }

            prop_assert_eq!(step, acquires + 1);
            prop_assert!(weak.upgrade().is_none());
        }
    }
}
