//! Fixed-capacity ring buffers backing a connection.
//!
//! The byte ring is addressed by two free-running `u32` counters. `head` is
//! where the next byte is written, `tail` where the next byte is read, and
//! `head - tail` (wrapping) is the number of buffered bytes. Positions inside
//! the storage are the counters masked by `capacity - 1`, so the capacity
//! must be a power of two.

use std::collections::VecDeque;
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::OwnedFd;

use crate::core::errors::{CoreError, Result};

/// Default capacity of every byte ring.
pub const DEFAULT_CAPACITY: usize = 4096;

#[derive(Debug)]
pub struct RingBuffer {
    data: Box<[u8]>,
    head: u32,
    tail: u32,
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl RingBuffer {
    /// Create an empty ring.
    ///
    /// # Panics
    /// If `capacity` is not a power of two that fits the `u32` counters.
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two() && capacity <= (1 << 31),
            "ring capacity must be a power of two, got {capacity}"
        );
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            head: 0,
            tail: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.head.wrapping_sub(self.tail) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    pub fn free(&self) -> usize {
        self.capacity() - self.len()
    }

    fn mask(&self, counter: u32) -> usize {
        counter as usize & (self.data.len() - 1)
    }

    /// Append `bytes` at the head.
    pub fn put(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.capacity() {
            return Err(CoreError::MessageTooLarge {
                size: bytes.len(),
                capacity: self.capacity(),
            });
        }
        if bytes.len() > self.free() {
            return Err(CoreError::BufferOverflow {
                size: self.len() + bytes.len(),
                capacity: self.capacity(),
            });
        }

        let head = self.mask(self.head);
        let first = bytes.len().min(self.capacity() - head);
        self.data[head..head + first].copy_from_slice(&bytes[..first]);
        self.data[..bytes.len() - first].copy_from_slice(&bytes[first..]);
        self.head = self.head.wrapping_add(bytes.len() as u32);
        Ok(())
    }

    /// Copy the next `dst.len()` bytes without consuming them.
    pub fn copy(&self, dst: &mut [u8]) {
        assert!(
            dst.len() <= self.len(),
            "copy of {} bytes from ring holding {}",
            dst.len(),
            self.len()
        );
        let tail = self.mask(self.tail);
        let first = dst.len().min(self.capacity() - tail);
        dst[..first].copy_from_slice(&self.data[tail..tail + first]);
        let rest = dst.len() - first;
        dst[first..].copy_from_slice(&self.data[..rest]);
    }

    /// Drop the next `count` bytes.
    pub fn consume(&mut self, count: usize) {
        assert!(count <= self.len(), "consume of {count} bytes from ring holding {}", self.len());
        self.tail = self.tail.wrapping_add(count as u32);
    }

    /// Record `count` bytes written directly into the slices of [`Self::free_slices`].
    pub fn commit(&mut self, count: usize) {
        assert!(count <= self.free(), "commit of {count} bytes into {} free", self.free());
        self.head = self.head.wrapping_add(count as u32);
    }

    /// The free region as at most two writable slices, head first.
    pub fn free_slices(&mut self) -> [IoSliceMut<'_>; 2] {
        let capacity = self.capacity();
        let free = self.free();
        let head = self.mask(self.head);
        let first = free.min(capacity - head);
        let second = free - first;
        let (low, high) = self.data.split_at_mut(head);
        [
            IoSliceMut::new(&mut high[..first]),
            IoSliceMut::new(&mut low[..second]),
        ]
    }

    /// The buffered region as at most two readable slices, tail first.
    pub fn used_slices(&self) -> [IoSlice<'_>; 2] {
        let capacity = self.capacity();
        let len = self.len();
        let tail = self.mask(self.tail);
        let first = len.min(capacity - tail);
        [
            IoSlice::new(&self.data[tail..tail + first]),
            IoSlice::new(&self.data[..len - first]),
        ]
    }
}

/// FIFO of owned descriptors with a hard cap.
///
/// Dropping the queue closes everything still in it.
#[derive(Debug)]
pub struct FdQueue {
    fds: VecDeque<OwnedFd>,
    capacity: usize,
}

impl FdQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            fds: VecDeque::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.fds.len() >= self.capacity
    }

    pub fn free(&self) -> usize {
        self.capacity.saturating_sub(self.fds.len())
    }

    /// Append a descriptor. On overflow the descriptor is closed.
    pub fn push(&mut self, fd: OwnedFd) -> Result<()> {
        if self.is_full() {
            return Err(CoreError::FdOverflow(self.capacity));
        }
        self.fds.push_back(fd);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<OwnedFd> {
        self.fds.pop_front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OwnedFd> {
        self.fds.iter()
    }

    /// Close the first `count` descriptors.
    pub fn drop_front(&mut self, count: usize) {
        let count = count.min(self.fds.len());
        self.fds.drain(..count);
    }
}
