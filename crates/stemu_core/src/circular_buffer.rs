/*
    StEmu

    Copyright 2022-2025 Daniel Balsom

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------

    circular_buffer.rs

    Byte ring shared between a real-time I/O thread and the emulation thread.
*/

use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;

pub const CIRCULAR_BUFFER_MIN_SIZE: usize = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CircularBufferError {
    #[error("buffer size {0} is too small, the minimum is 2")]
    TooSmall(usize),
    #[error("{len} bytes cannot fit in a buffer of size {size}")]
    TooLarge { len: usize, size: usize },
    #[error("buffer has no backing store")]
    NotAllocated,
}

/// Read and write cursors over an owned backing store. `read == write` is empty; the slot
/// before `read` is never written, so at most `size - 1` bytes are held.
#[derive(Default)]
struct Ring {
    data:  Vec<u8>,
    read:  usize,
    write: usize,
}

impl Ring {
    fn size(&self) -> usize {
        self.data.len()
    }

    fn used(&self) -> usize {
        if self.data.is_empty() {
            return 0;
        }
        (self.write + self.size() - self.read) % self.size()
    }

    fn free(&self) -> usize {
        self.size().saturating_sub(1) - self.used()
    }
}

/// A single-producer, single-consumer byte ring.
///
/// The lock is only ever held for cursor arithmetic and a bounded copy. Acquisition
/// spins on `try_lock` and yields the thread between attempts, so the real-time side
/// never parks on an OS mutex.
#[derive(Default)]
pub struct CircularBuffer {
    ring: Mutex<Ring>,
}

impl CircularBuffer {
    pub fn new(size: usize) -> Result<Self, CircularBufferError> {
        let buffer = CircularBuffer::default();
        buffer.create(size)?;
        Ok(buffer)
    }

    /// Allocate a backing store of `size` bytes, replacing any existing one.
    pub fn create(&self, size: usize) -> Result<(), CircularBufferError> {
        if size < CIRCULAR_BUFFER_MIN_SIZE {
            return Err(CircularBufferError::TooSmall(size));
        }
        let mut ring = self.lock();
        *ring = Ring {
            data:  vec![0; size],
            read:  0,
            write: 0,
        };
        Ok(())
    }

    /// Release the backing store. The buffer is inert until created again.
    pub fn destroy(&self) {
        *self.lock() = Ring::default();
    }

    /// Empty the buffer without reallocating.
    pub fn reset(&self) {
        let mut ring = self.lock();
        ring.read = 0;
        ring.write = 0;
    }

    pub fn is_allocated(&self) -> bool {
        !self.lock().data.is_empty()
    }

    pub fn size(&self) -> usize {
        self.lock().size()
    }

    pub fn len(&self) -> usize {
        self.lock().used()
    }

    pub fn is_empty(&self) -> bool {
        !self.are_bytes_in_buffer()
    }

    pub fn are_bytes_in_buffer(&self) -> bool {
        let ring = self.lock();
        ring.read != ring.write
    }

    /// Append one byte. Returns false if the buffer was full: the oldest unread byte is
    /// dropped to make room, or nothing happens if the buffer has no backing store.
    pub fn add_byte(&self, byte: u8) -> bool {
        let mut ring = self.lock();
        if ring.data.is_empty() {
            return false;
        }
        let size = ring.size();
        let write = ring.write;
        ring.data[write] = byte;
        ring.write = (write + 1) % size;

        if ring.write == ring.read {
            ring.read = (ring.read + 1) % size;
            return false;
        }
        true
    }

    /// Append a run of bytes. Fewer bytes than the buffer size are accepted; a longer run is
    /// rejected without touching the buffer. Returns Ok(false) if unread bytes were overwritten.
    pub fn add_bytes(&self, bytes: &[u8]) -> Result<bool, CircularBufferError> {
        let mut ring = self.lock();
        let size = ring.size();
        if size == 0 {
            return Err(CircularBufferError::NotAllocated);
        }
        if bytes.len() >= size {
            return Err(CircularBufferError::TooLarge { len: bytes.len(), size });
        }
        if bytes.is_empty() {
            return Ok(true);
        }

        let overflow = bytes.len() > ring.free();
        let write = ring.write;
        let first = bytes.len().min(size - write);
        ring.data[write..write + first].copy_from_slice(&bytes[..first]);
        let rest = bytes.len() - first;
        if rest > 0 {
            ring.data[..rest].copy_from_slice(&bytes[first..]);
        }
        ring.write = (write + bytes.len()) % size;

        if overflow {
            ring.read = (ring.write + 1) % size;
            return Ok(false);
        }
        Ok(true)
    }

    /// Peek at the oldest unread byte.
    pub fn read_byte(&self) -> Option<u8> {
        let ring = self.lock();
        if ring.read == ring.write {
            return None;
        }
        Some(ring.data[ring.read])
    }

    /// Consume the oldest unread byte. Returns false if the buffer was empty.
    pub fn next_byte(&self) -> bool {
        let mut ring = self.lock();
        if ring.read == ring.write {
            return false;
        }
        ring.read = (ring.read + 1) % ring.size();
        true
    }

    /// Peek and consume in one critical section.
    pub fn pop_byte(&self) -> Option<u8> {
        let mut ring = self.lock();
        if ring.read == ring.write {
            return None;
        }
        let byte = ring.data[ring.read];
        ring.read = (ring.read + 1) % ring.size();
        Some(byte)
    }

    fn lock(&self) -> MutexGuard<'_, Ring> {
        loop {
            if let Some(guard) = self.ring.try_lock() {
                return guard;
            }
            std::thread::yield_now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::VecDeque, sync::Arc, thread};

    #[test]
    fn test_create_rejects_small_sizes() {
        assert_eq!(CircularBuffer::new(0).err(), Some(CircularBufferError::TooSmall(0)));
        assert_eq!(CircularBuffer::new(1).err(), Some(CircularBufferError::TooSmall(1)));

        let buffer = CircularBuffer::new(2).unwrap();
        assert!(buffer.add_byte(7));
        assert_eq!(buffer.len(), 1);
        assert!(!buffer.add_byte(8));
        assert_eq!(buffer.read_byte(), Some(8));
    }

    #[test]
    fn test_inert_buffer() {
        let buffer = CircularBuffer::default();
        assert!(!buffer.is_allocated());
        assert!(!buffer.add_byte(1));
        assert!(!buffer.are_bytes_in_buffer());
        assert_eq!(buffer.add_bytes(&[1, 2]), Err(CircularBufferError::NotAllocated));
        assert_eq!(buffer.read_byte(), None);
    }

    #[test]
    fn test_never_holds_more_than_size_minus_one() {
        const SIZE: usize = 7;
        let buffer = CircularBuffer::new(SIZE).unwrap();
        let mut model: VecDeque<u8> = VecDeque::new();

        let mut seed: u32 = 0xDEAD_BEEF;
        for i in 0..5000u32 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;

            if seed % 3 != 0 {
                let byte = i as u8;
                let expect_ok = model.len() < SIZE - 1;
                if !expect_ok {
                    model.pop_front();
                }
                model.push_back(byte);
                assert_eq!(buffer.add_byte(byte), expect_ok);
            }
            else {
                assert_eq!(buffer.read_byte(), model.front().copied());
                assert_eq!(buffer.next_byte(), model.pop_front().is_some());
            }
            assert!(buffer.len() <= SIZE - 1);
            assert_eq!(buffer.len(), model.len());
        }
    }

    #[test]
    fn test_add_bytes_wraps_and_round_trips() {
        let buffer = CircularBuffer::new(16).unwrap();
        // Move the cursors near the end so the next run wraps.
        for i in 0..12 {
            buffer.add_byte(i);
            buffer.next_byte();
        }

        let data: Vec<u8> = (100..115).collect();
        assert_eq!(buffer.add_bytes(&data), Ok(true));

        let mut out = Vec::new();
        while let Some(byte) = buffer.read_byte() {
            out.push(byte);
            assert!(buffer.next_byte());
        }
        assert_eq!(out, data);
        assert!(!buffer.next_byte());
    }

    #[test]
    fn test_add_bytes_rejects_oversize_run() {
        let buffer = CircularBuffer::new(8).unwrap();
        buffer.add_bytes(&[1, 2, 3]).unwrap();
        assert_eq!(
            buffer.add_bytes(&[0; 8]),
            Err(CircularBufferError::TooLarge { len: 8, size: 8 })
        );
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.read_byte(), Some(1));
    }

    #[test]
    fn test_add_bytes_overflow_keeps_newest() {
        let buffer = CircularBuffer::new(8).unwrap();
        buffer.add_bytes(&[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(buffer.add_bytes(&[6, 7, 8, 9]), Ok(false));
        assert_eq!(buffer.len(), 7);

        let mut out = Vec::new();
        while let Some(byte) = buffer.pop_byte() {
            out.push(byte);
        }
        assert_eq!(out, vec![3, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn test_reset_keeps_allocation() {
        let buffer = CircularBuffer::new(4).unwrap();
        buffer.add_bytes(&[1, 2]).unwrap();
        buffer.reset();
        assert!(buffer.is_empty());
        assert_eq!(buffer.size(), 4);
        buffer.destroy();
        assert_eq!(buffer.size(), 0);
    }

    #[test]
    fn test_producer_consumer_threads() {
        const COUNT: usize = 20_000;
        let buffer = Arc::new(CircularBuffer::new(64).unwrap());

        let producer = {
            let buffer = buffer.clone();
            thread::spawn(move || {
                let mut sent = 0;
                while sent < COUNT {
                    // Only write when there is room so nothing is dropped.
                    if buffer.len() < 63 {
                        assert!(buffer.add_byte(sent as u8));
                        sent += 1;
                    }
                    else {
                        thread::yield_now();
                    }
                }
            })
        };

        let mut received = 0;
        while received < COUNT {
            match buffer.pop_byte() {
                Some(byte) => {
                    assert_eq!(byte, received as u8);
                    received += 1;
                }
                None => thread::yield_now(),
            }
        }
        producer.join().unwrap();
        assert!(buffer.is_empty());
    }
}
