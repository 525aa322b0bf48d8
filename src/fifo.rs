//! A bounded single-producer/single-consumer duplex queue of descriptor indices.
//!
//! Stands in for the kernel FIFO object (`zx::fifo`) the original device exchanges with its
//! clients: a fixed-depth, *duplex* queue of 16-bit descriptor indices — each endpoint can write
//! indices the other endpoint reads, and vice versa, over the same handle pair (a client posts tx
//! descriptors one way and receives completions back the other way, on what is conceptually "one
//! FIFO"). Built directly on two [`crate::ds::RingQueue`]s, reusing the ring queue as the
//! ring queue is reused as the descriptor-bookkeeping primitive in both the FIFOs and the tx/rx
//! in-flight queues.

use std::sync::{Arc, Condvar, Mutex};

use crate::ds::RingQueue;
use crate::status::{Result, Status};

struct Shared {
    // Indices written by endpoint A are read by endpoint B, and vice versa.
    a_to_b: Mutex<RingQueue<u16>>,
    b_to_a: Mutex<RingQueue<u16>>,
    readable: Condvar,
    writable: Condvar,
    peer_closed: std::sync::atomic::AtomicBool,
}

/// One endpoint of a [`Fifo`] pair.
///
/// Both endpoints share the same backing rings; `Fifo::pair` is the only constructor, mirroring
/// how a session's rx FIFO is a single ref-counted object shared between the framework and the
/// handed-out client endpoint (`RefCountedFifo` in the original `session.h`).
#[derive(Clone)]
pub struct Fifo {
    shared: Arc<Shared>,
    is_a: bool,
}

impl Fifo {
    /// Creates a pair of endpoints over fresh rings of the given depth.
    ///
    /// Writes from the first returned handle are read from the second, and writes from the second
    /// are read from the first. Depth must be a power of two no greater than
    /// [`crate::descriptor::MAX_FIFO_DEPTH`] in typical use, but this constructor itself only
    /// requires a nonzero depth.
    pub fn pair(depth: u32) -> Result<(Fifo, Fifo)> {
        let shared = Arc::new(Shared {
            a_to_b: Mutex::new(RingQueue::new(depth)?),
            b_to_a: Mutex::new(RingQueue::new(depth)?),
            readable: Condvar::new(),
            writable: Condvar::new(),
            peer_closed: std::sync::atomic::AtomicBool::new(false),
        });
        Ok((
            Fifo {
                shared: shared.clone(),
                is_a: true,
            },
            Fifo {
                shared,
                is_a: false,
            },
        ))
    }

    fn outgoing(&self) -> &Mutex<RingQueue<u16>> {
        if self.is_a {
            &self.shared.a_to_b
        } else {
            &self.shared.b_to_a
        }
    }

    fn incoming(&self) -> &Mutex<RingQueue<u16>> {
        if self.is_a {
            &self.shared.b_to_a
        } else {
            &self.shared.a_to_b
        }
    }

    /// Writes as many of `indices` as fit without blocking, returning the count written.
    pub fn write_nonblocking(&self, indices: &[u16]) -> Result<u32> {
        if self.shared.peer_closed.load(std::sync::atomic::Ordering::Acquire) {
            return Err(Status::Canceled);
        }
        let mut ring = self.outgoing().lock().expect("fifo mutex poisoned");
        let mut written = 0u32;
        for &idx in indices {
            if ring.count() >= ring.capacity() {
                break;
            }
            ring.push(idx);
            written += 1;
        }
        drop(ring);
        if written > 0 {
            self.shared.readable.notify_all();
        }
        Ok(written)
    }

    /// Reads up to `out.len()` indices without blocking, returning the count read.
    ///
    /// Returns `0` (not an error) if the FIFO is currently empty; callers distinguish "nothing
    /// available yet" from [`Status::Canceled`] by checking [`Fifo::is_peer_closed`].
    pub fn read_nonblocking(&self, out: &mut [u16]) -> Result<u32> {
        let mut ring = self.incoming().lock().expect("fifo mutex poisoned");
        let mut read = 0u32;
        while (read as usize) < out.len() && !ring.is_empty() {
            out[read as usize] = ring.pop();
            read += 1;
        }
        drop(ring);
        if read > 0 {
            self.shared.writable.notify_all();
        }
        Ok(read)
    }

    /// Blocks until at least one index is available or the peer closes, then reads up to
    /// `out.len()` of them.
    pub fn read_blocking(&self, out: &mut [u16]) -> Result<u32> {
        let mut ring = self.incoming().lock().expect("fifo mutex poisoned");
        while ring.is_empty() {
            if self.shared.peer_closed.load(std::sync::atomic::Ordering::Acquire) {
                return Err(Status::Canceled);
            }
            ring = self
                .shared
                .readable
                .wait(ring)
                .expect("fifo condvar poisoned");
        }
        let mut read = 0u32;
        while (read as usize) < out.len() && !ring.is_empty() {
            out[read as usize] = ring.pop();
            read += 1;
        }
        drop(ring);
        if read > 0 {
            self.shared.writable.notify_all();
        }
        Ok(read)
    }

    /// Blocks until the incoming queue is non-empty or the peer closes, without consuming any
    /// entry.
    ///
    /// Stands in for arming a `ZX_FIFO_READABLE | ZX_FIFO_PEER_CLOSED` async wait: the caller
    /// (typically a [`crate::port::FifoWatch`]) is only told that data is available, not given it,
    /// so the real consumer still reads in FIFO order afterwards.
    pub fn wait_readable(&self) -> Result<()> {
        let mut ring = self.incoming().lock().expect("fifo mutex poisoned");
        while ring.is_empty() {
            if self.shared.peer_closed.load(std::sync::atomic::Ordering::Acquire) {
                return Err(Status::Canceled);
            }
            ring = self
                .shared
                .readable
                .wait(ring)
                .expect("fifo condvar poisoned");
        }
        Ok(())
    }

    /// Whether the incoming queue currently has anything to read, without blocking.
    pub fn is_readable(&self) -> bool {
        !self.incoming().lock().expect("fifo mutex poisoned").is_empty()
    }

    /// The queue's fixed depth (identical for both directions).
    pub fn depth(&self) -> u32 {
        self.outgoing().lock().expect("fifo mutex poisoned").capacity()
    }

    /// Marks this endpoint's peer as closed; wakes any blocked reader/writer.
    pub fn close(&self) {
        self.shared
            .peer_closed
            .store(true, std::sync::atomic::Ordering::Release);
        self.shared.readable.notify_all();
        self.shared.writable.notify_all();
    }

    /// Whether the peer has closed this FIFO.
    pub fn is_peer_closed(&self) -> bool {
        self.shared.peer_closed.load(std::sync::atomic::Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_roundtrips() {
        let (client, server) = Fifo::pair(4).unwrap();
        assert_eq!(client.write_nonblocking(&[1, 2, 3]).unwrap(), 3);
        let mut out = [0u16; 4];
        assert_eq!(server.read_nonblocking(&mut out).unwrap(), 3);
        assert_eq!(&out[..3], &[1, 2, 3]);
    }

    #[test]
    fn duplex_directions_are_independent() {
        let (client, server) = Fifo::pair(4).unwrap();
        // client -> server
        client.write_nonblocking(&[1, 2]).unwrap();
        // server -> client, concurrently, does not collide with the above
        server.write_nonblocking(&[9]).unwrap();

        let mut from_client = [0u16; 4];
        assert_eq!(server.read_nonblocking(&mut from_client).unwrap(), 2);
        assert_eq!(&from_client[..2], &[1, 2]);

        let mut from_server = [0u16; 4];
        assert_eq!(client.read_nonblocking(&mut from_server).unwrap(), 1);
        assert_eq!(from_server[0], 9);
    }

    #[test]
    fn write_nonblocking_caps_at_depth() {
        let (client, _server) = Fifo::pair(2).unwrap();
        assert_eq!(client.write_nonblocking(&[1, 2, 3]).unwrap(), 2);
    }

    #[test]
    fn read_nonblocking_on_empty_returns_zero() {
        let (_client, server) = Fifo::pair(2).unwrap();
        let mut out = [0u16; 2];
        assert_eq!(server.read_nonblocking(&mut out).unwrap(), 0);
    }

    #[test]
    fn close_wakes_blocked_reader() {
        let (client, server) = Fifo::pair(2).unwrap();
        let handle = std::thread::spawn(move || {
            let mut out = [0u16; 2];
            server.read_blocking(&mut out)
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        client.close();
        assert_eq!(handle.join().unwrap().unwrap_err(), Status::Canceled);
    }

    #[test]
    fn blocking_read_observes_later_write() {
        let (client, server) = Fifo::pair(2).unwrap();
        let handle = std::thread::spawn(move || {
            let mut out = [0u16; 2];
            let n = server.read_blocking(&mut out).unwrap();
            (n, out)
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        client.write_nonblocking(&[7]).unwrap();
        let (n, out) = handle.join().unwrap();
        assert_eq!(n, 1);
        assert_eq!(out[0], 7);
    }
}
